//! # ambulink-store
//!
//! Relational store of the Ambulink bridge, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for every domain
//! model. Multi-step mutations go through [`Database::transaction`].

pub mod ambulances;
pub mod calls;
pub mod clients;
pub mod database;
pub mod equipment;
pub mod hospitals;
pub mod migrations;
pub mod models;
pub mod users;

mod error;
mod sql;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
