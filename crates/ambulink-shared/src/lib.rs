//! # ambulink-shared
//!
//! Types shared by every Ambulink crate: domain enums, wire payloads, the
//! outbound topic grammar and a couple of geodesic helpers.

pub mod constants;
pub mod error;
pub mod geo;
pub mod protocol;
pub mod topics;
pub mod types;

pub use error::ParseError;
pub use types::*;
