//! CRUD operations for [`Ambulance`] records and their update history.

use chrono::Utc;
use rusqlite::params;

use ambulink_shared::{AmbulanceCapability, AmbulanceStatus};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Ambulance, AmbulanceUpdate};
use crate::sql::{get_enum, get_location, get_opt_ts, get_ts, opt_ts, ts};

const AMBULANCE_COLUMNS: &str = "id, identifier, capability, status, orientation, latitude, \
     longitude, timestamp, comment, equipmentholder_id, updated_by, updated_on";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new ambulance together with its equipment holder.
    pub fn create_ambulance(
        &self,
        identifier: &str,
        capability: AmbulanceCapability,
    ) -> Result<Ambulance> {
        let holder_id = self.create_equipment_holder()?;
        let now = Utc::now();

        self.conn()
            .execute(
                "INSERT INTO ambulances (identifier, capability, status, equipmentholder_id, updated_on)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    identifier,
                    capability.as_str(),
                    AmbulanceStatus::Unknown.as_str(),
                    holder_id,
                    ts(&now),
                ],
            )
            .map_err(StoreError::from_write)?;

        Ok(Ambulance {
            id: self.conn().last_insert_rowid(),
            identifier: identifier.to_string(),
            capability,
            status: AmbulanceStatus::Unknown,
            orientation: None,
            location: None,
            timestamp: None,
            comment: None,
            equipmentholder_id: Some(holder_id),
            updated_by: None,
            updated_on: now,
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_ambulance(&self, id: i64) -> Result<Ambulance> {
        self.conn()
            .query_row(
                &format!("SELECT {AMBULANCE_COLUMNS} FROM ambulances WHERE id = ?1"),
                params![id],
                row_to_ambulance,
            )
            .map_err(StoreError::from_read)
    }

    pub fn list_ambulances(&self) -> Result<Vec<Ambulance>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT {AMBULANCE_COLUMNS} FROM ambulances ORDER BY id ASC"))?;
        let rows = stmt.query_map([], row_to_ambulance)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// History rows of an ambulance, oldest first.
    pub fn list_ambulance_updates(&self, ambulance_id: i64) -> Result<Vec<AmbulanceUpdate>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, ambulance_id, status, orientation, latitude, longitude, timestamp,
                    comment, updated_by, updated_on
             FROM ambulance_updates
             WHERE ambulance_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![ambulance_id], |row| {
            Ok(AmbulanceUpdate {
                id: row.get(0)?,
                ambulance_id: row.get(1)?,
                status: get_enum(row, 2)?,
                orientation: row.get(3)?,
                location: get_location(row, 4)?,
                timestamp: get_opt_ts(row, 6)?,
                comment: row.get(7)?,
                updated_by: row.get(8)?,
                updated_on: get_ts(row, 9)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Overwrite the mutable columns of the live ambulance row.
    pub fn save_ambulance(&self, ambulance: &Ambulance) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE ambulances
             SET status = ?1, orientation = ?2, latitude = ?3, longitude = ?4,
                 timestamp = ?5, comment = ?6, updated_by = ?7, updated_on = ?8
             WHERE id = ?9",
            params![
                ambulance.status.as_str(),
                ambulance.orientation,
                ambulance.location.map(|l| l.latitude),
                ambulance.location.map(|l| l.longitude),
                opt_ts(&ambulance.timestamp),
                ambulance.comment,
                ambulance.updated_by,
                ts(&ambulance.updated_on),
                ambulance.id,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Append an immutable snapshot of `ambulance` to its history.
    pub fn insert_ambulance_update(&self, ambulance: &Ambulance) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO ambulance_updates
                (ambulance_id, status, orientation, latitude, longitude, timestamp,
                 comment, updated_by, updated_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                ambulance.id,
                ambulance.status.as_str(),
                ambulance.orientation,
                ambulance.location.map(|l| l.latitude),
                ambulance.location.map(|l| l.longitude),
                opt_ts(&ambulance.timestamp),
                ambulance.comment,
                ambulance.updated_by,
                ts(&ambulance.updated_on),
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }
}

fn row_to_ambulance(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ambulance> {
    Ok(Ambulance {
        id: row.get(0)?,
        identifier: row.get(1)?,
        capability: get_enum(row, 2)?,
        status: get_enum(row, 3)?,
        orientation: row.get(4)?,
        location: get_location(row, 5)?,
        timestamp: get_opt_ts(row, 7)?,
        comment: row.get(8)?,
        equipmentholder_id: row.get(9)?,
        updated_by: row.get(10)?,
        updated_on: get_ts(row, 11)?,
    })
}
