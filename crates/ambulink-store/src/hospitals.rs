use chrono::Utc;
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Hospital;
use crate::sql::{get_location, get_ts, ts};

const HOSPITAL_COLUMNS: &str =
    "id, name, address, comment, latitude, longitude, equipmentholder_id, updated_by, updated_on";

impl Database {
    pub fn create_hospital(&self, name: &str) -> Result<Hospital> {
        let holder_id = self.create_equipment_holder()?;
        let now = Utc::now();

        self.conn()
            .execute(
                "INSERT INTO hospitals (name, equipmentholder_id, updated_on) VALUES (?1, ?2, ?3)",
                params![name, holder_id, ts(&now)],
            )
            .map_err(StoreError::from_write)?;

        Ok(Hospital {
            id: self.conn().last_insert_rowid(),
            name: name.to_string(),
            address: None,
            comment: None,
            location: None,
            equipmentholder_id: Some(holder_id),
            updated_by: None,
            updated_on: now,
        })
    }

    pub fn get_hospital(&self, id: i64) -> Result<Hospital> {
        self.conn()
            .query_row(
                &format!("SELECT {HOSPITAL_COLUMNS} FROM hospitals WHERE id = ?1"),
                params![id],
                row_to_hospital,
            )
            .map_err(StoreError::from_read)
    }

    pub fn list_hospitals(&self) -> Result<Vec<Hospital>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT {HOSPITAL_COLUMNS} FROM hospitals ORDER BY id ASC"))?;
        let rows = stmt.query_map([], row_to_hospital)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn save_hospital(&self, hospital: &Hospital) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE hospitals
             SET name = ?1, address = ?2, comment = ?3, latitude = ?4, longitude = ?5,
                 updated_by = ?6, updated_on = ?7
             WHERE id = ?8",
            params![
                hospital.name,
                hospital.address,
                hospital.comment,
                hospital.location.map(|l| l.latitude),
                hospital.location.map(|l| l.longitude),
                hospital.updated_by,
                ts(&hospital.updated_on),
                hospital.id,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

fn row_to_hospital(row: &rusqlite::Row<'_>) -> rusqlite::Result<Hospital> {
    Ok(Hospital {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        comment: row.get(3)?,
        location: get_location(row, 4)?,
        equipmentholder_id: row.get(6)?,
        updated_by: row.get(7)?,
        updated_on: get_ts(row, 8)?,
    })
}
