//! Calls, ambulance assignments and waypoints.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use ambulink_shared::{AmbulanceCallStatus, CallStatus, Location, LocationType, WaypointStatus};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{AmbulanceCall, Call, Waypoint};
use crate::sql::{get_enum, get_location, get_opt_ts, get_ts, opt_ts, ts};

const CALL_COLUMNS: &str = "id, status, details, priority, created_at, updated_on, ended_at";
const AMBULANCE_CALL_COLUMNS: &str = "id, call_id, ambulance_id, status, updated_on";
const WAYPOINT_COLUMNS: &str = "id, ambulance_call_id, order_index, status, location_type, name, \
     latitude, longitude, updated_by, updated_on";

impl Database {
    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    pub fn create_call(&self, details: &str, priority: &str) -> Result<Call> {
        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO calls (status, details, priority, created_at, updated_on)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![CallStatus::Pending.as_str(), details, priority, ts(&now)],
        )?;
        Ok(Call {
            id: self.conn().last_insert_rowid(),
            status: CallStatus::Pending,
            details: details.to_string(),
            priority: priority.to_string(),
            created_at: now,
            updated_on: now,
            ended_at: None,
        })
    }

    pub fn get_call(&self, id: i64) -> Result<Call> {
        self.conn()
            .query_row(
                &format!("SELECT {CALL_COLUMNS} FROM calls WHERE id = ?1"),
                params![id],
                row_to_call,
            )
            .map_err(StoreError::from_read)
    }

    pub fn save_call(&self, call: &Call) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE calls SET status = ?1, details = ?2, priority = ?3, updated_on = ?4,
                              ended_at = ?5
             WHERE id = ?6",
            params![
                call.status.as_str(),
                call.details,
                call.priority,
                ts(&call.updated_on),
                opt_ts(&call.ended_at),
                call.id,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ambulance assignments
    // ------------------------------------------------------------------

    pub fn add_ambulance_call(&self, call_id: i64, ambulance_id: i64) -> Result<AmbulanceCall> {
        let now = Utc::now();
        self.conn()
            .execute(
                "INSERT INTO ambulance_calls (call_id, ambulance_id, status, updated_on)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    call_id,
                    ambulance_id,
                    AmbulanceCallStatus::Requested.as_str(),
                    ts(&now)
                ],
            )
            .map_err(StoreError::from_write)?;
        Ok(AmbulanceCall {
            id: self.conn().last_insert_rowid(),
            call_id,
            ambulance_id,
            status: AmbulanceCallStatus::Requested,
            updated_on: now,
        })
    }

    /// The assignment of `ambulance_id` to `call_id`, if there is one.
    pub fn find_ambulance_call(
        &self,
        call_id: i64,
        ambulance_id: i64,
    ) -> Result<Option<AmbulanceCall>> {
        let found = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {AMBULANCE_CALL_COLUMNS} FROM ambulance_calls
                     WHERE call_id = ?1 AND ambulance_id = ?2"
                ),
                params![call_id, ambulance_id],
                row_to_ambulance_call,
            )
            .optional()?;
        Ok(found)
    }

    pub fn list_ambulance_calls(&self, call_id: i64) -> Result<Vec<AmbulanceCall>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {AMBULANCE_CALL_COLUMNS} FROM ambulance_calls
             WHERE call_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![call_id], row_to_ambulance_call)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Assignments of one ambulance in a given status, across all calls.
    pub fn list_ambulance_calls_with_status(
        &self,
        ambulance_id: i64,
        status: AmbulanceCallStatus,
    ) -> Result<Vec<AmbulanceCall>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {AMBULANCE_CALL_COLUMNS} FROM ambulance_calls
             WHERE ambulance_id = ?1 AND status = ?2 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![ambulance_id, status.as_str()], row_to_ambulance_call)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn save_ambulance_call(&self, ambulance_call: &AmbulanceCall) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE ambulance_calls SET status = ?1, updated_on = ?2 WHERE id = ?3",
            params![
                ambulance_call.status.as_str(),
                ts(&ambulance_call.updated_on),
                ambulance_call.id,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Waypoints
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn create_waypoint(
        &self,
        ambulance_call_id: i64,
        order: i64,
        status: WaypointStatus,
        location_type: LocationType,
        name: Option<&str>,
        location: Location,
        updated_by: Option<i64>,
    ) -> Result<Waypoint> {
        let now = Utc::now();
        self.conn()
            .execute(
                "INSERT INTO waypoints
                    (ambulance_call_id, order_index, status, location_type, name,
                     latitude, longitude, updated_by, updated_on)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    ambulance_call_id,
                    order,
                    status.as_str(),
                    location_type.as_str(),
                    name,
                    location.latitude,
                    location.longitude,
                    updated_by,
                    ts(&now),
                ],
            )
            .map_err(StoreError::from_write)?;
        Ok(Waypoint {
            id: self.conn().last_insert_rowid(),
            ambulance_call_id,
            order,
            status,
            location_type,
            name: name.map(str::to_string),
            location,
            updated_by,
            updated_on: now,
        })
    }

    pub fn get_waypoint(&self, id: i64) -> Result<Waypoint> {
        self.conn()
            .query_row(
                &format!("SELECT {WAYPOINT_COLUMNS} FROM waypoints WHERE id = ?1"),
                params![id],
                row_to_waypoint,
            )
            .map_err(StoreError::from_read)
    }

    pub fn list_waypoints(&self, ambulance_call_id: i64) -> Result<Vec<Waypoint>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {WAYPOINT_COLUMNS} FROM waypoints
             WHERE ambulance_call_id = ?1 ORDER BY order_index ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![ambulance_call_id], row_to_waypoint)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Order index one past the highest existing waypoint of an assignment.
    pub fn next_waypoint_order(&self, ambulance_call_id: i64) -> Result<i64> {
        let max: Option<i64> = self.conn().query_row(
            "SELECT MAX(order_index) FROM waypoints WHERE ambulance_call_id = ?1",
            params![ambulance_call_id],
            |row| row.get(0),
        )?;
        Ok(max.map_or(0, |m| m + 1))
    }

    pub fn save_waypoint(&self, waypoint: &Waypoint) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE waypoints
             SET order_index = ?1, status = ?2, location_type = ?3, name = ?4,
                 latitude = ?5, longitude = ?6, updated_by = ?7, updated_on = ?8
             WHERE id = ?9",
            params![
                waypoint.order,
                waypoint.status.as_str(),
                waypoint.location_type.as_str(),
                waypoint.name,
                waypoint.location.latitude,
                waypoint.location.longitude,
                waypoint.updated_by,
                ts(&waypoint.updated_on),
                waypoint.id,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

fn row_to_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<Call> {
    Ok(Call {
        id: row.get(0)?,
        status: get_enum(row, 1)?,
        details: row.get(2)?,
        priority: row.get(3)?,
        created_at: get_ts(row, 4)?,
        updated_on: get_ts(row, 5)?,
        ended_at: get_opt_ts(row, 6)?,
    })
}

fn row_to_ambulance_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<AmbulanceCall> {
    Ok(AmbulanceCall {
        id: row.get(0)?,
        call_id: row.get(1)?,
        ambulance_id: row.get(2)?,
        status: get_enum(row, 3)?,
        updated_on: get_ts(row, 4)?,
    })
}

fn row_to_waypoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<Waypoint> {
    let location = get_location(row, 6)?.unwrap_or(Location::new(0.0, 0.0));
    Ok(Waypoint {
        id: row.get(0)?,
        ambulance_call_id: row.get(1)?,
        order: row.get(2)?,
        status: get_enum(row, 3)?,
        location_type: get_enum(row, 4)?,
        name: row.get(5)?,
        location,
        updated_by: row.get(8)?,
        updated_on: get_ts(row, 9)?,
    })
}
