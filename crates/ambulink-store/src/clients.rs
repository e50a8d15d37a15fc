//! Device sessions (`clients`) and their append-only audit log.

use rusqlite::{params, OptionalExtension};

use ambulink_shared::{ClientActivity, ClientStatus};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Client, ClientLog};
use crate::sql::{get_enum, get_ts, ts};

const CLIENT_COLUMNS: &str = "client_id, user_id, status, ambulance_id, hospital_id, updated_on";

impl Database {
    pub fn find_client(&self, client_id: &str) -> Result<Option<Client>> {
        let client = self
            .conn()
            .query_row(
                &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE client_id = ?1"),
                params![client_id],
                row_to_client,
            )
            .optional()?;
        Ok(client)
    }

    /// The session currently attached to an ambulance, if any.
    pub fn find_client_by_ambulance(&self, ambulance_id: i64) -> Result<Option<Client>> {
        let client = self
            .conn()
            .query_row(
                &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE ambulance_id = ?1"),
                params![ambulance_id],
                row_to_client,
            )
            .optional()?;
        Ok(client)
    }

    pub fn list_clients_with_status(&self, statuses: &[ClientStatus]) -> Result<Vec<Client>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CLIENT_COLUMNS} FROM clients WHERE status = ?1 ORDER BY client_id ASC"
        ))?;
        let mut clients = Vec::new();
        for status in statuses {
            let rows = stmt.query_map(params![status.as_str()], row_to_client)?;
            for row in rows {
                clients.push(row?);
            }
        }
        Ok(clients)
    }

    /// Insert a new session or overwrite an existing one.
    ///
    /// An ambulance or hospital already attached to another session makes
    /// this fail with [`StoreError::Conflict`].
    pub fn save_client(&self, client: &Client) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO clients (client_id, user_id, status, ambulance_id, hospital_id, updated_on)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (client_id) DO UPDATE SET
                    user_id = excluded.user_id,
                    status = excluded.status,
                    ambulance_id = excluded.ambulance_id,
                    hospital_id = excluded.hospital_id,
                    updated_on = excluded.updated_on",
                params![
                    client.client_id,
                    client.user_id,
                    client.status.as_str(),
                    client.ambulance_id,
                    client.hospital_id,
                    ts(&client.updated_on),
                ],
            )
            .map_err(StoreError::from_write)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Audit log
    // ------------------------------------------------------------------

    /// Append an event for `client` as it stands after the transition.
    pub fn insert_client_log(
        &self,
        client: &Client,
        activity: ClientActivity,
        details: &str,
        ambulance_id: Option<i64>,
        hospital_id: Option<i64>,
    ) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO client_logs
                (client_id, user_id, status, activity, details, ambulance_id, hospital_id, updated_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                client.client_id,
                client.user_id,
                client.status.as_str(),
                activity.as_str(),
                details,
                ambulance_id,
                hospital_id,
                ts(&client.updated_on),
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn list_client_logs(&self, client_id: &str) -> Result<Vec<ClientLog>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, client_id, user_id, status, activity, details, ambulance_id,
                    hospital_id, updated_on
             FROM client_logs WHERE client_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![client_id], |row| {
            Ok(ClientLog {
                id: row.get(0)?,
                client_id: row.get(1)?,
                user_id: row.get(2)?,
                status: get_enum(row, 3)?,
                activity: get_enum(row, 4)?,
                details: row.get(5)?,
                ambulance_id: row.get(6)?,
                hospital_id: row.get(7)?,
                updated_on: get_ts(row, 8)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Ambulance released by the most recent logout event of a session.
    pub fn last_ambulance_logout(&self, client_id: &str) -> Result<Option<i64>> {
        let ambulance: Option<Option<i64>> = self
            .conn()
            .query_row(
                "SELECT ambulance_id FROM client_logs
                 WHERE client_id = ?1 AND activity = ?2
                 ORDER BY id DESC LIMIT 1",
                params![client_id, ClientActivity::AmbulanceLogout.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ambulance.flatten())
    }
}

fn row_to_client(row: &rusqlite::Row<'_>) -> rusqlite::Result<Client> {
    Ok(Client {
        client_id: row.get(0)?,
        user_id: row.get(1)?,
        status: get_enum(row, 2)?,
        ambulance_id: row.get(3)?,
        hospital_id: row.get(4)?,
        updated_on: get_ts(row, 5)?,
    })
}
