//! v002 -- Device sessions and their audit log.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS clients (
    client_id    TEXT PRIMARY KEY NOT NULL,   -- broker-assigned, <= 254 bytes
    user_id      INTEGER NOT NULL,
    status       TEXT NOT NULL,               -- online | offline | disconnected | reconnected
    ambulance_id INTEGER UNIQUE,              -- at most one session per ambulance
    hospital_id  INTEGER UNIQUE,              -- at most one session per hospital
    updated_on   TEXT NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (ambulance_id) REFERENCES ambulances(id) ON DELETE SET NULL,
    FOREIGN KEY (hospital_id) REFERENCES hospitals(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_clients_status ON clients(status);

-- Append-only: rows are never updated or deleted.
CREATE TABLE IF NOT EXISTS client_logs (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id    TEXT NOT NULL,
    user_id      INTEGER NOT NULL,
    status       TEXT NOT NULL,
    activity     TEXT NOT NULL,               -- HS | AI | AO | HI | HO
    details      TEXT NOT NULL DEFAULT '',
    ambulance_id INTEGER,
    hospital_id  INTEGER,
    updated_on   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_client_logs_client ON client_logs(client_id, id DESC);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
