//! v001 -- Initial schema creation.
//!
//! Creates the authorization tables (`users`, `groups`, `group_members`,
//! `permission_grants`) and the domain tables the bridge synchronizes.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users and groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    username     TEXT NOT NULL UNIQUE,
    is_staff     INTEGER NOT NULL DEFAULT 0,   -- boolean 0/1
    is_superuser INTEGER NOT NULL DEFAULT 0,   -- boolean 0/1
    is_active    INTEGER NOT NULL DEFAULT 1    -- boolean 0/1
);

CREATE TABLE IF NOT EXISTS groups (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS group_members (
    group_id INTEGER NOT NULL,
    user_id  INTEGER NOT NULL,

    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id);

-- ----------------------------------------------------------------
-- Permission grants (subject = user | group, resource = ambulance | hospital)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS permission_grants (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_kind  TEXT NOT NULL,              -- 'user' | 'group'
    subject_id    INTEGER NOT NULL,
    resource_kind TEXT NOT NULL,              -- 'ambulance' | 'hospital'
    resource_id   INTEGER NOT NULL,
    can_read      INTEGER NOT NULL DEFAULT 1,
    can_write     INTEGER NOT NULL DEFAULT 0,

    UNIQUE (subject_kind, subject_id, resource_kind, resource_id)
);

-- ----------------------------------------------------------------
-- Equipment
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS equipment_holders (
    id INTEGER PRIMARY KEY AUTOINCREMENT
);

CREATE TABLE IF NOT EXISTS equipment (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL UNIQUE,
    kind          TEXT NOT NULL,              -- 'B' | 'I' | 'S'
    default_value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS equipment_items (
    holder_id    INTEGER NOT NULL,
    equipment_id INTEGER NOT NULL,
    value        TEXT NOT NULL,
    comment      TEXT,
    updated_by   INTEGER,
    updated_on   TEXT NOT NULL,               -- RFC-3339

    PRIMARY KEY (holder_id, equipment_id),
    FOREIGN KEY (holder_id) REFERENCES equipment_holders(id) ON DELETE CASCADE,
    FOREIGN KEY (equipment_id) REFERENCES equipment(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Ambulances (live row + immutable history)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS ambulances (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    identifier         TEXT NOT NULL UNIQUE,
    capability         TEXT NOT NULL,
    status             TEXT NOT NULL DEFAULT 'UK',
    orientation        REAL,
    latitude           REAL,
    longitude          REAL,
    timestamp          TEXT,
    comment            TEXT,
    equipmentholder_id INTEGER UNIQUE,
    updated_by         INTEGER,
    updated_on         TEXT NOT NULL,

    FOREIGN KEY (equipmentholder_id) REFERENCES equipment_holders(id)
);

CREATE TABLE IF NOT EXISTS ambulance_updates (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    ambulance_id INTEGER NOT NULL,
    status       TEXT NOT NULL,
    orientation  REAL,
    latitude     REAL,
    longitude    REAL,
    timestamp    TEXT,
    comment      TEXT,
    updated_by   INTEGER,
    updated_on   TEXT NOT NULL,

    FOREIGN KEY (ambulance_id) REFERENCES ambulances(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_ambulance_updates_ambulance
    ON ambulance_updates(ambulance_id, id);

-- ----------------------------------------------------------------
-- Hospitals
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS hospitals (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    name               TEXT NOT NULL,
    address            TEXT,
    comment            TEXT,
    latitude           REAL,
    longitude          REAL,
    equipmentholder_id INTEGER UNIQUE,
    updated_by         INTEGER,
    updated_on         TEXT NOT NULL,

    FOREIGN KEY (equipmentholder_id) REFERENCES equipment_holders(id)
);

-- ----------------------------------------------------------------
-- Calls, ambulance assignments and waypoints
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS calls (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    status     TEXT NOT NULL DEFAULT 'P',
    details    TEXT NOT NULL DEFAULT '',
    priority   TEXT NOT NULL DEFAULT 'O',
    created_at TEXT NOT NULL,
    updated_on TEXT NOT NULL,
    ended_at   TEXT
);

CREATE TABLE IF NOT EXISTS ambulance_calls (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    call_id      INTEGER NOT NULL,
    ambulance_id INTEGER NOT NULL,
    status       TEXT NOT NULL DEFAULT 'R',
    updated_on   TEXT NOT NULL,

    UNIQUE (call_id, ambulance_id),
    FOREIGN KEY (call_id) REFERENCES calls(id) ON DELETE CASCADE,
    FOREIGN KEY (ambulance_id) REFERENCES ambulances(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_ambulance_calls_ambulance ON ambulance_calls(ambulance_id);

CREATE TABLE IF NOT EXISTS waypoints (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    ambulance_call_id INTEGER NOT NULL,
    order_index       INTEGER NOT NULL,
    status            TEXT NOT NULL DEFAULT 'C',
    location_type     TEXT NOT NULL,
    name              TEXT,
    latitude          REAL NOT NULL,
    longitude         REAL NOT NULL,
    updated_by        INTEGER,
    updated_on        TEXT NOT NULL,

    FOREIGN KEY (ambulance_call_id) REFERENCES ambulance_calls(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_waypoints_ambulance_call ON waypoints(ambulance_call_id, order_index);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
