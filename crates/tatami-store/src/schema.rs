//! Table definitions, applied on every open.

use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 2;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS members (
    id               TEXT PRIMARY KEY,
    first_name       TEXT NOT NULL,
    last_name        TEXT NOT NULL DEFAULT '',
    email            TEXT,
    phone            TEXT,
    belt_rank        TEXT NOT NULL DEFAULT 'white',
    stripes          INTEGER NOT NULL DEFAULT 0 CHECK (stripes BETWEEN 0 AND 4),
    status           TEXT NOT NULL DEFAULT 'trial',
    join_date        TEXT NOT NULL,
    last_check_in    TEXT,
    attendance_count INTEGER NOT NULL DEFAULT 0,
    profile_image    BLOB,
    face_embedding   TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS classes (
    id               TEXT PRIMARY KEY,
    name             TEXT NOT NULL,
    day_of_week      INTEGER NOT NULL CHECK (day_of_week BETWEEN 0 AND 6),
    start_time       TEXT NOT NULL,
    duration_minutes INTEGER NOT NULL DEFAULT 60,
    is_active        INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS attendance (
    id              TEXT PRIMARY KEY,
    member_id       TEXT NOT NULL REFERENCES members(id) ON DELETE CASCADE,
    class_id        TEXT REFERENCES classes(id) ON DELETE SET NULL,
    class_name      TEXT NOT NULL,
    check_in_time   TEXT NOT NULL,
    check_in_method TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS attendance_member_time ON attendance (member_id, check_in_time);
CREATE INDEX IF NOT EXISTS classes_day ON classes (day_of_week, start_time);
";

/// Version 1 databases predate belt ranks.
const ADD_BELT_RANK: &str = "
ALTER TABLE members ADD COLUMN belt_rank TEXT NOT NULL DEFAULT 'white';
ALTER TABLE members ADD COLUMN stripes INTEGER NOT NULL DEFAULT 0 CHECK (stripes BETWEEN 0 AND 4);
";

/// Enable foreign keys, create any missing tables and upgrade older databases.
pub fn apply(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version == 1 {
        tracing::info!(from = version, to = SCHEMA_VERSION, "upgrading database schema");
        conn.execute_batch(ADD_BELT_RANK)?;
    }
    conn.execute_batch(SCHEMA)?;
    conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
    Ok(())
}
