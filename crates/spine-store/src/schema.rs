use rusqlite::Connection;
use spine_core::HASH_DOMAIN;

use crate::error::{Result, StoreError};

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "synchronous", "FULL")?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ledger_entries (
            sequence      INTEGER PRIMARY KEY,
            timestamp     INTEGER NOT NULL,
            content       TEXT NOT NULL,
            author_rights TEXT NOT NULL,
            previous_hash TEXT NOT NULL,
            entry_hash    TEXT NOT NULL UNIQUE,
            signature     TEXT
        );

        CREATE TRIGGER IF NOT EXISTS ledger_entries_no_update
        BEFORE UPDATE ON ledger_entries
        BEGIN
            SELECT RAISE(ABORT, 'ledger entries are append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS ledger_entries_no_delete
        BEFORE DELETE ON ledger_entries
        BEGIN
            SELECT RAISE(ABORT, 'ledger entries are append-only');
        END;
        ",
    )?;

    match get_schema_version(conn)? {
        None => {
            conn.execute(
                "INSERT OR IGNORE INTO metadata (key, value) VALUES ('schema_version', ?1)",
                [SCHEMA_VERSION.to_string()],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO metadata (key, value) VALUES ('encoding', ?1)",
                [HASH_DOMAIN],
            )?;
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) => {
            return Err(StoreError::InvalidData(format!(
                "ledger schema version {v} is not supported (expected {SCHEMA_VERSION})"
            )));
        }
    }

    let encoding: Option<String> = conn
        .query_row("SELECT value FROM metadata WHERE key = 'encoding'", [], |row| {
            row.get(0)
        })
        .ok();
    if encoding.as_deref() != Some(HASH_DOMAIN) {
        return Err(StoreError::InvalidData(format!(
            "ledger encoding {encoding:?} is not {HASH_DOMAIN}"
        )));
    }

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}
