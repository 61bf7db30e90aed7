use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS entries (
    uid BLOB PRIMARY KEY CHECK (length(uid) = 16),
    language_file_uid BLOB NOT NULL CHECK (length(language_file_uid) = 16),
    key TEXT NOT NULL,
    src_text TEXT NOT NULL,
    dst_text TEXT NOT NULL,
    status TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    qa_flags BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entries_file ON entries (language_file_uid, key);

CREATE TABLE IF NOT EXISTS entry_bases (
    uid BLOB PRIMARY KEY CHECK (length(uid) = 16),
    language_file_uid BLOB NOT NULL CHECK (length(language_file_uid) = 16),
    key TEXT NOT NULL,
    src_text TEXT NOT NULL,
    dst_text TEXT NOT NULL,
    status TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    qa_flags BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entry_bases_file ON entry_bases (language_file_uid, key);

CREATE TABLE IF NOT EXISTS patch_sets (
    id BLOB PRIMARY KEY CHECK (length(id) = 16),
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    version INTEGER NOT NULL,
    manifest TEXT NOT NULL,
    saved_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('now','subsec') * 1000 AS INTEGER))
);

CREATE TABLE IF NOT EXISTS apply_results (
    rowid INTEGER PRIMARY KEY,
    plan_id BLOB NOT NULL CHECK (length(plan_id) = 16),
    target_path TEXT NOT NULL,
    success INTEGER NOT NULL,
    payload BLOB NOT NULL,
    recorded_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('now','subsec') * 1000 AS INTEGER))
);
CREATE INDEX IF NOT EXISTS idx_apply_results_plan ON apply_results (plan_id);
CREATE INDEX IF NOT EXISTS idx_apply_results_target ON apply_results (target_path);

CREATE TABLE IF NOT EXISTS backups (
    id BLOB PRIMARY KEY CHECK (length(id) = 16),
    original_path TEXT NOT NULL,
    backup_path TEXT NOT NULL,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL,
    payload BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_backups_original ON backups (original_path);
";
