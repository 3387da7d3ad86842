// SQLite plumbing shared by both tiers.

use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{ffi::sqlite3_auto_extension, params, Connection, Row};
use sqlite_vec::sqlite3_vec_init;

use codeloom_types::CacheEntry;

use crate::error::CacheResult;

static REGISTER_VEC: Once = Once::new();

/// Opens (or creates) a cache database with sqlite-vec loaded and WAL enabled.
pub(crate) fn open_connection(db_path: &Path) -> CacheResult<Connection> {
    REGISTER_VEC.call_once(|| unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute::<
            *const (),
            unsafe extern "C" fn(
                *mut rusqlite::ffi::sqlite3,
                *mut *mut i8,
                *const rusqlite::ffi::sqlite3_api_routines,
            ) -> i32,
        >(sqlite3_vec_init as *const ())));
    });

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(10))?;
    // PRAGMA journal_mode returns a row
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.execute("PRAGMA synchronous = NORMAL", [])?;
    Ok(conn)
}

/// Column list shared by every entry table, in `row_to_entry` order.
pub(crate) const ENTRY_COLUMNS: &str = "id, fingerprint, task, description, schema_json, config_json, code, \
     libraries_json, generation_tokens, reuse_count, cost_saved, created_at, updated_at";

pub(crate) fn create_entry_table(conn: &Connection, table: &str) -> CacheResult<()> {
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                fingerprint TEXT NOT NULL,
                task TEXT NOT NULL,
                description TEXT NOT NULL,
                schema_json TEXT NOT NULL,
                config_json TEXT NOT NULL,
                code TEXT NOT NULL,
                libraries_json TEXT NOT NULL DEFAULT '[]',
                generation_tokens INTEGER NOT NULL DEFAULT 0,
                reuse_count INTEGER NOT NULL DEFAULT 0,
                cost_saved INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS idx_{table}_fingerprint ON {table}(fingerprint)"),
        [],
    )?;
    Ok(())
}

/// Inserts `entry`, replacing any row with the same id.
pub(crate) fn upsert_entry(conn: &Connection, table: &str, entry: &CacheEntry) -> CacheResult<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {table} ({ENTRY_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![
            entry.id,
            entry.fingerprint,
            entry.task,
            entry.description,
            serde_json::to_string(&entry.schema)?,
            serde_json::to_string(&entry.config)?,
            entry.code,
            serde_json::to_string(&entry.libraries)?,
            entry.generation_tokens as i64,
            entry.reuse_count as i64,
            entry.cost_saved as i64,
            entry.created_at.to_rfc3339(),
            entry.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Bumps the reuse counter and credits the entry's generation cost. Returns false for unknown ids.
pub(crate) fn bump_reuse(conn: &Connection, table: &str, id: &str) -> CacheResult<bool> {
    let changed = conn.execute(
        &format!(
            "UPDATE {table}
             SET reuse_count = reuse_count + 1,
                 cost_saved = cost_saved + generation_tokens,
                 updated_at = ?2
             WHERE id = ?1"
        ),
        params![id, Utc::now().to_rfc3339()],
    )?;
    Ok(changed > 0)
}

pub(crate) fn entry_stats(conn: &Connection, table: &str) -> CacheResult<codeloom_types::CacheStats> {
    let (entries, total_reuses, cost_saved): (i64, i64, i64) = conn.query_row(
        &format!(
            "SELECT COUNT(*), COALESCE(SUM(reuse_count), 0), COALESCE(SUM(cost_saved), 0) FROM {table}"
        ),
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok(codeloom_types::CacheStats {
        entries: entries.max(0) as u64,
        total_reuses: total_reuses.max(0) as u64,
        cost_saved: cost_saved.max(0) as u64,
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

/// Maps a row selected with `ENTRY_COLUMNS` starting at `offset`.
pub(crate) fn row_to_entry(row: &Row<'_>, offset: usize) -> rusqlite::Result<CacheEntry> {
    let created_at: String = row.get(offset + 11)?;
    let updated_at: String = row.get(offset + 12)?;
    Ok(CacheEntry {
        id: row.get(offset)?,
        fingerprint: row.get(offset + 1)?,
        task: row.get(offset + 2)?,
        description: row.get(offset + 3)?,
        schema: json_column(row, offset + 4)?,
        config: json_column(row, offset + 5)?,
        code: row.get(offset + 6)?,
        libraries: json_column(row, offset + 7)?,
        generation_tokens: row.get::<_, i64>(offset + 8)?.max(0) as u64,
        reuse_count: row.get::<_, i64>(offset + 9)?.max(0) as u64,
        cost_saved: row.get::<_, i64>(offset + 10)?.max(0) as u64,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}
