//! Database schema initialization

use rusqlite::{params, Connection};

use crate::core::error::Result;
use crate::core::identity::Kind;

/// Current schema version; stores with a different version are rejected
pub const SCHEMA_VERSION: i32 = 1;

/// Every entity table shares this column layout
fn entity_table_sql(table: &str) -> String {
    format!(
        r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type_tag TEXT NOT NULL,
                hierarchy TEXT NOT NULL,
                baseline TEXT NOT NULL DEFAULT 'Working',
                parent_id INTEGER,
                system_id INTEGER,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                criticality TEXT NOT NULL DEFAULT 'Non-Critical',
                confidentiality INTEGER NOT NULL DEFAULT 0,
                confidentiality_rationale TEXT NOT NULL DEFAULT '',
                integrity INTEGER NOT NULL DEFAULT 0,
                integrity_rationale TEXT NOT NULL DEFAULT '',
                availability INTEGER NOT NULL DEFAULT 0,
                availability_rationale TEXT NOT NULL DEFAULT '',
                authenticity INTEGER NOT NULL DEFAULT 0,
                authenticity_rationale TEXT NOT NULL DEFAULT '',
                props TEXT NOT NULL DEFAULT '{{}}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (hierarchy, baseline)
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_baseline ON {table}(baseline);
            CREATE INDEX IF NOT EXISTS idx_{table}_parent ON {table}(parent_id);
            CREATE INDEX IF NOT EXISTS idx_{table}_system ON {table}(system_id);
        "#
    )
}

/// Initialize the schema on a fresh or existing store
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            -- Append-only, per-table hash-chained mutation log
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                operation TEXT NOT NULL CHECK (operation IN ('Insert', 'Update', 'Delete')),
                table_name TEXT NOT NULL,
                row_id INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                prev_hash TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_table ON audit_log(table_name, id);

            -- Monotonic sequence allocation per sibling group.
            -- Numbers are never reused after deletion within a generation.
            CREATE TABLE IF NOT EXISTS id_counters (
                type_tag TEXT NOT NULL,
                parent_path TEXT NOT NULL,
                next_seq INTEGER NOT NULL,
                PRIMARY KEY (type_tag, parent_path)
            );

            -- Many-to-many requirement traceability
            CREATE TABLE IF NOT EXISTS requirement_trace (
                child_id INTEGER NOT NULL,
                parent_id INTEGER NOT NULL,
                baseline TEXT NOT NULL DEFAULT 'Working',
                PRIMARY KEY (child_id, parent_id, baseline)
            );
            CREATE INDEX IF NOT EXISTS idx_trace_child ON requirement_trace(child_id);
            CREATE INDEX IF NOT EXISTS idx_trace_parent ON requirement_trace(parent_id);

            -- Snapshot bookkeeping
            CREATE TABLE IF NOT EXISTS baseline_metadata (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                label TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                row_count INTEGER NOT NULL DEFAULT 0
            );

            -- Applied merge history
            CREATE TABLE IF NOT EXISTS merge_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                merge_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                resolutions TEXT NOT NULL,
                applied_count INTEGER NOT NULL DEFAULT 0,
                rejected_count INTEGER NOT NULL DEFAULT 0
            );
        "#,
    )?;

    for kind in Kind::all() {
        conn.execute_batch(&entity_table_sql(kind.table()))?;
    }

    conn.execute(
        "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
        params![SCHEMA_VERSION],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_initializes_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        for kind in Kind::all() {
            let count: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM {}", kind.table()),
                    [],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 0);
        }

        let version: i32 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_schema_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }
}
