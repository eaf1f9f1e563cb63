//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS metrics (
            id TEXT PRIMARY KEY,
            service TEXT NOT NULL,
            trace_id TEXT,
            method TEXT,
            path TEXT,
            timestamp TEXT NOT NULL,
            response_time_ms REAL NOT NULL,
            status_code INTEGER NOT NULL,
            request_count INTEGER NOT NULL DEFAULT 1,
            error_count INTEGER NOT NULL DEFAULT 0,
            response_size_bytes INTEGER,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS models (
            service TEXT PRIMARY KEY,
            version TEXT NOT NULL,
            trained_at TEXT NOT NULL,
            training_samples INTEGER NOT NULL,
            features_json TEXT NOT NULL,
            model_json TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_metrics_service_ts ON metrics(service, timestamp);
        CREATE INDEX IF NOT EXISTS idx_metrics_trace ON metrics(trace_id);
        CREATE INDEX IF NOT EXISTS idx_metrics_ts ON metrics(timestamp);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        // Verify tables exist by querying them
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM metrics", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM models", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }
}
