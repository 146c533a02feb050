//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: Session registry, watermarks, conflicts, links
    r#"
    -- ============================================
    -- Session registry
    -- ============================================

    CREATE TABLE IF NOT EXISTS sessions (
        id               TEXT PRIMARY KEY,
        name             TEXT NOT NULL UNIQUE,
        kind             TEXT NOT NULL,
        left_endpoint    TEXT NOT NULL,
        right_endpoint   TEXT NOT NULL,
        created_at       DATETIME NOT NULL
    );

    -- One row per (session, direction): run state and change cursor
    CREATE TABLE IF NOT EXISTS session_runs (
        session_id       TEXT NOT NULL REFERENCES sessions(id),
        direction        TEXT NOT NULL,
        state            TEXT NOT NULL,
        fault            TEXT,
        cursor           INTEGER NOT NULL DEFAULT 0,
        updated_at       DATETIME NOT NULL,
        PRIMARY KEY (session_id, direction)
    );

    -- ============================================
    -- Watermarks
    -- ============================================

    CREATE TABLE IF NOT EXISTS watermarks (
        session_id       TEXT NOT NULL REFERENCES sessions(id),
        direction        TEXT NOT NULL,
        item_id          TEXT NOT NULL,
        revision         INTEGER NOT NULL,
        updated_at       DATETIME NOT NULL,
        PRIMARY KEY (session_id, direction, item_id)
    );

    -- ============================================
    -- Conflicts
    -- ============================================

    CREATE TABLE IF NOT EXISTS conflicts (
        id               TEXT PRIMARY KEY,
        session_id       TEXT NOT NULL REFERENCES sessions(id),
        direction        TEXT NOT NULL,
        change_group     TEXT NOT NULL,
        fingerprint      TEXT NOT NULL,
        conflict_type    TEXT NOT NULL,
        scope            TEXT NOT NULL,
        details          TEXT NOT NULL,
        action           JSON NOT NULL,
        status           TEXT NOT NULL,
        rule_id          TEXT,
        disposition      JSON,
        retry_count      INTEGER NOT NULL DEFAULT 0,
        created_at       DATETIME NOT NULL,
        updated_at       DATETIME NOT NULL,
        UNIQUE (session_id, direction, change_group, fingerprint)
    );

    CREATE INDEX IF NOT EXISTS idx_conflicts_status ON conflicts(session_id, status);

    -- ============================================
    -- Migration history
    -- ============================================

    CREATE TABLE IF NOT EXISTS artifact_links (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id       TEXT NOT NULL REFERENCES sessions(id),
        source_endpoint  TEXT NOT NULL,
        source_item      TEXT NOT NULL,
        source_revision  INTEGER NOT NULL,
        target_endpoint  TEXT NOT NULL,
        target_item      TEXT NOT NULL,
        target_revision  INTEGER NOT NULL,
        uri              TEXT NOT NULL,
        artifact_type    TEXT NOT NULL,
        created_at       DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_links_source ON artifact_links(source_endpoint, source_item);
    CREATE INDEX IF NOT EXISTS idx_links_target ON artifact_links(target_endpoint, target_item);

    CREATE TABLE IF NOT EXISTS applied_actions (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id       TEXT NOT NULL REFERENCES sessions(id),
        direction        TEXT NOT NULL,
        change_group     TEXT NOT NULL,
        item_id          TEXT NOT NULL,
        source_revision  INTEGER NOT NULL,
        kind             TEXT NOT NULL,
        fingerprint      TEXT NOT NULL,
        outcome          TEXT NOT NULL,
        target_item_id   TEXT,
        target_revision  INTEGER,
        recorded_at      DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_applied_group ON applied_actions(session_id, direction, change_group);
    "#,
    // Version 2: Diff job reports
    r#"
    CREATE TABLE IF NOT EXISTS diff_reports (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        job_name         TEXT NOT NULL,
        left_scope       TEXT NOT NULL,
        right_scope      TEXT NOT NULL,
        window_start     DATETIME NOT NULL,
        window_end       DATETIME NOT NULL,
        left_count       INTEGER NOT NULL,
        left_earliest    DATETIME,
        right_count      INTEGER NOT NULL,
        right_earliest   DATETIME,
        matched          INTEGER NOT NULL,
        attempts         INTEGER NOT NULL,
        created_at       DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_diff_reports_job ON diff_reports(job_name, created_at);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables = [
            "sessions",
            "session_runs",
            "watermarks",
            "conflicts",
            "artifact_links",
            "applied_actions",
            "diff_reports",
        ];

        for table in tables {
            let count: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "Table {} should exist", table);
        }
    }
}
