//! Database repository layer
//!
//! Provides query and insert operations for sessions, watermarks, conflicts,
//! artifact links, the applied-action history and diff reports.

use super::WatermarkStore;
use crate::conflict::{ConflictStatus, Disposition, MigrationConflict};
use crate::diff::DiffReport;
use crate::error::{Error, Result};
use crate::translation::ArtifactLink;
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use uuid::Uuid;

/// A configured session as stored in the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: Uuid,
    pub name: String,
    pub kind: SessionKind,
    pub left_endpoint: String,
    pub right_endpoint: String,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(name: &str, kind: SessionKind, left_endpoint: &str, right_endpoint: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind,
            left_endpoint: left_endpoint.to_string(),
            right_endpoint: right_endpoint.to_string(),
            created_at: Utc::now(),
        }
    }

    /// (source, target) endpoint names for a direction.
    pub fn endpoints(&self, direction: Direction) -> (&str, &str) {
        match direction {
            Direction::LeftToRight => (&self.left_endpoint, &self.right_endpoint),
            Direction::RightToLeft => (&self.right_endpoint, &self.left_endpoint),
        }
    }
}

/// Persisted run state of one direction of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub state: SessionState,
    pub fault: Option<String>,
    /// Highest source sequence fully processed
    pub cursor: u64,
    pub updated_at: DateTime<Utc>,
}

/// Everything committed for one action in a single transaction.
#[derive(Debug, Clone)]
pub struct ActionCommit {
    pub record: AppliedAction,
    pub link: Option<ArtifactLink>,
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_time(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(Error::InvalidValue(message)),
    )
}

/// Read a text column through `FromStr`.
fn get_parsed<T>(row: &Row, column: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(column)?;
    let idx = row.as_ref().column_index(column)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn get_uuid(row: &Row, column: &str) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(column)?;
    let idx = row.as_ref().column_index(column)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn get_u64(row: &Row, column: &str) -> rusqlite::Result<u64> {
    let value: i64 = row.get(column)?;
    let idx = row.as_ref().column_index(column)?;
    u64::try_from(value).map_err(|_| conversion_error(idx, format!("{} is negative: {}", column, value)))
}

/// Revisions and cursors are never negative; a negative one means the store was tampered with.
fn stored_u64(what: &str, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| Error::StateInconsistency(format!("stored {} is negative: {}", what, value)))
}

/// Database handle with connection
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    // ============================================
    // Session registry
    // ============================================

    /// Insert or update a session
    pub fn upsert_session(&self, session: &SessionRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO sessions (id, name, kind, left_endpoint, right_endpoint, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                left_endpoint = excluded.left_endpoint,
                right_endpoint = excluded.right_endpoint
            "#,
            params![
                session.id.to_string(),
                session.name,
                session.kind.as_str(),
                session.left_endpoint,
                session.right_endpoint,
                session.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get a session by ID
    pub fn get_session(&self, id: Uuid) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM sessions WHERE id = ?",
            [id.to_string()],
            Self::row_to_session,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Get a session by its configured name
    pub fn get_session_by_name(&self, name: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM sessions WHERE name = ?",
            [name],
            Self::row_to_session,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM sessions ORDER BY created_at, name")?;
        let rows = stmt.query_map([], Self::row_to_session)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<SessionRecord> {
        let created_at: String = row.get("created_at")?;
        Ok(SessionRecord {
            id: get_uuid(row, "id")?,
            name: row.get("name")?,
            kind: get_parsed(row, "kind")?,
            left_endpoint: row.get("left_endpoint")?,
            right_endpoint: row.get("right_endpoint")?,
            created_at: parse_time(&created_at),
        })
    }

    // ============================================
    // Run state and cursors
    // ============================================

    /// Record the run state of one session direction
    pub fn set_run_state(
        &self,
        session_id: Uuid,
        direction: Direction,
        state: SessionState,
        fault: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO session_runs (session_id, direction, state, fault, cursor, updated_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5)
            ON CONFLICT(session_id, direction) DO UPDATE SET
                state = excluded.state,
                fault = excluded.fault,
                updated_at = excluded.updated_at
            "#,
            params![
                session_id.to_string(),
                direction.as_str(),
                state.as_str(),
                fault,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Advance the change cursor of one session direction
    pub fn set_cursor(&self, session_id: Uuid, direction: Direction, cursor: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO session_runs (session_id, direction, state, fault, cursor, updated_at)
            VALUES (?1, ?2, ?3, NULL, ?4, ?5)
            ON CONFLICT(session_id, direction) DO UPDATE SET
                cursor = MAX(session_runs.cursor, excluded.cursor),
                updated_at = excluded.updated_at
            "#,
            params![
                session_id.to_string(),
                direction.as_str(),
                SessionState::Created.as_str(),
                cursor as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, session_id: Uuid, direction: Direction) -> Result<Option<RunRecord>> {
        let conn = self.conn.lock().unwrap();
        let run: Option<(SessionState, Option<String>, i64, DateTime<Utc>)> = conn
            .query_row(
                "SELECT * FROM session_runs WHERE session_id = ?1 AND direction = ?2",
                params![session_id.to_string(), direction.as_str()],
                |row| {
                    let updated_at: String = row.get("updated_at")?;
                    Ok((
                        get_parsed(row, "state")?,
                        row.get("fault")?,
                        row.get::<_, i64>("cursor")?,
                        parse_time(&updated_at),
                    ))
                },
            )
            .optional()?;

        run.map(|(state, fault, cursor, updated_at)| {
            Ok(RunRecord {
                state,
                fault,
                cursor: stored_u64("cursor", cursor)?,
                updated_at,
            })
        })
        .transpose()
    }

    // ============================================
    // Watermarks and applied actions
    // ============================================

    pub fn list_watermarks(&self, session_id: Uuid, direction: Direction) -> Result<Vec<Watermark>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT item_id, revision FROM watermarks WHERE session_id = ?1 AND direction = ?2 ORDER BY item_id",
        )?;
        let rows = stmt.query_map(params![session_id.to_string(), direction.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut watermarks = Vec::new();
        for row in rows {
            let (item_id, revision) = row?;
            let revision = stored_u64("watermark revision", revision)?;
            watermarks.push(Watermark::new(item_id, revision)?);
        }
        Ok(watermarks)
    }

    /// Whether an action with this fingerprint was committed
    pub fn is_recorded(&self, session_id: Uuid, direction: Direction, fingerprint: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM applied_actions WHERE session_id = ?1 AND direction = ?2 AND fingerprint = ?3",
            params![session_id.to_string(), direction.as_str(), fingerprint],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// Applied-action history, oldest first
    pub fn list_applied_actions(
        &self,
        session_id: Uuid,
        direction: Direction,
        change_group: Option<&str>,
    ) -> Result<Vec<AppliedAction>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM applied_actions
            WHERE session_id = ?1 AND direction = ?2 AND (?3 IS NULL OR change_group = ?3)
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map(
            params![session_id.to_string(), direction.as_str(), change_group],
            Self::row_to_applied,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    fn row_to_applied(row: &Row) -> rusqlite::Result<AppliedAction> {
        let recorded_at: String = row.get("recorded_at")?;
        let target_revision: Option<i64> = row.get("target_revision")?;
        Ok(AppliedAction {
            session_id: get_uuid(row, "session_id")?,
            direction: get_parsed(row, "direction")?,
            change_group: row.get("change_group")?,
            item_id: row.get("item_id")?,
            source_revision: get_u64(row, "source_revision")?,
            kind: get_parsed(row, "kind")?,
            fingerprint: row.get("fingerprint")?,
            outcome: get_parsed(row, "outcome")?,
            target_item_id: row.get("target_item_id")?,
            target_revision: target_revision
                .map(|r| {
                    u64::try_from(r).map_err(|_| {
                        let idx = row.as_ref().column_index("target_revision").unwrap_or(0);
                        conversion_error(idx, format!("target_revision is negative: {}", r))
                    })
                })
                .transpose()?,
            recorded_at: parse_time(&recorded_at),
        })
    }

    // ============================================
    // Artifact links
    // ============================================

    pub fn insert_artifact_link(&self, link: &ArtifactLink) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::insert_link(&conn, link)
    }

    fn insert_link(conn: &Connection, link: &ArtifactLink) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO artifact_links (
                session_id, source_endpoint, source_item, source_revision,
                target_endpoint, target_item, target_revision, uri, artifact_type, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                link.session_id.to_string(),
                link.source_endpoint,
                link.source_item,
                link.source_revision as i64,
                link.target_endpoint,
                link.target_item,
                link.target_revision as i64,
                link.reference.uri,
                link.reference.artifact_type.as_str(),
                link.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_artifact_links(&self) -> Result<Vec<ArtifactLink>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM artifact_links ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            let created_at: String = row.get("created_at")?;
            Ok(ArtifactLink {
                session_id: get_uuid(row, "session_id")?,
                source_endpoint: row.get("source_endpoint")?,
                source_item: row.get("source_item")?,
                source_revision: get_u64(row, "source_revision")?,
                target_endpoint: row.get("target_endpoint")?,
                target_item: row.get("target_item")?,
                target_revision: get_u64(row, "target_revision")?,
                reference: ArtifactReference {
                    uri: row.get("uri")?,
                    artifact_type: get_parsed(row, "artifact_type")?,
                },
                created_at: parse_time(&created_at),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    // ============================================
    // Conflicts
    // ============================================

    /// Insert or update a conflict
    pub fn upsert_conflict(&self, conflict: &MigrationConflict) -> Result<()> {
        let action = serde_json::to_string(&conflict.action)?;
        let disposition = conflict
            .disposition
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO conflicts (
                id, session_id, direction, change_group, fingerprint, conflict_type, scope,
                details, action, status, rule_id, disposition, retry_count, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(id) DO UPDATE SET
                details = excluded.details,
                status = excluded.status,
                rule_id = excluded.rule_id,
                disposition = excluded.disposition,
                retry_count = excluded.retry_count,
                updated_at = excluded.updated_at
            "#,
            params![
                conflict.id.to_string(),
                conflict.session_id.to_string(),
                conflict.direction.as_str(),
                conflict.change_group,
                conflict.fingerprint,
                conflict.conflict_type,
                conflict.scope,
                conflict.details,
                action,
                conflict.status.as_str(),
                conflict.rule_id,
                disposition,
                conflict.retry_count,
                conflict.created_at.to_rfc3339(),
                conflict.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_conflict(&self, id: Uuid) -> Result<Option<MigrationConflict>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM conflicts WHERE id = ?",
            [id.to_string()],
            Self::row_to_conflict,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Find a conflict by its natural key
    pub fn find_conflict(
        &self,
        session_id: Uuid,
        direction: Direction,
        change_group: &str,
        fingerprint: &str,
    ) -> Result<Option<MigrationConflict>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            SELECT * FROM conflicts
            WHERE session_id = ?1 AND direction = ?2 AND change_group = ?3 AND fingerprint = ?4
            "#,
            params![session_id.to_string(), direction.as_str(), change_group, fingerprint],
            Self::row_to_conflict,
        )
        .optional()
        .map_err(Error::from)
    }

    /// List conflicts, optionally filtered by session and status
    pub fn list_conflicts(
        &self,
        session_id: Option<Uuid>,
        status: Option<ConflictStatus>,
    ) -> Result<Vec<MigrationConflict>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM conflicts
            WHERE (?1 IS NULL OR session_id = ?1) AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at
            "#,
        )?;
        let rows = stmt.query_map(
            params![session_id.map(|id| id.to_string()), status.map(|s| s.as_str())],
            Self::row_to_conflict,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    fn row_to_conflict(row: &Row) -> rusqlite::Result<MigrationConflict> {
        let action: String = row.get("action")?;
        let disposition: Option<String> = row.get("disposition")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;
        let action_idx = row.as_ref().column_index("action")?;
        let disposition_idx = row.as_ref().column_index("disposition")?;

        Ok(MigrationConflict {
            id: get_uuid(row, "id")?,
            session_id: get_uuid(row, "session_id")?,
            direction: get_parsed(row, "direction")?,
            change_group: row.get("change_group")?,
            fingerprint: row.get("fingerprint")?,
            conflict_type: row.get("conflict_type")?,
            scope: row.get("scope")?,
            details: row.get("details")?,
            action: serde_json::from_str(&action)
                .map_err(|e| conversion_error(action_idx, e.to_string()))?,
            status: get_parsed(row, "status")?,
            rule_id: row.get("rule_id")?,
            disposition: disposition
                .map(|d| serde_json::from_str::<Disposition>(&d))
                .transpose()
                .map_err(|e| conversion_error(disposition_idx, e.to_string()))?,
            retry_count: row.get("retry_count")?,
            created_at: parse_time(&created_at),
            updated_at: parse_time(&updated_at),
        })
    }

    // ============================================
    // Diff reports
    // ============================================

    pub fn insert_diff_report(&self, report: &DiffReport) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO diff_reports (
                job_name, left_scope, right_scope, window_start, window_end,
                left_count, left_earliest, right_count, right_earliest, matched, attempts, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                report.job_name,
                report.left_scope,
                report.right_scope,
                report.window_start.to_rfc3339(),
                report.window_end.to_rfc3339(),
                report.left.change_count() as i64,
                report.left.earliest_change().map(|t| t.to_rfc3339()),
                report.right.change_count() as i64,
                report.right.earliest_change().map(|t| t.to_rfc3339()),
                report.matched(),
                report.attempts,
                report.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Diff reports for a job, newest first
    pub fn list_diff_reports(&self, job_name: &str) -> Result<Vec<DiffReport>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM diff_reports WHERE job_name = ? ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([job_name], |row| {
            let window_start: String = row.get("window_start")?;
            let window_end: String = row.get("window_end")?;
            let created_at: String = row.get("created_at")?;
            let left_earliest: Option<String> = row.get("left_earliest")?;
            let right_earliest: Option<String> = row.get("right_earliest")?;
            let left_count = get_u64(row, "left_count")?;
            let right_count = get_u64(row, "right_count")?;
            let summary = |count: u64, earliest: Option<String>, column: &str| {
                let idx = row.as_ref().column_index(column)?;
                ChangeSummary::new(count, parse_opt_time(earliest))
                    .map_err(|e| conversion_error(idx, e.to_string()))
            };
            Ok(DiffReport {
                job_name: row.get("job_name")?,
                left_scope: row.get("left_scope")?,
                right_scope: row.get("right_scope")?,
                window_start: parse_time(&window_start),
                window_end: parse_time(&window_end),
                left: summary(left_count, left_earliest, "left_earliest")?,
                right: summary(right_count, right_earliest, "right_earliest")?,
                attempts: row.get("attempts")?,
                created_at: parse_time(&created_at),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }
}

impl WatermarkStore for Database {
    fn watermark(&self, session_id: Uuid, direction: Direction, item_id: &str) -> Result<Option<Watermark>> {
        let conn = self.conn.lock().unwrap();
        let revision: Option<i64> = conn
            .query_row(
                "SELECT revision FROM watermarks WHERE session_id = ?1 AND direction = ?2 AND item_id = ?3",
                params![session_id.to_string(), direction.as_str(), item_id],
                |r| r.get(0),
            )
            .optional()?;
        revision
            .map(|r| Watermark::new(item_id, stored_u64("watermark revision", r)?))
            .transpose()
    }

    fn commit_action(&self, commit: &ActionCommit) -> Result<Watermark> {
        let record = &commit.record;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT revision FROM watermarks WHERE session_id = ?1 AND direction = ?2 AND item_id = ?3",
                params![record.session_id.to_string(), record.direction.as_str(), record.item_id],
                |r| r.get(0),
            )
            .optional()?;
        let advanced = match current {
            Some(revision) => Watermark::new(&record.item_id, stored_u64("watermark revision", revision)?)?
                .advance(record.source_revision)?,
            None => Watermark::new(&record.item_id, record.source_revision)?,
        };

        tx.execute(
            r#"
            INSERT INTO watermarks (session_id, direction, item_id, revision, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(session_id, direction, item_id) DO UPDATE SET
                revision = excluded.revision,
                updated_at = excluded.updated_at
            "#,
            params![
                record.session_id.to_string(),
                record.direction.as_str(),
                record.item_id,
                advanced.revision() as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;

        tx.execute(
            r#"
            INSERT INTO applied_actions (
                session_id, direction, change_group, item_id, source_revision, kind,
                fingerprint, outcome, target_item_id, target_revision, recorded_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.session_id.to_string(),
                record.direction.as_str(),
                record.change_group,
                record.item_id,
                record.source_revision as i64,
                record.kind.as_str(),
                record.fingerprint,
                record.outcome.as_str(),
                record.target_item_id,
                record.target_revision.map(|r| r as i64),
                record.recorded_at.to_rfc3339(),
            ],
        )?;

        if let Some(link) = &commit.link {
            Self::insert_link(&tx, link)?;
        }

        tx.commit()?;
        Ok(advanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::PATH_TRANSLATION;

    fn test_db() -> (Database, SessionRecord) {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let session = SessionRecord::new("docs", SessionKind::TwoWay, "left", "right");
        db.upsert_session(&session).unwrap();
        (db, session)
    }

    fn record(session: &SessionRecord, item: &str, revision: u64) -> AppliedAction {
        AppliedAction {
            session_id: session.id,
            direction: Direction::LeftToRight,
            change_group: format!("cs{}", revision),
            item_id: item.to_string(),
            source_revision: revision,
            kind: ActionKind::Edit,
            fingerprint: format!("fp-{}-{}", item, revision),
            outcome: ActionOutcome::Applied,
            target_item_id: Some("right-1".to_string()),
            target_revision: Some(revision + 10),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_session_roundtrip() {
        let (db, session) = test_db();
        let stored = db.get_session(session.id).unwrap().unwrap();
        assert_eq!(stored.name, "docs");
        assert_eq!(stored.left_endpoint, "left");
        assert!(db.get_session(Uuid::new_v4()).unwrap().is_none());

        let by_name = db.get_session_by_name("docs").unwrap().unwrap();
        assert_eq!(by_name.id, session.id);
        assert_eq!(by_name.kind, SessionKind::TwoWay);
        assert_eq!(by_name.endpoints(Direction::RightToLeft), ("right", "left"));
        assert_eq!(db.list_sessions().unwrap().len(), 1);
    }

    #[test]
    fn test_run_state_and_cursor() {
        let (db, session) = test_db();
        assert!(db.get_run(session.id, Direction::LeftToRight).unwrap().is_none());

        db.set_run_state(session.id, Direction::LeftToRight, SessionState::Running, None)
            .unwrap();
        db.set_cursor(session.id, Direction::LeftToRight, 7).unwrap();
        // Cursor never moves backwards
        db.set_cursor(session.id, Direction::LeftToRight, 3).unwrap();
        db.set_run_state(session.id, Direction::LeftToRight, SessionState::Faulted, Some("auth"))
            .unwrap();

        let run = db.get_run(session.id, Direction::LeftToRight).unwrap().unwrap();
        assert_eq!(run.state, SessionState::Faulted);
        assert_eq!(run.fault.as_deref(), Some("auth"));
        assert_eq!(run.cursor, 7);
    }

    #[test]
    fn test_commit_action_advances_watermark() {
        let (db, session) = test_db();
        let wm = db
            .commit_action(&ActionCommit {
                record: record(&session, "a", 1),
                link: None,
            })
            .unwrap();
        assert_eq!(wm.revision(), 1);

        db.commit_action(&ActionCommit {
            record: record(&session, "a", 2),
            link: None,
        })
        .unwrap();

        let stored = db
            .watermark(session.id, Direction::LeftToRight, "a")
            .unwrap()
            .unwrap();
        assert_eq!(stored.revision(), 2);
        assert!(db.watermark(session.id, Direction::RightToLeft, "a").unwrap().is_none());
        assert!(db.is_recorded(session.id, Direction::LeftToRight, "fp-a-2").unwrap());
        assert_eq!(
            db.list_applied_actions(session.id, Direction::LeftToRight, Some("cs2"))
                .unwrap()
                .len(),
            1
        );
        assert_eq!(db.list_watermarks(session.id, Direction::LeftToRight).unwrap().len(), 1);
    }

    #[test]
    fn test_commit_refuses_regression_atomically() {
        let (db, session) = test_db();
        db.commit_action(&ActionCommit {
            record: record(&session, "a", 5),
            link: None,
        })
        .unwrap();

        let err = db
            .commit_action(&ActionCommit {
                record: record(&session, "a", 3),
                link: None,
            })
            .unwrap_err();
        assert!(matches!(err, Error::StateInconsistency(_)));

        // Nothing from the failed commit landed
        assert_eq!(
            db.list_applied_actions(session.id, Direction::LeftToRight, None)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_negative_stored_values_are_reported() {
        let (db, session) = test_db();
        db.commit_action(&ActionCommit {
            record: record(&session, "x", 2),
            link: None,
        })
        .unwrap();
        db.set_run_state(session.id, Direction::LeftToRight, SessionState::Running, None)
            .unwrap();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute("UPDATE watermarks SET revision = -7 WHERE item_id = 'x'", [])
                .unwrap();
            conn.execute("UPDATE session_runs SET cursor = -3", []).unwrap();
        }

        assert!(matches!(
            db.watermark(session.id, Direction::LeftToRight, "x"),
            Err(Error::StateInconsistency(_))
        ));
        assert!(matches!(
            db.list_watermarks(session.id, Direction::LeftToRight),
            Err(Error::StateInconsistency(_))
        ));
        assert!(matches!(
            db.get_run(session.id, Direction::LeftToRight),
            Err(Error::StateInconsistency(_))
        ));

        // Nothing is committed on top of a corrupt watermark
        let result = db.commit_action(&ActionCommit {
            record: record(&session, "x", 3),
            link: None,
        });
        assert!(matches!(result, Err(Error::StateInconsistency(_))));
        assert_eq!(db.list_applied_actions(session.id, Direction::LeftToRight, None).unwrap().len(), 1);
    }

    #[test]
    fn test_commit_with_link() {
        let (db, session) = test_db();
        let link = ArtifactLink {
            session_id: session.id,
            source_endpoint: "left".to_string(),
            source_item: "a".to_string(),
            source_revision: 1,
            target_endpoint: "right".to_string(),
            target_item: "right-1".to_string(),
            target_revision: 11,
            reference: ArtifactReference::for_item("right", ArtifactType::VersionedItem, "right-1"),
            created_at: Utc::now(),
        };
        db.commit_action(&ActionCommit {
            record: record(&session, "a", 1),
            link: Some(link.clone()),
        })
        .unwrap();

        let links = db.list_artifact_links().unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target_revision, 11);
        assert_eq!(links[0].reference, link.reference);
    }

    #[test]
    fn test_conflict_roundtrip() {
        let (db, session) = test_db();
        let action = MigrationAction {
            kind: ActionKind::Add,
            item_id: "a".to_string(),
            path: "/proj/a".to_string(),
            from_path: None,
            version: 1,
            recursive: false,
            change_group: "cs1".to_string(),
            fields: FieldSet::default(),
            label: None,
        };
        let mut conflict = MigrationConflict {
            id: Uuid::new_v4(),
            session_id: session.id,
            direction: Direction::LeftToRight,
            change_group: "cs1".to_string(),
            fingerprint: action.fingerprint(),
            conflict_type: PATH_TRANSLATION.to_string(),
            scope: "/proj/a".to_string(),
            details: "no mapping".to_string(),
            action: action.clone(),
            status: ConflictStatus::Unresolved,
            rule_id: None,
            disposition: None,
            retry_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        db.upsert_conflict(&conflict).unwrap();

        conflict.status = ConflictStatus::Resolved;
        conflict.disposition = Some(Disposition::Replace(vec![action.retargeted("/b")]));
        db.upsert_conflict(&conflict).unwrap();

        let stored = db
            .find_conflict(session.id, Direction::LeftToRight, "cs1", &action.fingerprint())
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ConflictStatus::Resolved);
        assert_eq!(stored.disposition, conflict.disposition);
        assert_eq!(stored.action, action);

        assert!(db
            .list_conflicts(Some(session.id), Some(ConflictStatus::Unresolved))
            .unwrap()
            .is_empty());
        assert_eq!(db.list_conflicts(None, None).unwrap().len(), 1);
    }
}
