//! Diff jobs
//!
//! A diff job compares the change summaries of two mapped scopes over a time
//! window. It never mutates either endpoint: mismatches are logged and
//! persisted in `diff_reports` for an operator to look at.
//!
//! Jobs run on the tokio runtime. Adapter calls are blocking, so each one is
//! moved to the blocking pool; transient failures are retried with
//! exponential backoff.

use crate::adapter::{AdapterError, EndpointAdapter};
use crate::config::RetryConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::translation::{SeparatorPathTranslator, ServerPathTranslator};
use crate::types::ChangeSummary;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Outcome of one diff run.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffReport {
    pub job_name: String,
    pub left_scope: String,
    pub right_scope: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub left: ChangeSummary,
    pub right: ChangeSummary,
    /// Adapter calls made, including retries
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl DiffReport {
    /// Both sides saw the same number of changes.
    pub fn matched(&self) -> bool {
        self.left.change_count() == self.right.change_count()
    }
}

/// A pair of mapped scopes to compare.
#[derive(Clone)]
pub struct DiffJob {
    pub name: String,
    pub left: Arc<dyn EndpointAdapter>,
    pub right: Arc<dyn EndpointAdapter>,
    /// Canonical scope on the left endpoint
    pub left_scope: String,
    /// Canonical scope on the right endpoint
    pub right_scope: String,
    pub window: ChronoDuration,
}

fn native_scope(adapter: &Arc<dyn EndpointAdapter>, canonical: &str) -> Result<String> {
    let translator: Arc<dyn ServerPathTranslator> = adapter
        .path_translator()
        .unwrap_or_else(|| Arc::new(SeparatorPathTranslator::unix()));
    Ok(translator.to_native(canonical)?)
}

/// Runs diff jobs and records their reports.
pub struct DiffJobRunner {
    db: Arc<Database>,
    retry: RetryConfig,
}

impl DiffJobRunner {
    pub fn new(db: Arc<Database>, retry: RetryConfig) -> Self {
        Self { db, retry }
    }

    /// Compare the job's scopes over the window ending now.
    pub async fn run(&self, job: &DiffJob) -> Result<DiffReport> {
        let window_end = Utc::now();
        let window_start = window_end - job.window;

        let left_native = native_scope(&job.left, &job.left_scope)?;
        let right_native = native_scope(&job.right, &job.right_scope)?;

        let (left, left_attempts) = self
            .summarize(&job.left, left_native, window_start, window_end)
            .await?;
        let (right, right_attempts) = self
            .summarize(&job.right, right_native, window_start, window_end)
            .await?;

        let report = DiffReport {
            job_name: job.name.clone(),
            left_scope: job.left_scope.clone(),
            right_scope: job.right_scope.clone(),
            window_start,
            window_end,
            left,
            right,
            attempts: left_attempts + right_attempts,
            created_at: Utc::now(),
        };

        if report.matched() {
            tracing::info!(
                job = %report.job_name,
                changes = report.left.change_count(),
                "Diff job matched"
            );
        } else {
            tracing::warn!(
                job = %report.job_name,
                left_scope = %report.left_scope,
                right_scope = %report.right_scope,
                left_changes = report.left.change_count(),
                right_changes = report.right.change_count(),
                "Diff job found a mismatch"
            );
        }

        let db = Arc::clone(&self.db);
        let stored = report.clone();
        tokio::task::spawn_blocking(move || db.insert_diff_report(&stored))
            .await
            .map_err(|e| Error::StateInconsistency(format!("diff report task failed: {}", e)))??;

        Ok(report)
    }

    async fn summarize(
        &self,
        adapter: &Arc<dyn EndpointAdapter>,
        native_scope: String,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(ChangeSummary, u32)> {
        let mut delay = self.retry.initial_delay();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let adapter = Arc::clone(adapter);
            let scope = native_scope.clone();
            let result = tokio::task::spawn_blocking(move || adapter.summarize(&scope, from, to))
                .await
                .unwrap_or_else(|e| Err(AdapterError::Transient(format!("summary task failed: {}", e))));

            match result {
                Ok(summary) => return Ok((summary, attempts)),
                Err(e) if e.is_transient() && attempts <= self.retry.max_retries => {
                    tracing::debug!(
                        "Retrying summarize (attempt {}/{}), waiting {:?}",
                        attempts + 1,
                        self.retry.max_retries + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = self.retry.next_delay(delay);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run every job each `interval` until `shutdown` turns true.
    pub async fn run_periodic(
        self: Arc<Self>,
        jobs: Vec<DiffJob>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        tracing::info!(jobs = jobs.len(), interval_secs = interval.as_secs(), "Diff jobs scheduled");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for job in &jobs {
                        if let Err(e) = self.run(job).await {
                            tracing::warn!(job = %job.name, error = %e, "Diff job failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Diff jobs stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryEndpoint;
    use crate::types::ChangeEntry;

    fn runner() -> (DiffJobRunner, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate().unwrap();
        let retry = RetryConfig {
            max_retries: 2,
            initial_delay_ms: 1,
            max_delay_ms: 4,
        };
        (DiffJobRunner::new(Arc::clone(&db), retry), db)
    }

    fn job(left: &Arc<MemoryEndpoint>, right: &Arc<MemoryEndpoint>) -> DiffJob {
        DiffJob {
            name: "docs:/proj".to_string(),
            left: left.clone(),
            right: right.clone(),
            left_scope: "/proj".to_string(),
            right_scope: "/mirror".to_string(),
            window: ChronoDuration::hours(1),
        }
    }

    #[tokio::test]
    async fn test_matching_scopes() {
        let (runner, db) = runner();
        let left = Arc::new(MemoryEndpoint::new("left"));
        let right = Arc::new(MemoryEndpoint::new("right"));
        left.commit("a", vec![ChangeEntry::add("1", "/proj/a.txt")]);
        right.commit("a", vec![ChangeEntry::add("1", "/mirror/a.txt")]);

        let report = runner.run(&job(&left, &right)).await.unwrap();
        assert!(report.matched());
        assert_eq!(report.attempts, 2);

        let stored = db.list_diff_reports("docs:/proj").unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].matched());
    }

    #[tokio::test]
    async fn test_mismatch_is_recorded_not_corrected() {
        let (runner, db) = runner();
        let left = Arc::new(MemoryEndpoint::new("left"));
        let right = Arc::new(MemoryEndpoint::new("right"));
        left.commit("a", vec![ChangeEntry::add("1", "/proj/a.txt")]);
        left.commit("a", vec![ChangeEntry::add("2", "/proj/b.txt")]);
        right.commit("a", vec![ChangeEntry::add("1", "/mirror/a.txt")]);

        let report = runner.run(&job(&left, &right)).await.unwrap();
        assert!(!report.matched());
        assert_eq!(report.left.change_count(), 2);
        assert_eq!(report.right.change_count(), 1);
        assert_eq!(right.head_sequence(), 1);
        assert_eq!(right.apply_calls(), 0);
        assert!(!db.list_diff_reports("docs:/proj").unwrap()[0].matched());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (runner, _db) = runner();
        let left = Arc::new(MemoryEndpoint::new("left"));
        let right = Arc::new(MemoryEndpoint::new("right"));
        left.fail_next_read(AdapterError::Transient("timeout".to_string()));
        left.fail_next_read(AdapterError::Transient("timeout".to_string()));

        let report = runner.run(&job(&left, &right)).await.unwrap();
        assert_eq!(report.attempts, 4);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let (runner, db) = runner();
        let left = Arc::new(MemoryEndpoint::new("left"));
        let right = Arc::new(MemoryEndpoint::new("right"));
        for _ in 0..3 {
            left.fail_next_read(AdapterError::Transient("timeout".to_string()));
        }

        let err = runner.run(&job(&left, &right)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(db.list_diff_reports("docs:/proj").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_periodic_runner_stops_on_shutdown() {
        let (runner, db) = runner();
        let left = Arc::new(MemoryEndpoint::new("left"));
        let right = Arc::new(MemoryEndpoint::new("right"));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::new(runner).run_periodic(
            vec![job(&left, &right)],
            Duration::from_secs(3600),
            rx,
        ));
        // The first tick fires immediately
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(db.list_diff_reports("docs:/proj").unwrap().len(), 1);
    }
}
