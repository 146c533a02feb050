//! Session scheduler
//!
//! Runs sessions concurrently, each strictly sequential on its own worker
//! thread. A session that faults stops on its own; the others keep running.
//! Views are computed on demand from the session registry and run state.

use crate::conflict::ConflictManager;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::pipeline::PassReport;
use crate::session::Session;
use crate::types::{Direction, SessionKind, SessionState};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Longest sleep between state checks while a worker waits for its next poll.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Snapshot of one direction of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionView {
    pub direction: Direction,
    pub state: SessionState,
    pub fault: Option<String>,
    pub cursor: u64,
    pub watermarks: usize,
    /// `None` when the source endpoint could not be read
    pub pending_changes: Option<usize>,
}

/// Snapshot of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub session_id: Uuid,
    pub name: String,
    pub kind: SessionKind,
    pub left_endpoint: String,
    pub right_endpoint: String,
    pub directions: Vec<DirectionView>,
    pub unresolved_conflicts: usize,
}

pub struct SessionScheduler {
    db: Arc<Database>,
    conflicts: Arc<ConflictManager>,
    poll_interval: Duration,
    sessions: Vec<Session>,
    workers: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl SessionScheduler {
    pub fn new(db: Arc<Database>, conflicts: Arc<ConflictManager>, poll_interval: Duration) -> Self {
        Self {
            db,
            conflicts,
            poll_interval,
            sessions: Vec::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&mut self, session: Session) -> Result<()> {
        if self.sessions.iter().any(|s| s.name() == session.name()) {
            return Err(Error::InvalidValue(format!(
                "session {} is already scheduled",
                session.name()
            )));
        }
        tracing::info!(session = %session.name(), kind = %session.kind().as_str(), "Scheduled session");
        self.sessions.push(session);
        Ok(())
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn get(&self, name: &str) -> Result<&Session> {
        self.sessions
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| Error::SessionNotFound(name.to_string()))
    }

    /// One pass of a single session.
    pub fn synchronize(&self, name: &str) -> Result<PassReport> {
        self.get(name)?.synchronize()
    }

    /// One pass of every session, concurrently.
    ///
    /// Results are returned per session; one failure does not affect others.
    pub fn synchronize_all(&self) -> Vec<(String, Result<PassReport>)> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .sessions
                .iter()
                .map(|session| {
                    let name = session.name().to_string();
                    (name, scope.spawn(move || session.synchronize()))
                })
                .collect();

            handles
                .into_iter()
                .map(|(name, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(Error::StateInconsistency(format!(
                            "synchronize thread for {} panicked",
                            name
                        )))
                    });
                    (name, result)
                })
                .collect()
        })
    }

    /// Start a worker thread for every session that is not faulted.
    ///
    /// Returns the names of the sessions started.
    pub fn start_all(&self) -> Result<Vec<String>> {
        let mut workers = self.workers.lock().unwrap();
        let mut started = Vec::new();

        for session in &self.sessions {
            if workers.iter().any(|(name, handle)| name == session.name() && !handle.is_finished()) {
                continue;
            }
            if session.is_faulted() {
                tracing::warn!(session = %session.name(), "Not starting faulted session");
                continue;
            }
            session.start()?;

            let worker_session = session.clone();
            let poll_interval = self.poll_interval;
            let handle = std::thread::Builder::new()
                .name(format!("twinsync-{}", session.name()))
                .spawn(move || run_worker(worker_session, poll_interval))?;
            workers.push((session.name().to_string(), handle));
            started.push(session.name().to_string());
        }
        Ok(started)
    }

    /// Ask every session to stop after its in-flight group, then wait for workers.
    pub fn stop_all(&self) -> Result<()> {
        for session in &self.sessions {
            session.request_stop()?;
        }
        self.join();
        Ok(())
    }

    /// Ask every session to abort, then wait for workers.
    pub fn abort_all(&self) -> Result<()> {
        for session in &self.sessions {
            session.request_abort()?;
        }
        self.join();
        Ok(())
    }

    /// Wait for all worker threads to exit.
    pub fn join(&self) {
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for (name, handle) in workers {
            if handle.join().is_err() {
                tracing::error!(session = %name, "Session worker panicked");
            }
        }
    }

    /// Current view of every session.
    pub fn views(&self) -> Result<Vec<SessionView>> {
        self.sessions.iter().map(|s| self.view(s)).collect()
    }

    pub fn view(&self, session: &Session) -> Result<SessionView> {
        let record = session.record();
        let mut directions = Vec::new();
        for half in session.halves() {
            let pending_changes = match half.pending_changes() {
                Ok(count) => Some(count),
                Err(e) => {
                    tracing::debug!(session = %record.name, error = %e, "Could not count pending changes");
                    None
                }
            };
            directions.push(DirectionView {
                direction: half.direction(),
                state: half.state(),
                fault: half.fault(),
                cursor: half.cursor()?,
                watermarks: self.db.list_watermarks(record.id, half.direction())?.len(),
                pending_changes,
            });
        }

        Ok(SessionView {
            session_id: record.id,
            name: record.name.clone(),
            kind: record.kind,
            left_endpoint: record.left_endpoint.clone(),
            right_endpoint: record.right_endpoint.clone(),
            directions,
            unresolved_conflicts: self.conflicts.list_unresolved(Some(record.id))?.len(),
        })
    }
}

fn is_active(session: &Session) -> bool {
    session.halves().iter().any(|h| h.state().is_active())
}

fn run_worker(session: Session, poll_interval: Duration) {
    tracing::info!(session = %session.name(), "Session worker started");

    loop {
        match session.synchronize() {
            Ok(_) => {}
            Err(Error::SessionFaulted { reason, .. }) => {
                tracing::error!(session = %session.name(), reason = %reason, "Session worker stopping on fault");
                wind_down(&session);
                break;
            }
            Err(e) => {
                tracing::warn!(session = %session.name(), error = %e, "Pass failed; will retry at next poll");
            }
        }

        if !is_active(&session) {
            break;
        }

        let deadline = Instant::now() + poll_interval;
        while session.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(std::cmp::min(POLL_SLICE, deadline - now));
        }
    }

    tracing::info!(session = %session.name(), "Session worker exited");
}

/// Bring the healthy halves of a faulted session to rest.
fn wind_down(session: &Session) {
    for half in session.halves() {
        if half.state().is_active() {
            if let Err(e) = half.request_stop().and_then(|_| half.synchronize().map(|_| ())) {
                tracing::warn!(session = %half.name(), error = %e, "Could not stop session half");
            }
        }
    }
}
