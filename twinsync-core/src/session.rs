//! One-way and two-way migration sessions
//!
//! A one-way session owns the pipeline of one direction and its run state:
//!
//! ```text
//! Created ──▶ Running ──▶ Stopping ──▶ Stopped
//!    ▲           │  └────▶ Aborting ──▶ Aborted
//!    │           └──────▶ Faulted ──(reset_fault)──▶ Stopped
//! Stopped / Aborted ──(start)──▶ Running
//! ```
//!
//! At most one pass is in flight per session. Run state is persisted on
//! every transition; a session found active on load was interrupted and is
//! recovered as Aborted.

use crate::config::RetryConfig;
use crate::db::{Database, SessionRecord};
use crate::error::{Error, Result};
use crate::pipeline::{ActionPipeline, PassReport};
use crate::types::{Direction, SessionKind, SessionState};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

const SIGNAL_NONE: u8 = 0;
const SIGNAL_STOP: u8 = 1;
const SIGNAL_ABORT: u8 = 2;

/// Stop/abort signal observed by the pipeline between steps.
#[derive(Debug, Default)]
pub struct SessionControl {
    signal: AtomicU8,
}

impl SessionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish the in-flight change group, then stop.
    pub fn request_stop(&self) {
        // An abort is never downgraded to a stop
        let _ = self.signal.compare_exchange(
            SIGNAL_NONE,
            SIGNAL_STOP,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Stop as soon as possible; an applied but uncommitted action is redone later.
    pub fn request_abort(&self) {
        self.signal.store(SIGNAL_ABORT, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.signal.load(Ordering::SeqCst) == SIGNAL_STOP
    }

    pub fn abort_requested(&self) -> bool {
        self.signal.load(Ordering::SeqCst) == SIGNAL_ABORT
    }

    pub fn clear(&self) {
        self.signal.store(SIGNAL_NONE, Ordering::SeqCst);
    }
}

struct RunState {
    state: SessionState,
    fault: Option<String>,
}

/// One direction of a session.
pub struct OneWaySession {
    pipeline: ActionPipeline,
    db: Arc<Database>,
    retry: RetryConfig,
    control: Arc<SessionControl>,
    run: Mutex<RunState>,
    pass_lock: Mutex<()>,
}

impl OneWaySession {
    /// Build a session, restoring its persisted run state.
    pub fn new(
        pipeline: ActionPipeline,
        db: Arc<Database>,
        retry: RetryConfig,
        control: Arc<SessionControl>,
    ) -> Result<Self> {
        let record = pipeline.session();
        let direction = pipeline.direction();
        let (state, fault) = match db.get_run(record.id, direction)? {
            Some(run) => {
                let recovered = run.state.recovered();
                if recovered != run.state {
                    tracing::warn!(
                        session = %record.name,
                        direction = %direction,
                        persisted = %run.state,
                        "Session was interrupted; recovered as aborted"
                    );
                    db.set_run_state(record.id, direction, recovered, run.fault.as_deref())?;
                }
                (recovered, run.fault)
            }
            None => {
                db.set_run_state(record.id, direction, SessionState::Created, None)?;
                (SessionState::Created, None)
            }
        };

        Ok(Self {
            pipeline,
            db,
            retry,
            control,
            run: Mutex::new(RunState { state, fault }),
            pass_lock: Mutex::new(()),
        })
    }

    pub fn record(&self) -> &SessionRecord {
        self.pipeline.session()
    }

    pub fn name(&self) -> &str {
        &self.record().name
    }

    pub fn direction(&self) -> Direction {
        self.pipeline.direction()
    }

    pub fn state(&self) -> SessionState {
        self.run.lock().unwrap().state
    }

    pub fn fault(&self) -> Option<String> {
        self.run.lock().unwrap().fault.clone()
    }

    pub fn control(&self) -> Arc<SessionControl> {
        Arc::clone(&self.control)
    }

    /// Persisted change cursor.
    pub fn cursor(&self) -> Result<u64> {
        Ok(self
            .db
            .get_run(self.record().id, self.direction())?
            .map(|r| r.cursor)
            .unwrap_or(0))
    }

    pub fn pending_changes(&self) -> Result<usize> {
        self.pipeline.pending_changes()
    }

    fn label(&self) -> String {
        format!("{}/{}", self.name(), self.direction())
    }

    fn transition(&self, next: SessionState, fault: Option<String>) -> Result<()> {
        let mut run = self.run.lock().unwrap();
        if !run.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: run.state.to_string(),
                to: next.to_string(),
            });
        }
        self.db
            .set_run_state(self.record().id, self.direction(), next, fault.as_deref())?;
        tracing::info!(
            session = %self.name(),
            direction = %self.direction(),
            from = %run.state,
            to = %next,
            "Session state changed"
        );
        run.state = next;
        run.fault = fault;
        Ok(())
    }

    /// Move to Running. Starting a running session is a no-op.
    pub fn start(&self) -> Result<()> {
        match self.state() {
            SessionState::Running => Ok(()),
            SessionState::Faulted => Err(Error::SessionFaulted {
                session: self.label(),
                reason: self.fault().unwrap_or_default(),
            }),
            _ => {
                self.control.clear();
                self.transition(SessionState::Running, None)
            }
        }
    }

    /// Ask the session to stop after the in-flight change group.
    pub fn request_stop(&self) -> Result<()> {
        self.control.request_stop();
        match self.state() {
            SessionState::Running => self.transition(SessionState::Stopping, None),
            _ => Ok(()),
        }
    }

    /// Ask the session to abort as soon as possible.
    pub fn request_abort(&self) -> Result<()> {
        self.control.request_abort();
        match self.state() {
            SessionState::Running | SessionState::Stopping => {
                self.transition(SessionState::Aborting, None)
            }
            _ => Ok(()),
        }
    }

    /// Clear a fault after an operator has dealt with its cause.
    pub fn reset_fault(&self) -> Result<()> {
        if self.state() != SessionState::Faulted {
            return Ok(());
        }
        tracing::info!(session = %self.name(), direction = %self.direction(), "Fault cleared by operator");
        self.transition(SessionState::Stopped, None)
    }

    /// Run one pass.
    ///
    /// A session that is not running is started for the pass and stopped
    /// afterwards. Fails with `SessionBusy` if a pass is already in flight.
    pub fn synchronize(&self) -> Result<PassReport> {
        let _pass = self
            .pass_lock
            .try_lock()
            .map_err(|_| Error::SessionBusy(self.label()))?;

        let state = self.state();
        let one_shot = match state {
            SessionState::Faulted => {
                return Err(Error::SessionFaulted {
                    session: self.label(),
                    reason: self.fault().unwrap_or_default(),
                })
            }
            s if s.is_active() => false,
            _ => {
                self.start()?;
                true
            }
        };

        match self.pass_with_retry() {
            Ok(report) => {
                self.finish_pass(&report, one_shot)?;
                Ok(report)
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(session = %self.label(), error = %e, "Pass failed after retries");
                if one_shot && self.state() == SessionState::Running {
                    self.transition(SessionState::Stopped, None)?;
                }
                Err(e)
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::error!(session = %self.label(), error = %reason, "Session faulted");
                self.transition(SessionState::Faulted, Some(reason.clone()))?;
                Err(Error::SessionFaulted {
                    session: self.label(),
                    reason,
                })
            }
        }
    }

    fn pass_with_retry(&self) -> Result<PassReport> {
        let mut delay = self.retry.initial_delay();
        let mut attempt = 0;
        loop {
            match self.pipeline.run_pass(&self.control) {
                Ok(report) => return Ok(report),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        session = %self.label(),
                        attempt = attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure; retrying pass"
                    );
                    std::thread::sleep(delay);
                    if self.control.abort_requested() {
                        return Err(e);
                    }
                    delay = self.retry.next_delay(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn finish_pass(&self, report: &PassReport, one_shot: bool) -> Result<()> {
        let state = self.state();
        if report.aborted || state == SessionState::Aborting || self.control.abort_requested() {
            if state == SessionState::Running || state == SessionState::Stopping {
                self.transition(SessionState::Aborting, None)?;
            }
            return self.transition(SessionState::Aborted, None);
        }
        if report.stopped || state == SessionState::Stopping || one_shot {
            return self.transition(SessionState::Stopped, None);
        }
        Ok(())
    }
}

/// Both directions of a two-way session.
pub struct TwoWaySession {
    forward: OneWaySession,
    backward: OneWaySession,
}

/// Reports of one full two-way pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TwoWayReport {
    pub forward: PassReport,
    pub backward: PassReport,
}

impl TwoWaySession {
    pub fn new(forward: OneWaySession, backward: OneWaySession) -> Result<Self> {
        if forward.record().id != backward.record().id
            || forward.direction() != Direction::LeftToRight
            || backward.direction() != Direction::RightToLeft
        {
            return Err(Error::InvalidValue(
                "two-way session needs left-to-right and right-to-left halves of one session"
                    .to_string(),
            ));
        }
        Ok(Self { forward, backward })
    }

    pub fn record(&self) -> &SessionRecord {
        self.forward.record()
    }

    pub fn forward(&self) -> &OneWaySession {
        &self.forward
    }

    pub fn backward(&self) -> &OneWaySession {
        &self.backward
    }

    pub fn halves(&self) -> [&OneWaySession; 2] {
        [&self.forward, &self.backward]
    }

    pub fn start(&self) -> Result<()> {
        self.forward.start()?;
        self.backward.start()
    }

    pub fn request_stop(&self) -> Result<()> {
        self.forward.request_stop()?;
        self.backward.request_stop()
    }

    pub fn request_abort(&self) -> Result<()> {
        self.forward.request_abort()?;
        self.backward.request_abort()
    }

    pub fn reset_fault(&self) -> Result<()> {
        self.forward.reset_fault()?;
        self.backward.reset_fault()
    }

    /// Left-to-right pass followed by right-to-left pass.
    ///
    /// Changes the engine wrote in the first half are recognized as echoes
    /// in the second and never re-ingested.
    pub fn synchronize_full(&self) -> Result<TwoWayReport> {
        let forward = self.forward.synchronize()?;
        if forward.aborted {
            return Ok(TwoWayReport {
                forward,
                backward: PassReport::default(),
            });
        }
        let backward = self.backward.synchronize()?;
        Ok(TwoWayReport { forward, backward })
    }
}

/// A configured session of either kind.
#[derive(Clone)]
pub enum Session {
    OneWay(Arc<OneWaySession>),
    TwoWay(Arc<TwoWaySession>),
}

impl Session {
    pub fn record(&self) -> &SessionRecord {
        match self {
            Session::OneWay(s) => s.record(),
            Session::TwoWay(s) => s.record(),
        }
    }

    pub fn name(&self) -> &str {
        &self.record().name
    }

    pub fn kind(&self) -> SessionKind {
        match self {
            Session::OneWay(_) => SessionKind::OneWay,
            Session::TwoWay(_) => SessionKind::TwoWay,
        }
    }

    pub fn halves(&self) -> Vec<&OneWaySession> {
        match self {
            Session::OneWay(s) => vec![s.as_ref()],
            Session::TwoWay(s) => s.halves().to_vec(),
        }
    }

    pub fn start(&self) -> Result<()> {
        match self {
            Session::OneWay(s) => s.start(),
            Session::TwoWay(s) => s.start(),
        }
    }

    pub fn request_stop(&self) -> Result<()> {
        match self {
            Session::OneWay(s) => s.request_stop(),
            Session::TwoWay(s) => s.request_stop(),
        }
    }

    pub fn request_abort(&self) -> Result<()> {
        match self {
            Session::OneWay(s) => s.request_abort(),
            Session::TwoWay(s) => s.request_abort(),
        }
    }

    pub fn reset_fault(&self) -> Result<()> {
        match self {
            Session::OneWay(s) => s.reset_fault(),
            Session::TwoWay(s) => s.reset_fault(),
        }
    }

    /// One pass; two-way sessions run both directions and merge the counters.
    pub fn synchronize(&self) -> Result<PassReport> {
        match self {
            Session::OneWay(s) => s.synchronize(),
            Session::TwoWay(s) => {
                let full = s.synchronize_full()?;
                let mut report = full.forward;
                report.merge(&full.backward);
                Ok(report)
            }
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.halves().iter().any(|h| h.state() == SessionState::Faulted)
    }

    /// Whether a worker should keep polling this session.
    pub fn is_running(&self) -> bool {
        self.halves().iter().all(|h| h.state() == SessionState::Running)
    }
}
