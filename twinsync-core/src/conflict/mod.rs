//! Conflict manager
//!
//! A conflict is raised when the pipeline cannot move an action forward on
//! its own: a path that cannot be translated, a concurrent edit on the
//! target, or a target that rejects the action. Conflicts block only the
//! change group that raised them.
//!
//! ## Lifecycle
//!
//! ```text
//! Unresolved ──(rule match)──▶ Resolved | ResolvedButNeedsFollowup
//!     │                             ▲
//!     └──(retry rule)──▶ ScheduledForRetry ──(apply succeeds)──┘
//!                               │
//!                               └──(retries exhausted)──▶ Unresolved
//! ```
//!
//! `reopen` is the only way back to Unresolved from a resolved state.
//!
//! Conflicts are keyed by (session, direction, change group, action
//! fingerprint). Raising the same conflict again returns the stored
//! decision, so a pass replayed after a crash makes the same choice.

mod scope;

pub use scope::PathScope;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::translation::replace_prefix;
use crate::types::{Direction, MigrationAction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Conflict type tags
pub const PATH_TRANSLATION: &str = "path_translation";
pub const INVALID_PATH: &str = "invalid_path";
pub const EDIT_EDIT: &str = "edit_edit";
pub const APPLY_REJECTED: &str = "apply_rejected";

const DEFAULT_MAX_RETRIES: u32 = 3;

// ============================================
// Status
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Unresolved,
    Resolved,
    ResolvedButNeedsFollowup,
    ScheduledForRetry,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Unresolved => "unresolved",
            ConflictStatus::Resolved => "resolved",
            ConflictStatus::ResolvedButNeedsFollowup => "resolved_but_needs_followup",
            ConflictStatus::ScheduledForRetry => "scheduled_for_retry",
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            ConflictStatus::Resolved | ConflictStatus::ResolvedButNeedsFollowup
        )
    }

    /// Forward transitions. Reopening is handled separately.
    pub fn can_transition_to(&self, next: ConflictStatus) -> bool {
        use ConflictStatus::*;
        matches!(
            (self, next),
            (Unresolved, Resolved | ResolvedButNeedsFollowup | ScheduledForRetry)
                | (ScheduledForRetry, Resolved | ResolvedButNeedsFollowup | ScheduledForRetry | Unresolved)
                | (ResolvedButNeedsFollowup, Resolved)
        )
    }
}

impl std::fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ConflictStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "unresolved" => Ok(ConflictStatus::Unresolved),
            "resolved" => Ok(ConflictStatus::Resolved),
            "resolved_but_needs_followup" => Ok(ConflictStatus::ResolvedButNeedsFollowup),
            "scheduled_for_retry" => Ok(ConflictStatus::ScheduledForRetry),
            _ => Err(format!("unknown conflict status: {}", s)),
        }
    }
}

/// What the pipeline does with the conflicted action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "actions")]
pub enum Disposition {
    /// Replace the action with these (empty skips it); they re-enter at translation
    Replace(Vec<MigrationAction>),
    /// Apply the original action, bypassing the check that raised the conflict
    Force,
    /// Leave the group for the next pass
    Retry,
}

/// A recorded conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationConflict {
    pub id: Uuid,
    pub session_id: Uuid,
    pub direction: Direction,
    pub change_group: String,
    pub fingerprint: String,
    pub conflict_type: String,
    /// Canonical path the conflict is about
    pub scope: String,
    pub details: String,
    pub action: MigrationAction,
    pub status: ConflictStatus,
    pub rule_id: Option<String>,
    pub disposition: Option<Disposition>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationConflict {
    fn transition(&mut self, next: ConflictStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Input for raising a conflict.
#[derive(Debug, Clone)]
pub struct ConflictReport<'a> {
    pub session_id: Uuid,
    pub direction: Direction,
    pub conflict_type: &'a str,
    pub action: &'a MigrationAction,
    pub scope: &'a str,
    pub details: String,
}

// ============================================
// Rules
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    Skip,
    Retarget,
    TakeSource,
    TakeTarget,
    Retry,
    Manual,
}

/// A configured resolution rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionRule {
    pub id: String,
    /// Conflict type tag, or `*` for any
    pub conflict_type: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub description: String,
    pub action: ResolutionAction,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl ResolutionRule {
    fn applies_to(&self, conflict_type: &str) -> bool {
        self.conflict_type == "*" || self.conflict_type == conflict_type
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    fn needs_followup(&self) -> bool {
        self.param("followup")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    fn max_retries(&self) -> u32 {
        self.param("max_retries")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES)
    }

    /// Disposition for `action`, or `None` when the rule defers to an operator.
    fn disposition(&self, action: &MigrationAction) -> std::result::Result<Option<Disposition>, String> {
        match self.action {
            ResolutionAction::Skip | ResolutionAction::TakeTarget => Ok(Some(Disposition::Replace(vec![]))),
            ResolutionAction::TakeSource => Ok(Some(Disposition::Force)),
            ResolutionAction::Retry => Ok(Some(Disposition::Retry)),
            ResolutionAction::Manual => Ok(None),
            ResolutionAction::Retarget => {
                let target = match (self.param("target_path"), self.param("from_prefix"), self.param("to_prefix")) {
                    (Some(target), _, _) => target.to_string(),
                    (None, Some(from), Some(to)) => replace_prefix(&action.path, from, to)
                        .ok_or_else(|| format!("{} is not under {}", action.path, from))?,
                    _ => return Err("retarget needs target_path or from_prefix/to_prefix".to_string()),
                };
                Ok(Some(Disposition::Replace(vec![action.retargeted(target)])))
            }
        }
    }
}

/// How exact scope ties between rules are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Report the tie; the conflict stays unresolved
    #[default]
    Reject,
    /// The earliest registered rule wins
    RegistrationOrder,
}

/// Result of matching rules against a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Resolved {
        rule_id: String,
        status: ConflictStatus,
        disposition: Disposition,
    },
    Unresolved,
    /// Several equally specific rules matched
    Ambiguous(Vec<String>),
}

/// What the pipeline should do after raising a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Proceed(Disposition),
    Blocked { conflict_id: Uuid },
}

// ============================================
// Manager
// ============================================

pub struct ConflictManager {
    db: Arc<Database>,
    rules: RwLock<Vec<(ResolutionRule, PathScope)>>,
    tie_break: TieBreak,
}

impl ConflictManager {
    pub fn new(db: Arc<Database>, tie_break: TieBreak) -> Self {
        Self {
            db,
            rules: RwLock::new(Vec::new()),
            tie_break,
        }
    }

    /// Register a rule. A rule with the same id is replaced in place.
    pub fn add_rule(&self, rule: ResolutionRule) -> Result<()> {
        let scope = PathScope::parse(&rule.scope)?;
        let mut rules = self.rules.write().unwrap();
        if let Some(slot) = rules.iter_mut().find(|(r, _)| r.id == rule.id) {
            tracing::warn!(rule = %rule.id, "Replaced conflict resolution rule");
            *slot = (rule, scope);
        } else {
            tracing::debug!(rule = %rule.id, conflict_type = %rule.conflict_type, scope = %rule.scope, "Registered conflict resolution rule");
            rules.push((rule, scope));
        }
        Ok(())
    }

    pub fn rule_ids(&self) -> Vec<String> {
        self.rules.read().unwrap().iter().map(|(r, _)| r.id.clone()).collect()
    }

    /// Match rules against a conflict. Most specific scope wins.
    pub fn evaluate(&self, conflict: &MigrationConflict) -> Evaluation {
        let rules = self.rules.read().unwrap();
        let candidates: Vec<&(ResolutionRule, PathScope)> = rules
            .iter()
            .filter(|(rule, scope)| rule.applies_to(&conflict.conflict_type) && scope.contains(&conflict.scope))
            .collect();

        let Some(best) = candidates.iter().map(|(_, scope)| scope.specificity()).max() else {
            return Evaluation::Unresolved;
        };
        let top: Vec<&ResolutionRule> = candidates
            .iter()
            .filter(|(_, scope)| scope.specificity() == best)
            .map(|(rule, _)| rule)
            .collect();

        if top.len() > 1 && self.tie_break == TieBreak::Reject {
            return Evaluation::Ambiguous(top.iter().map(|r| r.id.clone()).collect());
        }
        let rule = top[0];

        match rule.disposition(&conflict.action) {
            Ok(Some(disposition)) => {
                let status = if disposition == Disposition::Retry {
                    ConflictStatus::ScheduledForRetry
                } else if rule.needs_followup() {
                    ConflictStatus::ResolvedButNeedsFollowup
                } else {
                    ConflictStatus::Resolved
                };
                Evaluation::Resolved {
                    rule_id: rule.id.clone(),
                    status,
                    disposition,
                }
            }
            Ok(None) => Evaluation::Unresolved,
            Err(reason) => {
                tracing::warn!(rule = %rule.id, conflict_id = %conflict.id, reason = %reason, "Resolution rule could not be applied");
                Evaluation::Unresolved
            }
        }
    }

    fn apply_evaluation(&self, conflict: &mut MigrationConflict) -> Result<()> {
        match self.evaluate(conflict) {
            Evaluation::Resolved {
                rule_id,
                status,
                disposition,
            } => {
                conflict.transition(status)?;
                tracing::info!(
                    conflict_id = %conflict.id,
                    conflict_type = %conflict.conflict_type,
                    rule = %rule_id,
                    status = %status,
                    "Conflict resolved by rule"
                );
                conflict.rule_id = Some(rule_id);
                conflict.disposition = Some(disposition);
            }
            Evaluation::Ambiguous(rule_ids) => {
                tracing::warn!(
                    conflict_id = %conflict.id,
                    scope = %conflict.scope,
                    rules = ?rule_ids,
                    "Ambiguous resolution rules; conflict left unresolved"
                );
            }
            Evaluation::Unresolved => {}
        }
        Ok(())
    }

    /// Raise (or re-raise) a conflict and decide what the pipeline does next.
    pub fn raise(&self, report: ConflictReport<'_>) -> Result<Decision> {
        let fingerprint = report.action.fingerprint();
        let existing = self.db.find_conflict(
            report.session_id,
            report.direction,
            &report.action.change_group,
            &fingerprint,
        )?;

        let mut conflict = match existing {
            Some(conflict) if conflict.status.is_resolved() => {
                if let Some(disposition) = conflict.disposition.clone() {
                    return Ok(Decision::Proceed(disposition));
                }
                // Resolved by an operator without a disposition: drop the action
                return Ok(Decision::Proceed(Disposition::Replace(vec![])));
            }
            Some(mut conflict) if conflict.status == ConflictStatus::ScheduledForRetry => {
                conflict.retry_count += 1;
                let max = conflict
                    .rule_id
                    .as_deref()
                    .and_then(|id| self.rule_max_retries(id))
                    .unwrap_or(DEFAULT_MAX_RETRIES);
                if conflict.retry_count >= max {
                    tracing::warn!(
                        conflict_id = %conflict.id,
                        retries = conflict.retry_count,
                        "Retries exhausted; conflict needs an operator"
                    );
                    conflict.transition(ConflictStatus::Unresolved)?;
                    conflict.disposition = None;
                } else {
                    conflict.updated_at = Utc::now();
                }
                conflict.details = report.details;
                self.db.upsert_conflict(&conflict)?;
                return Ok(match conflict.status {
                    ConflictStatus::ScheduledForRetry => Decision::Proceed(Disposition::Retry),
                    _ => Decision::Blocked {
                        conflict_id: conflict.id,
                    },
                });
            }
            Some(mut conflict) => {
                // Still unresolved: rules may have changed since
                conflict.details = report.details;
                self.apply_evaluation(&mut conflict)?;
                conflict
            }
            None => {
                let now = Utc::now();
                let mut conflict = MigrationConflict {
                    id: Uuid::new_v4(),
                    session_id: report.session_id,
                    direction: report.direction,
                    change_group: report.action.change_group.clone(),
                    fingerprint,
                    conflict_type: report.conflict_type.to_string(),
                    scope: report.scope.to_string(),
                    details: report.details,
                    action: report.action.clone(),
                    status: ConflictStatus::Unresolved,
                    rule_id: None,
                    disposition: None,
                    retry_count: 0,
                    created_at: now,
                    updated_at: now,
                };
                tracing::info!(
                    conflict_id = %conflict.id,
                    session_id = %conflict.session_id,
                    conflict_type = %conflict.conflict_type,
                    scope = %conflict.scope,
                    change_group = %conflict.change_group,
                    "Conflict raised"
                );
                self.apply_evaluation(&mut conflict)?;
                conflict
            }
        };

        if conflict.status == ConflictStatus::Unresolved {
            conflict.updated_at = Utc::now();
        }
        self.db.upsert_conflict(&conflict)?;

        Ok(match (&conflict.status, conflict.disposition.clone()) {
            (ConflictStatus::Unresolved, _) | (_, None) => Decision::Blocked {
                conflict_id: conflict.id,
            },
            (_, Some(disposition)) => Decision::Proceed(disposition),
        })
    }

    fn rule_max_retries(&self, rule_id: &str) -> Option<u32> {
        self.rules
            .read()
            .unwrap()
            .iter()
            .find(|(r, _)| r.id == rule_id)
            .map(|(r, _)| r.max_retries())
    }

    /// Mark a retried action as resolved after it finally applied.
    pub fn settle_retry(
        &self,
        session_id: Uuid,
        direction: Direction,
        action: &MigrationAction,
    ) -> Result<()> {
        let found = self.db.find_conflict(
            session_id,
            direction,
            &action.change_group,
            &action.fingerprint(),
        )?;
        if let Some(mut conflict) = found.filter(|c| c.status == ConflictStatus::ScheduledForRetry) {
            conflict.transition(ConflictStatus::Resolved)?;
            self.db.upsert_conflict(&conflict)?;
            tracing::info!(conflict_id = %conflict.id, "Retried action applied; conflict resolved");
        }
        Ok(())
    }

    // ============================================
    // Operator operations
    // ============================================

    /// Resolve a conflict by hand with an explicit disposition.
    pub fn resolve_manually(
        &self,
        conflict_id: Uuid,
        disposition: Disposition,
        needs_followup: bool,
    ) -> Result<MigrationConflict> {
        let mut conflict = self
            .db
            .get_conflict(conflict_id)?
            .ok_or_else(|| Error::ConflictNotFound(conflict_id.to_string()))?;
        let status = if needs_followup {
            ConflictStatus::ResolvedButNeedsFollowup
        } else {
            ConflictStatus::Resolved
        };
        conflict.transition(status)?;
        conflict.rule_id = Some("manual".to_string());
        conflict.disposition = Some(disposition);
        self.db.upsert_conflict(&conflict)?;
        tracing::info!(conflict_id = %conflict.id, status = %status, "Conflict resolved manually");
        Ok(conflict)
    }

    /// Put a conflict back into Unresolved so rules are evaluated again.
    pub fn reopen(&self, conflict_id: Uuid) -> Result<MigrationConflict> {
        let mut conflict = self
            .db
            .get_conflict(conflict_id)?
            .ok_or_else(|| Error::ConflictNotFound(conflict_id.to_string()))?;
        if conflict.status == ConflictStatus::Unresolved {
            return Ok(conflict);
        }
        conflict.status = ConflictStatus::Unresolved;
        conflict.rule_id = None;
        conflict.disposition = None;
        conflict.retry_count = 0;
        conflict.updated_at = Utc::now();
        self.db.upsert_conflict(&conflict)?;
        tracing::info!(conflict_id = %conflict.id, "Conflict reopened");
        Ok(conflict)
    }

    pub fn list_unresolved(&self, session_id: Option<Uuid>) -> Result<Vec<MigrationConflict>> {
        self.db
            .list_conflicts(session_id, Some(ConflictStatus::Unresolved))
    }

    pub fn get(&self, conflict_id: Uuid) -> Result<Option<MigrationConflict>> {
        self.db.get_conflict(conflict_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SessionRecord;
    use crate::types::{ActionKind, FieldSet, SessionKind};

    fn setup(tie_break: TieBreak) -> (ConflictManager, Uuid) {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let session = SessionRecord::new("s", SessionKind::OneWay, "left", "right");
        db.upsert_session(&session).unwrap();
        (ConflictManager::new(Arc::new(db), tie_break), session.id)
    }

    fn action(path: &str) -> MigrationAction {
        MigrationAction {
            kind: ActionKind::Add,
            item_id: "i1".to_string(),
            path: path.to_string(),
            from_path: None,
            version: 1,
            recursive: false,
            change_group: "cs1".to_string(),
            fields: FieldSet::default(),
            label: None,
        }
    }

    fn rule(id: &str, scope: &str, action: ResolutionAction) -> ResolutionRule {
        ResolutionRule {
            id: id.to_string(),
            conflict_type: PATH_TRANSLATION.to_string(),
            scope: scope.to_string(),
            description: String::new(),
            action,
            params: HashMap::new(),
        }
    }

    fn report<'a>(session: Uuid, action: &'a MigrationAction) -> ConflictReport<'a> {
        ConflictReport {
            session_id: session,
            direction: Direction::LeftToRight,
            conflict_type: PATH_TRANSLATION,
            action,
            scope: &action.path,
            details: "not mapped".to_string(),
        }
    }

    #[test]
    fn test_status_transitions() {
        use ConflictStatus::*;
        assert!(Unresolved.can_transition_to(Resolved));
        assert!(Unresolved.can_transition_to(ScheduledForRetry));
        assert!(ScheduledForRetry.can_transition_to(Unresolved));
        assert!(ResolvedButNeedsFollowup.can_transition_to(Resolved));
        assert!(!Resolved.can_transition_to(Unresolved));
        assert!(!Resolved.can_transition_to(ScheduledForRetry));
    }

    #[test]
    fn test_no_rule_blocks() {
        let (manager, session) = setup(TieBreak::Reject);
        let a = action("/proj/a.txt");
        let decision = manager.raise(report(session, &a)).unwrap();
        assert!(matches!(decision, Decision::Blocked { .. }));
        assert_eq!(manager.list_unresolved(Some(session)).unwrap().len(), 1);

        // Raising again does not create a second conflict
        manager.raise(report(session, &a)).unwrap();
        assert_eq!(manager.list_unresolved(None).unwrap().len(), 1);
    }

    #[test]
    fn test_most_specific_rule_wins() {
        let (manager, session) = setup(TieBreak::Reject);
        manager.add_rule(rule("everything", "", ResolutionAction::Manual)).unwrap();
        manager.add_rule(rule("proj", "/proj", ResolutionAction::Skip)).unwrap();

        let a = action("/proj/a.txt");
        let decision = manager.raise(report(session, &a)).unwrap();
        assert_eq!(decision, Decision::Proceed(Disposition::Replace(vec![])));
        assert!(manager.list_unresolved(None).unwrap().is_empty());
    }

    #[test]
    fn test_ties_are_reported() {
        let (manager, session) = setup(TieBreak::Reject);
        manager.add_rule(rule("a", "/proj", ResolutionAction::Skip)).unwrap();
        manager.add_rule(rule("b", "/PROJ", ResolutionAction::TakeSource)).unwrap();

        let a = action("/proj/a.txt");
        let conflict = MigrationConflict {
            id: Uuid::new_v4(),
            session_id: session,
            direction: Direction::LeftToRight,
            change_group: a.change_group.clone(),
            fingerprint: a.fingerprint(),
            conflict_type: PATH_TRANSLATION.to_string(),
            scope: a.path.clone(),
            details: String::new(),
            action: a.clone(),
            status: ConflictStatus::Unresolved,
            rule_id: None,
            disposition: None,
            retry_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(
            manager.evaluate(&conflict),
            Evaluation::Ambiguous(vec!["a".to_string(), "b".to_string()])
        );
        assert!(matches!(
            manager.raise(report(session, &a)).unwrap(),
            Decision::Blocked { .. }
        ));
    }

    #[test]
    fn test_registration_order_tie_break() {
        let (manager, session) = setup(TieBreak::RegistrationOrder);
        manager.add_rule(rule("a", "/proj", ResolutionAction::TakeSource)).unwrap();
        manager.add_rule(rule("b", "/proj", ResolutionAction::Skip)).unwrap();

        let a = action("/proj/a.txt");
        assert_eq!(
            manager.raise(report(session, &a)).unwrap(),
            Decision::Proceed(Disposition::Force)
        );
    }

    #[test]
    fn test_retarget_resolution_is_idempotent() {
        let (manager, session) = setup(TieBreak::Reject);
        let mut r = rule("move", "/legacy", ResolutionAction::Retarget);
        r.params.insert("from_prefix".to_string(), "/legacy".to_string());
        r.params.insert("to_prefix".to_string(), "/proj/legacy".to_string());
        manager.add_rule(r).unwrap();

        let a = action("/legacy/x/a.txt");
        let first = manager.raise(report(session, &a)).unwrap();
        let expected = Decision::Proceed(Disposition::Replace(vec![a.retargeted("/proj/legacy/x/a.txt")]));
        assert_eq!(first, expected);

        // Rules changing later does not alter a stored resolution
        manager.add_rule(rule("move", "/legacy", ResolutionAction::Skip)).unwrap();
        assert_eq!(manager.raise(report(session, &a)).unwrap(), expected);
    }

    #[test]
    fn test_followup_param() {
        let (manager, session) = setup(TieBreak::Reject);
        let mut r = rule("skip", "", ResolutionAction::Skip);
        r.params.insert("followup".to_string(), "true".to_string());
        manager.add_rule(r).unwrap();

        let a = action("/a");
        manager.raise(report(session, &a)).unwrap();
        let stored = manager
            .db
            .find_conflict(session, Direction::LeftToRight, "cs1", &a.fingerprint())
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ConflictStatus::ResolvedButNeedsFollowup);
    }

    #[test]
    fn test_retry_until_exhausted() {
        let (manager, session) = setup(TieBreak::Reject);
        let mut r = rule("retry", "", ResolutionAction::Retry);
        r.params.insert("max_retries".to_string(), "2".to_string());
        manager.add_rule(r).unwrap();

        let a = action("/a");
        assert_eq!(
            manager.raise(report(session, &a)).unwrap(),
            Decision::Proceed(Disposition::Retry)
        );
        assert_eq!(
            manager.raise(report(session, &a)).unwrap(),
            Decision::Proceed(Disposition::Retry)
        );
        assert!(matches!(
            manager.raise(report(session, &a)).unwrap(),
            Decision::Blocked { .. }
        ));
        assert_eq!(manager.list_unresolved(None).unwrap().len(), 1);
    }

    #[test]
    fn test_settle_retry() {
        let (manager, session) = setup(TieBreak::Reject);
        manager.add_rule(rule("retry", "", ResolutionAction::Retry)).unwrap();
        let a = action("/a");
        manager.raise(report(session, &a)).unwrap();
        manager.settle_retry(session, Direction::LeftToRight, &a).unwrap();

        let stored = manager
            .db
            .find_conflict(session, Direction::LeftToRight, "cs1", &a.fingerprint())
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ConflictStatus::Resolved);
    }

    #[test]
    fn test_manual_resolution_and_reopen() {
        let (manager, session) = setup(TieBreak::Reject);
        let a = action("/a");
        let Decision::Blocked { conflict_id } = manager.raise(report(session, &a)).unwrap() else {
            panic!("expected a blocked decision");
        };

        let resolved = manager
            .resolve_manually(conflict_id, Disposition::Force, false)
            .unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved);
        assert_eq!(
            manager.raise(report(session, &a)).unwrap(),
            Decision::Proceed(Disposition::Force)
        );

        // Resolving twice is refused
        assert!(matches!(
            manager.resolve_manually(conflict_id, Disposition::Force, false),
            Err(Error::InvalidTransition { .. })
        ));

        let reopened = manager.reopen(conflict_id).unwrap();
        assert_eq!(reopened.status, ConflictStatus::Unresolved);
        assert!(matches!(
            manager.raise(report(session, &a)).unwrap(),
            Decision::Blocked { .. }
        ));

        assert!(matches!(
            manager.reopen(Uuid::new_v4()),
            Err(Error::ConflictNotFound(_))
        ));
    }
}
