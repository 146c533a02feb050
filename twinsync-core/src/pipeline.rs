//! Action pipeline
//!
//! One pass of a one-way session:
//!
//! 1. **Normalize**: endpoint changes become change groups of canonical
//!    actions, in source order. Cloaked entries and echoes of the engine's
//!    own writes are dropped here.
//! 2. **Translate**: canonical paths are mapped to the target namespace and
//!    the owner identity is looked up. Failures raise a conflict that blocks
//!    the owning group only.
//! 3. **Watermark check**: actions already covered by the item's watermark
//!    are skipped.
//! 4. **Edit/edit check** (two-way sessions): the target item changed since
//!    the engine last saw it.
//! 5. **Apply and commit**: the target applies the action; the watermark
//!    advance, the applied record and the artifact link are committed in one
//!    transaction.
//! 6. **Annotate**: optional label derived from the group's applied records.
//!
//! Later groups touching a path of a blocked group are held back so that
//! per-item ordering survives a conflict. The session cursor only moves up
//! to the first blocked group.

use crate::adapter::{AdapterError, ApplyOutcome, EndpointAdapter, TranslatedAction};
use crate::conflict::{
    ConflictManager, ConflictReport, Decision, Disposition, APPLY_REJECTED, EDIT_EDIT,
};
use crate::db::{ActionCommit, Database, SessionRecord, WatermarkStore};
use crate::error::Result;
use crate::identity::{IdentityLookupService, LookupContext, LookupResult};
use crate::session::SessionControl;
use crate::translation::{
    path_within, ArtifactLink, ArtifactLinkService, PathMapper, SeparatorPathTranslator,
    ServerPathTranslator, TranslationError,
};
use crate::types::{
    ActionKind, ActionOutcome, AppliedAction, ArtifactReference, ArtifactType, Direction,
    EndpointChange, FieldSet, MigrationAction, RichIdentity, SessionKind,
};
use chrono::Utc;
use std::sync::Arc;

/// Replacement actions may themselves conflict; stop following after this many levels.
const MAX_RESOLUTION_DEPTH: usize = 4;

/// Services shared by every pipeline of an engine.
pub struct EngineServices {
    pub db: Arc<Database>,
    pub identities: Arc<IdentityLookupService>,
    pub conflicts: Arc<ConflictManager>,
    pub links: Arc<ArtifactLinkService>,
    /// Owner used when identity lookup finds nothing
    pub default_identity: Option<String>,
    /// Label template; `{group}`, `{sequence}` and `{session}` are substituted
    pub annotation_template: Option<String>,
}

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub changes_seen: usize,
    pub applied: usize,
    pub skipped: usize,
    pub echoes: usize,
    pub cloaked: usize,
    /// Actions blocked by an unresolved conflict
    pub conflicts: usize,
    /// Actions resolved by a rule or operator decision
    pub resolved: usize,
    pub retries: usize,
    pub annotations: usize,
    pub blocked_groups: usize,
    /// Groups held behind a blocked group touching the same paths
    pub held_groups: usize,
    /// Cursor after the pass
    pub cursor: u64,
    pub stopped: bool,
    pub aborted: bool,
}

impl PassReport {
    /// Sum two reports; the cursor and flags come from `other`.
    pub fn merge(&mut self, other: &PassReport) {
        self.changes_seen += other.changes_seen;
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.echoes += other.echoes;
        self.cloaked += other.cloaked;
        self.conflicts += other.conflicts;
        self.resolved += other.resolved;
        self.retries += other.retries;
        self.annotations += other.annotations;
        self.blocked_groups += other.blocked_groups;
        self.held_groups += other.held_groups;
        self.cursor = other.cursor;
        self.stopped |= other.stopped;
        self.aborted |= other.aborted;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Done,
    Blocked,
    Aborted,
}

/// Which check raised a conflict; decides what `Force` means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Translation,
    EditEdit,
    Rejected,
}

/// A normalized action, or one whose native path could not be read.
struct Staged {
    action: MigrationAction,
    invalid: Option<TranslationError>,
}

struct AppliedStep {
    record: AppliedAction,
    source_path: String,
    target_path: String,
}

struct GroupState {
    owner: Option<String>,
    applied: Vec<AppliedStep>,
}

/// Pipeline for one direction of one session.
pub struct ActionPipeline {
    session: SessionRecord,
    direction: Direction,
    source_name: String,
    target_name: String,
    source: Arc<dyn EndpointAdapter>,
    target: Arc<dyn EndpointAdapter>,
    source_paths: Arc<dyn ServerPathTranslator>,
    target_paths: Arc<dyn ServerPathTranslator>,
    mapper: PathMapper,
    detect_edit_conflicts: bool,
    services: Arc<EngineServices>,
}

fn translator_for(adapter: &Arc<dyn EndpointAdapter>) -> Arc<dyn ServerPathTranslator> {
    adapter.path_translator().unwrap_or_else(|| {
        tracing::warn!(
            provider = %adapter.descriptor().name,
            "Provider has no path translator; using unix-style paths"
        );
        Arc::new(SeparatorPathTranslator::unix())
    })
}

fn artifact_type(action: &MigrationAction) -> ArtifactType {
    if action.fields.is_empty() {
        ArtifactType::VersionedItem
    } else {
        ArtifactType::WorkItem
    }
}

impl ActionPipeline {
    pub fn new(
        session: SessionRecord,
        direction: Direction,
        source: Arc<dyn EndpointAdapter>,
        target: Arc<dyn EndpointAdapter>,
        mapper: PathMapper,
        services: Arc<EngineServices>,
    ) -> Self {
        let (source_name, target_name) = session.endpoints(direction);
        let (source_name, target_name) = (source_name.to_string(), target_name.to_string());
        Self {
            source_paths: translator_for(&source),
            target_paths: translator_for(&target),
            detect_edit_conflicts: session.kind == SessionKind::TwoWay,
            session,
            direction,
            source_name,
            target_name,
            source,
            target,
            mapper,
            services,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn session(&self) -> &SessionRecord {
        &self.session
    }

    fn cursor(&self) -> Result<u64> {
        Ok(self
            .services
            .db
            .get_run(self.session.id, self.direction)?
            .map(|r| r.cursor)
            .unwrap_or(0))
    }

    /// Source changes past the cursor that are not echoes.
    pub fn pending_changes(&self) -> Result<usize> {
        let changes = self.source.changes_since(self.cursor()?)?;
        Ok(changes
            .iter()
            .filter(|c| {
                c.entries.iter().any(|e| {
                    !self
                        .services
                        .links
                        .is_echo(self.session.id, &self.source_name, &e.item_id, c.sequence)
                })
            })
            .count())
    }

    /// Run one pass over the currently pending changes.
    pub fn run_pass(&self, control: &SessionControl) -> Result<PassReport> {
        let start_cursor = self.cursor()?;
        let mut changes = self.source.changes_since(start_cursor)?;
        changes.sort_by_key(|c| c.sequence);

        let mut report = PassReport {
            cursor: start_cursor,
            ..Default::default()
        };
        let mut blocked_paths: Vec<String> = Vec::new();
        let mut frontier_open = true;

        for change in &changes {
            if control.abort_requested() {
                report.aborted = true;
                break;
            }
            if control.stop_requested() {
                report.stopped = true;
                break;
            }
            report.changes_seen += 1;

            let staged = self.normalize(change, &mut report)?;
            let step = if self.is_held(&staged, &blocked_paths) {
                tracing::debug!(
                    session = %self.session.name,
                    change_group = %change.change_id,
                    "Holding change group behind a blocked group"
                );
                report.held_groups += 1;
                Step::Blocked
            } else {
                self.process_group(change, &staged, control, &mut report)?
            };

            match step {
                Step::Done => {
                    if frontier_open {
                        report.cursor = change.sequence;
                    }
                }
                Step::Blocked => {
                    frontier_open = false;
                    report.blocked_groups += 1;
                    for s in &staged {
                        blocked_paths.push(s.action.path.clone());
                        blocked_paths.extend(s.action.from_path.clone());
                    }
                }
                Step::Aborted => {
                    report.aborted = true;
                    break;
                }
            }
        }

        if report.cursor > start_cursor {
            self.services
                .db
                .set_cursor(self.session.id, self.direction, report.cursor)?;
        }

        tracing::info!(
            session = %self.session.name,
            direction = %self.direction,
            changes = report.changes_seen,
            applied = report.applied,
            skipped = report.skipped,
            echoes = report.echoes,
            conflicts = report.conflicts,
            blocked_groups = report.blocked_groups,
            cursor = report.cursor,
            "Pipeline pass complete"
        );
        Ok(report)
    }

    // ============================================
    // Normalize
    // ============================================

    fn normalize(&self, change: &EndpointChange, report: &mut PassReport) -> Result<Vec<Staged>> {
        let mut staged = Vec::with_capacity(change.entries.len());

        for entry in &change.entries {
            if self
                .services
                .links
                .is_echo(self.session.id, &self.source_name, &entry.item_id, change.sequence)
            {
                self.record_echo(change, &entry.item_id, entry.kind)?;
                report.echoes += 1;
                continue;
            }

            let path = self.source_paths.to_canonical(&entry.native_path);
            let from_path = entry
                .from_native_path
                .as_deref()
                .map(|p| self.source_paths.to_canonical(p))
                .transpose();
            let (path, from_path, invalid) = match (path, from_path) {
                (Ok(path), Ok(from_path)) => (path, from_path, None),
                (Err(e), _) | (_, Err(e)) => (
                    entry.native_path.clone(),
                    entry.from_native_path.clone(),
                    Some(e),
                ),
            };

            if invalid.is_none()
                && (self.mapper.is_cloaked(&path)
                    || from_path
                        .as_deref()
                        .map(|p| self.mapper.is_cloaked(p))
                        .unwrap_or(false))
            {
                report.cloaked += 1;
                continue;
            }

            staged.push(Staged {
                action: MigrationAction {
                    kind: entry.kind,
                    item_id: entry.item_id.clone(),
                    path,
                    from_path,
                    version: change.sequence,
                    recursive: entry.recursive,
                    change_group: change.change_id.clone(),
                    fields: entry.fields.clone(),
                    label: entry.label.clone(),
                },
                invalid,
            });
        }
        Ok(staged)
    }

    fn record_echo(&self, change: &EndpointChange, item_id: &str, kind: ActionKind) -> Result<()> {
        let covered = self
            .services
            .db
            .watermark(self.session.id, self.direction, item_id)?
            .map(|w| w.covers(change.sequence))
            .unwrap_or(false);
        if covered {
            return Ok(());
        }

        let record = AppliedAction {
            session_id: self.session.id,
            direction: self.direction,
            change_group: change.change_id.clone(),
            item_id: item_id.to_string(),
            source_revision: change.sequence,
            kind,
            fingerprint: format!("echo:{}:{}", item_id, change.sequence),
            outcome: ActionOutcome::Echo,
            target_item_id: self
                .services
                .links
                .counterpart(self.session.id, &self.source_name, item_id)
                .map(|(_, item)| item),
            target_revision: None,
            recorded_at: Utc::now(),
        };
        self.services.db.commit_action(&ActionCommit { record, link: None })?;
        tracing::debug!(
            session = %self.session.name,
            item = item_id,
            revision = change.sequence,
            "Suppressed echo of engine-produced change"
        );
        Ok(())
    }

    fn is_held(&self, staged: &[Staged], blocked_paths: &[String]) -> bool {
        if blocked_paths.is_empty() {
            return false;
        }
        staged.iter().any(|s| {
            std::iter::once(&s.action.path)
                .chain(s.action.from_path.as_ref())
                .any(|path| {
                    blocked_paths.iter().any(|blocked| {
                        blocked == path || path_within(path, blocked) || path_within(blocked, path)
                    })
                })
        })
    }

    // ============================================
    // Translate, check, apply
    // ============================================

    fn process_group(
        &self,
        change: &EndpointChange,
        staged: &[Staged],
        control: &SessionControl,
        report: &mut PassReport,
    ) -> Result<Step> {
        let mut group = GroupState {
            owner: self.translate_owner(change.owner.as_deref()),
            applied: Vec::new(),
        };

        for s in staged {
            match self.process_action(&s.action, s.invalid.clone(), false, 0, &mut group, control, report)? {
                Step::Done => {}
                other => return Ok(other),
            }
        }

        self.annotate(change, &group, control, report)
    }

    /// Translate the change owner, falling back to the default identity.
    fn translate_owner(&self, owner: Option<&str>) -> Option<String> {
        let owner = owner?;
        let fallback = || {
            self.services
                .default_identity
                .clone()
                .unwrap_or_else(|| owner.to_string())
        };
        let identity = match RichIdentity::from_qualified(owner) {
            Ok(identity) => identity,
            Err(_) => return Some(fallback()),
        };
        let context = LookupContext {
            session_id: self.session.id,
            direction: self.direction,
            source_endpoint: self.source_name.clone(),
            target_endpoint: self.target_name.clone(),
        };

        match self.services.identities.try_lookup(&identity, &context) {
            LookupResult::Found(translated) => Some(translated.qualified_name()),
            LookupResult::NotFound => {
                let fallback = fallback();
                tracing::warn!(
                    session = %self.session.name,
                    identity = owner,
                    fallback = %fallback,
                    "Identity not found; using default identity"
                );
                Some(fallback)
            }
        }
    }

    fn is_covered(&self, action: &MigrationAction) -> Result<bool> {
        let db = &self.services.db;
        match db.watermark(self.session.id, self.direction, &action.item_id)? {
            Some(wm) if wm.revision() > action.version => Ok(true),
            Some(wm) if wm.revision() == action.version => {
                db.is_recorded(self.session.id, self.direction, &action.fingerprint())
            }
            _ => Ok(false),
        }
    }

    fn translate(
        &self,
        action: &MigrationAction,
        owner: Option<String>,
        force: bool,
    ) -> std::result::Result<TranslatedAction, TranslationError> {
        let to_target = |path: &str| {
            self.mapper
                .map(path, self.direction)
                .and_then(|canonical| self.target_paths.to_native(&canonical))
        };
        let target_path = to_target(&action.path)?;
        let target_from_path = action.from_path.as_deref().map(to_target).transpose()?;
        let target_item_id = self
            .services
            .links
            .counterpart(self.session.id, &self.source_name, &action.item_id)
            .filter(|(endpoint, _)| endpoint == &self.target_name)
            .map(|(_, item)| item);

        Ok(TranslatedAction {
            source: action.clone(),
            target_path,
            target_from_path,
            target_item_id,
            owner,
            fingerprint: action.fingerprint(),
            force,
        })
    }

    /// Describe a concurrent change to the target counterpart, if any.
    fn concurrent_edit(&self, translated: &TranslatedAction) -> Result<Option<String>> {
        if matches!(translated.source.kind, ActionKind::Add | ActionKind::Branch | ActionKind::Label) {
            return Ok(None);
        }
        let Some(target_item) = translated.target_item_id.as_deref() else {
            return Ok(None);
        };
        let Some(latest) = self.target.latest_revision(target_item)? else {
            return Ok(None);
        };

        let synced_back = self
            .services
            .db
            .watermark(self.session.id, self.direction.reverse(), target_item)?
            .map(|w| w.revision())
            .unwrap_or(0);
        let produced = self
            .services
            .links
            .produced_revision(self.session.id, &self.target_name, target_item)
            .unwrap_or(0);
        let known = synced_back.max(produced);

        Ok((latest > known).then(|| {
            format!(
                "{} item {} changed at revision {}; last known revision {}",
                self.target_name, target_item, latest, known
            )
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn process_action(
        &self,
        action: &MigrationAction,
        invalid: Option<TranslationError>,
        force: bool,
        depth: usize,
        group: &mut GroupState,
        control: &SessionControl,
        report: &mut PassReport,
    ) -> Result<Step> {
        if depth > MAX_RESOLUTION_DEPTH {
            tracing::warn!(
                session = %self.session.name,
                change_group = %action.change_group,
                "Conflict resolution did not settle; blocking group"
            );
            report.conflicts += 1;
            return Ok(Step::Blocked);
        }

        if let Some(err) = invalid {
            let decision = self.raise(err.conflict_type(), action, err.path(), err.to_string())?;
            return self.follow(decision, action, Origin::Translation, depth, group, control, report);
        }

        if self.is_covered(action)? {
            report.skipped += 1;
            return Ok(Step::Done);
        }

        let translated = match self.translate(action, group.owner.clone(), force) {
            Ok(translated) => translated,
            Err(err) => {
                let decision = self.raise(err.conflict_type(), action, &action.path, err.to_string())?;
                return self.follow(decision, action, Origin::Translation, depth, group, control, report);
            }
        };

        if self.detect_edit_conflicts && !force {
            if let Some(details) = self.concurrent_edit(&translated)? {
                let decision = self.raise(EDIT_EDIT, action, &action.path, details)?;
                return self.follow(decision, action, Origin::EditEdit, depth, group, control, report);
            }
        }

        if control.abort_requested() {
            return Ok(Step::Aborted);
        }

        let outcome = match self.target.apply(&translated) {
            Ok(outcome) => outcome,
            Err(AdapterError::Rejected(reason)) => {
                let decision = self.raise(APPLY_REJECTED, action, &action.path, reason)?;
                return self.follow(decision, action, Origin::Rejected, depth, group, control, report);
            }
            Err(e) => return Err(e.into()),
        };

        if control.abort_requested() {
            tracing::warn!(
                session = %self.session.name,
                item = %action.item_id,
                revision = action.version,
                "Abort after apply; action left uncommitted"
            );
            return Ok(Step::Aborted);
        }

        let record = self.commit(action, Some(&outcome), ActionOutcome::Applied)?;
        self.services
            .conflicts
            .settle_retry(self.session.id, self.direction, action)?;
        report.applied += 1;

        if action.kind != ActionKind::Delete {
            group.applied.push(AppliedStep {
                record,
                source_path: action.path.clone(),
                target_path: translated.target_path,
            });
        }
        Ok(Step::Done)
    }

    fn raise(
        &self,
        conflict_type: &str,
        action: &MigrationAction,
        scope: &str,
        details: String,
    ) -> Result<Decision> {
        self.services.conflicts.raise(ConflictReport {
            session_id: self.session.id,
            direction: self.direction,
            conflict_type,
            action,
            scope,
            details,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn follow(
        &self,
        decision: Decision,
        action: &MigrationAction,
        origin: Origin,
        depth: usize,
        group: &mut GroupState,
        control: &SessionControl,
        report: &mut PassReport,
    ) -> Result<Step> {
        match decision {
            Decision::Blocked { conflict_id } => {
                tracing::info!(
                    session = %self.session.name,
                    change_group = %action.change_group,
                    conflict_id = %conflict_id,
                    "Change group blocked by unresolved conflict"
                );
                report.conflicts += 1;
                Ok(Step::Blocked)
            }
            Decision::Proceed(Disposition::Retry) => {
                report.retries += 1;
                Ok(Step::Blocked)
            }
            Decision::Proceed(Disposition::Replace(actions)) => {
                report.resolved += 1;
                if actions.is_empty() {
                    if !self.is_covered(action)? {
                        self.commit(action, None, ActionOutcome::Skipped)?;
                    }
                    report.skipped += 1;
                    return Ok(Step::Done);
                }
                for replacement in &actions {
                    match self.process_action(replacement, None, false, depth + 1, group, control, report)? {
                        Step::Done => {}
                        other => return Ok(other),
                    }
                }
                Ok(Step::Done)
            }
            Decision::Proceed(Disposition::Force) => match origin {
                Origin::Translation => {
                    tracing::warn!(
                        session = %self.session.name,
                        path = %action.path,
                        "Forced resolution cannot bypass a path translation failure"
                    );
                    report.conflicts += 1;
                    Ok(Step::Blocked)
                }
                Origin::EditEdit | Origin::Rejected => {
                    report.resolved += 1;
                    self.process_action(action, None, true, depth + 1, group, control, report)
                }
            },
        }
    }

    /// Commit an action outcome and remember the link it produced.
    fn commit(
        &self,
        action: &MigrationAction,
        outcome: Option<&ApplyOutcome>,
        kind: ActionOutcome,
    ) -> Result<AppliedAction> {
        let now = Utc::now();
        let record = AppliedAction {
            session_id: self.session.id,
            direction: self.direction,
            change_group: action.change_group.clone(),
            item_id: action.item_id.clone(),
            source_revision: action.version,
            kind: action.kind,
            fingerprint: action.fingerprint(),
            outcome: kind,
            target_item_id: outcome.map(|o| o.target_item_id.clone()),
            target_revision: outcome.map(|o| o.target_revision),
            recorded_at: now,
        };
        let link = outcome.map(|o| ArtifactLink {
            session_id: self.session.id,
            source_endpoint: self.source_name.clone(),
            source_item: action.item_id.clone(),
            source_revision: action.version,
            target_endpoint: self.target_name.clone(),
            target_item: o.target_item_id.clone(),
            target_revision: o.target_revision,
            reference: ArtifactReference::for_item(
                &self.target_name,
                artifact_type(action),
                &o.target_item_id,
            ),
            created_at: now,
        });

        self.services.db.commit_action(&ActionCommit {
            record: record.clone(),
            link: link.clone(),
        })?;
        if let Some(link) = link {
            self.services.links.remember(link);
        }
        Ok(record)
    }

    // ============================================
    // Annotate
    // ============================================

    /// Label the target with the group's applied records.
    fn annotate(
        &self,
        change: &EndpointChange,
        group: &GroupState,
        control: &SessionControl,
        report: &mut PassReport,
    ) -> Result<Step> {
        let Some(template) = self.services.annotation_template.as_deref() else {
            return Ok(Step::Done);
        };
        let Some(last) = group.applied.last() else {
            return Ok(Step::Done);
        };

        let label = template
            .replace("{group}", &change.change_id)
            .replace("{sequence}", &change.sequence.to_string())
            .replace("{session}", &self.session.name);
        let action = MigrationAction {
            kind: ActionKind::Label,
            item_id: last.record.item_id.clone(),
            path: last.source_path.clone(),
            from_path: None,
            version: last.record.source_revision,
            recursive: false,
            change_group: last.record.change_group.clone(),
            fields: FieldSet::default(),
            label: Some(label),
        };
        if self.is_covered(&action)? {
            return Ok(Step::Done);
        }
        if control.abort_requested() {
            return Ok(Step::Aborted);
        }

        let translated = TranslatedAction {
            fingerprint: action.fingerprint(),
            source: action.clone(),
            target_path: last.target_path.clone(),
            target_from_path: None,
            target_item_id: last.record.target_item_id.clone(),
            owner: group.owner.clone(),
            force: false,
        };
        match self.target.apply(&translated) {
            Ok(outcome) => {
                if control.abort_requested() {
                    return Ok(Step::Aborted);
                }
                self.commit(&action, Some(&outcome), ActionOutcome::Applied)?;
                report.annotations += 1;
                Ok(Step::Done)
            }
            Err(AdapterError::Rejected(reason)) => {
                tracing::warn!(
                    session = %self.session.name,
                    change_group = %change.change_id,
                    reason = %reason,
                    "Target rejected annotation"
                );
                Ok(Step::Done)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterFault, MemoryEndpoint};
    use crate::conflict::{ConflictStatus, ResolutionAction, ResolutionRule, TieBreak, INVALID_PATH};
    use crate::translation::PathMapping;
    use crate::types::ChangeEntry;
    use std::collections::HashMap;

    struct Fixture {
        services: Arc<EngineServices>,
        left: Arc<MemoryEndpoint>,
        right: Arc<MemoryEndpoint>,
        session: SessionRecord,
    }

    impl Fixture {
        fn new(kind: SessionKind) -> Self {
            Self::with_options(kind, None, None)
        }

        fn with_options(
            kind: SessionKind,
            default_identity: Option<&str>,
            annotation_template: Option<&str>,
        ) -> Self {
            let db = Arc::new(Database::open_in_memory().unwrap());
            db.migrate().unwrap();
            let session = SessionRecord::new("test", kind, "left", "right");
            db.upsert_session(&session).unwrap();

            let services = Arc::new(EngineServices {
                conflicts: Arc::new(ConflictManager::new(Arc::clone(&db), TieBreak::Reject)),
                db,
                identities: Arc::new(IdentityLookupService::new()),
                links: Arc::new(ArtifactLinkService::new()),
                default_identity: default_identity.map(str::to_string),
                annotation_template: annotation_template.map(str::to_string),
            });
            Self {
                services,
                left: Arc::new(MemoryEndpoint::new("left")),
                right: Arc::new(MemoryEndpoint::new("right")),
                session,
            }
        }

        fn pipeline(&self, direction: Direction, mapper: PathMapper) -> ActionPipeline {
            let (source, target): (Arc<dyn EndpointAdapter>, Arc<dyn EndpointAdapter>) = match direction {
                Direction::LeftToRight => (self.left.clone(), self.right.clone()),
                Direction::RightToLeft => (self.right.clone(), self.left.clone()),
            };
            ActionPipeline::new(
                self.session.clone(),
                direction,
                source,
                target,
                mapper,
                Arc::clone(&self.services),
            )
        }

        fn watermark(&self, direction: Direction, item: &str) -> Option<u64> {
            self.services
                .db
                .watermark(self.session.id, direction, item)
                .unwrap()
                .map(|w| w.revision())
        }
    }

    #[test]
    fn test_add_then_edit_applies_in_order() {
        let fx = Fixture::new(SessionKind::OneWay);
        fx.left.commit("alice", vec![ChangeEntry::add("f1", "/proj/file.txt")]);
        fx.left.commit("alice", vec![ChangeEntry::edit("f1", "/proj/file.txt")]);

        let pipeline = fx.pipeline(Direction::LeftToRight, PathMapper::default());
        let report = pipeline.run_pass(&SessionControl::new()).unwrap();

        assert_eq!(report.applied, 2);
        assert_eq!(report.conflicts, 0);
        assert_eq!(report.cursor, 2);
        assert_eq!(fx.watermark(Direction::LeftToRight, "f1"), Some(2));
        assert!(fx.right.item_at_path("/proj/file.txt").is_some());

        // Nothing new: nothing applied
        let again = pipeline.run_pass(&SessionControl::new()).unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.changes_seen, 0);
        assert_eq!(fx.right.apply_calls(), 2);
    }

    #[test]
    fn test_multiple_actions_on_one_item_in_one_group() {
        let fx = Fixture::new(SessionKind::OneWay);
        fx.left.commit(
            "alice",
            vec![
                ChangeEntry::add("f1", "/proj/a.txt"),
                ChangeEntry::rename("f1", "/proj/a.txt", "/proj/b.txt"),
            ],
        );

        let report = fx
            .pipeline(Direction::LeftToRight, PathMapper::default())
            .run_pass(&SessionControl::new())
            .unwrap();
        assert_eq!(report.applied, 2);
        assert!(fx.right.item_at_path("/proj/b.txt").is_some());
        assert!(fx.right.item_at_path("/proj/a.txt").is_none());
    }

    #[test]
    fn test_invalid_path_blocks_only_its_group() {
        let fx = Fixture::new(SessionKind::OneWay);
        fx.left.commit("alice", vec![ChangeEntry::add("w", "/proj/weird\\path")]);
        fx.left.commit("alice", vec![ChangeEntry::add("ok", "/proj/fine.txt")]);

        let report = fx
            .pipeline(Direction::LeftToRight, PathMapper::default())
            .run_pass(&SessionControl::new())
            .unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.blocked_groups, 1);
        // Cursor stays below the blocked group
        assert_eq!(report.cursor, 0);

        let unresolved = fx.services.conflicts.list_unresolved(Some(fx.session.id)).unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].conflict_type, INVALID_PATH);
        assert_eq!(unresolved[0].change_group, "cs1");
    }

    #[test]
    fn test_unmapped_path_resolved_by_retarget_rule() {
        let fx = Fixture::new(SessionKind::OneWay);
        let mut params = HashMap::new();
        params.insert("from_prefix".to_string(), "/legacy".to_string());
        params.insert("to_prefix".to_string(), "/proj/legacy".to_string());
        fx.services
            .conflicts
            .add_rule(ResolutionRule {
                id: "legacy".to_string(),
                conflict_type: "path_translation".to_string(),
                scope: "/legacy".to_string(),
                description: "move legacy tree".to_string(),
                action: ResolutionAction::Retarget,
                params,
            })
            .unwrap();
        fx.left.commit("alice", vec![ChangeEntry::add("l1", "/legacy/old.txt")]);

        let mapper = PathMapper::new(vec![PathMapping::new("/proj", "/mirror").unwrap()]);
        let report = fx
            .pipeline(Direction::LeftToRight, mapper)
            .run_pass(&SessionControl::new())
            .unwrap();

        assert_eq!(report.resolved, 1);
        assert_eq!(report.applied, 1);
        assert!(fx.right.item_at_path("/mirror/legacy/old.txt").is_some());
        assert!(fx.services.conflicts.list_unresolved(None).unwrap().is_empty());
    }

    #[test]
    fn test_later_group_on_blocked_path_is_held() {
        let fx = Fixture::new(SessionKind::OneWay);
        let mapper = PathMapper::new(vec![PathMapping::new("/proj", "/proj").unwrap()]);
        fx.left.commit("alice", vec![ChangeEntry::add("x", "/other/x.txt")]);
        fx.left.commit("alice", vec![ChangeEntry::edit("x", "/other/x.txt")]);
        fx.left.commit("alice", vec![ChangeEntry::add("y", "/proj/y.txt")]);

        let report = fx
            .pipeline(Direction::LeftToRight, mapper)
            .run_pass(&SessionControl::new())
            .unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.held_groups, 1);
        assert_eq!(report.applied, 1);
        // Only one conflict recorded for the item
        assert_eq!(fx.services.conflicts.list_unresolved(None).unwrap().len(), 1);
    }

    #[test]
    fn test_cloaked_entries_are_dropped() {
        let fx = Fixture::new(SessionKind::OneWay);
        fx.left.commit(
            "alice",
            vec![
                ChangeEntry::add("b", "/proj/bin/tool.exe"),
                ChangeEntry::add("s", "/proj/src/main.rs"),
            ],
        );
        let mapper = PathMapper::default()
            .with_cloak(&["/proj/bin".to_string()])
            .unwrap();

        let report = fx
            .pipeline(Direction::LeftToRight, mapper)
            .run_pass(&SessionControl::new())
            .unwrap();
        assert_eq!(report.cloaked, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(fx.services.conflicts.list_unresolved(None).unwrap().len(), 0);
    }

    #[test]
    fn test_unknown_owner_gets_default_identity() {
        let fx = Fixture::with_options(SessionKind::OneWay, Some("MIGRATION\\svc"), None);
        fx.services.identities.register(
            uuid::Uuid::new_v4(),
            Arc::new(crate::identity::FieldMappingProvider::new(
                "domains",
                crate::identity::IdentityField::Domain,
                vec![crate::identity::FieldMappingRule {
                    direction: crate::identity::MappingDirection::LeftToRight,
                    left: "CORP".to_string(),
                    right: "EXT".to_string(),
                    kind: crate::identity::MappingKind::SimpleReplacement,
                }],
            )),
        );
        fx.left.commit("DOMAIN\\alice", vec![ChangeEntry::add("a", "/a.txt")]);
        fx.left.commit("CORP\\bob", vec![ChangeEntry::add("b", "/b.txt")]);

        fx.pipeline(Direction::LeftToRight, PathMapper::default())
            .run_pass(&SessionControl::new())
            .unwrap();

        assert_eq!(
            fx.right.item_at_path("/a.txt").unwrap().owner.as_deref(),
            Some("MIGRATION\\svc")
        );
        assert_eq!(
            fx.right.item_at_path("/b.txt").unwrap().owner.as_deref(),
            Some("EXT\\bob")
        );
    }

    #[test]
    fn test_rejected_apply_raises_conflict() {
        let fx = Fixture::new(SessionKind::OneWay);
        fx.left.commit("alice", vec![ChangeEntry::add("a", "/a.txt")]);
        fx.right.fail_next_apply(AdapterError::Rejected("locked".to_string()));

        let report = fx
            .pipeline(Direction::LeftToRight, PathMapper::default())
            .run_pass(&SessionControl::new())
            .unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.applied, 0);

        let conflict = &fx.services.conflicts.list_unresolved(None).unwrap()[0];
        assert_eq!(conflict.conflict_type, APPLY_REJECTED);

        // Operator forces it through
        fx.services
            .conflicts
            .resolve_manually(conflict.id, Disposition::Force, false)
            .unwrap();
        let report = fx
            .pipeline(Direction::LeftToRight, PathMapper::default())
            .run_pass(&SessionControl::new())
            .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.cursor, 1);
    }

    #[test]
    fn test_fatal_adapter_error_propagates() {
        let fx = Fixture::new(SessionKind::OneWay);
        fx.left.commit("alice", vec![ChangeEntry::add("a", "/a.txt")]);
        fx.right.fail_next_apply(AdapterError::Fatal {
            fault: AdapterFault::Authentication,
            message: "expired".to_string(),
        });

        let err = fx
            .pipeline(Direction::LeftToRight, PathMapper::default())
            .run_pass(&SessionControl::new())
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(fx.watermark(Direction::LeftToRight, "a"), None);
    }

    #[test]
    fn test_two_way_echoes_are_suppressed() {
        let fx = Fixture::new(SessionKind::TwoWay);
        fx.left.commit("alice", vec![ChangeEntry::add("a", "/a.txt")]);

        let l2r = fx.pipeline(Direction::LeftToRight, PathMapper::default());
        let r2l = fx.pipeline(Direction::RightToLeft, PathMapper::default());
        let control = SessionControl::new();

        assert_eq!(l2r.run_pass(&control).unwrap().applied, 1);
        assert_eq!(r2l.pending_changes().unwrap(), 0);
        let back = r2l.run_pass(&control).unwrap();
        assert_eq!(back.applied, 0);
        assert_eq!(back.echoes, 1);
        assert_eq!(fx.left.head_sequence(), 1);
    }

    #[test]
    fn test_two_way_edit_edit_conflict() {
        let fx = Fixture::new(SessionKind::TwoWay);
        let control = SessionControl::new();
        fx.left.commit("alice", vec![ChangeEntry::add("a", "/a.txt")]);
        let l2r = fx.pipeline(Direction::LeftToRight, PathMapper::default());
        l2r.run_pass(&control).unwrap();
        let target_item = fx.right.item_at_path("/a.txt").unwrap().item_id;

        // Both sides edit before the right side is synced back
        fx.right.commit("bob", vec![ChangeEntry::edit(&target_item, "/a.txt")]);
        fx.left.commit("alice", vec![ChangeEntry::edit("a", "/a.txt")]);

        let report = l2r.run_pass(&control).unwrap();
        assert_eq!(report.conflicts, 1);
        let conflicts = fx.services.conflicts.list_unresolved(None).unwrap();
        assert_eq!(conflicts[0].conflict_type, EDIT_EDIT);
        assert_eq!(conflicts[0].status, ConflictStatus::Unresolved);
    }

    #[test]
    fn test_annotation_labels_are_not_echoed_back() {
        let fx = Fixture::with_options(SessionKind::TwoWay, None, Some("migrated-{group}"));
        let control = SessionControl::new();
        fx.left.commit("alice", vec![ChangeEntry::add("a", "/a.txt")]);

        let report = fx
            .pipeline(Direction::LeftToRight, PathMapper::default())
            .run_pass(&control)
            .unwrap();
        assert_eq!(report.annotations, 1);

        let labels: Vec<String> = fx
            .right
            .history()
            .iter()
            .flat_map(|c| c.entries.iter().filter_map(|e| e.label.clone()))
            .collect();
        assert_eq!(labels, vec!["migrated-cs1".to_string()]);

        let back = fx
            .pipeline(Direction::RightToLeft, PathMapper::default())
            .run_pass(&control)
            .unwrap();
        assert_eq!(back.echoes, 2);
        assert_eq!(back.applied, 0);
    }

    #[test]
    fn test_stop_and_abort_requests() {
        let fx = Fixture::new(SessionKind::OneWay);
        fx.left.commit("alice", vec![ChangeEntry::add("a", "/a.txt")]);

        let control = SessionControl::new();
        control.request_stop();
        let report = fx
            .pipeline(Direction::LeftToRight, PathMapper::default())
            .run_pass(&control)
            .unwrap();
        assert!(report.stopped);
        assert_eq!(report.applied, 0);

        let control = SessionControl::new();
        control.request_abort();
        let report = fx
            .pipeline(Direction::LeftToRight, PathMapper::default())
            .run_pass(&control)
            .unwrap();
        assert!(report.aborted);
    }

    #[test]
    fn test_chained_sessions_do_not_share_echoes() {
        // left -> mid -> right through two one-way sessions on shared services
        let fx = Fixture::new(SessionKind::OneWay);
        let mid = Arc::new(MemoryEndpoint::new("mid"));
        let first = SessionRecord::new("first", SessionKind::OneWay, "left", "mid");
        let second = SessionRecord::new("second", SessionKind::OneWay, "mid", "right");
        fx.services.db.upsert_session(&first).unwrap();
        fx.services.db.upsert_session(&second).unwrap();

        let upstream = ActionPipeline::new(
            first.clone(),
            Direction::LeftToRight,
            fx.left.clone(),
            mid.clone(),
            PathMapper::default(),
            Arc::clone(&fx.services),
        );
        let downstream = ActionPipeline::new(
            second.clone(),
            Direction::LeftToRight,
            mid.clone(),
            fx.right.clone(),
            PathMapper::default(),
            Arc::clone(&fx.services),
        );

        fx.left.commit("alice", vec![ChangeEntry::add("f", "/f.txt")]);
        let report = upstream.run_pass(&SessionControl::new()).unwrap();
        assert_eq!(report.applied, 1);

        // The write into mid belongs to the first session, not the second
        let report = downstream.run_pass(&SessionControl::new()).unwrap();
        assert_eq!(report.echoes, 0);
        assert_eq!(report.applied, 1);
        assert!(fx.right.item_at_path("/f.txt").is_some());

        let mid_item = mid.item_at_path("/f.txt").unwrap().item_id;
        assert_eq!(
            fx.services.links.counterpart(first.id, "mid", &mid_item),
            Some(("left".to_string(), "f".to_string()))
        );
        assert_eq!(
            fx.services.links.counterpart(second.id, "mid", &mid_item).map(|(endpoint, _)| endpoint),
            Some("right".to_string())
        );
    }
}
