//! In-memory reference endpoint
//!
//! A versioned item store that behaves like a small version control server:
//! every commit (local or applied by the engine) gets the next sequence number,
//! and an item's revision is the sequence of the last change that touched it.
//! Used by tests and demos, and as the template for real adapters.

use super::{
    AdapterError, AdapterResult, ApplyOutcome, Capability, EndpointAdapter, ProviderDescriptor,
    TranslatedAction,
};
use crate::translation::ServerPathTranslator;
use crate::types::{ActionKind, ChangeEntry, ChangeSummary, EndpointChange, FieldSet};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

type ApplyHook = Box<dyn Fn(&TranslatedAction) + Send + Sync>;

/// Current state of one item.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryItem {
    pub item_id: String,
    pub path: String,
    pub revision: u64,
    pub deleted: bool,
    pub fields: FieldSet,
    pub owner: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    next_sequence: u64,
    next_item: u64,
    history: Vec<EndpointChange>,
    items: HashMap<String, MemoryItem>,
    applied: HashMap<String, ApplyOutcome>,
    apply_calls: usize,
    apply_failures: VecDeque<AdapterError>,
    read_failures: VecDeque<AdapterError>,
}

impl MemoryState {
    fn record(
        &mut self,
        owner: Option<String>,
        committed_at: DateTime<Utc>,
        comment: Option<String>,
        entries: Vec<ChangeEntry>,
    ) -> u64 {
        self.next_sequence += 1;
        let sequence = self.next_sequence;

        for entry in &entries {
            let item = self
                .items
                .entry(entry.item_id.clone())
                .or_insert_with(|| MemoryItem {
                    item_id: entry.item_id.clone(),
                    path: entry.native_path.clone(),
                    revision: sequence,
                    deleted: false,
                    fields: FieldSet::default(),
                    owner: None,
                });
            item.path = entry.native_path.clone();
            item.revision = sequence;
            item.deleted = entry.kind == ActionKind::Delete;
            item.owner = owner.clone();
            if !entry.fields.is_empty() {
                item.fields = entry.fields.clone();
            }
        }

        self.history.push(EndpointChange {
            change_id: format!("cs{}", sequence),
            sequence,
            owner,
            committed_at,
            comment,
            entries,
        });
        sequence
    }

    fn live_item_at(&self, path: &str) -> Option<&MemoryItem> {
        self.items.values().find(|i| !i.deleted && i.path == path)
    }
}

/// In-memory versioned endpoint.
pub struct MemoryEndpoint {
    descriptor: ProviderDescriptor,
    capabilities: Vec<Capability>,
    translator: Option<Arc<dyn ServerPathTranslator>>,
    state: Mutex<MemoryState>,
    on_apply: Mutex<Option<ApplyHook>>,
}

impl MemoryEndpoint {
    /// Create an endpoint with a fresh provider id and every capability.
    pub fn new(name: &str) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    pub fn with_id(id: Uuid, name: &str) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id,
                name: name.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            capabilities: vec![
                Capability::ChangeSource,
                Capability::ChangeTarget,
                Capability::Diff,
            ],
            translator: None,
            state: Mutex::new(MemoryState::default()),
            on_apply: Mutex::new(None),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_translator(mut self, translator: Arc<dyn ServerPathTranslator>) -> Self {
        self.translator = Some(translator);
        if !self.capabilities.contains(&Capability::PathTranslation) {
            self.capabilities.push(Capability::PathTranslation);
        }
        self
    }

    /// Commit a local change (not produced by the engine).
    ///
    /// Returns the new sequence number.
    pub fn commit(&self, owner: &str, entries: Vec<ChangeEntry>) -> u64 {
        self.commit_at(owner, Utc::now(), entries)
    }

    /// Commit a local change with an explicit timestamp.
    pub fn commit_at(&self, owner: &str, at: DateTime<Utc>, entries: Vec<ChangeEntry>) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.record(Some(owner.to_string()), at, None, entries)
    }

    /// Make the next `apply` call fail with `error`.
    pub fn fail_next_apply(&self, error: AdapterError) {
        self.state.lock().unwrap().apply_failures.push_back(error);
    }

    /// Make the next read (`changes_since` or `summarize`) fail with `error`.
    pub fn fail_next_read(&self, error: AdapterError) {
        self.state.lock().unwrap().read_failures.push_back(error);
    }

    /// Run `hook` after every successful apply.
    pub fn on_apply(&self, hook: impl Fn(&TranslatedAction) + Send + Sync + 'static) {
        *self.on_apply.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn item(&self, item_id: &str) -> Option<MemoryItem> {
        self.state.lock().unwrap().items.get(item_id).cloned()
    }

    /// Live (not deleted) item currently at `path`.
    pub fn item_at_path(&self, path: &str) -> Option<MemoryItem> {
        self.state.lock().unwrap().live_item_at(path).cloned()
    }

    /// Number of `apply` calls received, including failed and repeated ones.
    pub fn apply_calls(&self) -> usize {
        self.state.lock().unwrap().apply_calls
    }

    /// Number of distinct actions that produced a revision.
    pub fn applied_count(&self) -> usize {
        self.state.lock().unwrap().applied.len()
    }

    pub fn head_sequence(&self) -> u64 {
        self.state.lock().unwrap().next_sequence
    }

    pub fn history(&self) -> Vec<EndpointChange> {
        self.state.lock().unwrap().history.clone()
    }
}

fn under_scope(path: &str, scope: &str) -> bool {
    if scope.is_empty() || scope == "/" || path == scope {
        return true;
    }
    match path.strip_prefix(scope) {
        Some(rest) => {
            scope.ends_with(['/', '\\']) || rest.starts_with(['/', '\\'])
        }
        None => false,
    }
}

impl EndpointAdapter for MemoryEndpoint {
    fn descriptor(&self) -> ProviderDescriptor {
        self.descriptor.clone()
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.clone()
    }

    fn changes_since(&self, after_sequence: u64) -> AdapterResult<Vec<EndpointChange>> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.read_failures.pop_front() {
            return Err(err);
        }
        Ok(state
            .history
            .iter()
            .filter(|c| c.sequence > after_sequence)
            .cloned()
            .collect())
    }

    fn apply(&self, action: &TranslatedAction) -> AdapterResult<ApplyOutcome> {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            state.apply_calls += 1;

            if let Some(err) = state.apply_failures.pop_front() {
                return Err(err);
            }
            if let Some(done) = state.applied.get(&action.fingerprint) {
                return Ok(done.clone());
            }

            let kind = action.source.kind;
            let existing = action
                .target_item_id
                .clone()
                .filter(|id| state.items.contains_key(id))
                .or_else(|| {
                    let lookup = action
                        .target_from_path
                        .as_deref()
                        .filter(|_| kind == ActionKind::Rename)
                        .unwrap_or(&action.target_path);
                    state.live_item_at(lookup).map(|i| i.item_id.clone())
                });

            let item_id = match (kind, existing) {
                (ActionKind::Add | ActionKind::Branch, None) => {
                    state.next_item += 1;
                    format!("{}-{}", self.descriptor.name, state.next_item)
                }
                (ActionKind::Add | ActionKind::Branch, Some(id)) if !action.force => {
                    return Err(AdapterError::Rejected(format!(
                        "item {} already exists at {}",
                        id, action.target_path
                    )));
                }
                (_, Some(id)) => id,
                (ActionKind::Delete | ActionKind::Rename, None) => {
                    return Err(AdapterError::Rejected(format!(
                        "no item at {}",
                        action.target_path
                    )));
                }
                (_, None) => {
                    state.next_item += 1;
                    format!("{}-{}", self.descriptor.name, state.next_item)
                }
            };

            let entry = ChangeEntry {
                kind,
                item_id: item_id.clone(),
                native_path: action.target_path.clone(),
                from_native_path: action.target_from_path.clone(),
                recursive: action.source.recursive,
                fields: action.source.fields.clone(),
                label: action.source.label.clone(),
            };
            let revision = state.record(
                action.owner.clone(),
                Utc::now(),
                Some(format!("migrated {}", action.source.change_group)),
                vec![entry],
            );

            let outcome = ApplyOutcome {
                target_item_id: item_id,
                target_revision: revision,
            };
            state
                .applied
                .insert(action.fingerprint.clone(), outcome.clone());
            outcome
        };

        if let Some(hook) = self.on_apply.lock().unwrap().as_ref() {
            hook(action);
        }
        Ok(outcome)
    }

    fn latest_revision(&self, item_id: &str) -> AdapterResult<Option<u64>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .items
            .get(item_id)
            .map(|i| i.revision))
    }

    fn summarize(
        &self,
        native_scope: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AdapterResult<ChangeSummary> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.read_failures.pop_front() {
            return Err(err);
        }
        Ok(state
            .history
            .iter()
            .filter(|c| c.committed_at >= from && c.committed_at < to)
            .filter(|c| {
                c.entries
                    .iter()
                    .any(|e| under_scope(&e.native_path, native_scope))
            })
            .fold(ChangeSummary::empty(), |summary, c| {
                summary.with_change(c.committed_at)
            }))
    }

    fn path_translator(&self) -> Option<Arc<dyn ServerPathTranslator>> {
        self.translator.clone()
    }
}
