//! Endpoint adapter contract
//!
//! Each external system (version control server, work item tracker) is reached
//! through an implementation of [`EndpointAdapter`]. The engine never speaks a
//! wire protocol itself; it only consumes changes in endpoint-native form and
//! hands translated actions back for application.
//!
//! ## Error classes
//!
//! Adapters report failures with [`AdapterError`]:
//! - `Transient`: network blips, timeouts. Retried at the pass boundary.
//! - `Rejected`: the target refused one action. Raised as an `apply_rejected`
//!   conflict; the rest of the batch continues.
//! - `Fatal`: authentication, privilege, missing dependency or failed
//!   initialization. The owning session is marked faulted.

pub mod memory;

use crate::translation::ServerPathTranslator;
use crate::types::{ChangeSummary, EndpointChange, MigrationAction};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryEndpoint;

/// Category of an unrecoverable adapter failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterFault {
    Authentication,
    Privilege,
    MissingDependency,
    Initialization,
}

impl AdapterFault {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterFault::Authentication => "authentication",
            AdapterFault::Privilege => "privilege",
            AdapterFault::MissingDependency => "missing_dependency",
            AdapterFault::Initialization => "initialization",
        }
    }
}

impl std::fmt::Display for AdapterFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure reported by an endpoint adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Temporary failure; the same request may succeed later
    #[error("transient failure: {0}")]
    Transient(String),

    /// The target refused this particular action
    #[error("action rejected: {0}")]
    Rejected(String),

    /// The endpoint cannot be used until an operator intervenes
    #[error("{fault} failure: {message}")]
    Fatal { fault: AdapterFault, message: String },
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, AdapterError::Fatal { .. })
    }
}

/// Result type for adapter calls
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Identity of a registered provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDescriptor {
    pub id: Uuid,
    pub name: String,
    pub version: String,
}

/// What a provider is able to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Reports changes (can be a session source)
    ChangeSource,
    /// Accepts translated actions (can be a session target)
    ChangeTarget,
    /// Ships its own server path translator
    PathTranslation,
    /// Answers change summary queries for diff jobs
    Diff,
}

/// Action ready to be applied to a target endpoint.
///
/// Paths are in the target's native form. `target_item_id` is the linked
/// counterpart on the target when the item has been migrated before.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedAction {
    /// Canonical source action this was derived from
    pub source: MigrationAction,
    pub target_path: String,
    pub target_from_path: Option<String>,
    pub target_item_id: Option<String>,
    /// Owner as known on the target endpoint
    pub owner: Option<String>,
    /// Fingerprint of the source action; adapters use it to make apply idempotent
    pub fingerprint: String,
    /// Bypass the target's own conflict checks (forced resolution)
    pub force: bool,
}

/// What the target reports after a successful apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub target_item_id: String,
    pub target_revision: u64,
}

/// Contract every endpoint adapter implements.
///
/// Adapters are shared across sessions and worker threads.
pub trait EndpointAdapter: Send + Sync {
    fn descriptor(&self) -> ProviderDescriptor;

    fn capabilities(&self) -> Vec<Capability>;

    fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Changes with a sequence greater than `after_sequence`, oldest first.
    fn changes_since(&self, after_sequence: u64) -> AdapterResult<Vec<EndpointChange>>;

    /// Apply one translated action.
    ///
    /// Applying the same fingerprint twice must not produce a second revision.
    fn apply(&self, action: &TranslatedAction) -> AdapterResult<ApplyOutcome>;

    /// Latest revision of an item on this endpoint, if the item exists.
    fn latest_revision(&self, _item_id: &str) -> AdapterResult<Option<u64>> {
        Ok(None)
    }

    /// Summary of changes under `native_scope` committed in `[from, to)`.
    fn summarize(
        &self,
        native_scope: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AdapterResult<ChangeSummary>;

    /// Endpoint-specific path translator; `None` means unix-style.
    fn path_translator(&self) -> Option<Arc<dyn ServerPathTranslator>> {
        None
    }
}

/// Outcome of registering a provider under a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Added,
    /// An earlier provider under the same key was replaced
    Replaced { previous: String },
}

/// Registry of endpoint adapters keyed by provider id.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<Uuid, Arc<dyn EndpointAdapter>>,
    order: Vec<Uuid>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter; a provider with the same id is replaced.
    pub fn register(&mut self, adapter: Arc<dyn EndpointAdapter>) -> Registration {
        let descriptor = adapter.descriptor();
        match self.providers.insert(descriptor.id, adapter) {
            Some(previous) => {
                let previous = previous.descriptor();
                tracing::warn!(
                    provider_id = %descriptor.id,
                    provider = %descriptor.name,
                    previous = %previous.name,
                    "Replaced endpoint provider"
                );
                Registration::Replaced {
                    previous: previous.name,
                }
            }
            None => {
                tracing::info!(
                    provider_id = %descriptor.id,
                    provider = %descriptor.name,
                    version = %descriptor.version,
                    "Registered endpoint provider"
                );
                self.order.push(descriptor.id);
                Registration::Added
            }
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<dyn EndpointAdapter>> {
        self.providers.get(id).cloned()
    }

    /// Look up a provider by its descriptor name.
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn EndpointAdapter>> {
        self.order
            .iter()
            .filter_map(|id| self.providers.get(id))
            .find(|p| p.descriptor().name == name)
            .cloned()
    }

    /// Providers advertising a capability, in registration order.
    pub fn with_capability(&self, capability: Capability) -> Vec<Arc<dyn EndpointAdapter>> {
        self.order
            .iter()
            .filter_map(|id| self.providers.get(id))
            .filter(|p| p.has_capability(capability))
            .cloned()
            .collect()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|id| self.providers.get(id))
            .map(|p| p.descriptor().name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
