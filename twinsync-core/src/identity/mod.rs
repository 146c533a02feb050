//! Identity translation
//!
//! Maps a user identity known on the source endpoint to the identity the
//! target endpoint knows. Lookups go through registered providers in
//! registration order; the first provider that knows the identity wins.
//!
//! A lookup that nobody can answer is not an error: it returns
//! [`LookupResult::NotFound`] and the caller applies its default identity
//! policy.

mod field_mapping;

pub use field_mapping::{FieldMappingProvider, FieldMappingRule, IdentityField, MappingDirection, MappingKind};

use crate::adapter::Registration;
use crate::types::{Direction, RichIdentity};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

/// Where a lookup happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupContext {
    pub session_id: Uuid,
    pub direction: Direction,
    pub source_endpoint: String,
    pub target_endpoint: String,
}

/// Outcome of a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    Found(RichIdentity),
    NotFound,
}

impl LookupResult {
    pub fn found(self) -> Option<RichIdentity> {
        match self {
            LookupResult::Found(identity) => Some(identity),
            LookupResult::NotFound => None,
        }
    }
}

/// A source of identity translations.
pub trait IdentityLookupProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Translate `identity`, or `None` if this provider does not know it.
    fn try_lookup(&self, identity: &RichIdentity, context: &LookupContext) -> Option<RichIdentity>;
}

type CacheKey = (Uuid, Direction, String);

#[derive(Debug, Clone)]
struct CacheEntry {
    /// Provider that produced the answer; `None` for negative entries
    provider: Option<Uuid>,
    identity: Option<RichIdentity>,
}

#[derive(Default)]
struct Providers {
    by_key: HashMap<Uuid, Arc<dyn IdentityLookupProvider>>,
    order: Vec<Uuid>,
}

/// Shared identity lookup service.
///
/// Safe to use from every session worker at once. Provider calls happen
/// outside of any lock.
#[derive(Default)]
pub struct IdentityLookupService {
    providers: RwLock<Providers>,
    cache: Mutex<HashMap<CacheKey, CacheEntry>>,
    /// Bumped on every registration, under the cache lock
    generation: AtomicU64,
}

impl IdentityLookupService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under a stable key.
    ///
    /// Re-registering a key replaces the earlier provider, reports it, and
    /// drops every cached answer the earlier provider produced.
    pub fn register(&self, key: Uuid, provider: Arc<dyn IdentityLookupProvider>) -> Registration {
        let name = provider.name().to_string();
        let previous = {
            let mut providers = self.providers.write().unwrap();
            let previous = providers.by_key.insert(key, provider);
            if previous.is_none() {
                providers.order.push(key);
            }
            previous
        };

        // Negative answers may change with any new provider
        {
            let mut cache = self.cache.lock().unwrap();
            self.generation.fetch_add(1, Ordering::SeqCst);
            cache.retain(|_, entry| entry.provider.is_some() && entry.provider != Some(key));
        }

        match previous {
            Some(previous) => {
                tracing::warn!(
                    provider_key = %key,
                    provider = %name,
                    previous = %previous.name(),
                    "Replaced identity lookup provider"
                );
                Registration::Replaced {
                    previous: previous.name().to_string(),
                }
            }
            None => {
                tracing::info!(provider_key = %key, provider = %name, "Registered identity lookup provider");
                Registration::Added
            }
        }
    }

    pub fn provider_count(&self) -> usize {
        self.providers.read().unwrap().order.len()
    }

    /// Translate an identity for the given context.
    ///
    /// With no providers registered, identities pass through unchanged.
    pub fn try_lookup(&self, identity: &RichIdentity, context: &LookupContext) -> LookupResult {
        let cache_key = (
            context.session_id,
            context.direction,
            identity.qualified_name().to_lowercase(),
        );
        if let Some(entry) = self.cache.lock().unwrap().get(&cache_key) {
            return match &entry.identity {
                Some(found) => LookupResult::Found(found.clone()),
                None => LookupResult::NotFound,
            };
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let providers: Vec<(Uuid, Arc<dyn IdentityLookupProvider>)> = {
            let providers = self.providers.read().unwrap();
            providers
                .order
                .iter()
                .filter_map(|key| providers.by_key.get(key).map(|p| (*key, Arc::clone(p))))
                .collect()
        };
        if providers.is_empty() {
            return LookupResult::Found(identity.clone());
        }

        let answer = providers
            .iter()
            .find_map(|(key, provider)| provider.try_lookup(identity, context).map(|found| (*key, found)));

        let entry = match &answer {
            Some((key, found)) => CacheEntry {
                provider: Some(*key),
                identity: Some(found.clone()),
            },
            None => {
                tracing::debug!(
                    identity = %identity.qualified_name(),
                    session_id = %context.session_id,
                    direction = %context.direction,
                    "Identity not found by any provider"
                );
                CacheEntry {
                    provider: None,
                    identity: None,
                }
            }
        };
        {
            let mut cache = self.cache.lock().unwrap();
            // A registration during the lookup may have made this answer stale
            if self.generation.load(Ordering::SeqCst) == generation {
                cache.insert(cache_key, entry);
            } else {
                tracing::debug!(
                    identity = %identity.qualified_name(),
                    "Providers changed during lookup; answer not cached"
                );
            }
        }

        match answer {
            Some((_, found)) => LookupResult::Found(found),
            None => LookupResult::NotFound,
        }
    }

    /// Drop every cached answer for one session.
    pub fn invalidate_session(&self, session_id: Uuid) {
        self.cache
            .lock()
            .unwrap()
            .retain(|(session, _, _), _| *session != session_id);
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}
