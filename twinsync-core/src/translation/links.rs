//! Artifact link service
//!
//! Remembers, for every item the engine has migrated, which item it became
//! on the other endpoint and which revisions the engine itself produced.
//! The produced set is what lets a two-way session recognize its own echoes.
//!
//! Everything is scoped by session: two sessions sharing an endpoint never
//! see each other's links or produced revisions.

use crate::db::Database;
use crate::error::Result;
use crate::types::ArtifactReference;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Persisted link between a source item revision and the target revision it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactLink {
    pub session_id: Uuid,
    pub source_endpoint: String,
    pub source_item: String,
    pub source_revision: u64,
    pub target_endpoint: String,
    pub target_item: String,
    pub target_revision: u64,
    /// Reference to the target item
    pub reference: ArtifactReference,
    pub created_at: DateTime<Utc>,
}

type ItemKey = (Uuid, String, String);

#[derive(Default)]
struct LinkCache {
    /// Latest link touching each (session, endpoint, item), from either side
    latest: HashMap<ItemKey, ArtifactLink>,
    /// Revisions produced by the engine, per (session, target endpoint, item)
    produced: HashMap<ItemKey, Vec<u64>>,
}

/// Bidirectional (session, endpoint, item) → link map with echo detection.
#[derive(Default)]
pub struct ArtifactLinkService {
    cache: Mutex<LinkCache>,
}

fn key(session_id: Uuid, endpoint: &str, item: &str) -> ItemKey {
    (session_id, endpoint.to_string(), item.to_string())
}

impl ArtifactLinkService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every persisted link into the cache. Returns the number loaded.
    pub fn load(&self, db: &Database) -> Result<usize> {
        let links = db.list_artifact_links()?;
        let count = links.len();
        for link in links {
            self.remember(link);
        }
        tracing::debug!(links = count, "Loaded artifact links");
        Ok(count)
    }

    /// Add a link that has been committed to storage.
    pub fn remember(&self, link: ArtifactLink) {
        let mut cache = self.cache.lock().unwrap();

        cache
            .produced
            .entry(key(link.session_id, &link.target_endpoint, &link.target_item))
            .or_default()
            .push(link.target_revision);

        for side in [
            key(link.session_id, &link.source_endpoint, &link.source_item),
            key(link.session_id, &link.target_endpoint, &link.target_item),
        ] {
            let newer = cache
                .latest
                .get(&side)
                .map(|existing| existing.created_at <= link.created_at)
                .unwrap_or(true);
            if newer {
                cache.latest.insert(side, link.clone());
            }
        }
    }

    /// Latest link touching an item, from either side.
    pub fn link_for(&self, session_id: Uuid, endpoint: &str, item: &str) -> Option<ArtifactLink> {
        self.cache
            .lock()
            .unwrap()
            .latest
            .get(&key(session_id, endpoint, item))
            .cloned()
    }

    /// The item on the other endpoint linked to `(endpoint, item)`.
    ///
    /// `None` means the item has not been migrated yet.
    pub fn counterpart(&self, session_id: Uuid, endpoint: &str, item: &str) -> Option<(String, String)> {
        self.link_for(session_id, endpoint, item).map(|link| {
            if link.source_endpoint == endpoint && link.source_item == item {
                (link.target_endpoint, link.target_item)
            } else {
                (link.source_endpoint, link.source_item)
            }
        })
    }

    /// Whether this revision of an item was written by the engine for this session.
    pub fn is_echo(&self, session_id: Uuid, endpoint: &str, item: &str, revision: u64) -> bool {
        self.cache
            .lock()
            .unwrap()
            .produced
            .get(&key(session_id, endpoint, item))
            .map(|revs| revs.contains(&revision))
            .unwrap_or(false)
    }

    /// Highest revision of an item the engine produced.
    pub fn produced_revision(&self, session_id: Uuid, endpoint: &str, item: &str) -> Option<u64> {
        self.cache
            .lock()
            .unwrap()
            .produced
            .get(&key(session_id, endpoint, item))
            .and_then(|revs| revs.iter().copied().max())
    }

    pub fn len(&self) -> usize {
        self.cache
            .lock()
            .unwrap()
            .produced
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
