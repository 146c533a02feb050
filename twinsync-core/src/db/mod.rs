//! Database layer for twinsync
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Repository pattern for queries
//! - The watermark store the pipeline commits through

pub mod repo;
pub mod schema;

pub use repo::{ActionCommit, Database, RunRecord, SessionRecord};

use crate::error::Result;
use crate::types::{Direction, Watermark};
use uuid::Uuid;

/// Durable per-item watermarks.
///
/// `commit_action` is the single atomic unit of the pipeline: the watermark
/// advance, the applied-action record and the artifact link land together
/// or not at all.
pub trait WatermarkStore: Send + Sync {
    fn watermark(&self, session_id: Uuid, direction: Direction, item_id: &str) -> Result<Option<Watermark>>;

    /// Commit one action outcome. Fails with `StateInconsistency` if the
    /// stored watermark is already past the action's revision.
    fn commit_action(&self, commit: &ActionCommit) -> Result<Watermark>;
}
