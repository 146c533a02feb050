//! # twinsync-core
//!
//! Migration session engine: keeps two heterogeneous endpoints in step by
//! replaying each side's changes on the other exactly once.
//!
//! This library provides:
//! - Value types for actions, watermarks, identities and artifacts
//! - Identity and path translation between endpoint namespaces
//! - A conflict manager with rule-based resolution
//! - The resumable action pipeline and one-way / two-way sessions
//! - A session scheduler and non-mutating diff jobs
//! - SQLite persistence, configuration and logging
//!
//! ## Architecture
//!
//! Each session direction runs a pipeline:
//! - **Normalize:** endpoint changes become canonical actions in source order
//! - **Translate:** paths and identities are mapped to the target namespace
//! - **Apply:** the target applies the action; the watermark, applied record
//!   and artifact link are committed together
//!
//! A crash or abort between apply and commit is repaired by the next pass,
//! which redoes the action; adapters apply idempotently by fingerprint.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use twinsync_core::adapter::{MemoryEndpoint, ProviderRegistry};
//! use twinsync_core::{Config, MigrationEngine};
//!
//! let config = Config::load().expect("failed to load config");
//!
//! let mut registry = ProviderRegistry::new();
//! registry.register(Arc::new(MemoryEndpoint::new("left")));
//! registry.register(Arc::new(MemoryEndpoint::new("right")));
//!
//! let engine = MigrationEngine::open(&config, registry).expect("failed to build engine");
//! for (session, result) in engine.scheduler().synchronize_all() {
//!     println!("{}: {:?}", session, result.map(|r| r.applied));
//! }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::{Database, WatermarkStore};
pub use engine::MigrationEngine;
pub use error::{Error, Result};
pub use pipeline::PassReport;
pub use types::*;

// Public modules
pub mod adapter;
pub mod config;
pub mod conflict;
pub mod db;
pub mod diff;
pub mod engine;
pub mod error;
pub mod identity;
pub mod logging;
pub mod pipeline;
pub mod scheduler;
pub mod session;
pub mod translation;
pub mod types;
