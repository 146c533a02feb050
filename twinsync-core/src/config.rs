//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/twinsync/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/twinsync/` (~/.config/twinsync/)
//! - Data: `$XDG_DATA_HOME/twinsync/` (~/.local/share/twinsync/)
//! - State/Logs: `$XDG_STATE_HOME/twinsync/` (~/.local/state/twinsync/)

use crate::conflict::{PathScope, ResolutionRule, TieBreak};
use crate::error::{Error, Result};
use crate::identity::{FieldMappingRule, IdentityField};
use crate::translation::{PathMapper, PathMapping};
use crate::types::SessionKind;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Engine-wide behavior
    #[serde(default)]
    pub engine: EngineConfig,

    /// Backoff for transient adapter failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Periodic diff jobs
    #[serde(default)]
    pub diff: DiffConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Identity lookup providers
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Conflict resolution rules, in registration order
    #[serde(default)]
    pub conflict_rules: Vec<ResolutionRule>,

    /// Configured migration sessions
    #[serde(default)]
    pub sessions: Vec<SessionConfig>,
}

/// Engine configuration
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Owner written to the target when identity lookup finds nothing
    pub default_identity: Option<String>,

    /// What to do when several equally specific rules match
    #[serde(default)]
    pub tie_break: TieBreak,

    /// Worker poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Label applied to the target after each fully applied change group.
    /// `{group}`, `{sequence}` and `{session}` are substituted.
    pub annotation_template: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_identity: None,
            tie_break: TieBreak::default(),
            poll_interval_ms: default_poll_interval(),
            annotation_template: None,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_poll_interval() -> u64 {
    5000
}

/// Retry configuration for transient failures
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Max retry attempts per pass
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Doubles `delay`, capped at `max_delay_ms`.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        std::cmp::min(delay * 2, Duration::from_millis(self.max_delay_ms))
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    30_000
}

/// Diff job configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DiffConfig {
    /// Run diff jobs for every session mapping
    #[serde(default)]
    pub enabled: bool,

    /// Seconds between periodic runs
    #[serde(default = "default_diff_interval")]
    pub interval_secs: u64,

    /// Length of the compared window, ending now
    #[serde(default = "default_diff_window")]
    pub window_hours: u64,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_diff_interval(),
            window_hours: default_diff_window(),
        }
    }
}

fn default_diff_interval() -> u64 {
    3600
}

fn default_diff_window() -> u64 {
    24
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Identity lookup providers
#[derive(Debug, Deserialize, Default)]
pub struct IdentityConfig {
    #[serde(default)]
    pub providers: Vec<IdentityProviderConfig>,
}

/// A field-mapping identity provider
#[derive(Debug, Deserialize, Clone)]
pub struct IdentityProviderConfig {
    /// Stable provider key; reusing it replaces the provider and its cached answers
    pub id: Uuid,
    pub name: String,
    pub field: IdentityField,
    #[serde(default)]
    pub rules: Vec<FieldMappingRule>,
}

/// One configured session
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    pub name: String,
    pub kind: SessionKind,
    /// Provider name of the left endpoint
    pub left: String,
    /// Provider name of the right endpoint
    pub right: String,
    /// Path mappings; none means both sides share one namespace
    #[serde(default)]
    pub mappings: Vec<MappingConfig>,
    /// Glob patterns of canonical paths never migrated
    #[serde(default)]
    pub cloak: Vec<String>,
}

impl SessionConfig {
    /// Build the session's path mapper.
    pub fn path_mapper(&self) -> Result<PathMapper> {
        let mappings = self
            .mappings
            .iter()
            .map(|m| PathMapping::new(&m.left, &m.right))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Config(format!("session {}: {}", self.name, e)))?;
        PathMapper::new(mappings)
            .with_cloak(&self.cloak)
            .map_err(|e| Error::Config(format!("session {}: {}", self.name, e)))
    }
}

/// A left/right canonical path pair
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct MappingConfig {
    pub left: String,
    pub right: String,
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.engine.poll_interval_ms == 0 {
            return Err(Error::Config(
                "engine.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(Error::Config(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        if self.diff.enabled && (self.diff.interval_secs == 0 || self.diff.window_hours == 0) {
            return Err(Error::Config(
                "diff.interval_secs and diff.window_hours must be greater than 0".to_string(),
            ));
        }

        let mut provider_ids = HashSet::new();
        for provider in &self.identity.providers {
            if !provider_ids.insert(provider.id) {
                return Err(Error::Config(format!(
                    "duplicate identity provider id: {}",
                    provider.id
                )));
            }
        }

        let mut rule_ids = HashSet::new();
        for rule in &self.conflict_rules {
            if !rule_ids.insert(rule.id.as_str()) {
                return Err(Error::Config(format!("duplicate conflict rule id: {}", rule.id)));
            }
            PathScope::parse(&rule.scope)
                .map_err(|e| Error::Config(format!("conflict rule {}: {}", rule.id, e)))?;
        }

        let mut names = HashSet::new();
        for session in &self.sessions {
            if !names.insert(session.name.as_str()) {
                return Err(Error::Config(format!("duplicate session name: {}", session.name)));
            }
            if session.left == session.right {
                return Err(Error::Config(format!(
                    "session {}: left and right endpoints must differ",
                    session.name
                )));
            }
            session.path_mapper()?;
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/twinsync/config.toml` (~/.config/twinsync/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("twinsync").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/twinsync/` (~/.local/share/twinsync/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("twinsync")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/twinsync/` (~/.local/state/twinsync/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("twinsync")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/twinsync/state.db` (~/.local/share/twinsync/state.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("state.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/twinsync/twinsync.log` (~/.local/state/twinsync/twinsync.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("twinsync.log")
    }
}
