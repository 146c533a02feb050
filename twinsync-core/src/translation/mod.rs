//! Path and artifact translation
//!
//! Canonical paths are the only path form used inside the pipeline. They are
//! converted from endpoint-native form when changes are normalized and back
//! to native form just before apply.
//!
//! A canonical path:
//! - starts with `/`
//! - uses `/` as the only separator
//! - has no empty, `.` or `..` segments
//! - contains no backslash or control characters
//!
//! `/` alone is the root.

mod links;
mod paths;

pub use links::{ArtifactLink, ArtifactLinkService};
pub use paths::{PathMapper, PathMapping, SeparatorPathTranslator, ServerPathTranslator};

use thiserror::Error;

/// Failure to express a path in another namespace.
///
/// Both variants are recoverable; the pipeline raises them as conflicts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslationError {
    /// No mapping covers the path
    #[error("path not mapped: {path}")]
    PathNotMapped { path: String },

    /// The path is malformed for the namespace it claims to be in
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },
}

impl TranslationError {
    /// Conflict type tag this error is raised as.
    pub fn conflict_type(&self) -> &'static str {
        match self {
            TranslationError::PathNotMapped { .. } => "path_translation",
            TranslationError::InvalidPath { .. } => "invalid_path",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            TranslationError::PathNotMapped { path } | TranslationError::InvalidPath { path, .. } => {
                path
            }
        }
    }
}

fn invalid(path: &str, reason: &str) -> TranslationError {
    TranslationError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Check that `path` is a well-formed canonical path.
pub fn validate_canonical(path: &str) -> Result<(), TranslationError> {
    if !path.starts_with('/') {
        return Err(invalid(path, "must start with '/'"));
    }
    if path.contains('\\') {
        return Err(invalid(path, "contains a backslash"));
    }
    if path.chars().any(char::is_control) {
        return Err(invalid(path, "contains a control character"));
    }
    if path == "/" {
        return Ok(());
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return Err(invalid(path, "contains an empty segment")),
            "." | ".." => return Err(invalid(path, "contains a relative segment")),
            _ => {}
        }
    }
    Ok(())
}

/// Segments of a canonical (or scope) path; root and empty have none.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Whether `path` lies at or below `scope`, comparing segments
/// case-insensitively. An empty or `/` scope contains everything.
pub fn path_within(path: &str, scope: &str) -> bool {
    let mut path_segments = segments(path);
    segments(scope).all(|scope_segment| {
        path_segments
            .next()
            .map(|p| p.to_lowercase() == scope_segment.to_lowercase())
            .unwrap_or(false)
    })
}

/// Replace the `from` prefix of `path` with `to`.
///
/// Callers check [`path_within`] first; `None` if `from` does not apply.
pub fn replace_prefix(path: &str, from: &str, to: &str) -> Option<String> {
    if !path_within(path, from) {
        return None;
    }
    let skip = segments(from).count();
    let rest: Vec<&str> = segments(path).skip(skip).collect();
    let base = to.trim_end_matches('/');
    if rest.is_empty() {
        Some(if base.is_empty() { "/".to_string() } else { base.to_string() })
    } else {
        Some(format!("{}/{}", base, rest.join("/")))
    }
}
