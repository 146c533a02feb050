//! Rule applicability scopes
//!
//! Scopes are unix-style paths. The empty scope and `/` apply to everything.
//! A scope contains a path when every scope segment equals the path segment
//! at the same position, ignoring case.

use crate::error::{Error, Result};
use crate::translation::{path_within, segments};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathScope(String);

impl PathScope {
    pub fn parse(scope: &str) -> Result<Self> {
        let scope = scope.trim();
        if !scope.is_empty() && !scope.starts_with('/') {
            return Err(Error::InvalidValue(format!(
                "rule scope must be empty or start with '/': {}",
                scope
            )));
        }
        Ok(Self(scope.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn contains(&self, path: &str) -> bool {
        path_within(path, &self.0)
    }

    /// Number of segments; more segments means more specific.
    pub fn specificity(&self) -> usize {
        segments(&self.0).count()
    }
}
