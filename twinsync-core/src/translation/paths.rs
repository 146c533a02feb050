//! Server path translators and session path mappings

use super::{invalid, path_within, replace_prefix, segments, validate_canonical, TranslationError};
use crate::types::Direction;
use glob::{MatchOptions, Pattern};

/// Converts between an endpoint's native paths and canonical paths.
pub trait ServerPathTranslator: Send + Sync {
    fn to_canonical(&self, native: &str) -> Result<String, TranslationError>;

    fn to_native(&self, canonical: &str) -> Result<String, TranslationError>;
}

/// Translator for native paths that differ from canonical only by a root
/// prefix and a separator character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeparatorPathTranslator {
    root_prefix: String,
    separator: char,
}

impl SeparatorPathTranslator {
    pub fn new(root_prefix: impl Into<String>, separator: char) -> Self {
        Self {
            root_prefix: root_prefix.into(),
            separator,
        }
    }

    /// `/proj/a.txt`
    pub fn unix() -> Self {
        Self::new("", '/')
    }

    /// `$/proj/a.txt`
    pub fn rooted() -> Self {
        Self::new("$", '/')
    }

    /// `\proj\a.txt`
    pub fn backslash() -> Self {
        Self::new("", '\\')
    }
}

impl Default for SeparatorPathTranslator {
    fn default() -> Self {
        Self::unix()
    }
}

impl ServerPathTranslator for SeparatorPathTranslator {
    fn to_canonical(&self, native: &str) -> Result<String, TranslationError> {
        let rest = native
            .strip_prefix(self.root_prefix.as_str())
            .ok_or_else(|| invalid(native, "missing root prefix"))?;

        let canonical = if self.separator == '/' {
            rest.to_string()
        } else {
            if rest.contains('/') {
                return Err(invalid(native, "contains a foreign separator"));
            }
            rest.replace(self.separator, "/")
        };
        let canonical = if canonical.is_empty() {
            "/".to_string()
        } else {
            canonical
        };

        validate_canonical(&canonical).map_err(|_| invalid(native, "not expressible as a canonical path"))?;
        Ok(canonical)
    }

    fn to_native(&self, canonical: &str) -> Result<String, TranslationError> {
        validate_canonical(canonical)?;
        if self.separator != '/' && canonical.contains(self.separator) {
            return Err(invalid(canonical, "contains the native separator"));
        }
        let body = if self.separator == '/' {
            canonical.to_string()
        } else {
            canonical.replace('/', &self.separator.to_string())
        };
        Ok(format!("{}{}", self.root_prefix, body))
    }
}

/// One left ↔ right canonical prefix pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapping {
    pub left: String,
    pub right: String,
}

impl PathMapping {
    pub fn new(left: &str, right: &str) -> Result<Self, TranslationError> {
        validate_canonical(left)?;
        validate_canonical(right)?;
        Ok(Self {
            left: left.to_string(),
            right: right.to_string(),
        })
    }

    fn sides(&self, direction: Direction) -> (&str, &str) {
        match direction {
            Direction::LeftToRight => (&self.left, &self.right),
            Direction::RightToLeft => (&self.right, &self.left),
        }
    }
}

/// Session-level path mappings plus cloak patterns.
///
/// With no mappings configured every path maps to itself.
#[derive(Debug, Clone, Default)]
pub struct PathMapper {
    mappings: Vec<PathMapping>,
    cloak: Vec<Pattern>,
}

impl PathMapper {
    pub fn new(mappings: Vec<PathMapping>) -> Self {
        Self {
            mappings,
            cloak: Vec::new(),
        }
    }

    /// Add cloak patterns (globs over source-side canonical paths).
    pub fn with_cloak(mut self, patterns: &[String]) -> Result<Self, TranslationError> {
        for pattern in patterns {
            let compiled = Pattern::new(pattern)
                .map_err(|e| invalid(pattern, &format!("bad cloak pattern: {}", e)))?;
            self.cloak.push(compiled);
        }
        Ok(self)
    }

    pub fn mappings(&self) -> &[PathMapping] {
        &self.mappings
    }

    /// Map a source-side canonical path to the target side.
    ///
    /// The mapping with the most source segments wins.
    pub fn map(&self, path: &str, direction: Direction) -> Result<String, TranslationError> {
        validate_canonical(path)?;
        if self.mappings.is_empty() {
            return Ok(path.to_string());
        }

        self.mappings
            .iter()
            .map(|m| m.sides(direction))
            .filter(|(from, _)| path_within(path, from))
            .max_by_key(|(from, _)| segments(from).count())
            .and_then(|(from, to)| replace_prefix(path, from, to))
            .ok_or_else(|| TranslationError::PathNotMapped {
                path: path.to_string(),
            })
    }

    /// Whether a source-side canonical path is cloaked.
    ///
    /// A pattern cloaks the paths it matches and everything below them.
    pub fn is_cloaked(&self, path: &str) -> bool {
        if self.cloak.is_empty() {
            return false;
        }
        let options = MatchOptions {
            case_sensitive: false,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        let mut prefix = String::new();
        for segment in segments(path) {
            prefix.push('/');
            prefix.push_str(segment);
            if self
                .cloak
                .iter()
                .any(|p| p.matches_with(&prefix, options))
            {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_translator() {
        let t = SeparatorPathTranslator::unix();
        assert_eq!(t.to_canonical("/proj/a.txt").unwrap(), "/proj/a.txt");
        assert!(matches!(
            t.to_canonical("/proj/weird\\path"),
            Err(TranslationError::InvalidPath { .. })
        ));
        assert_eq!(t.to_native("/proj/a.txt").unwrap(), "/proj/a.txt");
    }

    #[test]
    fn test_rooted_translator() {
        let t = SeparatorPathTranslator::rooted();
        assert_eq!(t.to_canonical("$/proj/a.txt").unwrap(), "/proj/a.txt");
        assert_eq!(t.to_canonical("$").unwrap(), "/");
        assert!(t.to_canonical("/proj/a.txt").is_err());
        assert_eq!(t.to_native("/proj").unwrap(), "$/proj");
    }

    #[test]
    fn test_backslash_translator() {
        let t = SeparatorPathTranslator::backslash();
        assert_eq!(t.to_canonical("\\proj\\a.txt").unwrap(), "/proj/a.txt");
        assert!(t.to_canonical("\\proj/a.txt").is_err());
        assert_eq!(t.to_native("/proj/a.txt").unwrap(), "\\proj\\a.txt");
    }

    #[test]
    fn test_longest_mapping_wins() {
        let mapper = PathMapper::new(vec![
            PathMapping::new("/left", "/right").unwrap(),
            PathMapping::new("/left/special", "/elsewhere").unwrap(),
        ]);

        assert_eq!(
            mapper.map("/left/a.txt", Direction::LeftToRight).unwrap(),
            "/right/a.txt"
        );
        assert_eq!(
            mapper
                .map("/Left/Special/b.txt", Direction::LeftToRight)
                .unwrap(),
            "/elsewhere/b.txt"
        );
        assert_eq!(
            mapper.map("/elsewhere/b.txt", Direction::RightToLeft).unwrap(),
            "/left/special/b.txt"
        );
        assert!(matches!(
            mapper.map("/unmapped/c", Direction::LeftToRight),
            Err(TranslationError::PathNotMapped { .. })
        ));
    }

    #[test]
    fn test_empty_mapper_is_identity() {
        let mapper = PathMapper::default();
        assert_eq!(
            mapper.map("/a/b", Direction::RightToLeft).unwrap(),
            "/a/b"
        );
        assert!(mapper.map("a/b", Direction::RightToLeft).is_err());
    }

    #[test]
    fn test_cloak_covers_subtree() {
        let mapper = PathMapper::default()
            .with_cloak(&["/proj/bin".to_string(), "/**/*.tmp".to_string()])
            .unwrap();
        assert!(mapper.is_cloaked("/proj/bin"));
        assert!(mapper.is_cloaked("/PROJ/bin/tool.exe"));
        assert!(mapper.is_cloaked("/proj/src/scratch.tmp"));
        assert!(!mapper.is_cloaked("/proj/binary/a"));
        assert!(!mapper.is_cloaked("/proj/src/main.rs"));
    }
}
