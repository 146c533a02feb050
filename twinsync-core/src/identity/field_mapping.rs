//! Rule-based identity field mapping
//!
//! Rewrites one field of an identity (domain, alias or display name) using
//! configured left/right value pairs:
//!
//! - Rules for the lookup's own direction are tried before `two_way` rules.
//!   A two-way rule is only consulted when no directional rule matched.
//! - `*` on the source side matches any value; a rule naming the value
//!   exactly beats a wildcard rule.
//! - `*` on the target side keeps the source value.
//! - `ignore` rules clear the field.

use super::{IdentityLookupProvider, LookupContext};
use crate::types::{Direction, RichIdentity};
use serde::{Deserialize, Serialize};

const WILDCARD: &str = "*";

/// Which identity field a provider rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityField {
    Domain,
    Alias,
    DisplayName,
}

impl IdentityField {
    fn get<'a>(&self, identity: &'a RichIdentity) -> Option<&'a str> {
        match self {
            IdentityField::Domain => identity.domain.as_deref(),
            IdentityField::Alias => identity.alias.as_deref(),
            IdentityField::DisplayName => identity.display_name.as_deref(),
        }
    }

    fn set(&self, identity: &mut RichIdentity, value: Option<String>) {
        let slot = match self {
            IdentityField::Domain => &mut identity.domain,
            IdentityField::Alias => &mut identity.alias,
            IdentityField::DisplayName => &mut identity.display_name,
        };
        *slot = value;
    }
}

/// Directions a rule applies in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingDirection {
    LeftToRight,
    RightToLeft,
    TwoWay,
}

impl MappingDirection {
    fn is_directional_for(&self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (MappingDirection::LeftToRight, Direction::LeftToRight)
                | (MappingDirection::RightToLeft, Direction::RightToLeft)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingKind {
    #[default]
    SimpleReplacement,
    Ignore,
}

/// One left/right value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMappingRule {
    pub direction: MappingDirection,
    pub left: String,
    pub right: String,
    #[serde(default)]
    pub kind: MappingKind,
}

impl FieldMappingRule {
    /// (source side, target side) for a lookup direction.
    fn sides(&self, direction: Direction) -> (&str, &str) {
        match direction {
            Direction::LeftToRight => (&self.left, &self.right),
            Direction::RightToLeft => (&self.right, &self.left),
        }
    }

    fn matches(&self, value: &str, direction: Direction) -> bool {
        let (source, _) = self.sides(direction);
        source == WILDCARD || source.eq_ignore_ascii_case(value)
    }

    fn is_wildcard(&self, direction: Direction) -> bool {
        self.sides(direction).0 == WILDCARD
    }

    fn output(&self, value: &str, direction: Direction) -> Option<String> {
        match self.kind {
            MappingKind::Ignore => None,
            MappingKind::SimpleReplacement => {
                let (_, target) = self.sides(direction);
                if target == WILDCARD {
                    Some(value.to_string())
                } else {
                    Some(target.to_string())
                }
            }
        }
    }
}

/// Identity provider that rewrites one field by rules.
pub struct FieldMappingProvider {
    name: String,
    field: IdentityField,
    rules: Vec<FieldMappingRule>,
}

impl FieldMappingProvider {
    pub fn new(name: impl Into<String>, field: IdentityField, rules: Vec<FieldMappingRule>) -> Self {
        Self {
            name: name.into(),
            field,
            rules,
        }
    }

    /// Best rule among those passing `applies`: exact beats wildcard, then first declared.
    fn best<'a>(
        &'a self,
        value: &str,
        direction: Direction,
        applies: impl Fn(&FieldMappingRule) -> bool,
    ) -> Option<&'a FieldMappingRule> {
        let candidates = self
            .rules
            .iter()
            .filter(|r| applies(r) && r.matches(value, direction));
        let mut best: Option<&FieldMappingRule> = None;
        for rule in candidates {
            match best {
                Some(current) if current.is_wildcard(direction) && !rule.is_wildcard(direction) => {
                    best = Some(rule)
                }
                None => best = Some(rule),
                _ => {}
            }
        }
        best
    }

    /// Map one field value; `None` when no rule matches.
    pub fn map_value(&self, value: &str, direction: Direction) -> Option<Option<String>> {
        self.best(value, direction, |r| r.direction.is_directional_for(direction))
            .or_else(|| self.best(value, direction, |r| r.direction == MappingDirection::TwoWay))
            .map(|rule| rule.output(value, direction))
    }
}

impl IdentityLookupProvider for FieldMappingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_lookup(&self, identity: &RichIdentity, context: &LookupContext) -> Option<RichIdentity> {
        let value = self.field.get(identity).unwrap_or_default();
        let mapped = self.map_value(value, context.direction)?;
        let mut translated = identity.clone();
        self.field.set(&mut translated, mapped);
        Some(translated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn rule(direction: MappingDirection, left: &str, right: &str) -> FieldMappingRule {
        FieldMappingRule {
            direction,
            left: left.to_string(),
            right: right.to_string(),
            kind: MappingKind::SimpleReplacement,
        }
    }

    fn domain_provider() -> FieldMappingProvider {
        use MappingDirection::*;
        FieldMappingProvider::new(
            "domains",
            IdentityField::Domain,
            vec![
                rule(LeftToRight, "domain2", "domain2_target"),
                rule(LeftToRight, "*", "default"),
                rule(LeftToRight, "domain1", "domain1_target"),
                rule(LeftToRight, "domain3", "*"),
                rule(RightToLeft, "domain2_target_on_left", "domain2"),
                rule(RightToLeft, "domain1_target_on_left", "domain1"),
                rule(TwoWay, "admin_domain", "admin_domain_target"),
                rule(TwoWay, "*", "*"),
                FieldMappingRule {
                    kind: MappingKind::Ignore,
                    ..rule(TwoWay, "ignore", "ignore")
                },
            ],
        )
    }

    fn map(provider: &FieldMappingProvider, domain: &str, direction: Direction) -> Option<String> {
        let identity = RichIdentity {
            domain: Some(domain.to_string()),
            alias: Some("user".to_string()),
            ..Default::default()
        };
        let context = LookupContext {
            session_id: Uuid::nil(),
            direction,
            source_endpoint: "left".to_string(),
            target_endpoint: "right".to_string(),
        };
        let found = provider.try_lookup(&identity, &context).unwrap();
        assert_eq!(found.alias.as_deref(), Some("user"));
        found.domain
    }

    #[test]
    fn test_left_to_right_rules() {
        let p = domain_provider();
        let l2r = Direction::LeftToRight;
        assert_eq!(map(&p, "domain2", l2r).as_deref(), Some("domain2_target"));
        assert_eq!(map(&p, "random domain", l2r).as_deref(), Some("default"));
        // Exact rule with wildcard target keeps the value
        assert_eq!(map(&p, "domain3", l2r).as_deref(), Some("domain3"));
        // Right-to-left rules do not apply
        assert_eq!(map(&p, "domain2_target_on_left", l2r).as_deref(), Some("default"));
        // Directional wildcard wins over an exact two-way rule
        assert_eq!(map(&p, "admin_domain", l2r).as_deref(), Some("default"));
    }

    #[test]
    fn test_right_to_left_rules() {
        let p = domain_provider();
        let r2l = Direction::RightToLeft;
        assert_eq!(map(&p, "domain2", r2l).as_deref(), Some("domain2_target_on_left"));
        assert_eq!(map(&p, "random domain", r2l).as_deref(), Some("random domain"));
        assert_eq!(map(&p, "ignore", r2l), None);
        assert_eq!(map(&p, "admin_domain_target", r2l).as_deref(), Some("admin_domain"));
    }

    #[test]
    fn test_no_matching_rule_is_not_found() {
        let p = FieldMappingProvider::new(
            "aliases",
            IdentityField::Alias,
            vec![rule(MappingDirection::LeftToRight, "bob", "robert")],
        );
        assert_eq!(p.map_value("alice", Direction::LeftToRight), None);
        assert_eq!(
            p.map_value("BOB", Direction::LeftToRight),
            Some(Some("robert".to_string()))
        );
        assert_eq!(p.map_value("bob", Direction::RightToLeft), None);
    }
}
