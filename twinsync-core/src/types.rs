//! Core domain types for twinsync
//!
//! These are the values that flow through the migration pipeline. Value types
//! (`MigrationItemId`, `Watermark`, `ChangeSummary`) are immutable once
//! constructed; the "update" operations return a new value so invariants are
//! checked at the boundary.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Endpoint** | One of the two systems being kept in sync (left or right) |
//! | **Direction** | Which way a one-way session flows (left → right or right → left) |
//! | **Change Group** | The actions derived from one atomic source change (e.g. a changeset) |
//! | **Migration Action** | Canonical, endpoint-agnostic unit of change |
//! | **Watermark** | Last source revision applied to the target, per item and direction |
//! | **Artifact Link** | Persisted pointer between an item and its counterpart |

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

// ============================================
// Direction
// ============================================

/// Direction of a one-way session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    LeftToRight,
    RightToLeft,
}

impl Direction {
    /// Returns the identifier used in database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::LeftToRight => "left_to_right",
            Direction::RightToLeft => "right_to_left",
        }
    }

    /// The opposite direction.
    pub fn reverse(&self) -> Self {
        match self {
            Direction::LeftToRight => Direction::RightToLeft,
            Direction::RightToLeft => Direction::LeftToRight,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "left_to_right" => Ok(Direction::LeftToRight),
            "right_to_left" => Ok(Direction::RightToLeft),
            _ => Err(format!("unknown direction: {}", s)),
        }
    }
}

// ============================================
// Item identity and watermarks
// ============================================

/// Identity and version of one item on one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigrationItemId {
    item_id: String,
    version: Option<String>,
}

impl MigrationItemId {
    /// Create an item id. Fails when `item_id` is empty.
    pub fn new(item_id: impl Into<String>, version: Option<String>) -> Result<Self> {
        let item_id = item_id.into();
        if item_id.trim().is_empty() {
            return Err(Error::InvalidValue("item id must not be empty".to_string()));
        }
        Ok(Self { item_id, version })
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Same item at a different version.
    pub fn with_version(&self, version: impl Into<String>) -> Self {
        Self {
            item_id: self.item_id.clone(),
            version: Some(version.into()),
        }
    }
}

/// Last source revision of one item that was applied to the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    item_id: String,
    revision: u64,
}

impl Watermark {
    /// Create a watermark. Fails when `item_id` is empty.
    pub fn new(item_id: impl Into<String>, revision: u64) -> Result<Self> {
        let item_id = item_id.into();
        if item_id.trim().is_empty() {
            return Err(Error::InvalidValue(
                "watermark item id must not be empty".to_string(),
            ));
        }
        Ok(Self { item_id, revision })
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether a source revision is already covered by this watermark.
    pub fn covers(&self, revision: u64) -> bool {
        self.revision >= revision
    }

    /// Returns the watermark moved forward to `revision`.
    ///
    /// Moving to the same revision is allowed; moving backwards is a
    /// persisted-state inconsistency.
    pub fn advance(&self, revision: u64) -> Result<Self> {
        if revision < self.revision {
            return Err(Error::StateInconsistency(format!(
                "watermark for {} would regress from {} to {}",
                self.item_id, self.revision, revision
            )));
        }
        Ok(Self {
            item_id: self.item_id.clone(),
            revision,
        })
    }
}

/// Aggregate of changes in an interval, produced by diff queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    change_count: u64,
    earliest_change: Option<DateTime<Utc>>,
}

impl ChangeSummary {
    /// Summary of an interval with no changes.
    pub fn empty() -> Self {
        Self {
            change_count: 0,
            earliest_change: None,
        }
    }

    /// Create a summary; the timestamp must be present iff count > 0.
    pub fn new(change_count: u64, earliest_change: Option<DateTime<Utc>>) -> Result<Self> {
        match (change_count, earliest_change) {
            (0, Some(_)) => Err(Error::InvalidValue(
                "empty change summary cannot have an earliest change time".to_string(),
            )),
            (n, None) if n > 0 => Err(Error::InvalidValue(
                "non-empty change summary needs an earliest change time".to_string(),
            )),
            _ => Ok(Self {
                change_count,
                earliest_change,
            }),
        }
    }

    pub fn change_count(&self) -> u64 {
        self.change_count
    }

    pub fn earliest_change(&self) -> Option<DateTime<Utc>> {
        self.earliest_change
    }

    /// Returns the summary with one more change recorded at `at`.
    pub fn with_change(&self, at: DateTime<Utc>) -> Self {
        Self {
            change_count: self.change_count + 1,
            earliest_change: Some(match self.earliest_change {
                Some(existing) if existing <= at => existing,
                _ => at,
            }),
        }
    }
}

// ============================================
// Fields
// ============================================

/// Named field on a work item revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationField {
    pub name: String,
    pub value: serde_json::Value,
}

impl MigrationField {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidValue("field name must not be empty".to_string()));
        }
        Ok(Self { name, value })
    }
}

/// Field set of one revision; names are unique.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSet(Vec<MigrationField>);

impl FieldSet {
    pub fn new(fields: Vec<MigrationField>) -> Result<Self> {
        let mut seen = HashSet::new();
        for field in &fields {
            if !seen.insert(field.name.as_str()) {
                return Err(Error::InvalidValue(format!(
                    "duplicate field name: {}",
                    field.name
                )));
            }
        }
        Ok(Self(fields))
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MigrationField> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================
// Artifacts
// ============================================

/// Kind of item an artifact reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    VersionedItem,
    Changeset,
    WorkItem,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::VersionedItem => "versioned_item",
            ArtifactType::Changeset => "changeset",
            ArtifactType::WorkItem => "work_item",
        }
    }
}

impl std::str::FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "versioned_item" => Ok(ArtifactType::VersionedItem),
            "changeset" => Ok(ArtifactType::Changeset),
            "work_item" => Ok(ArtifactType::WorkItem),
            _ => Err(format!("unknown artifact type: {}", s)),
        }
    }
}

/// Cross-endpoint pointer to an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactReference {
    pub uri: String,
    pub artifact_type: ArtifactType,
}

impl ArtifactReference {
    /// Build the reference for an item owned by `endpoint`.
    ///
    /// URIs look like `twinsync://{endpoint}/{type}/{url-encoded id}`.
    pub fn for_item(endpoint: &str, artifact_type: ArtifactType, item_id: &str) -> Self {
        Self {
            uri: format!(
                "twinsync://{}/{}/{}",
                urlencoding::encode(endpoint),
                artifact_type.as_str(),
                urlencoding::encode(item_id)
            ),
            artifact_type,
        }
    }
}

// ============================================
// Identities
// ============================================

/// A user identity as known by one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RichIdentity {
    pub display_name: Option<String>,
    pub unique_id: Option<String>,
    pub domain: Option<String>,
    pub alias: Option<String>,
}

impl RichIdentity {
    /// Parse a `DOMAIN\alias` (or bare `alias`) account name.
    pub fn from_qualified(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidValue("identity name must not be empty".to_string()));
        }
        let (domain, alias) = match name.split_once('\\') {
            Some((domain, alias)) => (Some(domain.to_string()), alias.to_string()),
            None => (None, name.to_string()),
        };
        Ok(Self {
            domain: domain.filter(|d| !d.is_empty()),
            alias: Some(alias).filter(|a| !a.is_empty()),
            ..Default::default()
        })
        .and_then(Self::validated)
    }

    /// Checks that at least one identifying field is present.
    pub fn validated(self) -> Result<Self> {
        if self.is_empty() {
            return Err(Error::InvalidValue(
                "identity needs at least one identifying field".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        [
            &self.display_name,
            &self.unique_id,
            &self.domain,
            &self.alias,
        ]
        .iter()
        .all(|v| v.as_deref().map(str::is_empty).unwrap_or(true))
    }

    /// `DOMAIN\alias`, falling back to the unique id or display name.
    pub fn qualified_name(&self) -> String {
        match (&self.domain, &self.alias) {
            (Some(domain), Some(alias)) => format!("{}\\{}", domain, alias),
            (None, Some(alias)) => alias.clone(),
            _ => self
                .unique_id
                .clone()
                .or_else(|| self.display_name.clone())
                .or_else(|| self.domain.clone())
                .unwrap_or_default(),
        }
    }
}

// ============================================
// Actions
// ============================================

/// Kind of canonical change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Add,
    Edit,
    Delete,
    Rename,
    Branch,
    Merge,
    Label,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Add => "add",
            ActionKind::Edit => "edit",
            ActionKind::Delete => "delete",
            ActionKind::Rename => "rename",
            ActionKind::Branch => "branch",
            ActionKind::Merge => "merge",
            ActionKind::Label => "label",
        }
    }

    /// Kinds that carry a second path (`from_path`).
    pub fn has_from_path(&self) -> bool {
        matches!(self, ActionKind::Rename | ActionKind::Branch | ActionKind::Merge)
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "add" => Ok(ActionKind::Add),
            "edit" => Ok(ActionKind::Edit),
            "delete" => Ok(ActionKind::Delete),
            "rename" => Ok(ActionKind::Rename),
            "branch" => Ok(ActionKind::Branch),
            "merge" => Ok(ActionKind::Merge),
            "label" => Ok(ActionKind::Label),
            _ => Err(format!("unknown action kind: {}", s)),
        }
    }
}

/// Canonical unit of change to apply to a target.
///
/// `path` and `from_path` are canonical (endpoint-agnostic). The pipeline never
/// mutates an emitted action; translation produces a separate value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationAction {
    pub kind: ActionKind,
    /// Source item id (stable across renames)
    pub item_id: String,
    pub path: String,
    pub from_path: Option<String>,
    /// Source revision this action comes from
    pub version: u64,
    pub recursive: bool,
    /// Owning change group id
    pub change_group: String,
    #[serde(default)]
    pub fields: FieldSet,
    #[serde(default)]
    pub label: Option<String>,
}

impl MigrationAction {
    /// Stable content hash used to key conflicts and applied records.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.item_id.as_bytes());
        hasher.update([0]);
        hasher.update(self.path.as_bytes());
        hasher.update([0]);
        hasher.update(self.from_path.as_deref().unwrap_or("").as_bytes());
        hasher.update([0]);
        hasher.update(self.version.to_le_bytes());
        hasher.update([self.recursive as u8]);
        hasher.update(self.change_group.as_bytes());
        hasher.update([0]);
        hasher.update(self.label.as_deref().unwrap_or("").as_bytes());
        for field in self.fields.iter() {
            hasher.update(field.name.as_bytes());
            hasher.update(field.value.to_string().as_bytes());
        }
        hex::encode(&hasher.finalize()[..16])
    }

    /// Copy of this action pointing at another canonical path.
    pub fn retargeted(&self, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..self.clone()
        }
    }
}

/// One entry of a raw endpoint change, in endpoint-native form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub kind: ActionKind,
    pub item_id: String,
    pub native_path: String,
    pub from_native_path: Option<String>,
    pub recursive: bool,
    #[serde(default)]
    pub fields: FieldSet,
    #[serde(default)]
    pub label: Option<String>,
}

impl ChangeEntry {
    fn simple(kind: ActionKind, item_id: &str, native_path: &str) -> Self {
        Self {
            kind,
            item_id: item_id.to_string(),
            native_path: native_path.to_string(),
            from_native_path: None,
            recursive: false,
            fields: FieldSet::default(),
            label: None,
        }
    }

    pub fn add(item_id: &str, native_path: &str) -> Self {
        Self::simple(ActionKind::Add, item_id, native_path)
    }

    pub fn edit(item_id: &str, native_path: &str) -> Self {
        Self::simple(ActionKind::Edit, item_id, native_path)
    }

    pub fn delete(item_id: &str, native_path: &str) -> Self {
        Self::simple(ActionKind::Delete, item_id, native_path)
    }

    pub fn rename(item_id: &str, from_native_path: &str, native_path: &str) -> Self {
        Self {
            from_native_path: Some(from_native_path.to_string()),
            ..Self::simple(ActionKind::Rename, item_id, native_path)
        }
    }

    pub fn with_fields(mut self, fields: FieldSet) -> Self {
        self.fields = fields;
        self
    }
}

/// An atomic change as reported by an endpoint (e.g. one changeset).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointChange {
    /// Endpoint-native change id
    pub change_id: String,
    /// Position in the endpoint's natural ordering (changeset / revision number)
    pub sequence: u64,
    pub owner: Option<String>,
    pub committed_at: DateTime<Utc>,
    pub comment: Option<String>,
    pub entries: Vec<ChangeEntry>,
}

/// Ordered actions derived from one source change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeGroup {
    pub id: String,
    pub sequence: u64,
    pub owner: Option<String>,
    pub committed_at: DateTime<Utc>,
    pub comment: Option<String>,
    pub actions: Vec<MigrationAction>,
}

impl ChangeGroup {
    /// Canonical paths touched by this group (including rename sources).
    pub fn touched_paths(&self) -> impl Iterator<Item = &str> {
        self.actions
            .iter()
            .flat_map(|a| std::iter::once(a.path.as_str()).chain(a.from_path.as_deref()))
    }
}

// ============================================
// Applied records
// ============================================

/// How an action left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    /// Applied to the target endpoint
    Applied,
    /// Resolved away by a conflict rule; watermark advanced without apply
    Skipped,
    /// Recognized as a change the engine itself produced
    Echo,
}

impl ActionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOutcome::Applied => "applied",
            ActionOutcome::Skipped => "skipped",
            ActionOutcome::Echo => "echo",
        }
    }
}

impl std::str::FromStr for ActionOutcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "applied" => Ok(ActionOutcome::Applied),
            "skipped" => Ok(ActionOutcome::Skipped),
            "echo" => Ok(ActionOutcome::Echo),
            _ => Err(format!("unknown action outcome: {}", s)),
        }
    }
}

/// Historical record of an action that left the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedAction {
    pub session_id: uuid::Uuid,
    pub direction: Direction,
    pub change_group: String,
    pub item_id: String,
    pub source_revision: u64,
    pub kind: ActionKind,
    pub fingerprint: String,
    pub outcome: ActionOutcome,
    pub target_item_id: Option<String>,
    pub target_revision: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}

// ============================================
// Sessions
// ============================================

/// Run state of a one-way session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    Stopping,
    Stopped,
    Aborting,
    Aborted,
    /// Fatal adapter or persistence fault; operator must reset
    Faulted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Aborting => "aborting",
            SessionState::Aborted => "aborted",
            SessionState::Faulted => "faulted",
        }
    }

    /// Allowed state machine edges.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created | Stopped | Aborted, Running)
                | (Running, Stopping | Aborting | Stopped | Faulted)
                | (Stopping, Stopped | Aborting | Faulted)
                | (Aborting, Aborted | Faulted)
                | (Faulted, Stopped)
        )
    }

    /// States in which a pass may be in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Running | SessionState::Stopping | SessionState::Aborting
        )
    }

    /// State to assume after loading from storage.
    ///
    /// A session persisted mid-pass was interrupted by a crash.
    pub fn recovered(self) -> Self {
        if self.is_active() {
            SessionState::Aborted
        } else {
            self
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(SessionState::Created),
            "running" => Ok(SessionState::Running),
            "stopping" => Ok(SessionState::Stopping),
            "stopped" => Ok(SessionState::Stopped),
            "aborting" => Ok(SessionState::Aborting),
            "aborted" => Ok(SessionState::Aborted),
            "faulted" => Ok(SessionState::Faulted),
            _ => Err(format!("unknown session state: {}", s)),
        }
    }
}

/// Shape of a configured session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    OneWay,
    TwoWay,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::OneWay => "one_way",
            SessionKind::TwoWay => "two_way",
        }
    }
}

impl std::str::FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "one_way" => Ok(SessionKind::OneWay),
            "two_way" => Ok(SessionKind::TwoWay),
            _ => Err(format!("unknown session kind: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(version: u64) -> MigrationAction {
        MigrationAction {
            kind: ActionKind::Edit,
            item_id: "item-1".to_string(),
            path: "/proj/file.txt".to_string(),
            from_path: None,
            version,
            recursive: false,
            change_group: "cs-1".to_string(),
            fields: FieldSet::default(),
            label: None,
        }
    }

    #[test]
    fn test_item_id_requires_value() {
        assert!(MigrationItemId::new("", None).is_err());
        let id = MigrationItemId::new("42", None).unwrap();
        assert_eq!(id.with_version("3").version(), Some("3"));
    }

    #[test]
    fn test_watermark_advance_is_monotonic() {
        let wm = Watermark::new("x", 3).unwrap();
        assert!(wm.covers(3));
        assert!(!wm.covers(4));

        let advanced = wm.advance(5).unwrap();
        assert_eq!(advanced.revision(), 5);
        // Original value untouched
        assert_eq!(wm.revision(), 3);

        assert!(advanced.advance(5).is_ok());
        assert!(matches!(
            advanced.advance(4),
            Err(Error::StateInconsistency(_))
        ));
    }

    #[test]
    fn test_change_summary_consistency() {
        assert!(ChangeSummary::new(0, Some(Utc::now())).is_err());
        assert!(ChangeSummary::new(2, None).is_err());

        let early = Utc::now() - chrono::Duration::hours(1);
        let summary = ChangeSummary::empty()
            .with_change(Utc::now())
            .with_change(early);
        assert_eq!(summary.change_count(), 2);
        assert_eq!(summary.earliest_change(), Some(early));
    }

    #[test]
    fn test_field_set_rejects_duplicates() {
        let a = MigrationField::new("Title", serde_json::json!("a")).unwrap();
        let b = MigrationField::new("Title", serde_json::json!("b")).unwrap();
        assert!(FieldSet::new(vec![a.clone(), b]).is_err());
        assert!(MigrationField::new(" ", serde_json::json!(1)).is_err());

        let set = FieldSet::new(vec![a]).unwrap();
        assert_eq!(set.get("Title"), Some(&serde_json::json!("a")));
    }

    #[test]
    fn test_rich_identity_from_qualified() {
        let id = RichIdentity::from_qualified("DOMAIN\\alice").unwrap();
        assert_eq!(id.domain.as_deref(), Some("DOMAIN"));
        assert_eq!(id.alias.as_deref(), Some("alice"));
        assert_eq!(id.qualified_name(), "DOMAIN\\alice");

        let bare = RichIdentity::from_qualified("bob").unwrap();
        assert_eq!(bare.domain, None);
        assert_eq!(bare.qualified_name(), "bob");

        assert!(RichIdentity::from_qualified("  ").is_err());
        assert!(RichIdentity::default().validated().is_err());
    }

    #[test]
    fn test_artifact_reference_uri() {
        let r = ArtifactReference::for_item("left tfs", ArtifactType::WorkItem, "a/b");
        assert_eq!(r.uri, "twinsync://left%20tfs/work_item/a%2Fb");
    }

    #[test]
    fn test_fingerprint_depends_on_content() {
        assert_eq!(action(1).fingerprint(), action(1).fingerprint());
        assert_ne!(action(1).fingerprint(), action(2).fingerprint());
        assert_ne!(
            action(1).fingerprint(),
            action(1).retargeted("/proj/other.txt").fingerprint()
        );
    }

    #[test]
    fn test_session_state_transitions() {
        use SessionState::*;
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Aborting));
        assert!(Aborting.can_transition_to(Aborted));
        assert!(Aborted.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Aborting));
        assert!(!Faulted.can_transition_to(Running));
        assert_eq!(Running.recovered(), Aborted);
        assert_eq!(Faulted.recovered(), Faulted);
    }
}
