//! Engine composition
//!
//! Builds the shared services, sessions, scheduler and diff jobs from a
//! [`Config`] and a registry of endpoint providers.

use crate::adapter::{Capability, EndpointAdapter, ProviderRegistry};
use crate::config::{Config, SessionConfig};
use crate::conflict::ConflictManager;
use crate::db::{Database, SessionRecord};
use crate::diff::{DiffJob, DiffJobRunner};
use crate::error::{Error, Result};
use crate::identity::{FieldMappingProvider, IdentityLookupService};
use crate::pipeline::{ActionPipeline, EngineServices};
use crate::scheduler::SessionScheduler;
use crate::session::{OneWaySession, Session, SessionControl, TwoWaySession};
use crate::translation::ArtifactLinkService;
use crate::types::{Direction, SessionKind};
use std::sync::Arc;

/// A fully wired migration engine.
pub struct MigrationEngine {
    services: Arc<EngineServices>,
    registry: ProviderRegistry,
    scheduler: SessionScheduler,
    diff_runner: Arc<DiffJobRunner>,
    diff_jobs: Vec<DiffJob>,
}

impl MigrationEngine {
    /// Open the database at the default location and build the engine.
    pub fn open(config: &Config, registry: ProviderRegistry) -> Result<Self> {
        let db = Database::open(&Config::database_path())?;
        db.migrate()?;
        Self::new(config, Arc::new(db), registry)
    }

    /// Build the engine over an already migrated database.
    pub fn new(config: &Config, db: Arc<Database>, registry: ProviderRegistry) -> Result<Self> {
        config.validate()?;

        let identities = Arc::new(IdentityLookupService::new());
        for provider in &config.identity.providers {
            identities.register(
                provider.id,
                Arc::new(FieldMappingProvider::new(
                    provider.name.clone(),
                    provider.field,
                    provider.rules.clone(),
                )),
            );
        }

        let conflicts = Arc::new(ConflictManager::new(Arc::clone(&db), config.engine.tie_break));
        for rule in &config.conflict_rules {
            conflicts.add_rule(rule.clone())?;
        }

        let links = Arc::new(ArtifactLinkService::new());
        links.load(&db)?;

        let services = Arc::new(EngineServices {
            db: Arc::clone(&db),
            identities,
            conflicts: Arc::clone(&conflicts),
            links,
            default_identity: config.engine.default_identity.clone(),
            annotation_template: config.engine.annotation_template.clone(),
        });

        let mut scheduler = SessionScheduler::new(
            Arc::clone(&db),
            conflicts,
            config.engine.poll_interval(),
        );
        let mut diff_jobs = Vec::new();

        for session_config in &config.sessions {
            let left = resolve(&registry, &session_config.left)?;
            let right = resolve(&registry, &session_config.right)?;
            check_capabilities(session_config, &left, &right)?;

            let record = register_session(&db, session_config)?;
            let session = build_session(&services, config, session_config, record, &left, &right)?;
            scheduler.add(session)?;

            if config.diff.enabled {
                diff_jobs.extend(diff_jobs_for(config, session_config, &left, &right));
            }
        }

        tracing::info!(
            sessions = config.sessions.len(),
            providers = registry.len(),
            rules = config.conflict_rules.len(),
            diff_jobs = diff_jobs.len(),
            "Migration engine ready"
        );

        Ok(Self {
            diff_runner: Arc::new(DiffJobRunner::new(db, config.retry.clone())),
            services,
            registry,
            scheduler,
            diff_jobs,
        })
    }

    pub fn scheduler(&self) -> &SessionScheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.services.db
    }

    pub fn conflicts(&self) -> &Arc<ConflictManager> {
        &self.services.conflicts
    }

    pub fn identities(&self) -> &Arc<IdentityLookupService> {
        &self.services.identities
    }

    pub fn links(&self) -> &Arc<ArtifactLinkService> {
        &self.services.links
    }

    pub fn diff_runner(&self) -> Arc<DiffJobRunner> {
        Arc::clone(&self.diff_runner)
    }

    pub fn diff_jobs(&self) -> &[DiffJob] {
        &self.diff_jobs
    }
}

fn resolve(registry: &ProviderRegistry, name: &str) -> Result<Arc<dyn EndpointAdapter>> {
    registry
        .by_name(name)
        .ok_or_else(|| Error::ProviderNotFound(name.to_string()))
}

fn check_capabilities(
    session: &SessionConfig,
    left: &Arc<dyn EndpointAdapter>,
    right: &Arc<dyn EndpointAdapter>,
) -> Result<()> {
    let mut required = vec![
        (left, Capability::ChangeSource),
        (right, Capability::ChangeTarget),
    ];
    if session.kind == SessionKind::TwoWay {
        required.push((right, Capability::ChangeSource));
        required.push((left, Capability::ChangeTarget));
    }

    for (adapter, capability) in required {
        if !adapter.has_capability(capability) {
            return Err(Error::Config(format!(
                "session {}: provider {} lacks capability {:?}",
                session.name,
                adapter.descriptor().name,
                capability
            )));
        }
    }
    Ok(())
}

/// Reuse the stored session id for a configured name so state survives restarts.
fn register_session(db: &Database, config: &SessionConfig) -> Result<SessionRecord> {
    let mut record = match db.get_session_by_name(&config.name)? {
        Some(existing) => existing,
        None => SessionRecord::new(&config.name, config.kind, &config.left, &config.right),
    };
    if record.kind != config.kind
        || record.left_endpoint != config.left
        || record.right_endpoint != config.right
    {
        tracing::warn!(
            session = %config.name,
            "Session endpoints or kind changed since last run; keeping its history"
        );
        record.kind = config.kind;
        record.left_endpoint = config.left.clone();
        record.right_endpoint = config.right.clone();
    }
    db.upsert_session(&record)?;
    Ok(record)
}

fn build_session(
    services: &Arc<EngineServices>,
    config: &Config,
    session_config: &SessionConfig,
    record: SessionRecord,
    left: &Arc<dyn EndpointAdapter>,
    right: &Arc<dyn EndpointAdapter>,
) -> Result<Session> {
    let control = Arc::new(SessionControl::new());
    let half = |direction: Direction| -> Result<OneWaySession> {
        let (source, target) = match direction {
            Direction::LeftToRight => (Arc::clone(left), Arc::clone(right)),
            Direction::RightToLeft => (Arc::clone(right), Arc::clone(left)),
        };
        let pipeline = ActionPipeline::new(
            record.clone(),
            direction,
            source,
            target,
            session_config.path_mapper()?,
            Arc::clone(services),
        );
        OneWaySession::new(
            pipeline,
            Arc::clone(&services.db),
            config.retry.clone(),
            Arc::clone(&control),
        )
    };

    Ok(match session_config.kind {
        SessionKind::OneWay => Session::OneWay(Arc::new(half(Direction::LeftToRight)?)),
        SessionKind::TwoWay => Session::TwoWay(Arc::new(TwoWaySession::new(
            half(Direction::LeftToRight)?,
            half(Direction::RightToLeft)?,
        )?)),
    })
}

/// One diff job per mapping, or one for the whole namespace when unmapped.
fn diff_jobs_for(
    config: &Config,
    session: &SessionConfig,
    left: &Arc<dyn EndpointAdapter>,
    right: &Arc<dyn EndpointAdapter>,
) -> Vec<DiffJob> {
    if !left.has_capability(Capability::Diff) || !right.has_capability(Capability::Diff) {
        tracing::warn!(session = %session.name, "Endpoints do not support diff; no diff jobs");
        return Vec::new();
    }

    let scopes: Vec<(String, String)> = if session.mappings.is_empty() {
        vec![("/".to_string(), "/".to_string())]
    } else {
        session
            .mappings
            .iter()
            .map(|m| (m.left.clone(), m.right.clone()))
            .collect()
    };
    let window = chrono::Duration::hours(config.diff.window_hours as i64);

    scopes
        .into_iter()
        .map(|(left_scope, right_scope)| DiffJob {
            name: format!("{}:{}", session.name, left_scope),
            left: Arc::clone(left),
            right: Arc::clone(right),
            left_scope,
            right_scope,
            window,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryEndpoint, Registration};
    use crate::identity::IdentityField;
    use uuid::Uuid;

    fn registry(endpoints: &[Arc<MemoryEndpoint>]) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for endpoint in endpoints {
            registry.register(endpoint.clone());
        }
        registry
    }

    fn db() -> Arc<Database> {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        Arc::new(db)
    }

    const CONFIG: &str = r#"
[diff]
enabled = true

[[conflict_rules]]
id = "skip-tmp"
conflict_type = "*"
scope = "/tmp"
action = "skip"

[[sessions]]
name = "docs"
kind = "two_way"
left = "tfs"
right = "git"

[[sessions.mappings]]
left = "/proj"
right = "/mirror"
"#;

    #[test]
    fn test_engine_builds_sessions_from_config() {
        let config = Config::parse(CONFIG).unwrap();
        let tfs = Arc::new(MemoryEndpoint::new("tfs"));
        let git = Arc::new(MemoryEndpoint::new("git"));
        let db = db();

        let engine = MigrationEngine::new(&config, Arc::clone(&db), registry(&[tfs, git])).unwrap();
        let session = engine.scheduler().get("docs").unwrap();
        assert_eq!(session.kind(), SessionKind::TwoWay);
        assert_eq!(session.halves().len(), 2);
        assert_eq!(engine.conflicts().rule_ids(), vec!["skip-tmp".to_string()]);
        assert_eq!(engine.diff_jobs().len(), 1);
        assert_eq!(engine.diff_jobs()[0].right_scope, "/mirror");

        // Rebuilding keeps the session id
        let id = session.record().id;
        let tfs = Arc::new(MemoryEndpoint::new("tfs"));
        let git = Arc::new(MemoryEndpoint::new("git"));
        let rebuilt = MigrationEngine::new(&config, db, registry(&[tfs, git])).unwrap();
        assert_eq!(rebuilt.scheduler().get("docs").unwrap().record().id, id);
    }

    #[test]
    fn test_identity_providers_use_configured_keys() {
        let toml = format!(
            "[[identity.providers]]\nid = \"9a7e3c41-5d2b-4f86-a1c0-3e8b7d6f2a95\"\nname = \"domains\"\nfield = \"domain\"\n{}",
            CONFIG
        );
        let config = Config::parse(&toml).unwrap();
        let tfs = Arc::new(MemoryEndpoint::new("tfs"));
        let git = Arc::new(MemoryEndpoint::new("git"));
        let engine = MigrationEngine::new(&config, db(), registry(&[tfs, git])).unwrap();

        let key = Uuid::parse_str("9a7e3c41-5d2b-4f86-a1c0-3e8b7d6f2a95").unwrap();
        let registration = engine.identities().register(
            key,
            Arc::new(FieldMappingProvider::new("domains-v2", IdentityField::Domain, vec![])),
        );
        assert_eq!(
            registration,
            Registration::Replaced {
                previous: "domains".to_string()
            }
        );
        assert_eq!(engine.identities().provider_count(), 1);
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let config = Config::parse(CONFIG).unwrap();
        let tfs = Arc::new(MemoryEndpoint::new("tfs"));
        let result = MigrationEngine::new(&config, db(), registry(&[tfs]));
        assert!(matches!(result, Err(Error::ProviderNotFound(name)) if name == "git"));
    }

    #[test]
    fn test_missing_capability_is_rejected() {
        let config = Config::parse(CONFIG).unwrap();
        let tfs = Arc::new(MemoryEndpoint::new("tfs"));
        let git = Arc::new(
            MemoryEndpoint::new("git").with_capabilities(vec![Capability::ChangeTarget]),
        );
        let result = MigrationEngine::new(&config, db(), registry(&[tfs, git]));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
