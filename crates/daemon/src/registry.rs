//! In-memory view of the configured rules.

use std::path::{Component, Path};
use std::sync::Arc;

use object_store::{Credentials, ObjectStoreError, RemoteTarget, TransferBackend};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::database::models::Rule;
use crate::database::Database;
use crate::error::EngineError;

/// Rules ordered for longest-prefix resolution.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<Arc<Rule>>,
}

/// What a config import did.
#[derive(Debug, Clone, Default)]
pub struct ImportOutcome {
    pub created: Vec<Rule>,
    /// Rules that were already imported with the same root and target
    pub unchanged: Vec<Rule>,
}

impl RuleRegistry {
    pub fn new(rules: impl IntoIterator<Item = Rule>) -> Self {
        let mut rules: Vec<_> = rules.into_iter().map(Arc::new).collect();
        // Deepest roots first so the first match is the longest prefix.
        rules.sort_by_key(|rule| std::cmp::Reverse(rule.local_root.components().count()));
        Self { rules }
    }

    pub async fn load(db: &Database) -> Result<Self, EngineError> {
        let rules = db
            .list_rules()
            .await
            .map_err(|e| EngineError::StoreCorruption(e.to_string()))?;
        Ok(Self::new(rules))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.iter()
    }

    pub fn get(&self, id: &Uuid) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|rule| &rule.id == id)
    }

    /// The rule owning `path`, with the path relative to the rule root.
    ///
    /// The root itself resolves to `None`: it is never a file.
    pub fn resolve(&self, path: &Path) -> Option<(&Arc<Rule>, String)> {
        self.rules.iter().find_map(|rule| {
            let rest = path.strip_prefix(&rule.local_root).ok()?;
            relative_path(rest).map(|relative| (rule, relative))
        })
    }

    /// Import the rules of `config` into the store.
    ///
    /// Every new target is checked for reachability before anything is written, and all new
    /// rules are inserted in one transaction, so a failed import leaves the
    /// store untouched. Assigned ids are written back into `config`.
    pub async fn import<F>(
        db: &Database,
        config: &mut AgentConfig,
        connect: F,
    ) -> Result<ImportOutcome, EngineError>
    where
        F: Fn(
            &RemoteTarget,
            Option<&Credentials>,
        ) -> Result<Arc<dyn TransferBackend>, ObjectStoreError>,
    {
        let existing = db.list_rules().await?;
        let mut outcome = ImportOutcome::default();

        for rule_config in &config.rules {
            let previous = existing
                .iter()
                .find(|rule| rule.local_root == rule_config.local_root);

            match previous {
                Some(rule) if rule.remote_target == rule_config.remote => {
                    outcome.unchanged.push(rule.clone());
                }
                Some(rule) => {
                    return Err(EngineError::ConfigConflict(format!(
                        "local root {} is already mapped to {}/{} by rule {}",
                        rule.local_root.display(),
                        rule.remote_target.endpoint,
                        rule.remote_target.bucket,
                        rule.id
                    )));
                }
                None => {
                    let target = &rule_config.remote;
                    let unreachable = |source| EngineError::BackendUnreachable {
                        target: format!("{}/{}", target.endpoint, target.bucket),
                        source,
                    };

                    let backend = connect(target, config.credentials_for(target))
                        .map_err(|e| match e {
                            ObjectStoreError::InvalidConfig(msg) => {
                                EngineError::InvalidConfig(msg)
                            }
                            other => unreachable(other),
                        })?;
                    if let Err(e) = backend.check_reachable().await {
                        warn!(endpoint = %target.endpoint, bucket = %target.bucket, error = %e, "backend unreachable");
                        return Err(unreachable(e));
                    }

                    outcome
                        .created
                        .push(Rule::new(rule_config.local_root.clone(), target.clone()));
                }
            }
        }

        db.insert_rules(&outcome.created).await?;

        for rule_config in &mut config.rules {
            let assigned = outcome
                .created
                .iter()
                .chain(&outcome.unchanged)
                .find(|rule| rule.local_root == rule_config.local_root);
            rule_config.id = assigned.map(|rule| rule.id);
        }

        for rule in &outcome.created {
            info!(rule = %rule.id, root = %rule.local_root.display(), endpoint = %rule.remote_target.endpoint, "rule imported");
        }
        Ok(outcome)
    }
}

/// `/`-joined form of a relative path, `None` if empty or escaping upwards.
pub(crate) fn relative_path(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use object_store::Storage;

    use super::*;

    fn target(bucket: &str) -> RemoteTarget {
        RemoteTarget {
            endpoint: "memory://".to_string(),
            bucket: bucket.to_string(),
            prefix: "loft".to_string(),
            credentials_ref: None,
        }
    }

    fn config_for(roots: &[(&str, &str)]) -> AgentConfig {
        let mut config = AgentConfig::default();
        for (root, bucket) in roots {
            config.rules.push(crate::config::RuleConfig {
                id: None,
                local_root: PathBuf::from(root),
                remote: target(bucket),
                policy: Default::default(),
            });
        }
        config
    }

    fn memory_backend(
        _: &RemoteTarget,
        _: Option<&Credentials>,
    ) -> Result<Arc<dyn TransferBackend>, ObjectStoreError> {
        Ok(Arc::new(Storage::memory()))
    }

    fn unreachable_backend(
        _: &RemoteTarget,
        _: Option<&Credentials>,
    ) -> Result<Arc<dyn TransferBackend>, ObjectStoreError> {
        Err(ObjectStoreError::Unreachable("connection refused".to_string()))
    }

    #[test]
    fn test_resolve_longest_prefix() {
        let outer = Rule::new(PathBuf::from("/data"), target("a"));
        let inner = Rule::new(PathBuf::from("/data/photos"), target("b"));
        let registry = RuleRegistry::new([outer.clone(), inner.clone()]);

        let (rule, rel) = registry.resolve(Path::new("/data/photos/2024/x.jpg")).unwrap();
        assert_eq!(rule.id, inner.id);
        assert_eq!(rel, "2024/x.jpg");

        let (rule, rel) = registry.resolve(Path::new("/data/notes.txt")).unwrap();
        assert_eq!(rule.id, outer.id);
        assert_eq!(rel, "notes.txt");

        assert!(registry.resolve(Path::new("/data")).is_none());
        assert!(registry.resolve(Path::new("/elsewhere/file")).is_none());
        // Component-wise: /data/photos-old is not under /data/photos.
        let (rule, _) = registry.resolve(Path::new("/data/photos-old/y")).unwrap();
        assert_eq!(rule.id, outer.id);
    }

    #[test]
    fn test_relative_path() {
        assert_eq!(relative_path(Path::new("a/./b")).as_deref(), Some("a/b"));
        assert_eq!(relative_path(Path::new("")), None);
        assert_eq!(relative_path(Path::new("../x")), None);
    }

    #[tokio::test]
    async fn test_import_assigns_ids() {
        let db = Database::in_memory().await.unwrap();
        let mut config = config_for(&[("/data", "a"), ("/media", "b")]);

        let outcome = RuleRegistry::import(&db, &mut config, memory_backend)
            .await
            .unwrap();
        assert_eq!(outcome.created.len(), 2);
        assert!(config.rules.iter().all(|r| r.id.is_some()));

        let registry = RuleRegistry::load(&db).await.unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_reimport_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let mut first = config_for(&[("/data", "a")]);
        RuleRegistry::import(&db, &mut first, memory_backend)
            .await
            .unwrap();

        let mut second = config_for(&[("/data", "a")]);
        let outcome = RuleRegistry::import(&db, &mut second, memory_backend)
            .await
            .unwrap();
        assert!(outcome.created.is_empty());
        assert_eq!(second.rules[0].id, first.rules[0].id);
        assert_eq!(db.list_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_root_is_rejected() {
        let db = Database::in_memory().await.unwrap();
        let mut first = config_for(&[("/data", "a")]);
        RuleRegistry::import(&db, &mut first, memory_backend)
            .await
            .unwrap();

        let mut second = config_for(&[("/media", "c"), ("/data", "b")]);
        let err = RuleRegistry::import(&db, &mut second, memory_backend)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConfigConflict(_)));
        assert_eq!(db.list_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_target_leaves_store_unmodified() {
        let db = Database::in_memory().await.unwrap();
        let mut config = config_for(&[("/data", "a")]);

        let err = RuleRegistry::import(&db, &mut config, unreachable_backend)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BackendUnreachable { .. }));
        assert!(db.list_rules().await.unwrap().is_empty());
        assert!(config.rules[0].id.is_none());
    }
}
