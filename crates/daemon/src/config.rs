//! Agent configuration file.
//!
//! Imported once with `loft config import <file>` (JSON, or TOML when the
//! file ends in `.toml`). The validated file is saved into the config
//! directory with the assigned rule ids so later runs and rebuilds can
//! find credentials, excludes and engine tuning.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use object_store::{Credentials, RcloneSections, RemoteTarget};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub credentials: BTreeMap<String, Credentials>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Regexes matched against rule-relative paths; matches are never offloaded.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub engine: EngineSettings,
    /// Remotes for `rclone://` targets. When empty, rclone uses its own
    /// default config file.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rclone: RcloneSections,
}

/// One rule as written by the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Filled in at import
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub local_root: PathBuf,
    pub remote: RemoteTarget,
    #[serde(default)]
    pub policy: EvictionPolicy,
}

/// Decides whether a stable file should be offloaded at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Offload every stable file
    #[default]
    Replicate,
    /// Only files last modified more than N seconds ago
    OlderThan(u64),
    /// Only files last modified less than N seconds ago
    NewerThan(u64),
    /// Only files larger than N bytes
    LargerThan(u64),
    /// Only files smaller than N bytes
    SmallerThan(u64),
}

impl EvictionPolicy {
    /// Whether a file of `size` bytes, last modified `age` ago, should be offloaded.
    pub fn admits(&self, size: u64, age: Duration) -> bool {
        match *self {
            EvictionPolicy::Replicate => true,
            EvictionPolicy::OlderThan(secs) => age > Duration::from_secs(secs),
            EvictionPolicy::NewerThan(secs) => age < Duration::from_secs(secs),
            EvictionPolicy::LargerThan(bytes) => size > bytes,
            EvictionPolicy::SmallerThan(bytes) => size < bytes,
        }
    }
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionPolicy::Replicate => write!(f, "replicate"),
            EvictionPolicy::OlderThan(s) => write!(f, "older than {s}s"),
            EvictionPolicy::NewerThan(s) => write!(f, "newer than {s}s"),
            EvictionPolicy::LargerThan(b) => write!(f, "larger than {b} bytes"),
            EvictionPolicy::SmallerThan(b) => write!(f, "smaller than {b} bytes"),
        }
    }
}

/// Engine tuning knobs, all in milliseconds unless noted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub quiet_period_ms: u64,
    pub sweep_interval_ms: u64,
    pub workers: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Node metadata cache capacity (entries)
    pub node_cache_entries: u64,
    pub node_cache_ttl_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            quiet_period_ms: 1_000,
            sweep_interval_ms: 250,
            workers: 4,
            max_attempts: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
            shutdown_grace_ms: 5_000,
            node_cache_entries: 10_000,
            node_cache_ttl_secs: 60,
        }
    }
}

impl AgentConfig {
    /// Read a config file, picking the format from its extension.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            toml::from_str(&raw).map_err(|e| EngineError::InvalidConfig(e.to_string()))
        } else {
            serde_json::from_str(&raw).map_err(|e| EngineError::InvalidConfig(e.to_string()))
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Check the file on its own: rules present, roots distinct, references resolvable.
    ///
    /// Relative roots are made absolute against `base`.
    pub fn validate(&mut self, base: &Path) -> Result<(), EngineError> {
        if self.rules.is_empty() {
            return Err(EngineError::InvalidConfig("no rules defined".to_string()));
        }

        for rule in &mut self.rules {
            if rule.local_root.is_relative() {
                rule.local_root = base.join(&rule.local_root);
            }
            rule.local_root = normalize(&rule.local_root);

            if let Some(name) = &rule.remote.credentials_ref {
                if !self.credentials.contains_key(name) {
                    return Err(EngineError::InvalidConfig(format!(
                        "rule {} references unknown credentials {:?}",
                        rule.local_root.display(),
                        name
                    )));
                }
            }

            if rule.remote.scheme().as_deref() == Some("rclone") && !self.rclone.is_empty() {
                let remote = rule.remote.endpoint["rclone://".len()..].trim_end_matches(':');
                if !self.rclone.contains_key(remote) {
                    return Err(EngineError::InvalidConfig(format!(
                        "rule {} uses rclone remote {:?}, which the rclone section does not define",
                        rule.local_root.display(),
                        remote
                    )));
                }
            }
        }

        for (i, a) in self.rules.iter().enumerate() {
            for b in &self.rules[i + 1..] {
                if a.local_root == b.local_root {
                    return Err(EngineError::ConfigConflict(format!(
                        "local root {} is mapped by more than one rule",
                        a.local_root.display()
                    )));
                }
            }
        }

        self.excludes()?;
        Ok(())
    }

    /// Compiled exclude patterns.
    pub fn excludes(&self) -> Result<RegexSet, EngineError> {
        RegexSet::new(&self.exclude_patterns)
            .map_err(|e| EngineError::InvalidConfig(format!("bad exclude pattern: {e}")))
    }

    pub fn credentials_for(&self, target: &RemoteTarget) -> Option<&Credentials> {
        target
            .credentials_ref
            .as_ref()
            .and_then(|name| self.credentials.get(name))
    }

    pub fn rule(&self, id: &Uuid) -> Option<&RuleConfig> {
        self.rules.iter().find(|rule| rule.id.as_ref() == Some(id))
    }
}

/// Lexically clean a path: drop `.` and trailing separators, fold `..`.
pub fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
