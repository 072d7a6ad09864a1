use std::fmt;
use std::path::{Path, PathBuf};

use clap::Args;
use comfy_table::Table;
use owo_colors::OwoColorize;
use uuid::Uuid;

use loft_daemon::config::normalize;
use loft_daemon::state::StateError;
use loft_daemon::{AgentConfig, EngineError, EvictionPolicy, RuleRegistry};

use crate::cli::op::{Op, OpContext};

/// Show which rule owns each path and whether it would be offloaded
#[derive(Args, Debug, Clone)]
pub struct TestRule {
    /// Paths to check; relative paths resolve against the working directory
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    NoRule,
    Excluded,
    /// The file exists and the policy declines it today
    Kept(EvictionPolicy),
    Offload,
    /// No file to measure; the policy decides once it is written
    Undecided(EvictionPolicy),
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::NoRule => write!(f, "{}", "no rule".dimmed()),
            Verdict::Excluded => write!(f, "{}", "excluded".yellow()),
            Verdict::Kept(policy) => write!(f, "{} ({policy})", "kept local".yellow()),
            Verdict::Offload => write!(f, "{}", "offload".green()),
            Verdict::Undecided(policy) => write!(f, "offload if {policy}"),
        }
    }
}

#[derive(Debug)]
pub struct Resolution {
    pub path: PathBuf,
    pub rule: Option<(Uuid, String)>,
    pub verdict: Verdict,
}

#[derive(Debug)]
pub struct TestRuleOutput {
    pub resolutions: Vec<Resolution>,
}

impl fmt::Display for TestRuleOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut table = Table::new();
        table.set_header(vec!["Path", "Rule", "Relative path", "Verdict"]);
        for resolution in &self.resolutions {
            let (rule, relative) = match &resolution.rule {
                Some((id, relative)) => (id.to_string(), relative.clone()),
                None => ("-".to_string(), "-".to_string()),
            };
            table.add_row(vec![
                resolution.path.display().to_string(),
                rule,
                relative,
                resolution.verdict.to_string(),
            ]);
        }
        write!(f, "{table}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TestRuleError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[async_trait::async_trait]
impl Op for TestRule {
    type Error = TestRuleError;
    type Output = TestRuleOutput;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let state = ctx.state()?;
        let config = state.saved_config()?.unwrap_or_default();
        let excludes = config.excludes()?;

        let db = state.open_database().await?;
        let registry = RuleRegistry::load(&db).await;
        db.close().await;
        let registry = registry?;

        let cwd = std::env::current_dir().map_err(EngineError::from)?;
        let resolutions = self
            .paths
            .iter()
            .map(|path| {
                let path = normalize(&cwd.join(path));
                let Some((rule, relative)) = registry.resolve(&path) else {
                    return Resolution {
                        path,
                        rule: None,
                        verdict: Verdict::NoRule,
                    };
                };
                let verdict = if excludes.is_match(&relative) {
                    Verdict::Excluded
                } else {
                    policy_verdict(&config, &rule.id, &path)
                };
                Resolution {
                    rule: Some((rule.id, relative)),
                    path,
                    verdict,
                }
            })
            .collect();

        Ok(TestRuleOutput { resolutions })
    }
}

fn policy_verdict(config: &AgentConfig, rule_id: &Uuid, path: &Path) -> Verdict {
    let policy = config
        .rule(rule_id)
        .map(|rule| rule.policy)
        .unwrap_or_default();
    let Ok(metadata) = std::fs::metadata(path) else {
        return match policy {
            EvictionPolicy::Replicate => Verdict::Offload,
            policy => Verdict::Undecided(policy),
        };
    };

    let age = metadata
        .modified()
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .unwrap_or_default();
    if policy.admits(metadata.len(), age) {
        Verdict::Offload
    } else {
        Verdict::Kept(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::RemoteTarget;

    fn config_with(policy: EvictionPolicy) -> (AgentConfig, Uuid) {
        let id = Uuid::new_v4();
        let config = AgentConfig {
            rules: vec![loft_daemon::RuleConfig {
                id: Some(id),
                local_root: PathBuf::from("/data"),
                remote: RemoteTarget {
                    endpoint: "memory://".to_string(),
                    bucket: "test".to_string(),
                    prefix: "loft".to_string(),
                    credentials_ref: None,
                },
                policy,
            }],
            ..AgentConfig::default()
        };
        (config, id)
    }

    #[test]
    fn test_policy_verdict_for_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![0u8; 64]).unwrap();

        let (config, id) = config_with(EvictionPolicy::LargerThan(10));
        assert_eq!(policy_verdict(&config, &id, &path), Verdict::Offload);

        let (config, id) = config_with(EvictionPolicy::SmallerThan(10));
        assert_eq!(
            policy_verdict(&config, &id, &path),
            Verdict::Kept(EvictionPolicy::SmallerThan(10))
        );
    }

    #[test]
    fn test_policy_verdict_for_missing_file() {
        let missing = Path::new("/nonexistent/loft/file");

        let (config, id) = config_with(EvictionPolicy::Replicate);
        assert_eq!(policy_verdict(&config, &id, missing), Verdict::Offload);

        let (config, id) = config_with(EvictionPolicy::OlderThan(60));
        assert_eq!(
            policy_verdict(&config, &id, missing),
            Verdict::Undecided(EvictionPolicy::OlderThan(60))
        );
    }
}
