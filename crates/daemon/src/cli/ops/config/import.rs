use std::fmt;
use std::path::PathBuf;

use clap::Args;
use comfy_table::Table;
use owo_colors::OwoColorize;

use loft_daemon::state::StateError;
use loft_daemon::{AgentConfig, EngineError, Rule, RuleRegistry};

use crate::cli::op::{Op, OpContext};

/// Import rules and settings from a JSON or TOML file
#[derive(Args, Debug, Clone)]
pub struct Import {
    /// Config file to import
    pub file: PathBuf,
}

#[derive(Debug)]
pub struct ImportOutput {
    pub created: Vec<Rule>,
    pub unchanged: Vec<Rule>,
    pub saved_to: PathBuf,
}

impl fmt::Display for ImportOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut table = Table::new();
        table.set_header(vec!["Rule", "Local root", "Remote", "Status"]);
        let rows = self
            .created
            .iter()
            .map(|rule| (rule, "imported"))
            .chain(self.unchanged.iter().map(|rule| (rule, "unchanged")));
        for (rule, status) in rows {
            table.add_row(vec![
                rule.id.to_string(),
                rule.local_root.display().to_string(),
                format!(
                    "{}/{}",
                    rule.remote_target.endpoint, rule.remote_target.bucket
                ),
                status.to_string(),
            ]);
        }

        writeln!(f, "{table}")?;
        write!(
            f,
            "{} {} new, {} unchanged; saved to {}",
            "✓".green(),
            self.created.len().to_string().bold(),
            self.unchanged.len(),
            self.saved_to.display().dimmed()
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[async_trait::async_trait]
impl Op for Import {
    type Error = ImportError;
    type Output = ImportOutput;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let state = ctx.state()?;
        let mut config = AgentConfig::load(&self.file)?;

        // Remotes from earlier imports stay defined for the rules that use them.
        let saved = state.saved_config()?;
        if let Some(saved) = &saved {
            for (name, remote) in &saved.rclone {
                config
                    .rclone
                    .entry(name.clone())
                    .or_insert_with(|| remote.clone());
            }
        }
        config.validate(&std::env::current_dir().map_err(EngineError::from)?)?;
        let rclone_config = state.write_rclone_config(&config)?;

        let db = state.open_database().await?;
        let outcome = RuleRegistry::import(&db, &mut config, |target, credentials| {
            object_store::connect_with(target, credentials, rclone_config.as_deref())
        })
        .await;
        db.close().await;
        let outcome = outcome?;

        // Rules imported earlier stay live in the store; keep what the
        // runs need to reach them.
        if let Some(saved) = saved {
            for rule in saved.rules {
                let replaced = config
                    .rules
                    .iter()
                    .any(|current| current.local_root == rule.local_root);
                if !replaced && rule.id.is_some() {
                    config.rules.push(rule);
                }
            }
            for (name, credentials) in saved.credentials {
                config.credentials.entry(name).or_insert(credentials);
            }
        }
        state.save_config(&config)?;

        Ok(ImportOutput {
            created: outcome.created,
            unchanged: outcome.unchanged,
            saved_to: state.config_path.clone(),
        })
    }
}
