use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;
use tracing::warn;
use uuid::Uuid;

use loft_daemon::engine::rebuild;
use loft_daemon::process;
use loft_daemon::state::StateError;
use loft_daemon::{Bias, EngineError, Mode, RebuildStats, Rule};

use crate::cli::op::{Op, OpContext};

/// Rebuild a rule's metadata from the remote listing and the local cache
///
/// Run it with the agent stopped.
#[derive(Args, Debug, Clone)]
pub struct Rebuild {
    /// Rule to rebuild
    pub rule_id: Uuid,
    /// Side that wins when a path exists on both: 0/remote or 1/local
    pub bias: Bias,
}

#[derive(Debug)]
pub struct RebuildOutput {
    pub rule_id: Uuid,
    pub bias: Bias,
    pub stats: RebuildStats,
    /// The store was unreadable and was replaced by an empty one
    pub reset: bool,
}

impl fmt::Display for RebuildOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reset {
            writeln!(
                f,
                "{} metadata store was unreadable and has been reset; rebuild every other rule too",
                "!".yellow()
            )?;
        }
        write!(
            f,
            "{} rebuilt {} ({}): {}",
            "✓".green(),
            self.rule_id.to_string().bold(),
            self.bias.dimmed(),
            self.stats
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[async_trait::async_trait]
impl Op for Rebuild {
    type Error = RebuildError;
    type Output = RebuildOutput;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let state = ctx.state()?;
        let config = state.saved_config()?.ok_or_else(|| {
            EngineError::InvalidConfig("no config imported; run `loft config import <file>`".into())
        })?;

        let (db, reset) = match state.open_database().await {
            Ok(db) => (db, false),
            Err(EngineError::StoreCorruption(reason)) => {
                warn!(%reason, "metadata store unreadable; starting a fresh one");
                (state.reset_database().await?, true)
            }
            Err(e) => return Err(e.into()),
        };

        let result: Result<RebuildStats, EngineError> = async {
            let rule = match db.get_rule(&self.rule_id).await? {
                Some(rule) => rule,
                None => {
                    let saved = config
                        .rule(&self.rule_id)
                        .ok_or(EngineError::UnknownRule(self.rule_id))?;
                    Rule::with_id(self.rule_id, saved.local_root.clone(), saved.remote.clone())
                }
            };
            let runtime = process::rule_runtime(&state, &config, &rule, Mode::Sync)?;
            rebuild(&db, &runtime, self.bias).await
        }
        .await;
        db.close().await;

        Ok(RebuildOutput {
            rule_id: self.rule_id,
            bias: self.bias,
            stats: result?,
            reset,
        })
    }
}
