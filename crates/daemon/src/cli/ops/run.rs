//! Long-running modes. Each blocks until SIGINT or SIGTERM.

use clap::Args;

use loft_daemon::process;
use loft_daemon::state::StateError;
use loft_daemon::{EngineError, Mode};

use crate::cli::op::{Op, OpContext};

/// Offload stable files and evict them to stubs
#[derive(Args, Debug, Clone)]
pub struct SyncMode {}

/// Upload every write immediately and keep local copies
#[derive(Args, Debug, Clone)]
pub struct DirectMode {}

/// Log what would be uploaded or deleted without touching the remote
#[derive(Args, Debug, Clone)]
pub struct DryRunMode {}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

async fn run(ctx: &OpContext, mode: Mode) -> Result<String, RunError> {
    let state = ctx.state()?;
    process::run(&state, mode).await?;
    Ok(String::new())
}

#[async_trait::async_trait]
impl Op for SyncMode {
    type Error = RunError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        run(ctx, Mode::Sync).await
    }
}

#[async_trait::async_trait]
impl Op for DirectMode {
    type Error = RunError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        run(ctx, Mode::Direct).await
    }
}

#[async_trait::async_trait]
impl Op for DryRunMode {
    type Error = RunError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        run(ctx, Mode::DryRun).await
    }
}
