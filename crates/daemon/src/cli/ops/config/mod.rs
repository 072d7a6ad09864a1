use clap::Args;

pub mod import;

use crate::cli::op::Op;

crate::command_enum! {
    (Import, import::Import),
}

pub type ConfigCommand = Command;

/// Manage the agent configuration
#[derive(Args, Debug, Clone)]
pub struct Config {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[async_trait::async_trait]
impl Op for Config {
    type Error = OpError;
    type Output = OpOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        self.command.execute(ctx).await
    }
}
