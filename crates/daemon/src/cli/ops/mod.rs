pub mod config;
pub mod rebuild;
pub mod run;
pub mod status;
pub mod test_rule;

pub use config::Config;
pub use rebuild::Rebuild;
pub use run::{DirectMode, DryRunMode, SyncMode};
pub use status::Status;
pub use test_rule::TestRule;

crate::command_enum! {
    (Config, Config),
    (Sync, SyncMode),
    (Direct, DirectMode),
    (DryRun, DryRunMode),
    (Rebuild, Rebuild),
    (TestRule, TestRule),
    (Status, Status),
}

impl Command {
    /// Long-running modes that start an engine and log to the agent log file.
    pub fn runs_engine(&self) -> bool {
        matches!(
            self,
            Command::Sync(_) | Command::Direct(_) | Command::DryRun(_)
        )
    }
}
