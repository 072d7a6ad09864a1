//! loft agent: a hybrid local/remote file store.
//!
//! Files written under a rule's `local_root` are uploaded to the rule's
//! remote target once they stop changing, then evicted to zero-length
//! stubs; reading a stub hydrates it back transparently.

pub mod config;
pub mod database;
pub mod engine;
pub mod error;
#[cfg(feature = "fuse")]
pub mod fuse;
pub mod process;
pub mod registry;
pub mod state;
pub mod vfs;

pub use config::{AgentConfig, EngineSettings, EvictionPolicy, RuleConfig};
pub use database::models::{Node, NodeKey, Rule};
pub use database::types::Pending;
pub use database::Database;
pub use engine::{Bias, Engine, EngineBuilder, EngineConfig, Mode, RebuildStats, RuleRuntime};
pub use error::EngineError;
pub use registry::{ImportOutcome, RuleRegistry};
pub use state::{AppState, StateError};
pub use vfs::MountView;
