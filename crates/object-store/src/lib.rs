//! Transfer backends for the loft agent.
//!
//! The agent never talks to a storage service directly. It drives a
//! [`TransferBackend`], which this crate implements three ways:
//!
//! - [`Storage`]: `object_store` backed (S3-compatible, local filesystem, or in-memory)
//! - [`RcloneBackend`]: shells out to an `rclone` binary
//! - [`DryRunBackend`]: simulates every mutation and forwards reads
//!
//! [`connect`] picks the implementation from a [`RemoteTarget`] endpoint.
//! [`render_config`] writes the rclone remotes an agent config declares.

mod backend;
mod dry_run;
mod error;
mod rclone;
mod storage;
mod target;

pub use backend::{connect, connect_with, RemoteObject, TransferBackend};
pub use dry_run::DryRunBackend;
pub use error::{ObjectStoreError, Result};
pub use rclone::{render_config, RcloneBackend, RcloneSections};
pub use storage::{ObjectStoreConfig, Storage};
pub use target::{Credentials, RemoteTarget, DEFAULT_PREFIX};
