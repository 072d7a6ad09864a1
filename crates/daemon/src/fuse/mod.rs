//! FUSE mounts for rules
//!
//! Each rule's `local_root` is mounted over its cache directory.
//!
//! # Architecture
//!
//! - `LoftFs`: `fuser::Filesystem` translating inodes and errno for a
//!   [`MountView`](crate::vfs::MountView)
//! - `InodeTable`: bidirectional inode ↔ path mapping
//! - [`Mount`]: a live session; dropping or unmounting it detaches the mount

mod inode_table;
mod loft_fs;

use std::path::{Path, PathBuf};

use fuser::{BackgroundSession, MountOption};
use libc::c_int;
use tokio::runtime::Handle;
use tracing::info;
use uuid::Uuid;

use crate::error::EngineError;
use crate::vfs::MountView;

pub use inode_table::InodeTable;
pub use loft_fs::LoftFs;

/// A mounted rule.
pub struct Mount {
    session: BackgroundSession,
    rule_id: Uuid,
    mountpoint: PathBuf,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("rule_id", &self.rule_id)
            .field("mountpoint", &self.mountpoint)
            .finish()
    }
}

impl Mount {
    pub fn rule_id(&self) -> Uuid {
        self.rule_id
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmount and wait for the session thread to exit.
    pub fn unmount(self) {
        info!(rule = %self.rule_id, mountpoint = %self.mountpoint.display(), "unmounting");
        self.session.join();
    }
}

/// Mount `view` over its rule's `local_root`.
pub fn mount(view: MountView, rt: Handle) -> Result<Mount, EngineError> {
    let rule_id = view.rule().id;
    let mountpoint = view.rule().local_root.clone();
    std::fs::create_dir_all(&mountpoint)?;

    let options = [
        MountOption::FSName(format!("loft:{rule_id}")),
        MountOption::Subtype("loft".to_string()),
        MountOption::DefaultPermissions,
    ];
    let session = fuser::spawn_mount2(LoftFs::new(view, rt), &mountpoint, &options)?;
    info!(rule = %rule_id, mountpoint = %mountpoint.display(), "mounted");

    Ok(Mount {
        session,
        rule_id,
        mountpoint,
    })
}

/// errno for an engine error surfaced through the mount.
pub(crate) fn errno(err: &EngineError) -> c_int {
    match err {
        EngineError::NotFound(_) | EngineError::UnknownRule(_) => libc::ENOENT,
        EngineError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        EngineError::ConfigConflict(_) | EngineError::InvalidConfig(_) => libc::EINVAL,
        EngineError::BackendUnreachable { .. }
        | EngineError::TransferFailed { .. }
        | EngineError::HydrationFailed { .. }
        | EngineError::StoreCorruption(_)
        | EngineError::ShuttingDown
        | EngineError::Database(_) => libc::EIO,
    }
}
