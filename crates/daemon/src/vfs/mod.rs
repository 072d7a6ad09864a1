//! File operations as seen through a rule's mount.
//!
//! [`MountView`] holds the semantics of every intercepted operation: stub
//! detection, hydration on read or write, metadata commits and change
//! events. The FUSE shim only translates inodes and errno; tests drive this
//! type directly.
//!
//! Paths are rule-relative and `/`-separated; `""` is the mount root.

use std::io;
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, instrument};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::database::models::{Node, NodeKey, Rule};
use crate::engine::{Engine, RuleRuntime};
use crate::error::EngineError;
use crate::registry::relative_path;

/// How often a write or read retries when its file is evicted again
/// between hydration and the I/O lock.
const STUB_RETRIES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Attributes of a path, with stubs reporting their remote size.
#[derive(Debug, Clone)]
pub struct Attr {
    pub kind: EntryKind,
    pub size: u64,
    /// Content currently lives only remotely
    pub stub: bool,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Attr {
    fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let ctime = UNIX_EPOCH
            + std::time::Duration::new(meta.ctime().max(0) as u64, meta.ctime_nsec().max(0) as u32);
        Self {
            kind: if meta.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            },
            size: meta.len(),
            stub: false,
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            atime: meta.accessed().unwrap_or(UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(UNIX_EPOCH),
            ctime,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// One rule's mount, backed by its cache directory.
#[derive(Debug, Clone)]
pub struct MountView {
    engine: Engine,
    runtime: Arc<RuleRuntime>,
}

impl MountView {
    pub fn new(engine: Engine, rule_id: Uuid) -> Result<Self, EngineError> {
        let runtime = engine
            .runtime(&rule_id)
            .cloned()
            .ok_or(EngineError::UnknownRule(rule_id))?;
        Ok(Self { engine, runtime })
    }

    pub fn rule(&self) -> &Rule {
        &self.runtime.rule
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn cache_dir(&self) -> &Path {
        &self.runtime.cache_dir
    }

    fn key(&self, relative: &str) -> NodeKey {
        self.runtime.key(relative)
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.runtime.cache_path(relative)
    }

    fn touched(&self, relative: &str) {
        self.engine.tracker().touched(self.key(relative));
    }

    pub async fn getattr(&self, relative: &str) -> Result<Attr, EngineError> {
        let meta = tokio::fs::metadata(self.path(relative))
            .await
            .map_err(io_error(relative))?;
        let mut attr = Attr::from_metadata(&meta);
        if meta.is_file() {
            if let Some(node) = self.engine.node(&self.key(relative)).await? {
                if node.is_stub() {
                    attr.size = node.size;
                    attr.stub = true;
                }
            }
        }
        Ok(attr)
    }

    pub async fn list_dir(&self, relative: &str) -> Result<Vec<DirEntry>, EngineError> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(self.path(relative))
            .await
            .map_err(io_error(relative))?;
        while let Some(entry) = dir.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                debug!(dir = %relative, "skipping non-UTF-8 name");
                continue;
            };
            let kind = if entry.file_type().await?.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            entries.push(DirEntry { name, kind });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Create (or open for writing) a file.
    #[instrument(skip(self), fields(rule = %self.runtime.id()))]
    pub async fn create(&self, relative: &str, mode: u32) -> Result<Attr, EngineError> {
        let key = self.key(relative);
        let slot = self.engine.paths().slot(&key);
        let path = self.path(relative);

        let changed = {
            let io = slot.lock_io().await;
            let existed = tokio::fs::try_exists(&path).await?;
            tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await
                .map_err(io_error(relative))?;

            if existed && self.engine.node_locked(&key, &io).await?.is_some() {
                false
            } else {
                if !existed {
                    set_mode(&path, mode).await?;
                }
                // Replaces any row left behind by a delete awaiting its remote ack.
                self.engine.commit(&Node::created(&key), &io).await?;
                slot.bump();
                true
            }
        };

        if changed {
            debug!(node = %key, "created");
            self.touched(relative);
        }
        self.getattr(relative).await
    }

    /// Write `data` at `offset`, hydrating a stub first.
    pub async fn write(&self, relative: &str, offset: u64, data: &[u8]) -> Result<u32, EngineError> {
        let key = self.key(relative);
        let slot = self.engine.paths().slot(&key);

        for _ in 0..STUB_RETRIES {
            {
                let io = slot.lock_io().await;
                let node = self.engine.node_locked(&key, &io).await?;
                if !node.as_ref().is_some_and(Node::is_stub) {
                    write_at(self.path(relative), offset, data.to_vec())
                        .await
                        .map_err(io_error(relative))?;
                    if node.is_none() {
                        self.engine.commit(&Node::created(&key), &io).await?;
                    }
                    slot.bump();
                    drop(io);
                    self.touched(relative);
                    return Ok(data.len() as u32);
                }
            }
            self.engine.hydrate(&key).await?;
        }
        Err(EngineError::hydration(relative, "evicted again before the write"))
    }

    /// Read up to `size` bytes at `offset`, hydrating a stub first.
    pub async fn read(&self, relative: &str, offset: u64, size: u32) -> Result<Vec<u8>, EngineError> {
        let key = self.key(relative);
        let slot = self.engine.paths().slot(&key);

        for _ in 0..STUB_RETRIES {
            {
                let io = slot.lock_io().await;
                let stub = self
                    .engine
                    .node_locked(&key, &io)
                    .await?
                    .is_some_and(|node| node.is_stub());
                if !stub {
                    return read_at(self.path(relative), offset, size as usize)
                        .await
                        .map_err(io_error(relative));
                }
            }
            self.engine.hydrate(&key).await?;
        }
        Err(EngineError::hydration(relative, "evicted again before the read"))
    }

    /// Set a file's length. A stub truncated to zero becomes an empty local
    /// file without fetching anything.
    pub async fn truncate(&self, relative: &str, size: u64) -> Result<Attr, EngineError> {
        let key = self.key(relative);
        let slot = self.engine.paths().slot(&key);
        let path = self.path(relative);

        for _ in 0..STUB_RETRIES {
            {
                let io = slot.lock_io().await;
                let node = self.engine.node_locked(&key, &io).await?;
                let stub = node.as_ref().is_some_and(Node::is_stub);
                if !stub || size == 0 {
                    set_len(&path, size).await.map_err(io_error(relative))?;
                    if stub || node.is_none() {
                        self.engine.commit(&Node::created(&key), &io).await?;
                    }
                    slot.bump();
                    drop(io);
                    self.touched(relative);
                    return self.getattr(relative).await;
                }
            }
            self.engine.hydrate(&key).await?;
        }
        Err(EngineError::hydration(relative, "evicted again before the truncate"))
    }

    /// Remove a file locally and schedule its remote deletion.
    #[instrument(skip(self), fields(rule = %self.runtime.id()))]
    pub async fn unlink(&self, relative: &str) -> Result<(), EngineError> {
        let key = self.key(relative);
        let mode = self.engine.mode();

        let slot = self.engine.paths().slot(&key);
        let (generation, tracked) = {
            let io = slot.lock_io().await;
            tokio::fs::remove_file(self.path(relative))
                .await
                .map_err(io_error(relative))?;
            let generation = slot.bump();
            let tracked = self.engine.node_locked(&key, &io).await?.is_some();
            if tracked && mode.drops_rows_eagerly() {
                self.engine.remove_node(&key, &io).await?;
            }
            (generation, tracked)
        };

        self.engine.tracker().forget(key.clone());
        if tracked {
            debug!(node = %key, "deleted; scheduling remote delete");
            self.engine.jobs().delete(slot, generation, mode.evicts())?;
        }
        Ok(())
    }

    /// Rename a file or directory.
    ///
    /// Files move their node row along. A stub moves remotely when the
    /// backend can; otherwise it is hydrated and moves like a local file,
    /// which is re-uploaded under the new name while the old object is
    /// deleted. Directories move file by file.
    #[instrument(skip(self), fields(rule = %self.runtime.id()))]
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), EngineError> {
        if from == to {
            return Ok(());
        }
        let meta = tokio::fs::metadata(self.path(from))
            .await
            .map_err(io_error(from))?;
        if meta.is_dir() {
            self.rename_dir(from, to).await
        } else {
            self.rename_file(from, to).await
        }
    }

    async fn rename_file(&self, from: &str, to: &str) -> Result<(), EngineError> {
        let from_key = self.key(from);
        let to_key = self.key(to);

        for _ in 0..STUB_RETRIES {
            if !self.runtime.backend.supports_move()
                && self
                    .engine
                    .node(&from_key)
                    .await?
                    .is_some_and(|node| node.is_stub())
            {
                self.engine.hydrate(&from_key).await?;
            }
            if self.try_rename_file(&from_key, &to_key).await? {
                return Ok(());
            }
        }
        Err(EngineError::hydration(from, "evicted again before the rename"))
    }

    /// `false` when the file turned out to be a stub the backend cannot move.
    async fn try_rename_file(&self, from_key: &NodeKey, to_key: &NodeKey) -> Result<bool, EngineError> {
        let from_slot = self.engine.paths().slot(from_key);
        let to_slot = self.engine.paths().slot(to_key);
        let forward = from_key < to_key;
        let (first, second) = if forward {
            (&from_slot, &to_slot)
        } else {
            (&to_slot, &from_slot)
        };

        let (node, from_generation) = {
            let _first_transfer = first.lock_transfer().await;
            let _second_transfer = second.lock_transfer().await;
            let first_io = first.lock_io().await;
            let second_io = second.lock_io().await;
            let (from_io, to_io) = if forward {
                (&first_io, &second_io)
            } else {
                (&second_io, &first_io)
            };

            let node = self.engine.node_locked(from_key, from_io).await?;
            let stub = node.as_ref().is_some_and(Node::is_stub);
            if stub && !self.runtime.backend.supports_move() {
                return Ok(false);
            }
            if stub {
                self.runtime
                    .backend
                    .rename(
                        &self.runtime.object_key(&from_key.path),
                        &self.runtime.object_key(&to_key.path),
                    )
                    .await
                    .map_err(|source| EngineError::TransferFailed {
                        path: from_key.to_string(),
                        attempts: 1,
                        source,
                    })?;
            }

            let to_path = self.path(&to_key.path);
            if let Some(parent) = to_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(self.path(&from_key.path), &to_path)
                .await
                .map_err(io_error(&from_key.path))?;

            if node.is_some() {
                self.engine
                    .move_node(from_key, to_key, from_io, to_io)
                    .await?;
            } else {
                self.engine.commit(&Node::created(to_key), to_io).await?;
            }
            to_slot.bump();
            (node, from_slot.bump())
        };

        self.engine.tracker().forget(from_key.clone());
        match node {
            Some(node) if node.is_stub() => {
                debug!(from = %from_key, to = %to_key, "moved remotely");
                self.engine.tracker().forget(to_key.clone());
            }
            Some(_) => {
                self.touched(&to_key.path);
                self.engine
                    .jobs()
                    .delete(from_slot, from_generation, false)?;
            }
            None => self.touched(&to_key.path),
        }
        Ok(true)
    }

    async fn rename_dir(&self, from: &str, to: &str) -> Result<(), EngineError> {
        let source = self.path(from);
        let target = self.path(to);
        tokio::fs::create_dir_all(&target).await?;

        let walk_root = source.clone();
        let entries = tokio::task::spawn_blocking(move || {
            let mut dirs = Vec::new();
            let mut files = Vec::new();
            for entry in WalkDir::new(&walk_root).min_depth(1) {
                let entry = entry?;
                let Some(relative) = entry
                    .path()
                    .strip_prefix(&walk_root)
                    .ok()
                    .and_then(relative_path)
                else {
                    continue;
                };
                if entry.file_type().is_dir() {
                    dirs.push(relative);
                } else {
                    files.push(relative);
                }
            }
            Ok::<_, walkdir::Error>((dirs, files))
        })
        .await
        .map_err(|e| EngineError::Io(io::Error::other(e)))?
        .map_err(|e| EngineError::Io(e.into()))?;
        let (dirs, files) = entries;

        for dir in &dirs {
            tokio::fs::create_dir_all(target.join(dir)).await?;
        }
        for file in &files {
            self.rename_file(&format!("{from}/{file}"), &format!("{to}/{file}"))
                .await?;
        }
        tokio::fs::remove_dir_all(&source).await?;
        Ok(())
    }

    pub async fn mkdir(&self, relative: &str, mode: u32) -> Result<Attr, EngineError> {
        let path = self.path(relative);
        tokio::fs::create_dir(&path)
            .await
            .map_err(io_error(relative))?;
        set_mode(&path, mode).await?;
        self.getattr(relative).await
    }

    pub async fn rmdir(&self, relative: &str) -> Result<(), EngineError> {
        tokio::fs::remove_dir(self.path(relative))
            .await
            .map_err(io_error(relative))?;
        Ok(())
    }

    pub async fn set_permissions(&self, relative: &str, mode: u32) -> Result<Attr, EngineError> {
        set_mode(&self.path(relative), mode).await?;
        self.getattr(relative).await
    }
}

fn io_error(relative: &str) -> impl FnOnce(io::Error) -> EngineError + '_ {
    move |e| {
        if e.kind() == io::ErrorKind::NotFound {
            EngineError::NotFound(relative.to_string())
        } else {
            EngineError::Io(e)
        }
    }
}

async fn set_mode(path: &Path, mode: u32) -> Result<(), EngineError> {
    let perm = std::fs::Permissions::from_mode(mode & 0o7777);
    tokio::fs::set_permissions(path, perm).await?;
    Ok(())
}

async fn set_len(path: &Path, size: u64) -> io::Result<()> {
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(size).await
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

async fn write_at(path: PathBuf, offset: u64, data: Vec<u8>) -> io::Result<()> {
    blocking(move || {
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.write_all_at(&data, offset)
    })
    .await
}

async fn read_at(path: PathBuf, offset: u64, size: usize) -> io::Result<Vec<u8>> {
    blocking(move || {
        let file = std::fs::File::open(&path)?;
        let len = file.metadata()?.len();
        if offset >= len {
            return Ok(Vec::new());
        }
        let wanted = size.min((len - offset) as usize);
        let mut buf = vec![0; wanted];
        let mut filled = 0;
        while filled < wanted {
            let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    })
    .await
}
