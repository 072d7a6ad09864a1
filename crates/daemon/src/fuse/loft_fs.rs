//! `fuser::Filesystem` over a [`MountView`].
//!
//! Metadata operations block the session thread on the runtime. Anything
//! that may hydrate a stub (`read`, `write`, `setattr` and `rename`) moves
//! its reply into a runtime task instead, so a caller waiting on a download
//! never stalls the rest of the mount.

use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::errno;
use super::inode_table::InodeTable;
use crate::vfs::{Attr, EntryKind, MountView};

const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 4096;

pub struct LoftFs {
    view: MountView,
    inodes: Arc<Mutex<InodeTable>>,
    rt: Handle,
    next_fh: AtomicU64,
}

impl LoftFs {
    pub fn new(view: MountView, rt: Handle) -> Self {
        Self {
            view,
            inodes: Arc::new(Mutex::new(InodeTable::new())),
            rt,
            next_fh: AtomicU64::new(1),
        }
    }

    fn path(&self, ino: u64) -> Result<String, c_int> {
        self.inodes
            .lock()
            .get_path(ino)
            .map(str::to_string)
            .ok_or(libc::ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        let parent = self.path(parent)?;
        Ok(InodeTable::child_path(&parent, name))
    }

    fn file_attr(&self, path: &str, attr: &Attr) -> FileAttr {
        let ino = self.inodes.lock().get_or_create(path);
        to_file_attr(ino, attr)
    }

    fn fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolve `name` in `parent`, blocking the calling thread.
    pub fn lookup_entry(&self, parent: u64, name: &OsStr) -> Result<FileAttr, c_int> {
        let path = self.child(parent, name)?;
        let attr = self
            .rt
            .block_on(self.view.getattr(&path))
            .map_err(|e| errno(&e))?;
        Ok(self.file_attr(&path, &attr))
    }

    /// Attributes of `ino`, blocking the calling thread.
    pub fn attr(&self, ino: u64) -> Result<FileAttr, c_int> {
        let path = self.path(ino)?;
        let attr = self
            .rt
            .block_on(self.view.getattr(&path))
            .map_err(|e| errno(&e))?;
        Ok(to_file_attr(ino, &attr))
    }

    /// Truncate and/or chmod `ino` on the runtime.
    pub fn spawn_setattr(
        &self,
        ino: u64,
        size: Option<u64>,
        mode: Option<u32>,
    ) -> JoinHandle<Result<FileAttr, c_int>> {
        let path = self.path(ino);
        let view = self.view.clone();
        self.rt.spawn(async move {
            let path = path?;
            let result = async {
                if let Some(size) = size {
                    view.truncate(&path, size).await?;
                }
                if let Some(mode) = mode {
                    view.set_permissions(&path, mode).await?;
                }
                view.getattr(&path).await
            };
            match result.await {
                Ok(attr) => Ok(to_file_attr(ino, &attr)),
                Err(e) => {
                    debug!(path = %path, error = %e, "setattr failed");
                    Err(errno(&e))
                }
            }
        })
    }

    /// Rename on the runtime, moving the inode mapping once the view has.
    pub fn spawn_rename(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
    ) -> JoinHandle<Result<(), c_int>> {
        let paths = match (self.child(parent, name), self.child(newparent, newname)) {
            (Ok(from), Ok(to)) => Ok((from, to)),
            (Err(e), _) | (_, Err(e)) => Err(e),
        };
        let view = self.view.clone();
        let inodes = self.inodes.clone();
        self.rt.spawn(async move {
            let (from, to) = paths?;
            match view.rename(&from, &to).await {
                Ok(()) => {
                    inodes.lock().rename(&from, &to);
                    Ok(())
                }
                Err(e) => {
                    debug!(from = %from, to = %to, error = %e, "rename failed");
                    Err(errno(&e))
                }
            }
        })
    }
}

fn to_file_attr(ino: u64, attr: &Attr) -> FileAttr {
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.mtime,
        kind: match attr.kind {
            EntryKind::File => FileType::RegularFile,
            EntryKind::Directory => FileType::Directory,
        },
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

impl Filesystem for LoftFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_entry(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.attr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let task = self.spawn_setattr(ino, size, mode);
        self.rt.spawn(async move {
            match task.await {
                Ok(Ok(attr)) => reply.attr(&TTL, &attr),
                Ok(Err(e)) => reply.error(e),
                Err(_) => reply.error(libc::EIO),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        let entries = match self.rt.block_on(self.view.list_dir(&path)) {
            Ok(entries) => entries,
            Err(e) => return reply.error(errno(&e)),
        };

        let parent_ino = {
            let mut inodes = self.inodes.lock();
            inodes.get_or_create(InodeTable::parent_path(&path))
        };
        let mut listing = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        {
            let mut inodes = self.inodes.lock();
            for entry in entries {
                let child = inodes.get_or_create(&InodeTable::child_path(&path, &entry.name));
                let kind = match entry.kind {
                    EntryKind::File => FileType::RegularFile,
                    EntryKind::Directory => FileType::Directory,
                };
                listing.push((child, kind, entry.name));
            }
        }

        for (i, (child, kind, name)) in listing
            .into_iter()
            .enumerate()
            .skip(offset.max(0) as usize)
        {
            if reply.add(child, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        match self.rt.block_on(self.view.mkdir(&path, mode & !umask)) {
            Ok(attr) => reply.entry(&TTL, &self.file_attr(&path, &attr), 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        match self.rt.block_on(self.view.unlink(&path)) {
            Ok(()) => {
                self.inodes.lock().remove_by_path(&path);
                reply.ok()
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        match self.rt.block_on(self.view.rmdir(&path)) {
            Ok(()) => {
                self.inodes.lock().remove_by_path(&path);
                reply.ok()
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            // RENAME_NOREPLACE / RENAME_EXCHANGE are not offered.
            return reply.error(libc::EINVAL);
        }
        let task = self.spawn_rename(parent, name, newparent, newname);
        self.rt.spawn(async move {
            match task.await {
                Ok(Ok(())) => reply.ok(),
                Ok(Err(e)) => reply.error(e),
                Err(_) => reply.error(libc::EIO),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(self.fh(), 0);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        match self.rt.block_on(self.view.create(&path, mode & !umask)) {
            Ok(attr) => {
                let attr = self.file_attr(&path, &attr);
                reply.created(&TTL, &attr, 0, self.fh(), 0)
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        trace!(path = %path, offset, size, "read");

        let view = self.view.clone();
        self.rt.spawn(async move {
            match view.read(&path, offset, size).await {
                Ok(data) => reply.data(&data),
                Err(e) => {
                    debug!(path = %path, error = %e, "read failed");
                    reply.error(errno(&e))
                }
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        trace!(path = %path, offset, len = data.len(), "write");

        let view = self.view.clone();
        let data = data.to_vec();
        self.rt.spawn(async move {
            match view.write(&path, offset, &data).await {
                Ok(written) => reply.written(written),
                Err(e) => {
                    debug!(path = %path, error = %e, "write failed");
                    reply.error(errno(&e))
                }
            }
        });
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }
}
