//! FUSE protocol adapter.
//!
//! Translates kernel requests into [`Engine`] calls. FUSE inode numbers
//! are external handles as-is; the base root handle is the FUSE root.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::c_int;
use log::{debug, info, warn};

use crate::engine::{Attributes, Caller, Engine, SetAttr, TimeSpec};
use crate::error::Error;
use crate::handle::Handle;
use crate::inode::FileKind;

/// FUSE front end over a shared engine
pub struct LayerFs {
    engine: Arc<Engine>,
}

impl LayerFs {
    /// Wrap an engine for mounting
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// The wrapped engine
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn file_attr(attrs: &Attributes) -> FileAttr {
        FileAttr {
            ino: attrs.handle.0,
            size: attrs.size,
            blocks: attrs.blocks,
            atime: attrs.atime,
            mtime: attrs.mtime,
            ctime: attrs.ctime,
            crtime: attrs.crtime,
            kind: file_type(attrs.kind),
            perm: attrs.perm,
            nlink: attrs.nlink,
            uid: attrs.uid,
            gid: attrs.gid,
            rdev: attrs.rdev,
            blksize: attrs.blksize,
            flags: 0,
        }
    }

    fn reply_entry(&self, result: crate::Result<Attributes>, reply: ReplyEntry) {
        match result {
            Ok(attrs) => reply.entry(&self.engine.attr_ttl(), &Self::file_attr(&attrs), 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn reply_empty(result: crate::Result<()>, reply: ReplyEmpty) {
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::RegularFile => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
    }
}

fn time_spec(time: TimeOrNow) -> TimeSpec {
    match time {
        TimeOrNow::Now => TimeSpec::Now,
        TimeOrNow::SpecificTime(at) => TimeSpec::At(at),
    }
}

fn errno(err: Error) -> c_int {
    debug!("request failed: {}", err);
    err.errno()
}

// Names that are not UTF-8 are rejected
fn name_str(name: &OsStr) -> Result<&str, c_int> {
    name.to_str().ok_or(libc::EINVAL)
}

impl Filesystem for LayerFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("LayerFS mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        if let Err(e) = self.engine.shutdown() {
            warn!("Error during shutdown: {}", e);
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name_str(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e),
        };
        self.reply_entry(self.engine.lookup(Handle(parent), name), reply);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.engine.getattr(Handle(ino)) {
            Ok(attrs) => reply.attr(&self.engine.attr_ttl(), &Self::file_attr(&attrs)),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(time_spec),
            mtime: mtime.map(time_spec),
        };
        match self.engine.setattr(Handle(ino), &changes) {
            Ok(attrs) => reply.attr(&self.engine.attr_ttl(), &Self::file_attr(&attrs)),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.engine.readlink(Handle(ino)) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = match name_str(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e),
        };
        let caller = Caller::new(req.uid(), req.gid());
        let result = self.engine.mknod(Handle(parent), name, mode & !umask, rdev, caller);
        self.reply_entry(result, reply);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match name_str(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e),
        };
        let caller = Caller::new(req.uid(), req.gid());
        let result = self.engine.mkdir(Handle(parent), name, mode & !umask, caller);
        self.reply_entry(result, reply);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name_str(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e),
        };
        Self::reply_empty(self.engine.unlink(Handle(parent), name), reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name_str(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e),
        };
        Self::reply_empty(self.engine.rmdir(Handle(parent), name), reply);
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let (name, target) = match (name_str(link_name), target.to_str()) {
            (Ok(name), Some(target)) => (name, target),
            _ => return reply.error(libc::EINVAL),
        };
        let caller = Caller::new(req.uid(), req.gid());
        let result = self.engine.symlink(Handle(parent), name, target, caller);
        self.reply_entry(result, reply);
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
            // RENAME_EXCHANGE / RENAME_NOREPLACE
            return reply.error(libc::EINVAL);
        }
        let (name, newname) = match (name_str(name), name_str(newname)) {
            (Ok(name), Ok(newname)) => (name, newname),
            _ => return reply.error(libc::EINVAL),
        };
        let result = self
            .engine
            .rename(Handle(parent), name, Handle(newparent), newname);
        Self::reply_empty(result, reply);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let newname = match name_str(newname) {
            Ok(name) => name,
            Err(e) => return reply.error(e),
        };
        let result = self.engine.link(Handle(ino), Handle(newparent), newname);
        self.reply_entry(result, reply);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.engine.open(Handle(ino), flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.engine.read(Handle(ino), fh, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.engine.write(Handle(ino), fh, offset as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        Self::reply_empty(self.engine.flush(Handle(ino), fh), reply);
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        Self::reply_empty(self.engine.release(Handle(ino), fh), reply);
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        Self::reply_empty(self.engine.fsync(Handle(ino), fh, datasync), reply);
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.engine.opendir(Handle(ino), flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        // Offsets 1 and 2 are "." and ".."; engine cursors follow
        if offset < 1 && reply.add(ino, 1, FileType::Directory, ".") {
            return reply.ok();
        }
        if offset < 2 && reply.add(ino, 2, FileType::Directory, "..") {
            return reply.ok();
        }

        let cursor = (offset.max(2) - 2) as u64;
        match self.engine.readdir(Handle(ino), fh, cursor) {
            Ok(entries) => {
                for entry in entries {
                    let next = entry.cursor as i64 + 2;
                    if reply.add(entry.handle.0, next, file_type(entry.kind), &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(errno(e)),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        Self::reply_empty(self.engine.releasedir(Handle(ino), fh), reply);
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        Self::reply_empty(self.engine.fsync(Handle(ino), fh, datasync), reply);
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let st = self.engine.statfs();
        reply.statfs(
            st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen, st.frsize,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = match name_str(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e),
        };
        let result = self.engine.setxattr(Handle(ino), name, value).map(|root| {
            info!("clone {} created at {}", name, root);
        });
        Self::reply_empty(result, reply);
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, _name: &OsStr, _size: u32, reply: ReplyXattr) {
        match self.engine.getattr(Handle(ino)) {
            Ok(_) => reply.error(libc::ENODATA),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.engine.getattr(Handle(ino)) {
            Ok(_) if size == 0 => reply.size(0),
            Ok(_) => reply.data(&[]),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name_str(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e),
        };
        Self::reply_empty(self.engine.removexattr(Handle(ino), name), reply);
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match name_str(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e),
        };
        let caller = Caller::new(req.uid(), req.gid());
        match self.engine.create(Handle(parent), name, mode & !umask, flags, caller) {
            Ok((attrs, fh)) => {
                reply.created(&self.engine.attr_ttl(), &Self::file_attr(&attrs), 0, fh, 0)
            }
            Err(e) => reply.error(errno(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineConfig;

    #[test]
    fn test_file_attr_uses_handle_as_ino() {
        let engine = Arc::new(Engine::new(EngineConfig::default()).unwrap());
        let src = engine.mkdir(Handle::ROOT, "src", 0o755, Caller::new(0, 0)).unwrap();
        let root = engine.new_clone(src.handle, "snap").unwrap();
        let attrs = engine.getattr(root).unwrap();

        let attr = LayerFs::file_attr(&attrs);
        assert_eq!(attr.ino, root.0);
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(LayerFs::file_attr(&engine.getattr(Handle::ROOT).unwrap()).ino, 1);
    }

    #[test]
    fn test_errno_for_clone_conflicts() {
        assert_eq!(errno(Error::LayerBusy(1)), libc::EBUSY);
        assert_eq!(errno(Error::AlreadyExists), libc::EEXIST);
    }
}
