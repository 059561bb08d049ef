//! Operation orchestrator.
//!
//! [`Engine`] owns the layer registry and maps protocol-level requests on
//! external handles onto the inode, directory and page stores. Every
//! operation holds the registry shared; only clone creation, clone
//! removal and shutdown take it exclusive (see `clone.rs`).

use std::collections::HashMap;
use std::iter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::handle::{Handle, LayerId, ROOT_INO};
use crate::inode::{FileKind, Inode, InodeRef, LockedInode, NewInode};
use crate::layer::{LayerStats, LayerTable};
use crate::lock_order::LockSet;
use crate::table::Slot;

/// Largest byte offset a file may reach
pub const MAX_FILE_SIZE: u64 = i64::MAX as u64;

/// Identity of the process issuing a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
}

impl Caller {
    /// Caller with explicit ids
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Ids of the current process
    pub fn current() -> Self {
        Self {
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }
}

/// Attributes of one object as seen through a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    /// External handle the object was reached through
    pub handle: Handle,
    /// Object type
    pub kind: FileKind,
    /// Size in bytes
    pub size: u64,
    /// 512-byte sectors allocated
    pub blocks: u64,
    /// Last access time
    pub atime: SystemTime,
    /// Last modification time
    pub mtime: SystemTime,
    /// Last metadata change time
    pub ctime: SystemTime,
    /// Creation time
    pub crtime: SystemTime,
    /// Permission bits
    pub perm: u16,
    /// Hard link count
    pub nlink: u32,
    /// Owner user id
    pub uid: u32,
    /// Owner group id
    pub gid: u32,
    /// Device number
    pub rdev: u32,
    /// Preferred I/O size
    pub blksize: u32,
}

impl Attributes {
    fn new(handle: Handle, inode: &Inode) -> Self {
        let attr = &inode.attr;
        Self {
            handle,
            kind: inode.file_kind(),
            size: attr.size,
            blocks: attr.blocks,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.crtime,
            perm: attr.perm,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: attr.blksize,
        }
    }
}

/// One readdir result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryOut {
    /// Handle of the entry's inode
    pub handle: Handle,
    /// Entry type
    pub kind: FileKind,
    /// Entry name
    pub name: String,
    /// Cursor resuming after this entry
    pub cursor: u64,
}

/// Filesystem statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    /// Total data blocks
    pub blocks: u64,
    /// Free blocks
    pub bfree: u64,
    /// Free blocks available to unprivileged users
    pub bavail: u64,
    /// Total inodes
    pub files: u64,
    /// Free inodes
    pub ffree: u64,
    /// Block size
    pub bsize: u32,
    /// Maximum name length
    pub namelen: u32,
    /// Fragment size
    pub frsize: u32,
}

/// Timestamp value for setattr
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSpec {
    /// Current time
    Now,
    /// Explicit time
    At(SystemTime),
}

impl TimeSpec {
    fn resolve(self) -> SystemTime {
        match self {
            TimeSpec::Now => SystemTime::now(),
            TimeSpec::At(time) => time,
        }
    }
}

/// Metadata changes requested by setattr
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttr {
    /// Permission bits (file type bits are ignored)
    pub mode: Option<u32>,
    /// Owner
    pub uid: Option<u32>,
    /// Group
    pub gid: Option<u32>,
    /// New size; shrinking discards data
    pub size: Option<u64>,
    /// Access time
    pub atime: Option<TimeSpec>,
    /// Modification time
    pub mtime: Option<TimeSpec>,
}

struct OpenFile {
    handle: Handle,
    cached: Option<InodeRef>,
}

#[derive(Default)]
struct OpenFiles {
    next_fh: u64,
    files: HashMap<u64, OpenFile>,
    counts: HashMap<Handle, u32>,
}

impl OpenFiles {
    fn open(&mut self, handle: Handle, cached: Option<InodeRef>) -> u64 {
        self.next_fh += 1;
        let fh = self.next_fh;
        self.files.insert(fh, OpenFile { handle, cached });
        *self.counts.entry(handle).or_insert(0) += 1;
        fh
    }

    fn cached(&self, fh: u64) -> Option<InodeRef> {
        self.files.get(&fh).and_then(|file| file.cached.clone())
    }

    /// Forget `fh`; yields its handle when that was the last open
    fn close(&mut self, fh: u64) -> Option<Handle> {
        let file = self.files.remove(&fh)?;
        let count = self.counts.get_mut(&file.handle)?;
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&file.handle);
            Some(file.handle)
        } else {
            None
        }
    }

    fn is_open(&self, handle: Handle) -> bool {
        self.counts.contains_key(&handle)
    }

    fn clear(&mut self) {
        self.files.clear();
        self.counts.clear();
    }
}

/// Blocks set aside for an in-flight allocation, returned on drop
struct Reservation<'a> {
    reserved: &'a AtomicU64,
    blocks: u64,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.blocks > 0 {
            self.reserved.fetch_sub(self.blocks, Ordering::SeqCst);
        }
    }
}

/// Length of a write as reported back to the protocol
fn byte_count(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::InvalidArgument(format!("write of {len} bytes too large")))
}

fn stale(err: Error) -> Error {
    match err {
        Error::NotFound => Error::Stale,
        other => other,
    }
}

/// The layered filesystem engine
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) layers: RwLock<LayerTable>,
    device: Option<Arc<dyn BlockDevice>>,
    capacity: Option<u64>,
    snapshot_root: AtomicU64,
    open_files: Mutex<OpenFiles>,
    used: Arc<AtomicU64>,
    reserved: AtomicU64,
    // Serializes renames across directories
    rename_lock: Mutex<()>,
}

impl Engine {
    /// Create an engine with no backing device
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Create an engine sized against `device`
    pub fn with_device(config: EngineConfig, device: Arc<dyn BlockDevice>) -> Result<Self> {
        Self::build(config, Some(device))
    }

    fn build(config: EngineConfig, device: Option<Arc<dyn BlockDevice>>) -> Result<Self> {
        config.validate()?;

        let capacity = config
            .capacity_blocks
            .or_else(|| device.as_ref().map(|device| device.block_count()));
        let owner = Caller::current();
        let root = NewInode {
            kind: FileKind::Directory,
            perm: 0o755,
            uid: owner.uid,
            gid: owner.gid,
            rdev: 0,
            target: None,
        };
        let used = Arc::new(AtomicU64::new(0));
        let layers = LayerTable::new(config.max_layers, root, Arc::clone(&used));

        info!(
            "LayerFS engine created (capacity: {}, max layers: {})",
            capacity.map_or_else(|| "unlimited".to_string(), |blocks| format!("{blocks} blocks")),
            config.max_layers
        );

        Ok(Self {
            config,
            layers: RwLock::new(layers),
            device,
            capacity,
            snapshot_root: AtomicU64::new(0),
            open_files: Mutex::new(OpenFiles::default()),
            used,
            reserved: AtomicU64::new(0),
            rename_lock: Mutex::new(()),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Attribute cache lifetime for the protocol adapter
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_secs(self.config.attr_ttl_secs)
    }

    /// Handle of the designated snapshot root, if any
    pub fn snapshot_root(&self) -> Option<Handle> {
        match self.snapshot_root.load(Ordering::Acquire) {
            0 => None,
            ino => Some(Handle::encode(LayerId::BASE, ino)),
        }
    }

    /// Directory clone roots are linked into
    pub(crate) fn clone_container(&self) -> Handle {
        self.snapshot_root().unwrap_or(Handle::ROOT)
    }

    /// Number of live layers, base included
    pub fn layer_count(&self) -> usize {
        self.layers.read().len()
    }

    /// Counters of one layer
    pub fn layer_stats(&self, layer: LayerId) -> Result<LayerStats> {
        self.layers.read().stats(layer)
    }

    /// Pages in use across all layers
    pub fn used_blocks(&self) -> u64 {
        self.layers.read().total_blocks()
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(Error::InvalidArgument(format!("invalid name {name:?}")));
        }
        if name.len() > self.config.max_name_len {
            return Err(Error::InvalidArgument(format!(
                "name longer than {} bytes",
                self.config.max_name_len
            )));
        }
        Ok(())
    }

    fn lookup_entry(layers: &LayerTable, layer: LayerId, dir: u64, name: &str) -> Result<Option<u64>> {
        let dir = layers.resolve(layer, dir, None, false, false)?;
        Ok(dir.dir()?.lookup(name))
    }

    fn refuse_clone_root(layers: &LayerTable, ino: u64) -> Result<()> {
        if let Some(id) = layers.clone_of_root(ino) {
            warn!("refusing namespace change on the root of clone {}", id);
            return Err(Error::NotPermitted);
        }
        Ok(())
    }

    fn cacheable(layer: LayerId, inode: &LockedInode, flags: i32) -> Option<InodeRef> {
        let read_only = flags & libc::O_ACCMODE == libc::O_RDONLY;
        (read_only && inode.owner() != layer).then(|| inode.inode_ref().clone())
    }

    /// Free the slot of a deleted inode unless it is still open
    fn reclaim_if_unused(&self, layers: &LayerTable, layer: LayerId, inode: &LockedInode) {
        if !inode.is_removed() {
            return;
        }
        let ino = inode.attr.ino;
        if self.open_files.lock().is_open(Handle::encode(layer, ino)) {
            debug!("inode {} in {} still open, reclaim deferred", ino, layer);
            return;
        }
        if let Ok(owner) = layers.get(inode.owner()) {
            owner.table().reclaim(ino, owner.parent().is_some());
            debug!("reclaimed inode {} in {}", ino, owner.id());
        }
    }

    /// Set `needed` blocks aside against the capacity until the guard drops
    fn reserve(&self, needed: u64) -> Result<Reservation<'_>> {
        let mut reservation = Reservation {
            reserved: &self.reserved,
            blocks: 0,
        };
        let Some(capacity) = self.capacity else {
            return Ok(reservation);
        };
        if needed == 0 {
            return Ok(reservation);
        }
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |reserved| {
                let used = self.used.load(Ordering::SeqCst);
                (used + reserved + needed <= capacity).then_some(reserved + needed)
            })
            .map_err(|_| Error::ResourceExhausted("blocks"))?;
        reservation.blocks = needed;
        Ok(reservation)
    }

    /// Give every child layer still inheriting `inode` its own copy, so
    /// names it already holds keep resolving once the owner removes it
    fn preserve_for_children(layers: &LayerTable, inode: &LockedInode) {
        let owner = inode.owner();
        let ino = inode.attr.ino;
        for child in layers.iter().filter(|layer| layer.parent() == Some(owner)) {
            if !matches!(child.table().slot(ino), Slot::Inherited) {
                continue;
            }
            if child.table().materialize(inode.copy_up(child.usage())).is_some() {
                debug!("kept inode {} alive in {} before removal in {}", ino, child.id(), owner);
            }
        }
    }

    /// Whether directory `dir` is `target` or holds it somewhere below
    fn contains_dir(layers: &LayerTable, layer: LayerId, dir: u64, target: u64) -> Result<bool> {
        let mut pending = vec![dir];
        while let Some(ino) = pending.pop() {
            if ino == target {
                return Ok(true);
            }
            let inode = match layers.resolve(layer, ino, None, false, false) {
                Ok(inode) => inode,
                Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            };
            let Ok(entries) = inode.dir() else { continue };
            pending.extend(
                entries
                    .iter()
                    .filter(|entry| entry.kind() == FileKind::Directory)
                    .map(|entry| entry.ino())
                    .filter(|ino| layers.clone_of_root(*ino).is_none()),
            );
        }
        Ok(false)
    }

    fn sync_device(&self) -> Result<()> {
        if let Some(device) = &self.device {
            device.sync()?;
        }
        Ok(())
    }

    /// Resolve a slash-separated path from the base root
    pub fn lookup_path(&self, path: &str) -> Result<Attributes> {
        let mut attrs = self.getattr(Handle::ROOT)?;
        for name in path.split('/').filter(|part| !part.is_empty()) {
            attrs = self.lookup(attrs.handle, name)?;
        }
        Ok(attrs)
    }

    /// Find `name` in directory `parent`
    pub fn lookup(&self, parent: Handle, name: &str) -> Result<Attributes> {
        let layers = self.layers.read();
        let (layer, dir) = parent.decode();
        let child = Self::lookup_entry(&layers, layer, dir, name)?.ok_or(Error::NotFound)?;

        let child_layer = layers.layer_for(layer, child);
        let inode = layers
            .resolve(child_layer, child, None, false, false)
            .map_err(stale)?;
        Ok(Attributes::new(Handle::encode(child_layer, child), &inode))
    }

    /// Attributes of `handle`
    pub fn getattr(&self, handle: Handle) -> Result<Attributes> {
        let layers = self.layers.read();
        let (layer, ino) = handle.decode();
        let inode = layers.resolve(layer, ino, None, false, false)?;
        Ok(Attributes::new(handle, &inode))
    }

    /// Change metadata; a size change truncates or extends the file
    pub fn setattr(&self, handle: Handle, changes: &SetAttr) -> Result<Attributes> {
        let layers = self.layers.read();
        let (layer, ino) = handle.decode();
        let mut inode = layers.resolve(layer, ino, None, true, true)?;

        if let Some(size) = changes.size {
            if size > MAX_FILE_SIZE {
                return Err(Error::InvalidArgument(format!("size {size} too large")));
            }
            let current = inode.attr.size;
            let needed = if size < current {
                inode.pages()?.truncate_needed(size)
            } else {
                0
            };
            let _reservation = self.reserve(needed)?;
            let pages = inode.pages_mut()?;
            if size < current {
                pages.truncate_pages(size);
            }
            inode.attr.size = size;
            inode.refresh_blocks();
            inode.update_times(false, true, false);
        }
        if let Some(mode) = changes.mode {
            inode.attr.perm = (mode & 0o7777) as u16;
        }
        if let Some(uid) = changes.uid {
            inode.attr.uid = uid;
        }
        if let Some(gid) = changes.gid {
            inode.attr.gid = gid;
        }
        if let Some(atime) = changes.atime {
            inode.attr.atime = atime.resolve();
        }
        if let Some(mtime) = changes.mtime {
            inode.attr.mtime = mtime.resolve();
        }
        inode.update_times(false, false, true);

        Ok(Attributes::new(handle, &inode))
    }

    /// Target of a symbolic link
    pub fn readlink(&self, handle: Handle) -> Result<String> {
        let layers = self.layers.read();
        let (layer, ino) = handle.decode();
        let inode = layers.resolve(layer, ino, None, false, false)?;
        Ok(inode.target()?.to_string())
    }

    fn make_node(&self, parent: Handle, name: &str, params: NewInode) -> Result<Attributes> {
        self.check_name(name)?;
        let layers = self.layers.read();
        let (layer, dir_ino) = parent.decode();
        let kind = params.kind;

        let mut dir = layers.resolve(layer, dir_ino, None, true, true)?;
        if dir.is_removed() {
            return Err(Error::NotFound);
        }
        if dir.dir()?.lookup(name).is_some() {
            return Err(Error::AlreadyExists);
        }

        // New numbers are always above the directory's, so this keeps ascending order
        let inode = layers.init(layer, params)?;
        let ino = inode.attr.ino;
        dir.dir_mut()?.add(ino, kind, name);
        if kind == FileKind::Directory {
            dir.attr.nlink += 1;
        }
        dir.update_times(false, true, true);

        if kind == FileKind::Directory
            && layer == LayerId::BASE
            && dir_ino == ROOT_INO
            && name == self.config.snapshot_root_name
        {
            self.snapshot_root.store(ino, Ordering::Release);
            info!("Snapshot root designated: /{} (inode {})", name, ino);
        }

        debug!("created {:?} {} as {} in {}", kind, name, ino, parent);
        Ok(Attributes::new(Handle::encode(layer, ino), &inode))
    }

    /// Create a regular file node; other node types are unsupported
    pub fn mknod(&self, parent: Handle, name: &str, mode: u32, rdev: u32, caller: Caller) -> Result<Attributes> {
        let file_type = mode & libc::S_IFMT as u32;
        if file_type != 0 && file_type != libc::S_IFREG as u32 {
            return Err(Error::Unsupported);
        }
        let params = NewInode {
            kind: FileKind::RegularFile,
            perm: (mode & 0o7777) as u16,
            uid: caller.uid,
            gid: caller.gid,
            rdev,
            target: None,
        };
        self.make_node(parent, name, params)
    }

    /// Create a directory
    pub fn mkdir(&self, parent: Handle, name: &str, mode: u32, caller: Caller) -> Result<Attributes> {
        let params = NewInode {
            kind: FileKind::Directory,
            perm: (mode & 0o7777) as u16,
            uid: caller.uid,
            gid: caller.gid,
            rdev: 0,
            target: None,
        };
        self.make_node(parent, name, params)
    }

    /// Create and open a regular file
    pub fn create(
        &self,
        parent: Handle,
        name: &str,
        mode: u32,
        flags: i32,
        caller: Caller,
    ) -> Result<(Attributes, u64)> {
        let params = NewInode {
            kind: FileKind::RegularFile,
            perm: (mode & 0o7777) as u16,
            uid: caller.uid,
            gid: caller.gid,
            rdev: 0,
            target: None,
        };
        let attrs = self.make_node(parent, name, params)?;
        let fh = self.open_files.lock().open(attrs.handle, None);
        debug!("create {} flags {:#o} -> fh {}", attrs.handle, flags, fh);
        Ok((attrs, fh))
    }

    /// Create a symbolic link
    pub fn symlink(&self, parent: Handle, name: &str, target: &str, caller: Caller) -> Result<Attributes> {
        let params = NewInode {
            kind: FileKind::Symlink,
            perm: 0o777,
            uid: caller.uid,
            gid: caller.gid,
            rdev: 0,
            target: Some(target.to_string()),
        };
        self.make_node(parent, name, params)
    }

    /// Remove a non-directory entry
    pub fn unlink(&self, parent: Handle, name: &str) -> Result<()> {
        let layers = self.layers.read();
        let (layer, dir_ino) = parent.decode();

        loop {
            let child = Self::lookup_entry(&layers, layer, dir_ino, name)?.ok_or(Error::NotFound)?;
            Self::refuse_clone_root(&layers, child)?;
            if child == dir_ino {
                return Err(Error::InvalidArgument(format!("{name:?} names its own directory")));
            }

            let mut set = LockSet::lock_pair(&layers, layer, dir_ino, child).map_err(stale)?;
            if set.get(dir_ino).dir()?.lookup(name) != Some(child) {
                debug!("unlink of {} raced with a rename, retrying", name);
                continue;
            }

            let (dir, inode) = set.get2_mut(dir_ino, child);
            if inode.is_dir() {
                return Err(Error::IsADirectory);
            }
            if inode.attr.nlink <= 1 {
                Self::preserve_for_children(&layers, inode);
            }
            dir.dir_mut()?.remove(name);
            dir.update_times(false, true, true);
            inode.drop_link();

            self.reclaim_if_unused(&layers, layer, inode);
            return Ok(());
        }
    }

    /// Remove an empty directory.
    ///
    /// A directory counts as non-empty while its link count exceeds two
    /// or, unless `relaxed_rmdir` is set, while it holds any entry.
    pub fn rmdir(&self, parent: Handle, name: &str) -> Result<()> {
        let layers = self.layers.read();
        let (layer, dir_ino) = parent.decode();

        loop {
            let child = Self::lookup_entry(&layers, layer, dir_ino, name)?.ok_or(Error::NotFound)?;
            Self::refuse_clone_root(&layers, child)?;
            if child == dir_ino {
                return Err(Error::InvalidArgument(format!("{name:?} names its own directory")));
            }

            let mut set = LockSet::lock_pair(&layers, layer, dir_ino, child).map_err(stale)?;
            if set.get(dir_ino).dir()?.lookup(name) != Some(child) {
                debug!("rmdir of {} raced with a rename, retrying", name);
                continue;
            }

            let (dir, target) = set.get2_mut(dir_ino, child);
            let entries = target.dir()?.len();
            if target.attr.nlink > 2 || (entries > 0 && !self.config.relaxed_rmdir) {
                return Err(Error::NotEmpty);
            }
            if entries > 0 {
                warn!("rmdir of {} orphans {} entries", name, entries);
            }

            Self::preserve_for_children(&layers, target);
            dir.dir_mut()?.remove(name);
            dir.attr.nlink = dir.attr.nlink.saturating_sub(1);
            dir.update_times(false, true, true);
            target.attr.nlink = 0;
            target.mark_removed();
            target.update_times(false, false, true);

            if layer == LayerId::BASE
                && self
                    .snapshot_root
                    .compare_exchange(child, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                info!("Snapshot root /{} removed", name);
            }

            self.reclaim_if_unused(&layers, layer, target);
            return Ok(());
        }
    }

    /// Move `name` in `parent` to `newname` in `newparent`, replacing an
    /// existing compatible target
    pub fn rename(&self, parent: Handle, name: &str, newparent: Handle, newname: &str) -> Result<()> {
        self.check_name(newname)?;
        let (layer, sdir) = parent.decode();
        let (target_layer, tdir) = newparent.decode();
        if layer != target_layer {
            return Err(Error::CrossLayer);
        }
        let layers = self.layers.read();
        let _serial = (sdir != tdir).then(|| self.rename_lock.lock());

        loop {
            let src = Self::lookup_entry(&layers, layer, sdir, name)?.ok_or(Error::NotFound)?;
            let target = Self::lookup_entry(&layers, layer, tdir, newname)?;
            if target == Some(src) {
                return Ok(());
            }
            for ino in iter::once(src).chain(target) {
                Self::refuse_clone_root(&layers, ino)?;
            }
            if src == tdir || src == sdir || target == Some(sdir) {
                return Err(Error::InvalidArgument("cannot move a directory into itself".into()));
            }
            if sdir != tdir && Self::contains_dir(&layers, layer, src, tdir)? {
                return Err(Error::InvalidArgument("cannot move a directory below itself".into()));
            }

            let mut inos = vec![sdir, tdir, src];
            inos.extend(target);
            let mut set = LockSet::acquire(&layers, layer, &inos, true, true).map_err(stale)?;
            if set.get(sdir).dir()?.lookup(name) != Some(src)
                || set.get(tdir).dir()?.lookup(newname) != target
            {
                debug!("rename of {} raced, retrying", name);
                continue;
            }

            let moving_dir = set.get(src).is_dir();
            let kind = set.get(src).file_kind();
            if let Some(t) = target {
                let victim = set.get(t);
                let victim_dir = victim.is_dir();
                let victim_busy = victim_dir && (victim.attr.nlink > 2 || !victim.dir()?.is_empty());
                match (moving_dir, victim_dir) {
                    (false, true) => return Err(Error::IsADirectory),
                    (true, false) => return Err(Error::NotADirectory),
                    (true, true) if victim_busy => return Err(Error::NotEmpty),
                    _ => {}
                }
                if victim_dir || victim.attr.nlink <= 1 {
                    Self::preserve_for_children(&layers, victim);
                }

                // Detach the replaced target
                let to = set.get_mut(tdir);
                to.dir_mut()?.remove(newname);
                if moving_dir {
                    to.attr.nlink = to.attr.nlink.saturating_sub(1);
                }
                let victim = set.get_mut(t);
                if moving_dir {
                    victim.attr.nlink = 0;
                    victim.mark_removed();
                    victim.update_times(false, false, true);
                } else {
                    victim.drop_link();
                }
            }

            if sdir == tdir {
                let dir = set.get_mut(sdir);
                let entries = dir.dir_mut()?;
                if entries.count_links(src) == 1 {
                    entries.rename_entry(src, newname);
                } else {
                    entries.remove(name);
                    entries.add(src, kind, newname);
                }
                dir.update_times(false, true, true);
            } else {
                let (from, to) = set.get2_mut(sdir, tdir);
                from.dir_mut()?.remove(name);
                to.dir_mut()?.add(src, kind, newname);
                if moving_dir {
                    from.attr.nlink = from.attr.nlink.saturating_sub(1);
                    to.attr.nlink += 1;
                }
                from.update_times(false, true, true);
                to.update_times(false, true, true);
            }
            set.get_mut(src).update_times(false, false, true);

            if let Some(t) = target {
                self.reclaim_if_unused(&layers, layer, set.get(t));
            }
            debug!("renamed {}/{} -> {}/{}", parent, name, newparent, newname);
            return Ok(());
        }
    }

    /// Add another name for a file or symlink
    pub fn link(&self, handle: Handle, newparent: Handle, newname: &str) -> Result<Attributes> {
        self.check_name(newname)?;
        let (layer, ino) = handle.decode();
        let (target_layer, tdir) = newparent.decode();
        if layer != target_layer {
            return Err(Error::CrossLayer);
        }
        if ino == tdir {
            return Err(Error::NotPermitted);
        }
        let layers = self.layers.read();
        Self::refuse_clone_root(&layers, ino)?;

        let mut set = LockSet::lock_pair(&layers, layer, ino, tdir)?;
        let (inode, dir) = set.get2_mut(ino, tdir);
        if inode.is_dir() {
            return Err(Error::NotPermitted);
        }
        if inode.is_removed() {
            return Err(Error::NotFound);
        }
        let entries = dir.dir_mut()?;
        if entries.lookup(newname).is_some() {
            return Err(Error::AlreadyExists);
        }
        entries.add(ino, inode.file_kind(), newname);
        dir.update_times(false, true, true);
        inode.attr.nlink += 1;
        inode.update_times(false, false, true);

        Ok(Attributes::new(handle, inode))
    }

    /// Open a file and return a file handle
    pub fn open(&self, handle: Handle, flags: i32) -> Result<u64> {
        let layers = self.layers.read();
        let (layer, ino) = handle.decode();
        let inode = layers.resolve(layer, ino, None, false, false)?;
        if inode.is_dir() {
            return Err(Error::IsADirectory);
        }
        let cached = Self::cacheable(layer, &inode, flags);
        inode.unlock();

        let fh = self.open_files.lock().open(handle, cached);
        debug!("open {} -> fh {}", handle, fh);
        Ok(fh)
    }

    /// Open a directory for listing
    pub fn opendir(&self, handle: Handle, flags: i32) -> Result<u64> {
        let layers = self.layers.read();
        let (layer, ino) = handle.decode();
        let inode = layers.resolve(layer, ino, None, false, false)?;
        if !inode.is_dir() {
            return Err(Error::NotADirectory);
        }
        let cached = Self::cacheable(layer, &inode, flags);
        inode.unlock();

        Ok(self.open_files.lock().open(handle, cached))
    }

    /// Read up to `size` bytes at `offset`; reads stop at end of file
    pub fn read(&self, handle: Handle, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let cached = self.open_files.lock().cached(fh);
        let layers = self.layers.read();
        let (layer, ino) = handle.decode();
        let inode = layers.resolve(layer, ino, cached.as_ref(), false, false)?;
        let pages = inode.pages()?;

        let file_size = inode.attr.size;
        if offset >= file_size {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(size as u64).min(file_size);
        let mut out = vec![0u8; (end - offset) as usize];
        pages.read_pages(offset, end, &mut out);
        Ok(out)
    }

    /// Write `data` at `offset`, extending the file as needed
    pub fn write(&self, handle: Handle, fh: u64, offset: u64, data: &[u8]) -> Result<u32> {
        let count = byte_count(data.len())?;
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or_else(|| Error::InvalidArgument("write past maximum file size".into()))?;
        let layers = self.layers.read();
        let (layer, ino) = handle.decode();
        let mut inode = layers.resolve(layer, ino, None, true, true)?;

        let needed = inode.pages()?.pages_needed(offset, end);
        let _reservation = self.reserve(needed).map_err(|e| {
            warn!("write to {} (fh {}) needs {} blocks, device full", handle, fh, needed);
            e
        })?;

        // One call per page; only the first and last may be partial
        let pages = inode.pages_mut()?;
        let mut written = 0usize;
        while written < data.len() {
            let pos = offset + written as u64;
            let in_page = (pos % BLOCK_SIZE as u64) as usize;
            let len = (BLOCK_SIZE - in_page).min(data.len() - written);
            pages.add_page(pos / BLOCK_SIZE as u64, in_page, &data[written..written + len]);
            written += len;
        }

        if end > inode.attr.size {
            inode.attr.size = end;
        }
        inode.refresh_blocks();
        inode.update_times(false, true, true);
        Ok(count)
    }

    /// List `handle` starting after `cursor` entries
    pub fn readdir(&self, handle: Handle, fh: u64, cursor: u64) -> Result<Vec<DirEntryOut>> {
        let cached = self.open_files.lock().cached(fh);
        let layers = self.layers.read();
        let (layer, ino) = handle.decode();
        let dir = layers.resolve(layer, ino, cached.as_ref(), false, false)?;

        let entries = dir
            .dir()?
            .iter_from(cursor as usize)
            .zip(cursor + 1..)
            .map(|(entry, next)| DirEntryOut {
                handle: layers.handle_for(layer, entry.ino()),
                kind: entry.kind(),
                name: entry.name().to_string(),
                cursor: next,
            })
            .collect();
        Ok(entries)
    }

    /// Flush hook, forwarded to the block device
    pub fn flush(&self, _handle: Handle, _fh: u64) -> Result<()> {
        self.sync_device()
    }

    /// Sync hook, forwarded to the block device
    pub fn fsync(&self, _handle: Handle, _fh: u64, _datasync: bool) -> Result<()> {
        self.sync_device()
    }

    /// Close a file handle; the last close reclaims an unlinked inode
    pub fn release(&self, handle: Handle, fh: u64) -> Result<()> {
        let Some(closed) = self.open_files.lock().close(fh) else {
            return Ok(());
        };
        debug!("last handle on {} closed (fh {}, via {})", closed, fh, handle);

        let layers = self.layers.read();
        let (layer, ino) = closed.decode();
        let inode = match layers.resolve(layer, ino, None, false, false) {
            Ok(inode) => inode,
            Err(Error::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        if inode.owner() == layer {
            self.reclaim_if_unused(&layers, layer, &inode);
        }
        Ok(())
    }

    /// Close a directory handle
    pub fn releasedir(&self, handle: Handle, fh: u64) -> Result<()> {
        self.release(handle, fh)
    }

    /// Filesystem statistics
    pub fn statfs(&self) -> StatFs {
        let layers = self.layers.read();
        let blocks = self.capacity.unwrap_or(u32::MAX as u64);
        let free = blocks.saturating_sub(layers.total_blocks());
        let files = u32::MAX as u64;

        StatFs {
            blocks,
            bfree: free,
            bavail: free,
            files,
            ffree: files.saturating_sub(layers.inodes_allocated()),
            bsize: BLOCK_SIZE as u32,
            namelen: self.config.max_name_len as u32,
            frsize: BLOCK_SIZE as u32,
        }
    }

    /// Clone control: setting `name` on a directory clones it as `name`.
    ///
    /// A leading `user.` namespace is stripped from the attribute name.
    pub fn setxattr(&self, handle: Handle, name: &str, _value: &[u8]) -> Result<Handle> {
        let clone_name = name.strip_prefix("user.").unwrap_or(name);
        self.new_clone(handle, clone_name)
    }

    /// Clone control: removing any attribute from a clone root destroys it
    pub fn removexattr(&self, handle: Handle, _name: &str) -> Result<()> {
        self.remove_clone(handle)
    }

    /// Tear the engine down: drop clone layers, close handles, sync
    pub fn shutdown(&self) -> Result<()> {
        let dropped = {
            let mut layers = self.layers.write();
            layers.clear_clones()
        };
        self.open_files.lock().clear();
        self.sync_device()?;
        info!("LayerFS engine shut down ({} clone layers released)", dropped);
        Ok(())
    }
}
