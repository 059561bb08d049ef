//! Inode objects and their per-inode locks.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use serde::{Deserialize, Serialize};

use crate::blockdev::BLOCK_SIZE;
use crate::dir::DirEntries;
use crate::error::{Error, Result};
use crate::handle::LayerId;
use crate::pages::{BlockUsage, PageChain};

/// Object type of an inode or directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    /// Regular file
    RegularFile,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
}

/// Standard inode metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeAttr {
    /// Local inode number
    pub ino: u64,
    /// Size in bytes
    pub size: u64,
    /// 512-byte sectors allocated
    pub blocks: u64,
    /// Last access time
    pub atime: SystemTime,
    /// Last content modification time
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

/// Type-specific payload
#[derive(Debug)]
pub enum InodeKind {
    /// File contents
    Regular(PageChain),
    /// Directory entries
    Directory(DirEntries),
    /// Link target
    Symlink(String),
}

/// Parameters for a freshly initialized inode
#[derive(Debug, Clone)]
pub struct NewInode {
    /// Object type
    pub kind: FileKind,
    /// Permission bits
    pub perm: u16,
    /// Owner user id
    pub uid: u32,
    /// Owner group id
    pub gid: u32,
    /// Device number
    pub rdev: u32,
    /// Link target, symlinks only
    pub target: Option<String>,
}

/// A filesystem object
#[derive(Debug)]
pub struct Inode {
    /// Metadata
    pub attr: InodeAttr,
    removed: bool,
    kind: InodeKind,
}

impl Inode {
    /// Build a fresh inode numbered `ino` charging pages to `usage`.
    ///
    /// Directories start with nlink 2, everything else with 1.
    pub fn new(ino: u64, params: NewInode, usage: &Arc<BlockUsage>) -> Self {
        let now = SystemTime::now();
        let (kind, nlink, size) = match params.kind {
            FileKind::RegularFile => (InodeKind::Regular(PageChain::new(Arc::clone(usage))), 1, 0),
            FileKind::Directory => (InodeKind::Directory(DirEntries::new()), 2, 0),
            FileKind::Symlink => {
                let target = params.target.unwrap_or_default();
                let len = target.len() as u64;
                (InodeKind::Symlink(target), 1, len)
            }
        };

        Self {
            attr: InodeAttr {
                ino,
                size,
                blocks: 0,
                atime: now,
                mtime: now,
                ctime: now,
                crtime: now,
                perm: params.perm,
                nlink,
                uid: params.uid,
                gid: params.gid,
                rdev: params.rdev,
                blksize: BLOCK_SIZE as u32,
            },
            removed: false,
            kind,
        }
    }

    /// Private copy for a descendant layer.
    ///
    /// Metadata is duplicated, entries are copied and pages are shared
    /// until the copy writes to them.
    pub fn copy_up(&self, usage: &Arc<BlockUsage>) -> Self {
        let kind = match &self.kind {
            InodeKind::Regular(pages) => InodeKind::Regular(pages.share(Arc::clone(usage))),
            InodeKind::Directory(entries) => {
                let mut copy = DirEntries::new();
                copy.copy_all(entries);
                InodeKind::Directory(copy)
            }
            InodeKind::Symlink(target) => InodeKind::Symlink(target.clone()),
        };
        Self {
            attr: self.attr.clone(),
            removed: self.removed,
            kind,
        }
    }

    /// Object type
    pub fn file_kind(&self) -> FileKind {
        match self.kind {
            InodeKind::Regular(_) => FileKind::RegularFile,
            InodeKind::Directory(_) => FileKind::Directory,
            InodeKind::Symlink(_) => FileKind::Symlink,
        }
    }

    /// Type-specific payload
    pub fn kind(&self) -> &InodeKind {
        &self.kind
    }

    /// True for directories
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, InodeKind::Directory(_))
    }

    /// Directory entries, or `NotADirectory`
    pub fn dir(&self) -> Result<&DirEntries> {
        match &self.kind {
            InodeKind::Directory(entries) => Ok(entries),
            _ => Err(Error::NotADirectory),
        }
    }

    /// Mutable directory entries, or `NotADirectory`
    pub fn dir_mut(&mut self) -> Result<&mut DirEntries> {
        match &mut self.kind {
            InodeKind::Directory(entries) => Ok(entries),
            _ => Err(Error::NotADirectory),
        }
    }

    /// File pages; directories and symlinks are refused
    pub fn pages(&self) -> Result<&PageChain> {
        match &self.kind {
            InodeKind::Regular(pages) => Ok(pages),
            InodeKind::Directory(_) => Err(Error::IsADirectory),
            InodeKind::Symlink(_) => Err(Error::InvalidArgument("not a regular file".into())),
        }
    }

    /// Mutable file pages; directories and symlinks are refused
    pub fn pages_mut(&mut self) -> Result<&mut PageChain> {
        match &mut self.kind {
            InodeKind::Regular(pages) => Ok(pages),
            InodeKind::Directory(_) => Err(Error::IsADirectory),
            InodeKind::Symlink(_) => Err(Error::InvalidArgument("not a regular file".into())),
        }
    }

    /// Symlink target
    pub fn target(&self) -> Result<&str> {
        match &self.kind {
            InodeKind::Symlink(target) => Ok(target),
            _ => Err(Error::InvalidArgument("not a symbolic link".into())),
        }
    }

    /// Stamp the selected timestamps with the current time
    pub fn update_times(&mut self, atime: bool, mtime: bool, ctime: bool) {
        let now = SystemTime::now();
        if atime {
            self.attr.atime = now;
        }
        if mtime {
            self.attr.mtime = now;
        }
        if ctime {
            self.attr.ctime = now;
        }
    }

    /// Recompute `blocks` from the page chain
    pub fn refresh_blocks(&mut self) {
        if let InodeKind::Regular(pages) = &self.kind {
            self.attr.blocks = pages.sectors();
        }
    }

    /// Logically deleted and awaiting reclamation
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Mark as logically deleted
    pub fn mark_removed(&mut self) {
        self.removed = true;
    }

    /// Drop one link; returns true when the last one is gone
    pub fn drop_link(&mut self) -> bool {
        self.attr.nlink = self.attr.nlink.saturating_sub(1);
        self.attr.ctime = SystemTime::now();
        if self.attr.nlink == 0 {
            self.removed = true;
        }
        self.removed
    }
}

/// Shared reference to an inode materialized in some layer
#[derive(Debug, Clone)]
pub struct InodeRef {
    owner: LayerId,
    cell: Arc<RwLock<Inode>>,
}

impl InodeRef {
    /// Wrap an inode owned by `owner`
    pub fn new(owner: LayerId, inode: Inode) -> Self {
        Self {
            owner,
            cell: Arc::new(RwLock::new(inode)),
        }
    }

    /// Layer whose table holds this inode
    pub fn owner(&self) -> LayerId {
        self.owner
    }

    /// Acquire the inode lock
    pub fn lock(&self, exclusive: bool) -> LockedInode {
        let guard = if exclusive {
            Guard::Exclusive(self.cell.write_arc())
        } else {
            Guard::Shared(self.cell.read_arc())
        };
        LockedInode {
            guard,
            inode_ref: self.clone(),
        }
    }

    /// Short-lived shared borrow, used for copy-up
    pub(crate) fn read(&self) -> parking_lot::RwLockReadGuard<'_, Inode> {
        self.cell.read()
    }

    /// True when both refer to the same object
    pub fn ptr_eq(&self, other: &InodeRef) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

enum Guard {
    Shared(ArcRwLockReadGuard<RawRwLock, Inode>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, Inode>),
}

/// An inode held under its lock. Dropping it releases the lock.
pub struct LockedInode {
    guard: Guard,
    inode_ref: InodeRef,
}

impl LockedInode {
    /// Reference usable as a cached handle
    pub fn inode_ref(&self) -> &InodeRef {
        &self.inode_ref
    }

    /// Layer whose table holds this inode
    pub fn owner(&self) -> LayerId {
        self.inode_ref.owner
    }

    /// Whether the lock is held exclusively
    pub fn is_exclusive(&self) -> bool {
        matches!(self.guard, Guard::Exclusive(_))
    }

    /// Release the lock
    pub fn unlock(self) {}
}

impl Deref for LockedInode {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        match &self.guard {
            Guard::Shared(guard) => &**guard,
            Guard::Exclusive(guard) => &**guard,
        }
    }
}

impl DerefMut for LockedInode {
    fn deref_mut(&mut self) -> &mut Inode {
        match &mut self.guard {
            Guard::Exclusive(guard) => &mut **guard,
            Guard::Shared(_) => panic!("mutable access through a shared inode lock"),
        }
    }
}
