//! Per-layer inode table.
//!
//! A number with no slot is inherited from the parent layer. The table
//! lock is a leaf: it is never held while an inode lock is acquired.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::handle::LayerId;
use crate::inode::{Inode, InodeRef};

/// State of one inode number in one layer
#[derive(Debug, Clone)]
pub enum Slot {
    /// Not materialized here; defer to the parent layer
    Inherited,
    /// Privately owned by this layer
    Owned(InodeRef),
    /// Deleted here; ancestors' copies stay hidden
    Whiteout,
}

/// Sparse inode table of one layer
#[derive(Debug)]
pub struct InodeTable {
    owner: LayerId,
    slots: RwLock<HashMap<u64, Slot>>,
}

impl InodeTable {
    /// Empty table for `owner`
    pub fn new(owner: LayerId) -> Self {
        Self {
            owner,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Current slot state of `ino`
    pub fn slot(&self, ino: u64) -> Slot {
        self.slots.read().get(&ino).cloned().unwrap_or(Slot::Inherited)
    }

    /// Install a freshly created inode
    pub fn insert(&self, inode: Inode) -> InodeRef {
        let ino = inode.attr.ino;
        let inode_ref = InodeRef::new(self.owner, inode);
        let previous = self.slots.write().insert(ino, Slot::Owned(inode_ref.clone()));
        debug_assert!(
            !matches!(previous, Some(Slot::Owned(_))),
            "inode {ino} installed twice in {}",
            self.owner
        );
        inode_ref
    }

    /// Install a copied-up inode unless another thread got there first.
    ///
    /// Returns whichever copy ends up in the table, or `None` if the
    /// number was whited out in the meantime.
    pub fn materialize(&self, inode: Inode) -> Option<InodeRef> {
        let ino = inode.attr.ino;
        let mut slots = self.slots.write();
        match slots.get(&ino) {
            Some(Slot::Owned(existing)) => Some(existing.clone()),
            Some(Slot::Whiteout) => None,
            Some(Slot::Inherited) | None => {
                let inode_ref = InodeRef::new(self.owner, inode);
                slots.insert(ino, Slot::Owned(inode_ref.clone()));
                Some(inode_ref)
            }
        }
    }

    /// Release the slot of a deleted inode.
    ///
    /// Layers with a parent keep a whiteout so the ancestor copy never
    /// shows through again.
    pub fn reclaim(&self, ino: u64, has_parent: bool) {
        let mut slots = self.slots.write();
        if has_parent {
            slots.insert(ino, Slot::Whiteout);
        } else {
            slots.remove(&ino);
        }
    }

    /// Number of inodes owned by this layer
    pub fn owned(&self) -> usize {
        self.slots
            .read()
            .values()
            .filter(|slot| matches!(slot, Slot::Owned(_)))
            .count()
    }
}
