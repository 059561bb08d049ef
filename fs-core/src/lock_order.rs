//! Ordered acquisition of several inode locks.
//!
//! Operations touching more than one inode of a layer lock them through a
//! [`LockSet`], which always acquires in ascending inode number whatever
//! role each inode plays. Two operations naming the same directories in
//! opposite roles therefore queue on the same first lock.

use crate::error::Result;
use crate::handle::LayerId;
use crate::inode::LockedInode;
use crate::layer::LayerTable;

/// A group of inode locks held together and released on drop
pub struct LockSet {
    layer: LayerId,
    // sorted by inode number
    locks: Vec<(u64, LockedInode)>,
}

impl LockSet {
    /// Resolve and lock `inos` in `layer`, lowest number first.
    ///
    /// Duplicates are locked once. If any resolve fails the locks already
    /// taken are released before the error is returned.
    pub fn acquire(
        layers: &LayerTable,
        layer: LayerId,
        inos: &[u64],
        want_copy: bool,
        exclusive: bool,
    ) -> Result<Self> {
        let mut order = inos.to_vec();
        order.sort_unstable();
        order.dedup();

        let mut locks = Vec::with_capacity(order.len());
        for ino in order {
            let inode = layers.resolve(layer, ino, None, want_copy, exclusive)?;
            locks.push((ino, inode));
        }
        Ok(Self { layer, locks })
    }

    /// Copy-up and exclusively lock two inodes
    pub fn lock_pair(layers: &LayerTable, layer: LayerId, a: u64, b: u64) -> Result<Self> {
        Self::acquire(layers, layer, &[a, b], true, true)
    }

    /// Layer the locks belong to
    pub fn layer(&self) -> LayerId {
        self.layer
    }

    /// Locked inode numbers in acquisition order
    pub fn inos(&self) -> impl Iterator<Item = u64> + '_ {
        self.locks.iter().map(|(ino, _)| *ino)
    }

    fn position(&self, ino: u64) -> usize {
        match self.locks.binary_search_by_key(&ino, |(held, _)| *held) {
            Ok(pos) => pos,
            Err(_) => panic!("inode {ino} is not part of this lock set"),
        }
    }

    /// A held inode
    pub fn get(&self, ino: u64) -> &LockedInode {
        &self.locks[self.position(ino)].1
    }

    /// A held inode, mutably
    pub fn get_mut(&mut self, ino: u64) -> &mut LockedInode {
        let pos = self.position(ino);
        &mut self.locks[pos].1
    }

    /// Two distinct held inodes, mutably
    pub fn get2_mut(&mut self, a: u64, b: u64) -> (&mut LockedInode, &mut LockedInode) {
        assert_ne!(a, b, "get2_mut needs two distinct inodes");
        let (pa, pb) = (self.position(a), self.position(b));
        if pa < pb {
            let (low, high) = self.locks.split_at_mut(pb);
            (&mut low[pa].1, &mut high[0].1)
        } else {
            let (low, high) = self.locks.split_at_mut(pa);
            (&mut high[0].1, &mut low[pb].1)
        }
    }
}
