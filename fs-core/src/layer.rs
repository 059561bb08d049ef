//! Layer registry.
//!
//! The engine keeps one [`LayerTable`] behind a reader/writer lock: every
//! filesystem operation holds it shared, clone creation and removal hold
//! it exclusive. Inode resolution and allocation live here because they
//! walk the parent chain through the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;

use crate::error::{Error, Result};
use crate::handle::{Handle, LayerId, MAX_LOCAL_INO, ROOT_INO};
use crate::inode::{Inode, InodeRef, LockedInode, NewInode};
use crate::pages::BlockUsage;
use crate::table::{InodeTable, Slot};

/// Where a clone root is linked into the namespace
#[derive(Debug, Clone)]
pub struct CloneLink {
    /// Directory holding the clone's entry
    pub container: Handle,
    /// Entry name
    pub name: String,
}

/// One filesystem instance
#[derive(Debug)]
pub struct Layer {
    id: LayerId,
    parent: Option<LayerId>,
    root: u64,
    table: InodeTable,
    usage: Arc<BlockUsage>,
    link: Option<CloneLink>,
}

impl Layer {
    /// Create an empty layer
    pub fn new(
        id: LayerId,
        parent: Option<LayerId>,
        root: u64,
        total_blocks: Arc<AtomicU64>,
        link: Option<CloneLink>,
    ) -> Self {
        Self {
            id,
            parent,
            root,
            table: InodeTable::new(id),
            usage: Arc::new(BlockUsage::new(total_blocks)),
            link,
        }
    }

    /// Layer id
    pub fn id(&self) -> LayerId {
        self.id
    }

    /// Parent layer, `None` for the base layer
    pub fn parent(&self) -> Option<LayerId> {
        self.parent
    }

    /// Local inode number of the root directory
    pub fn root(&self) -> u64 {
        self.root
    }

    /// Inode table
    pub fn table(&self) -> &InodeTable {
        &self.table
    }

    /// Block counters
    pub fn usage(&self) -> &Arc<BlockUsage> {
        &self.usage
    }

    /// Container entry of a clone layer
    pub fn link(&self) -> Option<&CloneLink> {
        self.link.as_ref()
    }
}

/// Point-in-time counters of one layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerStats {
    /// Layer id
    pub id: LayerId,
    /// Parent layer
    pub parent: Option<LayerId>,
    /// Inodes materialized in the layer
    pub inodes: usize,
    /// Pages charged to the layer
    pub blocks: u64,
}

/// Registry of live layers
#[derive(Debug)]
pub struct LayerTable {
    layers: Vec<Option<Arc<Layer>>>,
    roots: HashMap<u64, LayerId>,
    max_layers: usize,
    next_ino: AtomicU64,
    total_blocks: Arc<AtomicU64>,
}

impl LayerTable {
    /// Registry holding only the base layer with its root directory
    pub fn new(max_layers: usize, root: NewInode, total_blocks: Arc<AtomicU64>) -> Self {
        let base = Layer::new(LayerId::BASE, None, ROOT_INO, Arc::clone(&total_blocks), None);
        base.table.insert(Inode::new(ROOT_INO, root, &base.usage));

        Self {
            layers: vec![Some(Arc::new(base))],
            roots: HashMap::new(),
            max_layers,
            next_ino: AtomicU64::new(ROOT_INO + 1),
            total_blocks,
        }
    }

    /// Look up a live layer
    pub fn get(&self, id: LayerId) -> Result<&Arc<Layer>> {
        self.layers
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(Error::NotFound)
    }

    /// Lowest free layer id
    pub fn allocate_id(&self) -> Result<LayerId> {
        let free = self.layers.iter().position(Option::is_none);
        let index = free.unwrap_or(self.layers.len());
        if index >= self.max_layers {
            return Err(Error::ResourceExhausted("layer ids"));
        }
        Ok(LayerId(index as u32))
    }

    /// Register a layer under its id
    pub fn insert(&mut self, layer: Layer) {
        let index = layer.id.index();
        if index >= self.layers.len() {
            self.layers.resize_with(index + 1, || None);
        }
        debug_assert!(self.layers[index].is_none(), "layer {} already live", layer.id);
        if layer.parent.is_some() {
            self.roots.insert(layer.root, layer.id);
        }
        self.layers[index] = Some(Arc::new(layer));
    }

    /// Unregister a layer, freeing its id
    pub fn remove(&mut self, id: LayerId) -> Option<Arc<Layer>> {
        let layer = self.layers.get_mut(id.index())?.take()?;
        self.roots.remove(&layer.root);
        while matches!(self.layers.last(), Some(None)) {
            self.layers.pop();
        }
        Some(layer)
    }

    /// Drop every clone layer, youngest first
    pub fn clear_clones(&mut self) -> usize {
        let mut dropped = 0;
        while self.layers.len() > 1 {
            if self.layers.pop().flatten().is_some() {
                dropped += 1;
            }
        }
        self.roots.clear();
        dropped
    }

    /// Whether any live layer names `id` as its parent
    pub fn has_children(&self, id: LayerId) -> bool {
        self.iter().any(|layer| layer.parent == Some(id))
    }

    /// Live layers in id order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Layer>> {
        self.layers.iter().flatten()
    }

    /// Number of live layers, base included
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Always false: the base layer is permanent
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Layer whose root is `ino`, if `ino` is a clone root
    pub fn clone_of_root(&self, ino: u64) -> Option<LayerId> {
        self.roots.get(&ino).copied()
    }

    /// Layer an entry found in `current` should be addressed in.
    ///
    /// Entries pointing at a clone root cross into that clone's layer.
    pub fn layer_for(&self, current: LayerId, ino: u64) -> LayerId {
        self.clone_of_root(ino).unwrap_or(current)
    }

    /// External handle for an entry found in `current`
    pub fn handle_for(&self, current: LayerId, ino: u64) -> Handle {
        Handle::encode(self.layer_for(current, ino), ino)
    }

    /// Counters of one layer
    pub fn stats(&self, id: LayerId) -> Result<LayerStats> {
        let layer = self.get(id)?;
        Ok(LayerStats {
            id,
            parent: layer.parent,
            inodes: layer.table.owned(),
            blocks: layer.usage.blocks(),
        })
    }

    /// Engine-wide page counter new layers report into
    pub fn block_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.total_blocks)
    }

    /// Pages charged across all layers
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks.load(Ordering::Relaxed)
    }

    /// Inode numbers handed out so far
    pub fn inodes_allocated(&self) -> u64 {
        self.next_ino.load(Ordering::Relaxed) - 1
    }

    /// Next engine-wide inode number
    pub fn allocate_ino(&self) -> Result<u64> {
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        if ino > MAX_LOCAL_INO {
            self.next_ino.store(MAX_LOCAL_INO + 1, Ordering::Relaxed);
            return Err(Error::ResourceExhausted("inode numbers"));
        }
        Ok(ino)
    }

    /// Create a new inode in `layer`, returned locked exclusive
    pub fn init(&self, layer: LayerId, params: NewInode) -> Result<LockedInode> {
        let layer = self.get(layer)?;
        let ino = self.allocate_ino()?;
        let inode = Inode::new(ino, params, &layer.usage);
        Ok(layer.table.insert(inode).lock(true))
    }

    /// Find `ino` as seen from `layer` and lock it.
    ///
    /// An inode owned by the layer is locked directly. Otherwise the
    /// parent chain is walked; with `want_copy` the ancestor's inode is
    /// copied into `layer` first, without it the ancestor's object itself
    /// is locked. `cached` short-circuits the walk for open files while
    /// the layer still has no copy of its own.
    pub fn resolve(
        &self,
        layer_id: LayerId,
        ino: u64,
        cached: Option<&InodeRef>,
        want_copy: bool,
        exclusive: bool,
    ) -> Result<LockedInode> {
        let layer = self.get(layer_id)?;
        match layer.table.slot(ino) {
            Slot::Owned(inode_ref) => return Ok(inode_ref.lock(exclusive)),
            Slot::Whiteout => return Err(Error::NotFound),
            Slot::Inherited => {}
        }

        if let Some(cached) = cached {
            if !want_copy {
                let locked = cached.lock(exclusive);
                if locked.attr.ino == ino {
                    return Ok(locked);
                }
            }
        }

        let mut cursor = layer.parent;
        while let Some(parent_id) = cursor {
            let ancestor = self.get(parent_id)?;
            match ancestor.table.slot(ino) {
                Slot::Owned(found) if !want_copy => return Ok(found.lock(exclusive)),
                Slot::Owned(found) => {
                    let copy = found.read().copy_up(&layer.usage);
                    debug!("copy-up of inode {} from {} into {}", ino, parent_id, layer_id);
                    let owned = layer.table.materialize(copy).ok_or(Error::NotFound)?;
                    return Ok(owned.lock(exclusive));
                }
                Slot::Whiteout => return Err(Error::NotFound),
                Slot::Inherited => cursor = ancestor.parent,
            }
        }
        Err(Error::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::FileKind;

    fn dir_params() -> NewInode {
        NewInode {
            kind: FileKind::Directory,
            perm: 0o755,
            uid: 0,
            gid: 0,
            rdev: 0,
            target: None,
        }
    }

    fn file_params() -> NewInode {
        NewInode {
            kind: FileKind::RegularFile,
            ..dir_params()
        }
    }

    fn registry() -> LayerTable {
        LayerTable::new(8, dir_params(), Arc::new(AtomicU64::new(0)))
    }

    fn add_child(table: &mut LayerTable, parent: LayerId, root: u64) -> LayerId {
        let id = table.allocate_id().unwrap();
        let total = table.block_counter();
        table.insert(Layer::new(id, Some(parent), root, total, None));
        id
    }

    #[test]
    fn test_base_root_exists() {
        let table = registry();
        let root = table.resolve(LayerId::BASE, ROOT_INO, None, false, false).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.attr.nlink, 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_lowest_free_id_reused() {
        let mut table = registry();
        let a = add_child(&mut table, LayerId::BASE, 100);
        let b = add_child(&mut table, LayerId::BASE, 101);
        assert_eq!((a, b), (LayerId(1), LayerId(2)));

        table.remove(a).unwrap();
        assert_eq!(table.allocate_id().unwrap(), LayerId(1));
        assert_eq!(table.layer_for(LayerId::BASE, 100), LayerId::BASE);
        assert_eq!(table.layer_for(LayerId::BASE, 101), b);
    }

    #[test]
    fn test_layer_id_ceiling() {
        let mut table = LayerTable::new(2, dir_params(), Arc::new(AtomicU64::new(0)));
        add_child(&mut table, LayerId::BASE, 50);
        assert!(matches!(table.allocate_id(), Err(Error::ResourceExhausted(_))));
    }

    #[test]
    fn test_inherited_read_does_not_copy() {
        let mut table = registry();
        let ino = table.init(LayerId::BASE, file_params()).unwrap().attr.ino;
        let child = add_child(&mut table, LayerId::BASE, 99);

        let seen = table.resolve(child, ino, None, false, false).unwrap();
        assert_eq!(seen.owner(), LayerId::BASE);
        drop(seen);
        assert_eq!(table.stats(child).unwrap().inodes, 0);
    }

    #[test]
    fn test_copy_up_sticks() {
        let mut table = registry();
        let ino = table.init(LayerId::BASE, file_params()).unwrap().attr.ino;
        let child = add_child(&mut table, LayerId::BASE, 99);

        {
            let mut copy = table.resolve(child, ino, None, true, true).unwrap();
            assert_eq!(copy.owner(), child);
            copy.attr.perm = 0o600;
        }

        // later reads in the child see the private copy, the base is untouched
        let seen = table.resolve(child, ino, None, false, false).unwrap();
        assert_eq!(seen.owner(), child);
        assert_eq!(seen.attr.perm, 0o600);
        let base = table.resolve(LayerId::BASE, ino, None, false, false).unwrap();
        assert_eq!(base.attr.perm, 0o755);
    }

    #[test]
    fn test_grandchild_walks_chain() {
        let mut table = registry();
        let ino = table.init(LayerId::BASE, file_params()).unwrap().attr.ino;
        let child = add_child(&mut table, LayerId::BASE, 99);
        let grandchild = add_child(&mut table, child, 98);

        assert!(table.has_children(child));
        let seen = table.resolve(grandchild, ino, None, false, false).unwrap();
        assert_eq!(seen.owner(), LayerId::BASE);
        assert!(matches!(
            table.resolve(grandchild, 12345, None, false, false),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_cached_ref_bypasses_walk() {
        let mut table = registry();
        let ino = table.init(LayerId::BASE, file_params()).unwrap().attr.ino;
        let child = add_child(&mut table, LayerId::BASE, 99);

        let cached = table.resolve(child, ino, None, false, false).unwrap().inode_ref().clone();
        let seen = table.resolve(child, ino, Some(&cached), false, false).unwrap();
        assert!(seen.inode_ref().ptr_eq(&cached));

        // once the child has its own copy the cache is ignored
        drop(seen);
        drop(table.resolve(child, ino, None, true, true).unwrap());
        let seen = table.resolve(child, ino, Some(&cached), false, false).unwrap();
        assert_eq!(seen.owner(), child);
    }

    #[test]
    fn test_whiteout_hides_ancestor() {
        let mut table = registry();
        let ino = table.init(LayerId::BASE, file_params()).unwrap().attr.ino;
        let child = add_child(&mut table, LayerId::BASE, 99);

        table.get(child).unwrap().table().reclaim(ino, true);
        assert!(matches!(
            table.resolve(child, ino, None, false, false),
            Err(Error::NotFound)
        ));
        assert!(table.resolve(LayerId::BASE, ino, None, false, false).is_ok());
    }
}
