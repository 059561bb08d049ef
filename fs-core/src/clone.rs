//! Clone/snapshot manager.
//!
//! A clone is a new layer whose root directory starts as a copy of a
//! source directory's entries. The copy is shallow: the entries point at
//! the source's inodes, which the new layer inherits until it writes to
//! them. Both operations run under the exclusive registry lock.

use log::{info, warn};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::handle::{Handle, LayerId};
use crate::inode::{FileKind, Inode, NewInode};
use crate::layer::{CloneLink, Layer};

impl Engine {
    /// Clone the directory at `source` into a new layer.
    ///
    /// The clone root is linked as `name` into the snapshot root, or into
    /// the base root when no snapshot root has been designated. Returns
    /// the handle of the new root.
    pub fn new_clone(&self, source: Handle, name: &str) -> Result<Handle> {
        if name.is_empty() || name.contains('/') || name.len() > self.config.max_name_len {
            return Err(Error::InvalidArgument(format!("invalid clone name {name:?}")));
        }
        let container = self.clone_container();
        let mut layers = self.layers.write();
        let (src_layer, src_ino) = source.decode();

        // Snapshot the source namespace
        let (entries, attr) = {
            let src = layers.resolve(src_layer, src_ino, None, false, false)?;
            (src.dir()?.clone(), src.attr.clone())
        };

        let id = layers.allocate_id()?;
        let mut dir = layers.resolve(container.layer(), container.ino(), None, true, true)?;
        if dir.dir()?.lookup(name).is_some() {
            return Err(Error::AlreadyExists);
        }
        let root_ino = layers.allocate_ino()?;

        let layer = Layer::new(
            id,
            Some(src_layer),
            root_ino,
            layers.block_counter(),
            Some(CloneLink {
                container,
                name: name.to_string(),
            }),
        );

        let mut root = Inode::new(
            root_ino,
            NewInode {
                kind: FileKind::Directory,
                perm: attr.perm,
                uid: attr.uid,
                gid: attr.gid,
                rdev: 0,
                target: None,
            },
            layer.usage(),
        );
        root.dir_mut()?.copy_all(&entries);
        root.attr.nlink = attr.nlink;
        layer.table().insert(root);

        dir.dir_mut()?.add(root_ino, FileKind::Directory, name);
        dir.attr.nlink += 1;
        dir.update_times(false, true, true);
        dir.unlock();

        layers.insert(layer);
        info!(
            "Created clone {} as layer {} (parent {}, {} entries)",
            name,
            id,
            src_layer,
            entries.len()
        );
        Ok(Handle::encode(id, root_ino))
    }

    /// Destroy the clone whose root is `handle`.
    ///
    /// Fails with `LayerBusy` while another layer was cloned from it.
    pub fn remove_clone(&self, handle: Handle) -> Result<()> {
        let mut layers = self.layers.write();
        let (id, ino) = handle.decode();
        if id == LayerId::BASE {
            return Err(Error::InvalidArgument("the base layer cannot be removed".into()));
        }

        let layer = layers.get(id)?.clone();
        if layer.root() != ino {
            return Err(Error::InvalidArgument(format!("{handle} is not a clone root")));
        }
        if layers.has_children(id) {
            warn!("Refusing to remove layer {}: it has live child layers", id);
            return Err(Error::LayerBusy(id.0));
        }

        if let Some(link) = layer.link() {
            match layers.resolve(link.container.layer(), link.container.ino(), None, true, true) {
                Ok(mut dir) => {
                    if dir.dir_mut()?.remove(&link.name).is_some() {
                        dir.attr.nlink = dir.attr.nlink.saturating_sub(1);
                        dir.update_times(false, true, true);
                    }
                }
                Err(Error::NotFound) => {
                    warn!("Container of layer {} is gone, nothing to unlink", id);
                }
                Err(e) => return Err(e),
            }
        }

        layers.remove(id);
        info!("Removed clone layer {}", id);
        Ok(())
    }
}
