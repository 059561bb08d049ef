//! External handle codec.
//!
//! A handle packs a layer id into the high 32 bits and a layer-local
//! inode number into the low 32 bits. The base layer is id 0, so base
//! handles are numerically equal to their local inode numbers and the
//! base root is the FUSE root id.

use std::fmt;

/// Bit position of the layer id inside a handle
pub const LAYER_SHIFT: u32 = 32;

/// Largest local inode number a handle can carry
pub const MAX_LOCAL_INO: u64 = u32::MAX as u64;

/// Largest layer id a handle can carry
pub const MAX_LAYER_ID: u32 = u32::MAX;

/// Local inode number of the base layer's root directory
pub const ROOT_INO: u64 = 1;

/// Identifier of a layer in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LayerId(pub u32);

impl LayerId {
    /// The base layer
    pub const BASE: LayerId = LayerId(0);

    /// Index into the layer table
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Externally visible inode identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub u64);

impl Handle {
    /// Handle of the base layer root directory
    pub const ROOT: Handle = Handle(ROOT_INO);

    /// Pack a (layer, local inode) pair
    pub fn encode(layer: LayerId, ino: u64) -> Self {
        assert!(ino <= MAX_LOCAL_INO, "local inode {ino} exceeds handle space");
        Handle(((layer.0 as u64) << LAYER_SHIFT) | ino)
    }

    /// Unpack into (layer, local inode)
    pub fn decode(self) -> (LayerId, u64) {
        (self.layer(), self.ino())
    }

    /// Layer part
    pub fn layer(self) -> LayerId {
        LayerId((self.0 >> LAYER_SHIFT) as u32)
    }

    /// Local inode part
    pub fn ino(self) -> u64 {
        self.0 & MAX_LOCAL_INO
    }
}

impl From<u64> for Handle {
    fn from(raw: u64) -> Self {
        Handle(raw)
    }
}

impl From<Handle> for u64 {
    fn from(handle: Handle) -> u64 {
        handle.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.layer(), self.ino())
    }
}
