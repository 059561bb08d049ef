//! LayerFS Core - A layered, copy-on-write in-memory filesystem engine
//!
//! This crate provides the engine behind LayerFS: a base layer plus any
//! number of clone layers that share inodes and data pages until one of
//! them writes, at which point the object is copied into the writing
//! layer. The FUSE adapter is available behind the `fuse` feature.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

pub mod blockdev;
mod clone;
pub mod config;
pub mod dir;
pub mod engine;
pub mod error;
pub mod handle;
pub mod inode;
pub mod layer;
pub mod lock_order;
pub mod pages;
pub mod table;

#[cfg(feature = "fuse")]
pub mod fuse;

// Re-export the main types
pub use config::EngineConfig;
pub use engine::{Attributes, Caller, DirEntryOut, Engine, SetAttr, StatFs, TimeSpec};
pub use error::{Error, Result};
pub use handle::{Handle, LayerId};
pub use inode::FileKind;

#[cfg(feature = "fuse")]
pub use fuse::LayerFs;

/// Re-export common types and traits
pub mod prelude {
    pub use crate::blockdev::{BlockDevice, FileBackedBlockDevice, MemoryBlockDevice};
    pub use crate::engine::{Caller, Engine, SetAttr};
    pub use crate::error::Result;
    pub use crate::handle::Handle;
    pub use crate::EngineConfig;
}
