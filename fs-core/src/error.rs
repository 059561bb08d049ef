//! Error types for the LayerFS engine

use std::io;
use thiserror::Error;

use crate::blockdev::BlockDeviceError;
use crate::config::ConfigError;

/// Errors reported by engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// A referenced name, inode or layer does not exist
    #[error("File or directory not found")]
    NotFound,
    /// An inode found by name vanished before it could be resolved
    #[error("Stale inode reference")]
    Stale,
    /// Directory removal on a non-empty directory
    #[error("Directory not empty")]
    NotEmpty,
    /// Out of inode numbers, layer ids or blocks
    #[error("No space left: {0}")]
    ResourceExhausted(&'static str),
    /// The target name is already bound in the directory
    #[error("File or directory already exists")]
    AlreadyExists,
    /// A directory operation was given something else
    #[error("Not a directory")]
    NotADirectory,
    /// A file operation was given a directory
    #[error("Is a directory")]
    IsADirectory,
    /// Malformed request
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// The operation is not allowed on this object
    #[error("Operation not permitted")]
    NotPermitted,
    /// Both objects of a two-inode operation must live in one layer
    #[error("Cross-layer operation")]
    CrossLayer,
    /// A layer still has dependent child layers
    #[error("Layer {0} has live child layers")]
    LayerBusy(u32),
    /// Operation not supported
    #[error("Operation not supported")]
    Unsupported,
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Block device collaborator failure
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    /// Rejected engine configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Nearest standard errno for the protocol adapter
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::Stale => libc::ESTALE,
            Error::NotEmpty => libc::ENOTEMPTY,
            Error::ResourceExhausted(_) => libc::ENOSPC,
            Error::AlreadyExists => libc::EEXIST,
            Error::NotADirectory => libc::ENOTDIR,
            Error::IsADirectory => libc::EISDIR,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::NotPermitted => libc::EPERM,
            Error::CrossLayer => libc::EXDEV,
            Error::LayerBusy(_) => libc::EBUSY,
            Error::Unsupported => libc::ENOTSUP,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::BlockDevice(_) => libc::EIO,
            Error::Config(_) => libc::EINVAL,
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
