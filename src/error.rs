//! Error types for sizing and building layer images.
//!
//! Errors fall into three groups:
//!
//! - **Configuration**: [`InvalidBlockSize`], [`InvalidInodeSize`]
//! - **Per-entry processing**: [`Entry`] wrapping [`UnknownHardlinkTarget`],
//!   [`UnsupportedEntry`], [`SizeOverflow`] and friends
//! - **Formatting**: [`FormatSpawn`], [`FormatFailed`], [`FormatTimeout`]
//!
//! [`InvalidBlockSize`]: BuildError::InvalidBlockSize
//! [`InvalidInodeSize`]: BuildError::InvalidInodeSize
//! [`Entry`]: BuildError::Entry
//! [`UnknownHardlinkTarget`]: BuildError::UnknownHardlinkTarget
//! [`UnsupportedEntry`]: BuildError::UnsupportedEntry
//! [`SizeOverflow`]: BuildError::SizeOverflow
//! [`FormatSpawn`]: BuildError::FormatSpawn
//! [`FormatFailed`]: BuildError::FormatFailed
//! [`FormatTimeout`]: BuildError::FormatTimeout

use std::{path::PathBuf, process::ExitStatus, time::Duration};

use thiserror::Error;

/// Result type alias for operations that may return a BuildError.
pub type Result<T> = std::result::Result<T, BuildError>;

/// Phase of a size context, reported when an operation is called out of order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    Sizing,
    Finalized,
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Unsupported block size {0}")]
    InvalidBlockSize(u64),
    #[error("Unsupported inode size {inode_size} for block size {block_size}")]
    InvalidInodeSize { inode_size: u64, block_size: u64 },
    #[error("Operation not allowed while size context is {0:?}")]
    InvalidPhase(Phase),
    #[error("Filesystem size overflows 64 bits")]
    SizeOverflow,
    #[error("Hard link target {0:?} was not declared earlier in the archive")]
    UnknownHardlinkTarget(PathBuf),
    #[error("Unsupported archive entry type {0}")]
    UnsupportedEntry(String),
    #[error("Device entry without device numbers")]
    MissingDeviceNumbers,
    #[error("Link entry without a link target")]
    MissingLinkTarget,
    #[error("Failed to process entry {path:?}")]
    Entry {
        path: PathBuf,
        #[source]
        source: Box<BuildError>,
    },
    #[error("Failed to run {program:?}")]
    FormatSpawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{program:?} failed: {status}\n{stderr}")]
    FormatFailed {
        program: PathBuf,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{program:?} did not finish within {timeout:?}")]
    FormatTimeout { program: PathBuf, timeout: Duration },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// Attaches the path of the entry being processed to this error.
    pub fn for_entry(self, path: impl Into<PathBuf>) -> Self {
        BuildError::Entry {
            path: path.into(),
            source: Box::new(self),
        }
    }
}
