use std::{ffi::OsStr, path::Path};

use crate::{error::Result, image::BackingFile};

/// The finalized size of a filesystem: what the backing file must be allocated with before it is
/// formatted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeInfo {
    pub num_inodes: u64,
    pub total_size: u64,
}

/// The operations every on-disk format model provides.
///
/// A size context is started with `begin()`, fed one `add_*()` call per archive entry, closed
/// with `finalize()` and then read back with `result()`.  None of the `add_*()` calls perform any
/// I/O.  Once finalized, the model can write an empty filesystem of the computed size with
/// `format_empty()`.
///
/// Names and link targets are passed through for logging only: the model doesn't keep track of
/// them.
pub trait FilesystemBuilder {
    /// Starts a new size context.  Fails if either size isn't supported by the format.
    fn begin(&mut self, block_size: u64, inode_size: u64) -> Result<()>;

    fn add_regular_file(&mut self, name: &Path, size: u64) -> Result<()>;
    fn add_directory(&mut self, name: &Path) -> Result<()>;
    fn add_symlink(&mut self, source: &Path, target: &OsStr) -> Result<()>;
    fn add_hardlink(&mut self, source: &Path, target: &Path) -> Result<()>;
    fn add_char_device(&mut self, name: &Path, major: u32, minor: u32) -> Result<()>;
    fn add_block_device(&mut self, name: &Path, major: u32, minor: u32) -> Result<()>;
    fn add_fifo(&mut self, name: &Path) -> Result<()>;
    fn add_socket(&mut self, name: &Path) -> Result<()>;
    fn add_xattr(&mut self, name: &Path, key: &OsStr, value: &[u8], flags: i32) -> Result<()>;

    /// Applies the one-time overhead correction.  Must be called exactly once.
    fn finalize(&mut self) -> Result<()>;

    /// Returns the computed size.  Only valid after `finalize()`.
    fn result(&self) -> Result<SizeInfo>;

    /// Frees anything held by the size context.
    fn release(&mut self) -> Result<()>;

    /// Writes an empty filesystem into `file`, configured to match the finalized size context.
    fn format_empty(&self, file: &BackingFile) -> Result<()>;

    /// Writes an empty filesystem into `file` using the format's default settings.
    fn format_basic(&self, file: &BackingFile) -> Result<()>;
}
