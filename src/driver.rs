//! Feeding archive entries into a [`FilesystemBuilder`].
//!
//! The driver makes a single pass over the entries, in order, dispatching each one to the
//! matching `add_*()` call.  Permissions and ownership are carried on the entries but don't
//! affect the size.

use std::{collections::HashSet, path::PathBuf};

use log::{info, warn};

use crate::{
    entry::{normalize_path, ArchiveEntry, EntryItem},
    error::{BuildError, Result},
    filesystem::{FilesystemBuilder, SizeInfo},
};

pub const DEFAULT_BLOCK_SIZE: u64 = 4096;
pub const DEFAULT_INODE_SIZE: u64 = 256;

/// Settings for one sizing pass.
#[derive(Clone, Debug)]
pub struct DriverOptions {
    pub block_size: u64,
    pub inode_size: u64,
    /// Reject hard links whose target hasn't been seen earlier in the stream.  When off, the
    /// archive producer is trusted to only link to entries it has already emitted.
    pub verify_hardlinks: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        DriverOptions {
            block_size: DEFAULT_BLOCK_SIZE,
            inode_size: DEFAULT_INODE_SIZE,
            verify_hardlinks: true,
        }
    }
}

pub struct ArchiveDriver<B: FilesystemBuilder> {
    builder: B,
    verify_hardlinks: bool,
    // normalized paths of everything a hard link may point at
    linkable: HashSet<PathBuf>,
    entries: u64,
}

impl<B: FilesystemBuilder> ArchiveDriver<B> {
    /// Starts a size context on `builder`.  Invalid block or inode sizes are reported here,
    /// before any entries are read.
    pub fn new(mut builder: B, options: &DriverOptions) -> Result<Self> {
        builder.begin(options.block_size, options.inode_size)?;
        Ok(ArchiveDriver {
            builder,
            verify_hardlinks: options.verify_hardlinks,
            linkable: HashSet::new(),
            entries: 0,
        })
    }

    fn dispatch(&mut self, entry: &ArchiveEntry) -> Result<()> {
        let path = entry.path.as_path();
        match &entry.item {
            EntryItem::Regular { size } => self.builder.add_regular_file(path, *size)?,
            EntryItem::Directory => self.builder.add_directory(path)?,
            EntryItem::Symlink(target) => self.builder.add_symlink(path, target)?,
            EntryItem::Hardlink(target) => {
                let target = normalize_path(target);
                if self.verify_hardlinks && !self.linkable.contains(&target) {
                    return Err(BuildError::UnknownHardlinkTarget(target));
                }
                self.builder.add_hardlink(path, &target)?
            }
            EntryItem::CharDevice { major, minor } => {
                self.builder.add_char_device(path, *major, *minor)?
            }
            EntryItem::BlockDevice { major, minor } => {
                self.builder.add_block_device(path, *major, *minor)?
            }
            EntryItem::Fifo => self.builder.add_fifo(path)?,
            EntryItem::Socket => self.builder.add_socket(path)?,
            EntryItem::Xattr { key, value, flags } => {
                self.builder.add_xattr(path, key, value, *flags)?
            }
        }

        if self.verify_hardlinks
            && !matches!(entry.item, EntryItem::Directory | EntryItem::Xattr { .. })
        {
            self.linkable.insert(normalize_path(path));
        }
        Ok(())
    }

    /// Accounts for one entry.  Errors carry the path of the entry.
    pub fn add_entry(&mut self, entry: &ArchiveEntry) -> Result<()> {
        self.dispatch(entry)
            .map_err(|err| err.for_entry(&entry.path))?;
        self.entries += 1;
        Ok(())
    }

    /// Finalizes the size context and hands back the builder, ready for `result()` and
    /// formatting.
    pub fn finish(mut self) -> Result<B> {
        self.builder.finalize()?;
        info!("sized {} entries", self.entries);
        Ok(self.builder)
    }

    /// Abandons the pass, releasing whatever the builder holds.
    pub fn abort(mut self) {
        if let Err(err) = self.builder.release() {
            warn!("failed to release size context: {err}");
        }
    }
}

/// Runs a complete sizing pass over `entries` and returns the finalized builder together with its
/// result.  On the first failing entry the pass stops and the partial totals are thrown away.
pub fn estimate<B, I>(builder: B, options: &DriverOptions, entries: I) -> Result<(B, SizeInfo)>
where
    B: FilesystemBuilder,
    I: IntoIterator<Item = Result<ArchiveEntry>>,
{
    let mut driver = ArchiveDriver::new(builder, options)?;
    for entry in entries {
        let result = entry.and_then(|entry| driver.add_entry(&entry));
        if let Err(err) = result {
            driver.abort();
            return Err(err);
        }
    }
    let builder = driver.finish()?;
    let info = builder.result()?;
    Ok((builder, info))
}
