use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use log::info;

use crate::{
    error::Result,
    filesystem::{FilesystemBuilder, SizeInfo},
};

/// A fixed-size file that a filesystem gets formatted into.
///
/// The formatting tool is pointed at the file by path, so the path is kept next to the handle.
/// The handle is closed when this is dropped.
#[derive(Debug)]
pub struct BackingFile {
    file: File,
    path: PathBuf,
}

impl BackingFile {
    /// Creates (or truncates) the file at `path` and sets its length to exactly `size` bytes.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size)?;
        Ok(BackingFile { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Allocates a file of exactly the finalized size at `path` and formats an empty filesystem into
/// it.  `builder` must have been finalized.
pub fn write_image(builder: &impl FilesystemBuilder, path: impl AsRef<Path>) -> Result<SizeInfo> {
    let info = builder.result()?;
    let file = BackingFile::create(path, info.total_size)?;
    info!(
        "writing image {:?}: {} bytes, {} inodes",
        file.path(),
        info.total_size,
        info.num_inodes
    );
    builder.format_empty(&file)?;
    Ok(info)
}

/// Allocates a file of `size` bytes at `path` and formats it with the format's default settings.
/// The size context of `builder` is not consulted.
pub fn write_basic_image(
    builder: &impl FilesystemBuilder,
    path: impl AsRef<Path>,
    size: u64,
) -> Result<()> {
    let file = BackingFile::create(path, size)?;
    info!("writing basic image {:?}: {size} bytes", file.path());
    builder.format_basic(&file)
}
