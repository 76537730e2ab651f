//! Reading archive entries out of tar layers.
//!
//! Parsing is left to the `tar` crate; this only maps its entries onto [`ArchiveEntry`].

use std::{
    ffi::OsStr,
    io::{BufRead, Read},
    os::unix::ffi::OsStrExt,
    path::Path,
};

use log::debug;
use tar::{Archive, Entry, EntryType};

use crate::{
    entry::{normalize_path, ArchiveEntry, EntryItem, Stat},
    error::{BuildError, Result},
};

const PAX_SCHILYXATTR: &[u8] = b"SCHILY.xattr.";
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

fn stat_from_tar_header(header: &tar::Header) -> Result<Stat> {
    Ok(Stat {
        st_uid: header.uid()? as u32,
        st_gid: header.gid()? as u32,
        st_mode: header.mode()?,
        st_mtim_sec: header.mtime()? as i64,
    })
}

fn xattr_entries<R: Read>(
    entry: &mut Entry<'_, R>,
    owner: &ArchiveEntry,
) -> Result<Vec<ArchiveEntry>> {
    let mut xattrs = vec![];
    if let Some(extensions) = entry.pax_extensions()? {
        for extension in extensions {
            let extension = extension?;
            if let Some(key) = extension.key_bytes().strip_prefix(PAX_SCHILYXATTR) {
                xattrs.push(ArchiveEntry {
                    path: owner.path.clone(),
                    stat: owner.stat.clone(),
                    item: EntryItem::Xattr {
                        key: OsStr::from_bytes(key).into(),
                        value: Box::from(extension.value_bytes()),
                        flags: 0,
                    },
                });
            }
        }
    }
    Ok(xattrs)
}

fn convert_entry<R: Read>(entry: &mut Entry<'_, R>) -> Result<Vec<ArchiveEntry>> {
    let path = match entry.path() {
        Ok(path) => normalize_path(&path),
        Err(err) => {
            let raw = entry.path_bytes();
            return Err(BuildError::from(err).for_entry(OsStr::from_bytes(&raw)));
        }
    };
    convert_entry_at(entry, &path).map_err(|err| err.for_entry(path))
}

fn convert_entry_at<R: Read>(entry: &mut Entry<'_, R>, path: &Path) -> Result<Vec<ArchiveEntry>> {
    let header = entry.header();
    let entry_type = header.entry_type();
    let stat = stat_from_tar_header(header)?;

    let item = match entry_type {
        EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => EntryItem::Regular {
            size: entry.size(),
        },

        EntryType::Directory => EntryItem::Directory,

        EntryType::Symlink => match entry.link_name()? {
            Some(target) => EntryItem::Symlink(target.as_os_str().into()),
            None => return Err(BuildError::MissingLinkTarget),
        },

        EntryType::Link => match entry.link_name()? {
            Some(target) => EntryItem::Hardlink(normalize_path(&target)),
            None => return Err(BuildError::MissingLinkTarget),
        },

        EntryType::Char | EntryType::Block => {
            let (major, minor) = match (header.device_major()?, header.device_minor()?) {
                (Some(major), Some(minor)) => (major, minor),
                _ => return Err(BuildError::MissingDeviceNumbers),
            };
            if entry_type == EntryType::Char {
                EntryItem::CharDevice { major, minor }
            } else {
                EntryItem::BlockDevice { major, minor }
            }
        }

        EntryType::Fifo => EntryItem::Fifo,

        EntryType::XGlobalHeader => {
            debug!("skipping global pax header");
            return Ok(vec![]);
        }

        other => return Err(BuildError::UnsupportedEntry(format!("{other:?}"))),
    };

    let owner = ArchiveEntry {
        path: path.to_path_buf(),
        stat,
        item,
    };
    let xattrs = xattr_entries(entry, &owner)?;

    let mut entries = Vec::with_capacity(1 + xattrs.len());
    entries.push(owner);
    entries.extend(xattrs);
    Ok(entries)
}

/// Iterates over the entries of a tar archive.  Each tar entry becomes one [`ArchiveEntry`],
/// followed by one `Xattr` entry per extended attribute recorded in its PAX header.
pub fn archive_entries<'a, R: Read + 'a>(
    archive: &'a mut Archive<R>,
) -> Result<impl Iterator<Item = Result<ArchiveEntry>> + 'a> {
    Ok(archive.entries()?.flat_map(|entry| {
        match entry.map_err(BuildError::from).and_then(|mut entry| convert_entry(&mut entry)) {
            Ok(entries) => entries.into_iter().map(Ok).collect::<Vec<_>>(),
            Err(err) => vec![Err(err)],
        }
    }))
}

/// Wraps `reader` in a zstd decoder if the stream starts with the zstd magic number.
pub fn decompressed<'a, R: BufRead + 'a>(mut reader: R) -> Result<Box<dyn Read + 'a>> {
    if reader.fill_buf()?.starts_with(&ZSTD_MAGIC) {
        debug!("zstd compressed archive");
        Ok(Box::new(zstd::stream::read::Decoder::with_buffer(reader)?))
    } else {
        Ok(Box::new(reader))
    }
}
