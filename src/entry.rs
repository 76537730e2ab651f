use std::{
    ffi::OsStr,
    fmt,
    path::{Path, PathBuf},
};

/// Ownership and permission metadata carried along with an entry.  The size model doesn't look
/// at any of this, but the populate pass needs it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub st_mode: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_mtim_sec: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryItem {
    Regular {
        size: u64,
    },
    Directory,
    /// Contains the target of the symlink, which is not resolved
    Symlink(Box<OsStr>),
    /// Contains the path of the inode being linked to
    /// The new name is in ArchiveEntry.path
    Hardlink(PathBuf),
    CharDevice {
        major: u32,
        minor: u32,
    },
    BlockDevice {
        major: u32,
        minor: u32,
    },
    Fifo,
    Socket,
    /// An extended attribute applying to the entry at ArchiveEntry.path
    Xattr {
        key: Box<OsStr>,
        value: Box<[u8]>,
        flags: i32,
    },
}

/// One record from the input stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub stat: Stat,
    pub item: EntryItem,
}

impl ArchiveEntry {
    pub fn new(path: impl AsRef<Path>, item: EntryItem) -> Self {
        ArchiveEntry {
            path: normalize_path(path.as_ref()),
            stat: Stat::default(),
            item,
        }
    }

    pub fn with_stat(mut self, stat: Stat) -> Self {
        self.stat = stat;
        self
    }
}

impl fmt::Display for ArchiveEntry {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let path = self.path.display();
        match &self.item {
            EntryItem::Regular { size } => write!(fmt, "{path} regular {size}"),
            EntryItem::Directory => write!(fmt, "{path} directory"),
            EntryItem::Symlink(target) => write!(fmt, "{path} -> {}", Path::new(target).display()),
            EntryItem::Hardlink(target) => write!(fmt, "{path} => {}", target.display()),
            EntryItem::CharDevice { major, minor } => write!(fmt, "{path} chrdev {major}:{minor}"),
            EntryItem::BlockDevice { major, minor } => write!(fmt, "{path} blkdev {major}:{minor}"),
            EntryItem::Fifo => write!(fmt, "{path} fifo"),
            EntryItem::Socket => write!(fmt, "{path} socket"),
            EntryItem::Xattr { key, value, .. } => {
                write!(fmt, "{path} xattr {key:?} ({} bytes)", value.len())
            }
        }
    }
}

/// Roots a path at "/" and drops "." components and trailing slashes, so that "./usr/bin/",
/// "usr/bin" and "/usr/bin" all compare equal.
///
/// ".." components are kept as-is: the archive producer is trusted not to escape the root.
pub fn normalize_path(path: &Path) -> PathBuf {
    PathBuf::from("/").join(path).components().collect()
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_normalize_path() {
        for (input, expected) in [
            ("", "/"),
            (".", "/"),
            ("./", "/"),
            ("usr/bin", "/usr/bin"),
            ("./usr/bin/", "/usr/bin"),
            ("/usr//bin", "/usr/bin"),
            ("/usr/./bin", "/usr/bin"),
        ] {
            assert_eq!(normalize_path(Path::new(input)), PathBuf::from(expected));
        }
    }

    #[test]
    fn test_display() {
        let entry = ArchiveEntry::new(
            "dev/null",
            EntryItem::CharDevice { major: 1, minor: 3 },
        );
        assert_eq!(entry.to_string(), "/dev/null chrdev 1:3");

        let entry = ArchiveEntry::new("./bin/sh", EntryItem::Symlink(OsStr::new("busybox").into()));
        assert_eq!(entry.to_string(), "/bin/sh -> busybox");
    }
}
