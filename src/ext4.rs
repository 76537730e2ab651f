//! Size model for ext4.
//!
//! [`Ext4Fs`] estimates how big an ext4 filesystem has to be to hold a given set of entries,
//! assuming the filesystem is created like so:
//!
//!  - no journal and no reserved GDT blocks for resizing
//!  - extent trees instead of direct/indirect block maps
//!  - hashed tree directories instead of linear ones
//!  - symlinks of up to 60 bytes are stored inline in the inode; nothing else is inline
//!  - sparse_super, so superblock backups only live in groups that are powers of 3, 5 and 7
//!  - every directory entry takes a full block (it doesn't, but it's a safe overestimate)
//!  - extended attributes fit in the inode
//!
//! Anything the model doesn't account for directly (inode tables, bitmaps, extent index blocks,
//! superblock backups) is covered by scaling the final size by 1.5.

use std::{ffi::OsStr, path::Path};

use log::{debug, info};

use crate::{
    error::{BuildError, Phase, Result},
    filesystem::{FilesystemBuilder, SizeInfo},
    image::BackingFile,
    mkfs::Mkfs,
};

/// ext4 reserves the first 11 inodes (bad blocks, root, journal, lost+found, ...).
pub const RESERVED_INODES: u64 = 11;

/// Boot sector plus primary superblock.
pub const SUPERBLOCK_REGION: u64 = 2048;

/// Symlink targets up to this many bytes live in the inode's i_block array.
pub const INLINE_SYMLINK_MAX: usize = 60;

/// The final size is aligned to this many blocks.
pub const SIZE_ALIGNMENT_BLOCKS: u64 = 64;

pub const MIN_BLOCK_SIZE: u64 = 1024;
pub const MAX_BLOCK_SIZE: u64 = 65536;
pub const MIN_INODE_SIZE: u64 = 128;

const DISABLED_FEATURES: &str = "^has_journal,^resize_inode";

/// Rounds `n` up to the next multiple of `align`, which must be non-zero.
fn align_up(n: u64, align: u64) -> Result<u64> {
    match n % align {
        0 => Ok(n),
        rem => n.checked_add(align - rem).ok_or(BuildError::SizeOverflow),
    }
}

/// floor(1.5 * n), without going through floating point.
fn scale_one_and_a_half(n: u64) -> Result<u64> {
    n.checked_add(n / 2).ok_or(BuildError::SizeOverflow)
}

/// The ext4 size model.  See the module documentation for the layout it assumes.
#[derive(Clone, Debug)]
pub struct Ext4Fs {
    block_size: u64,
    inode_size: u64,
    total_size: u64,
    num_inodes: u64,
    phase: Phase,
    mkfs: Mkfs,
}

impl Default for Ext4Fs {
    fn default() -> Self {
        Self::new(Mkfs::default())
    }
}

impl Ext4Fs {
    pub fn new(mkfs: Mkfs) -> Self {
        Ext4Fs {
            block_size: 0,
            inode_size: 0,
            total_size: 0,
            num_inodes: 0,
            phase: Phase::NotStarted,
            mkfs,
        }
    }

    /// The running totals.  Unlike `result()`, this is available before finalization.
    pub fn current(&self) -> SizeInfo {
        SizeInfo {
            num_inodes: self.num_inodes,
            total_size: self.total_size,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn ensure_phase(&self, expected: Phase) -> Result<()> {
        if self.phase != expected {
            return Err(BuildError::InvalidPhase(self.phase));
        }
        Ok(())
    }

    fn add_bytes(&mut self, bytes: u64) -> Result<()> {
        self.total_size = self
            .total_size
            .checked_add(bytes)
            .ok_or(BuildError::SizeOverflow)?;
        Ok(())
    }

    fn add_blocks(&mut self, blocks: u64) -> Result<()> {
        let bytes = blocks
            .checked_mul(self.block_size)
            .ok_or(BuildError::SizeOverflow)?;
        self.add_bytes(bytes)
    }

    fn add_inode(&mut self) -> Result<()> {
        self.ensure_phase(Phase::Sizing)?;
        self.add_bytes(self.inode_size)?;
        self.num_inodes += 1;
        Ok(())
    }

    fn format_path_args(&self, file: &BackingFile) -> [std::ffi::OsString; 2] {
        ["-F".into(), file.path().as_os_str().to_owned()]
    }
}

impl FilesystemBuilder for Ext4Fs {
    fn begin(&mut self, block_size: u64, inode_size: u64) -> Result<()> {
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(BuildError::InvalidBlockSize(block_size));
        }
        if !inode_size.is_power_of_two() || !(MIN_INODE_SIZE..=block_size).contains(&inode_size) {
            return Err(BuildError::InvalidInodeSize {
                inode_size,
                block_size,
            });
        }

        self.block_size = block_size;
        self.inode_size = inode_size;
        self.num_inodes = RESERVED_INODES;
        self.total_size = (SUPERBLOCK_REGION + RESERVED_INODES * inode_size).max(block_size);
        self.phase = Phase::Sizing;

        info!("begin: {:?}", self.current());
        Ok(())
    }

    fn add_regular_file(&mut self, name: &Path, size: u64) -> Result<()> {
        // one inode, one directory entry
        self.add_inode()?;
        self.add_blocks(1)?;

        // Each extent covers 32k blocks, so the four extents in i_block hold 128MB at 4k blocks.
        // Bigger files need extent index blocks, which the final scaling covers.
        self.add_bytes(align_up(size, self.block_size)?)?;
        debug!("regular file {name:?} ({size}): {:?}", self.current());
        Ok(())
    }

    fn add_directory(&mut self, name: &Path) -> Result<()> {
        // the entry in the parent, plus "." and ".." in the new directory
        self.add_inode()?;
        self.add_blocks(3)?;
        debug!("directory {name:?}: {:?}", self.current());
        Ok(())
    }

    fn add_symlink(&mut self, source: &Path, target: &OsStr) -> Result<()> {
        self.add_inode()?;
        if target.len() > INLINE_SYMLINK_MAX {
            // PATH_MAX is 4096 so this is always a single extent
            self.add_bytes(align_up(target.len() as u64, self.block_size)?)?;
        }
        debug!("symlink {source:?} -> {target:?}: {:?}", self.current());
        Ok(())
    }

    fn add_hardlink(&mut self, source: &Path, target: &Path) -> Result<()> {
        // a directory entry pointing at an existing inode
        self.ensure_phase(Phase::Sizing)?;
        self.add_blocks(1)?;
        debug!("hardlink {source:?} => {target:?}: {:?}", self.current());
        Ok(())
    }

    fn add_char_device(&mut self, name: &Path, major: u32, minor: u32) -> Result<()> {
        self.add_inode()?;
        debug!("char device {name:?} {major}:{minor}: {:?}", self.current());
        Ok(())
    }

    fn add_block_device(&mut self, name: &Path, major: u32, minor: u32) -> Result<()> {
        self.add_inode()?;
        debug!("block device {name:?} {major}:{minor}: {:?}", self.current());
        Ok(())
    }

    fn add_fifo(&mut self, name: &Path) -> Result<()> {
        self.add_inode()?;
        debug!("fifo {name:?}: {:?}", self.current());
        Ok(())
    }

    fn add_socket(&mut self, name: &Path) -> Result<()> {
        self.add_inode()?;
        debug!("socket {name:?}: {:?}", self.current());
        Ok(())
    }

    fn add_xattr(&mut self, name: &Path, key: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        // stored in the inode, so no extra space
        self.ensure_phase(Phase::Sizing)?;
        debug!(
            "xattr {name:?} {key:?} ({} bytes, flags {flags:#x})",
            value.len()
        );
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.ensure_phase(Phase::Sizing)?;
        info!("finalize: {:?}", self.current());

        // Scale first, then align.  The other way round gives a different answer.
        // See https://github.com/moby/moby/issues/36353
        let total_size = scale_one_and_a_half(self.total_size)?;
        let num_inodes = scale_one_and_a_half(self.num_inodes)?;
        let alignment = SIZE_ALIGNMENT_BLOCKS * self.block_size;

        self.total_size = align_up(total_size, alignment)?;
        self.num_inodes = num_inodes;
        self.phase = Phase::Finalized;

        info!("finalized: {:?}", self.current());
        Ok(())
    }

    fn result(&self) -> Result<SizeInfo> {
        self.ensure_phase(Phase::Finalized)?;
        Ok(self.current())
    }

    fn release(&mut self) -> Result<()> {
        Ok(())
    }

    fn format_empty(&self, file: &BackingFile) -> Result<()> {
        let info = self.result()?;
        info!(
            "making filesystem with: bs={} is={} numi={} size={}",
            self.block_size, self.inode_size, info.num_inodes, info.total_size
        );

        let mut args: Vec<std::ffi::OsString> = vec![
            "-O".into(),
            DISABLED_FEATURES.into(),
            "-N".into(),
            info.num_inodes.to_string().into(),
            "-b".into(),
            self.block_size.to_string().into(),
            "-I".into(),
            self.inode_size.to_string().into(),
        ];
        args.extend(self.format_path_args(file));
        self.mkfs.run(args)
    }

    fn format_basic(&self, file: &BackingFile) -> Result<()> {
        let mut args: Vec<std::ffi::OsString> = vec!["-O".into(), DISABLED_FEATURES.into()];
        args.extend(self.format_path_args(file));
        self.mkfs.run(args)
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    fn started(block_size: u64, inode_size: u64) -> Ext4Fs {
        let mut fs = Ext4Fs::default();
        fs.begin(block_size, inode_size).unwrap();
        fs
    }

    fn path(s: &str) -> &Path {
        Path::new(s)
    }

    fn target(len: usize) -> Box<OsStr> {
        OsStr::new(&"x".repeat(len)).into()
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4096).unwrap(), 0);
        assert_eq!(align_up(1, 4096).unwrap(), 4096);
        assert_eq!(align_up(4096, 4096).unwrap(), 4096);
        assert_eq!(align_up(4097, 4096).unwrap(), 8192);
        assert!(matches!(align_up(u64::MAX, 4096), Err(BuildError::SizeOverflow)));
    }

    #[test]
    fn test_scale() {
        assert_eq!(scale_one_and_a_half(0).unwrap(), 0);
        assert_eq!(scale_one_and_a_half(11).unwrap(), 16);
        assert_eq!(scale_one_and_a_half(4864).unwrap(), 7296);
        assert!(scale_one_and_a_half(u64::MAX).is_err());
    }

    #[test]
    fn test_reserved_baseline() {
        for (block_size, inode_size, expected) in [
            (4096, 256, 2048 + 11 * 256),
            (4096, 128, 4096),
            (1024, 128, 2048 + 11 * 128),
            (1024, 1024, 2048 + 11 * 1024),
            (65536, 256, 65536),
        ] {
            let fs = started(block_size, inode_size);
            assert_eq!(
                fs.current(),
                SizeInfo {
                    num_inodes: 11,
                    total_size: expected
                }
            );
        }
    }

    #[test]
    fn test_invalid_config() {
        let mut fs = Ext4Fs::default();
        for block_size in [0, 512, 3000, 131072] {
            assert!(matches!(
                fs.begin(block_size, 256),
                Err(BuildError::InvalidBlockSize(b)) if b == block_size
            ));
        }
        for inode_size in [0, 64, 200, 8192] {
            assert!(matches!(
                fs.begin(4096, inode_size),
                Err(BuildError::InvalidInodeSize { .. })
            ));
        }
        assert_eq!(fs.phase(), Phase::NotStarted);
    }

    #[test]
    fn test_regular_file() {
        let mut fs = started(4096, 256);
        let before = fs.current();
        fs.add_regular_file(path("/file"), 10000).unwrap();
        let after = fs.current();

        assert_eq!(after.num_inodes, before.num_inodes + 1);
        assert_eq!(after.total_size - before.total_size, 256 + 4096 + 12288);
    }

    #[test]
    fn test_empty_regular_file() {
        let mut fs = started(4096, 256);
        let before = fs.current();
        fs.add_regular_file(path("/empty"), 0).unwrap();
        assert_eq!(fs.current().total_size - before.total_size, 256 + 4096);
    }

    #[test]
    fn test_directory() {
        let mut fs = started(4096, 256);
        let before = fs.current();
        fs.add_directory(path("/dir")).unwrap();
        let after = fs.current();

        assert_eq!(after.num_inodes, before.num_inodes + 1);
        assert_eq!(after.total_size - before.total_size, 256 + 3 * 4096);
    }

    #[test]
    fn test_symlink_inline_boundary() {
        let mut fs = started(4096, 256);

        let before = fs.current();
        fs.add_symlink(path("/short"), &target(60)).unwrap();
        let after = fs.current();
        assert_eq!(after.num_inodes, before.num_inodes + 1);
        assert_eq!(after.total_size - before.total_size, 256);

        let before = after;
        fs.add_symlink(path("/long"), &target(61)).unwrap();
        let after = fs.current();
        assert_eq!(after.num_inodes, before.num_inodes + 1);
        assert_eq!(after.total_size - before.total_size, 256 + 4096);

        let before = after;
        fs.add_symlink(path("/longest"), &target(4095)).unwrap();
        assert_eq!(fs.current().total_size - before.total_size, 256 + 4096);
    }

    #[test]
    fn test_hardlink() {
        let mut fs = started(4096, 256);
        fs.add_regular_file(path("/file"), 1).unwrap();

        let before = fs.current();
        fs.add_hardlink(path("/link"), path("/file")).unwrap();
        let after = fs.current();
        assert_eq!(after.num_inodes, before.num_inodes);
        assert_eq!(after.total_size - before.total_size, 4096);
    }

    #[test]
    fn test_special_files() {
        let mut fs = started(4096, 256);
        let before = fs.current();
        fs.add_char_device(path("/dev/null"), 1, 3).unwrap();
        fs.add_block_device(path("/dev/sda"), 8, 0).unwrap();
        fs.add_fifo(path("/fifo")).unwrap();
        fs.add_socket(path("/socket")).unwrap();
        let after = fs.current();

        assert_eq!(after.num_inodes, before.num_inodes + 4);
        assert_eq!(after.total_size - before.total_size, 4 * 256);
    }

    #[test]
    fn test_xattr_is_free() {
        let mut fs = started(4096, 256);
        fs.add_regular_file(path("/file"), 1).unwrap();
        let before = fs.current();
        fs.add_xattr(
            path("/file"),
            OsStr::new("security.capability"),
            &[0u8; 20],
            0,
        )
        .unwrap();
        assert_eq!(fs.current(), before);
    }

    fn add_mixed(fs: &mut Ext4Fs, round: u64) {
        fs.add_directory(path("/d")).unwrap();
        fs.add_regular_file(path("/d/f"), round * 1234).unwrap();
        fs.add_hardlink(path("/d/h"), path("/d/f")).unwrap();
        fs.add_symlink(path("/d/s"), &target(round as usize * 17))
            .unwrap();
        fs.add_fifo(path("/d/p")).unwrap();
        fs.add_xattr(path("/d/f"), OsStr::new("user.a"), b"b", 0)
            .unwrap();
    }

    #[test]
    fn test_monotonic() {
        let mut fs = started(4096, 256);
        let mut last = fs.current();
        for round in 0..20 {
            add_mixed(&mut fs, round);
            let now = fs.current();
            assert!(now.num_inodes >= last.num_inodes);
            assert!(now.total_size >= last.total_size);
            last = now;
        }
    }

    #[test]
    fn test_alignment() {
        for (block_size, inode_size) in [(1024, 128), (2048, 256), (4096, 256), (65536, 512)] {
            for rounds in 0..10 {
                let mut fs = started(block_size, inode_size);
                for round in 0..rounds {
                    add_mixed(&mut fs, round);
                }
                fs.finalize().unwrap();
                let info = fs.result().unwrap();
                assert_eq!(info.total_size % (64 * block_size), 0);
                assert!(info.num_inodes >= RESERVED_INODES);
            }
        }
    }

    #[test]
    fn test_finalize_empty() {
        let mut fs = started(4096, 256);
        fs.finalize().unwrap();
        // 4864 * 1.5 = 7296, aligned up to 64 * 4096
        assert_eq!(
            fs.result().unwrap(),
            SizeInfo {
                num_inodes: 16,
                total_size: 262144
            }
        );
    }

    #[test]
    fn test_scale_then_align() {
        let mut fs = started(4096, 256);
        let before = fs.current();
        fs.finalize().unwrap();

        let align_then_scale =
            scale_one_and_a_half(align_up(before.total_size, 64 * 4096).unwrap()).unwrap();
        assert_eq!(align_then_scale, 393216);
        assert_ne!(fs.result().unwrap().total_size, align_then_scale);
    }

    #[test]
    fn test_phases() {
        let mut fs = Ext4Fs::default();
        assert!(matches!(
            fs.add_fifo(path("/fifo")),
            Err(BuildError::InvalidPhase(Phase::NotStarted))
        ));
        assert!(fs.finalize().is_err());

        fs.begin(4096, 256).unwrap();
        assert!(matches!(
            fs.result(),
            Err(BuildError::InvalidPhase(Phase::Sizing))
        ));

        fs.finalize().unwrap();
        let info = fs.result().unwrap();
        assert!(matches!(
            fs.finalize(),
            Err(BuildError::InvalidPhase(Phase::Finalized))
        ));
        assert!(fs.add_directory(path("/late")).is_err());
        assert!(fs.add_hardlink(path("/late"), path("/x")).is_err());
        assert_eq!(fs.result().unwrap(), info);

        fs.release().unwrap();
    }

    #[test]
    fn test_overflow() {
        let mut fs = started(4096, 256);
        assert!(matches!(
            fs.add_regular_file(path("/huge"), u64::MAX - 100),
            Err(BuildError::SizeOverflow)
        ));
    }
}
