use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use layerimg::{
    driver::{estimate, DriverOptions, DEFAULT_BLOCK_SIZE, DEFAULT_INODE_SIZE},
    ext4::Ext4Fs,
    filesystem::{FilesystemBuilder, SizeInfo},
    image::{write_basic_image, write_image},
    mkfs::{Mkfs, DEFAULT_MKFS_PROGRAM},
    tar::{archive_entries, decompressed},
};

/// mklayerimg
#[derive(Debug, Parser)]
#[clap(name = "mklayerimg", version)]
pub struct App {
    #[clap(flatten)]
    opts: CommonOpts,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Args)]
struct CommonOpts {
    /// Filesystem block size in bytes
    #[clap(long, global = true, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u64,
    /// Inode size in bytes
    #[clap(long, global = true, default_value_t = DEFAULT_INODE_SIZE)]
    inode_size: u64,
    /// The mkfs.ext4 binary to run
    #[clap(long, global = true, default_value = DEFAULT_MKFS_PROGRAM)]
    mkfs: PathBuf,
    /// Seconds to wait for mkfs before giving up
    #[clap(long, global = true, default_value_t = 300)]
    timeout: u64,
    /// Don't check that hard links point at earlier entries
    #[clap(long, global = true)]
    trust_hardlinks: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Prints the size and inode count needed for a tar layer
    Estimate {
        /// the tar archive (optionally zstd compressed), or '-' for stdin
        archive: PathBuf,
    },
    /// Creates an empty ext4 image sized to hold a tar layer
    Create {
        /// the tar archive (optionally zstd compressed), or '-' for stdin
        archive: PathBuf,
        /// the image file to write
        image: PathBuf,
    },
    /// Creates an ext4 image of a given size using default mkfs settings
    FormatBasic {
        image: PathBuf,
        #[clap(long)]
        size: u64,
    },
}

impl CommonOpts {
    fn builder(&self) -> Ext4Fs {
        Ext4Fs::new(Mkfs::new(&self.mkfs).with_timeout(Duration::from_secs(self.timeout)))
    }

    fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            block_size: self.block_size,
            inode_size: self.inode_size,
            verify_hardlinks: !self.trust_hardlinks,
        }
    }
}

fn open_archive(path: &Path) -> Result<Box<dyn BufRead>> {
    if path.as_os_str() == "-" {
        Ok(Box::new(BufReader::new(std::io::stdin())))
    } else {
        let file = File::open(path).with_context(|| format!("Opening {path:?}"))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

fn estimate_archive(opts: &CommonOpts, path: &Path) -> Result<(Ext4Fs, SizeInfo)> {
    let reader = decompressed(open_archive(path)?)?;
    let mut archive = tar::Archive::new(reader);
    let entries = archive_entries(&mut archive)?;
    let result = estimate(opts.builder(), &opts.driver_options(), entries)
        .with_context(|| format!("Sizing {path:?}"))?;
    Ok(result)
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    match args.cmd {
        Command::Estimate { ref archive } => {
            let (mut fs, info) = estimate_archive(&args.opts, archive)?;
            println!("inodes {}", info.num_inodes);
            println!("size {}", info.total_size);
            fs.release()?;
        }
        Command::Create {
            ref archive,
            ref image,
        } => {
            let (mut fs, _) = estimate_archive(&args.opts, archive)?;
            let info = write_image(&fs, image).with_context(|| format!("Writing {image:?}"))?;
            println!("inodes {}", info.num_inodes);
            println!("size {}", info.total_size);
            fs.release()?;
        }
        Command::FormatBasic { ref image, size } => {
            write_basic_image(&args.opts.builder(), image, size)
                .with_context(|| format!("Writing {image:?}"))?;
        }
    }
    Ok(())
}
