//! Sizing and building ext4 images for container layers.
//!
//! A layer is described as a stream of [`entry::ArchiveEntry`] records.  The
//! [`driver::ArchiveDriver`] feeds them through a [`filesystem::FilesystemBuilder`] (see
//! [`ext4::Ext4Fs`]) to work out how big the image must be, and [`image::write_image`] then
//! allocates a file of exactly that size and formats it.

pub mod driver;
pub mod entry;
pub mod error;
pub mod ext4;
pub mod filesystem;
pub mod image;
pub mod mkfs;
pub mod tar;

pub use error::{BuildError, Result};
