//! Sector-oriented I/O traits for the mfs-* crates.
//!
//! Every format in this workspace is addressed in fixed 512-byte sectors,
//! never arbitrary byte ranges. [`Reader`] and [`Writer`] are the narrow
//! seams everything else is built on: a [`VolumeSet`](../mfs_volume) is a
//! `Disk`, a backup stream reader wraps one, and tests back them with plain
//! `&[u8]` / `&mut [u8]` slices instead of a real block device.

#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

mod disk;
mod error;

pub use disk::{Disk, Reader, Writer};
pub use error::Error;

/// The fixed unit of addressing for every format in this workspace.
pub const SECTOR_SIZE: usize = 512;

pub type Result<T> = core::result::Result<T, Error>;
