//! `mfs` is a unified package for working with TiVo's MFS storage stack:
//! the Apple Partition Map, the flat multi-partition volume space, the MFS
//! data model itself (zone maps, inodes, transaction log), and the
//! backup/restore state machines built on top of it. Each piece lives in
//! its own crate and is re-exported here behind a Cargo feature.

#[cfg(feature = "io")]
pub use mfs_io as io;

#[cfg(feature = "common")]
pub use mfs_common as common;

#[cfg(feature = "part")]
pub use mfs_part as part;

#[cfg(feature = "volume")]
pub use mfs_volume as volume;

#[cfg(feature = "core")]
pub use mfs_core as core;

#[cfg(feature = "compress")]
pub use mfs_compress as compress;

#[cfg(feature = "backup")]
pub use mfs_backup as backup;

#[cfg(feature = "restore")]
pub use mfs_restore as restore;
