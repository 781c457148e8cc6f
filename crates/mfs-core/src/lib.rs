//! The MFS data model: the volume header, the hierarchical zone-map
//! allocators, inodes, and the transaction log, assembled behind
//! [`handle::MfsHandle`].

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod error;
pub mod handle;
pub mod header;
pub mod inode;
pub mod translog;
pub mod zonemap;

pub use error::{Error, Result};
pub use handle::MfsHandle;
pub use header::{VolumeHeader, ZoneMapPtr};
pub use inode::{Extent, Inode};
pub use translog::{LogBody, LogRecord, TransactionLog};
pub use zonemap::{ZoneMap, ZoneType};
