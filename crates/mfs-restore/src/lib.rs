//! The restore consumer: reads a V1/V3 backup stream produced by
//! `mfs-backup` and rebuilds partitions plus a live MFS volume on one or
//! more target devices (SPEC_FULL §4.7/§6.3).

pub mod consumer;
pub mod crc_reader;
pub mod error;
pub mod fields;
pub mod layout;
pub mod options;
pub mod swap;

pub use consumer::{RestoreConsumer, RestoreReport};
pub use crc_reader::CrcReader;
pub use error::{Error, Result};
pub use fields::FieldReader;
pub use layout::{Layout, PairSize, TargetDevice};
pub use options::{RestoreFlags, RestoreOptions, SwapSize};
