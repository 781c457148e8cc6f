//! Types and algorithms shared by the mfs-* crates: endian-aware Pod number
//! wrappers, fixed-width ASCII strings for on-disk name fields, and the
//! DVR's CRC-32 variant.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

/// Algorithms (hashing/CRC).
pub mod alg;
/// Fixed-width string types used by on-disk name fields.
pub mod str;
/// Endian-aware primitive types.
pub mod types;
