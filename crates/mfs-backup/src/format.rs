//! Wire-format constants and header layouts for the two backup stream
//! generations: the original raw-block V1 stream and the structured V3
//! stream that understands zone maps and inodes directly.

use mfs_common::types::endian::{BigEndian, Endian};
use mfs_common::types::number::{U16, U32};

/// `'T' 'B' 'A' 'K'`, read on a stream authored by the same endianness as
/// the reader.
pub const TB_MAGIC: u32 = 0x5442414b;
/// The same four bytes, observed when the stream was authored
/// opposite-endian from the reader.
pub const TB_ENDIAN: u32 = 0x4b414254;
/// V3 stream magic: `'T' 'B' '3' '\0'`.
pub const TB3_MAGIC: u32 = 0x54423300;
pub const TB3_ENDIAN: u32 = 0x00334254;

bitflags::bitflags! {
    /// Producer-side stream flags, the low 16 bits of `backup_head.flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BackupFlags: u32 {
        const COMPRESSED = 0x0000_0001;
        const MFS_ONLY   = 0x0000_0002;
        const BACKUP_VAR = 0x0000_0004;
        const SHRINK     = 0x0000_0008;
        const THRESH_SIZE = 0x0000_0010;
        const THRESH_TOT  = 0x0000_0020;
        const STREAM_TOT  = 0x0000_0040;
        const NO_BSWAP    = 0x0000_0080;
    }
}

impl BackupFlags {
    /// Deflate level, packed into bits 12..16 of the flag word.
    pub fn compression_level(self) -> Option<u32> {
        if !self.contains(BackupFlags::COMPRESSED) {
            return None;
        }
        Some((self.bits() >> 12) & 0xf)
    }

    pub fn with_compression_level(self, level: u32) -> Self {
        let cleared = self.bits() & !(0xf << 12);
        Self::from_bits_truncate(cleared | ((level & 0xf) << 12)) | BackupFlags::COMPRESSED
    }
}

bitflags::bitflags! {
    /// Restore-side-only flags, the high 16 bits of `backup_head.flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RestoreFlags: u32 {
        const INITIALIZED = 0x0001_0000;
        const ENDIAN      = 0x0002_0000;
        const NO_MORE_COMP = 0x0004_0000;
        const ZERO_PART   = 0x0008_0000;
        const BALANCE     = 0x0010_0000;
        const NO_FILL     = 0x0020_0000;
        const SWAP_V1     = 0x0040_0000;
        const KOPT        = 0x0080_0000;
    }
}

/// One `(firstsector, sectors)` raw block copied verbatim by a V1 stream.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BackupBlock {
    pub firstsector: U32<BigEndian>,
    pub sectors: U32<BigEndian>,
}

/// One non-MFS partition carried through a backup so restore can recreate
/// it without understanding its contents.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BackupPartition {
    pub sectors: U32<BigEndian>,
    pub partno: u8,
    pub devno: u8,
    pub reserved: [u8; 2],
}

/// The V1 stream header: one 512-byte sector, `reserved` padding it out
/// to exactly one sector so the body always starts on a sector boundary.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BackupHeadV1 {
    pub magic: U32<BigEndian>,
    pub flags: U32<BigEndian>,
    pub nsectors: U32<BigEndian>,
    pub nparts: U32<BigEndian>,
    pub nblocks: U32<BigEndian>,
    pub mfspairs: U32<BigEndian>,
    pub reserved: [u8; 488],
}

const _: () = assert!(core::mem::size_of::<BackupHeadV1>() == 512);

/// The V3 stream header. Like V1 it occupies exactly one sector, but
/// carries an inode count instead of a raw block count, plus a zone count
/// so a restorer can size its own zone maps before the first zone arrives.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BackupHeadV3 {
    pub magic: U32<BigEndian>,
    pub flags: U32<BigEndian>,
    pub nsectors: U32<BigEndian>,
    pub nparts: U32<BigEndian>,
    pub ninodes: U32<BigEndian>,
    pub mfspairs: U32<BigEndian>,
    pub nzones: U32<BigEndian>,
    pub is_64: U32<BigEndian>,
    /// Total inode slots walked by the `AppInodes` section
    /// (`MfsHandle::inode_count`), independent of `ninodes` which only
    /// counts the entries recorded in the selected-index array.
    pub inode_slots: U32<BigEndian>,
    /// Stream inodes walked by the `MediaInodes` section
    /// (`ScanResult::stream_slots().count()`).
    pub stream_slots: U32<BigEndian>,
    pub reserved: [u8; 472],
}

const _: () = assert!(core::mem::size_of::<BackupHeadV3>() == 512);

/// One entry in the "which device/partition pairs hold MFS" table
/// (`backup_head.mfspairs` entries), recorded so restore knows how many
/// application/media partition pairs to recreate.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MfsPartitionPair {
    pub app_sectors: U32<BigEndian>,
    pub media_sectors: U32<BigEndian>,
    pub app_devno: u8,
    pub app_partno: u8,
    pub media_devno: u8,
    pub media_partno: u8,
}

/// Marker recorded ahead of each inode record in a V3 stream's Inodes
/// section, distinguishing "this inode has data following it" from "this
/// inode is free/unused and nothing follows".
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InodeRecordHeader {
    pub inode_num: U32<BigEndian>,
    pub has_data: U16<BigEndian>,
    pub reserved: U16<BigEndian>,
}
