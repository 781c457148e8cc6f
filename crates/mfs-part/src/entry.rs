use mfs_common::str::FixedAsciiStr;
use mfs_common::types::endian::{BigEndian, Endian};
use mfs_common::types::number::{U16, U32, U64};

/// Signature carried in APM sector 0 when the device is not byte-swapped.
pub const BOOT_MAGIC: u16 = 0x1492;
/// Signature carried in APM sector 0 when the device *is* byte-swapped
/// (the swapped-pair reading of [`BOOT_MAGIC`]).
pub const BOOT_MAGIC_SWAPPED: u16 = 0x9214;
/// Signature of a normal (non-sector-0) 32-bit APM entry.
pub const PM_MAGIC: u16 = 0x504d;
/// Signature of a 64-bit ("big partition") APM entry.
pub const PM_BIG_MAGIC: u16 = 0x504e;

/// The on-disk 32-bit Apple Partition Map entry, one per sector starting at
/// sector 1 (sector 0 carries the same layout but a boot signature).
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ApmEntryV32 {
    pub signature: U16<BigEndian>,
    pub res1: U16<BigEndian>,
    pub map_count: U32<BigEndian>,
    pub start_block: U32<BigEndian>,
    pub block_count: U32<BigEndian>,
    pub name: FixedAsciiStr<32>,
    pub r#type: FixedAsciiStr<32>,
    pub data_start: U32<BigEndian>,
    pub data_count: U32<BigEndian>,
    pub status: U32<BigEndian>,
}

/// The on-disk 64-bit ("TiVo big partition") APM entry, used once the
/// source device has grown beyond what 32-bit block numbers can address.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ApmEntryV64 {
    pub signature: U16<BigEndian>,
    pub res1: U16<BigEndian>,
    pub map_count: U32<BigEndian>,
    pub start_block: U64<BigEndian>,
    pub block_count: U64<BigEndian>,
    pub name: FixedAsciiStr<32>,
    pub r#type: FixedAsciiStr<32>,
    pub data_start: U64<BigEndian>,
    pub data_count: U64<BigEndian>,
    pub boot_start: U64<BigEndian>,
    pub boot_size: U64<BigEndian>,
    pub boot_load: U64<BigEndian>,
    pub boot_load2: U64<BigEndian>,
    pub boot_entry: U64<BigEndian>,
    pub boot_entry2: U64<BigEndian>,
    pub boot_cksum: U32<BigEndian>,
    pub status: U32<BigEndian>,
    pub processor: FixedAsciiStr<16>,
}

/// A widened, variant-erased view over one APM entry: 32-bit entries widen
/// their block counters to `u64`, 64-bit entries pass theirs through.
#[derive(Debug, Clone)]
pub struct PartitionRecord {
    pub start_block: u64,
    pub block_count: u64,
    pub name: alloc::string::String,
    pub r#type: alloc::string::String,
}

/// Sum type over the two on-disk entry widths (see SPEC_FULL Open Questions:
/// avoid C-style union type punning for variant records).
#[derive(Clone, Copy)]
pub enum ApmEntry {
    V32(ApmEntryV32),
    V64(ApmEntryV64),
}

impl ApmEntry {
    pub fn signature(&self) -> u16 {
        match self {
            ApmEntry::V32(e) => e.signature.get(),
            ApmEntry::V64(e) => e.signature.get(),
        }
    }

    pub fn map_count(&self) -> u32 {
        match self {
            ApmEntry::V32(e) => e.map_count.get(),
            ApmEntry::V64(e) => e.map_count.get(),
        }
    }

    pub fn to_record(&self) -> PartitionRecord {
        match self {
            ApmEntry::V32(e) => PartitionRecord {
                start_block: e.start_block.get() as u64,
                block_count: e.block_count.get() as u64,
                name: alloc::string::String::from(e.name.as_str()),
                r#type: alloc::string::String::from(e.r#type.as_str()),
            },
            ApmEntry::V64(e) => PartitionRecord {
                start_block: e.start_block.get(),
                block_count: e.block_count.get(),
                name: alloc::string::String::from(e.name.as_str()),
                r#type: alloc::string::String::from(e.r#type.as_str()),
            },
        }
    }
}

