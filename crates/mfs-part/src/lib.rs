//! Apple Partition Map (APM) parsing and writing, including the TiVo
//! 64-bit ("big partition") variant and the device byte-swap detection
//! that lets a big-endian-authored disk be hosted on a little-endian
//! controller.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod entry;
mod error;
mod table;
mod view;

pub use entry::{ApmEntry, ApmEntryV32, ApmEntryV64, PartitionRecord, BOOT_MAGIC, BOOT_MAGIC_SWAPPED, PM_BIG_MAGIC, PM_MAGIC};
pub use error::{Error, Result};
pub use table::{PartitionTable, Slot, Width};
pub use view::PartitionView;

#[cfg(test)]
mod tests {
    use super::*;
    use mfs_io::SECTOR_SIZE;

    fn make_device(parts: &[(u64, u64, &str, &str)]) -> alloc::vec::Vec<u8> {
        let sectors = 2048u64;
        let mut dev = alloc::vec![0u8; sectors as usize * SECTOR_SIZE];

        // Boot sector: doubles as partition 1's layout but carries the boot
        // signature instead of 'PM'.
        let boot = entry::ApmEntryV32 {
            signature: mfs_common::types::number::U16::new(BOOT_MAGIC),
            res1: mfs_common::types::number::U16::new(0),
            map_count: mfs_common::types::number::U32::new(parts.len() as u32 + 1),
            start_block: mfs_common::types::number::U32::new(0),
            block_count: mfs_common::types::number::U32::new(1),
            name: mfs_common::str::FixedAsciiStr::new("Apple"),
            r#type: mfs_common::str::FixedAsciiStr::new("Apple_partition_map"),
            data_start: mfs_common::types::number::U32::new(0),
            data_count: mfs_common::types::number::U32::new(0),
            status: mfs_common::types::number::U32::new(0),
        };
        dev[0..core::mem::size_of::<entry::ApmEntryV32>()].copy_from_slice(bytemuck::bytes_of(&boot));

        for (i, (start, len, name, ty)) in parts.iter().enumerate() {
            let e = entry::ApmEntryV32 {
                signature: mfs_common::types::number::U16::new(PM_MAGIC),
                res1: mfs_common::types::number::U16::new(0),
                map_count: mfs_common::types::number::U32::new(parts.len() as u32 + 1),
                start_block: mfs_common::types::number::U32::new(*start as u32),
                block_count: mfs_common::types::number::U32::new(*len as u32),
                name: mfs_common::str::FixedAsciiStr::new(name),
                r#type: mfs_common::str::FixedAsciiStr::new(ty),
                data_start: mfs_common::types::number::U32::new(0),
                data_count: mfs_common::types::number::U32::new(*len as u32),
                status: mfs_common::types::number::U32::new(0),
            };
            let sector = (i + 1) as usize;
            dev[sector * SECTOR_SIZE..sector * SECTOR_SIZE + core::mem::size_of::<entry::ApmEntryV32>()]
                .copy_from_slice(bytemuck::bytes_of(&e));
        }
        dev
    }

    #[test]
    fn open_reads_signature_and_entries() {
        let dev = make_device(&[(1, 10, "bootstrap", "Tivo_boot"), (11, 100, "kernel", "Tivo_kernel")]);
        let table = PartitionTable::open(dev).unwrap();
        assert!(!table.byte_swapped());
        assert_eq!(table.count(), 2);
        let (start, len, name, _ty) = table.partition(1).unwrap();
        assert_eq!((start, len, name.as_str()), (1, 10, "bootstrap"));
    }

    #[test]
    fn rejects_bad_signature() {
        let mut dev = alloc::vec![0u8; 2048 * SECTOR_SIZE];
        dev[0] = 0xff;
        dev[1] = 0xff;
        assert!(matches!(PartitionTable::open(dev), Err(Error::NotATarget(_))));
    }

    #[test]
    fn add_grows_map_count_and_is_visible_after_reopen() {
        let dev = make_device(&[(1, 10, "bootstrap", "Tivo_boot")]);
        let mut table = PartitionTable::open(dev).unwrap();
        let n = table.add(200, 1, "kernel", "Tivo_kernel").unwrap();
        assert_eq!(n, 2);
        assert_eq!(table.count(), 2);
    }
}
