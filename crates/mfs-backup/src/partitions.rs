//! Reclaims raw sector access to a source device's non-MFS partitions.
//!
//! [`mfs_volume::VolumeSet::add_volume`] consumes the `Box<dyn Disk>` handle
//! for every partition it takes on, so once the MFS application/media
//! partitions are folded into a [`mfs_core::handle::MfsHandle`] there is no
//! way back to their raw bytes. `SourceDevice` is opened *before* that
//! happens: it reads the partition map once, remembers every slot's
//! metadata, then hands the underlying disk back via
//! [`mfs_part::table::PartitionTable::into_disk`] so bootstrap/kernel/root/
//! swap/var partitions can still be copied byte-for-byte during backup
//! (see [`mfs_part::PartitionTable::into_disk`]).

use mfs_io::Disk;
use mfs_part::{PartitionTable, Slot};

use crate::error::Result;

/// The APM type string MFS-typed partitions carry (`backup.c`'s
/// `partition_strings` table).
pub const MFS_TYPE: &str = "MFS";

/// Partition 9, `/var`, only carried when `BACKUP_VAR` is set.
pub const VAR_PARTITION_NUMBER: u32 = 9;

/// A non-MFS partition a backup copies through verbatim.
#[derive(Debug, Clone)]
pub struct RawPartition {
    pub partno: u32,
    pub start: u64,
    pub sectors: u64,
}

/// A device opened for backup: its boot sector, every slot's metadata, and
/// (once reclaimed from the `PartitionTable`) raw access to the whole disk.
pub struct SourceDevice {
    pub disk: Box<dyn Disk>,
    pub slots: Vec<Slot>,
}

impl SourceDevice {
    /// Opens the partition map on `disk`, captures its slots, then gives
    /// the disk handle back so the caller can still read raw sectors from
    /// it (the partitions destined for `VolumeSet` are opened separately,
    /// by sector-range view, once this returns).
    pub fn open(disk: Box<dyn Disk>) -> Result<Self> {
        let table = PartitionTable::open(disk)?;
        let slots = table.slots().to_vec();
        Ok(SourceDevice { disk: table.into_disk(), slots })
    }

    /// Non-MFS partitions this backup should carry through raw, in slot
    /// (on-disk) order. Partition 1 (the APM itself) is never included;
    /// partition 9 (`/var`) only when `backup_var` is set.
    pub fn raw_partitions(&self, backup_var: bool) -> Vec<RawPartition> {
        self.slots
            .iter()
            .filter(|slot| slot.number != 1)
            .filter(|slot| slot.record.r#type != MFS_TYPE)
            .filter(|slot| backup_var || slot.number != VAR_PARTITION_NUMBER)
            .map(|slot| RawPartition {
                partno: slot.number,
                start: slot.record.start_block,
                sectors: slot.record.block_count,
            })
            .collect()
    }

    /// MFS-typed partitions, paired sequentially `(application, media)` in
    /// slot order — `backup.c`'s convention of alternating app/media
    /// partition numbers.
    pub fn mfs_pairs(&self) -> Vec<(Slot, Slot)> {
        let mfs_slots: Vec<&Slot> = self.slots.iter().filter(|slot| slot.record.r#type == MFS_TYPE).collect();
        mfs_slots.chunks_exact(2).map(|pair| (pair[0].clone(), pair[1].clone())).collect()
    }
}
