use alloc::string::{String, ToString};
use alloc::vec::Vec;

use mfs_common::types::endian::Endian;
use mfs_io::{Disk, SECTOR_SIZE};

use crate::entry::{ApmEntry, ApmEntryV32, ApmEntryV64, PartitionRecord, BOOT_MAGIC, BOOT_MAGIC_SWAPPED, PM_MAGIC};
use crate::error::{Error, Result};

/// One slot in a [`PartitionTable`]: a 1-based partition number plus the
/// on-disk record it carries.
#[derive(Debug, Clone)]
pub struct Slot {
    pub number: u32,
    pub record: PartitionRecord,
}

/// Whether a table's entries are the 32-bit `mac_partition` layout or the
/// 64-bit `tivo_bigpartition` layout. Mixed-width tables don't occur on a
/// single device; the discriminant is fixed at open/init time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Bits32,
    Bits64,
}

/// An opened Apple Partition Map.
///
/// Carries its own byte-swap flag (detected once from the sector-0
/// signature) and a cached list of slots. `D` is any [`mfs_io::Disk`] — a
/// raw device, a file, or an in-memory buffer in tests.
pub struct PartitionTable<D> {
    disk: D,
    swab: bool,
    width: Width,
    slots: Vec<Slot>,
}

fn swap16_buffer(buf: &mut [u8]) {
    let pairs = buf.len() / 2;
    for i in 0..pairs {
        buf.swap(i * 2, i * 2 + 1);
    }
}

impl<D: Disk> PartitionTable<D> {
    /// Opens the partition map on `disk`: reads sector 0, determines the
    /// byte-swap flag from its signature, then walks sectors `1..map_count`
    /// until a non-APM signature or `map_count` is reached.
    pub fn open(mut disk: D) -> Result<Self> {
        let mut sector0 = [0u8; SECTOR_SIZE];
        disk.read_sector(0, &mut sector0)?;

        let raw_sig = u16::from_be_bytes([sector0[0], sector0[1]]);
        let swab = match raw_sig {
            BOOT_MAGIC => false,
            BOOT_MAGIC_SWAPPED => true,
            other => return Err(Error::NotATarget(other)),
        };
        if swab {
            swap16_buffer(&mut sector0);
        }

        // The boot sector shares the mac_partition layout (sector 0 doubles
        // as partition 1); map_count lives at the same offset regardless of
        // width, so read it generically as a 32-bit entry first.
        let boot_entry: ApmEntryV32 = *bytemuck::from_bytes(&sector0[..core::mem::size_of::<ApmEntryV32>()]);
        let map_count = boot_entry.map_count.get();

        let mut slots = Vec::new();
        let mut width = Width::Bits32;
        for sector_idx in 1u64..map_count as u64 {
            let mut buf = [0u8; SECTOR_SIZE];
            disk.read_sector(sector_idx, &mut buf)?;
            if swab {
                swap16_buffer(&mut buf);
            }
            let sig = u16::from_be_bytes([buf[0], buf[1]]);
            if sig != PM_MAGIC && sig != crate::entry::PM_BIG_MAGIC {
                // Non-APM signature mid-iteration ends the list; not fatal.
                break;
            }
            let entry = if sig == crate::entry::PM_BIG_MAGIC {
                width = Width::Bits64;
                ApmEntry::V64(*bytemuck::from_bytes(&buf[..core::mem::size_of::<ApmEntryV64>()]))
            } else {
                ApmEntry::V32(*bytemuck::from_bytes(&buf[..core::mem::size_of::<ApmEntryV32>()]))
            };
            slots.push(Slot {
                number: sector_idx as u32,
                record: entry.to_record(),
            });
        }

        Ok(Self {
            disk,
            swab,
            width,
            slots,
        })
    }

    /// Formats a blank disk with an empty Apple Partition Map: sector 0
    /// carries the boot signature and a `map_count` of 1 (itself only),
    /// ready for [`Self::add`] to populate. `swab` mirrors the source
    /// table's byte order when restore is recreating one partition map
    /// from another, so both halves of a split device pair agree.
    pub fn initialize(mut disk: D, width: Width, swab: bool) -> Result<Self> {
        let mut table = Self {
            disk: {
                let mut boot = zeroed_v32();
                boot.signature.set(BOOT_MAGIC);
                boot.map_count.set(1);
                let mut buf = [0u8; SECTOR_SIZE];
                buf[..core::mem::size_of::<ApmEntryV32>()].copy_from_slice(bytemuck::bytes_of(&boot));
                if swab {
                    swap16_buffer(&mut buf);
                }
                disk.write_sector(0, &buf)?;
                disk
            },
            swab,
            width,
            slots: Vec::new(),
        };
        table.flush()?;
        Ok(table)
    }

    pub fn byte_swapped(&self) -> bool {
        self.swab
    }

    pub fn width(&self) -> Width {
        self.width
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    /// `(start, sectors, name, type)` for 1-based partition number `n`.
    pub fn partition(&self, n: u32) -> Result<(u64, u64, String, String)> {
        let slot = self
            .slots
            .iter()
            .find(|s| s.number == n)
            .ok_or(Error::NoSuchPartition(n))?;
        Ok((
            slot.record.start_block,
            slot.record.block_count,
            slot.record.name.clone(),
            slot.record.r#type.clone(),
        ))
    }

    /// Sectors on the device that fall inside no partition's range.
    pub fn total_free(&self) -> u64 {
        let mut sorted: Vec<_> = self.slots.iter().map(|s| (s.record.start_block, s.record.block_count)).collect();
        sorted.sort_by_key(|(start, _)| *start);
        let device_size = self.disk.sector_count();
        let mut free = 0u64;
        let mut cursor = 0u64;
        for (start, len) in sorted {
            if start > cursor {
                free += start - cursor;
            }
            cursor = cursor.max(start + len);
        }
        if device_size > cursor {
            free += device_size - cursor;
        }
        free
    }

    fn largest_free_run(&self) -> (u64, u64) {
        let mut sorted: Vec<_> = self.slots.iter().map(|s| (s.record.start_block, s.record.block_count)).collect();
        sorted.sort_by_key(|(start, _)| *start);
        let device_size = self.disk.sector_count();
        let mut best = (0u64, 0u64);
        let mut cursor = 0u64;
        for (start, len) in sorted {
            if start > cursor && start - cursor > best.1 {
                best = (cursor, start - cursor);
            }
            cursor = cursor.max(start + len);
        }
        if device_size > cursor && device_size - cursor > best.1 {
            best = (cursor, device_size - cursor);
        }
        best
    }

    /// Appends a new partition of `size` sectors into free space.
    /// `position_hint` is the 1-based slot index to insert the new entry
    /// among the existing ones (caller controls ordering, not placement).
    pub fn add(&mut self, size: u64, position_hint: usize, name: &str, r#type: &str) -> Result<u32> {
        if name.len() > 32 || r#type.len() > 32 {
            return Err(Error::FieldTooLong(32));
        }
        let (start, free) = self.largest_free_run();
        if free < size {
            return Err(Error::NoFreeSpace { requested: size, largest: free });
        }
        if self.slots.len() >= 0xffff {
            return Err(Error::TooManyPartitions(self.slots.len()));
        }
        let record = PartitionRecord {
            start_block: start,
            block_count: size,
            name: name.to_string(),
            r#type: r#type.to_string(),
        };
        let insert_at = position_hint.min(self.slots.len());
        // Renumber trailing slots so partition numbers stay a contiguous
        // 1-based sequence (sector index == partition number on this map).
        for slot in self.slots.iter_mut().skip(insert_at) {
            slot.number += 1;
        }
        let number = insert_at as u32 + 1;
        self.slots.insert(insert_at, Slot { number, record });
        self.flush()?;
        Ok(number)
    }

    pub fn rename(&mut self, part_no: u32, name: &str) -> Result<()> {
        if name.len() > 32 {
            return Err(Error::FieldTooLong(32));
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.number == part_no)
            .ok_or(Error::NoSuchPartition(part_no))?;
        slot.record.name = name.to_string();
        self.flush()
    }

    /// Rewrites every APM sector from the in-memory slot list, growing
    /// `map_count` to the new slot count. Sector 0's boot signature is
    /// preserved (only its own `map_count` field advances).
    fn flush(&mut self) -> Result<()> {
        let map_count = self.slots.len() as u32 + 1;

        let mut boot = [0u8; SECTOR_SIZE];
        self.disk.read_sector(0, &mut boot)?;
        if self.swab {
            swap16_buffer(&mut boot);
        }
        let mut boot_entry: ApmEntryV32 = *bytemuck::from_bytes(&boot[..core::mem::size_of::<ApmEntryV32>()]);
        boot_entry.map_count.set(map_count);
        boot[..core::mem::size_of::<ApmEntryV32>()].copy_from_slice(bytemuck::bytes_of(&boot_entry));
        if self.swab {
            swap16_buffer(&mut boot);
        }
        self.disk.write_sector(0, &boot)?;

        for slot in &self.slots {
            let mut buf = [0u8; SECTOR_SIZE];
            match self.width {
                Width::Bits32 => {
                    let mut e = zeroed_v32();
                    e.signature.set(PM_MAGIC);
                    e.map_count.set(map_count);
                    e.start_block.set(slot.record.start_block as u32);
                    e.block_count.set(slot.record.block_count as u32);
                    e.name = mfs_common::str::FixedAsciiStr::new(&slot.record.name);
                    e.r#type = mfs_common::str::FixedAsciiStr::new(&slot.record.r#type);
                    buf[..core::mem::size_of::<ApmEntryV32>()].copy_from_slice(bytemuck::bytes_of(&e));
                }
                Width::Bits64 => {
                    let mut e = zeroed_v64();
                    e.signature.set(crate::entry::PM_BIG_MAGIC);
                    e.map_count.set(map_count);
                    e.start_block.set(slot.record.start_block);
                    e.block_count.set(slot.record.block_count);
                    e.name = mfs_common::str::FixedAsciiStr::new(&slot.record.name);
                    e.r#type = mfs_common::str::FixedAsciiStr::new(&slot.record.r#type);
                    buf[..core::mem::size_of::<ApmEntryV64>()].copy_from_slice(bytemuck::bytes_of(&e));
                }
            }
            if self.swab {
                swap16_buffer(&mut buf);
            }
            self.disk.write_sector(slot.number as u64, &buf)?;
        }
        Ok(())
    }

    /// Writes `buf` (exactly one sector) to sector 0 verbatim, bypassing
    /// byte-swap handling — the boot sector's own layout already encodes
    /// the detection signature.
    pub fn write_boot_sector(&mut self, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
        self.disk.write_sector(0, buf)?;
        Ok(())
    }

    pub fn read_boot_sector(&self, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        self.disk.read_sector(0, buf)?;
        Ok(())
    }

    /// Gives back the underlying disk, e.g. once a caller has pulled the
    /// partition metadata it needed and wants to read raw partition data
    /// directly without going through another `open()`.
    pub fn into_disk(self) -> D {
        self.disk
    }

    /// Every parsed slot, in on-disk (sector) order.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }
}

fn zeroed_v32() -> ApmEntryV32 {
    bytemuck::Zeroable::zeroed()
}
fn zeroed_v64() -> ApmEntryV64 {
    bytemuck::Zeroable::zeroed()
}

impl Default for ApmEntryV32 {
    fn default() -> Self {
        zeroed_v32()
    }
}
