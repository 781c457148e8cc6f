//! The MFS volume header (sector 0 of the first MFS volume, mirrored in its
//! last sector): two on-disk widths sharing the same semantics.

use mfs_common::alg::hash::{dvr_crc32, dvr_crc32_check, dvr_crc32_update};
use mfs_common::types::endian::{BigEndian, Endian};
use mfs_common::types::number::{U32, U64};

/// Consistent, non-64-bit MFS.
pub const MAGIC_OK: u32 = 0xABBAFEED;
/// High bit set on the 64-bit layout's magic/state word pairing.
pub const MAGIC_64BIT: u32 = 0x4000_0000;

/// Byte offset of the `checksum` field in both header widths — the field
/// substituted with the DVR CRC magic during checksum computation.
const CHECKSUM_OFFSET: usize = 8;

/// The zone-map chain head, embedded in the volume header. 32-bit and
/// 64-bit widths share five logical fields, widened from `u32` to `u64`.
#[derive(Debug, Clone, Copy)]
pub struct ZoneMapPtr {
    pub sector: u64,
    pub backup: u64,
    pub length: u64,
    pub size: u64,
    pub min_au: u64,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ZoneMapPtr32 {
    pub sector: U32<BigEndian>,
    pub backup: U32<BigEndian>,
    pub length: U32<BigEndian>,
    pub size: U32<BigEndian>,
    pub min_au: U32<BigEndian>,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ZoneMapPtr64 {
    pub sector: U64<BigEndian>,
    pub backup: U64<BigEndian>,
    pub length: U64<BigEndian>,
    pub size: U64<BigEndian>,
    pub min_au: U64<BigEndian>,
}

impl ZoneMapPtr32 {
    pub fn widen(&self) -> ZoneMapPtr {
        ZoneMapPtr {
            sector: self.sector.get() as u64,
            backup: self.backup.get() as u64,
            length: self.length.get() as u64,
            size: self.size.get() as u64,
            min_au: self.min_au.get() as u64,
        }
    }
}
impl ZoneMapPtr64 {
    pub fn widen(&self) -> ZoneMapPtr {
        ZoneMapPtr {
            sector: self.sector.get(),
            backup: self.backup.get(),
            length: self.length.get(),
            size: self.size.get(),
            min_au: self.min_au.get(),
        }
    }
}

/// The 32-bit on-disk volume header.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct VolumeHeaderV32 {
    pub magic_lsb: U32<BigEndian>,
    pub magic_msb: U32<BigEndian>,
    pub checksum: U32<BigEndian>,
    pub off0c: U32<BigEndian>,
    pub root_fsid: U32<BigEndian>,
    pub off14: U32<BigEndian>,
    pub firstpartsize: U32<BigEndian>,
    pub off1c: U32<BigEndian>,
    pub off20: U32<BigEndian>,
    pub partitionlist: [u8; 128],
    pub total_sectors: U32<BigEndian>,
    pub offa8: U32<BigEndian>,
    pub logstart: U32<BigEndian>,
    pub lognsectors: U32<BigEndian>,
    pub volhdrlogstamp: U32<BigEndian>,
    pub unkstart: U32<BigEndian>,
    pub unksectors: U32<BigEndian>,
    pub unkstamp: U32<BigEndian>,
    pub zonemap: ZoneMapPtr32,
    pub next_fsid: U32<BigEndian>,
    pub bootcycles: U32<BigEndian>,
    pub bootsecs: U32<BigEndian>,
    pub offe4: U32<BigEndian>,
}

/// The 64-bit on-disk volume header.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct VolumeHeaderV64 {
    pub magic_lsb: U32<BigEndian>,
    pub magic_msb: U32<BigEndian>,
    pub checksum: U32<BigEndian>,
    pub off0c: U32<BigEndian>,
    pub root_fsid: U32<BigEndian>,
    pub off14: U32<BigEndian>,
    pub firstpartsize: U32<BigEndian>,
    pub off1c: U32<BigEndian>,
    pub off20: U32<BigEndian>,
    pub partitionlist: [u8; 132],
    pub total_sectors: U64<BigEndian>,
    pub logstart: U64<BigEndian>,
    pub volhdrlogstamp: U64<BigEndian>,
    pub unkstart: U64<BigEndian>,
    pub offc8: U32<BigEndian>,
    pub unkstamp: U32<BigEndian>,
    pub zonemap: ZoneMapPtr64,
    pub unknsectors: U32<BigEndian>,
    pub lognsectors: U32<BigEndian>,
    pub off100: U32<BigEndian>,
    pub next_fsid: U32<BigEndian>,
    pub bootcycles: U32<BigEndian>,
    pub bootsecs: U32<BigEndian>,
    pub off110: U32<BigEndian>,
    pub off114: U32<BigEndian>,
}

/// Sum type over the two on-disk widths (see DESIGN.md Open Questions on
/// variant records): avoids C-style union type punning.
#[derive(Clone, Copy)]
pub enum VolumeHeader {
    V32(VolumeHeaderV32),
    V64(VolumeHeaderV64),
}

impl VolumeHeader {
    /// Builds a brand-new, all-zero header of the requested width, with a
    /// consistent state (`0`) and the matching magic already stamped into
    /// `magic_msb` (see `state_and_magic`: a fresh load's `mfs_lsb` is
    /// always `false`, so `magic_lsb` carries `state` and `magic_msb`
    /// carries `magic`). Used by restore to bootstrap a target volume
    /// that has no prior header to parse.
    pub fn new(is_64: bool) -> Self {
        if is_64 {
            let mut h: VolumeHeaderV64 = bytemuck::Zeroable::zeroed();
            h.magic_msb.set(MAGIC_OK | MAGIC_64BIT);
            VolumeHeader::V64(h)
        } else {
            let mut h: VolumeHeaderV32 = bytemuck::Zeroable::zeroed();
            h.magic_msb.set(MAGIC_OK);
            VolumeHeader::V32(h)
        }
    }

    pub fn is_64bit(&self) -> bool {
        matches!(self, VolumeHeader::V64(_))
    }

    /// Decodes raw `state`/`magic` from the two words, respecting the
    /// source-word order flip between MSB- and LSB-native MFS generations.
    /// `mfs_lsb` is the process-wide endianness flag established at the
    /// first successful header load (see `MfsHandle::init`).
    pub fn state_and_magic(&self, mfs_lsb: bool) -> (u32, u32) {
        let (a, b) = match self {
            VolumeHeader::V32(h) => (h.magic_lsb.get(), h.magic_msb.get()),
            VolumeHeader::V64(h) => (h.magic_lsb.get(), h.magic_msb.get()),
        };
        if mfs_lsb {
            (b, a)
        } else {
            (a, b)
        }
    }

    pub fn total_sectors(&self) -> u64 {
        match self {
            VolumeHeader::V32(h) => h.total_sectors.get() as u64,
            VolumeHeader::V64(h) => h.total_sectors.get(),
        }
    }

    pub fn set_total_sectors(&mut self, value: u64) {
        match self {
            VolumeHeader::V32(h) => h.total_sectors.set(value as u32),
            VolumeHeader::V64(h) => h.total_sectors.set(value),
        }
    }

    pub fn firstpartsize(&self) -> u64 {
        (match self {
            VolumeHeader::V32(h) => h.firstpartsize.get() as u64,
            VolumeHeader::V64(h) => h.firstpartsize.get() as u64,
        }) * 1024
    }

    pub fn root_fsid(&self) -> u32 {
        match self {
            VolumeHeader::V32(h) => h.root_fsid.get(),
            VolumeHeader::V64(h) => h.root_fsid.get(),
        }
    }

    pub fn set_root_fsid(&mut self, value: u32) {
        match self {
            VolumeHeader::V32(h) => h.root_fsid.set(value),
            VolumeHeader::V64(h) => h.root_fsid.set(value),
        }
    }

    pub fn set_firstpartsize(&mut self, sectors_over_1024: u64) {
        match self {
            VolumeHeader::V32(h) => h.firstpartsize.set(sectors_over_1024 as u32),
            VolumeHeader::V64(h) => h.firstpartsize.set(sectors_over_1024 as u32),
        }
    }

    pub fn next_fsid(&self) -> u32 {
        match self {
            VolumeHeader::V32(h) => h.next_fsid.get(),
            VolumeHeader::V64(h) => h.next_fsid.get(),
        }
    }

    pub fn set_next_fsid(&mut self, value: u32) {
        match self {
            VolumeHeader::V32(h) => h.next_fsid.set(value),
            VolumeHeader::V64(h) => h.next_fsid.set(value),
        }
    }

    pub fn zonemap_ptr(&self) -> ZoneMapPtr {
        match self {
            VolumeHeader::V32(h) => h.zonemap.widen(),
            VolumeHeader::V64(h) => h.zonemap.widen(),
        }
    }

    pub fn set_zonemap_ptr(&mut self, ptr: ZoneMapPtr) {
        match self {
            VolumeHeader::V32(h) => {
                h.zonemap = ZoneMapPtr32 {
                    sector: U32::new(ptr.sector as u32),
                    backup: U32::new(ptr.backup as u32),
                    length: U32::new(ptr.length as u32),
                    size: U32::new(ptr.size as u32),
                    min_au: U32::new(ptr.min_au as u32),
                };
            }
            VolumeHeader::V64(h) => {
                h.zonemap = ZoneMapPtr64 {
                    sector: U64::new(ptr.sector),
                    backup: U64::new(ptr.backup),
                    length: U64::new(ptr.length),
                    size: U64::new(ptr.size),
                    min_au: U64::new(ptr.min_au),
                };
            }
        }
    }

    pub fn logstart(&self) -> u64 {
        match self {
            VolumeHeader::V32(h) => h.logstart.get() as u64,
            VolumeHeader::V64(h) => h.logstart.get(),
        }
    }

    pub fn lognsectors(&self) -> u64 {
        match self {
            VolumeHeader::V32(h) => h.lognsectors.get() as u64,
            VolumeHeader::V64(h) => h.lognsectors.get() as u64,
        }
    }

    pub fn set_log_region(&mut self, first_sector: u64, nsectors: u64) {
        match self {
            VolumeHeader::V32(h) => {
                h.logstart.set(first_sector as u32);
                h.lognsectors.set(nsectors as u32);
            }
            VolumeHeader::V64(h) => {
                h.logstart.set(first_sector);
                h.lognsectors.set(nsectors as u32);
            }
        }
    }

    /// Last-committed log stamp, always treated as a 64-bit quantity going
    /// forward per DESIGN.md (the source has it as both 32- and 64-bit in
    /// different files on the v64 layout); 32-bit reads are widened.
    pub fn volhdrlogstamp(&self) -> u64 {
        match self {
            VolumeHeader::V32(h) => h.volhdrlogstamp.get() as u64,
            VolumeHeader::V64(h) => h.volhdrlogstamp.get(),
        }
    }

    pub fn set_volhdrlogstamp(&mut self, value: u64) {
        match self {
            VolumeHeader::V32(h) => h.volhdrlogstamp.set(value as u32),
            VolumeHeader::V64(h) => h.volhdrlogstamp.set(value),
        }
    }

    pub fn unkstart(&self) -> u64 {
        match self {
            VolumeHeader::V32(h) => h.unkstart.get() as u64,
            VolumeHeader::V64(h) => h.unkstart.get(),
        }
    }

    pub fn unk_nsectors(&self) -> u64 {
        match self {
            VolumeHeader::V32(h) => h.unksectors.get() as u64,
            VolumeHeader::V64(h) => h.unknsectors.get() as u64,
        }
    }

    pub fn set_unk_region(&mut self, first_sector: u64, nsectors: u64) {
        match self {
            VolumeHeader::V32(h) => {
                h.unkstart.set(first_sector as u32);
                h.unksectors.set(nsectors as u32);
            }
            VolumeHeader::V64(h) => {
                h.unkstart.set(first_sector);
                h.unknsectors.set(nsectors as u32);
            }
        }
    }

    pub fn bootcycles(&self) -> u32 {
        match self {
            VolumeHeader::V32(h) => h.bootcycles.get(),
            VolumeHeader::V64(h) => h.bootcycles.get(),
        }
    }

    pub fn bootsecs(&self) -> u32 {
        match self {
            VolumeHeader::V32(h) => h.bootsecs.get(),
            VolumeHeader::V64(h) => h.bootsecs.get(),
        }
    }

    pub fn set_boot_time(&mut self, cycles: u32, secs: u32) {
        match self {
            VolumeHeader::V32(h) => {
                h.bootcycles.set(cycles);
                h.bootsecs.set(secs);
            }
            VolumeHeader::V64(h) => {
                h.bootcycles.set(cycles);
                h.bootsecs.set(secs);
            }
        }
    }

    /// Space-separated volume device/partition names, as stored verbatim
    /// in the header.
    pub fn partition_list(&self) -> &str {
        let raw: &[u8] = match self {
            VolumeHeader::V32(h) => &h.partitionlist,
            VolumeHeader::V64(h) => &h.partitionlist,
        };
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        core::str::from_utf8(&raw[..end]).unwrap_or("")
    }

    /// Sets the partition list, failing if it (plus separators) would not
    /// fit strictly under the field's size (see DESIGN.md Open Questions).
    pub fn set_partition_list(&mut self, names: &str) -> bool {
        let cap = match self {
            VolumeHeader::V32(_) => 128,
            VolumeHeader::V64(_) => 132,
        };
        if names.len() >= cap {
            return false;
        }
        match self {
            VolumeHeader::V32(h) => {
                h.partitionlist = [0u8; 128];
                h.partitionlist[..names.len()].copy_from_slice(names.as_bytes());
            }
            VolumeHeader::V64(h) => {
                h.partitionlist = [0u8; 132];
                h.partitionlist[..names.len()].copy_from_slice(names.as_bytes());
            }
        }
        true
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            VolumeHeader::V32(h) => bytemuck::bytes_of(h),
            VolumeHeader::V64(h) => bytemuck::bytes_of(h),
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            VolumeHeader::V32(h) => bytemuck::bytes_of_mut(h),
            VolumeHeader::V64(h) => bytemuck::bytes_of_mut(h),
        }
    }

    /// Recomputes and stores the header checksum.
    pub fn update_checksum(&mut self) {
        let bytes = self.as_bytes_mut();
        dvr_crc32_update(bytes, CHECKSUM_OFFSET);
    }

    pub fn check_checksum(&self) -> bool {
        dvr_crc32_check(self.as_bytes(), CHECKSUM_OFFSET)
    }

    pub fn checksum(&self) -> u32 {
        dvr_crc32(self.as_bytes(), CHECKSUM_OFFSET)
    }

    /// Parses a raw 512-byte sector as a volume header, deciding 32- vs
    /// 64-bit from whichever of the state/magic word pair carries
    /// [`MAGIC_64BIT`]'s high bit. `mfs_lsb` is `None` on the very first
    /// load (it's what this parse determines) and `Some` thereafter.
    pub fn parse(sector: &[u8; 512]) -> Self {
        // The 64-bit flag lives in the same word position for both widths;
        // peek at both orderings and prefer whichever resolves to a known
        // magic, deferring the LSB/MSB decision to the caller via
        // `state_and_magic`.
        let w0 = u32::from_be_bytes(sector[0..4].try_into().unwrap());
        let w1 = u32::from_be_bytes(sector[4..8].try_into().unwrap());
        let is_64 = (w0 & MAGIC_64BIT != 0) || (w1 & MAGIC_64BIT != 0);
        if is_64 {
            VolumeHeader::V64(*bytemuck::from_bytes(&sector[..core::mem::size_of::<VolumeHeaderV64>()]))
        } else {
            VolumeHeader::V32(*bytemuck::from_bytes(&sector[..core::mem::size_of::<VolumeHeaderV32>()]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_round_trips() {
        let mut h = VolumeHeader::V32(bytemuck::Zeroable::zeroed());
        h.set_total_sectors(12345);
        h.update_checksum();
        assert!(h.check_checksum());
        h.set_total_sectors(12346);
        assert!(!h.check_checksum());
    }

    #[test]
    fn partition_list_rejects_overlong_names() {
        let mut h = VolumeHeader::V32(bytemuck::Zeroable::zeroed());
        let too_long = "x".repeat(128);
        assert!(!h.set_partition_list(&too_long));
        let ok = "/dev/hda9 /dev/hdb9";
        assert!(h.set_partition_list(ok));
        assert_eq!(h.partition_list(), ok);
    }
}
