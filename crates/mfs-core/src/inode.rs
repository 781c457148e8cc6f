//! Inode reads and writes: fsid hashing, the chained-collision walk, the
//! CRC-fallback-to-backup-sector recovery path, and the extent list /
//! in-sector small-data layouts.

use alloc::vec;
use alloc::vec::Vec;

use mfs_common::alg::hash::{dvr_crc32_check, dvr_crc32_update};
use mfs_common::types::endian::{BigEndian, Endian};
use mfs_common::types::number::{U32, U64};
use mfs_io::SECTOR_SIZE;
use mfs_volume::VolumeSet;

use crate::error::{Error, Result};

/// Multiplicative hash TiVo uses to find an fsid's home inode slot.
pub const FSID_HASH: u32 = 0x106d9;

/// Set on `inode_flags` when this slot's fsid lost a hash collision and the
/// real owner was chained forward to the next slot.
pub const INODE_CHAINED: u32 = 0x8000_0000;

/// Expected inode signature at the fixed offset TiVo calls `sig`.
pub const INODE_SIG: u32 = 0x91231ebc;

/// Byte offset of `checksum` within a serialized inode sector.
const INODE_CHECKSUM_OFFSET: usize = 48;

/// Byte offset where small, in-sector file data begins when `numblocks == 0`.
const INLINE_DATA_OFFSET: usize = 60;

/// Largest a file's data can be and still live entirely inside its own
/// inode sector instead of pointing at separate data blocks.
pub const MAX_INLINE_SIZE: usize = SECTOR_SIZE - INLINE_DATA_OFFSET;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FsidType {
    None = 0,
    File = 1,
    Stream = 2,
    Dir = 4,
    Db = 8,
}

impl FsidType {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => FsidType::File,
            2 => FsidType::Stream,
            4 => FsidType::Dir,
            8 => FsidType::Db,
            _ => FsidType::None,
        }
    }
}

/// One `(sector, count)` extent in an inode's data-block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub sector: u64,
    pub count: u64,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct InodeHeaderV32 {
    fsid: U32<BigEndian>,
    refcount: U32<BigEndian>,
    unk1: U32<BigEndian>,
    unk2: U32<BigEndian>,
    inode: U32<BigEndian>,
    unk3: U32<BigEndian>,
    size: U32<BigEndian>,
    blocksize: U32<BigEndian>,
    blockused: U32<BigEndian>,
    lastmodified: U32<BigEndian>,
    fsid_type: u8,
    unk6: u8,
    beef: [u8; 2],
    sig: U32<BigEndian>,
    checksum: U32<BigEndian>,
    inode_flags: U32<BigEndian>,
    numblocks: U32<BigEndian>,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ExtentRawV32 {
    sector: U32<BigEndian>,
    count: U32<BigEndian>,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ExtentRawV64 {
    sector: U64<BigEndian>,
    count: U64<BigEndian>,
}

/// The in-memory decoded inode, width-independent (extents and sizes are
/// always widened to `u64` once resident).
#[derive(Debug, Clone)]
pub struct Inode {
    pub fsid: u32,
    pub refcount: u32,
    pub inode_num: u32,
    pub size: u64,
    pub blocksize: u32,
    pub blockused: u32,
    pub lastmodified: u32,
    pub fsid_type: FsidType,
    pub checksum: u32,
    pub inode_flags: u32,
    pub extents: Vec<Extent>,
    pub inline_data: Vec<u8>,
    is_64: bool,
}

impl Inode {
    pub fn is_chained(&self) -> bool {
        self.inode_flags & INODE_CHAINED != 0
    }

    pub fn in_use(&self) -> bool {
        self.refcount != 0
    }

    pub fn decode(buf: &[u8; SECTOR_SIZE], is_64: bool) -> Self {
        let h: InodeHeaderV32 = *bytemuck::from_bytes(&buf[..core::mem::size_of::<InodeHeaderV32>()]);
        let numblocks = h.numblocks.get();

        let mut extents = Vec::with_capacity(numblocks as usize);
        let mut off = core::mem::size_of::<InodeHeaderV32>();
        for _ in 0..numblocks {
            if is_64 {
                let e: ExtentRawV64 = *bytemuck::from_bytes(&buf[off..off + core::mem::size_of::<ExtentRawV64>()]);
                extents.push(Extent { sector: e.sector.get(), count: e.count.get() });
                off += core::mem::size_of::<ExtentRawV64>();
            } else {
                let e: ExtentRawV32 = *bytemuck::from_bytes(&buf[off..off + core::mem::size_of::<ExtentRawV32>()]);
                extents.push(Extent { sector: e.sector.get() as u64, count: e.count.get() as u64 });
                off += core::mem::size_of::<ExtentRawV32>();
            }
        }

        let size = h.size.get() as u64;
        let inline_data = if numblocks == 0 && (size as usize) < MAX_INLINE_SIZE {
            buf[INLINE_DATA_OFFSET..INLINE_DATA_OFFSET + size as usize].to_vec()
        } else {
            Vec::new()
        };

        Inode {
            fsid: h.fsid.get(),
            refcount: h.refcount.get(),
            inode_num: h.inode.get(),
            size,
            blocksize: h.blocksize.get(),
            blockused: h.blockused.get(),
            lastmodified: h.lastmodified.get(),
            fsid_type: FsidType::from_u8(h.fsid_type),
            checksum: h.checksum.get(),
            inode_flags: h.inode_flags.get(),
            extents,
            inline_data,
            is_64,
        }
    }

    /// Serializes this inode back into one 512-byte sector, recomputing
    /// the checksum. Fails if the extent list plus header would overflow
    /// the sector.
    pub fn encode(&self) -> Result<[u8; SECTOR_SIZE]> {
        let mut buf = [0u8; SECTOR_SIZE];
        let extent_width = if self.is_64 { core::mem::size_of::<ExtentRawV64>() } else { core::mem::size_of::<ExtentRawV32>() };
        let needed = core::mem::size_of::<InodeHeaderV32>() + self.extents.len() * extent_width;
        if needed > SECTOR_SIZE && !self.extents.is_empty() {
            return Err(Error::Corrupt { what: "inode extent list overflows one sector" });
        }

        let h = InodeHeaderV32 {
            fsid: U32::new(self.fsid),
            refcount: U32::new(self.refcount),
            unk1: U32::new(0),
            unk2: U32::new(0),
            inode: U32::new(self.inode_num),
            unk3: U32::new(0),
            size: U32::new(self.size as u32),
            blocksize: U32::new(self.blocksize),
            blockused: U32::new(self.blockused),
            lastmodified: U32::new(self.lastmodified),
            fsid_type: self.fsid_type as u8,
            unk6: 8,
            beef: [0xbe, 0xef],
            sig: U32::new(INODE_SIG),
            checksum: U32::new(0),
            inode_flags: U32::new(self.inode_flags),
            numblocks: U32::new(self.extents.len() as u32),
        };
        buf[..core::mem::size_of::<InodeHeaderV32>()].copy_from_slice(bytemuck::bytes_of(&h));

        let mut off = core::mem::size_of::<InodeHeaderV32>();
        for extent in &self.extents {
            if self.is_64 {
                let e = ExtentRawV64 { sector: U64::new(extent.sector), count: U64::new(extent.count) };
                buf[off..off + core::mem::size_of::<ExtentRawV64>()].copy_from_slice(bytemuck::bytes_of(&e));
                off += core::mem::size_of::<ExtentRawV64>();
            } else {
                let e = ExtentRawV32 { sector: U32::new(extent.sector as u32), count: U32::new(extent.count as u32) };
                buf[off..off + core::mem::size_of::<ExtentRawV32>()].copy_from_slice(bytemuck::bytes_of(&e));
                off += core::mem::size_of::<ExtentRawV32>();
            }
        }

        if self.extents.is_empty() && !self.inline_data.is_empty() {
            buf[INLINE_DATA_OFFSET..INLINE_DATA_OFFSET + self.inline_data.len()].copy_from_slice(&self.inline_data);
        }

        dvr_crc32_update(&mut buf, INODE_CHECKSUM_OFFSET);
        Ok(buf)
    }
}

/// Inode zone parameters needed to map an inode number to its primary
/// sector. Each inode occupies 2 sectors (data + backup); the inode
/// number space is the concatenation of every zone in the inode chain,
/// each contributing `zone.size` sector-pairs starting at `zone.first`.
#[derive(Debug, Clone)]
pub struct InodeZoneLayout {
    pub zones: Vec<InodeZoneSpan>,
}

#[derive(Debug, Clone, Copy)]
pub struct InodeZoneSpan {
    pub first_sector: u64,
    pub size_sectors: u64,
}

impl InodeZoneLayout {
    pub fn inode_count(&self) -> u64 {
        self.zones.iter().map(|z| z.size_sectors).sum::<u64>() / 2
    }

    /// Walks the inode zone chain the way `mfs_inode_to_sector` does:
    /// the inode number is first turned into a sector offset (`inode * 2`),
    /// then consumed zone by zone until it lands inside one.
    fn to_sector(&self, inode: u64) -> Option<u64> {
        if inode >= self.inode_count() {
            return None;
        }
        let mut offset = inode * 2;
        for zone in &self.zones {
            if offset < zone.size_sectors {
                return Some(zone.first_sector + offset);
            }
            offset -= zone.size_sectors;
        }
        None
    }
}

/// Reads inode slot `inode` from its primary sector, falling back to the
/// following (backup) sector if the primary fails its checksum.
pub fn read_inode(vols: &VolumeSet, layout: &InodeZoneLayout, inode: u64, is_64: bool) -> Result<Inode> {
    let sector = layout.to_sector(inode).ok_or(Error::BadInode(inode as u32))?;
    let mut buf = vec![0u8; SECTOR_SIZE];
    vols.read_data(&mut buf, sector, 1)?;
    let sector_buf: &[u8; SECTOR_SIZE] = buf.as_slice().try_into().unwrap();

    if dvr_crc32_check(sector_buf, INODE_CHECKSUM_OFFSET) {
        return Ok(Inode::decode(sector_buf, is_64));
    }

    log::warn!("inode {inode} at sector {sector} corrupt, trying backup sector {}", sector + 1);
    let mut backup = vec![0u8; SECTOR_SIZE];
    vols.read_data(&mut backup, sector + 1, 1)?;
    let backup_buf: &[u8; SECTOR_SIZE] = backup.as_slice().try_into().unwrap();
    if dvr_crc32_check(backup_buf, INODE_CHECKSUM_OFFSET) {
        return Ok(Inode::decode(backup_buf, is_64));
    }

    Err(Error::Corrupt { what: "inode" })
}

/// Writes `inode` to both its primary and backup sectors.
pub fn write_inode(vols: &mut VolumeSet, layout: &InodeZoneLayout, inode: &Inode, slot: u64) -> Result<()> {
    let sector = layout.to_sector(slot).ok_or(Error::BadInode(slot as u32))?;
    let bytes = inode.encode()?;
    vols.write_data(&bytes, sector, 1)?;
    vols.write_data(&bytes, sector + 1, 1)?;
    Ok(())
}

/// Resolves an fsid to its inode, starting at the hashed home slot and
/// walking the `INODE_CHAINED` collision chain until the fsid matches, an
/// unchained empty slot is hit, or every slot has been visited once.
pub fn find_by_fsid(vols: &VolumeSet, layout: &InodeZoneLayout, fsid: u32, is_64: bool) -> Result<Inode> {
    let count = layout.inode_count();
    if count == 0 {
        return Err(Error::FsidNotFound(fsid));
    }
    let home = (fsid as u64).wrapping_mul(FSID_HASH as u64) % count;
    let mut slot = home;

    loop {
        let candidate = read_inode(vols, layout, slot, is_64)?;
        if candidate.fsid == fsid {
            if candidate.in_use() {
                return Ok(candidate);
            }
            return Err(Error::FsidNotFound(fsid));
        }
        if !candidate.is_chained() {
            return Err(Error::FsidNotFound(fsid));
        }
        slot = (slot + 1) % count;
        if slot == home {
            return Err(Error::FsidNotFound(fsid));
        }
    }
}

/// Reads `count` bytes of a file's data starting at byte `start`, following
/// the inode's extent list (or its inline data, for small files).
pub fn read_data_part(vols: &VolumeSet, inode: &Inode, start: u64, count: u64) -> Result<Vec<u8>> {
    if inode.extents.is_empty() {
        if start != 0 {
            return Ok(Vec::new());
        }
        let mut out = inode.inline_data.clone();
        out.truncate(count as usize);
        return Ok(out);
    }

    let mut remaining_skip = start / SECTOR_SIZE as u64;
    let mut remaining_count = count.div_ceil(SECTOR_SIZE as u64);
    let mut out = Vec::new();

    for extent in &inode.extents {
        if remaining_count == 0 {
            break;
        }
        if remaining_skip >= extent.count {
            remaining_skip -= extent.count;
            continue;
        }
        let local_start = extent.sector + remaining_skip;
        let local_count = (extent.count - remaining_skip).min(remaining_count);
        remaining_skip = 0;

        let mut buf = vec![0u8; (local_count * SECTOR_SIZE as u64) as usize];
        vols.read_data(&mut buf, local_start, local_count)?;
        out.extend_from_slice(&buf);
        remaining_count -= local_count;
    }

    out.truncate(count as usize);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(is_64: bool) -> Inode {
        Inode {
            fsid: 42,
            refcount: 1,
            inode_num: 7,
            size: 12,
            blocksize: 512,
            blockused: 1,
            lastmodified: 0,
            fsid_type: FsidType::File,
            checksum: 0,
            inode_flags: 0,
            extents: Vec::new(),
            inline_data: b"hello world!".to_vec(),
            is_64,
        }
    }

    #[test]
    fn encode_decode_round_trips_inline_data() {
        let inode = sample(false);
        let bytes = inode.encode().unwrap();
        assert!(dvr_crc32_check(&bytes, INODE_CHECKSUM_OFFSET));
        let decoded = Inode::decode(&bytes, false);
        assert_eq!(decoded.fsid, 42);
        assert_eq!(decoded.inline_data, b"hello world!");
    }

    #[test]
    fn encode_decode_round_trips_extents() {
        let mut inode = sample(true);
        inode.size = 2048;
        inode.extents = vec![Extent { sector: 1000, count: 4 }];
        inode.inline_data = Vec::new();
        let bytes = inode.encode().unwrap();
        let decoded = Inode::decode(&bytes, true);
        assert_eq!(decoded.extents, inode.extents);
    }

    #[test]
    fn chained_flag_round_trips() {
        let mut inode = sample(false);
        inode.inode_flags = INODE_CHAINED;
        assert!(inode.is_chained());
        let bytes = inode.encode().unwrap();
        let decoded = Inode::decode(&bytes, false);
        assert!(decoded.is_chained());
    }
}
