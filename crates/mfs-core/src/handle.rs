//! `MfsHandle` ties a [`VolumeSet`] to the loaded volume header, zone maps,
//! and transaction log, and is the entry point `mfs-backup`/`mfs-restore`
//! drive to walk a live filesystem.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use mfs_volume::VolumeSet;

use crate::error::{Error, Result};
use crate::header::VolumeHeader;
use crate::inode::{self, Extent, Inode, InodeZoneLayout, InodeZoneSpan};
use crate::translog::TransactionLog;
use crate::zonemap::{self, ZoneMap, ZoneType};

/// TiVo's per-`SABLOCKSEC` sector estimate of "one hour of standard-def
/// recording", used by `mfs_sa_hours_estimate`.
const SABLOCKSEC: u64 = 1_630_000;

/// Open despite the volume header's state being marked inconsistent.
pub const MFS_ERROROK: u32 = 0x0400_0000;

/// Per-type totals, mirroring the source's `zone_map_head`.
#[derive(Debug, Clone, Default)]
struct ZoneTotals {
    zones: Vec<ZoneMap>,
    size: u64,
    free: u64,
}

/// An open MFS volume: the loaded header, the three zone-type chains, and
/// the transaction log, all addressed through one [`VolumeSet`].
pub struct MfsHandle {
    pub vols: VolumeSet,
    pub header: VolumeHeader,
    inode_zone: ZoneTotals,
    app_zone: ZoneTotals,
    media_zone: ZoneTotals,
    /// Type of the zone currently at the tail of the single chain the
    /// header's zone-map pointer threads through, regardless of which
    /// per-type list it lives in. `None` means the chain is still empty.
    last_zone_type: Option<ZoneType>,
    translog: TransactionLog,
    is_64: bool,
    mfs_lsb: bool,
    pub bootcycle: u32,
    pub bootsecs: u32,
    last_error: Option<String>,
}

impl MfsHandle {
    /// Loads the volume header from `vols` and follows every zone-map
    /// chain to build the live totals. `flags` may include
    /// [`MFS_ERROROK`] to tolerate a header marked inconsistent.
    pub fn init(mut vols: VolumeSet, flags: u32) -> Result<Self> {
        let mut sector0 = [0u8; mfs_io::SECTOR_SIZE];
        vols.read_data(&mut sector0, 0, 1)?;
        let header = VolumeHeader::parse(&sector0);

        let mfs_lsb = false; // first load always resolves MSB-native, per state_and_magic's contract
        let (state, magic) = header.state_and_magic(mfs_lsb);
        if magic != crate::header::MAGIC_OK && (magic & crate::header::MAGIC_64BIT) == 0 {
            return Err(Error::NotATarget(magic));
        }
        if state != 0 && flags & MFS_ERROROK == 0 {
            return Err(Error::Inconsistent(state));
        }
        if !header.check_checksum() {
            log::warn!("volume header checksum mismatch; proceeding with flags permitting it");
        }

        let is_64 = header.is_64bit();
        let all_zones = zonemap::load_chain(&vols, header.zonemap_ptr(), is_64)?;

        let mut inode_zone = ZoneTotals::default();
        let mut app_zone = ZoneTotals::default();
        let mut media_zone = ZoneTotals::default();
        let mut last_zone_type = None;
        for zone in all_zones {
            let totals = match zone.zone_type {
                ZoneType::Inode => &mut inode_zone,
                ZoneType::Application => &mut app_zone,
                ZoneType::Media => &mut media_zone,
            };
            totals.size += zone.size;
            totals.free += zone.free;
            last_zone_type = Some(zone.zone_type);
            totals.zones.push(zone);
        }

        let translog = TransactionLog {
            first_sector: header.logstart(),
            nsectors: header.lognsectors(),
        };

        Ok(MfsHandle {
            vols,
            header,
            inode_zone,
            app_zone,
            media_zone,
            last_zone_type,
            translog,
            is_64,
            mfs_lsb,
            bootcycle: 0,
            bootsecs: 0,
            last_error: None,
        })
    }

    /// Wraps a freshly-formatted `VolumeSet` with a caller-built header and
    /// empty zone/log state, for restore's VolumeHeader state: there is no
    /// prior on-disk header to parse, so `init`'s chain-loading path does
    /// not apply. The caller still owes a call to [`Self::write_volume_header`]
    /// once the header fields (partition list, zonemap pointer, log/unk
    /// regions) are filled in.
    pub fn bootstrap(vols: VolumeSet, header: VolumeHeader, is_64: bool) -> Self {
        let translog = TransactionLog {
            first_sector: header.logstart(),
            nsectors: header.lognsectors(),
        };
        MfsHandle {
            vols,
            header,
            inode_zone: ZoneTotals::default(),
            app_zone: ZoneTotals::default(),
            media_zone: ZoneTotals::default(),
            last_zone_type: None,
            translog,
            is_64,
            mfs_lsb: false,
            bootcycle: 0,
            bootsecs: 0,
            last_error: None,
        }
    }

    /// Re-reads the header and rebuilds zone totals in place, e.g. after
    /// an external process has modified the volume.
    pub fn reinit(&mut self, flags: u32) -> Result<()> {
        let reloaded = Self::init(core::mem::take(&mut self.vols), flags)?;
        *self = reloaded;
        Ok(())
    }

    pub fn is_64bit(&self) -> bool {
        self.is_64
    }

    pub fn inode_count(&self) -> u64 {
        self.inode_zone.size / 2
    }

    fn inode_layout(&self) -> InodeZoneLayout {
        InodeZoneLayout {
            zones: self
                .inode_zone
                .zones
                .iter()
                .map(|z| InodeZoneSpan { first_sector: z.first, size_sectors: z.size })
                .collect(),
        }
    }

    pub fn read_inode(&self, inode: u64) -> Result<Inode> {
        inode::read_inode(&self.vols, &self.inode_layout(), inode, self.is_64)
    }

    pub fn find_by_fsid(&self, fsid: u32) -> Result<Inode> {
        inode::find_by_fsid(&self.vols, &self.inode_layout(), fsid, self.is_64)
    }

    pub fn transaction_log(&self) -> &TransactionLog {
        &self.translog
    }

    /// Sets the transaction-log region on both the live handle and the
    /// header it will serialize, keeping the two in sync — restore calls
    /// this once it has placed the log ring during volume bootstrap.
    pub fn set_log_region(&mut self, first_sector: u64, nsectors: u64) {
        self.header.set_log_region(first_sector, nsectors);
        self.translog = TransactionLog { first_sector, nsectors };
    }

    /// The live zone-map chain for one zone type, in on-disk chain order.
    pub fn zones(&self, zone_type: ZoneType) -> &[ZoneMap] {
        match zone_type {
            ZoneType::Inode => &self.inode_zone.zones,
            ZoneType::Application => &self.app_zone.zones,
            ZoneType::Media => &self.media_zone.zones,
        }
    }

    fn totals_mut(&mut self, zone_type: ZoneType) -> &mut ZoneTotals {
        match zone_type {
            ZoneType::Inode => &mut self.inode_zone,
            ZoneType::Application => &mut self.app_zone,
            ZoneType::Media => &mut self.media_zone,
        }
    }

    /// Writes `inode` to slot `slot` through both its primary and backup
    /// sectors, stamping the handle's current boot time first.
    pub fn write_inode(&mut self, slot: u64, inode: &mut Inode) -> Result<()> {
        inode.lastmodified = self.bootsecs;
        inode::write_inode(&mut self.vols, &self.inode_layout(), inode, slot)
    }

    /// Allocates `sectors` from the most-free zone of `zone_type`,
    /// balancing locality across the chain the way restore's inode replay
    /// does: the first zone in the chain fills toward its end, the second
    /// toward its start (see SPEC_FULL §4.4/§4.8).
    pub fn allocate(&mut self, zone_type: ZoneType, sectors: u64) -> Result<Vec<Extent>> {
        let totals = self.totals_mut(zone_type);
        if totals.zones.is_empty() {
            return Err(Error::OutOfSpace(zone_type, sectors));
        }
        let best = totals
            .zones
            .iter()
            .enumerate()
            .max_by_key(|(_, z)| z.free)
            .map(|(i, _)| i)
            .unwrap();
        let toward_end = best % 2 == 0;
        let extents = totals.zones[best]
            .allocate(sectors, toward_end)
            .ok_or(Error::OutOfSpace(zone_type, sectors))?;
        totals.free = totals.zones.iter().map(|z| z.free).sum();
        Ok(extents.into_iter().map(|(sector, count)| Extent { sector, count }).collect())
    }

    /// Replays every unsynced transaction-log entry (`fssync`): `self`
    /// itself is the [`crate::translog::LogApplier`], applying `MapUpdate`
    /// records to the matching zone's free bitmap and `InodeUpdate`
    /// records to the named inode slot, both persisted back to disk as
    /// they're replayed. `self.vols` is swapped out for the duration so the
    /// transaction log can hand it back in piecemeal as `&mut VolumeSet`
    /// without aliasing `&mut self`. Returns the number of records applied.
    pub fn fssync(&mut self) -> Result<u64> {
        let translog = self.translog;
        let mut vols = core::mem::take(&mut self.vols);
        let result = translog.log_fssync(&mut vols, self);
        self.vols = vols;
        result
    }

    /// Appends a fresh application+media partition pair to the live
    /// volume set, linking new zone maps onto the Application and Media
    /// chains (`mfs_add_volume_pair`, SPEC_FULL §4). Fails if the new
    /// partition names would overflow the header's partition-name-list
    /// field (see DESIGN.md Open Questions: strict "new name must fit
    /// under the field size" reading).
    pub fn add_volume_pair(
        &mut self,
        app_disk: alloc::boxed::Box<dyn mfs_io::Disk>,
        app_name: &str,
        media_disk: alloc::boxed::Box<dyn mfs_io::Disk>,
        media_name: &str,
        min_au: u64,
    ) -> Result<()> {
        let mut candidate = String::from(self.header.partition_list());
        for name in [app_name, media_name] {
            if !candidate.is_empty() {
                candidate.push(' ');
            }
            candidate.push_str(name);
        }
        if !self.header.set_partition_list(&candidate) {
            return Err(Error::BrokenChain("new partition names overflow the header's partition-name-list field"));
        }

        let app_start = self.vols.add_volume(app_disk, mfs_volume::VolumeOptions { writable: true, ..Default::default() });
        let app_size = self.vols.volume_size(app_start);
        let media_start = self.vols.add_volume(media_disk, mfs_volume::VolumeOptions { writable: true, ..Default::default() });
        let media_size = self.vols.volume_size(media_start);

        self.append_zone(ZoneType::Application, app_start, app_size, min_au)?;
        self.append_zone(ZoneType::Media, media_start, media_size, min_au)?;
        self.write_volume_header()
    }

    /// Sizes, allocates sectors for, and links a brand-new fully-free zone
    /// of `zone_type` covering `[first, first+size)` onto the tail of its
    /// chain — shared by `add_volume_pair` and restore's zone-map rebuild.
    pub fn append_zone(&mut self, zone_type: ZoneType, first: u64, size: u64, min_au: u64) -> Result<()> {
        let blocks = size.div_ceil(min_au.max(1));
        let sectors = zonemap::serialized_sectors(blocks, self.is_64);
        // New zone's own (sector, backup) pair is carved out of the head
        // of the region it describes; the allocator hasn't seen this
        // space yet so this is a direct placement, not `allocate()`.
        let zone_sector = first;
        let backup_sector = first + sectors;
        let data_first = first + sectors * 2;
        let data_size = size - sectors * 2;
        let new_zone = ZoneMap::new_free(zone_sector, backup_sector, sectors, data_first, data_size, min_au, zone_type, self.is_64);

        // All zones, regardless of type, thread through one chain rooted
        // at the header's zone-map pointer; `last_zone_type` names whichever
        // per-type list currently holds that chain's tail.
        match self.last_zone_type {
            Some(tail_type) => {
                // Direct field match (not a `totals_mut` call) so this
                // borrows only one zone list, leaving `self.vols` free.
                let tail = match tail_type {
                    ZoneType::Inode => self.inode_zone.zones.last_mut(),
                    ZoneType::Application => self.app_zone.zones.last_mut(),
                    ZoneType::Media => self.media_zone.zones.last_mut(),
                }
                .expect("last_zone_type names a non-empty zone list");
                zonemap::append_zone(&mut self.vols, tail, &new_zone)?;
            }
            None => {
                zonemap::write_zone(&mut self.vols, &new_zone)?;
                self.header.set_zonemap_ptr(crate::header::ZoneMapPtr {
                    sector: new_zone.sector,
                    backup: new_zone.backup_sector,
                    length: new_zone.length,
                    size: new_zone.size,
                    min_au: new_zone.min_au,
                });
            }
        }
        self.last_zone_type = Some(zone_type);

        let totals = self.totals_mut(zone_type);
        totals.size += new_zone.size;
        totals.free += new_zone.free;
        totals.zones.push(new_zone);
        Ok(())
    }

    /// TiVo's coarse "hours of standard-def recording this volume holds"
    /// estimate: media-zone sectors, de-rated for filesystem overhead on
    /// larger drives, divided by [`SABLOCKSEC`].
    pub fn sa_hours_estimate(&self) -> u64 {
        let mut sectors = self.media_zone.size;
        let large = 72 * 1024 * 1024 * 2;
        let small = 14 * 1024 * 1024 * 2;
        if sectors > large {
            sectors -= 12 * 1024 * 1024 * 2;
        } else if sectors > small {
            sectors -= (sectors - small) / 4;
        }
        sectors / SABLOCKSEC
    }

    /// Recomputes the header checksum and writes sector 0 (and its mirror
    /// in the volume's last sector, if the volume is large enough to hold
    /// one) back to the device.
    pub fn write_volume_header(&mut self) -> Result<()> {
        self.header.update_checksum();
        let bytes = self.header.as_bytes();
        let mut sector = [0u8; mfs_io::SECTOR_SIZE];
        sector[..bytes.len()].copy_from_slice(bytes);
        self.vols.write_data(&sector, 0, 1)?;

        let total = self.header.total_sectors();
        if total > 1 {
            self.vols.write_data(&sector, total - 1, 1)?;
        }
        Ok(())
    }

    fn set_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    pub fn perror(&self, prefix: &str) {
        if let Some(msg) = &self.last_error {
            log::error!("{prefix}: {msg}");
        } else {
            log::error!("{prefix}: no error");
        }
    }

    pub fn strerror(&self) -> Option<String> {
        self.last_error.clone()
    }

    pub fn has_error(&self) -> bool {
        self.last_error.is_some()
    }

    pub fn clearerror(&mut self) {
        self.last_error = None;
    }

    /// Records `err` as the handle's current error (for the
    /// `perror`/`strerror`/`has_error` channel) and returns it unchanged,
    /// so call sites can write `self.note_error(fallible()?)`-style chains.
    pub fn note_error(&mut self, err: Error) -> Error {
        self.set_error(format!("{err}"));
        err
    }
}

impl crate::translog::LogApplier for MfsHandle {
    fn apply_map_update(&mut self, vols: &mut VolumeSet, remove: bool, sector: u64, size: u64) -> Result<()> {
        for zone_type in [ZoneType::Inode, ZoneType::Application, ZoneType::Media] {
            let totals = match zone_type {
                ZoneType::Inode => &mut self.inode_zone,
                ZoneType::Application => &mut self.app_zone,
                ZoneType::Media => &mut self.media_zone,
            };
            let Some(idx) = totals.zones.iter().position(|z| z.covers(sector)) else {
                continue;
            };
            if remove {
                totals.zones[idx].mark_used_run(sector, size);
            } else {
                totals.zones[idx].free_run(sector, size);
            }
            totals.free = totals.zones.iter().map(|z| z.free).sum();
            let zone = totals.zones[idx].clone();
            zonemap::write_zone(vols, &zone)?;
            return Ok(());
        }
        Ok(())
    }

    fn apply_inode_update(
        &mut self,
        vols: &mut VolumeSet,
        slot: u32,
        fsid: u32,
        refcount: u32,
        size: u64,
        blocksize: u32,
        blockused: u32,
        lastmodified: u32,
        extents: &[Extent],
    ) -> Result<()> {
        let layout = self.inode_layout();
        // The logged fields carry the full numeric state of the inode as of
        // this transaction; everything the wire format can't round-trip
        // (`fsid_type`, inline payload) is kept from whatever is already on
        // disk at this slot, since a `MapUpdate`/`InodeUpdate` pair only
        // ever touches the extent-bearing half of an inode.
        let mut inode = inode::read_inode(vols, &layout, slot as u64, self.is_64).unwrap_or_else(|_| Inode::decode(&[0u8; mfs_io::SECTOR_SIZE], self.is_64));
        inode.fsid = fsid;
        inode.refcount = refcount;
        inode.size = size;
        inode.blocksize = blocksize;
        inode.blockused = blockused;
        inode.lastmodified = lastmodified;
        inode.extents = extents.to_vec();
        inode::write_inode(vols, &layout, &inode, slot as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::MAGIC_OK;
    use mfs_io::Disk;
    use mfs_volume::VolumeOptions;
    use mfs_common::types::endian::Endian;
    use alloc::boxed::Box;

    fn blank_volume(sectors: u64) -> VolumeSet {
        let mut vols = VolumeSet::new();
        vols.add_volume(Box::new(alloc::vec![0u8; sectors as usize * mfs_io::SECTOR_SIZE]) as Box<dyn Disk>, VolumeOptions { writable: true, ..Default::default() });
        vols
    }

    fn write_minimal_header(vols: &mut VolumeSet, total_sectors: u64) {
        let mut h = VolumeHeader::V32(bytemuck::Zeroable::zeroed());
        if let VolumeHeader::V32(raw) = &mut h {
            raw.magic_msb.set(MAGIC_OK);
        }
        h.set_total_sectors(total_sectors);
        let zonemap = zonemap::ZoneMap::new_free(5, 6, 1, 2000, 64, 8, ZoneType::Media, false);
        let bytes = zonemap.encode();
        vols.write_data(&bytes, 5, 1).unwrap();
        if let VolumeHeader::V32(raw) = &mut h {
            raw.zonemap.sector.set(5);
            raw.zonemap.backup.set(6);
            raw.zonemap.length.set(1);
        }
        h.update_checksum();
        let mut sector = [0u8; mfs_io::SECTOR_SIZE];
        sector[..h.as_bytes().len()].copy_from_slice(h.as_bytes());
        vols.write_data(&sector, 0, 1).unwrap();
    }

    #[test]
    fn init_loads_header_and_zone_totals() {
        let mut vols = blank_volume(4096);
        write_minimal_header(&mut vols, 4096);
        let handle = MfsHandle::init(vols, 0).unwrap();
        assert!(!handle.is_64bit());
        assert_eq!(handle.sa_hours_estimate(), 64 / SABLOCKSEC);
    }

    #[test]
    fn error_channel_round_trips() {
        let mut vols = blank_volume(4096);
        write_minimal_header(&mut vols, 4096);
        let mut handle = MfsHandle::init(vols, 0).unwrap();
        assert!(!handle.has_error());
        handle.note_error(Error::BadInode(3));
        assert!(handle.has_error());
        assert!(handle.strerror().unwrap().contains("3"));
        handle.clearerror();
        assert!(!handle.has_error());
    }
}
