//! `RestoreConsumer`: the other half of `mfs-backup`'s producer. Reads a
//! V1/V3 stream front-to-back and rebuilds partitions plus a fresh, live
//! MFS volume across one or more target devices (SPEC_FULL §4.7/§6.3).
//!
//! The stream's own records (header, partition/pair tables, inode-record
//! markers) are byte-order-corrected through [`crate::fields::FieldReader`]
//! using the swap decided by the header magic. Everything embedded that is
//! itself a self-describing MFS structure — the boot sector, raw partition
//! bytes, the old `VolumeHeader`, zone maps — is copied or reconstructed
//! raw: those formats carry their own endianness conventions and are never
//! re-swapped by the restore stream wrapper.

use std::io::Read;
use std::rc::Rc;
use std::cell::RefCell;

use mfs_common::alg::hash::CRC32_RESIDUAL;
use mfs_compress::DecompressingReader;
use mfs_core::handle::MfsHandle;
use mfs_core::header::VolumeHeader;
use mfs_core::inode::Inode;
use mfs_core::translog::TransactionLog;
use mfs_core::zonemap::{ZoneMap, ZoneType};
use mfs_io::{Disk, SECTOR_SIZE};
use mfs_part::{PartitionTable, PartitionView, Width};
use mfs_volume::{VolumeOptions, VolumeSet};

use crate::crc_reader::CrcReader;
use crate::error::{Error, Result};
use crate::fields::FieldReader;
use crate::layout::{self, Layout, PairSize, TargetDevice};
use crate::options::{RestoreOptions, SwapSize};
use crate::swap;

use mfs_backup::format::{BackupFlags, TB3_ENDIAN, TB3_MAGIC, TB_ENDIAN, TB_MAGIC};
use mfs_backup::partitions::MFS_TYPE;

/// Sectors reserved at the front of device 0 for the partition map itself
/// (the self-describing `Apple`/`Apple_partition_map` entry).
const APM_RESERVED_SECTORS: u64 = 64;
/// Transaction-log ring size restore gives every volume it bootstraps.
const LOG_SECTORS: u64 = 64;
/// Scratch region of unknown-purpose sectors every bootstrapped volume
/// reserves, mirroring the field TiVo's own formatter leaves in place.
const UNK_SECTORS: u64 = 16;
/// Inode-slot count used for a V1 restore, which carries no inode count of
/// its own to preserve (see DESIGN.md Open Questions).
const DEFAULT_V1_INODE_COUNT: u64 = 16_384;
/// Raw-partition number convention for the swap partition.
const SWAP_PARTNO: u32 = 8;

/// One raw (non-MFS) partition recovered from the stream.
struct PartRecord {
    sectors: u64,
    partno: u32,
}

/// One application/media partition pair recovered from the stream.
struct MfsPairRecord {
    app_sectors: u64,
    media_sectors: u64,
}

/// Which device (by index into the caller's device list) a pair landed on.
struct PlacedPair {
    app_sectors: u64,
    media_sectors: u64,
    device: usize,
}

/// Summary of what a restore actually built, since the source stream's
/// sizes and the target devices' sizes rarely match exactly.
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub is_64: bool,
    pub total_sectors: u64,
    pub swap_partition: Option<u32>,
}

/// Consumes one backup stream against a set of already-partitionable
/// target devices.
pub struct RestoreConsumer {
    opts: RestoreOptions,
}

impl RestoreConsumer {
    pub fn new(opts: RestoreOptions) -> Self {
        Self { opts }
    }

    /// Reads `reader` start to finish and rebuilds partitions plus a fresh
    /// MFS volume across `devices`, in the order given.
    pub fn restore<R: Read>(&self, reader: R, devices: Vec<Box<dyn Disk>>) -> Result<RestoreReport> {
        let mut crc = CrcReader::new(DecompressingReader::new(reader));

        let mut header_buf = [0u8; SECTOR_SIZE];
        crc.read_exact(&mut header_buf).map_err(|_| Error::Truncated)?;

        let raw_magic = u32::from_be_bytes(header_buf[0..4].try_into().unwrap());
        let (is_v3, swap) = match raw_magic {
            TB_MAGIC => (false, false),
            TB_ENDIAN => (false, true),
            TB3_MAGIC => (true, false),
            TB3_ENDIAN => (true, true),
            other => return Err(Error::BadMagic { what: "backup stream header", found: other }),
        };

        let mut hr = FieldReader::new(&header_buf, swap);
        hr.skip(4).ok_or(Error::Truncated)?; // magic, already consumed above
        let flags_bits = hr.u32().ok_or(Error::Truncated)?;
        let nsectors = hr.u32().ok_or(Error::Truncated)? as u64;
        let nparts = hr.u32().ok_or(Error::Truncated)? as u64;
        let (third_count, mfspairs, nzones, stream_v3, inode_slots, stream_slots) = if is_v3 {
            let ninodes = hr.u32().ok_or(Error::Truncated)?;
            let mfspairs = hr.u32().ok_or(Error::Truncated)? as u64;
            let nzones = hr.u32().ok_or(Error::Truncated)? as u64;
            let is_64_word = hr.u32().ok_or(Error::Truncated)?;
            let inode_slots = hr.u32().ok_or(Error::Truncated)? as u64;
            let stream_slots = hr.u32().ok_or(Error::Truncated)? as u64;
            (ninodes as u64, mfspairs, nzones, Some(is_64_word != 0), inode_slots, stream_slots)
        } else {
            let nblocks = hr.u32().ok_or(Error::Truncated)? as u64;
            let mfspairs = hr.u32().ok_or(Error::Truncated)? as u64;
            (nblocks, mfspairs, 0, None, 0, 0)
        };

        let flags = BackupFlags::from_bits_truncate(flags_bits);
        if flags.contains(BackupFlags::COMPRESSED) {
            crc.get_mut().begin_inflate();
        } else {
            crc.get_mut().skip_inflate();
        }

        // Arrays: nparts BackupPartition(8B) + (V1: nblocks BackupBlock(8B)
        // | V3: ninodes index U32(4B)) + mfspairs MfsPartitionPair(12B),
        // concatenated then padded once to a sector boundary.
        let third_elem_size = if is_v3 { 4 } else { 8 };
        let arrays_len = nparts as usize * 8 + third_count as usize * third_elem_size + mfspairs as usize * 12;
        let padded_len = arrays_len.div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        let mut arrays_buf = vec![0u8; padded_len];
        crc.read_exact(&mut arrays_buf[..arrays_len]).map_err(|_| Error::Truncated)?;
        // consume the padding bytes too (CRC accumulates over them)
        if padded_len > arrays_len {
            crc.read_exact(&mut arrays_buf[arrays_len..]).map_err(|_| Error::Truncated)?;
        }

        let mut ar = FieldReader::new(&arrays_buf, swap);
        let mut part_records = Vec::with_capacity(nparts as usize);
        for _ in 0..nparts {
            let sectors = ar.u32().ok_or(Error::Truncated)? as u64;
            let partno = ar.u8().ok_or(Error::Truncated)? as u32;
            ar.skip(3).ok_or(Error::Truncated)?; // devno + reserved[2]
            part_records.push(PartRecord { sectors, partno });
        }

        let mut block_records = Vec::new();
        if !is_v3 {
            for _ in 0..third_count {
                let firstsector = ar.u32().ok_or(Error::Truncated)? as u64;
                let sectors = ar.u32().ok_or(Error::Truncated)? as u64;
                block_records.push((firstsector, sectors));
            }
        } else {
            ar.skip(third_count as usize * 4).ok_or(Error::Truncated)?;
        }

        let mut pair_records = Vec::with_capacity(mfspairs as usize);
        for _ in 0..mfspairs {
            let app_sectors = ar.u32().ok_or(Error::Truncated)? as u64;
            let media_sectors = ar.u32().ok_or(Error::Truncated)? as u64;
            ar.skip(4).ok_or(Error::Truncated)?; // 4 partno/devno bytes
            pair_records.push(MfsPairRecord { app_sectors, media_sectors });
        }

        // Boot sector, raw.
        let mut boot_sector = [0u8; SECTOR_SIZE];
        crc.read_exact(&mut boot_sector).map_err(|_| Error::Truncated)?;

        // Raw partition data, one chunk per part_record, raw.
        let mut raw_partition_data = Vec::with_capacity(part_records.len());
        for rec in &part_records {
            let mut buf = vec![0u8; (rec.sectors * SECTOR_SIZE as u64) as usize];
            crc.read_exact(&mut buf).map_err(|_| Error::Truncated)?;
            raw_partition_data.push(buf);
        }

        let mut old_root_fsid = 0u32;
        let mut old_next_fsid = 0u32;
        let mut app_inodes: Vec<Option<Inode>> = Vec::new();
        let mut media_data: std::collections::HashMap<u32, Vec<u8>> = std::collections::HashMap::new();
        let mut blocks_data: Vec<Vec<u8>> = Vec::new();
        let stream_is_64 = stream_v3.unwrap_or(false);

        if !is_v3 {
            for (_, sectors) in &block_records {
                let mut buf = vec![0u8; (*sectors * SECTOR_SIZE as u64) as usize];
                crc.read_exact(&mut buf).map_err(|_| Error::Truncated)?;
                blocks_data.push(buf);
            }
        } else {
            // Old VolumeHeader: read exactly its own unpadded byte length,
            // then pad locally so `VolumeHeader::parse` has a full sector.
            let header_len = VolumeHeader::new(stream_is_64).as_bytes().len();
            let mut hbuf = vec![0u8; header_len];
            crc.read_exact(&mut hbuf).map_err(|_| Error::Truncated)?;
            let mut padded = [0u8; SECTOR_SIZE];
            padded[..header_len].copy_from_slice(&hbuf);
            let old_header = VolumeHeader::parse(&padded);
            old_root_fsid = old_header.root_fsid();
            old_next_fsid = old_header.next_fsid();

            // TransactionLog and UnkRegion: read and discard, both will be
            // rebuilt fresh for the new volume.
            let mut discard = vec![0u8; (old_header.lognsectors() * SECTOR_SIZE as u64) as usize];
            crc.read_exact(&mut discard).map_err(|_| Error::Truncated)?;
            let mut discard2 = vec![0u8; (old_header.unk_nsectors() * SECTOR_SIZE as u64) as usize];
            crc.read_exact(&mut discard2).map_err(|_| Error::Truncated)?;

            // Zone maps: self-describing length, Inode -> Application ->
            // Media order, `nzones` of them total.
            for _ in 0..nzones {
                read_one_zone(&mut crc, stream_is_64)?;
            }

            // AppInodes: `inode_slots` slots, in order.
            for slot in 0..inode_slots {
                let (inode_num, has_data) = read_record_header(&mut crc, swap)?;
                if has_data {
                    let mut sector = [0u8; SECTOR_SIZE];
                    crc.read_exact(&mut sector).map_err(|_| Error::Truncated)?;
                    let mut inode = Inode::decode(&sector, stream_is_64);
                    inode.inode_num = inode_num;
                    app_inodes.push(Some(inode));
                } else {
                    let _ = slot;
                    app_inodes.push(None);
                }
            }

            // MediaInodes: `stream_slots` slots, each header + (if
            // present) its own encoded sector + its recorded extent data.
            for _ in 0..stream_slots {
                let (inode_num, has_data) = read_record_header(&mut crc, swap)?;
                if !has_data {
                    continue;
                }
                let mut sector = [0u8; SECTOR_SIZE];
                crc.read_exact(&mut sector).map_err(|_| Error::Truncated)?;
                let mut inode = Inode::decode(&sector, stream_is_64);
                inode.inode_num = inode_num;
                let total: u64 = inode.extents.iter().map(|e| e.count).sum();
                let mut data = vec![0u8; (total * SECTOR_SIZE as u64) as usize];
                crc.read_exact(&mut data).map_err(|_| Error::Truncated)?;
                media_data.insert(inode.inode_num, data);
            }
        }

        let mut trailer = [0u8; 4];
        crc.read_exact(&mut trailer).map_err(|_| Error::Truncated)?;
        let found = crc.finalize();
        if found != CRC32_RESIDUAL {
            return Err(Error::CrcMismatch { expected: CRC32_RESIDUAL, found });
        }

        let is_64 = self.opts.mfs64.unwrap_or(stream_is_64);
        let _ = nsectors;

        self.rebuild(
            devices,
            is_64,
            &part_records,
            &pair_records,
            &boot_sector,
            &raw_partition_data,
            is_v3,
            old_root_fsid,
            old_next_fsid,
            app_inodes,
            media_data,
            block_records,
            blocks_data,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn rebuild(
        &self,
        devices: Vec<Box<dyn Disk>>,
        is_64: bool,
        part_records: &[PartRecord],
        pair_records: &[MfsPairRecord],
        boot_sector: &[u8; SECTOR_SIZE],
        raw_partition_data: &[Vec<u8>],
        is_v3: bool,
        old_root_fsid: u32,
        old_next_fsid: u32,
        mut app_inodes: Vec<Option<Inode>>,
        media_data: std::collections::HashMap<u32, Vec<u8>>,
        block_records: Vec<(u64, u64)>,
        blocks_data: Vec<Vec<u8>>,
    ) -> Result<RestoreReport> {
        let width = if is_64 { Width::Bits64 } else { Width::Bits32 };
        let swab = self.opts.force_bswap.unwrap_or(false);

        let target_devices: Vec<TargetDevice> = devices
            .iter()
            .enumerate()
            .map(|(i, d)| TargetDevice {
                free_sectors: d.sector_count(),
                max_partitions: self.opts.max_partitions_per_disk,
                reserved_partitions: if i == 0 { part_records.len() + 3 } else { 1 },
            })
            .collect();
        let pair_sizes: Vec<PairSize> = pair_records
            .iter()
            .map(|p| PairSize { app_sectors: p.app_sectors, media_sectors: p.media_sectors })
            .collect();
        let layout: Layout = layout::try_dev(&pair_sizes, &target_devices, self.opts.balance)?;
        let placed: Vec<PlacedPair> = layout
            .placements
            .iter()
            .zip(pair_records)
            .map(|(p, rec)| PlacedPair { app_sectors: rec.app_sectors, media_sectors: rec.media_sectors, device: p.device })
            .collect();

        let mut tables: Vec<PartitionTable<Box<dyn Disk>>> = Vec::with_capacity(devices.len());
        let mut raw_partnos: Vec<u32> = Vec::with_capacity(part_records.len());
        let mut app_slots_by_device: Vec<Vec<(usize, u64)>> = vec![Vec::new(); devices.len()];
        let mut media_slots_by_device: Vec<Vec<(usize, u64)>> = vec![Vec::new(); devices.len()];
        let mut apple_partnos: Vec<u32> = Vec::with_capacity(devices.len());
        let mut var_partno: Option<u32> = None;
        let mut db_partno: Option<u32> = None;

        for (i, disk) in devices.into_iter().enumerate() {
            let mut table = PartitionTable::initialize(disk, width, swab)?;
            let apple_partno = table.add(APM_RESERVED_SECTORS, 0, "Apple", "Apple_partition_map")?;
            apple_partnos.push(apple_partno);

            if i == 0 {
                table.write_boot_sector(boot_sector)?;
                for rec in part_records {
                    let n = table.add(rec.sectors.max(1), table.count(), &format!("raw{}", rec.partno), "Tivo_raw")?;
                    raw_partnos.push(n);
                }
                if self.opts.var_sectors > 0 {
                    var_partno = Some(table.add(self.opts.var_sectors, table.count(), "var", "Tivo_var")?);
                }
                if self.opts.db_sectors > 0 {
                    db_partno = Some(table.add(self.opts.db_sectors, table.count(), "db", "Tivo_db")?);
                }
            }
            tables.push(table);
        }

        // All application partitions across every pair, in order, so the
        // flat VolumeSet address space gives one contiguous Application
        // region; then all media partitions, one dedicated zone each.
        for (idx, pair) in placed.iter().enumerate() {
            let table = &mut tables[pair.device];
            let n = table.add(pair.app_sectors.max(1), table.count(), &format!("MFS-app-{idx}"), MFS_TYPE)?;
            app_slots_by_device[pair.device].push((idx, n as u64));
        }
        for (idx, pair) in placed.iter().enumerate() {
            let table = &mut tables[pair.device];
            let n = table.add(pair.media_sectors.max(1), table.count(), &format!("MFS-media-{idx}"), MFS_TYPE)?;
            media_slots_by_device[pair.device].push((idx, n as u64));
        }

        let mut device_slots: Vec<Vec<mfs_part::Slot>> = Vec::with_capacity(tables.len());
        let mut shared_disks: Vec<Rc<RefCell<Box<dyn Disk>>>> = Vec::with_capacity(tables.len());
        for table in tables {
            device_slots.push(table.slots().to_vec());
            shared_disks.push(Rc::new(RefCell::new(table.into_disk())));
        }

        // Write raw (non-MFS) partition data into their new slots, device 0 only.
        for (i, rec) in part_records.iter().enumerate() {
            let partno = raw_partnos[i];
            let (start, len) = find_slot(&device_slots[0], partno)?;
            let mut view = PartitionView::new(shared_disks[0].clone(), start, len);
            view.write_sectors(0, &raw_partition_data[i])?;
        }

        // Build the flat VolumeSet: all application partitions first, then
        // all media partitions, so the former stays one contiguous region.
        let mut vols = VolumeSet::new();
        let mut app_starts = vec![0u64; placed.len()];
        let mut app_sizes = vec![0u64; placed.len()];
        for device_idx in 0..device_slots.len() {
            for (pair_idx, partno) in &app_slots_by_device[device_idx] {
                let (start, len) = find_slot(&device_slots[device_idx], *partno)?;
                let view = Box::new(PartitionView::new(shared_disks[device_idx].clone(), start, len));
                let vstart = vols.add_volume(view, VolumeOptions { writable: true, user_swab: swab, ..Default::default() });
                app_starts[*pair_idx] = vstart;
                app_sizes[*pair_idx] = vols.volume_size(vstart);
            }
        }
        let mut media_starts = vec![0u64; placed.len()];
        let mut media_sizes = vec![0u64; placed.len()];
        for device_idx in 0..device_slots.len() {
            for (pair_idx, partno) in &media_slots_by_device[device_idx] {
                let (start, len) = find_slot(&device_slots[device_idx], *partno)?;
                let view = Box::new(PartitionView::new(shared_disks[device_idx].clone(), start, len));
                let vstart = vols.add_volume(view, VolumeOptions { writable: true, user_swab: swab, ..Default::default() });
                media_starts[*pair_idx] = vstart;
                media_sizes[*pair_idx] = vols.volume_size(vstart);
            }
        }

        let min_au = self.opts.min_alloc.max(1) as u64;
        let inode_count = if is_v3 { app_inodes.len() as u64 } else { DEFAULT_V1_INODE_COUNT };
        let media_regions: Vec<(u64, u64)> = media_starts.iter().zip(&media_sizes).map(|(&s, &sz)| (s, sz)).collect();

        let app_first = app_starts.first().copied().unwrap_or(0);
        let app_total: u64 = app_sizes.iter().sum();

        let partition_list = {
            let mut list = String::new();
            for i in 0..placed.len() {
                if !list.is_empty() {
                    list.push(' ');
                }
                list.push_str(&format!("MFS-app-{i} MFS-media-{i}"));
            }
            list
        };

        let mut handle = bootstrap_volume(
            vols,
            is_64,
            min_au,
            inode_count,
            app_first,
            app_total,
            &media_regions,
            old_root_fsid,
            old_next_fsid,
            &partition_list,
        )?;

        if is_v3 {
            // Shrink fixups: the source's extents are addresses in the old,
            // larger volume. Once the new VolumeHeader is live its total is
            // fixed (`new_total`, possibly smaller than the source's when
            // the backup itself was produced with `SHRINK`), so any extent
            // past it is dropped here, before space for the inode's
            // replacement data is reserved in the rebuilt volume.
            let new_total = handle.vols.volume_set_size();
            for (slot, maybe_inode) in app_inodes.iter_mut().enumerate() {
                let Some(old) = maybe_inode else { continue };
                if !old.in_use() {
                    continue;
                }
                let original_units: u64 = old.extents.iter().map(|e| e.count).sum();
                let clipped = clip_extents_for_shrink(&old.extents, new_total);
                let total_units: u64 = clipped.iter().map(|e| e.count).sum();
                let was_shrunk = total_units < original_units;
                if was_shrunk {
                    log::warn!(
                        "shrink fixup: inode {} extents truncated from {} to {} sectors (target is smaller than the backed-up volume)",
                        old.inode_num,
                        original_units,
                        total_units
                    );
                    old.size = old.size.min(total_units * SECTOR_SIZE as u64);
                    let per_block = (old.blocksize as u64 / SECTOR_SIZE as u64).max(1);
                    old.blockused = (total_units / per_block) as u32;
                }

                if total_units == 0 {
                    if old.inline_data.is_empty() {
                        // Every extent this inode had was beyond the new
                        // total and it carries no in-sector payload either;
                        // it has nothing left to restore.
                        old.refcount = 0;
                        old.extents.clear();
                    }
                    handle.write_inode(slot as u64, old)?;
                    continue;
                }

                let zone_type = if old.fsid_type == mfs_core::inode::FsidType::Stream {
                    ZoneType::Media
                } else {
                    ZoneType::Application
                };
                let new_extents = match handle.allocate(zone_type, total_units) {
                    Ok(extents) => extents,
                    Err(_) if was_shrunk => return Err(Error::ShrinkTargetTooSmall),
                    Err(e) => return Err(e.into()),
                };
                if let Some(data) = media_data.get(&old.inode_num) {
                    let data = clip_extent_data(&old.extents, new_total, data);
                    write_extents_data(&mut handle, &new_extents, &data)?;
                } else {
                    zero_fill_extents(&mut handle, &new_extents)?;
                }
                old.extents = new_extents;
                handle.write_inode(slot as u64, old)?;
            }
        } else {
            let total_sectors = handle.vols.volume_set_size();
            for ((firstsector, sectors), data) in block_records.iter().zip(blocks_data.iter()) {
                if firstsector + sectors > total_sectors {
                    log::warn!("V1 block run {firstsector}+{sectors} exceeds the rebuilt volume; skipping");
                    continue;
                }
                handle.vols.write_data(data, *firstsector, *sectors)?;
            }
        }

        if self.opts.zero_part {
            let mut targets: Vec<(usize, u32)> = apple_partnos.iter().enumerate().map(|(i, &n)| (i, n)).collect();
            if let Some(n) = var_partno {
                targets.push((0, n));
            }
            if let Some(n) = db_partno {
                targets.push((0, n));
            }
            zero_unpopulated(&shared_disks, &device_slots, &targets)?;
        }

        let swap_partno = part_records
            .iter()
            .position(|r| r.partno == SWAP_PARTNO)
            .and_then(|i| raw_partnos.get(i).copied());
        if let Some(partno) = swap_partno {
            if self.opts.swap_size != SwapSize::None {
                let (start, len) = find_slot(&device_slots[0], partno)?;
                let sectors = match self.opts.swap_size {
                    SwapSize::Sectors(n) => n,
                    _ => len,
                };
                let mut view = PartitionView::new(shared_disks[0].clone(), start, len);
                stamp_swap_signature(&mut view, sectors, self.opts.swap_v1)?;
            }
        }

        Ok(RestoreReport {
            is_64,
            total_sectors: handle.vols.volume_set_size(),
            swap_partition: swap_partno,
        })
    }
}

/// Reads one `InodeRecordHeader`: `(inode_num, has_data)`.
fn read_record_header<R: Read>(r: &mut R, swap: bool) -> Result<(u32, bool)> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(|_| Error::Truncated)?;
    let mut fr = FieldReader::new(&buf, swap);
    let inode_num = fr.u32().ok_or(Error::Truncated)?;
    let has_data = fr.u16().ok_or(Error::Truncated)? != 0;
    Ok((inode_num, has_data))
}

/// Reads one self-describing zone map: probes the minimal prefix that
/// carries `length`, then reads the rest of the zone's own declared size.
fn read_one_zone<R: Read>(r: &mut R, is_64: bool) -> Result<ZoneMap> {
    let prefix_len = if is_64 { 24 } else { 12 };
    let length_off = if is_64 { 16 } else { 8 };
    let length_size = if is_64 { 8 } else { 4 };

    let mut prefix = vec![0u8; prefix_len];
    r.read_exact(&mut prefix).map_err(|_| Error::Truncated)?;
    let length = if is_64 {
        u64::from_be_bytes(prefix[length_off..length_off + length_size].try_into().unwrap())
    } else {
        u32::from_be_bytes(prefix[length_off..length_off + length_size].try_into().unwrap()) as u64
    };

    let total = (length * SECTOR_SIZE as u64) as usize;
    let mut buf = vec![0u8; total];
    buf[..prefix_len].copy_from_slice(&prefix);
    r.read_exact(&mut buf[prefix_len..]).map_err(|_| Error::Truncated)?;
    Ok(ZoneMap::decode(&buf, is_64)?)
}

/// Maps a 1-based partition number to its `(start, length)` sector range.
fn find_slot(slots: &[mfs_part::Slot], partno: u32) -> Result<(u64, u64)> {
    slots
        .iter()
        .find(|s| s.number == partno)
        .map(|s| (s.record.start_block, s.record.block_count))
        .ok_or(Error::MissingPartition(partno))
}

/// Finds the byte-size needed to represent exactly `inode_count` slots:
/// `size = inode_count*2 + 2*sectors` where `sectors` is the zone-map's
/// own serialized sector count, solved by a short fixed-point iteration
/// since `serialized_sectors` only changes in big logarithmic steps.
fn exact_inode_region_size(inode_count: u64, is_64: bool) -> u64 {
    let mut sectors = mfs_core::zonemap::serialized_sectors(inode_count, is_64);
    for _ in 0..8 {
        let next = mfs_core::zonemap::serialized_sectors(inode_count + sectors, is_64);
        if next == sectors {
            break;
        }
        sectors = next;
    }
    inode_count * 2 + 2 * sectors
}

/// Bootstraps a brand-new, minimal MFS volume over `vols`: a header, a
/// blank transaction log, a zeroed unknown-region scratch area, an exact
/// `inode_count`-slot Inode zone, one combined Application zone, and one
/// Media zone per `media_regions` entry.
#[allow(clippy::too_many_arguments)]
fn bootstrap_volume(
    mut vols: VolumeSet,
    is_64: bool,
    min_au: u64,
    inode_count: u64,
    app_start: u64,
    app_size: u64,
    media_regions: &[(u64, u64)],
    root_fsid: u32,
    next_fsid: u32,
    partition_list: &str,
) -> Result<MfsHandle> {
    let total_sectors = vols.volume_set_size();

    let log_start = app_start + 1;
    let unk_start = log_start + LOG_SECTORS;
    let inode_start = unk_start + UNK_SECTORS;
    let inode_region_size = exact_inode_region_size(inode_count, is_64);
    let app_data_start = inode_start + inode_region_size;
    let reserved = 1 + LOG_SECTORS + UNK_SECTORS + inode_region_size;
    if app_size <= reserved {
        return Err(Error::NoFeasibleLayout { needed: reserved as usize });
    }
    let app_data_size = app_size - reserved;

    let mut header = VolumeHeader::new(is_64);
    header.set_total_sectors(total_sectors);
    header.set_root_fsid(root_fsid);
    header.set_next_fsid(next_fsid);
    header.set_log_region(log_start, LOG_SECTORS);
    header.set_unk_region(unk_start, UNK_SECTORS);
    header.set_firstpartsize(app_size / 1024);
    if !header.set_partition_list(partition_list) {
        log::warn!("restored partition-list names overflow the header field; leaving it blank");
    }

    let mut handle = MfsHandle::bootstrap(vols_take(&mut vols), header, is_64);
    handle.append_zone(ZoneType::Inode, inode_start, inode_region_size, 2)?;
    handle.append_zone(ZoneType::Application, app_data_start, app_data_size, min_au)?;
    for &(start, size) in media_regions {
        handle.append_zone(ZoneType::Media, start, size, min_au)?;
    }
    handle.write_volume_header()?;

    let log = TransactionLog { first_sector: log_start, nsectors: LOG_SECTORS };
    log.init_blank(&mut handle.vols)?;

    let zeros = vec![0u8; (UNK_SECTORS * SECTOR_SIZE as u64) as usize];
    handle.vols.write_data(&zeros, unk_start, UNK_SECTORS)?;

    Ok(handle)
}

/// Hands back an owned `VolumeSet`, leaving an empty one in its place —
/// `vols` is moved into `MfsHandle::bootstrap` which takes it by value.
fn vols_take(vols: &mut VolumeSet) -> VolumeSet {
    core::mem::take(vols)
}

/// Drops extents entirely beyond `new_total` and truncates one that
/// straddles it, preserving the order and relative position of whatever
/// survives — the shrink-fixup traversal `rebuild` runs per inode.
fn clip_extents_for_shrink(extents: &[mfs_core::Extent], new_total: u64) -> Vec<mfs_core::Extent> {
    let mut kept = Vec::with_capacity(extents.len());
    for e in extents {
        if e.sector >= new_total {
            continue;
        }
        if e.sector + e.count > new_total {
            kept.push(mfs_core::Extent { sector: e.sector, count: new_total - e.sector });
        } else {
            kept.push(*e);
        }
    }
    kept
}

/// Matches `clip_extents_for_shrink`'s truncation against the recorded
/// media data, which was serialized in the same extent order: drops the
/// bytes belonging to a fully-dropped extent and truncates the bytes of one
/// that was itself truncated.
fn clip_extent_data(original_extents: &[mfs_core::Extent], new_total: u64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut offset = 0usize;
    for e in original_extents {
        let len = (e.count * SECTOR_SIZE as u64) as usize;
        let chunk = &data[offset..offset + len];
        offset += len;
        if e.sector >= new_total {
            continue;
        }
        if e.sector + e.count > new_total {
            let kept_sectors = new_total - e.sector;
            out.extend_from_slice(&chunk[..(kept_sectors * SECTOR_SIZE as u64) as usize]);
        } else {
            out.extend_from_slice(chunk);
        }
    }
    out
}

/// Copies `data` (exactly `sum(extents) * SECTOR_SIZE` bytes) across the
/// freshly allocated extents, in order.
fn write_extents_data(handle: &mut MfsHandle, extents: &[mfs_core::Extent], data: &[u8]) -> Result<()> {
    let mut off = 0usize;
    for extent in extents {
        let len = (extent.count * SECTOR_SIZE as u64) as usize;
        handle.vols.write_data(&data[off..off + len], extent.sector, extent.count)?;
        off += len;
    }
    Ok(())
}

/// Zero-fills freshly allocated extents whose original data the backup
/// stream never carried (a stream inode dropped by the threshold, or a
/// non-stream inode's extent-based data, which the V3 format never
/// records at all).
fn zero_fill_extents(handle: &mut MfsHandle, extents: &[mfs_core::Extent]) -> Result<()> {
    for extent in extents {
        log::warn!("zero-filling {} sectors at {}: source data not carried by the backup stream", extent.count, extent.sector);
        let zeros = vec![0u8; (extent.count * SECTOR_SIZE as u64) as usize];
        handle.vols.write_data(&zeros, extent.sector, extent.count)?;
    }
    Ok(())
}

/// Zero-fills every sector of `(device_idx, partno)` targets: the freshly
/// created Apple self-entry on each device plus `var`/`db` on device 0,
/// none of which the restore otherwise writes. Only runs when
/// `RestoreOptions::zero_part` opts in — left alone, these partitions keep
/// whatever garbage the target device already had.
fn zero_unpopulated(disks: &[Rc<RefCell<Box<dyn Disk>>>], slots: &[Vec<mfs_part::Slot>], targets: &[(usize, u32)]) -> Result<()> {
    const CHUNK_SECTORS: u64 = 2048;
    let zeros = vec![0u8; (CHUNK_SECTORS * SECTOR_SIZE as u64) as usize];

    for &(device_idx, partno) in targets {
        let (start, len) = find_slot(&slots[device_idx], partno)?;
        let mut view = PartitionView::new(disks[device_idx].clone(), start, len);
        let mut offset = 0u64;
        while offset < len {
            let n = (len - offset).min(CHUNK_SECTORS);
            view.write_sectors(offset, &zeros[..(n * SECTOR_SIZE as u64) as usize])?;
            offset += n;
        }
    }
    Ok(())
}

/// Builds a swap signature page and stamps it at the start of `view`.
fn stamp_swap_signature<D: Disk>(view: &mut PartitionView<D>, sectors: u64, force_v1: bool) -> Result<()> {
    let mut page = vec![0u8; swap::PAGE_SIZE];
    swap::write_signature(&mut page, sectors, force_v1);
    view.write_sectors(0, &page)?;
    Ok(())
}
