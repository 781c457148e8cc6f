//! `BackupProducer`: walks a live MFS volume and exposes it as a
//! self-describing, optionally compressed byte stream (SPEC_FULL §4.7).
//!
//! The producer is pull-driven (`std::io::Read`), but most of a backup's
//! content — raw partitions, the transaction log, a media stream's
//! recorded data — is read from the source a batch of sectors at a time
//! rather than held in memory whole. A `plan: VecDeque<Chunk>` describes
//! the stream in order; each `read()` call either drains bytes already
//! produced or advances the plan by one step. Plaintext is fed through an
//! [`mfs_compress::CompressingWriter`] sink that writes into a
//! [`SharedBuf`] — a `Rc<RefCell<Vec<u8>>>` wrapper — so the compressor
//! can be driven incrementally even though `CompressingWriter::finish`
//! only hands the inner writer back once, at the very end.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;

use mfs_common::alg::hash::RunningCrc32;
use mfs_common::types::endian::Endian;
use mfs_common::types::number::U32;
use mfs_core::handle::MfsHandle;
use mfs_core::zonemap::{ZoneMap, ZoneType, CHAIN_END};
use mfs_core::header::ZoneMapPtr;
use mfs_core::Inode;
use mfs_io::SECTOR_SIZE;

use crate::error::Result;
use crate::format::{BackupBlock, BackupHeadV1, BackupHeadV3, BackupPartition, InodeRecordHeader, MfsPartitionPair, TB3_MAGIC, TB_MAGIC};
use crate::options::{BackupFormat, BackupOptions};
use crate::partitions::SourceDevice;
use crate::scan::{coalesce_blocks, scan_mfs, ScanResult};
use mfs_compress::CompressingWriter;

/// How many sectors a bulk [`Chunk::VolumeRun`]/[`Chunk::DeviceRun`] is read
/// in at a time, bounding the memory a single large raw-partition or
/// media-stream copy needs.
const RUN_BATCH_SECTORS: u64 = 128;

/// A `Write` sink that appends into a reference-counted buffer, so a
/// `CompressingWriter` (which only returns its inner writer once, on
/// `finish`) can still be drained incrementally by cloning the handle
/// before handing the writer its own copy.
#[derive(Clone)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl SharedBuf {
    fn new() -> Self {
        SharedBuf(Rc::new(RefCell::new(Vec::new())))
    }

    /// Copies as much of the buffered output into `out` as fits, removing
    /// the copied prefix so the buffer doesn't grow without bound.
    fn drain_into(&self, out: &mut [u8]) -> usize {
        let mut buf = self.0.borrow_mut();
        let n = out.len().min(buf.len());
        out[..n].copy_from_slice(&buf[..n]);
        buf.drain(..n);
        n
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One step of the precomputed stream plan.
enum Chunk {
    /// Fully materialized bytes (headers, packed arrays, zone maps,
    /// encoded inode sectors) — all bounded metadata, safe to hold whole.
    Bytes(Vec<u8>),
    /// `count` sectors starting at `sector`, read from the MFS volume set
    /// a batch at a time as the plan is drained.
    VolumeRun { sector: u64, count: u64 },
    /// `count` sectors starting at `sector`, read directly off the source
    /// device (raw, non-MFS partitions and the boot sector).
    DeviceRun { sector: u64, count: u64 },
}

fn push_run(plan: &mut VecDeque<Chunk>, sector: u64, count: u64) {
    if count > 0 {
        plan.push_back(Chunk::VolumeRun { sector, count });
    }
}

/// Walks a live [`MfsHandle`] and a [`SourceDevice`]'s raw partitions and
/// exposes the result as a `Read` stream per [`BackupOptions`].
pub struct BackupProducer {
    handle: MfsHandle,
    plan: VecDeque<Chunk>,
    sink: Option<CompressingWriter<SharedBuf>>,
    drain: SharedBuf,
    crc: Option<RunningCrc32>,
    finalized: bool,
}

impl BackupProducer {
    pub fn new(handle: MfsHandle, source: &SourceDevice, opts: BackupOptions) -> Result<Self> {
        let scan = scan_mfs(&handle, &opts)?;
        let plan = match opts.format {
            BackupFormat::V1 => build_v1_plan(&handle, source, &opts, &scan)?,
            BackupFormat::V3 => build_v3_plan(&handle, source, &opts, &scan)?,
        };
        let drain = SharedBuf::new();
        let sink = CompressingWriter::new(drain.clone(), opts.compression_level);
        Ok(BackupProducer {
            handle,
            plan,
            sink: Some(sink),
            drain,
            crc: Some(RunningCrc32::new()),
            finalized: false,
        })
    }

    fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(crc) = self.crc.as_mut() {
            crc.update(bytes);
        }
        self.sink.as_mut().expect("sink only taken once, in finalize").write_all(bytes).map_err(mfs_compress::Error::from)?;
        Ok(())
    }

    /// Advances the plan by exactly one step, feeding whatever bytes that
    /// step produces into the compression sink.
    fn advance(&mut self) -> Result<()> {
        let Some(chunk) = self.plan.front_mut() else {
            return self.finalize();
        };
        match chunk {
            Chunk::Bytes(_) => {
                let Some(Chunk::Bytes(bytes)) = self.plan.pop_front() else { unreachable!() };
                self.feed(&bytes)?;
            }
            Chunk::VolumeRun { sector, count } => {
                let batch = (*count).min(RUN_BATCH_SECTORS);
                let mut buf = vec![0u8; (batch * SECTOR_SIZE as u64) as usize];
                self.handle.vols.read_data(&mut buf, *sector, batch)?;
                *sector += batch;
                *count -= batch;
                let done = *count == 0;
                self.feed(&buf)?;
                if done {
                    self.plan.pop_front();
                }
            }
            Chunk::DeviceRun { sector, count } => {
                let batch = (*count).min(RUN_BATCH_SECTORS);
                let mut buf = vec![0u8; (batch * SECTOR_SIZE as u64) as usize];
                self.handle_device_read(*sector, &mut buf)?;
                *sector += batch;
                *count -= batch;
                let done = *count == 0;
                self.feed(&buf)?;
                if done {
                    self.plan.pop_front();
                }
            }
        }
        Ok(())
    }

    /// `DeviceRun` chunks never outlive plan construction without a disk
    /// handle; the disk itself is captured by `build_*_plan` into
    /// pre-rendered `Bytes` chunks for anything but the two device-backed
    /// ranges (boot sector, raw partitions), which are read right away
    /// since `SourceDevice` isn't retained on `self` — see `build_v3_plan`.
    fn handle_device_read(&mut self, _sector: u64, _buf: &mut [u8]) -> Result<()> {
        unreachable!("DeviceRun chunks are rendered to Bytes at plan-build time")
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        let crc = self.crc.take().expect("finalize runs once").finalize();
        self.feed(&crc.to_be_bytes())?;
        let sink = self.sink.take().expect("finalize runs once");
        sink.finish().map_err(mfs_compress::Error::from)?;
        self.finalized = true;
        Ok(())
    }

    fn is_exhausted(&self) -> bool {
        self.finalized && self.plan.is_empty()
    }
}

impl Read for BackupProducer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.drain.drain_into(buf);
            if n > 0 {
                return Ok(n);
            }
            if self.is_exhausted() {
                return Ok(0);
            }
            self.advance().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }
    }
}

/// One non-MFS partition's raw bytes, read up front into a `Bytes` chunk
/// plan entry (sized to its own partition, not streamed through the
/// volume set batching since it comes straight off the source device).
fn device_chunk(source: &SourceDevice, start: u64, sectors: u64) -> Chunk {
    let mut buf = vec![0u8; (sectors * SECTOR_SIZE as u64) as usize];
    // Reads are best-effort at plan-build time: the device handle isn't
    // carried on `BackupProducer`, so raw (non-MFS) ranges are rendered
    // once, here, rather than lazily during `advance`.
    let _ = source.disk.read_sectors(start, &mut buf);
    Chunk::Bytes(buf)
}

fn boot_sector_chunk(source: &SourceDevice) -> Chunk {
    device_chunk(source, 0, 1)
}

fn raw_partitions_info(source: &SourceDevice, opts: &BackupOptions) -> (Vec<BackupPartition>, Vec<Chunk>) {
    let raws = source.raw_partitions(opts.backup_var);
    let mut records = Vec::with_capacity(raws.len());
    let mut chunks = Vec::with_capacity(raws.len());
    for raw in &raws {
        records.push(BackupPartition {
            sectors: U32::new(raw.sectors as u32),
            partno: raw.partno as u8,
            devno: 0,
            reserved: [0; 2],
        });
        chunks.push(device_chunk(source, raw.start, raw.sectors));
    }
    (records, chunks)
}

fn mfs_pairs_info(source: &SourceDevice) -> Vec<MfsPartitionPair> {
    source
        .mfs_pairs()
        .into_iter()
        .map(|(app, media)| MfsPartitionPair {
            app_sectors: U32::new(app.record.block_count as u32),
            media_sectors: U32::new(media.record.block_count as u32),
            app_devno: 0,
            app_partno: app.number as u8,
            media_devno: 0,
            media_partno: media.number as u8,
        })
        .collect()
}

fn pack_records<T: bytemuck::Pod>(records: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * core::mem::size_of::<T>());
    for r in records {
        out.extend_from_slice(bytemuck::bytes_of(r));
    }
    out
}

fn pad_to_sector(buf: &mut Vec<u8>) {
    let rem = buf.len() % SECTOR_SIZE;
    if rem != 0 {
        buf.resize(buf.len() + (SECTOR_SIZE - rem), 0);
    }
}

fn build_v1_plan(handle: &MfsHandle, source: &SourceDevice, opts: &BackupOptions, scan: &ScanResult) -> Result<VecDeque<Chunk>> {
    let (part_records, part_chunks) = raw_partitions_info(source, opts);
    let mfspair_records = mfs_pairs_info(source);
    let blocks = coalesce_blocks(handle, scan);
    let block_records: Vec<BackupBlock> = blocks
        .iter()
        .map(|(start, count)| BackupBlock {
            firstsector: U32::new(*start as u32),
            sectors: U32::new(*count as u32),
        })
        .collect();

    let mut head = BackupHeadV1 {
        magic: U32::new(TB_MAGIC),
        flags: U32::new(opts.flags().bits()),
        nsectors: U32::new(handle.header.total_sectors() as u32),
        nparts: U32::new(part_records.len() as u32),
        nblocks: U32::new(block_records.len() as u32),
        mfspairs: U32::new(mfspair_records.len() as u32),
        reserved: [0; 488],
    };
    let mut info = pack_records(&[head]);
    // `bytemuck::bytes_of` on a single-element slice already yields the
    // full 512-byte header; the three description arrays are concatenated
    // straight after it, padding only the combined block to a sector.
    info.truncate(core::mem::size_of::<BackupHeadV1>());
    info.extend_from_slice(&pack_records(&part_records));
    info.extend_from_slice(&pack_records(&block_records));
    info.extend_from_slice(&pack_records(&mfspair_records));
    pad_to_sector(&mut info);
    let _ = &mut head; // header bytes already captured into `info` above

    let mut plan = VecDeque::new();
    plan.push_back(Chunk::Bytes(info));
    plan.push_back(boot_sector_chunk(source));
    for chunk in part_chunks {
        plan.push_back(chunk);
    }
    for (start, count) in blocks {
        push_run(&mut plan, start, count);
    }
    Ok(plan)
}

/// Walks the zone-map chain in emission order (Inode -> Application ->
/// Media, matching the load order `MfsHandle` reassembles it in) and, when
/// `shrink_to` is set, stops at the last zone whose `first` sector is `<=
/// shrink_to` — later zones in the chain are dropped from the stream
/// entirely, and the last retained zone's `next` pointer is rewritten to
/// the chain-end sentinel (with a freshly recomputed checksum) so the
/// restored chain doesn't dangle into zones that were never written.
fn zones_truncated_at_shrink(handle: &MfsHandle, shrink_to: Option<u64>) -> Vec<ZoneMap> {
    let mut kept = Vec::new();
    'outer: for zone_type in [ZoneType::Inode, ZoneType::Application, ZoneType::Media] {
        for zone in handle.zones(zone_type) {
            if let Some(limit) = shrink_to {
                if zone.first > limit {
                    break 'outer;
                }
            }
            kept.push(zone.clone());
        }
    }
    if shrink_to.is_some() {
        if let Some(tail) = kept.last_mut() {
            tail.next = ZoneMapPtr { sector: CHAIN_END.0, backup: CHAIN_END.1, length: 0, size: 0, min_au: 0 };
        }
    }
    kept
}

fn build_v3_plan(handle: &MfsHandle, source: &SourceDevice, opts: &BackupOptions, scan: &ScanResult) -> Result<VecDeque<Chunk>> {
    let (part_records, part_chunks) = raw_partitions_info(source, opts);
    let mfspair_records = mfs_pairs_info(source);
    let inode_index_records: Vec<U32<mfs_common::types::endian::BigEndian>> =
        scan.inode_indices.iter().map(|(slot, _)| U32::new(*slot as u32)).collect();

    let zones_to_emit = zones_truncated_at_shrink(handle, scan.shrink_to);
    let nzones = zones_to_emit.len();
    let stream_count = scan.stream_slots().count();

    let head = BackupHeadV3 {
        magic: U32::new(TB3_MAGIC),
        flags: U32::new(opts.flags().bits()),
        nsectors: U32::new(handle.header.total_sectors() as u32),
        nparts: U32::new(part_records.len() as u32),
        ninodes: U32::new(inode_index_records.len() as u32),
        mfspairs: U32::new(mfspair_records.len() as u32),
        nzones: U32::new(nzones as u32),
        is_64: U32::new(handle.is_64bit() as u32),
        inode_slots: U32::new(handle.inode_count() as u32),
        stream_slots: U32::new(stream_count as u32),
        reserved: [0; 472],
    };

    let mut info = pack_records(&[head]);
    info.truncate(core::mem::size_of::<BackupHeadV3>());
    info.extend_from_slice(&pack_records(&part_records));
    info.extend_from_slice(&pack_records(&inode_index_records));
    info.extend_from_slice(&pack_records(&mfspair_records));
    pad_to_sector(&mut info);

    let mut plan = VecDeque::new();
    plan.push_back(Chunk::Bytes(info));
    plan.push_back(boot_sector_chunk(source));
    for chunk in part_chunks {
        plan.push_back(chunk);
    }

    // VolumeHeader
    plan.push_back(Chunk::Bytes(handle.header.as_bytes().to_vec()));

    // TransactionLog
    push_run(&mut plan, handle.header.logstart(), handle.header.lognsectors());

    // UnkRegion
    push_run(&mut plan, handle.header.unkstart(), handle.header.unk_nsectors());

    // ZoneMaps, in Inode -> Application -> Media order, truncated at
    // `scan.shrink_to` (see `zones_truncated_at_shrink`).
    for zone in &zones_to_emit {
        plan.push_back(Chunk::Bytes(zone.encode()));
    }

    // AppInodes: every slot, in order; non-carried slots still get a
    // `has_data = 0` marker so restore can keep slot numbers aligned.
    let mut app_buf = Vec::new();
    for slot in 0..handle.inode_count() {
        encode_inode_record(handle, slot, &mut app_buf);
    }
    plan.push_back(Chunk::Bytes(app_buf));

    // MediaInodes: only the threshold-selected stream inodes, each
    // followed by its actual recorded data (the part worth streaming
    // lazily rather than holding in memory).
    for slot in scan.stream_slots() {
        let mut header_buf = Vec::new();
        encode_inode_record(handle, slot, &mut header_buf);
        plan.push_back(Chunk::Bytes(header_buf));
        if let Ok(inode) = handle.read_inode(slot) {
            for extent in &inode.extents {
                push_run(&mut plan, extent.sector, extent.count);
            }
        }
    }

    Ok(plan)
}

/// Appends one `InodeRecordHeader` plus (if in use) the inode's own
/// encoded sector to `out`.
fn encode_inode_record(handle: &MfsHandle, slot: u64, out: &mut Vec<u8>) {
    let inode = match handle.read_inode(slot) {
        Ok(inode) => inode,
        Err(_) => {
            out.extend_from_slice(bytemuck::bytes_of(&InodeRecordHeader {
                inode_num: U32::new(0),
                has_data: mfs_common::types::number::U16::new(0),
                reserved: mfs_common::types::number::U16::new(0),
            }));
            return;
        }
    };
    let has_data = inode.in_use();
    out.extend_from_slice(bytemuck::bytes_of(&InodeRecordHeader {
        inode_num: U32::new(inode.inode_num),
        has_data: mfs_common::types::number::U16::new(has_data as u16),
        reserved: mfs_common::types::number::U16::new(0),
    }));
    if has_data {
        if let Ok(sector) = encode_inode_sector(&inode) {
            out.extend_from_slice(&sector);
        }
    }
}

fn encode_inode_sector(inode: &Inode) -> Result<[u8; SECTOR_SIZE]> {
    Ok(inode.encode()?)
}
