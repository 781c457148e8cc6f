//! The transaction log: a fixed-size ring of sectors recording zone-map
//! and inode updates ahead of the structures they describe, so a crash
//! between writing an update and committing it can be replayed
//! ("fssync") instead of losing the update outright.

use alloc::vec;
use alloc::vec::Vec;

use mfs_common::alg::hash::{dvr_crc32_check, dvr_crc32_update};
use mfs_io::SECTOR_SIZE;
use mfs_volume::VolumeSet;

use crate::error::{Error, Result};
use crate::inode::Extent;

/// Byte offset of the per-sector `crc` field within [`LogHeader`].
const LOG_CHECKSUM_OFFSET: usize = 4;

const LOG_HEADER_SIZE: usize = 16;
const ENTRY_HEADER_SIZE: usize = 26;

/// The per-sector ring header: `logstamp` identifies which logical write
/// landed in this physical slot, `first`/`size` bound the valid entry
/// bytes that follow it.
#[derive(Debug, Clone, Copy)]
struct LogHeader {
    logstamp: u64,
    first: u32,
    size: u32,
}

impl LogHeader {
    fn decode(buf: &[u8]) -> Self {
        LogHeader {
            logstamp: u32::from_be_bytes(buf[0..4].try_into().unwrap()) as u64,
            first: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            size: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        }
    }

    fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&(self.logstamp as u32).to_be_bytes());
        buf[8..12].copy_from_slice(&self.first.to_be_bytes());
        buf[12..16].copy_from_slice(&self.size.to_be_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LogTransType {
    MapUpdate = 0,
    InodeUpdate = 1,
    Commit = 2,
    FsSync = 4,
    /// 64-bit-widened zone-map update, used on big-partition volumes.
    MapUpdate64 = 5,
    /// 64-bit-widened inode update.
    InodeUpdate2 = 6,
}

impl LogTransType {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => LogTransType::MapUpdate,
            1 => LogTransType::InodeUpdate,
            2 => LogTransType::Commit,
            4 => LogTransType::FsSync,
            5 => LogTransType::MapUpdate64,
            6 => LogTransType::InodeUpdate2,
            _ => return None,
        })
    }
}

/// One logged transaction. `transmaj`/`transmin` and `inode` carry the same
/// meaning as the per-record header in every variant; they're pulled up
/// here rather than duplicated per arm.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub transmaj: u32,
    pub transmin: u32,
    pub inode: u32,
    pub body: LogBody,
}

#[derive(Debug, Clone)]
pub enum LogBody {
    MapUpdate { remove: bool, sector: u64, size: u64 },
    InodeUpdate { fsid: u32, refcount: u32, size: u64, blocksize: u32, blockused: u32, lastmodified: u32, extents: Vec<Extent> },
    Commit,
    FsSync,
}

impl LogRecord {
    fn kind(&self) -> LogTransType {
        match &self.body {
            LogBody::MapUpdate { .. } => LogTransType::MapUpdate,
            LogBody::InodeUpdate { .. } => LogTransType::InodeUpdate,
            LogBody::Commit => LogTransType::Commit,
            LogBody::FsSync => LogTransType::FsSync,
        }
    }

    fn encoded_len(&self) -> usize {
        ENTRY_HEADER_SIZE
            + match &self.body {
                LogBody::MapUpdate { .. } => 16,
                LogBody::InodeUpdate { extents, .. } => 40 + extents.len() * 8,
                LogBody::Commit | LogBody::FsSync => 0,
            }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        let len = self.encoded_len();
        buf.extend_from_slice(&(len as u16).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes()); // unk1
        buf.extend_from_slice(&self.transmaj.to_be_bytes());
        buf.extend_from_slice(&self.transmin.to_be_bytes());
        buf.extend_from_slice(&self.inode.to_be_bytes());
        buf.extend_from_slice(&(self.kind() as u32).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes()); // unk2

        match &self.body {
            LogBody::MapUpdate { remove, sector, size } => {
                buf.extend_from_slice(&(*remove as u32).to_be_bytes());
                buf.extend_from_slice(&(*sector as u32).to_be_bytes());
                buf.extend_from_slice(&(*size as u32).to_be_bytes());
                buf.extend_from_slice(&0u32.to_be_bytes());
            }
            LogBody::InodeUpdate { fsid, refcount, size, blocksize, blockused, lastmodified, extents } => {
                buf.extend_from_slice(&fsid.to_be_bytes());
                buf.extend_from_slice(&refcount.to_be_bytes());
                buf.extend_from_slice(&self.transmaj.to_be_bytes());
                buf.extend_from_slice(&self.transmin.to_be_bytes());
                buf.extend_from_slice(&self.inode.to_be_bytes());
                buf.extend_from_slice(&0u32.to_be_bytes()); // unk3
                buf.extend_from_slice(&(*size as u32).to_be_bytes());
                buf.extend_from_slice(&blocksize.to_be_bytes());
                buf.extend_from_slice(&blockused.to_be_bytes());
                buf.extend_from_slice(&lastmodified.to_be_bytes());
                buf.push(1); // fsid_type: File
                buf.push(8); // unk6
                buf.extend_from_slice(&[0xbe, 0xef]);
                buf.extend_from_slice(&0u32.to_be_bytes()); // unk2
                buf.extend_from_slice(&(extents.len() as u32).to_be_bytes());
                for e in extents {
                    buf.extend_from_slice(&(e.sector as u32).to_be_bytes());
                    buf.extend_from_slice(&(e.count as u32).to_be_bytes());
                }
            }
            LogBody::Commit | LogBody::FsSync => {}
        }
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < ENTRY_HEADER_SIZE {
            return Err(Error::BrokenChain("truncated log entry header"));
        }
        let length = u16::from_be_bytes(buf[0..2].try_into().unwrap()) as usize;
        let transmaj = u32::from_be_bytes(buf[6..10].try_into().unwrap());
        let transmin = u32::from_be_bytes(buf[10..14].try_into().unwrap());
        let inode = u32::from_be_bytes(buf[14..18].try_into().unwrap());
        let transtype = u32::from_be_bytes(buf[18..22].try_into().unwrap());
        let kind = LogTransType::from_u32(transtype).ok_or(Error::BrokenChain("unrecognized log entry transtype"))?;

        if length > buf.len() {
            return Err(Error::BrokenChain("log entry length overruns sector"));
        }
        let payload = &buf[ENTRY_HEADER_SIZE..length.max(ENTRY_HEADER_SIZE)];

        let body = match kind {
            LogTransType::MapUpdate | LogTransType::MapUpdate64 => {
                let remove = u32::from_be_bytes(payload[0..4].try_into().unwrap()) != 0;
                let sector = u32::from_be_bytes(payload[4..8].try_into().unwrap()) as u64;
                let size = u32::from_be_bytes(payload[8..12].try_into().unwrap()) as u64;
                LogBody::MapUpdate { remove, sector, size }
            }
            LogTransType::InodeUpdate | LogTransType::InodeUpdate2 => {
                let fsid = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                let refcount = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                let size = u32::from_be_bytes(payload[20..24].try_into().unwrap()) as u64;
                let blocksize = u32::from_be_bytes(payload[24..28].try_into().unwrap());
                let blockused = u32::from_be_bytes(payload[28..32].try_into().unwrap());
                let lastmodified = u32::from_be_bytes(payload[32..36].try_into().unwrap());
                let dbsize = u32::from_be_bytes(payload[44..48].try_into().unwrap()) as usize;
                let mut extents = Vec::with_capacity(dbsize);
                let mut off = 48;
                for _ in 0..dbsize {
                    let sector = u32::from_be_bytes(payload[off..off + 4].try_into().unwrap()) as u64;
                    let count = u32::from_be_bytes(payload[off + 4..off + 8].try_into().unwrap()) as u64;
                    extents.push(Extent { sector, count });
                    off += 8;
                }
                LogBody::InodeUpdate { fsid, refcount, size, blocksize, blockused, lastmodified, extents }
            }
            LogTransType::Commit => LogBody::Commit,
            LogTransType::FsSync => LogBody::FsSync,
        };

        Ok((LogRecord { transmaj, transmin, inode, body }, length.max(ENTRY_HEADER_SIZE)))
    }
}

/// A fixed ring of log sectors starting at `first_sector`.
#[derive(Debug, Clone, Copy)]
pub struct TransactionLog {
    pub first_sector: u64,
    pub nsectors: u64,
}

/// Receives each record [`TransactionLog::log_fssync`] replays, in
/// consecutive-stamp order, and applies it to whatever live state the
/// caller keeps next to its copy of the volume (zone maps, inodes). Kept as
/// a trait rather than inlined into `log_fssync` because applying a
/// `MapUpdate`/`InodeUpdate` needs the caller's in-memory zone totals and
/// inode layout, neither of which `TransactionLog` itself holds — `MfsHandle`
/// is the one implementation, in `handle.rs`.
pub trait LogApplier {
    fn apply_map_update(&mut self, vols: &mut VolumeSet, remove: bool, sector: u64, size: u64) -> Result<()>;
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;
    /// A `Commit` marker closes out the transaction that preceded it; most
    /// appliers have nothing further to do since each record already
    /// applied itself as it was read.
    fn apply_commit(&mut self, vols: &mut VolumeSet) -> Result<()> {
        let _ = vols;
        Ok(())
    }
}

impl TransactionLog {
    /// Reads and parses every entry from the ring slot matching `logstamp`.
    pub fn log_read(&self, vols: &VolumeSet, logstamp: u64) -> Result<Vec<LogRecord>> {
        let slot = logstamp % self.nsectors.max(1);
        let sector = self.first_sector + slot;
        let mut buf = vec![0u8; SECTOR_SIZE];
        vols.read_data(&mut buf, sector, 1)?;

        if !dvr_crc32_check(&buf, LOG_CHECKSUM_OFFSET) {
            return Err(Error::Corrupt { what: "transaction log sector" });
        }
        let header = LogHeader::decode(&buf);
        if header.logstamp != logstamp {
            return Err(Error::BrokenChain("log slot holds a different stamp"));
        }

        let mut records = Vec::new();
        let mut off = LOG_HEADER_SIZE + header.first as usize;
        let end = LOG_HEADER_SIZE + header.size as usize;
        while off < end {
            let (record, consumed) = LogRecord::decode(&buf[off..end])?;
            records.push(record);
            off += consumed;
        }
        Ok(records)
    }

    /// Serializes `records` into one sector, tags it with `logstamp`, and
    /// writes it into the ring, overwriting whatever stamp previously
    /// occupied that slot.
    pub fn log_write(&self, vols: &mut VolumeSet, logstamp: u64, records: &[LogRecord]) -> Result<()> {
        let slot = logstamp % self.nsectors.max(1);
        let sector = self.first_sector + slot;

        let mut payload = Vec::new();
        for record in records {
            record.encode_into(&mut payload);
        }
        if LOG_HEADER_SIZE + payload.len() > SECTOR_SIZE {
            return Err(Error::BrokenChain("log entries overflow one sector"));
        }

        let mut buf = vec![0u8; SECTOR_SIZE];
        let header = LogHeader { logstamp, first: 0, size: payload.len() as u32 };
        header.encode_into(&mut buf);
        buf[LOG_HEADER_SIZE..LOG_HEADER_SIZE + payload.len()].copy_from_slice(&payload);
        dvr_crc32_update(&mut buf, LOG_CHECKSUM_OFFSET);

        vols.write_data(&buf, sector, 1)?;
        Ok(())
    }

    /// Scans every ring slot and returns the highest `logstamp` whose
    /// entries include a `Commit` or `FsSync` marker.
    pub fn log_last_sync(&self, vols: &VolumeSet) -> Result<Option<u64>> {
        let mut best = None;
        for slot in 0..self.nsectors {
            let sector = self.first_sector + slot;
            let mut buf = vec![0u8; SECTOR_SIZE];
            if vols.read_data(&mut buf, sector, 1).is_err() || !dvr_crc32_check(&buf, LOG_CHECKSUM_OFFSET) {
                continue;
            }
            let header = LogHeader::decode(&buf);
            let mut off = LOG_HEADER_SIZE + header.first as usize;
            let end = LOG_HEADER_SIZE + header.size as usize;
            let mut synced = false;
            while off < end {
                match LogRecord::decode(&buf[off..end]) {
                    Ok((record, consumed)) => {
                        if matches!(record.body, LogBody::Commit | LogBody::FsSync) {
                            synced = true;
                        }
                        off += consumed;
                    }
                    Err(_) => break,
                }
            }
            if synced {
                best = Some(best.map_or(header.logstamp, |b: u64| b.max(header.logstamp)));
            }
        }
        Ok(best)
    }

    /// Formats a brand-new ring: every slot gets a blank entry stamped
    /// `0xffffffff`, then slot `0` is overwritten with a committed,
    /// zero-length `FsSync` marker so `log_last_sync` finds a starting
    /// point on a volume that has never logged anything (restore's
    /// TransactionLog bootstrap, SPEC_FULL §4.8).
    pub fn init_blank(&self, vols: &mut VolumeSet) -> Result<()> {
        const BLANK_STAMP: u32 = 0xffff_ffff;
        for slot in 0..self.nsectors {
            let sector = self.first_sector + slot;
            let mut buf = vec![0u8; SECTOR_SIZE];
            let header = LogHeader { logstamp: BLANK_STAMP as u64, first: 0, size: 0 };
            header.encode_into(&mut buf);
            dvr_crc32_update(&mut buf, LOG_CHECKSUM_OFFSET);
            vols.write_data(&buf, sector, 1)?;
        }
        let commit = LogRecord { transmaj: 0, transmin: 0, inode: 0, body: LogBody::FsSync };
        self.log_write(vols, 0, core::slice::from_ref(&commit))?;
        Ok(())
    }

    /// Replays the log from just past the last sync point, one logical
    /// stamp at a time, applying each record through `applier` as it's
    /// read. Stops at the first stamp that isn't present in its expected
    /// ring slot (wrong stamp, bad CRC, or a malformed entry) rather than
    /// scanning every physical slot independently — a gap in the
    /// consecutive stamp sequence ends replay there even if a later,
    /// higher-stamped slot elsewhere in the ring is itself well-formed,
    /// since that slot's lower-stamped predecessor never made it to disk.
    /// Returns the number of `MapUpdate`/`InodeUpdate` records applied.
    pub fn log_fssync<A: LogApplier>(&self, vols: &mut VolumeSet, applier: &mut A) -> Result<u64> {
        let last_sync = self.log_last_sync(vols)?.unwrap_or(0);
        let mut applied = 0u64;
        let mut stamp = last_sync + 1;

        while let Ok(records) = self.log_read(vols, stamp) {
            for record in &records {
                match &record.body {
                    LogBody::MapUpdate { remove, sector, size } => {
                        applier.apply_map_update(vols, *remove, *sector, *size)?;
                        applied += 1;
                    }
                    LogBody::InodeUpdate { fsid, refcount, size, blocksize, blockused, lastmodified, extents } => {
                        applier.apply_inode_update(vols, record.inode, *fsid, *refcount, *size, *blocksize, *blockused, *lastmodified, extents)?;
                        applied += 1;
                    }
                    LogBody::Commit => applier.apply_commit(vols)?,
                    LogBody::FsSync => {}
                }
            }
            stamp += 1;
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfs_io::Disk;
    use mfs_volume::VolumeOptions;
    use alloc::boxed::Box;

    fn ring(nsectors: u64) -> (VolumeSet, TransactionLog) {
        let mut vols = VolumeSet::new();
        vols.add_volume(Box::new(vec![0u8; 2048 * SECTOR_SIZE]) as Box<dyn Disk>, VolumeOptions { writable: true, ..Default::default() });
        (vols, TransactionLog { first_sector: 10, nsectors })
    }

    #[test]
    fn write_then_read_round_trips_map_update() {
        let (mut vols, log) = ring(16);
        let record = LogRecord {
            transmaj: 1,
            transmin: 2,
            inode: 0,
            body: LogBody::MapUpdate { remove: false, sector: 5000, size: 8 },
        };
        log.log_write(&mut vols, 100, core::slice::from_ref(&record)).unwrap();
        let read_back = log.log_read(&vols, 100).unwrap();
        assert_eq!(read_back.len(), 1);
        assert!(matches!(read_back[0].body, LogBody::MapUpdate { sector: 5000, .. }));
    }

    #[test]
    fn last_sync_finds_newest_commit() {
        let (mut vols, log) = ring(4);
        for stamp in [10u64, 11, 12] {
            let commit = LogRecord { transmaj: 0, transmin: 0, inode: 0, body: LogBody::Commit };
            log.log_write(&mut vols, stamp, core::slice::from_ref(&commit)).unwrap();
        }
        assert_eq!(log.log_last_sync(&vols).unwrap(), Some(12));
    }

    #[derive(Default)]
    struct RecordingApplier {
        map_updates: Vec<(bool, u64, u64)>,
        inode_updates: Vec<u32>,
        commits: u32,
    }

    impl LogApplier for RecordingApplier {
        fn apply_map_update(&mut self, _vols: &mut VolumeSet, remove: bool, sector: u64, size: u64) -> Result<()> {
            self.map_updates.push((remove, sector, size));
            Ok(())
        }

        fn apply_inode_update(
            &mut self,
            _vols: &mut VolumeSet,
            slot: u32,
            _fsid: u32,
            _refcount: u32,
            _size: u64,
            _blocksize: u32,
            _blockused: u32,
            _lastmodified: u32,
            _extents: &[Extent],
        ) -> Result<()> {
            self.inode_updates.push(slot);
            Ok(())
        }

        fn apply_commit(&mut self, _vols: &mut VolumeSet) -> Result<()> {
            self.commits += 1;
            Ok(())
        }
    }

    #[test]
    fn fssync_applies_only_entries_after_last_sync() {
        let (mut vols, log) = ring(4);
        let commit = LogRecord { transmaj: 0, transmin: 0, inode: 0, body: LogBody::Commit };
        log.log_write(&mut vols, 1, core::slice::from_ref(&commit)).unwrap();
        let update = LogRecord { transmaj: 0, transmin: 0, inode: 3, body: LogBody::MapUpdate { remove: true, sector: 99, size: 1 } };
        log.log_write(&mut vols, 2, core::slice::from_ref(&update)).unwrap();

        let mut applier = RecordingApplier::default();
        let applied = log.log_fssync(&mut vols, &mut applier).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(applier.map_updates, vec![(true, 99, 1)]);
    }

    #[test]
    fn fssync_stops_at_the_first_gap_in_consecutive_stamps() {
        let (mut vols, log) = ring(8);
        let commit = LogRecord { transmaj: 0, transmin: 0, inode: 0, body: LogBody::Commit };
        log.log_write(&mut vols, 1, core::slice::from_ref(&commit)).unwrap();
        let first = LogRecord { transmaj: 0, transmin: 0, inode: 1, body: LogBody::MapUpdate { remove: false, sector: 10, size: 1 } };
        log.log_write(&mut vols, 2, core::slice::from_ref(&first)).unwrap();
        // Stamp 3 is skipped entirely; stamp 4 is well-formed on its own
        // but must never be reached since 3 never landed.
        let stranded = LogRecord { transmaj: 0, transmin: 0, inode: 2, body: LogBody::MapUpdate { remove: false, sector: 20, size: 1 } };
        log.log_write(&mut vols, 4, core::slice::from_ref(&stranded)).unwrap();

        let mut applier = RecordingApplier::default();
        let applied = log.log_fssync(&mut vols, &mut applier).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(applier.map_updates, vec![(false, 10, 1)]);
    }
}
