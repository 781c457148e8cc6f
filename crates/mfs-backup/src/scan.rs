//! `ScanMFS`: walks every inode in a live volume and decides which ones
//! a backup will actually carry, per the threshold options in
//! [`BackupOptions`] (SPEC_FULL §4.7). Grounded on `scan_inodes` in
//! `examples/original_source/backup/backup.c`.

use alloc::vec::Vec;

use mfs_core::inode::FsidType;
use mfs_core::{MfsHandle, Result};
use mfs_io::SECTOR_SIZE;

use crate::options::BackupOptions;

/// The outcome of walking the inode table once: which inode slots are
/// eligible for the backup, and (when shrinking) the highest sector any
/// of them references.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// `(slot, is_stream)` for every in-use inode carried into the backup,
    /// in ascending slot order. Non-stream inodes are always included;
    /// stream inodes are filtered by the threshold. `AppInodes` walks the
    /// whole table independently of this list; `MediaInodes` uses only
    /// the stream entries here.
    pub inode_indices: Vec<(u64, bool)>,
    /// Highest sector referenced by any retained inode, rounded up by the
    /// caller to the nearest 1024-sector boundary — `None` unless
    /// `target_size`/`SHRINK` was requested.
    pub shrink_to: Option<u64>,
}

impl ScanResult {
    /// Stream inode slots selected for `MediaInodes`.
    pub fn stream_slots(&self) -> impl Iterator<Item = u64> + '_ {
        self.inode_indices.iter().filter(|(_, is_stream)| *is_stream).map(|(slot, _)| *slot)
    }
}

/// `blocksize * blockused`, in sectors — the "used" half of a stream's
/// allocation (`backup.c`'s `streamsize`).
fn used_sectors(blocksize: u32, blockused: u32) -> u64 {
    (blocksize as u64 / SECTOR_SIZE as u64).max(1) * blockused as u64
}

/// `blocksize * (size / blocksize)`, i.e. the stream's total allocation in
/// sectors, used by `THRESHTOT`/`STREAM_TOT`.
fn total_sectors(blocksize: u32, size: u64) -> u64 {
    if blocksize == 0 {
        return 0;
    }
    size.div_ceil(blocksize as u64) * (blocksize as u64 / SECTOR_SIZE as u64).max(1)
}

fn passes_threshold(opts: &BackupOptions, used: u64, total: u64) -> bool {
    let Some(limit) = opts.threshold_sectors else {
        return true;
    };
    let compare = if opts.threshold_is_total { total } else { used };
    compare > 0 && compare < limit
}

/// Walks every inode slot, keeping every non-stream in-use inode plus any
/// stream inode that passes the configured threshold.
pub fn scan_mfs(handle: &MfsHandle, opts: &BackupOptions) -> Result<ScanResult> {
    let inode_count = handle.inode_count();
    let mut indices = Vec::new();
    let mut highest = 0u64;
    let shrinking = opts.target_size.is_some();

    for slot in 0..inode_count {
        let inode = match handle.read_inode(slot) {
            Ok(inode) => inode,
            Err(_) => continue,
        };
        if !inode.in_use() {
            continue;
        }

        let keep = if inode.fsid_type == FsidType::Stream {
            let used = used_sectors(inode.blocksize, inode.blockused);
            let total = total_sectors(inode.blocksize, inode.size);
            passes_threshold(opts, used, total)
        } else {
            true
        };

        if !keep {
            continue;
        }

        if shrinking {
            for extent in &inode.extents {
                highest = highest.max(extent.sector + extent.count);
            }
        }
        indices.push((slot, inode.fsid_type == FsidType::Stream));
    }

    Ok(ScanResult {
        inode_indices: indices,
        shrink_to: shrinking.then_some(highest),
    })
}

/// Merges every kept inode's extents into a sorted, coalesced list of
/// `(first_sector, length)` runs — the V1 stream's flat block list.
pub fn coalesce_blocks(handle: &MfsHandle, result: &ScanResult) -> Vec<(u64, u64)> {
    let mut runs: Vec<(u64, u64)> = Vec::new();
    for (slot, _) in &result.inode_indices {
        let Ok(inode) = handle.read_inode(*slot) else { continue };
        for extent in &inode.extents {
            runs.push((extent.sector, extent.count));
        }
    }
    runs.sort_by_key(|(start, _)| *start);

    let mut merged: Vec<(u64, u64)> = Vec::new();
    for (start, len) in runs {
        if let Some(last) = merged.last_mut() {
            if last.0 + last.1 == start {
                last.1 += len;
                continue;
            }
        }
        merged.push((start, len));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_compares_used_sectors_by_default() {
        let opts = BackupOptions {
            threshold_sectors: Some(100),
            ..Default::default()
        };
        // blocksize in bytes-per-sector units (512) * blockused blocks.
        assert!(passes_threshold(&opts, used_sectors(512, 50), 0));
        assert!(!passes_threshold(&opts, used_sectors(512, 500), 0));
    }

    #[test]
    fn threshold_tot_compares_total_allocation() {
        let opts = BackupOptions {
            threshold_sectors: Some(100),
            threshold_is_total: true,
            ..Default::default()
        };
        assert!(passes_threshold(&opts, 999, total_sectors(512, 512 * 50)));
        assert!(!passes_threshold(&opts, 0, total_sectors(512, 512 * 500)));
    }

    #[test]
    fn no_threshold_keeps_everything() {
        let opts = BackupOptions::default();
        assert!(passes_threshold(&opts, 0, 0));
    }
}
