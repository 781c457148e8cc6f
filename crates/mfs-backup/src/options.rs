use crate::format::BackupFlags;

/// Which stream generation a [`crate::producer::BackupProducer`] emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupFormat {
    /// The original raw-block stream: a list of `(start, count)` runs
    /// copied byte-for-byte, with no understanding of MFS structure.
    V1,
    /// The structured stream: volume header, zone maps, and inodes walked
    /// and re-encoded individually, so a restore can resize the volume.
    V3,
}

/// How a [`crate::producer::BackupProducer`] walks and encodes a volume.
#[derive(Debug, Clone, Copy)]
pub struct BackupOptions {
    pub format: BackupFormat,
    /// Skip everything outside the MFS application/media partitions.
    pub mfs_only: bool,
    /// Deflate compression level, or `None` to leave the stream raw.
    pub compression_level: Option<u32>,
    /// Size (in sectors) the restore side should target, for a restore
    /// that shrinks or grows the destination relative to the source.
    pub target_size: Option<u64>,
    /// Stream inodes below this many sectors are eligible for backup; all
    /// other inodes are always carried. `None` backs up every stream too
    /// (the `mfstool`/`backup -a` "everything" mode).
    pub threshold_sectors: Option<u64>,
    /// `THRESHTOT`: the threshold above compares against a stream's total
    /// allocation (`size`) instead of its used portion (`blockused`).
    pub threshold_is_total: bool,
    /// `STREAMTOT`: once a stream passes the threshold, back up its total
    /// allocation rather than just the used portion.
    pub stream_total: bool,
    /// `BACKUPVAR`: include partition 9 (`/var`) among the raw partitions
    /// carried alongside MFS.
    pub backup_var: bool,
    /// Source device was incomplete; flag the stream as best-effort.
    pub truncated: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        BackupOptions {
            format: BackupFormat::V3,
            mfs_only: false,
            compression_level: None,
            target_size: None,
            threshold_sectors: None,
            threshold_is_total: false,
            stream_total: false,
            backup_var: false,
            truncated: false,
        }
    }
}

impl BackupOptions {
    pub(crate) fn flags(&self) -> BackupFlags {
        let mut flags = BackupFlags::empty();
        if self.mfs_only {
            flags |= BackupFlags::MFS_ONLY;
        }
        if self.target_size.is_some() {
            flags |= BackupFlags::SHRINK;
        }
        if self.threshold_is_total {
            flags |= BackupFlags::THRESH_TOT;
        }
        if self.threshold_sectors.is_some() {
            flags |= BackupFlags::THRESH_SIZE;
        }
        if self.stream_total {
            flags |= BackupFlags::STREAM_TOT;
        }
        if self.backup_var {
            flags |= BackupFlags::BACKUP_VAR;
        }
        if let Some(level) = self.compression_level {
            flags = flags.with_compression_level(level);
        }
        flags
    }
}
