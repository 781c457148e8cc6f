//! Errors produced while consuming a backup stream and rebuilding a target.

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("stream ended before the expected section was fully read")]
    Truncated,
    #[error("bad magic in {what}: {found:#010x}")]
    BadMagic { what: &'static str, found: u32 },
    #[error("CRC residual mismatch: expected {expected:#010x}, got {found:#010x}")]
    CrcMismatch { expected: u32, found: u32 },
    #[error("stream claims a {stream}-bit MFS volume but the target was opened as {target}-bit")]
    BitnessMismatch { stream: u32, target: u32 },
    #[error("no arrangement of target devices can host {needed} MFS partitions")]
    NoFeasibleLayout { needed: usize },
    #[error("too many partitions for one device: {count}")]
    TooManyPartitions { count: usize },
    #[error("restore consumer called out of order: expected {expected}, was in {actual}")]
    OutOfOrder {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("source stream is smaller than the target shrink request")]
    ShrinkTargetTooSmall,
    #[error("partition {0} was never created on the target device")]
    MissingPartition(u32),
    #[error(transparent)]
    Core(#[from] mfs_core::Error),
    #[error(transparent)]
    Volume(#[from] mfs_volume::Error),
    #[error(transparent)]
    Part(#[from] mfs_part::Error),
    #[error(transparent)]
    Compress(#[from] mfs_compress::Error),
    #[error(transparent)]
    Backup(#[from] mfs_backup::Error),
    #[error(transparent)]
    DiskIo(#[from] mfs_io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
