/// Failure modes for [`crate::PartitionTable`] operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sector 0 signature {0:#06x} is not a recognized APM/boot signature")]
    NotATarget(u16),
    #[error("APM entry at sector {0} has a bad or mid-list signature")]
    BadSignature(u64),
    #[error("no free space large enough for {requested} sectors (largest free run: {largest})")]
    NoFreeSpace { requested: u64, largest: u64 },
    #[error("partition {0} does not exist")]
    NoSuchPartition(u32),
    #[error("partition table already has the maximum of {0} entries")]
    TooManyPartitions(usize),
    #[error("name/type field does not fit in {0} bytes")]
    FieldTooLong(usize),
    #[error("device byte-swap flag does not match expectation")]
    SwapMismatch,
    #[error(transparent)]
    Io(#[from] mfs_io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
