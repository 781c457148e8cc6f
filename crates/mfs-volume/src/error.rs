/// Failure modes for [`crate::VolumeSet`] operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sector {sector} + {count} sectors crosses a volume boundary")]
    CrossVolume { sector: u64, count: u64 },
    #[error("sector {0} is not part of any member volume")]
    NoSuchSector(u64),
    #[error("volume member {0} is not writable")]
    NotWritable(usize),
    #[error(transparent)]
    Io(#[from] mfs_io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
