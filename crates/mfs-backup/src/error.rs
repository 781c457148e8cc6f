/// Failure modes of the backup producer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("backup buffer is full (internal scheduling error)")]
    BufferFull,
    #[error(transparent)]
    Core(#[from] mfs_core::Error),
    #[error(transparent)]
    Volume(#[from] mfs_volume::Error),
    #[error(transparent)]
    Io(#[from] mfs_io::Error),
    #[error(transparent)]
    Compress(#[from] mfs_compress::Error),
    #[error(transparent)]
    Part(#[from] mfs_part::Error),
    #[error("requested a read after the stream already reached Complete")]
    AlreadyComplete,
}

pub type Result<T> = core::result::Result<T, Error>;
