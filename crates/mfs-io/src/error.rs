#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sector index {index} is out of bounds (disk has {len} sectors)")]
    OutOfBounds { index: u64, len: u64 },
    #[error("buffer length {len} is not a multiple of the sector size")]
    UnalignedBuffer { len: usize },
    #[error("write target is not writable")]
    NotWritable,
    #[cfg(feature = "std")]
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
