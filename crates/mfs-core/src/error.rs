/// Failure modes shared across the MFS data model.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("volume header magic {0:#010x} is not a recognized MFS magic")]
    NotATarget(u32),
    #[error("volume header state {0} is nonzero (filesystem marked inconsistent)")]
    Inconsistent(u32),
    #[error("both primary and backup copies of {what} failed their checksum")]
    Corrupt { what: &'static str },
    #[error("zone map chain is broken: {0}")]
    BrokenChain(&'static str),
    #[error("inode {0} is out of range")]
    BadInode(u32),
    #[error("no fsid {0} found after a full pass over the inode table")]
    FsidNotFound(u32),
    #[error("zone of type {0:?} has no {1} free sectors")]
    OutOfSpace(crate::zonemap::ZoneType, u64),
    #[error(transparent)]
    Volume(#[from] mfs_volume::Error),
    #[error(transparent)]
    Io(#[from] mfs_io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
