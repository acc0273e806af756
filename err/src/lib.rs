#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Not implemented")]
    Unimplemented,
    #[error("IO: {0}")]
    Io(IoError),
    #[error("FS: {0}")]
    Fs(FsError),
}

#[derive(thiserror::Error, Debug)]
pub enum IoError {
    #[error("Read-only")]
    ReadOnly,
    #[error("unaligned access, sector {0}")]
    Unaligned(u32),
}

#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("Inconsistent")]
    Inconsistent,
    #[error("Index")]
    Index,
    #[error("not found")]
    NotFound,
    #[error("out of space")]
    OutOfSpace,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("read-only filesystem")]
    ReadOnly,
}

pub type Result<T> = core::result::Result<T, Error>;
