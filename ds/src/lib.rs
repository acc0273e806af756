#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("read-only")]
    ReadOnly,
    #[error("i/o error: {0}")]
    Io(std::io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

/// A flat, sector-addressable byte store. Implementations are free to back
/// this with a file, a block device, or memory; callers only ever see
/// byte offsets and lengths.
pub trait DataStorage {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()>;
}
