//! Sector buffer cache adaptor. The underlying `DataStorage` has no notion
//! of caching or readahead, so this layer's only real job is to give every
//! caller the scoped-acquisition / explicit-dirty / release-on-drop shape
//! the allocation engine is written against, and to coalesce four adjacent
//! 512 B sectors into one 2 KiB working copy for dnode access.

use hpfs_ds::DataStorage;
use hpfs_err::{Error, IoError, Result};

use crate::layout::SECTOR_SIZE;

/// Thin wrapper the allocation engine drives all sector I/O through. One
/// instance per mount; cheap to construct, holds no state of its own beyond
/// the backing store and the volume size used to bound `prefetch`.
pub struct SectorCache<'a, DS: DataStorage> {
    storage: &'a DS,
    fs_size_sectors: u32,
}

impl<'a, DS: DataStorage> SectorCache<'a, DS> {
    pub fn new(storage: &'a DS, fs_size_sectors: u32) -> Self {
        Self {
            storage,
            fs_size_sectors,
        }
    }

    fn offset(sec: u32) -> u64 {
        sec as u64 * SECTOR_SIZE as u64
    }

    pub fn fs_size_sectors(&self) -> u32 {
        self.fs_size_sectors
    }

    /// Reads `sec` and issues `readahead_hint` best-effort prefetches of
    /// the sectors immediately following it.
    pub fn map_sector(&self, sec: u32, readahead_hint: u32) -> Result<SectorGuard<'a, DS>> {
        let mut buf = [0u8; SECTOR_SIZE];
        self.storage
            .read(Self::offset(sec), &mut buf)
            .map_err(|_| Error::Io(IoError::Unaligned(sec)))?;
        self.prefetch(sec + 1, readahead_hint);
        Ok(SectorGuard {
            storage: self.storage,
            sec,
            buf,
            dirty: false,
        })
    }

    /// Returns a buffer for `sec` without reading it; the caller commits to
    /// overwriting every byte. Contents are unspecified until written.
    pub fn get_sector(&self, sec: u32) -> Result<SectorGuard<'a, DS>> {
        Ok(SectorGuard {
            storage: self.storage,
            sec,
            buf: [0u8; SECTOR_SIZE],
            dirty: false,
        })
    }

    /// Maps four sectors starting at `sec` (which must be 4-aligned) as one
    /// 2 KiB scratch buffer.
    pub fn map_4(&self, sec: u32, readahead_hint: u32) -> Result<QuadGuard<'a, DS>> {
        if sec % 4 != 0 {
            return Err(Error::Fs(hpfs_err::FsError::InvalidArgument(
                "quad sector not 4-aligned",
            )));
        }
        let mut buf = [0u8; SECTOR_SIZE * 4];
        self.storage
            .read(Self::offset(sec), &mut buf)
            .map_err(|_| Error::Io(IoError::Unaligned(sec)))?;
        self.prefetch(sec + 4, readahead_hint);
        Ok(QuadGuard {
            storage: self.storage,
            sec,
            buf,
            dirty: false,
        })
    }

    pub fn get_4(&self, sec: u32) -> Result<QuadGuard<'a, DS>> {
        if sec % 4 != 0 {
            return Err(Error::Fs(hpfs_err::FsError::InvalidArgument(
                "quad sector not 4-aligned",
            )));
        }
        Ok(QuadGuard {
            storage: self.storage,
            sec,
            buf: [0u8; SECTOR_SIZE * 4],
            dirty: false,
        })
    }

    /// Best-effort readahead, stopping at the end of the volume.
    /// `DataStorage` has no async readahead facility to issue the actual
    /// prefetch through, so this is a bounds-checking no-op; it exists so
    /// call sites match the original's `ntfs_prefetch_sectors` shape and a
    /// real readahead path can be dropped in behind it later.
    pub fn prefetch(&self, sec: u32, n: u32) {
        if sec >= self.fs_size_sectors {
            return;
        }
        let _clamped = n.min(self.fs_size_sectors - sec);
    }
}

/// A single mapped sector. Dropping it without calling `mark_dirty` and
/// `commit` discards any in-memory changes; calling `mark_dirty` followed
/// by drop (or explicit `commit`) writes the buffer back.
pub struct SectorGuard<'a, DS: DataStorage> {
    storage: &'a DS,
    sec: u32,
    buf: [u8; SECTOR_SIZE],
    dirty: bool,
}

impl<'a, DS: DataStorage> SectorGuard<'a, DS> {
    pub fn sector(&self) -> u32 {
        self.sec
    }

    pub fn bytes(&self) -> &[u8; SECTOR_SIZE] {
        &self.buf
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        &mut self.buf
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Writes the buffer back now if dirty. Called automatically on drop;
    /// exposed so callers can surface a write failure instead of swallowing
    /// it at drop time.
    pub fn commit(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.storage
            .write(self.sec as u64 * SECTOR_SIZE as u64, &self.buf)
            .map_err(|_| Error::Io(IoError::Unaligned(self.sec)))?;
        self.dirty = false;
        Ok(())
    }
}

impl<'a, DS: DataStorage> Drop for SectorGuard<'a, DS> {
    fn drop(&mut self) {
        if self.dirty {
            if self
                .storage
                .write(self.sec as u64 * SECTOR_SIZE as u64, &self.buf)
                .is_err()
            {
                log::error!("hpfs: failed to write back sector {}", self.sec);
            }
        }
    }
}

/// Four adjacent sectors mapped as one contiguous 2 KiB scratch buffer.
/// `mark_dirty` splats the scratch copy back across all four underlying
/// sectors on commit/drop.
pub struct QuadGuard<'a, DS: DataStorage> {
    storage: &'a DS,
    sec: u32,
    buf: [u8; SECTOR_SIZE * 4],
    dirty: bool,
}

impl<'a, DS: DataStorage> QuadGuard<'a, DS> {
    pub fn sector(&self) -> u32 {
        self.sec
    }

    pub fn bytes(&self) -> &[u8; SECTOR_SIZE * 4] {
        &self.buf
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; SECTOR_SIZE * 4] {
        &mut self.buf
    }

    pub fn mark_4_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn commit(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.storage
            .write(self.sec as u64 * SECTOR_SIZE as u64, &self.buf)
            .map_err(|_| Error::Io(IoError::Unaligned(self.sec)))?;
        self.dirty = false;
        Ok(())
    }
}

impl<'a, DS: DataStorage> Drop for QuadGuard<'a, DS> {
    fn drop(&mut self) {
        if self.dirty {
            if self
                .storage
                .write(self.sec as u64 * SECTOR_SIZE as u64, &self.buf)
                .is_err()
            {
                log::error!("hpfs: failed to write back quad at sector {}", self.sec);
            }
        }
    }
}
