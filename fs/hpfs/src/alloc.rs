//! A `Vec<bool>`-backed allocator used by this crate's own tests and by the
//! `demos/` driver binary. It is explicitly **not** a reader/writer of
//! HPFS's real on-disk bitmap format (that format, and the bitmap-of-bitmaps
//! directory it's organized under, are out of scope for this crate — see
//! `map::load_bitmap_directory` for the one piece of it this crate does
//! read). It exists only so the allocation engine has a concrete
//! `BlockAllocator`/`NodeAllocator` to run its tests against.

use std::sync::Mutex;

use hpfs_core::{BlockAllocator, NodeAllocator};
use zerocopy::FromZeros;

use crate::layout::{Anode, BplusHeader, DnodeHeader, Fnode, SECTOR_SIZE};

pub struct BitmapAllocator<'a, DS: hpfs_ds::DataStorage> {
    free: Mutex<Vec<bool>>,
    storage: &'a DS,
}

impl<'a, DS: hpfs_ds::DataStorage> BitmapAllocator<'a, DS> {
    pub fn new(storage: &'a DS, n_sectors: u32) -> Self {
        Self {
            free: Mutex::new(vec![true; n_sectors as usize]),
            storage,
        }
    }

    /// Reserves `[sec, sec+count)` up front, e.g. for the boot sector, the
    /// superblock, and any fnode/anode sectors a test sets up by hand
    /// before constructing the allocator's view of the volume.
    pub fn reserve(&self, sec: u32, count: u32) {
        let mut free = self.free.lock().unwrap();
        for s in sec..sec + count {
            free[s as usize] = false;
        }
    }

    pub fn n_free(&self) -> usize {
        self.free.lock().unwrap().iter().filter(|f| **f).count()
    }

    fn try_alloc_run(free: &mut [bool], start: usize, count: usize) -> bool {
        if start + count > free.len() {
            return false;
        }
        if free[start..start + count].iter().all(|f| *f) {
            free[start..start + count].fill(false);
            true
        } else {
            false
        }
    }
}

impl<'a, DS: hpfs_ds::DataStorage> BlockAllocator for BitmapAllocator<'a, DS> {
    fn alloc_sector(&self, hint: u32, count: u32, forward_hint: u32) -> Option<u32> {
        let mut free = self.free.lock().unwrap();
        let start = hint as usize;
        let limit = (start + forward_hint as usize).min(free.len());
        for s in start..limit {
            if Self::try_alloc_run(&mut free, s, count as usize) {
                return Some(s as u32);
            }
        }
        for s in 0..free.len() {
            if Self::try_alloc_run(&mut free, s, count as usize) {
                return Some(s as u32);
            }
        }
        None
    }

    fn alloc_if_possible(&self, sector: u32) -> bool {
        let mut free = self.free.lock().unwrap();
        let idx = sector as usize;
        if idx < free.len() && free[idx] {
            free[idx] = false;
            true
        } else {
            false
        }
    }

    fn free_sectors(&self, sector: u32, count: u32) {
        let mut free = self.free.lock().unwrap();
        for s in sector..sector + count {
            if let Some(slot) = free.get_mut(s as usize) {
                *slot = true;
            }
        }
    }
}

impl<'a, DS: hpfs_ds::DataStorage> NodeAllocator for BitmapAllocator<'a, DS> {
    fn alloc_anode(&self, near: u32) -> Option<u32> {
        let sec = BlockAllocator::alloc_sector(self, near, 1, u32::MAX)?;
        if init_anode(self.storage, sec).is_err() {
            log::error!("hpfs: failed to initialize anode at sector {sec}");
            BlockAllocator::free_sectors(self, sec, 1);
            return None;
        }
        Some(sec)
    }

    fn alloc_fnode(&self, near: u32) -> Option<u32> {
        let sec = BlockAllocator::alloc_sector(self, near, 1, u32::MAX)?;
        if init_fnode(self.storage, sec).is_err() {
            log::error!("hpfs: failed to initialize fnode at sector {sec}");
            BlockAllocator::free_sectors(self, sec, 1);
            return None;
        }
        Some(sec)
    }

    fn alloc_dnode(&self, near: u32) -> Option<u32> {
        let sec = BlockAllocator::alloc_sector(self, near, 4, u32::MAX)?;
        if sec % 4 != 0 {
            BlockAllocator::free_sectors(self, sec, 4);
            return self.alloc_dnode(0);
        }
        if init_dnode(self.storage, sec).is_err() {
            log::error!("hpfs: failed to initialize dnode at sector {sec}");
            BlockAllocator::free_sectors(self, sec, 4);
            return None;
        }
        Some(sec)
    }

    fn free_node(&self, sector: u32) {
        BlockAllocator::free_sectors(self, sector, 1);
    }
}

/// Writes a pre-initialized, empty external anode into `storage` at
/// `sector`, matching what a real `NodeAllocator` promises its callers: a
/// zeroed sector with magic, `self`, and an empty `bplus_header` already
/// set, so the allocation engine never has to initialize a node's header
/// itself, only mutate an already-valid empty one.
pub fn init_anode<DS: hpfs_ds::DataStorage>(storage: &DS, sector: u32) -> hpfs_ds::Result<()> {
    use zerocopy::IntoBytes;
    let mut anode = Anode::new_zeroed();
    anode.magic = crate::layout::ANODE_MAGIC.into();
    anode.self_sec = sector.into();
    anode.btree = BplusHeader::empty_external(crate::layout::ANODE_EXTERNAL_SLOTS);
    storage.write(sector as u64 * SECTOR_SIZE as u64, anode.as_bytes())
}

pub fn init_fnode<DS: hpfs_ds::DataStorage>(storage: &DS, sector: u32) -> hpfs_ds::Result<()> {
    use zerocopy::IntoBytes;
    let mut fnode = Fnode::new_zeroed();
    fnode.magic = crate::layout::FNODE_MAGIC.into();
    fnode.btree = BplusHeader::empty_external(crate::layout::FNODE_EXTERNAL_SLOTS);
    storage.write(sector as u64 * SECTOR_SIZE as u64, fnode.as_bytes())
}

pub fn init_dnode<DS: hpfs_ds::DataStorage>(storage: &DS, sector: u32) -> hpfs_ds::Result<()> {
    use zerocopy::IntoBytes;
    let header = DnodeHeader {
        magic: crate::layout::DNODE_MAGIC.into(),
        self_sec: sector.into(),
        first_free: (12 + crate::layout::DIRENT_MIN_LEN as u32).into(),
    };
    let mut buf = [0u8; crate::layout::DNODE_SIZE];
    buf[..12].copy_from_slice(header.as_bytes());
    // terminator dirent: minimum length, LAST flag, zero-length name, and
    // the `01 FF` sentinel pattern in its final two bytes.
    buf[12] = crate::layout::DIRENT_MIN_LEN.to_le_bytes()[0];
    buf[13] = crate::layout::DIRENT_MIN_LEN.to_le_bytes()[1];
    buf[14] = crate::layout::DIRENT_FLAG_LAST;
    buf[15] = 0;
    let term_end = 12 + crate::layout::DIRENT_MIN_LEN as usize;
    buf[term_end - 2] = crate::layout::DIRENT_TERMINATOR[0];
    buf[term_end - 1] = crate::layout::DIRENT_TERMINATOR[1];
    storage.write(sector as u64 * SECTOR_SIZE as u64, &buf)
}
