//! End-to-end coverage of the allocation engine: sequential append,
//! forced splits, truncate, allocator-failure rollback, and cycle safety.

use std::sync::Mutex;

use hpfs_core::{BlockAllocator, NodeAllocator};
use hpfs_ds_std::MemStorage;
use hpfs_fs::{
    alloc::{init_anode, init_fnode, BitmapAllocator},
    anode,
    buffer::SectorCache,
    config::MountConfig,
    layout::{BtreeHost, InternalEntry, ANODE_INTERNAL_SLOTS, FNODE_INTERNAL_SLOTS, SECTOR_SIZE, SENTINEL},
    map::{map_anode, map_fnode},
};
use zerocopy::IntoBytes;

const VOLUME_SECTORS: u32 = 4096;

fn fresh_volume() -> (MemStorage, MountConfig) {
    let storage = MemStorage::new(VOLUME_SECTORS as usize * SECTOR_SIZE);
    init_fnode(&storage, 0).unwrap();
    (storage, MountConfig::default())
}

fn cache_for(storage: &MemStorage) -> SectorCache<'_, MemStorage> {
    SectorCache::new(storage, VOLUME_SECTORS)
}

/// Hands out sectors two apart and never coalesces, so every call past a
/// leaf's capacity triggers a real split instead of an in-place extend —
/// matching the "allocator forced to return non-adjacent sectors" setup
/// of the split scenario.
struct SpreadAllocator<'a> {
    storage: &'a MemStorage,
    next: Mutex<u32>,
}

impl<'a> SpreadAllocator<'a> {
    fn new(storage: &'a MemStorage, start: u32) -> Self {
        Self {
            storage,
            next: Mutex::new(start),
        }
    }
}

impl<'a> BlockAllocator for SpreadAllocator<'a> {
    fn alloc_sector(&self, _hint: u32, count: u32, _forward_hint: u32) -> Option<u32> {
        let mut next = self.next.lock().unwrap();
        let sec = *next;
        *next += count + 1;
        Some(sec)
    }

    fn alloc_if_possible(&self, _sector: u32) -> bool {
        false
    }

    fn free_sectors(&self, _sector: u32, _count: u32) {}
}

impl<'a> NodeAllocator for SpreadAllocator<'a> {
    fn alloc_anode(&self, near: u32) -> Option<u32> {
        let sec = BlockAllocator::alloc_sector(self, near, 1, 0)?;
        init_anode(self.storage, sec).ok()?;
        Some(sec)
    }

    fn alloc_fnode(&self, near: u32) -> Option<u32> {
        BlockAllocator::alloc_sector(self, near, 1, 0)
    }

    fn alloc_dnode(&self, near: u32) -> Option<u32> {
        BlockAllocator::alloc_sector(self, near, 4, 0)
    }

    fn free_node(&self, _sector: u32) {}
}

#[test]
fn fresh_file_ten_appends_single_extent() {
    let (storage, config) = fresh_volume();
    let block_alloc = BitmapAllocator::new(&storage, VOLUME_SECTORS);
    block_alloc.reserve(0, 1);
    let cache = cache_for(&storage);

    let mut first_disk_sec = None;
    for i in 0..10u32 {
        let d = anode::append_sector(&cache, &config, &block_alloc, &block_alloc, 0, true, i).unwrap();
        if i == 0 {
            first_disk_sec = Some(d);
        }
    }
    let base = first_disk_sec.unwrap();

    let fnode = map_fnode(&cache, 0, &config).unwrap();
    assert!(!fnode.btree.is_internal());
    assert_eq!(fnode.btree.n_used_nodes, 1);

    assert_eq!(anode::lookup(&cache, &config, 0, true, 5).unwrap(), base + 5);
    assert!(anode::lookup(&cache, &config, 0, true, 10).is_err());
}

#[test]
fn split_when_leaf_capacity_exceeded() {
    let (storage, config) = fresh_volume();
    let alloc = SpreadAllocator::new(&storage, 100);
    let cache = cache_for(&storage);

    let mut last_disk_sec = 0u32;
    for i in 0..9u32 {
        last_disk_sec = anode::append_sector(&cache, &config, &alloc, &alloc, 0, true, i).unwrap();
    }

    let fnode = map_fnode(&cache, 0, &config).unwrap();
    assert!(fnode.btree.is_internal());
    assert_eq!(fnode.btree.n_used_nodes, 1);

    let anode_sec = fnode.internal_entries()[0].down.get();
    let leaf = map_anode(&cache, anode_sec, &config).unwrap();
    assert_eq!(leaf.btree.n_used_nodes, 9);

    assert_eq!(
        anode::lookup(&cache, &config, 0, true, 8).unwrap(),
        last_disk_sec
    );
}

#[test]
fn truncate_mid_extent_frees_trailing_sectors() {
    let (storage, config) = fresh_volume();
    let block_alloc = BitmapAllocator::new(&storage, VOLUME_SECTORS);
    block_alloc.reserve(0, 1);
    let cache = cache_for(&storage);

    let mut base = 0;
    for i in 0..10u32 {
        let d = anode::append_sector(&cache, &config, &block_alloc, &block_alloc, 0, true, i).unwrap();
        if i == 0 {
            base = d;
        }
    }
    let free_before = block_alloc.n_free();

    anode::truncate(&cache, &config, &block_alloc, 0, true, 4).unwrap();

    let fnode = map_fnode(&cache, 0, &config).unwrap();
    assert_eq!(fnode.btree.n_used_nodes, 1);
    let entries = fnode.external_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].file_secno.get(), 0);
    assert_eq!(entries[0].length.get(), 4);
    assert_eq!(entries[0].disk_secno.get(), base);

    assert!(anode::lookup(&cache, &config, 0, true, 3).is_ok());
    assert!(anode::lookup(&cache, &config, 0, true, 4).is_err());
    assert_eq!(block_alloc.n_free(), free_before + 6);
}

/// Succeeds for data and fnode/dnode allocation but refuses anode
/// allocation once `anodes_remaining` is exhausted, exercising the
/// unwind path when a split can't obtain the anode it needs.
struct FailAfterAnodes<'a> {
    inner: BitmapAllocator<'a, MemStorage>,
    anodes_remaining: Mutex<u32>,
}

impl<'a> BlockAllocator for FailAfterAnodes<'a> {
    fn alloc_sector(&self, hint: u32, count: u32, forward_hint: u32) -> Option<u32> {
        self.inner.alloc_sector(hint, count, forward_hint)
    }

    /// Always refuses, so every append allocates a fresh leaf entry instead
    /// of coalescing into one extent — this test needs the fnode's 8 slots
    /// genuinely full to force the split that exercises anode-OOM rollback.
    fn alloc_if_possible(&self, _sector: u32) -> bool {
        false
    }

    fn free_sectors(&self, sector: u32, count: u32) {
        self.inner.free_sectors(sector, count)
    }
}

impl<'a> NodeAllocator for FailAfterAnodes<'a> {
    fn alloc_anode(&self, near: u32) -> Option<u32> {
        let mut remaining = self.anodes_remaining.lock().unwrap();
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        self.inner.alloc_anode(near)
    }

    fn alloc_fnode(&self, near: u32) -> Option<u32> {
        self.inner.alloc_fnode(near)
    }

    fn alloc_dnode(&self, near: u32) -> Option<u32> {
        self.inner.alloc_dnode(near)
    }

    fn free_node(&self, sector: u32) {
        self.inner.free_node(sector)
    }
}

#[test]
fn append_rolls_back_on_anode_allocation_failure() {
    let (storage, config) = fresh_volume();
    let inner = BitmapAllocator::new(&storage, VOLUME_SECTORS);
    inner.reserve(0, 1);
    let alloc = FailAfterAnodes {
        inner,
        anodes_remaining: Mutex::new(0),
    };
    let cache = cache_for(&storage);

    // Fill the fnode's 8 external slots first so the 9th call must split
    // and hit the disabled anode path.
    for i in 0..8u32 {
        anode::append_sector(&cache, &config, &alloc, &alloc, 0, true, i).unwrap();
    }
    let free_before = alloc.inner.n_free();

    let err = anode::append_sector(&cache, &config, &alloc, &alloc, 0, true, 8);
    assert!(err.is_err());
    assert_eq!(alloc.inner.n_free(), free_before, "no sector leaked on rollback");

    let fnode = map_fnode(&cache, 0, &config).unwrap();
    assert!(!fnode.btree.is_internal());
    assert_eq!(fnode.btree.n_used_nodes, 8);
    assert!(anode::lookup(&cache, &config, 0, true, 7).is_ok());
}

fn write_internal_node<DS: hpfs_ds::DataStorage>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    fnode_sec: Option<u32>,
    anode_sec: Option<u32>,
    down: u32,
) {
    if let Some(sec) = fnode_sec {
        let mut fnode = map_fnode(cache, sec, config).unwrap();
        fnode.btree.set_internal(true);
        fnode.btree.n_used_nodes = 1;
        fnode.btree.n_free_nodes = FNODE_INTERNAL_SLOTS - 1;
        let entry = InternalEntry {
            file_secno: SENTINEL.into(),
            down: down.into(),
        };
        fnode.btree_entries[0..8].copy_from_slice(entry.as_bytes());
        fnode.btree.first_free = fnode.btree.expected_first_free().into();
        let mut guard = cache.get_sector(sec).unwrap();
        guard.bytes_mut().copy_from_slice(fnode.as_bytes());
        guard.mark_dirty();
        guard.commit().unwrap();
    } else {
        let sec = anode_sec.unwrap();
        let mut anode = map_anode(cache, sec, config).unwrap();
        anode.btree.set_internal(true);
        anode.btree.n_used_nodes = 1;
        anode.btree.n_free_nodes = ANODE_INTERNAL_SLOTS - 1;
        let entry = InternalEntry {
            file_secno: SENTINEL.into(),
            down: down.into(),
        };
        anode.btree_entries[0..8].copy_from_slice(entry.as_bytes());
        anode.btree.first_free = anode.btree.expected_first_free().into();
        let mut guard = cache.get_sector(sec).unwrap();
        guard.bytes_mut().copy_from_slice(anode.as_bytes());
        guard.mark_dirty();
        guard.commit().unwrap();
    }
}

#[test]
fn cycle_in_down_pointers_is_reported_as_corruption() {
    let storage = MemStorage::new(VOLUME_SECTORS as usize * SECTOR_SIZE);
    init_fnode(&storage, 0).unwrap();
    init_anode(&storage, 1).unwrap();
    init_anode(&storage, 2).unwrap();
    let config = MountConfig::default();
    let cache = cache_for(&storage);

    // fnode -> anode 1 -> anode 2 -> anode 1: a `down`-pointer loop a
    // real tree could never produce, but that a corrupted image might.
    write_internal_node(&cache, &config, Some(0), None, 1);
    write_internal_node(&cache, &config, None, Some(1), 2);
    write_internal_node(&cache, &config, None, Some(2), 1);

    let result = anode::lookup(&cache, &config, 0, true, 0);
    assert!(result.is_err());
}
