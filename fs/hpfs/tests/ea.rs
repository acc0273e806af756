//! Coverage of the extended-attribute store: inline set/get round trips,
//! the silent-drop behavior on a size-mismatched overwrite, and whole-fnode
//! removal freeing an `INDIRECT` EA's external value alongside ordinary
//! file data.

use hpfs_core::BlockAllocator;
use hpfs_ds_std::MemStorage;
use hpfs_fs::{
    alloc::{init_fnode, BitmapAllocator},
    anode, ea,
    buffer::SectorCache,
    config::MountConfig,
    fnode,
    layout::{EaHeader, EaIndirect, EA_FLAG_INDIRECT, EA_INLINE_START, SECTOR_SIZE},
    map::map_fnode,
};
use zerocopy::IntoBytes;

const VOLUME_SECTORS: u32 = 4096;
const FNODE_SEC: u32 = 0;

fn fresh_volume() -> (MemStorage, MountConfig) {
    let storage = MemStorage::new(VOLUME_SECTORS as usize * SECTOR_SIZE);
    init_fnode(&storage, FNODE_SEC).unwrap();
    (storage, MountConfig::default())
}

struct UnreachableDirService;

impl fnode::DirectoryService for UnreachableDirService {
    fn remove_dtree(&self, _root_dno: u32) -> hpfs_err::Result<()> {
        unreachable!("this fnode is never a directory")
    }
}

#[test]
fn set_then_get_ea_round_trips_inline() {
    let (storage, config) = fresh_volume();
    let block_alloc = BitmapAllocator::new(&storage, VOLUME_SECTORS);
    block_alloc.reserve(FNODE_SEC, 1);
    let cache = SectorCache::new(&storage, VOLUME_SECTORS);

    ea::set_ea(&cache, &config, &block_alloc, &block_alloc, FNODE_SEC, b"UID", &[0x34, 0x12]).unwrap();

    let fnode = map_fnode(&cache, FNODE_SEC, &config).unwrap();
    let value = ea::get_ea(&cache, &config, &fnode, b"UID").unwrap();
    assert_eq!(value, vec![0x34, 0x12]);
}

#[test]
fn set_ea_same_size_overwrite_replaces_value() {
    let (storage, config) = fresh_volume();
    let block_alloc = BitmapAllocator::new(&storage, VOLUME_SECTORS);
    block_alloc.reserve(FNODE_SEC, 1);
    let cache = SectorCache::new(&storage, VOLUME_SECTORS);

    ea::set_ea(&cache, &config, &block_alloc, &block_alloc, FNODE_SEC, b"UID", &[0x34, 0x12]).unwrap();
    ea::set_ea(&cache, &config, &block_alloc, &block_alloc, FNODE_SEC, b"UID", &[0x99, 0x01]).unwrap();

    let fnode = map_fnode(&cache, FNODE_SEC, &config).unwrap();
    let value = ea::get_ea(&cache, &config, &fnode, b"UID").unwrap();
    assert_eq!(value, vec![0x99, 0x01]);
}

#[test]
fn set_ea_size_mismatch_is_silently_dropped() {
    let (storage, config) = fresh_volume();
    let block_alloc = BitmapAllocator::new(&storage, VOLUME_SECTORS);
    block_alloc.reserve(FNODE_SEC, 1);
    let cache = SectorCache::new(&storage, VOLUME_SECTORS);

    ea::set_ea(&cache, &config, &block_alloc, &block_alloc, FNODE_SEC, b"UID", &[0x34, 0x12]).unwrap();
    // Wrong length against the existing record: must not error, and must
    // leave the original value untouched.
    let result = ea::set_ea(&cache, &config, &block_alloc, &block_alloc, FNODE_SEC, b"UID", &[0x01, 0x02, 0x03]);
    assert!(result.is_ok());

    let fnode = map_fnode(&cache, FNODE_SEC, &config).unwrap();
    let value = ea::get_ea(&cache, &config, &fnode, b"UID").unwrap();
    assert_eq!(value, vec![0x34, 0x12]);
}

#[test]
fn get_ea_on_missing_name_is_not_found() {
    let (storage, config) = fresh_volume();
    let cache = SectorCache::new(&storage, VOLUME_SECTORS);
    let fnode = map_fnode(&cache, FNODE_SEC, &config).unwrap();
    assert!(ea::get_ea(&cache, &config, &fnode, b"NOPE").is_err());
}

/// Builds a raw inline EA record `{flags=INDIRECT, name, EaIndirect}` and
/// splices it into a freshly-mapped fnode's inline EA region, the way a
/// real `INDIRECT` record (one `set_ea`'s public API never constructs
/// itself, since it always promotes external values instead) would look
/// on disk.
fn splice_indirect_ea(fnode: &mut hpfs_fs::layout::Fnode, key: &[u8], value_len: u32, value_sec: u32) {
    let mut header = EaHeader {
        flags: EA_FLAG_INDIRECT,
        namelen: key.len() as u8,
        vallen_lo: 0,
        vallen_hi: 0,
    };
    header.set_valuelen(8); // the indirect pointer itself is 8 bytes
    let indirect = EaIndirect {
        length: value_len.into(),
        sector: value_sec.into(),
    };

    let mut record = Vec::new();
    record.extend_from_slice(header.as_bytes());
    record.extend_from_slice(key);
    record.push(0);
    record.extend_from_slice(indirect.as_bytes());

    let region_start = 0usize; // ea_offs == EA_INLINE_START below
    fnode.ea[region_start..region_start + record.len()].copy_from_slice(&record);
    fnode.ea_offs = EA_INLINE_START.into();
    fnode.acl_size_s = 0.into();
    fnode.ea_size_s = (record.len() as u16).into();
}

#[test]
fn remove_fnode_frees_indirect_ea_value_and_data_extents() {
    let (storage, config) = fresh_volume();
    let block_alloc = BitmapAllocator::new(&storage, VOLUME_SECTORS);
    let total_free = block_alloc.n_free();
    block_alloc.reserve(FNODE_SEC, 1);
    let cache = SectorCache::new(&storage, VOLUME_SECTORS);

    // A 900-byte indirect value needs 2 sectors.
    let value_len = 900u32;
    let value_sectors = value_len.div_ceil(SECTOR_SIZE as u32);
    let value_sec = block_alloc.alloc_sector(0, value_sectors, 16).unwrap();

    let mut fnode = map_fnode(&cache, FNODE_SEC, &config).unwrap();
    splice_indirect_ea(&mut fnode, b"EA", value_len, value_sec);
    let mut guard = cache.get_sector(FNODE_SEC).unwrap();
    guard.bytes_mut().copy_from_slice(fnode.as_bytes());
    guard.mark_dirty();
    guard.commit().unwrap();
    drop(guard);

    // Give the file some ordinary data too, so removal has to walk both
    // the allocation tree and the EA region.
    anode::append_sector(&cache, &config, &block_alloc, &block_alloc, FNODE_SEC, true, 0).unwrap();

    assert_eq!(block_alloc.n_free(), total_free - 1 - value_sectors as usize - 1);

    fnode::remove_fnode(&cache, &config, &block_alloc, &UnreachableDirService, FNODE_SEC).unwrap();

    assert_eq!(block_alloc.n_free(), total_free);
}
