//! The extended-attribute store: inline records packed into the fnode's
//! tail, external records in a plain sector run or (once promoted) an
//! anode-rooted allocation tree, and `INDIRECT` records whose value lives
//! in yet another sector run.

use hpfs_core::{BlockAllocator, NodeAllocator};
use hpfs_ds::DataStorage;
use hpfs_err::{Error, FsError, Result};
use zerocopy::{FromBytes, IntoBytes};

use crate::{
    anode::{self, ExtentCache},
    buffer::SectorCache,
    config::{MountConfig, EA_EXT_CAP},
    layout::{EaHeader, EaIndirect, Fnode, EA_INLINE_LIMIT, EA_INLINE_START},
    map::map_fnode,
};

/// Reads `len` bytes starting at byte `pos` of an EA region rooted at
/// `root`: a plain sector run when `!in_anode`, or the leaves of an
/// allocation tree rooted at the anode `root` when `in_anode`.
pub fn ea_read<DS: DataStorage>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    root: u32,
    in_anode: bool,
    pos: u32,
    buf: &mut [u8],
) -> Result<()> {
    let mut done = 0usize;
    let mut extent_cache = ExtentCache::default();
    while done < buf.len() {
        let cur = pos + done as u32;
        let file_sec = cur >> 9;
        let disk_sec = if in_anode {
            anode::lookup_with_cache(cache, config, root, false, file_sec, &mut extent_cache)?
        } else {
            root + file_sec
        };
        let within = (cur & 511) as usize;
        let chunk = (512 - within).min(buf.len() - done);
        let guard = cache.map_sector(disk_sec, 0)?;
        buf[done..done + chunk].copy_from_slice(&guard.bytes()[within..within + chunk]);
        done += chunk;
    }
    Ok(())
}

/// Writes `data` starting at byte `pos` of an EA region rooted at `root`,
/// mirroring `ea_read`'s addressing.
pub fn ea_write<DS: DataStorage>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    root: u32,
    in_anode: bool,
    pos: u32,
    data: &[u8],
) -> Result<()> {
    let mut done = 0usize;
    let mut extent_cache = ExtentCache::default();
    while done < data.len() {
        let cur = pos + done as u32;
        let file_sec = cur >> 9;
        let disk_sec = if in_anode {
            anode::lookup_with_cache(cache, config, root, false, file_sec, &mut extent_cache)?
        } else {
            root + file_sec
        };
        let within = (cur & 511) as usize;
        let chunk = (512 - within).min(data.len() - done);
        let mut guard = cache.map_sector(disk_sec, 0)?;
        guard.bytes_mut()[within..within + chunk].copy_from_slice(&data[done..done + chunk]);
        guard.mark_dirty();
        guard.commit()?;
        done += chunk;
    }
    Ok(())
}

fn inline_region(fnode: &Fnode) -> (u16, u16) {
    let len = fnode.ea_size_s.get();
    if len == 0 {
        // A freshly allocated fnode has `ea_offs == 0`, below
        // `EA_INLINE_START`; invariant 7 only constrains `ea_offs` once
        // there's actually an inline record. Treat an empty region as
        // starting at the inline base so callers never underflow.
        return (EA_INLINE_START, 0);
    }
    let start = fnode.ea_offs.get() + fnode.acl_size_s.get();
    (start, len)
}

/// One EA record located during a walk: its starting offset within the
/// region it was found in, the parsed header, and the raw value bytes
/// (still encoding the `{length, sector}` indirect pair if `INDIRECT`).
struct Found {
    header: EaHeader,
    value: Vec<u8>,
}

fn walk_inline(fnode: &Fnode, key: &[u8]) -> Option<Found> {
    let (start, len) = inline_region(fnode);
    let region = &fnode.ea[(start - EA_INLINE_START) as usize..(start - EA_INLINE_START + len) as usize];
    let mut off = 0usize;
    while off + 4 <= region.len() {
        let header = EaHeader::read_from_bytes(&region[off..off + 4]).ok()?;
        let rec_len = header.record_len() as usize;
        if off + rec_len > region.len() {
            return None;
        }
        let name_start = off + 4;
        let name_end = name_start + header.namelen as usize;
        let name = &region[name_start..name_end];
        let value_start = name_end + 1;
        let value_end = value_start + header.valuelen() as usize;
        if name == key {
            return Some(Found {
                header,
                value: region[value_start..value_end].to_vec(),
            });
        }
        off += rec_len;
    }
    None
}

fn walk_external<DS: DataStorage>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    root: u32,
    in_anode: bool,
    total_len: u32,
    key: &[u8],
) -> Result<Option<Found>> {
    let mut region = vec![0u8; total_len as usize];
    ea_read(cache, config, root, in_anode, 0, &mut region)?;
    let mut off = 0usize;
    while off + 4 <= region.len() {
        let header = EaHeader::read_from_bytes(&region[off..off + 4])
            .map_err(|_| Error::Fs(FsError::Inconsistent))?;
        let rec_len = header.record_len() as usize;
        if off + rec_len > region.len() {
            return Err(Error::Fs(FsError::Inconsistent));
        }
        let name_start = off + 4;
        let name_end = name_start + header.namelen as usize;
        let name = &region[name_start..name_end];
        let value_start = name_end + 1;
        let value_end = value_start + header.valuelen() as usize;
        if name == key {
            return Ok(Some(Found {
                header,
                value: region[value_start..value_end].to_vec(),
            }));
        }
        off += rec_len;
    }
    Ok(None)
}

fn resolve_value<DS: DataStorage>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    found: &Found,
) -> Result<Vec<u8>> {
    if !found.header.is_indirect() {
        return Ok(found.value.clone());
    }
    let indirect = EaIndirect::read_from_bytes(&found.value)
        .map_err(|_| Error::Fs(FsError::Inconsistent))?;
    let mut buf = vec![0u8; indirect.length.get() as usize];
    ea_read(
        cache,
        config,
        indirect.sector.get(),
        found.header.is_indirect_anode(),
        0,
        &mut buf,
    )?;
    Ok(buf)
}

/// `get_ea(fnode, key) -> value`, resolving `INDIRECT` records.
pub fn get_ea<DS: DataStorage>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    fnode: &Fnode,
    key: &[u8],
) -> Result<Vec<u8>> {
    if let Some(found) = walk_inline(fnode, key) {
        return resolve_value(cache, config, &found);
    }
    if fnode.ea_size_l.get() > 0 {
        if let Some(found) = walk_external(
            cache,
            config,
            fnode.ea_secno.get(),
            fnode.ea_in_anode(),
            fnode.ea_size_l.get(),
            key,
        )? {
            return resolve_value(cache, config, &found);
        }
    }
    Err(Error::Fs(FsError::NotFound))
}

fn overwrite_inline_value<DS: DataStorage>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    fnode_sec: u32,
    fnode: &mut Fnode,
    key: &[u8],
    data: &[u8],
) -> Result<bool> {
    let (start, len) = inline_region(fnode);
    let region_start = (start - EA_INLINE_START) as usize;
    let region = &mut fnode.ea[region_start..region_start + len as usize];
    let mut off = 0usize;
    while off + 4 <= region.len() {
        let header = EaHeader::read_from_bytes(&region[off..off + 4])
            .map_err(|_| Error::Fs(FsError::Inconsistent))?;
        let rec_len = header.record_len() as usize;
        let name_start = off + 4;
        let name_end = name_start + header.namelen as usize;
        let value_start = name_end + 1;
        let value_end = value_start + header.valuelen() as usize;
        if &region[name_start..name_end] == key {
            if header.is_indirect() {
                let old = EaIndirect::read_from_bytes(&region[value_start..value_end])
                    .map_err(|_| Error::Fs(FsError::Inconsistent))?;
                if data.len() as u32 != old.length.get() {
                    return Ok(true); // matched by name but mismatched size: silently drop
                }
                ea_write(cache, config, old.sector.get(), header.is_indirect_anode(), 0, data)?;
                return Ok(true);
            }
            if data.len() != header.valuelen() as usize {
                return Ok(true);
            }
            region[value_start..value_end].copy_from_slice(data);
            drop(region);
            write_fnode(cache, fnode_sec, fnode)?;
            return Ok(true);
        }
        off += rec_len;
    }
    Ok(false)
}

fn write_fnode<DS: DataStorage>(cache: &SectorCache<DS>, sec: u32, fnode: &Fnode) -> Result<()> {
    let mut guard = cache.get_sector(sec)?;
    guard.bytes_mut().copy_from_slice(fnode.as_bytes());
    guard.mark_dirty();
    guard.commit()
}

/// `set_ea(fnode, key, data)`. Mismatched sizes against an existing record
/// of the same name are silently dropped, matching the original.
pub fn set_ea<DS: DataStorage, BA: BlockAllocator, NA: NodeAllocator>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    block_alloc: &BA,
    node_alloc: &NA,
    fnode_sec: u32,
    key: &[u8],
    data: &[u8],
) -> Result<()> {
    if config.read_only {
        return Err(Error::Fs(FsError::ReadOnly));
    }

    let mut fnode = map_fnode(cache, fnode_sec, config)?;

    if overwrite_inline_value(cache, config, fnode_sec, &mut fnode, key, data)? {
        return Ok(());
    }
    if fnode.ea_size_l.get() > 0 {
        if let Some(found) = walk_external(
            cache,
            config,
            fnode.ea_secno.get(),
            fnode.ea_in_anode(),
            fnode.ea_size_l.get(),
            key,
        )? {
            if found.header.is_indirect() {
                let old = EaIndirect::read_from_bytes(&found.value)
                    .map_err(|_| Error::Fs(FsError::Inconsistent))?;
                if data.len() as u32 == old.length.get() {
                    ea_write(cache, config, old.sector.get(), found.header.is_indirect_anode(), 0, data)?;
                }
                return Ok(());
            }
            if data.len() as u32 != found.header.valuelen() {
                return Ok(());
            }
            // Locate the byte offset of this record's value again to patch
            // it in place; a second read of the bulk region is simpler than
            // threading offsets back out of `walk_external`.
            let mut region = vec![0u8; fnode.ea_size_l.get() as usize];
            ea_read(cache, config, fnode.ea_secno.get(), fnode.ea_in_anode(), 0, &mut region)?;
            let mut off = 0usize;
            while off + 4 <= region.len() {
                let header = EaHeader::read_from_bytes(&region[off..off + 4])
                    .map_err(|_| Error::Fs(FsError::Inconsistent))?;
                let rec_len = header.record_len() as usize;
                let name_start = off + 4;
                let name_end = name_start + header.namelen as usize;
                let value_start = name_end + 1;
                if &region[name_start..name_end] == key {
                    ea_write(
                        cache,
                        config,
                        fnode.ea_secno.get(),
                        fnode.ea_in_anode(),
                        value_start as u32,
                        data,
                    )?;
                    return Ok(());
                }
                off += rec_len;
            }
            return Ok(());
        }
    }

    append_new_ea(cache, config, block_alloc, node_alloc, fnode_sec, &mut fnode, key, data)
}

fn build_record(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut header = EaHeader {
        flags: 0,
        namelen: key.len() as u8,
        vallen_lo: 0,
        vallen_hi: 0,
    };
    header.set_valuelen(data.len() as u32);
    let mut rec = Vec::with_capacity(header.record_len() as usize);
    rec.extend_from_slice(header.as_bytes());
    rec.extend_from_slice(key);
    rec.push(0);
    rec.extend_from_slice(data);
    rec
}

#[allow(clippy::too_many_arguments)]
fn append_new_ea<DS: DataStorage, BA: BlockAllocator, NA: NodeAllocator>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    block_alloc: &BA,
    node_alloc: &NA,
    fnode_sec: u32,
    fnode: &mut Fnode,
    key: &[u8],
    data: &[u8],
) -> Result<()> {
    let record = build_record(key, data);

    // Step 2: append inline if it fits before byte 0x200 of the fnode.
    let (start, len) = inline_region(fnode);
    if start as u32 + len as u32 + record.len() as u32 <= EA_INLINE_LIMIT as u32 {
        let region_start = (start - EA_INLINE_START) as usize;
        fnode.ea[region_start + len as usize..region_start + len as usize + record.len()]
            .copy_from_slice(&record);
        fnode.ea_size_s = (len + record.len() as u16).into();
        write_fnode(cache, fnode_sec, fnode)?;
        return Ok(());
    }

    // Step 3: migrate any existing inline EA region to an external run
    // before growing it, the first time we need more than inline space.
    if fnode.ea_size_l.get() == 0 {
        let (istart, ilen) = inline_region(fnode);
        let inline_bytes = if ilen > 0 {
            let region_start = (istart - EA_INLINE_START) as usize;
            fnode.ea[region_start..region_start + ilen as usize].to_vec()
        } else {
            Vec::new()
        };
        let needed = inline_bytes.len() + record.len();
        let sectors_needed = (needed as u32).div_ceil(512).max(1);
        let sec = block_alloc
            .alloc_sector(fnode_sec, sectors_needed, 16)
            .ok_or(Error::Fs(FsError::OutOfSpace))?;
        let mut combined = inline_bytes;
        combined.extend_from_slice(&record);
        combined.resize((sectors_needed * 512) as usize, 0);
        ea_write(cache, config, sec, false, 0, &combined)?;

        fnode.ea_size_s = 0.into();
        fnode.ea_size_l = (needed as u32).into();
        fnode.ea_secno = sec.into();
        fnode.set_ea_in_anode(false);
        write_fnode(cache, fnode_sec, fnode)?;
        return Ok(());
    }

    // Step 4: grow the existing external region.
    let old_len = fnode.ea_size_l.get();
    let new_len = old_len + record.len() as u32;
    if new_len > EA_EXT_CAP {
        return Err(Error::Fs(FsError::OutOfSpace));
    }

    if fnode.ea_in_anode() {
        let old_sectors = old_len.div_ceil(512);
        let new_sectors = new_len.div_ceil(512);
        let root = fnode.ea_secno.get();
        for next in old_sectors..new_sectors {
            if let Err(e) = anode::append_sector(cache, config, block_alloc, node_alloc, root, false, next) {
                anode::truncate(cache, config, block_alloc, root, false, old_sectors)?;
                return Err(e);
            }
        }
        ea_write(cache, config, root, true, old_len, &record)?;
        fnode.ea_size_l = new_len.into();
        write_fnode(cache, fnode_sec, fnode)?;
        return Ok(());
    }

    let old_sectors = old_len.div_ceil(512);
    let new_sectors = new_len.div_ceil(512);
    let old_sec = fnode.ea_secno.get();
    if new_sectors > old_sectors {
        let extra = new_sectors - old_sectors;
        let mut extended = true;
        for i in 0..extra {
            if !block_alloc.alloc_if_possible(old_sec + old_sectors + i) {
                extended = false;
                block_alloc.free_sectors(old_sec + old_sectors, i);
                break;
            }
        }
        if !extended {
            let new_sec = block_alloc
                .alloc_sector(old_sec, new_sectors, 16)
                .ok_or(Error::Fs(FsError::OutOfSpace))?;
            let mut old_bytes = vec![0u8; (old_sectors * 512) as usize];
            ea_read(cache, config, old_sec, false, 0, &mut old_bytes)?;
            let mut copy_buf = old_bytes;
            copy_buf.resize((new_sectors * 512) as usize, 0);
            ea_write(cache, config, new_sec, false, 0, &copy_buf)?;
            block_alloc.free_sectors(old_sec, old_sectors);
            fnode.ea_secno = new_sec.into();
        }
    }
    ea_write(cache, config, fnode.ea_secno.get(), false, old_len, &record)?;
    fnode.ea_size_l = new_len.into();
    write_fnode(cache, fnode_sec, fnode)?;
    Ok(())
}

/// Frees every sector an EA region (and its `INDIRECT` targets,
/// recursively) occupies, including the root itself.
pub fn ea_remove<DS: DataStorage, BA: BlockAllocator>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    block_alloc: &BA,
    root: u32,
    in_anode: bool,
    len: u32,
) -> Result<()> {
    if len > 0 {
        let mut region = vec![0u8; len as usize];
        ea_read(cache, config, root, in_anode, 0, &mut region)?;
        let mut off = 0usize;
        while off + 4 <= region.len() {
            let header = EaHeader::read_from_bytes(&region[off..off + 4])
                .map_err(|_| Error::Fs(FsError::Inconsistent))?;
            let rec_len = header.record_len() as usize;
            if off + rec_len > region.len() {
                break;
            }
            if header.is_indirect() {
                let name_start = off + 4;
                let name_end = name_start + header.namelen as usize;
                let value_start = name_end + 1;
                let value_end = value_start + 8;
                let indirect = EaIndirect::read_from_bytes(&region[value_start..value_end])
                    .map_err(|_| Error::Fs(FsError::Inconsistent))?;
                ea_remove(
                    cache,
                    config,
                    block_alloc,
                    indirect.sector.get(),
                    header.is_indirect_anode(),
                    indirect.length.get(),
                )?;
            }
            off += rec_len;
        }
    }

    if in_anode {
        anode::remove(cache, config, block_alloc, root, false)?;
        block_alloc.free_sectors(root, 1);
    } else {
        let sectors = len.div_ceil(512).max(1);
        block_alloc.free_sectors(root, sectors);
    }
    Ok(())
}

/// Walks an fnode's inline EAs and removes every `INDIRECT` target, then
/// frees the external EA region if any. Does not touch the fnode's own
/// sector or its allocation tree — see `fnode::remove_fnode`.
pub fn ea_ext_remove_all<DS: DataStorage, BA: BlockAllocator>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    block_alloc: &BA,
    fnode: &Fnode,
) -> Result<()> {
    let (start, len) = inline_region(fnode);
    let region_start = (start - EA_INLINE_START) as usize;
    let region = &fnode.ea[region_start..region_start + len as usize];
    let mut off = 0usize;
    while off + 4 <= region.len() {
        let header = EaHeader::read_from_bytes(&region[off..off + 4])
            .map_err(|_| Error::Fs(FsError::Inconsistent))?;
        let rec_len = header.record_len() as usize;
        if off + rec_len > region.len() {
            break;
        }
        if header.is_indirect() {
            let name_start = off + 4;
            let name_end = name_start + header.namelen as usize;
            let value_start = name_end + 1;
            let value_end = value_start + 8;
            let indirect = EaIndirect::read_from_bytes(&region[value_start..value_end])
                .map_err(|_| Error::Fs(FsError::Inconsistent))?;
            ea_remove(
                cache,
                config,
                block_alloc,
                indirect.sector.get(),
                header.is_indirect_anode(),
                indirect.length.get(),
            )?;
        }
        off += rec_len;
    }

    if fnode.ea_size_l.get() > 0 {
        ea_remove(
            cache,
            config,
            block_alloc,
            fnode.ea_secno.get(),
            fnode.ea_in_anode(),
            fnode.ea_size_l.get(),
        )?;
    }
    Ok(())
}
