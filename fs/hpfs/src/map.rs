//! Loading and validating fnodes, anodes, and dnodes from the sector cache,
//! plus the one-shot mount-time code-page and bitmap-directory loaders.

use hpfs_ds::DataStorage;
use hpfs_err::{Error, FsError, Result};
use zerocopy::FromBytes;

use crate::{
    buffer::SectorCache,
    config::{CheckLevel, MountConfig, ANODE_RD_AHEAD, COUNT_RD_AHEAD, DNODE_RD_AHEAD, FNODE_RD_AHEAD},
    layout::{
        Anode, BtreeHost, CodePageData, CodePageDirectory, DirentHeader, DnodeHeader, Fnode,
        ANODE_MAGIC, CP_DIR_MAGIC, DIRENT_FLAG_HAS_DOWN, DIRENT_FLAG_LAST, DIRENT_MAX_LEN,
        DIRENT_MIN_LEN, DIRENT_TERMINATOR, DNODE_MAGIC, DNODE_SIZE, EA_INLINE_LIMIT,
        EA_INLINE_START, FNODE_MAGIC,
    },
};

fn corrupt(what: &str, sec: u32) -> Error {
    log::error!("hpfs: corrupt {what} at sector {sec}");
    Error::Fs(FsError::Inconsistent)
}

/// Invariants 3 and 4: slot-count balance and `first_free` consistency.
fn check_capacity(host: &impl BtreeHost, sec: u32) -> Result<()> {
    let bp = host.btree();
    if bp.capacity() != host.capacity() {
        return Err(corrupt("btree capacity", sec));
    }
    if bp.first_free.get() != bp.expected_first_free() {
        return Err(corrupt("btree first_free", sec));
    }
    Ok(())
}

pub fn map_fnode<DS: DataStorage>(
    cache: &SectorCache<DS>,
    sec: u32,
    config: &MountConfig,
) -> Result<Fnode> {
    let guard = cache.map_sector(sec, FNODE_RD_AHEAD)?;
    let fnode = Fnode::read_from_bytes(guard.bytes()).map_err(|_| corrupt("fnode layout", sec))?;
    if config.check_level == CheckLevel::None {
        return Ok(fnode);
    }
    if fnode.magic.get() != FNODE_MAGIC {
        return Err(corrupt("fnode magic", sec));
    }
    check_capacity(&fnode, sec)?;
    if fnode.ea_size_s.get() > 0 {
        let offs = fnode.ea_offs.get();
        let end = offs
            .checked_add(fnode.acl_size_s.get())
            .and_then(|v| v.checked_add(fnode.ea_size_s.get()));
        match end {
            Some(end) if offs >= EA_INLINE_START && end <= EA_INLINE_LIMIT => {}
            _ => return Err(corrupt("fnode EA bounds", sec)),
        }
    }
    Ok(fnode)
}

pub fn map_anode<DS: DataStorage>(
    cache: &SectorCache<DS>,
    sec: u32,
    config: &MountConfig,
) -> Result<Anode> {
    let guard = cache.map_sector(sec, ANODE_RD_AHEAD)?;
    let anode = Anode::read_from_bytes(guard.bytes()).map_err(|_| corrupt("anode layout", sec))?;
    if config.check_level == CheckLevel::None {
        return Ok(anode);
    }
    if anode.magic.get() != ANODE_MAGIC {
        return Err(corrupt("anode magic", sec));
    }
    if anode.self_sec.get() != sec {
        return Err(corrupt("anode self-pointer", sec));
    }
    check_capacity(&anode, sec)?;
    Ok(anode)
}

/// Dnodes are opaque to this crate: the only consumer here is EA/fnode
/// cleanup asking whether a sector run belongs to a directory, so we return
/// just the validated header. `remove_dtree` and friends live outside this
/// crate.
pub fn map_dnode<DS: DataStorage>(
    cache: &SectorCache<DS>,
    sec: u32,
    config: &MountConfig,
) -> Result<DnodeHeader> {
    let guard = cache.map_4(sec, DNODE_RD_AHEAD)?;
    let header = DnodeHeader::read_from_bytes(&guard.bytes()[..12])
        .map_err(|_| corrupt("dnode layout", sec))?;
    if config.check_level == CheckLevel::None {
        return Ok(header);
    }
    if header.magic.get() != DNODE_MAGIC {
        return Err(corrupt("dnode magic", sec));
    }
    if header.self_sec.get() != sec {
        return Err(corrupt("dnode self-pointer", sec));
    }
    if config.check_level == CheckLevel::Strict {
        validate_dirents(guard.bytes(), header.first_free.get(), sec)?;
    }
    Ok(header)
}

fn validate_dirents(buf: &[u8], first_free: u32, sec: u32) -> Result<()> {
    let mut off = 12usize;
    loop {
        if off + 4 > DNODE_SIZE {
            return Err(corrupt("dnode dirent overrun", sec));
        }
        let hdr = DirentHeader::read_from_bytes(&buf[off..off + 4])
            .map_err(|_| corrupt("dirent header", sec))?;
        let length = hdr.length.get();
        if !(DIRENT_MIN_LEN..=DIRENT_MAX_LEN).contains(&length) || length % 4 != 0 {
            return Err(corrupt("dirent length", sec));
        }
        let has_down = hdr.flags & DIRENT_FLAG_HAS_DOWN != 0;
        let expected = (31u32 + hdr.namelen as u32 + 4 * has_down as u32 + 3) & !3;
        if expected != length as u32 {
            return Err(corrupt("dirent length formula", sec));
        }
        let end = off + length as usize;
        if end > DNODE_SIZE {
            return Err(corrupt("dirent past end", sec));
        }
        let is_last = hdr.flags & DIRENT_FLAG_LAST != 0;
        if is_last {
            if hdr.namelen != 0 || buf[end - 2..end] != DIRENT_TERMINATOR {
                return Err(corrupt("dirent terminator", sec));
            }
            if end as u32 != first_free {
                return Err(corrupt("dnode first_free mismatch", sec));
            }
            return Ok(());
        }
        off = end;
        if off as u32 >= first_free {
            return Err(corrupt("dnode missing terminator", sec));
        }
    }
}

/// Derives the lowercase table from the 128-entry uppercase table exactly
/// as the original: seed identity, then for every byte whose uppercase
/// mapping moves it into the upper half, record the inverse.
fn derive_lowercase_table(uppercase: &[u8; 128]) -> [u8; 256] {
    let mut lower = [0u8; 256];
    for (i, l) in lower.iter_mut().enumerate() {
        *l = i as u8;
    }
    for (i, &upper) in uppercase.iter().enumerate() {
        let ch = 128 + i as u32;
        if upper as u32 != ch && (upper as usize) < 256 {
            lower[upper as usize] = ch as u8;
        }
    }
    lower
}

pub struct CodePageTable {
    pub uppercase: [u8; 256],
    pub lowercase: [u8; 256],
}

/// One-shot mount-time read of the code-page directory and the first code
/// page's data sector. Neither sector is retained in any cache afterward.
pub fn load_code_page<DS: DataStorage>(
    cache: &SectorCache<DS>,
    dir_sector: u32,
) -> Result<CodePageTable> {
    let guard = cache.map_sector(dir_sector, 0)?;
    let dir = CodePageDirectory::read_from_bytes(guard.bytes())
        .map_err(|_| corrupt("code page directory layout", dir_sector))?;
    if dir.magic.get() != CP_DIR_MAGIC {
        return Err(corrupt("code page directory magic", dir_sector));
    }
    let data_sec = dir.first.code_page_data_sec.get();
    let data_guard = cache.map_sector(data_sec, 0)?;
    let data = CodePageData::read_from_bytes(data_guard.bytes())
        .map_err(|_| corrupt("code page data layout", data_sec))?;

    let mut uppercase = [0u8; 256];
    for i in 0..128 {
        uppercase[i] = i as u8;
    }
    uppercase[128..].copy_from_slice(&data.uppercase_table);
    let lowercase_hi = derive_lowercase_table(&data.uppercase_table);
    let mut lowercase = [0u8; 256];
    for i in 0..128 {
        lowercase[i] = i as u8;
    }
    lowercase[128..].copy_from_slice(&lowercase_hi[128..]);

    Ok(CodePageTable {
        uppercase,
        lowercase,
    })
}

/// Reads the bitmap-of-bitmaps: one `u32` band pointer per `0x200000`
/// sectors of the volume, one sector of pointers at a time, with a
/// descending read-ahead hint matching the original's loop.
pub fn load_bitmap_directory<DS: DataStorage>(
    cache: &SectorCache<DS>,
    first_sector: u32,
    fs_size_sectors: u32,
) -> Result<Vec<u32>> {
    let n_bands = (fs_size_sectors as u64).div_ceil(0x200000) as usize;
    let pointers_per_sector = 128usize; // 512 bytes / 4 bytes per u32 pointer
    let n_sectors = n_bands.div_ceil(pointers_per_sector);

    let mut out = Vec::with_capacity(n_bands);
    for i in 0..n_sectors {
        let remaining = (n_sectors - i - 1) as u32;
        let guard = cache.map_sector(
            first_sector + i as u32,
            remaining.min(COUNT_RD_AHEAD),
        )?;
        for chunk in guard.bytes().chunks_exact(4) {
            if out.len() == n_bands {
                break;
            }
            out.push(u32::from_le_bytes(chunk.try_into().unwrap()));
        }
    }
    Ok(out)
}
