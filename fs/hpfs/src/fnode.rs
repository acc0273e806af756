//! Whole-fnode removal: tear down its allocation tree, its extended
//! attributes, and finally the fnode sector itself.

use hpfs_core::BlockAllocator;
use hpfs_ds::DataStorage;
use hpfs_err::{Error, FsError, Result};

use crate::{
    anode,
    buffer::SectorCache,
    config::MountConfig,
    ea,
    layout::BtreeHost,
    map::map_fnode,
};

/// Frees a directory's dnode tree. Owned by the directory subsystem, which
/// lives outside this crate; `remove_fnode` only calls through this trait
/// when the fnode it's removing turns out to be a directory.
pub trait DirectoryService {
    fn remove_dtree(&self, root_dno: u32) -> Result<()>;
}

/// `remove_fnode(sector)`: maps the fnode, dismantles whatever it owns
/// (directory tree, allocation tree, inline/external EAs), and frees the
/// fnode's own sector. Partial progress on failure still leaves every
/// invariant intact — later steps running after an earlier failure would
/// only ever free more, never corrupt what remains.
pub fn remove_fnode<DS: DataStorage, BA: BlockAllocator, D: DirectoryService>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    block_alloc: &BA,
    dir_service: &D,
    sector: u32,
) -> Result<()> {
    if config.read_only {
        return Err(Error::Fs(FsError::ReadOnly));
    }

    let fnode = map_fnode(cache, sector, config)?;

    if fnode.is_dir() {
        // A directory fnode's embedded btree holds exactly one external
        // entry: the root dnode of its directory tree. That tree is torn
        // down by the directory service, not the allocation engine.
        let root_dno = fnode
            .external_entries()
            .first()
            .map(|e| e.disk_secno.get())
            .ok_or(Error::Fs(FsError::Inconsistent))?;
        dir_service.remove_dtree(root_dno)?;
    } else {
        anode::remove(cache, config, block_alloc, sector, true)?;
    }

    ea::ea_ext_remove_all(cache, config, block_alloc, &fnode)?;

    block_alloc.free_sectors(sector, 1);
    Ok(())
}
