// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The HPFS allocation core: anode B+ trees, the extended-attribute store,
//! and the on-disk structure layer they're built on. `FileSystemServer`
//! ties them to a `DataStorage` backend and a pair of allocators behind
//! the process-wide mutex every entry point is specified to hold.

#[cfg(any(test, feature = "testutil"))]
pub mod alloc;
pub mod anode;
pub mod buffer;
pub mod config;
pub mod cycle;
pub mod ea;
pub mod fnode;
pub mod layout;
pub mod map;

use std::sync::{Mutex, MutexGuard};

use hpfs_core::{BlockAllocator, FileSystem, NodeAllocator};
use hpfs_ds::DataStorage;
use hpfs_err::{Error, FsError, Result};

use crate::{buffer::SectorCache, config::MountConfig, layout::SECTOR_SIZE};

/// One mounted volume: a backing store, its allocators, the mount-time
/// configuration, and the single lock every public entry point holds for
/// its entire duration (§5 — reentrancy happens only through the backing
/// store's own I/O suspension, never through released filesystem state).
pub struct FileSystemServer<DS: DataStorage, BA: BlockAllocator, NA: NodeAllocator> {
    storage: DS,
    block_alloc: BA,
    node_alloc: NA,
    fs_size_sectors: u32,
    config: MountConfig,
    lock: Mutex<()>,
}

impl<DS: DataStorage, BA: BlockAllocator, NA: NodeAllocator> FileSystemServer<DS, BA, NA> {
    pub fn new(
        storage: DS,
        block_alloc: BA,
        node_alloc: NA,
        fs_size_sectors: u32,
        config: MountConfig,
    ) -> Self {
        Self {
            storage,
            block_alloc,
            node_alloc,
            fs_size_sectors,
            config,
            lock: Mutex::new(()),
        }
    }

    fn cache(&self) -> SectorCache<DS> {
        SectorCache::new(&self.storage, self.fs_size_sectors)
    }

    /// Acquires the mount lock. Held for the duration of every public
    /// method below; never retained past the method that acquired it.
    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `set_ea`/`get_ea`/`ea_remove` take an fnode sector directly rather
    /// than going through the byte-oriented `FileSystem` trait, since EAs
    /// are keyed attributes, not a byte stream.
    pub fn get_ea(&self, fnode_sector: u32, key: &[u8]) -> Result<Vec<u8>> {
        let _held = self.guard();
        let cache = self.cache();
        let fnode = map::map_fnode(&cache, fnode_sector, &self.config)?;
        ea::get_ea(&cache, &self.config, &fnode, key)
    }

    pub fn set_ea(&self, fnode_sector: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let _held = self.guard();
        let cache = self.cache();
        ea::set_ea(
            &cache,
            &self.config,
            &self.block_alloc,
            &self.node_alloc,
            fnode_sector,
            key,
            value,
        )
    }

    pub fn truncate(&self, fnode_sector: u32, new_sector_count: u32) -> Result<()> {
        let _held = self.guard();
        let cache = self.cache();
        anode::truncate(
            &cache,
            &self.config,
            &self.block_alloc,
            fnode_sector,
            true,
            new_sector_count,
        )
    }

    pub fn remove_fnode<D: fnode::DirectoryService>(
        &self,
        fnode_sector: u32,
        dir_service: &D,
    ) -> Result<()> {
        let _held = self.guard();
        let cache = self.cache();
        fnode::remove_fnode(&cache, &self.config, &self.block_alloc, dir_service, fnode_sector)
    }
}

/// `index` addresses a file by the sector of its fnode; this is the only
/// identity the allocation core knows about (name resolution belongs to
/// the out-of-scope directory subsystem). `stat`'s `data_length` is the
/// file's total allocated sector count in bytes — the core has no notion
/// of a logical end-of-file short of a full sector, since that too is
/// directory-entry state outside this crate.
impl<DS: DataStorage, BA: BlockAllocator, NA: NodeAllocator> FileSystem
    for FileSystemServer<DS, BA, NA>
{
    fn stat(&self, index: u64, _offset: u64, _buffer: &mut [u8]) -> Result<u64> {
        let _held = self.guard();
        let cache = self.cache();
        let fnode = map::map_fnode(&cache, index as u32, &self.config)?;
        let sectors = anode::count_sectors(&cache, &self.config, index as u32, true)?;
        debug_assert!(!fnode.is_dir() || sectors <= 1);
        Ok(sectors as u64 * SECTOR_SIZE as u64)
    }

    fn read(&self, index: u64, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let _held = self.guard();
        let cache = self.cache();
        let mut extent_cache = anode::ExtentCache::default();
        let mut done = 0usize;
        while done < buffer.len() {
            let cur = offset + done as u64;
            let file_sec = (cur >> 9) as u32;
            let disk_sec = anode::lookup_with_cache(
                &cache,
                &self.config,
                index as u32,
                true,
                file_sec,
                &mut extent_cache,
            )?;
            let within = (cur & 511) as usize;
            let chunk = (SECTOR_SIZE - within).min(buffer.len() - done);
            let sector = cache.map_sector(disk_sec, 0)?;
            buffer[done..done + chunk].copy_from_slice(&sector.bytes()[within..within + chunk]);
            done += chunk;
        }
        Ok(())
    }

    fn write(&self, index: u64, offset: u64, buffer: &[u8]) -> Result<()> {
        let _held = self.guard();
        if self.config.read_only {
            return Err(Error::Fs(FsError::ReadOnly));
        }
        let cache = self.cache();
        let fnode_sec = index as u32;
        let mut allocated = anode::count_sectors(&cache, &self.config, fnode_sec, true)?;
        let mut done = 0usize;
        while done < buffer.len() {
            let cur = offset + done as u64;
            let file_sec = (cur >> 9) as u32;
            while file_sec >= allocated {
                anode::append_sector(
                    &cache,
                    &self.config,
                    &self.block_alloc,
                    &self.node_alloc,
                    fnode_sec,
                    true,
                    allocated,
                )?;
                allocated += 1;
            }
            let disk_sec = anode::lookup(&cache, &self.config, fnode_sec, true, file_sec)?;
            let within = (cur & 511) as usize;
            let chunk = (SECTOR_SIZE - within).min(buffer.len() - done);
            let mut sector = cache.get_sector(disk_sec)?;
            // `append_sector` never initializes a fresh sector's data, so a
            // partial-sector write has to read the existing contents first
            // or it would clobber the untouched remainder of the sector.
            if within > 0 || chunk < SECTOR_SIZE {
                let existing = cache.map_sector(disk_sec, 0)?;
                *sector.bytes_mut() = *existing.bytes();
            }
            sector.bytes_mut()[within..within + chunk]
                .copy_from_slice(&buffer[done..done + chunk]);
            sector.mark_dirty();
            sector.commit()?;
            done += chunk;
        }
        Ok(())
    }
}
