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

pub use hpfs_err::*;

use zerocopy::{FromBytes, Immutable, KnownLayout};

pub trait FileSystem {
    fn stat(&self, index: u64, offset: u64, buffer: &mut [u8]) -> Result<u64>;

    fn read(&self, index: u64, offset: u64, buffer: &mut [u8]) -> Result<()>;

    fn write(&self, index: u64, offset: u64, buffer: &[u8]) -> Result<()>;
}

#[repr(C)]
#[derive(Debug, FromBytes, Immutable, KnownLayout)]
pub struct Entry {
    pub index: u64,
    pub data_length: u64,
    pub name_length: u8,
    pub name: [u8],
}

/// Allocates and frees runs of sectors. `hint` is the sector to prefer
/// allocating near; `forward_hint` bounds how far past `hint` a run may be
/// placed before the allocator gives up and searches from the start of the
/// volume instead.
pub trait BlockAllocator {
    fn alloc_sector(&self, hint: u32, count: u32, forward_hint: u32) -> Option<u32>;

    /// Extends the run starting at `sector` by one sector in place, without
    /// moving it. Returns `false` if the following sector is not free.
    fn alloc_if_possible(&self, sector: u32) -> bool;

    fn free_sectors(&self, sector: u32, count: u32);
}

/// Allocates fixed-size metadata nodes (fnodes, anodes, dnodes). Before
/// returning a sector, implementations pre-zero it and pre-initialize its
/// magic, `self` pointer, and an empty btree header (or, for a dnode, a
/// minimal terminator dirent) — callers can map the returned sector
/// immediately and only need to fill in the fields specific to their use.
pub trait NodeAllocator {
    fn alloc_anode(&self, near: u32) -> Option<u32>;

    fn alloc_fnode(&self, near: u32) -> Option<u32>;

    fn alloc_dnode(&self, near: u32) -> Option<u32>;

    fn free_node(&self, sector: u32);
}
