//! The allocation b+ tree engine: `lookup`, `append_sector`, `truncate`,
//! `remove`. The tree root is either an fnode sector (the common case, a
//! file's own allocation tree) or an anode sector (an EA tree rooted at
//! `fnode.ea_secno` when `FNODE_FLAG_ANODE` is set).

use hpfs_core::{BlockAllocator, NodeAllocator};
use hpfs_ds::DataStorage;
use hpfs_err::{Error, FsError, Result};
use zerocopy::{FromBytes, IntoBytes};

use crate::{
    buffer::SectorCache,
    config::{MountConfig, ALLOC_FWD_MAX, ALLOC_FWD_MIN, ALLOC_M},
    cycle::CycleDetector,
    layout::{Anode, BplusHeader, BtreeHost, ExternalEntry, Fnode, InternalEntry, SENTINEL},
    map::{map_anode, map_fnode},
};

/// Per-open-file cache of the last extent `lookup` resolved, so repeated
/// sequential reads of the same run skip the tree entirely. Owned by the
/// caller (there is no persistent "inode" object in this crate); pass the
/// same instance across calls on the same file to benefit from it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtentCache {
    pub file_sec_start: u32,
    pub disk_sec_start: u32,
    pub length: u32,
}

impl ExtentCache {
    pub fn invalidate(&mut self) {
        self.length = 0;
    }

    fn hit(&self, file_sec: u32) -> Option<u32> {
        if self.length == 0 {
            return None;
        }
        if file_sec >= self.file_sec_start && file_sec < self.file_sec_start + self.length {
            Some(self.disk_sec_start + (file_sec - self.file_sec_start))
        } else {
            None
        }
    }

    fn fill(&mut self, e: &ExternalEntry) {
        self.file_sec_start = e.file_secno.get();
        self.disk_sec_start = e.disk_secno.get();
        self.length = e.length.get();
    }
}

/// A tree root or interior/leaf node loaded from disk, tagged with its own
/// sector and whether it's the embedded fnode root.
enum Node {
    Fnode(Fnode, u32),
    Anode(Anode, u32),
}

impl Node {
    fn sector(&self) -> u32 {
        match self {
            Node::Fnode(_, s) | Node::Anode(_, s) => *s,
        }
    }

    fn is_fnode(&self) -> bool {
        matches!(self, Node::Fnode(..))
    }

    fn btree(&self) -> &BplusHeader {
        match self {
            Node::Fnode(f, _) => f.btree(),
            Node::Anode(a, _) => a.btree(),
        }
    }

    fn up(&self) -> Option<u32> {
        match self {
            Node::Fnode(..) => None,
            Node::Anode(a, _) => Some(a.up.get()),
        }
    }

    fn internal_entries(&self) -> &[InternalEntry] {
        match self {
            Node::Fnode(f, _) => f.internal_entries(),
            Node::Anode(a, _) => a.internal_entries(),
        }
    }

    fn external_entries(&self) -> &[ExternalEntry] {
        match self {
            Node::Fnode(f, _) => f.external_entries(),
            Node::Anode(a, _) => a.external_entries(),
        }
    }
}

fn read_node<DS: DataStorage>(
    cache: &SectorCache<DS>,
    sec: u32,
    is_fnode: bool,
    config: &MountConfig,
) -> Result<Node> {
    if is_fnode {
        Ok(Node::Fnode(map_fnode(cache, sec, config)?, sec))
    } else {
        Ok(Node::Anode(map_anode(cache, sec, config)?, sec))
    }
}

fn write_node<DS: DataStorage>(cache: &SectorCache<DS>, node: &Node) -> Result<()> {
    let mut guard = cache.get_sector(node.sector())?;
    match node {
        Node::Fnode(f, _) => guard.bytes_mut().copy_from_slice(f.as_bytes()),
        Node::Anode(a, _) => guard.bytes_mut().copy_from_slice(a.as_bytes()),
    }
    guard.mark_dirty();
    guard.commit()
}

fn corrupt(what: &'static str) -> Error {
    log::error!("hpfs: {what}");
    Error::Fs(FsError::Inconsistent)
}

/// `lookup(tree_root, file_sec) -> disk_sec`, without an extent cache.
pub fn lookup<DS: DataStorage>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    tree_root: u32,
    is_fnode: bool,
    file_sec: u32,
) -> Result<u32> {
    let mut detector = CycleDetector::new(cache.fs_size_sectors());
    let mut sec = tree_root;
    let mut sec_is_fnode = is_fnode;
    loop {
        if detector.step(sec) {
            return Err(corrupt("cycle detected during lookup"));
        }
        let node = read_node(cache, sec, sec_is_fnode, config)?;
        if node.btree().is_internal() {
            let next = node
                .internal_entries()
                .iter()
                .find(|e| e.file_secno.get() > file_sec)
                .map(|e| e.down.get())
                .ok_or_else(|| corrupt("internal node has no matching entry"))?;
            sec = next;
            sec_is_fnode = false;
        } else {
            return node
                .external_entries()
                .iter()
                .find(|e| e.contains(file_sec))
                .map(|e| e.disk_secno.get() + (file_sec - e.file_secno.get()))
                .ok_or(Error::Fs(FsError::NotFound));
        }
    }
}

/// `lookup`, consulting and refreshing a caller-owned extent cache first.
pub fn lookup_with_cache<DS: DataStorage>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    tree_root: u32,
    is_fnode: bool,
    file_sec: u32,
    extent_cache: &mut ExtentCache,
) -> Result<u32> {
    if let Some(hit) = extent_cache.hit(file_sec) {
        return Ok(hit);
    }
    let mut detector = CycleDetector::new(cache.fs_size_sectors());
    let mut sec = tree_root;
    let mut sec_is_fnode = is_fnode;
    loop {
        if detector.step(sec) {
            return Err(corrupt("cycle detected during lookup"));
        }
        let node = read_node(cache, sec, sec_is_fnode, config)?;
        if node.btree().is_internal() {
            let next = node
                .internal_entries()
                .iter()
                .find(|e| e.file_secno.get() > file_sec)
                .map(|e| e.down.get())
                .ok_or_else(|| corrupt("internal node has no matching entry"))?;
            sec = next;
            sec_is_fnode = false;
        } else {
            let entry = node
                .external_entries()
                .iter()
                .find(|e| e.contains(file_sec))
                .copied()
                .ok_or(Error::Fs(FsError::NotFound))?;
            extent_cache.fill(&entry);
            return Ok(entry.disk_secno.get() + (file_sec - entry.file_secno.get()));
        }
    }
}

fn forward_hint(next_file_sec: u32) -> u32 {
    (next_file_sec.saturating_mul(ALLOC_M)).clamp(ALLOC_FWD_MIN, ALLOC_FWD_MAX)
}

/// Tracks sectors and anodes allocated so far in one `append_sector` call
/// so a failure midway can unwind them instead of leaking disk space.
#[derive(Default)]
struct Unwind {
    data_sectors: Vec<(u32, u32)>,
    anodes: Vec<u32>,
    committed: bool,
}

impl Unwind {
    fn rollback<DS: DataStorage, BA: BlockAllocator, NA: NodeAllocator>(
        &mut self,
        block_alloc: &BA,
        _node_alloc: &NA,
        _cache: &SectorCache<DS>,
    ) {
        if self.committed {
            return;
        }
        for (sec, len) in self.data_sectors.drain(..) {
            block_alloc.free_sectors(sec, len);
        }
        for anode in self.anodes.drain(..) {
            block_alloc.free_sectors(anode, 1);
        }
    }
}

/// Forces every internal node on the path to the rightmost leaf to end in
/// the `0xFFFFFFFF` sentinel (invariant 2), descending via the last entry
/// at each level, and returns the leaf's sector and whether it's the
/// embedded fnode root.
fn descend_rightmost<DS: DataStorage>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    root_sec: u32,
    is_fnode: bool,
) -> Result<(u32, bool)> {
    let mut detector = CycleDetector::new(cache.fs_size_sectors());
    let mut sec = root_sec;
    let mut sec_is_fnode = is_fnode;
    loop {
        if detector.step(sec) {
            return Err(corrupt("cycle detected descending to rightmost leaf"));
        }
        let node = read_node(cache, sec, sec_is_fnode, config)?;
        if !node.btree().is_internal() {
            return Ok((sec, sec_is_fnode));
        }
        let down = {
            let entries = node.internal_entries();
            let last = entries
                .last()
                .copied()
                .ok_or_else(|| corrupt("internal node has no entries"))?;
            last.down.get()
        };
        if node.btree().n_used_nodes > 0 {
            let last_file_secno = node.internal_entries().last().unwrap().file_secno.get();
            if last_file_secno != SENTINEL {
                let mut node = node;
                match &mut node {
                    Node::Fnode(f, _) => {
                        f.internal_entries_mut().last_mut().unwrap().file_secno =
                            SENTINEL.into();
                    }
                    Node::Anode(a, _) => {
                        a.internal_entries_mut().last_mut().unwrap().file_secno =
                            SENTINEL.into();
                    }
                }
                write_node(cache, &node)?;
            }
        }
        sec = down;
        sec_is_fnode = false;
    }
}

/// Inserts `{key, down}` as a new entry just before an internal node's
/// sentinel, per §4.E.3 step 6: rewrite the previous last entry's
/// `file_secno` to `key`, then append a fresh sentinel pointing at `down`.
/// Returns `false` if the node has no free slot.
fn insert_promoted(node: &mut Node, key: u32, down: u32) -> bool {
    let cap = match node {
        Node::Fnode(f, _) => f.capacity(),
        Node::Anode(a, _) => a.capacity(),
    };
    let used = node.btree().n_used_nodes;
    if used >= cap {
        return false;
    }
    match node {
        Node::Fnode(f, _) => {
            f.internal_entries_mut().last_mut().unwrap().file_secno = key.into();
            f.btree_mut().n_used_nodes += 1;
            f.btree_mut().n_free_nodes -= 1;
            let first_free = f.btree().expected_first_free();
            let idx = used as usize;
            let bytes = f.entries_bytes_mut();
            let entry = InternalEntry {
                file_secno: SENTINEL.into(),
                down: down.into(),
            };
            bytes[idx * 8..idx * 8 + 8].copy_from_slice(entry.as_bytes());
            f.btree_mut().first_free = first_free.into();
        }
        Node::Anode(a, _) => {
            a.internal_entries_mut().last_mut().unwrap().file_secno = key.into();
            a.btree_mut().n_used_nodes += 1;
            a.btree_mut().n_free_nodes -= 1;
            let first_free = a.btree().expected_first_free();
            let idx = used as usize;
            let bytes = a.entries_bytes_mut();
            let entry = InternalEntry {
                file_secno: SENTINEL.into(),
                down: down.into(),
            };
            bytes[idx * 8..idx * 8 + 8].copy_from_slice(entry.as_bytes());
            a.btree_mut().first_free = first_free.into();
        }
    }
    true
}

/// `append_sector(tree_root, is_fnode, next_file_sec) -> disk_sec`.
#[allow(clippy::too_many_arguments)]
pub fn append_sector<DS: DataStorage, BA: BlockAllocator, NA: NodeAllocator>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    block_alloc: &BA,
    node_alloc: &NA,
    tree_root: u32,
    is_fnode: bool,
    next_file_sec: u32,
) -> Result<u32> {
    if config.read_only {
        return Err(Error::Fs(FsError::ReadOnly));
    }
    let mut unwind = Unwind::default();
    let result = append_sector_inner(
        cache,
        config,
        block_alloc,
        node_alloc,
        tree_root,
        is_fnode,
        next_file_sec,
        &mut unwind,
    );
    if result.is_err() {
        unwind.rollback(block_alloc, node_alloc, cache);
    } else {
        unwind.committed = true;
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn append_sector_inner<DS: DataStorage, BA: BlockAllocator, NA: NodeAllocator>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    block_alloc: &BA,
    node_alloc: &NA,
    tree_root: u32,
    is_fnode: bool,
    next_file_sec: u32,
    unwind: &mut Unwind,
) -> Result<u32> {
    let (leaf_sec, leaf_is_fnode) = descend_rightmost(cache, config, tree_root, is_fnode)?;
    let mut leaf = read_node(cache, leaf_sec, leaf_is_fnode, config)?;

    // Step 2: try to extend the last extent in place.
    if let Some(last) = leaf.external_entries().last().copied() {
        let extend_to = last.disk_secno.get() + last.length.get();
        if block_alloc.alloc_if_possible(extend_to) {
            match &mut leaf {
                Node::Fnode(f, _) => {
                    f.external_entries_mut().last_mut().unwrap().length += 1;
                }
                Node::Anode(a, _) => {
                    a.external_entries_mut().last_mut().unwrap().length += 1;
                }
            }
            write_node(cache, &leaf)?;
            return Ok(extend_to);
        }
    }

    // Step 3: allocate a fresh data sector.
    let hint = forward_hint(next_file_sec);
    let data_sec = block_alloc
        .alloc_sector(leaf_sec, 1, hint)
        .ok_or(Error::Fs(FsError::OutOfSpace))?;
    unwind.data_sectors.push((data_sec, 1));

    let used = leaf.btree().n_used_nodes;
    let cap = match &leaf {
        Node::Fnode(f, _) => f.capacity(),
        Node::Anode(a, _) => a.capacity(),
    };

    if used < cap {
        // Step 4: room in the leaf.
        let entry = ExternalEntry {
            file_secno: next_file_sec.into(),
            length: 1.into(),
            disk_secno: data_sec.into(),
        };
        match &mut leaf {
            Node::Fnode(f, _) => {
                f.btree_mut().n_used_nodes += 1;
                f.btree_mut().n_free_nodes -= 1;
                let idx = used as usize;
                let first_free = f.btree().expected_first_free();
                f.entries_bytes_mut()[idx * 12..idx * 12 + 12].copy_from_slice(entry.as_bytes());
                f.btree_mut().first_free = first_free.into();
            }
            Node::Anode(a, _) => {
                a.btree_mut().n_used_nodes += 1;
                a.btree_mut().n_free_nodes -= 1;
                let idx = used as usize;
                let first_free = a.btree().expected_first_free();
                a.entries_bytes_mut()[idx * 12..idx * 12 + 12].copy_from_slice(entry.as_bytes());
                a.btree_mut().first_free = first_free.into();
            }
        }
        write_node(cache, &leaf)?;
        return Ok(data_sec);
    }

    // Step 5: leaf is full — split.
    if leaf.is_fnode() {
        // The embedded fnode btree was itself a full external leaf: move
        // its entries wholesale into a fresh anode and convert the fnode
        // into a one-entry internal root.
        let new_sec = node_alloc
            .alloc_anode(leaf_sec)
            .ok_or(Error::Fs(FsError::OutOfSpace))?;
        unwind.anodes.push(new_sec);
        let mut new_anode = map_anode(cache, new_sec, config)?;

        let Node::Fnode(fnode, _) = &leaf else {
            unreachable!()
        };
        let old_entries = fnode.external_entries().to_vec();
        new_anode.btree.n_used_nodes = old_entries.len() as u8;
        new_anode.btree.n_free_nodes -= old_entries.len() as u8;
        for (i, e) in old_entries.iter().enumerate() {
            new_anode.entries_bytes_mut()[i * 12..i * 12 + 12].copy_from_slice(e.as_bytes());
        }
        let entry = ExternalEntry {
            file_secno: next_file_sec.into(),
            length: 1.into(),
            disk_secno: data_sec.into(),
        };
        let idx = old_entries.len();
        new_anode.entries_bytes_mut()[idx * 12..idx * 12 + 12].copy_from_slice(entry.as_bytes());
        new_anode.btree.n_used_nodes += 1;
        new_anode.btree.n_free_nodes -= 1;
        new_anode.btree.first_free = new_anode.btree.expected_first_free().into();
        new_anode.up = leaf_sec.into();
        new_anode.btree.set_fnode_parent(true);
        write_node(cache, &Node::Anode(new_anode, new_sec))?;

        let mut fnode = *fnode;
        fnode.btree = BplusHeader::empty_external(0);
        fnode.btree.set_internal(true);
        fnode.btree.n_free_nodes = Fnode::INTERNAL_CAPACITY - 1;
        fnode.btree.n_used_nodes = 1;
        let root_entry = InternalEntry {
            file_secno: SENTINEL.into(),
            down: new_sec.into(),
        };
        fnode.entries_bytes_mut()[0..8].copy_from_slice(root_entry.as_bytes());
        fnode.btree.first_free = fnode.btree.expected_first_free().into();
        write_node(cache, &Node::Fnode(fnode, leaf_sec))?;
        return Ok(data_sec);
    }

    // Leaf is a plain, non-root anode: its subtree is sealed at
    // `next_file_sec`; a fresh one-entry anode becomes the new rightmost
    // leaf, and the promotion `{next_file_sec, new_leaf}` is inserted into
    // the ancestor chain (climbing via `up`, splitting further anodes as
    // needed) until a parent has room or the fnode root itself must split.
    let new_leaf_sec = node_alloc
        .alloc_anode(leaf_sec)
        .ok_or(Error::Fs(FsError::OutOfSpace))?;
    unwind.anodes.push(new_leaf_sec);
    let mut new_leaf = map_anode(cache, new_leaf_sec, config)?;
    let entry = ExternalEntry {
        file_secno: next_file_sec.into(),
        length: 1.into(),
        disk_secno: data_sec.into(),
    };
    new_leaf.entries_bytes_mut()[0..12].copy_from_slice(entry.as_bytes());
    new_leaf.btree.n_used_nodes = 1;
    new_leaf.btree.n_free_nodes -= 1;
    new_leaf.btree.first_free = new_leaf.btree.expected_first_free().into();

    let Node::Anode(old_leaf_anode, _) = &leaf else {
        unreachable!("fnode-rooted leaves are handled above")
    };
    let parent_sec = old_leaf_anode.up.get();
    let parent_is_fnode = old_leaf_anode.btree.is_fnode_parent();
    new_leaf.up = parent_sec.into();
    new_leaf.btree.set_fnode_parent(false);

    climb_and_promote(
        cache,
        config,
        node_alloc,
        unwind,
        parent_sec,
        parent_is_fnode,
        next_file_sec,
        new_leaf_sec,
        &mut new_leaf,
    )?;
    write_node(cache, &Node::Anode(new_leaf, new_leaf_sec))?;
    Ok(data_sec)
}

/// Steps 6-7: walk up from `parent_sec`, inserting the promoted
/// `{key, down}` entry at the first ancestor with a free slot, splitting
/// every full ancestor along the way (and, if the fnode root itself is
/// full, performing one final root split with an `up`-pointer fixup for
/// every re-parented grandchild).
#[allow(clippy::too_many_arguments)]
fn climb_and_promote<DS: DataStorage, NA: NodeAllocator>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    node_alloc: &NA,
    unwind: &mut Unwind,
    mut parent_sec: u32,
    mut parent_is_fnode: bool,
    key: u32,
    mut down: u32,
    down_node: &mut Anode,
) -> Result<()> {
    let mut detector = CycleDetector::new(cache.fs_size_sectors());
    // The entity currently named by `down` is `down_node` only up to the
    // first split; once an interior split fabricates a new anode to carry
    // it, that anode's `up` is what still needs to be corrected once its
    // real parent is known, not `down_node`'s (whose parent was fixed for
    // good the moment that first split happened).
    let mut pending: Option<(u32, Anode)> = None;
    loop {
        if detector.step(parent_sec) {
            return Err(corrupt("cycle detected ascending during append"));
        }
        let mut parent = read_node(cache, parent_sec, parent_is_fnode, config)?;
        if insert_promoted(&mut parent, key, down) {
            match pending {
                Some((sec, mut node)) => {
                    node.up = parent_sec.into();
                    write_node(cache, &Node::Anode(node, sec))?;
                }
                None => down_node.up = parent_sec.into(),
            }
            write_node(cache, &parent)?;
            return Ok(());
        }

        if parent_is_fnode {
            // The fnode's internal btree is full: final root split.
            let a1_sec = node_alloc
                .alloc_anode(parent_sec)
                .ok_or(Error::Fs(FsError::OutOfSpace))?;
            unwind.anodes.push(a1_sec);
            let a2_sec = node_alloc
                .alloc_anode(parent_sec)
                .ok_or(Error::Fs(FsError::OutOfSpace))?;
            unwind.anodes.push(a2_sec);

            let Node::Fnode(fnode, fnode_sec) = &parent else {
                unreachable!()
            };
            let old_entries = fnode.internal_entries().to_vec();

            let mut a1 = map_anode(cache, a1_sec, config)?;
            a1.btree.set_internal(true);
            a1.btree.n_used_nodes = old_entries.len() as u8;
            a1.btree.n_free_nodes = Anode::INTERNAL_CAPACITY - old_entries.len() as u8;
            for (i, e) in old_entries.iter().enumerate() {
                a1.entries_bytes_mut()[i * 8..i * 8 + 8].copy_from_slice(e.as_bytes());
            }
            a1.btree.first_free = a1.btree.expected_first_free().into();
            a1.up = (*fnode_sec).into();
            a1.btree.set_fnode_parent(true);
            write_node(cache, &Node::Anode(a1, a1_sec))?;
            for e in &old_entries {
                let child_sec = e.down.get();
                let mut child = map_anode(cache, child_sec, config)?;
                child.up = a1_sec.into();
                child.btree.set_fnode_parent(false);
                write_node(cache, &Node::Anode(child, child_sec))?;
            }

            let mut a2 = map_anode(cache, a2_sec, config)?;
            a2.btree.set_internal(true);
            a2.btree.n_used_nodes = 1;
            a2.btree.n_free_nodes = Anode::INTERNAL_CAPACITY - 1;
            let a2_entry = InternalEntry {
                file_secno: SENTINEL.into(),
                down: down.into(),
            };
            a2.entries_bytes_mut()[0..8].copy_from_slice(a2_entry.as_bytes());
            a2.btree.first_free = a2.btree.expected_first_free().into();
            a2.up = (*fnode_sec).into();
            a2.btree.set_fnode_parent(true);
            write_node(cache, &Node::Anode(a2, a2_sec))?;
            match pending {
                Some((sec, mut node)) => {
                    node.up = a2_sec.into();
                    write_node(cache, &Node::Anode(node, sec))?;
                }
                None => down_node.up = a2_sec.into(),
            }

            let mut fnode = *fnode;
            let fs = *fnode_sec;
            fnode.btree = BplusHeader::empty_external(0);
            fnode.btree.set_internal(true);
            fnode.btree.n_used_nodes = 2;
            fnode.btree.n_free_nodes = Fnode::INTERNAL_CAPACITY - 2;
            let e1 = InternalEntry {
                file_secno: key.into(),
                down: a1_sec.into(),
            };
            let e2 = InternalEntry {
                file_secno: SENTINEL.into(),
                down: a2_sec.into(),
            };
            fnode.entries_bytes_mut()[0..8].copy_from_slice(e1.as_bytes());
            fnode.entries_bytes_mut()[8..16].copy_from_slice(e2.as_bytes());
            fnode.btree.first_free = fnode.btree.expected_first_free().into();
            write_node(cache, &Node::Fnode(fnode, fs))?;
            return Ok(());
        }

        // An interior anode is full: split it the same way a full leaf is
        // split — a fresh anode takes just the one promoted entry and
        // becomes the new rightmost node at this level, while the old,
        // now-sealed anode keeps its existing entries unchanged.
        let Node::Anode(old, old_sec) = &parent else {
            unreachable!()
        };
        let grandparent_sec = old.up.get();
        let grandparent_is_fnode = old.btree.is_fnode_parent();

        let new_sec = node_alloc
            .alloc_anode(*old_sec)
            .ok_or(Error::Fs(FsError::OutOfSpace))?;
        unwind.anodes.push(new_sec);
        let mut new_node = map_anode(cache, new_sec, config)?;
        new_node.btree.set_internal(true);
        new_node.btree.n_used_nodes = 1;
        new_node.btree.n_free_nodes = Anode::INTERNAL_CAPACITY - 1;
        let e = InternalEntry {
            file_secno: SENTINEL.into(),
            down: down.into(),
        };
        new_node.entries_bytes_mut()[0..8].copy_from_slice(e.as_bytes());
        new_node.btree.first_free = new_node.btree.expected_first_free().into();
        new_node.up = grandparent_sec.into();
        new_node.btree.set_fnode_parent(grandparent_is_fnode);
        write_node(cache, &Node::Anode(new_node, new_sec))?;

        match pending {
            Some((sec, mut node)) => {
                node.up = new_sec.into();
                write_node(cache, &Node::Anode(node, sec))?;
            }
            None => down_node.up = new_sec.into(),
        }
        pending = Some((new_sec, new_node));
        // `key` (the promotion boundary) is unchanged as we keep climbing.
        down = new_sec;
        parent_sec = grandparent_sec;
        parent_is_fnode = grandparent_is_fnode;
    }
}

/// `truncate(tree_root, is_fnode, new_sec_count)`.
pub fn truncate<DS: DataStorage, BA: BlockAllocator>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    block_alloc: &BA,
    tree_root: u32,
    is_fnode: bool,
    new_sec_count: u32,
) -> Result<()> {
    if config.read_only {
        return Err(Error::Fs(FsError::ReadOnly));
    }
    if new_sec_count == 0 {
        remove(cache, config, block_alloc, tree_root, is_fnode)?;
        if is_fnode {
            let mut fnode = map_fnode(cache, tree_root, config)?;
            fnode.btree = BplusHeader::empty_external(Fnode::EXTERNAL_CAPACITY);
            write_node(cache, &Node::Fnode(fnode, tree_root))?;
        } else {
            block_alloc.free_sectors(tree_root, 1);
        }
        return Ok(());
    }

    let mut sec = tree_root;
    let mut sec_is_fnode = is_fnode;
    let mut detector = CycleDetector::new(cache.fs_size_sectors());
    loop {
        if detector.step(sec) {
            return Err(corrupt("cycle detected during truncate"));
        }
        let mut node = read_node(cache, sec, sec_is_fnode, config)?;
        if node.btree().is_internal() {
            let entries = node.internal_entries().to_vec();
            let idx = entries
                .iter()
                .position(|e| e.file_secno.get() >= new_sec_count)
                .ok_or_else(|| corrupt("truncate point past end of tree"))?;
            for e in &entries[idx + 1..] {
                remove(cache, config, block_alloc, e.down.get(), false)?;
                block_alloc.free_sectors(e.down.get(), 1);
            }
            let down = entries[idx].down.get();
            match &mut node {
                Node::Fnode(f, _) => {
                    f.internal_entries_mut()[idx].file_secno = SENTINEL.into();
                    f.btree_mut().n_used_nodes = (idx + 1) as u8;
                    f.btree_mut().n_free_nodes = Fnode::INTERNAL_CAPACITY - (idx as u8 + 1);
                    let ff = f.btree().expected_first_free();
                    f.btree_mut().first_free = ff.into();
                }
                Node::Anode(a, _) => {
                    a.internal_entries_mut()[idx].file_secno = SENTINEL.into();
                    a.btree_mut().n_used_nodes = (idx + 1) as u8;
                    a.btree_mut().n_free_nodes = Anode::INTERNAL_CAPACITY - (idx as u8 + 1);
                    let ff = a.btree().expected_first_free();
                    a.btree_mut().first_free = ff.into();
                }
            }
            write_node(cache, &node)?;
            sec = down;
            sec_is_fnode = false;
            continue;
        }

        let entries = node.external_entries().to_vec();
        let idx = entries
            .iter()
            .position(|e| e.contains(new_sec_count - 1))
            .or_else(|| entries.iter().position(|e| e.file_secno.get() >= new_sec_count));
        let Some(idx) = idx else {
            return Ok(());
        };
        for e in &entries[idx + 1..] {
            block_alloc.free_sectors(e.disk_secno.get(), e.length.get());
        }
        let mut kept = entries[idx];
        if kept.contains(new_sec_count - 1) {
            let keep_len = new_sec_count - kept.file_secno.get();
            if keep_len < kept.length.get() {
                block_alloc.free_sectors(
                    kept.disk_secno.get() + keep_len,
                    kept.length.get() - keep_len,
                );
                kept.length = keep_len.into();
            }
        }
        match &mut node {
            Node::Fnode(f, _) => {
                f.entries_bytes_mut()[idx * 12..idx * 12 + 12].copy_from_slice(kept.as_bytes());
                f.btree_mut().n_used_nodes = (idx + 1) as u8;
                f.btree_mut().n_free_nodes = Fnode::EXTERNAL_CAPACITY - (idx as u8 + 1);
                let ff = f.btree().expected_first_free();
                f.btree_mut().first_free = ff.into();
            }
            Node::Anode(a, _) => {
                a.entries_bytes_mut()[idx * 12..idx * 12 + 12].copy_from_slice(kept.as_bytes());
                a.btree_mut().n_used_nodes = (idx + 1) as u8;
                a.btree_mut().n_free_nodes = Anode::EXTERNAL_CAPACITY - (idx as u8 + 1);
                let ff = a.btree().expected_first_free();
                a.btree_mut().first_free = ff.into();
            }
        }
        write_node(cache, &node)?;
        return Ok(());
    }
}

/// Sums the length of every external entry reachable from `tree_root`,
/// i.e. the file's total allocated sector count. Read-only counterpart to
/// `remove`'s traversal.
pub fn count_sectors<DS: DataStorage>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    tree_root: u32,
    is_fnode: bool,
) -> Result<u32> {
    let mut detector = CycleDetector::new(cache.fs_size_sectors());
    let mut stack = vec![(tree_root, is_fnode)];
    let mut total = 0u32;
    while let Some((sec, sec_is_fnode)) = stack.pop() {
        if detector.step(sec) {
            return Err(corrupt("cycle detected during count"));
        }
        let node = read_node(cache, sec, sec_is_fnode, config)?;
        if node.btree().is_internal() {
            for e in node.internal_entries() {
                stack.push((e.down.get(), false));
            }
        } else {
            for e in node.external_entries() {
                total += e.length.get();
            }
        }
    }
    Ok(total)
}

/// `remove(tree_root)` — frees every disk extent and every *descendant*
/// anode reachable from `tree_root`. It does not free `tree_root` itself
/// (when the root is an anode, e.g. an EA tree, the caller frees it after
/// `remove` returns — see `ea::ea_remove`).
///
/// Implemented as an explicit work-stack rather than the original's
/// up-pointer walk: Rust's ownership model makes a `Vec`-backed stack the
/// natural way to bound traversal depth without native recursion, and it
/// still runs the cycle detector over every sector popped.
pub fn remove<DS: DataStorage, BA: BlockAllocator>(
    cache: &SectorCache<DS>,
    config: &MountConfig,
    block_alloc: &BA,
    tree_root: u32,
    is_fnode: bool,
) -> Result<()> {
    let mut detector = CycleDetector::new(cache.fs_size_sectors());
    let mut stack = vec![(tree_root, is_fnode, true)];
    while let Some((sec, sec_is_fnode, is_root)) = stack.pop() {
        if detector.step(sec) {
            return Err(corrupt("cycle detected during remove"));
        }
        let node = read_node(cache, sec, sec_is_fnode, config)?;
        if node.btree().is_internal() {
            for e in node.internal_entries() {
                stack.push((e.down.get(), false, false));
            }
        } else {
            for e in node.external_entries() {
                block_alloc.free_sectors(e.disk_secno.get(), e.length.get());
            }
        }
        if !is_root && !sec_is_fnode {
            block_alloc.free_sectors(sec, 1);
        }
    }
    Ok(())
}
