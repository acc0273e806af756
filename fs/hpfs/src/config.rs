//! Tuning constants and mount-time configuration.
//!
//! The constants here are literal-equivalent to `fs/hpfs/super.h` in the
//! original driver (filed under the historical name `fs/ntfs`). Several are
//! not consumed by this crate at all — `FREE_DNODES_ADD`/`FREE_DNODES_DEL`
//! belong to the directory subsystem — but are kept public so a directory
//! implementation built on top of this crate doesn't need a second source
//! of truth for tuning numbers.

/// Lower bound on the forward-allocation hint passed to `alloc_sector`.
pub const ALLOC_FWD_MIN: u32 = 16;
/// Upper bound on the forward-allocation hint.
pub const ALLOC_FWD_MAX: u32 = 128;
/// Multiplier applied to the file-sector index when deriving the hint.
pub const ALLOC_M: u32 = 1;

pub const FNODE_RD_AHEAD: u32 = 16;
pub const ANODE_RD_AHEAD: u32 = 0;
pub const DNODE_RD_AHEAD: u32 = 72;
pub const COUNT_RD_AHEAD: u32 = 62;

pub const FREE_DNODES_ADD: u32 = 58;
pub const FREE_DNODES_DEL: u32 = 29;

/// Hard cap on the total size of an external EA region, in bytes. The
/// original cannot promote an overflowing sector-run EA into a fresh
/// anode-backed tree, so exceeding this is always an error rather than a
/// migration.
pub const EA_EXT_CAP: u32 = 30_000;

/// How aggressively `map_fnode`/`map_anode`/`map_dnode` validate what they
/// load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckLevel {
    /// Trust the on-disk structures; only check what's needed to avoid
    /// reading out of bounds.
    None,
    /// Validate magics, capacity invariants, and EA bounds (the default).
    Normal,
    /// Additionally walk dnode dirents and verify the full invariant set.
    Strict,
}

/// How `set_ea` behaves when an existing attribute can't be resized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EaMode {
    /// Silently drop the write, matching the original's behavior.
    SilentDrop,
}

/// Mount flags, captured once at mount and read-only afterward.
#[derive(Debug, Clone, Copy)]
pub struct MountConfig {
    pub check_level: CheckLevel,
    pub ea_mode: EaMode,
    pub read_only: bool,
    /// Seconds added to on-disk timestamps when presenting them to the VFS.
    /// Unused by the allocation core itself; carried for parity with the
    /// original mount option of the same name.
    pub timeshift: i32,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            check_level: CheckLevel::Normal,
            ea_mode: EaMode::SilentDrop,
            read_only: false,
            timeshift: 0,
        }
    }
}
