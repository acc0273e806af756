//! Cycle detection for `up`/`down` pointer walks.
//!
//! Modeled on the original's `hpfs_stop_cycles`: a hop counter and a
//! "checkpoint" sector number that's refreshed every time the hop count
//! passes a power of two. If a later hop lands back on the checkpoint, the
//! walk is looping. As a backstop independent of that coincidence, any walk
//! that takes more hops than the filesystem has sectors is also reported as
//! a cycle — a well-formed tree can never be that tall.

/// One instance guards one traversal (a single `lookup`, a single
/// `append_sector` descent, one post-order `remove` walk). Construct fresh
/// per traversal; do not reuse across operations.
pub struct CycleDetector {
    checkpoint: Option<u32>,
    hops: u32,
    limit: u32,
}

impl CycleDetector {
    pub fn new(fs_size_sectors: u32) -> Self {
        Self {
            checkpoint: None,
            hops: 0,
            limit: fs_size_sectors,
        }
    }

    /// Record a hop onto `sector`. Returns `true` if this hop closes a
    /// cycle and the caller must abort the traversal as corrupt.
    #[must_use]
    pub fn step(&mut self, sector: u32) -> bool {
        if self.hops > 0 && self.checkpoint == Some(sector) {
            return true;
        }
        self.hops += 1;
        if self.hops & (self.hops - 1) == 0 {
            self.checkpoint = Some(sector);
        }
        self.hops > self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straight_walk_never_trips() {
        let mut d = CycleDetector::new(1000);
        for s in 0..500u32 {
            assert!(!d.step(s));
        }
    }

    #[test]
    fn tight_loop_is_caught() {
        let mut d = CycleDetector::new(1000);
        let mut cycled = false;
        for _ in 0..2000 {
            // bounce between two sectors forever
            if d.step(7) || d.step(9) {
                cycled = true;
                break;
            }
        }
        assert!(cycled);
    }
}
