//! ReorgGuard: how close to the chain tip the scanner may read.
//!
//! Blocks within `margin` of the tip may still be reorganized out, so events from them are
//! never relayed as final.

/// Default confirmation margin in blocks.
pub const DEFAULT_REORG_MARGIN: u64 = 10;

/// `tip - margin`, saturating at 0.
pub fn safe_ceiling(tip: u64, margin: u64) -> u64 {
    tip.saturating_sub(margin)
}

/// Confirmation-margin guard: the highest block safe to scan is `tip - margin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorgGuard {
    margin: u64,
}

impl ReorgGuard {
    pub fn new(margin: u64) -> Self {
        Self { margin }
    }

    pub fn margin(&self) -> u64 {
        self.margin
    }

    pub fn safe_ceiling(&self, tip: u64) -> u64 {
        safe_ceiling(tip, self.margin)
    }
}

impl Default for ReorgGuard {
    fn default() -> Self {
        Self::new(DEFAULT_REORG_MARGIN)
    }
}
