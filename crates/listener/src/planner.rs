//! Scan windows and chunk planning.

/// Inclusive block range `from_block..=to_block`. Empty when `from_block == to_block + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    pub from_block: u64,
    pub to_block: u64,
}

/// A [ScanWindow] no wider than the configured max span.
pub type Chunk = ScanWindow;

impl ScanWindow {
    pub fn new(from_block: u64, to_block: u64) -> Self {
        Self {
            from_block,
            to_block,
        }
    }

    /// Everything after `checkpoint` up to and including `ceiling`.
    pub fn after(checkpoint: u64, ceiling: u64) -> Self {
        Self::new(checkpoint.saturating_add(1), ceiling)
    }

    pub fn is_empty(&self) -> bool {
        self.from_block > self.to_block
    }

    /// Number of blocks in the window.
    pub fn span(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            (self.to_block - self.from_block).saturating_add(1)
        }
    }
}

/// Split `window` into ascending, contiguous chunks of at most `max_span` blocks.
///
/// The first chunk starts at `window.from_block` and the last ends at `window.to_block`.
/// An empty window yields no chunks. A `max_span` of 0 is treated as 1.
pub fn split(window: ScanWindow, max_span: u64) -> Vec<Chunk> {
    let max_span = max_span.max(1);
    let mut chunks = Vec::new();
    if window.is_empty() {
        return chunks;
    }
    let mut from = window.from_block;
    loop {
        let to = from.saturating_add(max_span - 1).min(window.to_block);
        chunks.push(Chunk::new(from, to));
        if to >= window.to_block {
            break;
        }
        from = to + 1;
    }
    chunks
}
