#![forbid(unsafe_code)]
//! Cache-block allocation.
//!
//! One bit per cache block, `1` = allocated. [`BlockAllocator::find_free`]
//! is next-fit: it resumes scanning at the word where the previous search
//! succeeded and wraps around once, so steady-state churn does not rescan
//! regions that are already full.
//!
//! Allocating a set bit or freeing a clear one means the caller's mapping
//! table disagrees with the bitset. Both panic.

use dmc_types::CacheBlock;
use tracing::trace;

const WORD_BITS: usize = u64::BITS as usize;

// ── Word helpers ────────────────────────────────────────────────────────────

#[inline]
fn word_index(bit: usize) -> (usize, u64) {
    (bit / WORD_BITS, 1_u64 << (bit % WORD_BITS))
}

/// Mask of bits in the last word that lie past `nr_bits`.
#[must_use]
fn tail_padding_mask(nr_bits: usize) -> u64 {
    match nr_bits % WORD_BITS {
        0 => 0,
        used => !0_u64 << used,
    }
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Fixed-size allocation bitset over `[0, nr_blocks)`.
#[derive(Debug, Clone)]
pub struct BlockAllocator {
    words: Vec<u64>,
    nr_blocks: u32,
    allocated: u32,
    /// Word offset where the last successful search ended.
    cursor: usize,
}

impl BlockAllocator {
    /// Create an allocator with every block free.
    ///
    /// # Panics
    /// Panics if `nr_blocks` is 0.
    #[must_use]
    pub fn new(nr_blocks: u32) -> Self {
        assert!(nr_blocks > 0, "BlockAllocator needs at least one block");
        let bits = nr_blocks as usize;
        let mut words = vec![0_u64; bits.div_ceil(WORD_BITS)];
        // Padding bits past the end read as allocated so searches skip them.
        if let Some(last) = words.last_mut() {
            *last = tail_padding_mask(bits);
        }
        Self {
            words,
            nr_blocks,
            allocated: 0,
            cursor: 0,
        }
    }

    #[must_use]
    pub fn nr_blocks(&self) -> u32 {
        self.nr_blocks
    }

    #[must_use]
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    #[must_use]
    pub fn free_count(&self) -> u32 {
        self.nr_blocks - self.allocated
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.allocated == self.nr_blocks
    }

    /// Word offset the next search starts from.
    #[cfg(test)]
    fn cursor(&self) -> usize {
        self.cursor
    }

    fn check_range(&self, block: CacheBlock) {
        assert!(
            block.0 < self.nr_blocks,
            "{block} out of range (nr_blocks={})",
            self.nr_blocks
        );
    }

    #[must_use]
    pub fn is_allocated(&self, block: CacheBlock) -> bool {
        self.check_range(block);
        let (word, mask) = word_index(block.index());
        self.words[word] & mask != 0
    }

    /// Mark `block` allocated.
    ///
    /// # Panics
    /// Panics if `block` is out of range or already allocated.
    pub fn allocate(&mut self, block: CacheBlock) {
        self.check_range(block);
        let (word, mask) = word_index(block.index());
        assert!(
            self.words[word] & mask == 0,
            "{block} allocated twice"
        );
        self.words[word] |= mask;
        self.allocated += 1;
        trace!(
            target: "dmc::alloc",
            event = "allocate",
            cblock = block.0,
            allocated = self.allocated
        );
    }

    /// Mark `block` free.
    ///
    /// # Panics
    /// Panics if `block` is out of range or not allocated.
    pub fn free(&mut self, block: CacheBlock) {
        self.check_range(block);
        let (word, mask) = word_index(block.index());
        assert!(self.words[word] & mask != 0, "{block} freed while free");
        self.words[word] &= !mask;
        self.allocated -= 1;
        trace!(
            target: "dmc::alloc",
            event = "free",
            cblock = block.0,
            allocated = self.allocated
        );
    }

    /// Find a free block without allocating it.
    ///
    /// Scans from the cursor to the end, then from the start back up to the
    /// cursor. Returns `None` only when every block is allocated.
    pub fn find_free(&mut self) -> Option<CacheBlock> {
        if self.is_full() {
            return None;
        }
        let nr_words = self.words.len();
        for step in 0..nr_words {
            let word_idx = (self.cursor + step) % nr_words;
            let word = self.words[word_idx];
            if word != u64::MAX {
                self.cursor = word_idx;
                let bit = word_idx * WORD_BITS + word.trailing_ones() as usize;
                // Bits past nr_blocks are pre-set, so `bit` is in range.
                let block = u32::try_from(bit).ok()?;
                return Some(CacheBlock(block));
            }
        }
        None
    }

    /// Allocated blocks in ascending order.
    pub fn iter_allocated(&self) -> impl Iterator<Item = CacheBlock> + '_ {
        (0..self.nr_blocks)
            .map(CacheBlock)
            .filter(|block| self.is_allocated(*block))
    }
}
