//! Mini-transaction: page latch and buffer-fix bookkeeping
//!
//! A mini-transaction owns the page latches a traversal acquires and
//! releases them (with their buffer fixes) in reverse order at commit.
//! The lookup path also needs to drop just its most recent page after a
//! failed revalidation, which is why blocks expose raw latches instead of
//! guard objects.

use std::ptr::NonNull;

use crate::pool::Block;
use crate::status::LatchMode;

/// Scope object tracking acquired page latches
pub struct MiniTransaction {
    memo: Vec<(NonNull<Block>, LatchMode)>,
    active: bool,
}

impl Default for MiniTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl MiniTransaction {
    /// Start a mini-transaction
    pub fn new() -> Self {
        Self {
            memo: Vec::new(),
            active: true,
        }
    }

    /// Whether the mini-transaction has not yet committed
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Number of page latches currently held
    #[inline]
    pub fn n_latched(&self) -> usize {
        self.memo.len()
    }

    /// Record a page latch (and its buffer fix) for release at commit.
    ///
    /// The caller must have latched `block` in `mode` and buffer-fixed it.
    pub fn memo_push(&mut self, block: &Block, mode: LatchMode) {
        debug_assert!(self.active);
        self.memo.push((NonNull::from(block), mode));
    }

    /// Release the most recently pushed page latch and its fix
    pub fn release_last_page(&mut self) {
        if let Some((block, mode)) = self.memo.pop() {
            Self::release(block, mode);
        }
    }

    /// Release all held latches in reverse order and deactivate
    pub fn commit(&mut self) {
        while let Some((block, mode)) = self.memo.pop() {
            Self::release(block, mode);
        }
        self.active = false;
    }

    fn release(block: NonNull<Block>, mode: LatchMode) {
        // Safety: memo_push recorded a latch this mini-transaction owns;
        // blocks live for the pool's lifetime.
        let block = unsafe { block.as_ref() };
        match mode {
            LatchMode::SearchLeaf => unsafe { block.unlock_s() },
            LatchMode::ModifyLeaf | LatchMode::ModifyTree => unsafe { block.unlock_x() },
        }
        block.unfix();
    }
}

impl Drop for MiniTransaction {
    fn drop(&mut self) {
        if self.active {
            self.commit();
        }
    }
}
