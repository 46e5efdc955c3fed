//! Tree cursor and leaf-page positioning
//!
//! A cursor remembers where a search landed and the two match pairs the
//! descent produced: how well the tuple matched the greatest record not
//! above it (`low_match`, `low_bytes`) and the least record above it
//! (`up_match`, `up_bytes`). Those pairs are the raw signal the adaptive
//! search heuristic consumes. A cursor positioned by the hash path also
//! carries the fold and the prefix signature it was computed with.

use std::cmp::Ordering;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::dict::IndexMeta;
use crate::page::{self, RecStatus};
use crate::pool::Block;
use crate::record::{cmp_with_match, PartialMatch, Tuple};
use crate::status::{CursorFlag, SearchMode};

/// A positioned tree cursor
pub struct Cursor {
    /// Index the cursor searches
    pub index: Arc<IndexMeta>,
    block: Option<NonNull<Block>>,
    /// Record the cursor is positioned on (possibly a pseudo-record)
    pub rec: *const u8,
    /// How the position was reached
    pub flag: CursorFlag,
    /// Fields matched against the low-side bracketing record
    pub low_match: u16,
    /// Bytes matched in the first differing low-side field
    pub low_bytes: u16,
    /// Fields matched against the up-side bracketing record
    pub up_match: u16,
    /// Bytes matched in the first differing up-side field
    pub up_bytes: u16,
    /// Prefix length used for the hash probe
    pub n_fields: u16,
    /// Byte count used for the hash probe
    pub n_bytes: u16,
    /// Fold computed for the hash probe
    pub fold: u32,
}

impl Cursor {
    /// Create an unpositioned cursor on `index`
    pub fn new(index: Arc<IndexMeta>) -> Self {
        Self {
            index,
            block: None,
            rec: std::ptr::null(),
            flag: CursorFlag::Binary,
            low_match: 0,
            low_bytes: 0,
            up_match: 0,
            up_bytes: 0,
            n_fields: 0,
            n_bytes: 0,
            fold: 0,
        }
    }

    /// Position the cursor on `rec` within `block`
    pub fn position(&mut self, block: &Block, rec: *const u8) {
        debug_assert_eq!(page::page_align(rec), block.frame() as *const u8);
        self.block = Some(NonNull::from(block));
        self.rec = rec;
    }

    /// Block the cursor is positioned in.
    ///
    /// # Panics
    /// Panics if the cursor is unpositioned.
    pub fn block(&self) -> &Block {
        // Safety: blocks live for the pool's lifetime; position() stored a
        // valid reference.
        unsafe { self.block.expect("cursor not positioned").as_ref() }
    }

    /// Whether the cursor has been positioned
    pub fn is_positioned(&self) -> bool {
        self.block.is_some()
    }

    /// Offset of the cursor record within its page
    pub fn rec_offset(&self) -> u16 {
        page::offset_of(self.block().frame(), self.rec)
    }

    /// Number of complete-or-partial fields the probe signature covers
    #[inline]
    pub fn probe_n_fields(&self) -> u16 {
        self.n_fields + u16::from(self.n_bytes > 0)
    }
}

/// Result of positioning within one leaf page
pub(crate) struct LeafPos {
    /// Offset of the record the cursor lands on (mode dependent)
    pub rec_off: u16,
    /// Match against the greatest record not above the tuple
    pub low: PartialMatch,
    /// Match against the least record above the tuple
    pub up: PartialMatch,
}

/// Search a leaf page for `tuple` under `mode`.
///
/// Walks the record chain comparing at most `index.n_uniq` fields,
/// producing the bracketing match pairs and the landing record. A
/// metadata record is invisible to positioning.
///
/// # Safety
/// `page` must designate a live, latched leaf frame.
pub(crate) unsafe fn search_leaf_page(
    page: *const u8,
    index: &IndexMeta,
    tuple: &Tuple,
    mode: SearchMode,
) -> LeafPos {
    let n_cmp = index.n_uniq as usize;
    let mut prev = page::INFIMUM;
    let mut prev2 = page::INFIMUM;
    let mut prev_match = PartialMatch::default();
    let mut prev_equal = false;
    let mut up_off = page::SUPREMUM;
    let mut up = PartialMatch::default();

    let mut off = page::first_rec(page);
    while off != 0 {
        let status = page::rec_status(page, off);
        if status == RecStatus::Supremum {
            break;
        }
        if status == RecStatus::Metadata {
            off = page::rec_next(page, off);
            continue;
        }
        let fields = page::rec_fields(page, off);
        let (ord, m) = cmp_with_match(tuple, &fields, n_cmp);
        match ord {
            Ordering::Less => {
                up_off = off;
                up = m;
                break;
            }
            Ordering::Equal | Ordering::Greater => {
                prev2 = prev;
                prev = off;
                prev_match = m;
                prev_equal = ord == Ordering::Equal;
            }
        }
        off = page::rec_next(page, off);
    }

    let low = if prev == page::INFIMUM {
        PartialMatch::default()
    } else {
        prev_match
    };
    let rec_off = match mode {
        SearchMode::LessOrEqual => prev,
        SearchMode::Less => {
            if prev_equal {
                prev2
            } else {
                prev
            }
        }
        SearchMode::GreaterOrEqual => {
            if prev_equal {
                prev
            } else {
                up_off
            }
        }
        SearchMode::Greater => up_off,
    };

    LeafPos { rec_off, low, up }
}
