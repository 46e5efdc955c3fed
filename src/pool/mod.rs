//! Buffer pool: chunked page frames with pointer-to-block translation
//!
//! Frames live in a fixed set of page-aligned chunks allocated at startup,
//! so every frame address is stable for the pool's lifetime and any
//! address inside a frame can be mapped back to its block by arithmetic
//! over a sorted map of chunk bases. The hash index depends on both
//! properties: it stores raw record pointers and resolves them to blocks
//! without probing any hash.
//!
//! Resizing is logical: a pending capacity is published first (which makes
//! [`BufferPool::size_changed`] true and blocks hash-index enablement),
//! then committed once the hash index has been torn down. Capacity acts as
//! admission control on `alloc_block`; the chunks themselves are retained.

mod block;

pub use block::{page_state, Block};

use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::constants::{PAGE_SHIFT, PAGE_SIZE};
use crate::dict::IndexMeta;
use crate::utility::AlignedBuffer;

/// Blocks per allocation chunk
const CHUNK_BLOCKS: usize = 128;

/// Counters the pool exposes as opaque event sinks
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Page accesses served
    pub n_page_gets: AtomicU64,
    /// LRU young-position hints recorded
    pub n_pages_made_young: AtomicU64,
}

struct Chunk {
    mem: AlignedBuffer,
    blocks: Box<[Block]>,
}

/// The buffer pool
pub struct BufferPool {
    chunks: Vec<Chunk>,
    /// chunk base address -> index into `chunks`
    chunk_map: BTreeMap<usize, usize>,
    free_list: Mutex<Vec<(usize, usize)>>,
    capacity: AtomicUsize,
    pending_capacity: AtomicUsize,
    n_allocated: AtomicUsize,
    /// page number -> (chunk, block) location; its latch is the page-hash
    /// latch taken briefly around the lookup path's page try-latch
    page_map: RwLock<HashMap<u32, (usize, usize)>>,
    next_page_no: AtomicU32,
    /// Event sinks
    pub stat: PoolStats,
}

impl BufferPool {
    /// Create a pool of `n_blocks` page frames
    pub fn new(n_blocks: usize) -> Self {
        assert!(n_blocks > 0);
        let mut chunks = Vec::new();
        let mut chunk_map = BTreeMap::new();
        let mut free_list = Vec::with_capacity(n_blocks);

        let mut remaining = n_blocks;
        while remaining > 0 {
            let count = remaining.min(CHUNK_BLOCKS);
            let mem = AlignedBuffer::zeroed(PAGE_SIZE, count * PAGE_SIZE)
                .expect("buffer pool chunk allocation failed");
            let base = mem.as_mut_ptr();
            let blocks: Box<[Block]> = (0..count)
                .map(|i| {
                    let frame = unsafe { NonNull::new_unchecked(base.add(i * PAGE_SIZE)) };
                    Block::new(frame)
                })
                .collect();
            let chunk_idx = chunks.len();
            chunk_map.insert(base as usize, chunk_idx);
            for i in 0..count {
                free_list.push((chunk_idx, i));
            }
            chunks.push(Chunk { mem, blocks });
            remaining -= count;
        }
        // Hand out low addresses first
        free_list.reverse();

        Self {
            chunks,
            chunk_map,
            free_list: Mutex::new(free_list),
            capacity: AtomicUsize::new(n_blocks),
            pending_capacity: AtomicUsize::new(n_blocks),
            n_allocated: AtomicUsize::new(0),
            page_map: RwLock::new(HashMap::new()),
            next_page_no: AtomicU32::new(3),
            stat: PoolStats::default(),
        }
    }

    /// Current logical pool size in bytes
    pub fn curr_size_bytes(&self) -> usize {
        self.capacity.load(Ordering::Acquire) * PAGE_SIZE
    }

    /// Current logical pool size in blocks
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Whether a resize has been requested but not yet committed
    pub fn size_changed(&self) -> bool {
        self.pending_capacity.load(Ordering::Acquire) != self.capacity.load(Ordering::Acquire)
    }

    /// Publish a pending capacity; takes effect at [`Self::resize_commit`]
    pub fn resize_begin(&self, n_blocks: usize) {
        assert!(n_blocks > 0);
        self.pending_capacity.store(n_blocks, Ordering::Release);
    }

    /// Apply the pending capacity
    pub fn resize_commit(&self) {
        let n = self.pending_capacity.load(Ordering::Acquire);
        self.capacity.store(n, Ordering::Release);
        tracing::info!(blocks = n, "buffer pool resized");
    }

    /// Allocate a block as plain memory. Fails when the pool is at
    /// capacity or the free list is exhausted.
    pub fn alloc_block(&self) -> Option<&Block> {
        let mut free = self.free_list.lock();
        if self.n_allocated.load(Ordering::Acquire) >= self.capacity() {
            return None;
        }
        let (c, i) = free.pop()?;
        self.n_allocated.fetch_add(1, Ordering::AcqRel);
        let block = &self.chunks[c].blocks[i];
        debug_assert_eq!(block.state(), page_state::NOT_USED);
        block.set_state(page_state::MEMORY);
        Some(block)
    }

    /// Return a block to the free list
    pub fn free_block(&self, block: &Block) {
        let state = block.state();
        debug_assert!(state == page_state::MEMORY || state == page_state::REMOVE_HASH);
        block.set_page_no(crate::page::NO_PAGE);
        block.set_state(page_state::NOT_USED);
        let loc = self.block_loc(block.frame());
        let mut free = self.free_list.lock();
        self.n_allocated.fetch_sub(1, Ordering::AcqRel);
        free.push(loc);
    }

    fn block_loc(&self, ptr: *const u8) -> (usize, usize) {
        let addr = ptr as usize;
        let (&base, &chunk_idx) = self
            .chunk_map
            .range(..=addr)
            .next_back()
            .expect("pointer below every chunk base");
        let offs = (addr - base) >> PAGE_SHIFT;
        assert!(offs < self.chunks[chunk_idx].blocks.len(), "pointer past chunk");
        (chunk_idx, offs)
    }

    /// Resolve any address inside a frame to its owning block.
    ///
    /// Pure arithmetic over the chunk base map; never consults the page
    /// map, so it is safe to call while holding the partition latch.
    pub fn block_from_ptr(&self, ptr: *const u8) -> &Block {
        let (c, i) = self.block_loc(ptr);
        &self.chunks[c].blocks[i]
    }

    /// Allocate and initialize a fresh leaf page for `index_id`
    pub fn create_page(&self, index_id: u64) -> Option<(u32, &Block)> {
        let block = self.alloc_block()?;
        let page_no = self.next_page_no.fetch_add(1, Ordering::AcqRel);
        unsafe {
            crate::page::init(block.frame(), index_id);
        }
        block.set_page_no(page_no);
        block.set_state(page_state::UNFIXED);
        let loc = self.block_loc(block.frame());
        self.page_map.write().insert(page_no, loc);
        Some((page_no, block))
    }

    /// Look up a live page
    pub fn get_page(&self, page_no: u32) -> Option<&Block> {
        let map = self.page_map.read();
        let &(c, i) = map.get(&page_no)?;
        Some(&self.chunks[c].blocks[i])
    }

    /// Hold the page-hash latch shared; the lookup path takes this around
    /// its non-blocking page latch attempt
    pub fn page_hash_guard(&self) -> RwLockReadGuard<'_, HashMap<u32, (usize, usize)>> {
        self.page_map.read()
    }

    /// Detach a page from the page map, leaving the block in the
    /// `REMOVE_HASH` state for hash teardown before it is freed
    pub fn remove_page(&self, page_no: u32) -> Option<&Block> {
        let (c, i) = self.page_map.write().remove(&page_no)?;
        let block = &self.chunks[c].blocks[i];
        block.set_state(page_state::REMOVE_HASH);
        Some(block)
    }

    /// Record an LRU young-position hint for a freshly guessed page
    pub fn make_young(&self, _block: &Block) {
        self.stat.n_pages_made_young.fetch_add(1, Ordering::Relaxed);
    }

    /// Clear the adaptive-hash state of every block.
    ///
    /// Caller must hold the partition latch exclusively and have the
    /// search system disabled. Returns the detached indexes whose last
    /// reference may now need lazy freeing.
    pub fn clear_hash_index(&self) -> Vec<Arc<IndexMeta>> {
        let mut garbage: Vec<Arc<IndexMeta>> = Vec::new();
        for chunk in &self.chunks {
            for block in chunk.blocks.iter() {
                let Some(index) = block.ahi_index() else {
                    #[cfg(debug_assertions)]
                    debug_assert_eq!(block.n_pointers.load(Ordering::Relaxed), 0);
                    continue;
                };
                #[cfg(debug_assertions)]
                block.n_pointers.store(0, Ordering::Relaxed);
                if index.freed() && !garbage.iter().any(|g| Arc::ptr_eq(g, &index)) {
                    garbage.push(index);
                }
                block.set_ahi_index(None);
            }
        }
        garbage
    }

    /// Visit every block in the pool
    pub fn for_each_block(&self, mut f: impl FnMut(&Block)) {
        for chunk in &self.chunks {
            for block in chunk.blocks.iter() {
                f(block);
            }
        }
    }
}
