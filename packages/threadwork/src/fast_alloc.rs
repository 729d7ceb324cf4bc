//! Lock-free allocator of fixed-size memory blocks.

use std::alloc::{self, Layout};
use std::any::type_name;
use std::{array, fmt};
use std::num::NonZero;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{Error, Result};

mod builder;
mod lease;

pub use builder::*;
pub use lease::*;

/// Block index that terminates the free list.
const NIL: u32 = u32::MAX;

/// Chunk indexes fit in 32 bits, so 32 geometrically growing segments cover all of them.
const SEGMENT_COUNT: usize = u32::BITS as usize;

/// An allocator that hands out memory blocks of one fixed layout in O(1) time.
///
/// Blocks are carved out of chunks that the allocator requests from the system allocator on
/// demand, `blocks_per_chunk` blocks at a time. Freed blocks go onto a lock-free free list and
/// are handed out again by later allocations. Chunks are only returned to the system when the
/// allocator itself is dropped, so the memory behind a [`Block`] stays valid for as long as the
/// allocator lives, even after the block has been freed.
///
/// The allocator keeps growing for as long as the system allocator satisfies its requests,
/// unless a limit is set with [`FastAllocBuilder::max_chunks()`].
///
/// One allocator serves one block layout. Callers that need several sizes use several allocators
/// and callers that need arbitrary sizes use the general-purpose allocator.
///
/// # Thread safety
///
/// Both [`allocate()`][Self::allocate] and [`free()`][Self::free] may be called from any thread
/// through a shared reference. A block may be freed on a different thread than the one that
/// allocated it. Only chunk growth takes a lock; the free list itself is a Treiber stack whose
/// head carries a tag that is bumped on every successful pop, so a stale head observed by a
/// slow thread can never be installed again.
///
/// # Example
///
/// ```rust
/// use threadwork::FastAlloc;
///
/// let allocator = FastAlloc::for_type::<[u64; 4]>();
///
/// let block = allocator.allocate().unwrap();
///
/// // SAFETY: The block is sized and aligned for [u64; 4] and we own it until we free it.
/// unsafe {
///     block.as_ptr().cast::<[u64; 4]>().write([1, 2, 3, 4]);
/// }
///
/// allocator.free(block);
/// ```
pub struct FastAlloc {
    /// Packed `(tag << 32) | index` of the first free block.
    head: CachePadded<AtomicU64>,

    /// Two-level chunk directory. Segment `s` holds `1 << s` chunk pointers and is allocated
    /// the first time a chunk lands in it. Segments and entries are written once, under
    /// `grow_lock`, before any block of the chunk becomes reachable through `head`, and are
    /// never cleared until drop.
    segments: Box<[AtomicPtr<AtomicPtr<u8>>; SEGMENT_COUNT]>,

    chunk_count: AtomicUsize,

    grow_lock: Mutex<()>,

    layout: ChunkLayout,

    free_blocks: AtomicUsize,
    live_blocks: AtomicUsize,
}

impl FastAlloc {
    /// Creates an allocator for blocks of the given layout with default chunking.
    ///
    /// # Panics
    ///
    /// Panics if the layout has a size of zero.
    #[must_use]
    pub fn new(block_layout: Layout) -> Self {
        Self::builder().block_layout(block_layout).build()
    }

    /// Creates an allocator whose blocks can each hold one `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    #[must_use]
    pub fn for_type<T>() -> Self {
        Self::builder().block_layout_of::<T>().build()
    }

    /// Creates a builder for configuring the allocator.
    pub fn builder() -> FastAllocBuilder {
        FastAllocBuilder::new()
    }

    pub(crate) fn from_builder(
        block_layout: Layout,
        blocks_per_chunk: NonZero<u32>,
        max_chunks: Option<NonZero<u32>>,
    ) -> Self {
        let layout = ChunkLayout::calculate(block_layout, blocks_per_chunk, max_chunks);

        Self {
            head: CachePadded::new(AtomicU64::new(pack(NIL, 0))),
            segments: Box::new(array::from_fn(|_| AtomicPtr::new(ptr::null_mut()))),
            chunk_count: AtomicUsize::new(0),
            grow_lock: Mutex::new(()),
            layout,
            free_blocks: AtomicUsize::new(0),
            live_blocks: AtomicUsize::new(0),
        }
    }

    /// Takes a block off the free list, growing the allocator by one chunk if the list is empty.
    ///
    /// The contents of a newly allocated block are unspecified. Use [`lease()`][Self::lease]
    /// to obtain zero-initialized memory through a safe interface.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if the free list is empty and a new chunk cannot be
    /// obtained, either because the system allocator failed or because the allocator already
    /// owns the maximum number of chunks set with [`FastAllocBuilder::max_chunks()`].
    pub fn allocate(&self) -> Result<Block> {
        loop {
            if let Some(index) = self.pop() {
                self.free_blocks.fetch_sub(1, Ordering::Relaxed);
                self.live_blocks.fetch_add(1, Ordering::Relaxed);

                return Ok(Block {
                    ptr: self.block_ptr(index),
                    index,
                    owner: self.owner_id(),
                });
            }

            self.grow()?;
        }
    }

    /// Returns a block to the free list, making it available to future allocations.
    ///
    /// The memory stays mapped until the allocator is dropped, so raw pointers derived from the
    /// block do not dangle, but anything written there may be overwritten by the next owner.
    ///
    /// # Panics
    ///
    /// Panics if the block was allocated by a different [`FastAlloc`].
    pub fn free(&self, block: Block) {
        assert_eq!(
            block.owner,
            self.owner_id(),
            "block returned to a FastAlloc that did not allocate it"
        );

        self.live_blocks.fetch_sub(1, Ordering::Relaxed);
        // Incremented before the push so a racing pop can never drive the counter below zero.
        self.free_blocks.fetch_add(1, Ordering::Relaxed);

        self.push_chain(block.index, block.index);
    }

    /// Layout of each block handed out by this allocator.
    #[must_use]
    pub fn block_layout(&self) -> Layout {
        self.layout.block_layout
    }

    /// Number of blocks added to the free list by each chunk growth.
    #[must_use]
    pub fn blocks_per_chunk(&self) -> NonZero<u32> {
        self.layout.blocks_per_chunk
    }

    /// Number of chunks obtained from the system allocator so far.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunk_count.load(Ordering::Acquire)
    }

    /// Total number of blocks, free or live, backed by the chunks owned so far.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.chunk_count()
            .saturating_mul(self.layout.blocks_per_chunk.get() as usize)
    }

    /// Number of blocks currently on the free list.
    ///
    /// Exact when no allocation or free is in flight; a momentary approximation otherwise.
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.free_blocks.load(Ordering::Relaxed)
    }

    /// Number of blocks currently handed out to callers.
    ///
    /// Exact when no allocation or free is in flight; a momentary approximation otherwise.
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.live_blocks.load(Ordering::Relaxed)
    }

    /// Identifies this allocator for the ownership check in `free()`. The segment table is a
    /// stable heap allocation, so the value survives moves of the allocator itself.
    fn owner_id(&self) -> usize {
        self.segments.as_ptr().addr()
    }

    fn pop(&self) -> Option<u32> {
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire);

        loop {
            let (index, tag) = unpack(head);

            if index == NIL {
                return None;
            }

            // Another thread may pop this block and hand it out before our exchange below. The
            // link we read is then meaningless but harmless: the tag has moved on and the
            // exchange fails.
            let next = self.link(index).load(Ordering::Relaxed);

            match self.head.compare_exchange_weak(
                head,
                pack(next, tag.wrapping_add(1)),
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(actual) => {
                    head = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Pushes a pre-linked run of blocks `first ..= last` onto the free list.
    fn push_chain(&self, first: u32, last: u32) {
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Relaxed);

        loop {
            let (head_index, tag) = unpack(head);
            self.link(last).store(head_index, Ordering::Relaxed);

            match self.head.compare_exchange_weak(
                head,
                pack(first, tag),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    head = actual;
                    backoff.spin();
                }
            }
        }
    }

    #[cold]
    fn grow(&self) -> Result<()> {
        let _guard = self.grow_lock.lock();

        // Someone else may have grown the allocator, or freed blocks, while we waited.
        if unpack(self.head.load(Ordering::Acquire)).0 != NIL {
            return Ok(());
        }

        let chunk_bytes = self.layout.chunk_layout.size();
        let chunk_index = self.chunk_count.load(Ordering::Relaxed);

        if chunk_index >= self.layout.chunk_limit {
            debug!(
                chunk_limit = self.layout.chunk_limit,
                "FastAlloc reached its chunk limit"
            );
            return Err(Error::ResourceExhausted { chunk_bytes });
        }

        let entry = self.reserve_entry(chunk_index, chunk_bytes)?;

        // SAFETY: The chunk layout has a non-zero size, guaranteed by ChunkLayout::calculate.
        let Some(memory) = NonNull::new(unsafe { alloc::alloc(self.layout.chunk_layout) }) else {
            return Err(Error::ResourceExhausted { chunk_bytes });
        };

        let blocks_per_chunk = self.layout.blocks_per_chunk.get();
        let first = self.layout.first_index_of_chunk(chunk_index);

        for slot in 0..blocks_per_chunk {
            // The final link is overwritten by push_chain() below.
            let next = first.wrapping_add(slot).wrapping_add(1);

            // SAFETY: The slot lies within the chunk we just allocated and slot offsets are
            // multiples of the slot alignment, which is at least the alignment of AtomicU32.
            unsafe {
                memory
                    .as_ptr()
                    .add(self.layout.slot_offset(slot))
                    .cast::<AtomicU32>()
                    .write(AtomicU32::new(next));
            }
        }

        entry.store(memory.as_ptr(), Ordering::Release);
        self.chunk_count
            .store(chunk_index.wrapping_add(1), Ordering::Release);
        self.free_blocks
            .fetch_add(blocks_per_chunk as usize, Ordering::Relaxed);

        let last = first.wrapping_add(blocks_per_chunk).wrapping_sub(1);
        self.push_chain(first, last);

        debug!(
            chunk_index,
            chunk_bytes, blocks_per_chunk, "FastAlloc grew by one chunk"
        );

        Ok(())
    }

    /// Returns the directory entry for `chunk_index`, allocating its segment first if this is
    /// the first chunk to land in it. Only called under `grow_lock`.
    fn reserve_entry(&self, chunk_index: usize, chunk_bytes: usize) -> Result<&AtomicPtr<u8>> {
        if let Some(entry) = self.chunk_entry(chunk_index) {
            return Ok(entry);
        }

        let exhausted = || Error::ResourceExhausted { chunk_bytes };

        let (segment, _) = segment_of(chunk_index);
        let table_slot = self.segments.get(segment).ok_or_else(exhausted)?;
        let segment_layout = segment_layout(segment).ok_or_else(exhausted)?;

        // SAFETY: A segment holds at least one entry, so the layout is never zero-sized.
        let memory = NonNull::new(unsafe { alloc::alloc_zeroed(segment_layout) })
            .ok_or_else(exhausted)?;

        // All-zero memory is a run of null `AtomicPtr`s.
        table_slot.store(memory.as_ptr().cast(), Ordering::Release);

        debug!(segment, "FastAlloc added a chunk directory segment");

        self.chunk_entry(chunk_index).ok_or_else(exhausted)
    }

    /// The directory entry for `chunk_index`, if its segment has been published.
    fn chunk_entry(&self, chunk_index: usize) -> Option<&AtomicPtr<u8>> {
        let (segment, offset) = segment_of(chunk_index);
        let entries = NonNull::new(self.segments.get(segment)?.load(Ordering::Acquire))?;

        // SAFETY: A published segment holds `1 << segment` entries, more than `offset`.
        let entry = unsafe { entries.add(offset) };

        // SAFETY: The entry was zero-initialized when the segment was allocated and the segment
        // lives as long as `self`.
        Some(unsafe { entry.as_ref() })
    }

    fn slot_ptr(&self, index: u32) -> NonNull<u8> {
        let (chunk_index, slot) = self.layout.locate(index);

        let Some(chunk) = self
            .chunk_entry(chunk_index)
            .and_then(|entry| NonNull::new(entry.load(Ordering::Acquire)))
        else {
            unreachable!("block index {index} refers to a chunk that was never published");
        };

        // SAFETY: The slot offset is within the chunk layout, per ChunkLayout::calculate.
        unsafe { chunk.add(self.layout.slot_offset(slot)) }
    }

    fn link(&self, index: u32) -> &AtomicU32 {
        // SAFETY: Every slot begins with an AtomicU32 header written at chunk growth time. The
        // header is never exposed to callers and the chunk lives as long as `self`.
        unsafe { self.slot_ptr(index).cast::<AtomicU32>().as_ref() }
    }

    fn block_ptr(&self, index: u32) -> NonNull<u8> {
        // SAFETY: The block offset stays within the slot, per ChunkLayout::calculate.
        unsafe { self.slot_ptr(index).add(self.layout.block_offset) }
    }

    /// Walks the free list. Only meaningful while no other thread touches the allocator.
    #[cfg(test)]
    pub(crate) fn free_list_len(&self) -> usize {
        let mut len = 0_usize;
        let mut index = unpack(self.head.load(Ordering::Acquire)).0;

        while index != NIL {
            len = len.wrapping_add(1);
            index = self.link(index).load(Ordering::Relaxed);
        }

        len
    }
}

impl fmt::Debug for FastAlloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("block_layout", &self.layout.block_layout)
            .field("blocks_per_chunk", &self.layout.blocks_per_chunk)
            .field("chunk_count", &self.chunk_count())
            .field("free_blocks", &self.free_blocks())
            .field("live_blocks", &self.live_blocks())
            .finish_non_exhaustive()
    }
}

impl Drop for FastAlloc {
    fn drop(&mut self) {
        let live_blocks = *self.live_blocks.get_mut();

        if live_blocks != 0 {
            warn!(
                live_blocks,
                "FastAlloc dropped while blocks are still allocated; their memory is released now"
            );
        }

        for chunk_index in 0..*self.chunk_count.get_mut() {
            let Some(memory) = self
                .chunk_entry(chunk_index)
                .and_then(|entry| NonNull::new(entry.load(Ordering::Relaxed)))
            else {
                continue;
            };

            // SAFETY: The chunk was allocated in grow() with exactly this layout and is
            // deallocated only here, once.
            unsafe {
                alloc::dealloc(memory.as_ptr(), self.layout.chunk_layout);
            }
        }

        for (segment, table_slot) in self.segments.iter_mut().enumerate() {
            let Some(memory) = NonNull::new(*table_slot.get_mut()) else {
                continue;
            };

            let Some(segment_layout) = segment_layout(segment) else {
                continue;
            };

            // SAFETY: The segment was allocated in reserve_entry() with exactly this layout and
            // is deallocated only here, once.
            unsafe {
                alloc::dealloc(memory.as_ptr().cast(), segment_layout);
            }
        }
    }
}

/// A block of memory handed out by [`FastAlloc::allocate()`].
///
/// The block must be returned through [`FastAlloc::free()`] on the allocator that produced it.
/// Dropping a block without freeing it does not leak memory permanently (the allocator reclaims
/// all chunks when dropped) but keeps the block out of circulation until then.
///
/// The block is just a handle: it never reads or writes the memory it refers to. What is stored
/// in the memory, and whether it is initialized, is up to the holder.
#[derive(Debug)]
#[must_use = "a block that is not freed stays unavailable until the allocator is dropped"]
pub struct Block {
    ptr: NonNull<u8>,
    index: u32,
    owner: usize,
}

impl Block {
    /// Pointer to the start of the block, aligned to the allocator's block layout.
    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Position of the block within its allocator, stable across reuse.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }
}

// SAFETY: A block is a uniquely owned handle to memory that stays valid for the lifetime of its
// allocator; moving or sharing the handle between threads does not access that memory.
unsafe impl Send for Block {}
// SAFETY: See above. `&Block` only exposes the pointer value and the index.
unsafe impl Sync for Block {}

/// Precomputed layout of a chunk: `blocks_per_chunk` slots, each an `AtomicU32` free-list link
/// followed by the block itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ChunkLayout {
    block_layout: Layout,
    blocks_per_chunk: NonZero<u32>,

    /// Offset of the block from the start of its slot.
    block_offset: usize,

    /// Distance between consecutive slots.
    slot_size: usize,

    chunk_layout: Layout,

    /// How many chunks the allocator may own: the configured maximum if there is one, otherwise
    /// as many as the 32-bit block index space can address.
    chunk_limit: usize,
}

impl ChunkLayout {
    /// # Panics
    ///
    /// Panics if the block layout is zero-sized, if the slot or chunk layout overflows, or if
    /// `blocks_per_chunk * max_chunks` blocks cannot all be given a distinct 32-bit index.
    fn calculate(
        block_layout: Layout,
        blocks_per_chunk: NonZero<u32>,
        max_chunks: Option<NonZero<u32>>,
    ) -> Self {
        assert!(
            block_layout.size() > 0,
            "FastAlloc must have non-zero block size"
        );

        let addressable_chunks = addressable_chunks(blocks_per_chunk);

        let chunk_limit = match max_chunks {
            Some(max_chunks) => {
                assert!(
                    max_chunks.get() <= addressable_chunks,
                    "FastAlloc cannot index {blocks_per_chunk} x {max_chunks} blocks"
                );
                max_chunks.get()
            }
            None => addressable_chunks,
        };

        let (slot_layout, block_offset) = Layout::new::<AtomicU32>()
            .extend(block_layout)
            .expect("block layout is too large to be placed in a FastAlloc slot");

        // pad_to_align() makes the size a valid array stride.
        let slot_layout = slot_layout.pad_to_align();

        let chunk_size = slot_layout
            .size()
            .checked_mul(blocks_per_chunk.get() as usize)
            .expect("FastAlloc chunk size overflows usize");

        let chunk_layout = Layout::from_size_align(chunk_size, slot_layout.align())
            .expect("FastAlloc chunk size exceeds the maximum allocation size");

        Self {
            block_layout,
            blocks_per_chunk,
            block_offset,
            slot_size: slot_layout.size(),
            chunk_layout,
            chunk_limit: chunk_limit as usize,
        }
    }

    #[allow(
        clippy::integer_division,
        clippy::modulo_arithmetic,
        reason = "splitting a global block index into chunk and slot is exactly a div/rem"
    )]
    fn locate(&self, index: u32) -> (usize, u32) {
        let per_chunk = self.blocks_per_chunk.get();
        ((index / per_chunk) as usize, index % per_chunk)
    }

    #[allow(
        clippy::cast_possible_truncation,
        reason = "chunk indexes are bounded by chunk_limit, which fits the u32 index space"
    )]
    fn first_index_of_chunk(&self, chunk_index: usize) -> u32 {
        (chunk_index as u32).wrapping_mul(self.blocks_per_chunk.get())
    }

    fn slot_offset(&self, slot: u32) -> usize {
        // Cannot overflow: the chunk size was computed with checked arithmetic.
        (slot as usize).wrapping_mul(self.slot_size)
    }
}

/// Number of whole chunks whose blocks all receive an index below `NIL`.
#[allow(
    clippy::integer_division,
    reason = "only whole chunks count, the remainder of the index space stays unused"
)]
fn addressable_chunks(blocks_per_chunk: NonZero<u32>) -> u32 {
    u32::MAX / blocks_per_chunk
}

/// Splits a chunk index into its directory segment and the position within that segment.
/// Segment `s` covers chunk indexes `(1 << s) - 1 .. (1 << (s + 1)) - 1`.
fn segment_of(chunk_index: usize) -> (usize, usize) {
    let position = chunk_index.wrapping_add(1);
    let segment = position.ilog2();

    (segment as usize, position ^ 1_usize.wrapping_shl(segment))
}

fn segment_layout(segment: usize) -> Option<Layout> {
    let len = 1_usize.checked_shl(u32::try_from(segment).ok()?)?;
    Layout::array::<AtomicPtr<u8>>(len).ok()
}

#[inline]
fn pack(index: u32, tag: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(index)
}

#[inline]
#[allow(
    clippy::cast_possible_truncation,
    reason = "the two halves of the packed word are extracted on purpose"
)]
fn unpack(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}
