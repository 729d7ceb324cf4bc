use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;

use crate::FastAlloc;

#[cfg(not(miri))]
const DEFAULT_BLOCKS_PER_CHUNK: NonZero<u32> = NonZero::new(64).unwrap();

// Miri test runtime scales with memory usage, so keep chunks tiny there.
#[cfg(miri)]
const DEFAULT_BLOCKS_PER_CHUNK: NonZero<u32> = NonZero::new(4).unwrap();

/// Blocks configured by size alone are aligned like a `u64`, which suits any plain-old-data
/// buffer contents.
const DEFAULT_BLOCK_ALIGN: usize = align_of::<u64>();

/// Builder for creating an instance of [`FastAlloc`].
///
/// The block layout is mandatory, whereas the chunking parameters are optional.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use threadwork::FastAlloc;
///
/// let allocator = FastAlloc::builder()
///     .block_size(512)
///     .blocks_per_chunk(NonZero::new(16).unwrap())
///     .build();
///
/// assert_eq!(allocator.block_layout().size(), 512);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
#[must_use]
pub struct FastAllocBuilder {
    block_layout: Option<Layout>,
    blocks_per_chunk: NonZero<u32>,
    max_chunks: Option<NonZero<u32>>,

    _not_sync: PhantomData<Cell<()>>,
}

impl FastAllocBuilder {
    pub(crate) fn new() -> Self {
        Self {
            block_layout: None,
            blocks_per_chunk: DEFAULT_BLOCKS_PER_CHUNK,
            max_chunks: None,
            _not_sync: PhantomData,
        }
    }

    /// Sets the memory layout of every block.
    ///
    /// # Panics
    ///
    /// Panics if the layout has a size of zero.
    pub fn block_layout(mut self, layout: Layout) -> Self {
        assert!(layout.size() > 0, "FastAlloc must have non-zero block size");
        self.block_layout = Some(layout);
        self
    }

    /// Sets the block layout to that of `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    pub fn block_layout_of<T>(self) -> Self {
        self.block_layout(Layout::new::<T>())
    }

    /// Sets the block layout to `size` bytes with 8-byte alignment.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or too large to form a valid layout.
    pub fn block_size(self, size: usize) -> Self {
        let layout = Layout::from_size_align(size, DEFAULT_BLOCK_ALIGN)
            .expect("block size must form a valid layout");
        self.block_layout(layout)
    }

    /// Sets how many blocks each chunk holds. Defaults to 64.
    pub fn blocks_per_chunk(mut self, count: NonZero<u32>) -> Self {
        self.blocks_per_chunk = count;
        self
    }

    /// Caps the number of chunks the allocator may own.
    ///
    /// Once this many chunks exist and all their blocks are live, further allocations fail
    /// with [`Error::ResourceExhausted`][crate::Error::ResourceExhausted]. Without a cap the
    /// allocator grows until the system allocator refuses a chunk.
    pub fn max_chunks(mut self, count: NonZero<u32>) -> Self {
        self.max_chunks = Some(count);
        self
    }

    /// Builds the allocator. No memory is reserved for blocks until the first allocation.
    ///
    /// # Panics
    ///
    /// Panics if no block layout was set, or if `blocks_per_chunk * max_chunks` is too large
    /// for every block to receive a distinct 32-bit index.
    #[must_use]
    pub fn build(self) -> FastAlloc {
        let block_layout = self
            .block_layout
            .expect("block layout must be set before building a FastAlloc");

        FastAlloc::from_builder(block_layout, self.blocks_per_chunk, self.max_chunks)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(FastAllocBuilder: Send);
    assert_not_impl_any!(FastAllocBuilder: Sync);

    #[test]
    fn defaults_apply() {
        let allocator = FastAlloc::builder().block_layout_of::<u128>().build();

        assert_eq!(allocator.block_layout(), Layout::new::<u128>());
        assert_eq!(allocator.blocks_per_chunk(), DEFAULT_BLOCKS_PER_CHUNK);
    }

    #[test]
    fn chunk_count_is_uncapped_by_default() {
        let builder = FastAlloc::builder().block_layout_of::<u64>();

        assert_eq!(builder.max_chunks, None);
    }

    #[test]
    fn block_size_uses_default_alignment() {
        let allocator = FastAlloc::builder().block_size(100).build();

        assert_eq!(allocator.block_layout().size(), 100);
        assert_eq!(allocator.block_layout().align(), DEFAULT_BLOCK_ALIGN);
    }

    #[test]
    #[should_panic]
    fn build_without_layout_panics() {
        drop(FastAlloc::builder().build());
    }

    #[test]
    #[should_panic]
    fn zero_block_size_panics() {
        drop(FastAlloc::builder().block_size(0));
    }
}
