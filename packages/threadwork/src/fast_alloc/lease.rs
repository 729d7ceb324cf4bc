use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::{ptr, slice};

use crate::{Block, FastAlloc, Result};

impl FastAlloc {
    /// Allocates a block and exposes it as a zero-initialized byte buffer.
    ///
    /// The block goes back to the allocator when the lease is dropped. This is the safe way for
    /// buffer-oriented callers (serializers, socket readers) to use the allocator without
    /// touching raw pointers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`][crate::Error::ResourceExhausted] under the same
    /// conditions as [`allocate()`][Self::allocate].
    ///
    /// # Example
    ///
    /// ```rust
    /// use threadwork::FastAlloc;
    ///
    /// let allocator = FastAlloc::builder().block_size(64).build();
    ///
    /// let mut buffer = allocator.lease().unwrap();
    /// buffer[..5].copy_from_slice(b"hello");
    ///
    /// assert_eq!(&buffer[..5], b"hello");
    /// assert_eq!(buffer.len(), 64);
    /// ```
    pub fn lease(&self) -> Result<Lease<'_>> {
        let block = self.allocate()?;
        let len = self.block_layout().size();

        // SAFETY: The block is exclusively ours and spans `len` writable bytes.
        unsafe {
            ptr::write_bytes(block.as_ptr().as_ptr(), 0, len);
        }

        Ok(Lease {
            allocator: self,
            block: ManuallyDrop::new(block),
            len,
        })
    }
}

/// A [`FastAlloc`] block on loan as a byte buffer, returned to the allocator on drop.
///
/// Created by [`FastAlloc::lease()`].
#[derive(Debug)]
pub struct Lease<'a> {
    allocator: &'a FastAlloc,
    block: ManuallyDrop<Block>,
    len: usize,
}

impl Lease<'_> {
    /// Ends the lease without freeing the block, handing the raw block to the caller.
    ///
    /// The caller becomes responsible for returning it through [`FastAlloc::free()`].
    pub fn into_block(self) -> Block {
        let mut this = ManuallyDrop::new(self);

        // SAFETY: `this` is never dropped, so the block is taken out exactly once.
        unsafe { ManuallyDrop::take(&mut this.block) }
    }
}

impl Deref for Lease<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: The block spans `len` bytes, zeroed at lease time and only written through
        // this lease since, and the lease holds exclusive ownership of the block.
        unsafe { slice::from_raw_parts(self.block.as_ptr().as_ptr(), self.len) }
    }
}

impl DerefMut for Lease<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: As in deref(); `&mut self` guarantees the access is unique.
        unsafe { slice::from_raw_parts_mut(self.block.as_ptr().as_ptr(), self.len) }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        // SAFETY: The block is taken exactly once, here, and `self` is not used afterwards.
        let block = unsafe { ManuallyDrop::take(&mut self.block) };
        self.allocator.free(block);
    }
}
