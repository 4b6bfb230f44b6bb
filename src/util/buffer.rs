use std::ptr::NonNull;
use std::rc::Rc;

use crate::transport::LKey;
use crate::util::buddy::BuddyAllocator;

/// A contiguous piece of transport-registered memory carved from the arena.
pub(crate) struct Buffer {
    /// Start address of the buffer.
    buf: NonNull<u8>,

    /// Length of the buffer.
    len: usize,

    /// Memory handle.
    lkey: LKey,

    /// The arena this buffer returns to when dropped.
    owner: Option<Rc<BuddyAllocator>>,
}

impl Buffer {
    /// A real buffer that returns to its arena when dropped.
    #[inline]
    pub fn real(buf: NonNull<u8>, len: usize, lkey: LKey, owner: Rc<BuddyAllocator>) -> Self {
        Self {
            buf,
            len,
            lkey,
            owner: Some(owner),
        }
    }

    /// A fake buffer that only serves to record a LKey, and does nothing when dropped.
    #[inline]
    pub fn fake(lkey: LKey) -> Self {
        Self {
            buf: NonNull::dangling(),
            len: 0,
            lkey,
            owner: None,
        }
    }

    /// Get the start address of the buffer.
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.buf.as_ptr()
    }

    /// Get the length of the buffer.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Get the memory handle of the buffer.
    #[inline(always)]
    pub fn lkey(&self) -> LKey {
        self.lkey
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.free(self);
        }
    }
}
