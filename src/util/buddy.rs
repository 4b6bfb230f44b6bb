use std::array;
use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;

#[cfg(debug_assertions)]
use std::collections::HashSet;

use crate::error::Error;
use crate::transport::{ActiveTransport, LKey, UnreliableTransport};
use crate::util::{buffer::*, huge_alloc::*};

/// A buffer that represents a piece of unallocated memory in the allocator.
///
/// This type does not contain any length information, as the freelist it
/// resides in determines its size class.
struct InClassBuffer {
    /// Start address of the buffer.
    buf: NonNull<u8>,

    /// Local key.
    lkey: LKey,
}

impl InClassBuffer {
    /// Create a new buffer.
    #[inline(always)]
    pub fn new(buf: NonNull<u8>, lkey: LKey) -> Self {
        Self { buf, lkey }
    }

    /// Return a new buffer that starts at an offset to the current one.
    ///
    /// # Safety
    ///
    /// Same as [`pointer::add()`](https://doc.rust-lang.org/std/primitive.pointer.html#method.add).
    #[inline(always)]
    pub unsafe fn offset(&self, offset: usize) -> InClassBuffer {
        InClassBuffer {
            buf: NonNull::new_unchecked(self.buf.as_ptr().add(offset)),
            lkey: self.lkey,
        }
    }
}

/// The true allocator state, kept behind a `RefCell` since buffers trigger
/// frees from their `Drop` impls.
struct BuddyAllocatorInner {
    /// Per-size-class freelists.
    freelists: [Vec<InClassBuffer>; Self::NUM_CLASSES],

    /// Allocated memory registry.
    #[allow(dead_code)]
    mem_registry: Vec<HugeAlloc>,

    /// Next allocation size.
    next_alloc: usize,

    /// Buffers currently handed out.
    outstanding: usize,

    /// Addresses of free blocks, for double-free detection.
    #[cfg(debug_assertions)]
    free_signatures: HashSet<usize>,
}

impl BuddyAllocatorInner {
    const MIN_ALLOC_SIZE: usize = 1 << 6;
    const MAX_ALLOC_SIZE: usize = 1 << 24;
    const NUM_CLASSES: usize =
        (Self::MAX_ALLOC_SIZE / Self::MIN_ALLOC_SIZE).trailing_zeros() as usize + 1;

    /// Current arena exhausted for some size class, so reserve new memory
    /// and register it with the transport.
    #[cold]
    fn reserve_memory(
        &mut self,
        tp: &mut ActiveTransport,
        numa_node: Option<u32>,
    ) -> Result<(), Error> {
        let len = self.next_alloc;
        debug_assert!(len % Self::MAX_ALLOC_SIZE == 0);

        let mem = alloc_raw(len, numa_node)?;

        // SAFETY: `mem` is a valid freshly-allocated region.
        let lkey = unsafe { tp.reg_mem(mem.ptr, len)? };

        for i in 0..(len / Self::MAX_ALLOC_SIZE) {
            let buf = InClassBuffer::new(
                // SAFETY: guaranteed not null, within the allocated region.
                unsafe { NonNull::new_unchecked(mem.ptr.add(i * Self::MAX_ALLOC_SIZE)) },
                lkey,
            );
            #[cfg(debug_assertions)]
            self.free_signatures.insert(buf.buf.as_ptr() as usize);
            self.freelists[Self::NUM_CLASSES - 1].push(buf);
        }
        self.mem_registry.push(mem);
        self.next_alloc *= 2;
        Ok(())
    }

    /// Return the size of a given class.
    #[inline]
    const fn size_of_class(class: usize) -> usize {
        Self::MIN_ALLOC_SIZE << class
    }

    /// Return the smallest class that can accommodate a given size.
    #[inline]
    const fn class_of(len: usize) -> usize {
        let len = len.next_power_of_two();
        if len < Self::MIN_ALLOC_SIZE {
            0
        } else {
            (len / Self::MIN_ALLOC_SIZE).trailing_zeros() as usize
        }
    }

    /// Split a buffer of the given class into two buffers of the next lower class.
    #[inline]
    fn split(&mut self, class: usize) {
        debug_assert!((1..Self::NUM_CLASSES).contains(&class));
        debug_assert!(!self.freelists[class].is_empty());

        let size_after_split = Self::size_of_class(class - 1);
        let buf1 = self.freelists[class].pop().unwrap();

        // SAFETY: guaranteed not null, within the same reserved region.
        let buf2 = unsafe { buf1.offset(size_after_split) };

        #[cfg(debug_assertions)]
        self.free_signatures.insert(buf2.buf.as_ptr() as usize);

        self.freelists[class - 1].push(buf1);
        self.freelists[class - 1].push(buf2);
    }
}

impl BuddyAllocatorInner {
    /// Create a new allocator with no pre-allocation.
    fn new() -> Self {
        Self {
            freelists: array::from_fn(|_| Vec::new()),
            mem_registry: Vec::new(),
            next_alloc: Self::MAX_ALLOC_SIZE,
            outstanding: 0,
            #[cfg(debug_assertions)]
            free_signatures: HashSet::new(),
        }
    }

    /// Allocate a buffer with at least the given length.
    fn alloc(
        &mut self,
        len: usize,
        tp: &mut ActiveTransport,
        numa_node: Option<u32>,
        owner: &Rc<BuddyAllocator>,
    ) -> Result<Buffer, Error> {
        if len > Self::MAX_ALLOC_SIZE {
            return Err(Error::OutOfMemory);
        }

        let class = Self::class_of(len);
        if self.freelists[class].is_empty() {
            let higher_class =
                ((class + 1)..Self::NUM_CLASSES).find(|&c| !self.freelists[c].is_empty());
            let higher_class = match higher_class {
                Some(c) => c,
                None => {
                    self.reserve_memory(tp, numa_node)?;
                    Self::NUM_CLASSES - 1
                }
            };

            debug_assert!(!self.freelists[higher_class].is_empty());
            for i in ((class + 1)..=higher_class).rev() {
                self.split(i);
            }
            debug_assert!(!self.freelists[class].is_empty());
        }
        let buf = self.freelists[class].pop().unwrap();
        self.outstanding += 1;

        #[cfg(debug_assertions)]
        self.free_signatures.remove(&(buf.buf.as_ptr() as usize));

        Ok(Buffer::real(
            buf.buf,
            Self::size_of_class(class),
            buf.lkey,
            owner.clone(),
        ))
    }

    /// Free a buffer.
    /// This does not release the memory, but returns it to its class freelist.
    fn free(&mut self, buf: &Buffer) {
        #[cfg(debug_assertions)]
        assert!(
            self.free_signatures.insert(buf.as_ptr() as usize),
            "double free of arena buffer at {:p}",
            buf.as_ptr()
        );

        let class = Self::class_of(buf.len());
        self.freelists[class].push(InClassBuffer::new(
            // SAFETY: `buf.as_ptr()` returns the raw pointer stored in `NonNull`.
            unsafe { NonNull::new_unchecked(buf.as_ptr()) },
            buf.lkey(),
        ));
        self.outstanding -= 1;
    }
}

/// A size-classed arena allocator over transport-registered hugepage memory.
///
/// Freelists hold power-of-two blocks from 64B to 16MB. Exhausted classes are
/// refilled by splitting a higher class; blocks are never coalesced, so both
/// alloc and free stay O(1) on the fast path. Reserved memory is released
/// only when the allocator and every buffer carved from it are dropped.
pub(crate) struct BuddyAllocator {
    inner: RefCell<BuddyAllocatorInner>,

    /// NUMA node all reserved memory is bound to.
    numa_node: Option<u32>,
}

impl BuddyAllocator {
    /// The maximum allocation size, 16MB.
    pub const MAX_ALLOC_SIZE: usize = BuddyAllocatorInner::MAX_ALLOC_SIZE;

    /// Create a new allocator with no pre-allocation.
    pub fn new(numa_node: Option<u32>) -> Self {
        Self {
            inner: RefCell::new(BuddyAllocatorInner::new()),
            numa_node,
        }
    }

    /// Allocate a buffer with at least the given length.
    pub fn alloc(
        self: &Rc<Self>,
        len: usize,
        tp: &mut ActiveTransport,
    ) -> Result<Buffer, Error> {
        self.inner.borrow_mut().alloc(len, tp, self.numa_node, self)
    }

    /// Free a buffer, returning it to its class freelist.
    pub fn free(&self, buf: &Buffer) {
        self.inner.borrow_mut().free(buf)
    }

    /// Number of buffers currently handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.inner.borrow().outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_tp() -> ActiveTransport {
        ActiveTransport::new("127.0.0.1", 1, &Config::default()).unwrap()
    }

    #[test]
    fn class_math() {
        assert_eq!(BuddyAllocatorInner::class_of(0), 0);
        assert_eq!(BuddyAllocatorInner::class_of(64), 0);
        assert_eq!(BuddyAllocatorInner::class_of(65), 1);
        assert_eq!(BuddyAllocatorInner::class_of(4096), 6);
        assert_eq!(BuddyAllocatorInner::size_of_class(0), 64);
        assert_eq!(
            BuddyAllocatorInner::size_of_class(BuddyAllocatorInner::NUM_CLASSES - 1),
            BuddyAllocator::MAX_ALLOC_SIZE
        );
    }

    #[test]
    fn alloc_free_balance() {
        let mut tp = test_tp();
        let allocator = Rc::new(BuddyAllocator::new(None));

        let bufs = (0..16)
            .map(|i| allocator.alloc(64 << (i % 4), &mut tp).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(allocator.outstanding(), 16);
        for buf in &bufs {
            assert!(buf.len() >= 64);
            assert!(buf.len().is_power_of_two());
        }

        drop(bufs);
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn freed_blocks_are_reused() {
        let mut tp = test_tp();
        let allocator = Rc::new(BuddyAllocator::new(None));

        let buf = allocator.alloc(4096, &mut tp).unwrap();
        let addr = buf.as_ptr() as usize;
        drop(buf);

        let buf = allocator.alloc(4096, &mut tp).unwrap();
        assert_eq!(buf.as_ptr() as usize, addr);
    }

    #[test]
    fn oversized_alloc_fails() {
        let mut tp = test_tp();
        let allocator = Rc::new(BuddyAllocator::new(None));
        assert!(matches!(
            allocator.alloc(BuddyAllocator::MAX_ALLOC_SIZE + 1, &mut tp),
            Err(Error::OutOfMemory)
        ));
    }
}
