use std::ptr;

use libc::*;

use crate::error::Error;
use crate::util::likely::*;

const HUGE_PAGE_SIZE: usize = 1 << 21;

/// `MPOL_BIND` is not exported by the `libc` crate.
const MPOL_BIND: c_long = 2;

enum AllocType {
    Mmap,
    Malloc,
}

pub(crate) struct HugeAlloc {
    pub ptr: *mut u8,
    pub len: usize,
    alloc_type: AllocType,
}

unsafe impl Send for HugeAlloc {}
unsafe impl Sync for HugeAlloc {}

impl Drop for HugeAlloc {
    fn drop(&mut self) {
        // SAFETY: FFI.
        unsafe {
            match self.alloc_type {
                AllocType::Mmap => assert!(
                    munmap(self.ptr as *mut c_void, self.len) == 0,
                    "munmap failed"
                ),
                AllocType::Malloc => free(self.ptr as *mut c_void),
            }
        };
    }
}

#[inline]
fn alloc_mmap(len: usize, flags: i32) -> *mut u8 {
    // SAFETY: FFI.
    let ret = unsafe {
        mmap(
            ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS | flags,
            -1,
            0,
        ) as *mut u8
    };

    if ret != MAP_FAILED as _ {
        ret
    } else {
        ptr::null_mut()
    }
}

#[inline]
fn alloc_memalign(len: usize, align: usize) -> *mut u8 {
    let mut ptr = ptr::null_mut();
    // SAFETY: FFI.
    let ret = unsafe { posix_memalign(&mut ptr, align, len) };
    if likely(ret == 0) {
        ptr as _
    } else {
        ptr::null_mut()
    }
}

/// Bind the pages of `[ptr, ptr + len)` to the given NUMA node.
/// The region must be page-aligned.
fn bind_to_node(ptr: *mut u8, len: usize, node: u32) -> bool {
    assert!(node < 64, "NUMA node {} out of nodemask range", node);
    let nodemask: u64 = 1 << node;

    // SAFETY: FFI; the nodemask outlives the call.
    let ret = unsafe {
        syscall(
            SYS_mbind,
            ptr as *mut c_void,
            len,
            MPOL_BIND,
            &nodemask as *const u64,
            64usize,
            0u32,
        )
    };
    ret == 0
}

/// Allocate `len` bytes of memory, rounded up to the hugepage size.
///
/// Prefers explicit hugepages and degrades to normal pages with a warning,
/// so that the library stays usable on hosts without a hugetlb pool. If a
/// NUMA node is given, the pages are bound to it; a binding failure fails
/// the whole allocation rather than run with misplaced memory.
pub(crate) fn alloc_raw(len: usize, numa_node: Option<u32>) -> Result<HugeAlloc, Error> {
    // Roundup to huge page size.
    let len = (len + HUGE_PAGE_SIZE - 1) & !(HUGE_PAGE_SIZE - 1);

    let finish = |ptr: *mut u8, alloc_type: AllocType| -> Result<HugeAlloc, Error> {
        if let Some(node) = numa_node {
            if !bind_to_node(ptr, len, node) {
                log::error!("failed to bind {}MB to NUMA node {}", len >> 20, node);
                drop(HugeAlloc {
                    ptr,
                    len,
                    alloc_type,
                });
                return Err(Error::OutOfMemory);
            }
        }
        Ok(HugeAlloc {
            ptr,
            len,
            alloc_type,
        })
    };

    // 1. Try to allocate huge pages.
    let ptr = alloc_mmap(len, MAP_HUGETLB);
    if !ptr.is_null() {
        return finish(ptr, AllocType::Mmap);
    }

    log::warn!(
        "failed to mmap {}MB hugepages, trying normal pages; performance can be low.",
        len >> 20
    );

    // 2. Try to allocate normal pages.
    let ptr = alloc_mmap(len, 0);
    if likely(!ptr.is_null()) {
        return finish(ptr, AllocType::Mmap);
    }

    log::warn!(
        "failed to mmap {}MB normal pages, trying posix_memalign; performance can be low.",
        len >> 20
    );

    // 3. Try to posix_memalign, align to page size.
    let ptr = alloc_memalign(len, 1 << 12);
    if likely(!ptr.is_null()) {
        return finish(ptr, AllocType::Malloc);
    }

    log::error!("failed to allocate {}MB memory", len >> 20);
    Err(Error::OutOfMemory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rounds_up_to_hugepage() {
        let mem = alloc_raw(1, None).unwrap();
        assert_eq!(mem.len, HUGE_PAGE_SIZE);
        assert!(!mem.ptr.is_null());
        assert_eq!(mem.ptr as usize % (1 << 12), 0);
    }
}
