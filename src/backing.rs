//! The backing allocator: a headered wrapper over raw OS virtual memory.
//!
//! Used both to service oversize requests that don't fit any pool bucket
//! and to carve out the contiguous buffer a [`crate::allocator::BucketAllocator`]
//! hands out to its buckets.

use core::alloc::Layout;
use core::mem::size_of;
use core::ptr::NonNull;

// `map_pages`/`unmap_pages` below go through `libc`, which is only pulled
// in by the `std` feature (see Cargo.toml). There is no OS-virtual-memory
// path that works without it.
#[cfg(not(feature = "std"))]
compile_error!("the `backing` module requires the `std` feature (mmap/munmap via libc)");

use crate::error::{AllocError, AllocResult};
use crate::size_class::{validate_alignment, MIN_VALID_ALIGNMENT};
use crate::traits::{Allocator, BulkAllocator, MemoryUsage, ThreadSafeAllocator};

/// Recorded immediately before every pointer this allocator hands out.
#[repr(C)]
struct Header {
    base: usize,
    size: u32,
    offset: u32,
}

const HEADER_SIZE: usize = size_of::<Header>();

/// Thin wrapper over `mmap`/`munmap` that pads every allocation with a
/// [`Header`] so arbitrary alignments and exact sizes can be recovered on
/// free and realloc.
///
/// Stateless beyond what the OS itself tracks: every operation maps
/// directly onto a syscall, so this type is `Copy` and trivially
/// `Send + Sync`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackingAllocator;

impl BackingAllocator {
    pub const fn new() -> Self {
        Self
    }

    /// Raw byte-oriented entry point matching this crate's external ABI
    /// (see `lib.rs`'s top-level `alloc`/`free`/`realloc`).
    pub fn alloc_raw(&self, bytes_count: u32, align: u32) -> AllocResult<NonNull<u8>> {
        let align = align.max(MIN_VALID_ALIGNMENT);
        let offset = align - 1 + HEADER_SIZE as u32;
        let total = bytes_count
            .checked_add(offset)
            .ok_or_else(AllocError::bucket_exhausted)? as usize;

        let base = match unsafe { map_pages(total) } {
            Some(base) => base,
            None => {
                // OS virtual memory exhaustion is fatal: log it, then take
                // the process down rather than hand the caller a `Result`
                // that invites a retry the OS already refused.
                let layout = Layout::from_size_align(total, align as usize).unwrap();
                let err = AllocError::out_of_memory(layout);
                debug_assert!(err.is_fatal(), "OOM must be classified as a fatal AllocErrorKind");
                #[cfg(feature = "logging")]
                tracing::error!(error = %err, "OS virtual memory allocation failed, aborting");
                #[cfg(not(feature = "logging"))]
                let _ = &err;
                panic!("{err}");
            }
        };

        let user_addr = (base.as_ptr() as usize + offset as usize) & !(align as usize - 1);
        let header_addr = user_addr - HEADER_SIZE;
        unsafe {
            let header = header_addr as *mut Header;
            header.write(Header {
                base: base.as_ptr() as usize,
                size: bytes_count,
                offset,
            });
        }

        #[cfg(feature = "logging")]
        tracing::trace!(bytes_count, align, "backing allocator served request");

        Ok(unsafe { NonNull::new_unchecked(user_addr as *mut u8) })
    }

    pub fn free_raw(&self, p: Option<NonNull<u8>>) {
        let Some(p) = p else { return };
        unsafe {
            let header = (p.as_ptr() as usize - HEADER_SIZE) as *const Header;
            let header = header.read();
            let total = header.size as usize + header.offset as usize;
            unmap_pages(header.base as *mut u8, total);
        }
    }

    /// Reallocates, returning the new pointer. The Go ancestor this crate
    /// generalizes from discarded this return value on every call, a bug
    /// this implementation fixes by returning it.
    pub fn realloc_raw(
        &self,
        p: Option<NonNull<u8>>,
        size: u32,
        align: u32,
    ) -> AllocResult<Option<NonNull<u8>>> {
        let new_ptr = self.alloc_raw(size, align)?;

        if let Some(old) = p {
            unsafe {
                let header = (old.as_ptr() as usize - HEADER_SIZE) as *const Header;
                let old_size = header.read().size;
                let copy_len = old_size.min(size) as usize;
                core::ptr::copy_nonoverlapping(old.as_ptr(), new_ptr.as_ptr(), copy_len);
            }
            self.free_raw(Some(old));
        }

        Ok(Some(new_ptr))
    }

    /// Usable space recorded for a pointer previously returned by this
    /// allocator (the exact `bytes_count` the caller originally requested).
    pub fn usable_space(&self, p: NonNull<u8>) -> u32 {
        unsafe { ((p.as_ptr() as usize - HEADER_SIZE) as *const Header).read().size }
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(unix, feature = "std"))] {
        unsafe fn map_pages(len: usize) -> Option<NonNull<u8>> {
            if len == 0 {
                return None;
            }
            let ptr = libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                None
            } else {
                NonNull::new(ptr as *mut u8)
            }
        }

        unsafe fn unmap_pages(ptr: *mut u8, len: usize) {
            if !ptr.is_null() && len > 0 {
                libc::munmap(ptr as *mut libc::c_void, len);
            }
        }
    } else if #[cfg(feature = "std")] {
        unsafe fn map_pages(len: usize) -> Option<NonNull<u8>> {
            use std::alloc::alloc;
            if len == 0 {
                return None;
            }
            let layout = Layout::from_size_align(len, crate::utils::page_size()).ok()?;
            NonNull::new(alloc(layout))
        }

        unsafe fn unmap_pages(ptr: *mut u8, len: usize) {
            use std::alloc::dealloc;
            if !ptr.is_null() && len > 0 {
                if let Ok(layout) = Layout::from_size_align(len, crate::utils::page_size()) {
                    dealloc(ptr, layout);
                }
            }
        }
    }
}

unsafe impl Allocator for BackingAllocator {
    unsafe fn allocate(&self, layout: Layout) -> AllocResult<NonNull<[u8]>> {
        let align = validate_alignment(layout.align() as u32)?;
        let ptr = self.alloc_raw(layout.size() as u32, align)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        self.free_raw(Some(ptr));
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        _old_layout: Layout,
        new_layout: Layout,
    ) -> AllocResult<NonNull<[u8]>> {
        let align = validate_alignment(new_layout.align() as u32)?;
        match self.realloc_raw(Some(ptr), new_layout.size() as u32, align)? {
            Some(p) => Ok(NonNull::slice_from_raw_parts(p, new_layout.size())),
            None => Err(AllocError::unknown_pointer()),
        }
    }
}

unsafe impl BulkAllocator for BackingAllocator {}
unsafe impl ThreadSafeAllocator for BackingAllocator {}

impl MemoryUsage for BackingAllocator {
    fn used_memory(&self) -> usize {
        0
    }
    fn available_memory(&self) -> Option<usize> {
        None
    }
    fn total_memory(&self) -> Option<usize> {
        None
    }
}

unsafe impl Send for BackingAllocator {}
unsafe impl Sync for BackingAllocator {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_simple_allocation() {
        let backing = BackingAllocator::new();
        let p = backing.alloc_raw(128, 16).unwrap();
        assert_eq!(p.as_ptr() as usize % 16, 0);
        unsafe {
            core::ptr::write_bytes(p.as_ptr(), 0xAB, 128);
            assert_eq!(*p.as_ptr(), 0xAB);
        }
        backing.free_raw(Some(p));
    }

    #[test]
    fn free_of_null_is_a_no_op() {
        let backing = BackingAllocator::new();
        backing.free_raw(None);
    }

    #[test]
    fn realloc_preserves_leading_bytes_and_returns_new_pointer() {
        let backing = BackingAllocator::new();
        let p = backing.alloc_raw(32, 8).unwrap();
        unsafe { core::ptr::write_bytes(p.as_ptr(), 0xCD, 32) };

        let q = backing.realloc_raw(Some(p), 64, 8).unwrap().unwrap();
        unsafe {
            for i in 0..32 {
                assert_eq!(*q.as_ptr().add(i), 0xCD);
            }
        }
        backing.free_raw(Some(q));
    }

    #[test]
    fn respects_large_alignment() {
        let backing = BackingAllocator::new();
        let p = backing.alloc_raw(64, 4096).unwrap();
        assert_eq!(p.as_ptr() as usize % 4096, 0);
        backing.free_raw(Some(p));
    }
}
