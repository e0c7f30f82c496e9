//! Bucket Allocator: routes requests across a schedule of pool buckets and
//! falls back to the backing allocator for anything that doesn't fit.

use core::alloc::Layout;
use core::mem::size_of;
use core::ptr::NonNull;

use crate::backing::BackingAllocator;
use crate::bucket::{PoolBucket, RuntimeProfile};
use crate::error::{AllocError, AllocErrorKind, AllocResult};
use crate::size_class::{
    self, SizeClassStrategy, MAX_BUCKETS, MAX_VALID_ALIGNMENT, MIN_VALID_ALIGNMENT,
};
use crate::traits::{Allocator, MemoryUsage, Resettable, ThreadSafeAllocator};
use crate::utils::page_size;

const HEADER_SIZE: u32 = size_of::<u64>() as u32;
/// How many larger buckets `alloc` will try before falling back to the
/// backing allocator, bounding worst-case promotion latency.
const MAX_PROMOTION_STEPS: u32 = 4;

/// Construction parameters for a [`BucketAllocator`].
///
/// Whether the allocation-site record map compiles in at all is decided by
/// this crate's `diagnostics` Cargo feature; `profile` decides whether a
/// binary built with it turned on actually records sites and fills cells
/// with canary bytes at a given moment.
#[derive(Debug, Clone, Copy)]
pub struct BucketAllocatorConfig {
    pub bucket_count: u32,
    pub bucket_bytes: u32,
    pub strategy: SizeClassStrategy,
    pub profile: RuntimeProfile,
}

impl BucketAllocatorConfig {
    pub const fn new(bucket_count: u32, bucket_bytes: u32) -> Self {
        Self {
            bucket_count,
            bucket_bytes,
            strategy: SizeClassStrategy::PiecewiseLinear,
            profile: RuntimeProfile::production(),
        }
    }

    /// Diagnostics and fill patterns off: every cycle goes to serving
    /// allocations.
    pub const fn production(bucket_count: u32, bucket_bytes: u32) -> Self {
        Self::new(bucket_count, bucket_bytes)
    }

    /// Diagnostics on, cells filled with canary patterns on alloc and free.
    pub const fn debug(bucket_count: u32, bucket_bytes: u32) -> Self {
        Self {
            bucket_count,
            bucket_bytes,
            strategy: SizeClassStrategy::PiecewiseLinear,
            profile: RuntimeProfile::debug(),
        }
    }
}

/// A fixed array of [`PoolBucket`]s spanning the size-class schedule, a
/// shared buffer they're carved out of, and a [`BackingAllocator`] for
/// anything too large or too contended to service from the buckets.
pub struct BucketAllocator {
    buckets: Vec<PoolBucket>,
    bucket_bytes: u32,
    buffer: Box<[u8]>,
    buffer_begin: usize,
    buffer_end: usize,
    strategy: SizeClassStrategy,
    backing: BackingAllocator,
}

impl BucketAllocator {
    pub fn new(config: BucketAllocatorConfig) -> AllocResult<Self> {
        let bucket_count = config.bucket_count.min(MAX_BUCKETS).max(1);
        let bucket_bytes = size_class::align(config.bucket_bytes.max(1), page_size() as u32);

        let total_bytes = bucket_bytes as usize * bucket_count as usize;
        let mut buffer = vec![0u8; total_bytes].into_boxed_slice();
        let buffer_begin = buffer.as_mut_ptr() as usize;
        let buffer_end = buffer_begin + total_bytes;

        let mut buckets = Vec::with_capacity(bucket_count as usize);
        for i in 0..bucket_count {
            let cell_size = size_class::size_for_index(i, config.strategy)?;
            let slab_begin = (buffer_begin + i as usize * bucket_bytes as usize) as *mut u8;
            let capacity = bucket_bytes / cell_size;
            let bucket = unsafe {
                PoolBucket::from_raw_with_profile(
                    NonNull::new_unchecked(slab_begin),
                    cell_size,
                    capacity,
                    config.profile,
                )
            };
            buckets.push(bucket);
        }

        Ok(Self {
            buckets,
            bucket_bytes,
            buffer,
            buffer_begin,
            buffer_end,
            strategy: config.strategy,
            backing: BackingAllocator::new(),
        })
    }

    pub fn bucket_count(&self) -> u32 {
        self.buckets.len() as u32
    }

    pub fn bucket(&self, index: u32) -> Option<&PoolBucket> {
        self.buckets.get(index as usize)
    }

    /// Whether `p` is a real, dereferenceable pointer — i.e. not null and
    /// not the zero-size allocation sentinel.
    pub fn is_readable(p: usize) -> bool {
        p > MAX_VALID_ALIGNMENT as usize
    }

    fn find_bucket_for_cell(&self, cell_addr: usize) -> Option<u32> {
        if cell_addr < self.buffer_begin || cell_addr >= self.buffer_end {
            return None;
        }
        Some(((cell_addr - self.buffer_begin) / self.bucket_bytes as usize) as u32)
    }

    /// Services `bytes_count` bytes at `align`. `bytes_count == 0` returns
    /// the non-dereferenceable sentinel pointer equal to `align`.
    pub fn alloc(&self, bytes_count: u32, align: u32) -> AllocResult<usize> {
        if bytes_count == 0 {
            let align = align.max(MIN_VALID_ALIGNMENT);
            return Ok(align as usize);
        }

        let align = size_class::validate_alignment(align)?;
        let padded = bytes_count
            .checked_add(HEADER_SIZE)
            .ok_or_else(AllocError::bucket_exhausted)?;
        let padded = size_class::align(padded, align);

        let mut bucket_index = size_class::index_for_size(padded, self.strategy);
        let max_index = self.bucket_count().min(bucket_index + MAX_PROMOTION_STEPS);

        let mut steps = 0;
        while bucket_index < max_index {
            if let Some(bucket) = self.buckets.get(bucket_index as usize) {
                if let Some(ptr) = bucket.alloc() {
                    return Ok(ptr.as_ptr() as usize);
                }
                #[cfg(feature = "logging")]
                tracing::trace!(bucket_index, "bucket exhausted, promoting");
            }

            steps += 1;
            if steps > MAX_PROMOTION_STEPS {
                break;
            }

            bucket_index += 1;
            while bucket_index < self.bucket_count() {
                let Ok(size) = size_class::size_for_index(bucket_index, self.strategy) else {
                    return Err(AllocError::new(AllocErrorKind::InvalidStrategy));
                };
                if crate::utils::is_aligned(size, align) {
                    break;
                }
                bucket_index += 1;
            }
        }

        #[cfg(feature = "logging")]
        tracing::debug!(bytes_count, align, "falling back to backing allocator");
        let ptr = self.backing.alloc_raw(padded, align)?;
        Ok(ptr.as_ptr() as usize)
    }

    pub fn free(&self, p: usize) {
        if !Self::is_readable(p) {
            return;
        }
        let cell_addr = p - HEADER_SIZE as usize;

        match self.find_bucket_for_cell(cell_addr) {
            Some(index) => {
                let bucket = &self.buckets[index as usize];
                let user_ptr = unsafe { NonNull::new_unchecked(p as *mut u8) };
                if let Err(e) = bucket.free(user_ptr) {
                    #[cfg(feature = "logging")]
                    tracing::warn!(error = %e, "free refused");
                    #[cfg(not(feature = "logging"))]
                    let _ = e;
                }
            }
            None => {
                let ptr = unsafe { NonNull::new_unchecked(p as *mut u8) };
                self.backing.free_raw(Some(ptr));
            }
        }
    }

    pub fn realloc(&self, p: usize, size: u32, align: u32) -> AllocResult<usize> {
        if !Self::is_readable(p) {
            return self.alloc(size, align);
        }
        if size == 0 {
            self.free(p);
            return Ok(0);
        }

        let cell_addr = p - HEADER_SIZE as usize;
        match self.find_bucket_for_cell(cell_addr) {
            Some(index) => {
                let bucket = &self.buckets[index as usize];
                // Compared against the bucket's actual cell size, not its
                // index — see DESIGN.md's note on this fast-path fix.
                if size + HEADER_SIZE <= bucket.cell_size() {
                    return Ok(p);
                }
                let new_ptr = self.alloc(size, align)?;
                let copy_len = bucket.cell_size() as usize - HEADER_SIZE as usize;
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        p as *const u8,
                        new_ptr as *mut u8,
                        copy_len.min(size as usize),
                    );
                }
                self.free(p);
                Ok(new_ptr)
            }
            None => {
                let ptr = unsafe { NonNull::new_unchecked(p as *mut u8) };
                match self.backing.realloc_raw(Some(ptr), size, align)? {
                    Some(p) => Ok(p.as_ptr() as usize),
                    None => Ok(0),
                }
            }
        }
    }
}

impl Resettable for BucketAllocator {
    fn reset(&self) {
        for bucket in &self.buckets {
            bucket.reset();
        }
    }
}

unsafe impl Allocator for BucketAllocator {
    unsafe fn allocate(&self, layout: Layout) -> AllocResult<NonNull<[u8]>> {
        let addr = self.alloc(layout.size() as u32, layout.align() as u32)?;
        let ptr = NonNull::new(addr as *mut u8).ok_or_else(AllocError::bucket_exhausted)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        self.free(ptr.as_ptr() as usize);
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        _old_layout: Layout,
        new_layout: Layout,
    ) -> AllocResult<NonNull<[u8]>> {
        let addr = self.realloc(
            ptr.as_ptr() as usize,
            new_layout.size() as u32,
            new_layout.align() as u32,
        )?;
        let ptr = NonNull::new(addr as *mut u8).ok_or_else(AllocError::bucket_exhausted)?;
        Ok(NonNull::slice_from_raw_parts(ptr, new_layout.size()))
    }
}

unsafe impl ThreadSafeAllocator for BucketAllocator {}
unsafe impl Send for BucketAllocator {}
unsafe impl Sync for BucketAllocator {}

impl MemoryUsage for BucketAllocator {
    fn used_memory(&self) -> usize {
        self.buckets.iter().map(|b| b.used_memory()).sum()
    }
    fn available_memory(&self) -> Option<usize> {
        Some(self.buckets.iter().filter_map(|b| b.available_memory()).sum())
    }
    fn total_memory(&self) -> Option<usize> {
        Some(self.buffer.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_allocator() -> BucketAllocator {
        BucketAllocator::new(BucketAllocatorConfig::new(20, 65536)).unwrap()
    }

    #[test]
    fn small_allocations_land_in_bucket_zero() {
        let a = small_allocator();
        let p = a.alloc(1, 4).unwrap();
        assert!(BucketAllocator::is_readable(p));
        a.free(p);
    }

    #[test]
    fn zero_size_alloc_returns_alignment_sentinel() {
        let a = small_allocator();
        let p = a.alloc(0, 64).unwrap();
        assert_eq!(p, 64);
        assert!(!BucketAllocator::is_readable(p));
        a.free(p); // no-op, must not panic
    }

    #[test]
    fn realloc_of_sentinel_behaves_like_alloc() {
        let a = small_allocator();
        let p = a.realloc(64, 32, 16).unwrap();
        assert!(BucketAllocator::is_readable(p));
        a.free(p);
    }

    #[test]
    fn realloc_to_zero_frees_and_returns_null() {
        let a = small_allocator();
        let p = a.alloc(32, 8).unwrap();
        let result = a.realloc(p, 0, 8).unwrap();
        assert_eq!(result, 0);
    }

    #[test]
    fn data_survives_a_growing_realloc() {
        let a = small_allocator();
        let p = a.alloc(32, 16).unwrap();
        unsafe { core::ptr::write_bytes(p as *mut u8, 0xAB, 32) };
        let q = a.realloc(p, 64, 16).unwrap();
        for i in 0..32 {
            assert_eq!(unsafe { *((q as *const u8).add(i)) }, 0xAB);
        }
        a.free(q);
    }

    #[test]
    fn oversize_requests_spill_to_backing_allocator() {
        let a = small_allocator();
        let p = a.alloc(200_000, 4096).unwrap();
        assert_eq!(p % 4096, 0);
        a.free(p);
    }

    #[test]
    fn exhausting_a_bucket_promotes_to_the_next() {
        let a = small_allocator();
        // cell_size for bucket 0 is 16, +8 header rounds to 24; capacity is
        // bucket_bytes / 24.
        let bucket0 = a.bucket(0).unwrap();
        let capacity = bucket0.capacity();
        let mut ptrs = vec![];
        for _ in 0..capacity {
            ptrs.push(a.alloc(8, 8).unwrap());
        }
        assert!(a.bucket(0).unwrap().is_full());
        let overflow = a.alloc(8, 8).unwrap();
        assert!(BucketAllocator::is_readable(overflow));
        for p in ptrs {
            a.free(p);
        }
        a.free(overflow);
    }

    #[test]
    fn debug_profile_fills_freed_cells_with_the_canary_pattern() {
        let a = BucketAllocator::new(BucketAllocatorConfig::debug(20, 65536)).unwrap();
        let p = a.alloc(24, 8).unwrap();
        unsafe { core::ptr::write_bytes(p as *mut u8, 0x11, 24) };
        a.free(p);
        assert_eq!(unsafe { *(p as *const u8) }, 0xFE);
    }

    #[test]
    fn concurrent_threads_never_alias_a_live_pointer() {
        use std::collections::HashSet;
        use std::sync::{Arc, Mutex};
        use std::thread;

        let allocator = Arc::new(small_allocator());
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = vec![];

        for _ in 0..4 {
            let allocator = Arc::clone(&allocator);
            let seen = Arc::clone(&seen);
            handles.push(thread::spawn(move || {
                for _ in 0..2_000 {
                    let p = allocator.alloc(24, 8).unwrap();
                    {
                        let mut guard = seen.lock().unwrap();
                        assert!(guard.insert(p), "pointer {p} handed out while already live");
                    }
                    unsafe { core::ptr::write_bytes(p as *mut u8, 0x11, 24) };
                    {
                        let mut guard = seen.lock().unwrap();
                        guard.remove(&p);
                    }
                    allocator.free(p);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
