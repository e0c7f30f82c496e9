//! The idiomatic Rust allocator surface: `Layout`-based traits layered on
//! top of the crate's raw `alloc(bytes, align)` / `free(ptr)` ABI.

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::error::AllocResult;

/// Checks that `layout`'s alignment is a power of two and that its size
/// does not overflow when padded to that alignment.
pub fn validate_layout(layout: Layout) -> AllocResult<()> {
    crate::size_class::validate_alignment(layout.align() as u32)?;
    Ok(())
}

/// A `Layout`-based allocator, analogous to the (still-unstable) standard
/// library `Allocator` trait.
///
/// # Safety
/// Implementors must return memory that is valid for `layout.size()` bytes
/// and aligned to `layout.align()`, and must not alias any other live
/// allocation. Callers must pass to `deallocate`/`grow`/`shrink` exactly
/// the layout that was used to allocate the block.
pub unsafe trait Allocator {
    unsafe fn allocate(&self, layout: Layout) -> AllocResult<NonNull<[u8]>>;
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);

    fn max_allocation_size(&self) -> usize {
        isize::MAX as usize
    }

    fn supports_zero_sized_allocs(&self) -> bool {
        true
    }

    /// Default growth strategy: allocate new, copy, free old. Implementors
    /// whose storage can grow a block in place should override this.
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> AllocResult<NonNull<[u8]>> {
        let new_ptr = self.allocate(new_layout)?;
        let copy_len = old_layout.size().min(new_layout.size());
        if copy_len > 0 {
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr() as *mut u8, copy_len);
        }
        self.deallocate(ptr, old_layout);
        Ok(new_ptr)
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> AllocResult<NonNull<[u8]>> {
        debug_assert!(new_layout.size() >= old_layout.size());
        self.reallocate(ptr, old_layout, new_layout)
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> AllocResult<NonNull<[u8]>> {
        debug_assert!(new_layout.size() <= old_layout.size());
        self.reallocate(ptr, old_layout, new_layout)
    }
}

/// Marker for allocators whose `Allocator` impl is safe to share across
/// threads without external synchronization.
///
/// # Safety
/// Implementors must actually be `Send + Sync` and every `Allocator`
/// method must be safe to call concurrently from multiple threads.
pub unsafe trait ThreadSafeAllocator: Allocator + Send + Sync {}

/// Optional bulk-allocation extension for contiguous runs of identically
/// laid out elements. Default implementations simply multiply the size.
///
/// # Safety
/// Same obligations as [`Allocator`], extended to the whole contiguous run.
pub unsafe trait BulkAllocator: Allocator {
    unsafe fn allocate_contiguous(&self, layout: Layout, count: usize) -> AllocResult<NonNull<[u8]>> {
        let total = layout
            .size()
            .checked_mul(count)
            .ok_or_else(crate::error::AllocError::bucket_exhausted)?;
        let full_layout = Layout::from_size_align(total, layout.align())
            .map_err(|_| crate::error::AllocError::invalid_layout(layout))?;
        self.allocate(full_layout)
    }

    unsafe fn deallocate_contiguous(&self, ptr: NonNull<u8>, layout: Layout, count: usize) {
        let total = layout.size().saturating_mul(count);
        if let Ok(full_layout) = Layout::from_size_align(total, layout.align()) {
            self.deallocate(ptr, full_layout);
        }
    }
}

/// Reports how much memory an allocator has handed out, if it tracks that.
pub trait MemoryUsage {
    fn used_memory(&self) -> usize;
    fn available_memory(&self) -> Option<usize>;
    fn total_memory(&self) -> Option<usize>;

    fn memory_usage_percent(&self) -> Option<f32> {
        match (self.used_memory(), self.total_memory()) {
            (used, Some(total)) if total > 0 => Some(used as f32 / total as f32 * 100.0),
            _ => None,
        }
    }

    fn is_memory_pressure(&self, threshold_percent: f32) -> bool {
        self.memory_usage_percent()
            .map(|p| p >= threshold_percent)
            .unwrap_or(false)
    }
}

/// RAII guard returned by [`Resettable::reset_guard`]; resets the
/// allocator when dropped.
pub struct ResetGuard<'a, A: Resettable> {
    allocator: &'a A,
}

impl<'a, A: Resettable> Drop for ResetGuard<'a, A> {
    fn drop(&mut self) {
        self.allocator.reset();
    }
}

/// An allocator that can release every allocation it has ever made back to
/// its initial state in one operation.
///
/// Bucket allocators and pool buckets implement this by relinking their
/// free lists from scratch; it does not free memory back to the OS.
pub trait Resettable {
    fn reset(&self);

    fn can_reset(&self) -> bool {
        true
    }

    fn reset_guard(&self) -> ResetGuard<'_, Self>
    where
        Self: Sized,
    {
        ResetGuard { allocator: self }
    }
}
