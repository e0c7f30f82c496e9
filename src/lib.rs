//! A lock-free, size-segregated block allocator.
//!
//! Three layers, leaves first: [`backing`] wraps raw OS virtual memory for
//! oversize requests, [`bucket`] is a single fixed-capacity free list
//! protected from ABA by a tagged index packed into one `AtomicU64`, and
//! [`allocator`] ties a schedule of buckets together with size-class
//! routing and promotion-on-exhaustion.
//!
//! ```
//! use slaballoc::allocator::{BucketAllocator, BucketAllocatorConfig};
//!
//! let pool = BucketAllocator::new(BucketAllocatorConfig::production(20, 65536)).unwrap();
//! let p = pool.alloc(48, 8).unwrap();
//! pool.free(p);
//! ```

pub mod allocator;
pub mod backing;
pub mod bucket;
#[cfg(feature = "diagnostics")]
pub mod diagnostics;
pub mod error;
pub mod size_class;
pub mod traits;
pub mod utils;

pub use allocator::{BucketAllocator, BucketAllocatorConfig};
pub use bucket::RuntimeProfile;
pub use error::{AllocError, AllocErrorKind, AllocResult};
pub use traits::{Allocator, BulkAllocator, MemoryUsage, Resettable, ThreadSafeAllocator};
