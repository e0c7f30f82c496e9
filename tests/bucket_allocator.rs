//! Integration tests exercising `BucketAllocator` end-to-end.

use slaballoc::allocator::{BucketAllocator, BucketAllocatorConfig};

fn allocator() -> BucketAllocator {
    BucketAllocator::new(BucketAllocatorConfig::production(20, 65536)).unwrap()
}

#[test]
fn single_thread_survives_a_million_alloc_free_cycles() {
    let a = allocator();
    for i in 0..1_000_000u32 {
        let p = a.alloc(24, 8).unwrap();
        unsafe { core::ptr::write_bytes(p as *mut u8, (i % 256) as u8, 24) };
        a.free(p);
    }
}

#[test]
fn four_threads_interleave_a_hundred_thousand_pairs_without_aliasing() {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::thread;

    let a = Arc::new(allocator());
    let live = Arc::new(Mutex::new(HashSet::new()));
    let mut handles = vec![];

    for _ in 0..4 {
        let a = Arc::clone(&a);
        let live = Arc::clone(&live);
        handles.push(thread::spawn(move || {
            for _ in 0..25_000 {
                let p = a.alloc(24, 8).unwrap();
                assert!(live.lock().unwrap().insert(p), "aliased pointer {p}");
                a.free(p);
                live.lock().unwrap().remove(&p);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert!(live.lock().unwrap().is_empty());
}

#[test]
fn realloc_preserves_leading_bytes_across_a_growth() {
    let a = allocator();
    let p = a.alloc(32, 16).unwrap();
    unsafe { core::ptr::write_bytes(p as *mut u8, 0xAB, 32) };

    let q = a.realloc(p, 64, 16).unwrap();
    for i in 0..32 {
        assert_eq!(unsafe { *((q as *const u8).add(i)) }, 0xAB);
    }
    a.free(q);
}

#[test]
fn zero_size_allocation_is_a_non_dereferenceable_sentinel() {
    let a = allocator();
    let p = a.alloc(0, 64).unwrap();
    assert_eq!(p, 64);
    assert!(!BucketAllocator::is_readable(p));

    a.free(p);
    let r = a.realloc(p, 16, 16).unwrap();
    assert!(BucketAllocator::is_readable(r));
    a.free(r);
}

#[test]
fn pathological_promotion_across_several_buckets() {
    let a = allocator();
    let mut ptrs = vec![];
    // bucket for 48+8=56 bytes is a small 8-aligned class; exhaust it and
    // its promotion chain and confirm every returned pointer is usable and
    // 8-byte aligned regardless of which bucket served it.
    for _ in 0..20_000 {
        let p = a.alloc(48, 8).unwrap();
        assert_eq!(p % 8, 0);
        ptrs.push(p);
    }
    for p in ptrs {
        a.free(p);
    }
}

#[test]
fn oversize_allocation_round_trips_through_the_backing_allocator() {
    let a = allocator();
    let p = a.alloc(2 * 65536, 4096).unwrap();
    assert_eq!(p % 4096, 0);
    unsafe { core::ptr::write_bytes(p as *mut u8, 0x77, 2 * 65536) };
    a.free(p);
}

#[test]
fn every_alignment_class_is_honored() {
    let a = allocator();
    for &align in &[4u32, 8, 16, 32, 64, 128, 256, 512, 1024, 4096] {
        let p = a.alloc(64, align).unwrap();
        assert_eq!(p % align as usize, 0, "align {align} not honored");
        a.free(p);
    }
}
