//! End-to-end allocation scenarios, driven through the public
//! `GlobalAlloc` surface with the heap checker running behind them.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::MaybeUninit;
use segalloc::sbrk::FixedBreak;
use segalloc::Allocator;

fn allocator(capacity: usize) -> Allocator<FixedBreak<'static>> {
    let arena = Box::leak(vec![MaybeUninit::uninit(); capacity].into_boxed_slice());
    Allocator::new(FixedBreak::new(arena))
}

fn alloc(a: &Allocator<FixedBreak<'_>>, len: usize) -> *mut u8 {
    unsafe { a.alloc(Layout::from_size_align(len, 1).unwrap()) }
}

fn free(a: &Allocator<FixedBreak<'_>>, ptr: *mut u8, len: usize) {
    unsafe { a.dealloc(ptr, Layout::from_size_align(len, 1).unwrap()) }
}

#[test]
fn zero_sized_requests_return_null() {
    let a = allocator(256);
    assert!(alloc(&a, 0).is_null());
    a.check_heap(false);
}

#[test]
fn freeing_null_is_a_noop() {
    let a = allocator(256);
    free(&a, core::ptr::null_mut(), 16);
    a.check_heap(false);
}

#[test]
fn freed_blocks_are_reused_lifo() {
    let a = allocator(512);
    let p = alloc(&a, 24);
    assert!(!p.is_null());
    free(&a, p, 24);

    let q = alloc(&a, 24);
    assert_eq!(q, p);
    a.check_heap(false);
}

#[test]
fn two_neighbors_merge_into_one_block() {
    let a = allocator(1024);
    let x = alloc(&a, 32);
    let y = alloc(&a, 32);
    free(&a, x, 32);
    free(&a, y, 32);
    a.check_heap(false);

    // both 48-byte blocks fused: a 92-byte request fits the merged 96-byte
    // block exactly and lands on the first address again
    let q = alloc(&a, 92);
    assert_eq!(q, x);
    a.check_heap(false);
}

#[test]
fn scattered_frees_merge_into_one_block() {
    let a = allocator(1024);
    let x = alloc(&a, 32);
    let y = alloc(&a, 32);
    let z = alloc(&a, 32);
    free(&a, x, 32);
    free(&a, z, 32);
    // the middle free bridges the two ends
    free(&a, y, 32);
    a.check_heap(false);

    let q = alloc(&a, 140);
    assert_eq!(q, x);
    a.check_heap(false);
}

#[test]
fn realloc_preserves_the_written_prefix() {
    let a = allocator(2048);
    let p = alloc(&a, 100);
    for i in 0..100 {
        unsafe { p.add(i).write(i as u8 ^ 0x5A) };
    }

    let q = unsafe { a.realloc(p, Layout::from_size_align(100, 1).unwrap(), 200) };
    assert!(!q.is_null());
    for i in 0..100 {
        assert_eq!(unsafe { q.add(i).read() }, i as u8 ^ 0x5A, "byte {i}");
    }
    a.check_heap(false);

    // the old block was freed: an equal request gets it back
    let r = alloc(&a, 100);
    assert_eq!(r, p);
}

#[test]
fn realloc_degenerate_forms() {
    let a = allocator(512);
    let layout = Layout::from_size_align(24, 1).unwrap();

    // null pointer: allocates
    let p = unsafe { a.realloc(core::ptr::null_mut(), layout, 24) };
    assert!(!p.is_null());

    // zero size: frees
    let q = unsafe { a.realloc(p, layout, 0) };
    assert!(q.is_null());
    a.check_heap(false);
    assert_eq!(alloc(&a, 24), p);
}

#[test]
fn calloc_returns_zeroed_memory() {
    let a = allocator(1024);
    // litter the heap first so the zeroing is observable
    let p = alloc(&a, 160);
    for i in 0..160 {
        unsafe { p.add(i).write(0xFF) };
    }
    free(&a, p, 160);

    let q = a.calloc(10, 16);
    assert!(!q.is_null());
    for i in 0..160 {
        assert_eq!(unsafe { q.add(i).read() }, 0, "byte {i}");
    }
    a.check_heap(false);
}

#[test]
fn calloc_refuses_overflowing_products() {
    let a = allocator(256);
    assert!(a.calloc(usize::MAX, 2).is_null());
    assert!(a.calloc(1 << 48, 1 << 48).is_null());
    a.check_heap(false);
}

#[test]
fn one_byte_allocations_get_minimum_blocks() {
    let a = allocator(256);
    let p = alloc(&a, 1);
    let q = alloc(&a, 1);
    assert_eq!(q as usize - p as usize, 16);
    a.check_heap(false);
}

#[test]
fn splitting_kicks_in_one_quantum_above_the_fit() {
    let a = allocator(1024);
    let p = alloc(&a, 60); // a 64-byte block
    let seal = alloc(&a, 12);
    free(&a, p, 60);

    // 44 bytes round to a 48-byte block: the 64-byte block splits and the
    // 16-byte remainder serves the next small request
    let r = alloc(&a, 44);
    assert_eq!(r, p);
    let s = alloc(&a, 1);
    assert_eq!(s as usize, p as usize + 48);
    a.check_heap(false);

    free(&a, r, 44);
    free(&a, s, 1);
    a.check_heap(false);

    // 48 bytes round to 64: an exact fit, nothing is carved off, so a
    // fresh small request has to come from the heap top instead
    let r = alloc(&a, 48);
    assert_eq!(r, p);
    let s = alloc(&a, 1);
    assert!(s as usize > seal as usize);
    a.check_heap(false);
}

#[test]
fn sequential_allocations_grow_monotonically() {
    let a = allocator(1000 * 64 + 256);
    let mut previous: Option<usize> = None;
    for _ in 0..1000 {
        let p = alloc(&a, 48) as usize;
        assert_ne!(p, 0);
        assert_eq!(p % 16, 0);
        if let Some(previous) = previous {
            // every 48-byte request occupies one 64-byte block, back to
            // back: header word plus payload, rounded to the quantum
            assert_eq!(p - previous, 64);
        }
        previous = Some(p);
    }
    a.check_heap(false);
}

#[test]
fn exhaustion_is_survivable() {
    let a = allocator(128);
    assert!(alloc(&a, 4096).is_null());
    a.check_heap(false);

    let p = alloc(&a, 16);
    assert!(!p.is_null());
    assert!(alloc(&a, 4096).is_null());
    free(&a, p, 16);
    a.check_heap(false);
    assert_eq!(alloc(&a, 16), p);
}
