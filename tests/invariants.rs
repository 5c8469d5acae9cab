//! Property tests: heap invariants hold after any sequence of public operations.

use cma_heap::{AllocFlags, Allocation, HeapConfig, RangePool, ResizableHeap};
use proptest::prelude::*;
use std::sync::Arc;

const BASE: u64 = 0x1000_0000;
// Five chunks, the last one half-sized.
const POOL: u64 = 0x48_0000;
const CHUNK: u64 = 0x10_0000;
const UNIT: u64 = 0x1000;

#[derive(Debug, Clone)]
enum Op {
    Allocate { size: u64, exact: bool },
    Pages { count: usize },
    Release { index: usize },
    SetFloor { bytes: u64 },
    Shrink,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u64..0x18_0000, any::<bool>()).prop_map(|(size, exact)| Op::Allocate { size, exact }),
        1 => (1usize..64).prop_map(|count| Op::Pages { count }),
        4 => any::<usize>().prop_map(|index| Op::Release { index }),
        1 => (0u64..=POOL).prop_map(|bytes| Op::SetFloor { bytes }),
        1 => Just(Op::Shrink),
    ]
}

fn check_invariants(heap: &ResizableHeap) {
    let stats = heap.stats();
    let (_, reservable) = heap.bitmap_usage();

    // Reserved bits stay below the reservable bound.
    if let Some(highest) = heap.highest_reserved_unit() {
        assert!(highest < reservable, "unit {highest} >= {reservable}");
    }

    // The window is a whole run of chunks.
    if stats.curr_len > 0 {
        let offset = stats.curr_base - stats.pool_base;
        assert_eq!(offset % CHUNK, 0);
        let reaches_end = stats.curr_base + stats.curr_len == stats.pool_base + stats.pool_len;
        assert!(reaches_end || stats.curr_len % CHUNK == 0);
        assert_eq!(reservable as u64, (offset + stats.curr_len) / UNIT);
    } else {
        assert_eq!(reservable, 0);
    }

    assert!(stats.curr_used <= stats.curr_len);
    assert!(stats.curr_len <= stats.pool_len);
    assert!(stats.floor_size <= stats.pool_len);
    assert!(stats.curr_len >= stats.floor_size);
}

proptest! {
    #[test]
    fn test_invariants_hold(ops in prop::collection::vec(op(), 1..60)) {
        let pool = Arc::new(RangePool::new(BASE, POOL));
        let heap = ResizableHeap::declare(
            HeapConfig::new("prop").chunk_size(CHUNK).inline_shrink(),
            pool.clone(),
            None,
        )
        .unwrap();
        let mut live: Vec<Allocation> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate { size, exact } => {
                    let flags = if exact { AllocFlags::new().exact_size() } else { AllocFlags::new() };
                    if let Ok(alloc) = heap.allocate(size, flags) {
                        live.push(alloc);
                    }
                }
                Op::Pages { count } => {
                    if let Ok(alloc) = heap.allocate_pages(count, AllocFlags::new()) {
                        prop_assert_eq!(alloc.pages().len(), count);
                        live.push(alloc);
                    }
                }
                Op::Release { index } => {
                    if !live.is_empty() {
                        let alloc = live.swap_remove(index % live.len());
                        prop_assert!(heap.release(&alloc).is_ok());
                    }
                }
                Op::SetFloor { bytes } => {
                    let before = heap.stats().floor_size;
                    if heap.set_floor(bytes).is_err() {
                        prop_assert_eq!(heap.stats().floor_size, before);
                    }
                }
                Op::Shrink => {
                    let _ = heap.shrink_now();
                }
            }
            check_invariants(&heap);
        }

        let used: u64 = live.iter().map(|a| a.size).sum();
        prop_assert_eq!(heap.stats().curr_used, used);

        // Releasing everything with no floor gives every chunk back.
        heap.set_floor(0).unwrap();
        for alloc in live.drain(..) {
            prop_assert!(heap.release(&alloc).is_ok());
        }
        let stats = heap.stats();
        prop_assert_eq!(stats.curr_used, 0);
        prop_assert_eq!(stats.curr_len, 0);
        prop_assert_eq!(pool.occupied_bytes(), 0);
    }
}
