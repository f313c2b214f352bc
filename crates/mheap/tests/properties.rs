//! Property-based tests for the heap engine and the manager.
//!
//! Random alloc/free traffic is replayed against a heap while a shadow model
//! tracks the live blocks; the free-list invariants and the byte accounting
//! are checked after every step.

use mheap::{
    FitStrategy, Heap, HeapAddr, HeapConfig, HeapManager,
    address::HEADER_ALIGNMENT,
};
use proptest::prelude::*;

const SLOTS: usize = 16;
const HEAP_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy)]
struct Op {
    slot: usize,
    size: usize,
    align: usize,
}

fn op() -> impl Strategy<Value = Op> {
    (0..SLOTS, 0_usize..1024, 1_usize..=8).prop_map(|(slot, size, align)| Op {
        slot,
        size,
        align: align * HEADER_ALIGNMENT,
    })
}

fn strategy() -> impl Strategy<Value = FitStrategy> {
    prop_oneof![Just(FitStrategy::FirstFit), Just(FitStrategy::BestFit)]
}

#[derive(Debug, Clone, Copy)]
struct Live {
    addr: HeapAddr,
    size: usize,
    fill: u8,
}

fn new_heap(strategy: FitStrategy) -> Heap {
    Heap::new("prop", vec![0; HEAP_SIZE].into_boxed_slice())
        .unwrap()
        .with_strategy(strategy)
}

fn occupied(heap: &Heap, slots: &[Option<Live>]) -> usize {
    slots
        .iter()
        .flatten()
        .map(|live| heap.occupied_size(live.addr).unwrap())
        .sum()
}

/// Smallest fitting fragment, first in address order on ties.
fn best_fit_addr(heap: &Heap, size: usize) -> Option<HeapAddr> {
    let span = HEADER_ALIGNMENT + size.max(16).next_multiple_of(HEADER_ALIGNMENT);
    heap.fragments()
        .map(Result::unwrap)
        .filter(|fragment| fragment.size() >= span)
        .fold(None, |best: Option<(HeapAddr, usize)>, fragment| match best {
            Some((_, best_size)) if best_size <= fragment.size() => best,
            _ => Some((fragment.addr(), fragment.size())),
        })
        .map(|(addr, _)| addr)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Live blocks stay aligned and intact, and the free list stays sound.
    #[test]
    fn heap_conserves_bytes(strategy in strategy(), ops in prop::collection::vec(op(), 1..200)) {
        let mut heap = new_heap(strategy);
        let usable = heap.usable_size();
        let mut slots = [None::<Live>; SLOTS];

        for (step, op) in ops.iter().enumerate() {
            match slots[op.slot].take() {
                None => {
                    if let Ok(addr) = heap.alloc(op.size, op.align) {
                        prop_assert!(addr.is_aligned(op.align));
                        let fill = u8::try_from(step % 251).unwrap();
                        heap.payload_mut(addr, op.size).unwrap().fill(fill);
                        slots[op.slot] = Some(Live { addr, size: op.size, fill });
                    }
                }
                Some(live) => {
                    let payload = heap.payload(live.addr, live.size).unwrap();
                    prop_assert!(payload.iter().all(|&b| b == live.fill));
                    heap.free(live.addr).unwrap();
                }
            }

            heap.check_invariants().unwrap();
            prop_assert!(heap.valid_heap());
            prop_assert_eq!(heap.free_bytes() + occupied(&heap, &slots), usable);
        }

        for live in slots.iter().flatten() {
            heap.free(live.addr).unwrap();
        }
        prop_assert_eq!(heap.fragment_count(), 1);
        prop_assert_eq!(heap.free_bytes(), usable);
    }

    /// Best-fit serves a request from the smallest fragment that can hold it.
    #[test]
    fn best_fit_is_optimal(
        ops in prop::collection::vec(op(), 1..100),
        request in 0_usize..512,
    ) {
        let mut heap = new_heap(FitStrategy::BestFit);
        let mut slots = [None::<HeapAddr>; SLOTS];
        for op in &ops {
            match slots[op.slot].take() {
                None => slots[op.slot] = heap.alloc(op.size, HEADER_ALIGNMENT).ok(),
                Some(addr) => heap.free(addr).unwrap(),
            }
        }

        let expected = best_fit_addr(&heap, request);
        let got = heap.alloc(request, HEADER_ALIGNMENT).ok();
        prop_assert_eq!(
            got.map(|addr| addr.value() - HEADER_ALIGNMENT),
            expected.map(HeapAddr::value)
        );
    }

    /// Freeing two neighbours in either order yields the same free list.
    #[test]
    fn coalescing_is_commutative(first in 0_usize..512, second in 0_usize..512) {
        let spans = |swap: bool| {
            let mut heap = new_heap(FitStrategy::FirstFit);
            let a = heap.alloc(first, HEADER_ALIGNMENT).unwrap();
            let b = heap.alloc(second, HEADER_ALIGNMENT).unwrap();
            let _guard = heap.alloc(16, HEADER_ALIGNMENT).unwrap();
            let (x, y) = if swap { (b, a) } else { (a, b) };
            heap.free(x).unwrap();
            heap.free(y).unwrap();
            heap.fragments()
                .map(|fragment| fragment.map(|f| (f.addr().value() - heap.base().value(), f.size())).unwrap())
                .collect::<Vec<_>>()
        };
        prop_assert_eq!(spans(false), spans(true));
    }

    /// Every live allocation is attributed to the heap that served it.
    #[test]
    fn manager_finds_owner(ops in prop::collection::vec((0_usize..3, 0_usize..512), 1..64)) {
        let configs = [
            HeapConfig::new("a", 8 * 1024),
            HeapConfig::new("b", 8 * 1024),
            HeapConfig::new("c", 8 * 1024),
        ];
        let mut manager: HeapManager = HeapManager::new(&configs).unwrap();
        let mut live = Vec::new();
        for &(heap, size) in &ops {
            manager.use_heap(heap).unwrap();
            if let Ok(addr) = manager.alloc(size, HEADER_ALIGNMENT) {
                live.push((heap, addr));
            }
        }

        for &(heap, addr) in &live {
            prop_assert_eq!(manager.find_heap(addr), Some(heap));
        }

        manager.use_heap(1).unwrap();
        for &(heap, addr) in live.iter().rev() {
            manager.free(addr).unwrap();
            prop_assert_eq!(manager.last_owner(), heap);
            prop_assert_eq!(manager.active(), 1);
        }
        for heap in manager.heaps() {
            prop_assert_eq!(heap.fragment_count(), 1);
            prop_assert_eq!(heap.free_bytes(), heap.usable_size());
        }
    }
}
