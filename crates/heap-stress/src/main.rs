//! Randomized allocation traffic against a set of heaps.
//!
//! Every step picks a random size, heap and slot. An empty slot is filled
//! with a fresh allocation from the chosen heap; an occupied slot has its
//! contents verified and is freed through owner lookup. All heaps are
//! checked for consistency after each step, and must be back to their
//! initial state once every slot is released.

use std::{
    process,
    time::{SystemTime, UNIX_EPOCH},
};

use argh::FromArgs;
use mheap::{FitStrategy, HeapAddr, HeapConfig, HeapManager, address::HEADER_ALIGNMENT};
use snafu::{OptionExt as _, ResultExt as _, ensure_whatever};

use self::{
    log::LogLevel,
    report::{GenericError, Report},
    rng::XorShift64,
};

#[macro_use]
mod log;
mod report;
mod rng;

/// Drive random allocation traffic through a set of heaps.
#[derive(Debug, FromArgs)]
struct Args {
    /// number of heaps
    #[argh(option, default = "4")]
    heaps: usize,
    /// size of each heap in KiB
    #[argh(option, default = "16 * 1024")]
    heap_size_kib: usize,
    /// number of alloc/free steps
    #[argh(option, default = "10_000")]
    iterations: usize,
    /// largest allocation in bytes
    #[argh(option, default = "1024")]
    max_alloc: usize,
    /// number of live allocation slots
    #[argh(option, default = "64")]
    slots: usize,
    /// PRNG seed, taken from the clock when omitted
    #[argh(option)]
    seed: Option<u64>,
    /// fit strategy, `first-fit` or `best-fit`
    #[argh(option, default = "FitStrategy::BestFit")]
    strategy: FitStrategy,
    /// dump every heap each N steps (0 disables)
    #[argh(option, default = "0")]
    dump_every: usize,
    /// log every step
    #[argh(switch, short = 'v')]
    verbose: bool,
}

#[derive(Debug, Clone, Copy)]
struct Live {
    addr: HeapAddr,
    size: usize,
    fill: u8,
}

#[derive(Debug, Default)]
struct Stats {
    allocs: usize,
    frees: usize,
    out_of_memory: usize,
}

fn main() {
    let args: Args = argh::from_env();
    log::init(if args.verbose {
        LogLevel::Trace
    } else {
        LogLevel::Info
    });

    if let Err(err) = run(&args) {
        error!("stress run failed");
        let report = Report::new(err);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), GenericError> {
    ensure_whatever!(args.slots > 0, "--slots must be positive");
    ensure_whatever!(args.max_alloc > 0, "--max-alloc must be positive");
    let heap_size = args
        .heap_size_kib
        .checked_mul(1024)
        .whatever_context("--heap-size-kib is too large")?;

    let names: Vec<String> = (0..args.heaps).map(|index| format!("heap{index}")).collect();
    let configs: Vec<_> = names
        .iter()
        .map(|name| HeapConfig::new(name, heap_size).with_strategy(args.strategy))
        .collect();
    let mut manager: HeapManager =
        HeapManager::new(&configs).whatever_context("failed to create heaps")?;
    manager
        .use_heap(0)
        .whatever_context("failed to select the first heap")?;

    let seed = args.seed.unwrap_or_else(clock_seed);
    info!(
        "{} heaps of {heap_size} bytes, {}, seed {seed}",
        manager.len(),
        args.strategy
    );

    let mut rng = XorShift64::new(seed);
    let mut slots = vec![None::<Live>; args.slots];
    let mut stats = Stats::default();

    for step in 0..args.iterations {
        let size = rng.below(args.max_alloc) + 1;
        let heap = rng.below(manager.len());
        let slot = rng.below(slots.len());

        match slots[slot].take() {
            None => {
                manager
                    .use_heap(heap)
                    .whatever_context("failed to switch heaps")?;
                match manager.alloc(size, HEADER_ALIGNMENT) {
                    Ok(addr) => {
                        let fill = rng.next_u64().to_le_bytes()[0];
                        manager
                            .payload_mut(addr, size)
                            .whatever_context("allocation is outside every heap")?
                            .fill(fill);
                        trace!("step {step}: heap {heap} alloc {size} bytes at {addr:#x}");
                        slots[slot] = Some(Live { addr, size, fill });
                        stats.allocs += 1;
                    }
                    Err(err) if !err.is_fatal() => {
                        debug!("step {step}: {err}");
                        stats.out_of_memory += 1;
                    }
                    Err(err) => {
                        return Err::<(), _>(err).with_whatever_context(|_| {
                            format!("step {step}: allocating {size} bytes failed")
                        });
                    }
                }
            }
            Some(live) => {
                release(&mut manager, live)
                    .with_whatever_context(|_| format!("step {step}: releasing slot {slot} failed"))?;
                trace!("step {step}: free {:#x}", live.addr);
                stats.frees += 1;
            }
        }

        check_heaps(&manager).with_whatever_context(|_| format!("step {step}: heap check failed"))?;

        if args.dump_every > 0 && step % args.dump_every == 0 {
            for heap in manager.heaps() {
                print!("{}", heap.dump());
            }
        }
    }

    for live in slots.iter_mut().filter_map(Option::take) {
        release(&mut manager, live).whatever_context("final release failed")?;
        stats.frees += 1;
    }
    check_heaps(&manager).whatever_context("heap check after final release failed")?;
    for heap in manager.heaps() {
        ensure_whatever!(
            heap.fragment_count() == 1 && heap.free_bytes() == heap.usable_size(),
            "heap {} did not return to its initial state: {} fragments, {} of {} bytes free",
            heap.name(),
            heap.fragment_count(),
            heap.free_bytes(),
            heap.usable_size()
        );
    }

    if stats.out_of_memory > 0 {
        warn!("{} allocations did not fit", stats.out_of_memory);
    }
    info!(
        "{} steps done: {} allocations, {} frees",
        args.iterations, stats.allocs, stats.frees
    );
    manager.release();
    Ok(())
}

/// Verifies the fill pattern of `live` and frees it by owner lookup.
fn release(manager: &mut HeapManager, live: Live) -> Result<(), GenericError> {
    let payload = manager
        .payload(live.addr, live.size)
        .whatever_context("block is outside every heap")?;
    ensure_whatever!(
        payload.iter().all(|&b| b == live.fill),
        "block at {:#x} was overwritten",
        live.addr
    );
    manager
        .free(live.addr)
        .with_whatever_context(|_| format!("failed to free {:#x}", live.addr))
}

fn check_heaps(manager: &HeapManager) -> Result<(), GenericError> {
    for heap in manager.heaps() {
        heap.check_invariants()
            .with_whatever_context(|_| format!("heap {} is inconsistent", heap.name()))?;
    }
    Ok(())
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            elapsed.as_secs() ^ u64::from(elapsed.subsec_nanos())
        })
}
