use cma_heap::{AllocFlags, HeapConfig, HeapStats, NotifyError, RangePool, ResizableHeap};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const POOL_BASE: u64 = 0x1000_0000;
const POOL_LEN: u64 = 0x40_0000;
const CHUNK: u64 = 0x10_0000;

fn print_stats(label: &str, stats: &HeapStats) {
    println!(
        "{:<24} | window 0x{:08x}+0x{:06x} | used 0x{:06x} | floor 0x{:06x}",
        label, stats.curr_base, stats.curr_len, stats.curr_used, stats.floor_size
    );
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("--- Resizable Heap Walk ---");

    let pool = Arc::new(RangePool::with_host_memory(POOL_BASE, POOL_LEN)?);
    let notifier = |base: u64, len: u64| -> Result<(), NotifyError> {
        println!("  [notifier] protected window -> 0x{base:08x}+0x{len:06x}");
        Ok(())
    };

    let heap = ResizableHeap::declare(
        HeapConfig::new("demo")
            .chunk_size(CHUNK)
            .background_shrink(Duration::from_millis(20)),
        pool.clone(),
        Some(Box::new(notifier)),
    )?;

    let geom = heap.geometry();
    println!(
        "Pool 0x{:08x}+0x{:x}: {} chunks of 0x{:x} (last 0x{:x})",
        geom.pool_base, geom.pool_len, geom.num_chunks, geom.chunk_size, geom.rem_chunk_size
    );
    print_stats("declared", &heap.stats());

    let big = heap.allocate(0x20_0000, AllocFlags::new().exact_size())?;
    println!("  big allocation at device 0x{:08x}", big.device_addr);
    print_stats("after 2 MiB", &heap.stats());

    let small = heap.allocate(0x3000, AllocFlags::new())?;
    println!(
        "  small allocation at device 0x{:08x} ({} bytes after rounding)",
        small.device_addr, small.size
    );
    print_stats("after 12 KiB", &heap.stats());

    heap.release(&big)?;
    std::thread::sleep(Duration::from_millis(100));
    print_stats("after releasing big", &heap.stats());

    heap.release(&small)?;
    std::thread::sleep(Duration::from_millis(100));
    print_stats("after releasing all", &heap.stats());

    println!("Pool bytes still held by the heap: 0x{:x}", pool.occupied_bytes());
    Ok(())
}
