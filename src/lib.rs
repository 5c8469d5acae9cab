//! Resizable contiguous device-memory heap.
//!
//! A [`ResizableHeap`] borrows fixed-size chunks from a larger contiguous
//! [`BackingPool`], serves allocations from the contiguous window of chunks
//! it owns, grows that window one adjacent chunk at a time when a request
//! does not fit, and hands idle edge chunks back after releases. An optional
//! [`ResizeNotifier`] hears about every change of the window.

pub mod config;
pub mod error;
pub mod heap;
pub mod pool;
pub mod utils;

pub use config::{HeapConfig, RetryPolicy, ShrinkPolicy};
pub use error::{FullReason, HeapError, HeapResult};
pub use heap::{
    AllocFlags, Allocation, Handle, HeapStats, MemoryType, NotifyError, ResizableHeap,
    ResizeNotifier,
};
pub use pool::{BackingPool, ChunkPool, PoolError, RangePool};
