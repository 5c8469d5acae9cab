pub mod bitmap;
pub mod flags;
pub mod manager;
mod resize;
mod shrinker;
pub mod state;

use bitmap::Reservation;
use thiserror::Error;

/// Error returned by a [`ResizeNotifier`] that refuses a new window.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct NotifyError(pub String);

/// Downstream consumer of window changes, e.g. a protected address range in hardware.
///
/// Called after the window has been updated and before any allocation
/// observes it. `len == 0` means the heap no longer owns any memory.
pub trait ResizeNotifier: Send + Sync {
    /// Reconfigure for the window `[base, base + len)`.
    fn resized(&self, base: u64, len: u64) -> Result<(), NotifyError>;
}

impl<F> ResizeNotifier for F
where
    F: Fn(u64, u64) -> Result<(), NotifyError> + Send + Sync,
{
    fn resized(&self, base: u64, len: u64) -> Result<(), NotifyError> {
        self(base, len)
    }
}

/// Memory type of the CPU mapping handed out with an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Cached,
    WriteCombine,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HandleKind {
    Contiguous(Reservation),
    Pages(Vec<Reservation>),
}

/// Locates an allocation's reservation without searching the bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle(pub(crate) HandleKind);

/// Represents a successful allocation from a resizable heap.
#[derive(Debug, Clone)]
pub struct Allocation {
    /// Device-visible address of the first byte.
    pub device_addr: u64,
    /// Physical address of the first byte.
    pub phys_addr: u64,
    /// Size in bytes, after rounding to whole units.
    pub size: u64,
    /// CPU address when the pool is directly mapped, null otherwise.
    pub ptr: *mut u8,
    pub memory_type: Option<MemoryType>,
    pages: Vec<u64>,
    handle: Handle,
}

// The pointer refers to pool memory owned by the heap, not by this value.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    #[must_use]
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    #[must_use]
    pub const fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        !self.ptr.is_null()
    }

    /// Device addresses of each unit of a `single_pages` allocation; empty for contiguous ones.
    #[must_use]
    pub fn pages(&self) -> &[u64] {
        &self.pages
    }
}

pub use flags::AllocFlags;
pub use manager::{HeapStats, ResizableHeap};
