//! Chunk pool adapter over an external contiguous backing pool.
//!
//! The heap only ever grows by a chunk placed directly next to its window, so
//! the adapter turns the backing pool's "allocate near this address" into
//! "allocate exactly here or not at all".

pub mod host;
pub mod range;

use std::sync::Arc;
use thiserror::Error;

pub use host::HostMemory;
pub use range::RangePool;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("Backing pool exhausted")]
    Exhausted,

    #[error("Backing pool busy, retry later")]
    Transient,

    #[error("Requested 0x{requested:x} but the pool placed the range at 0x{got:x}")]
    Displaced { requested: u64, got: u64 },

    #[error("Range lies outside the backing pool")]
    OutOfRange,
}

/// A larger contiguous physical range managed by some other allocator.
///
/// Implementations serialise their own bookkeeping; calls may block.
///
/// # Safety
/// If `host_ptr` returns `Some(ptr)`, `ptr` must be valid for reads and
/// writes over `[ptr, ptr + len)`, where `len` is the length reported by
/// `bounds`, for as long as the pool is alive. The heap zero-fills ranges of
/// that mapping through the pointer without further checks.
pub unsafe trait BackingPool: Send + Sync {
    /// Physical base and length of the pool.
    fn bounds(&self) -> (u64, u64);

    /// Allocate `len` bytes, preferably at `hint`. The pool may place the range elsewhere.
    fn allocate(&self, hint: u64, len: u64) -> Result<u64, PoolError>;

    /// Return a range previously handed out by `allocate`.
    fn free(&self, addr: u64, len: u64);

    /// CPU address of the pool base when the pool is directly mapped.
    fn host_ptr(&self) -> Option<*mut u8> {
        None
    }
}

/// Acquires and releases fixed-placement chunks from a [`BackingPool`].
#[derive(Clone)]
pub struct ChunkPool {
    backing: Arc<dyn BackingPool>,
}

impl std::fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (base, len) = self.backing.bounds();
        f.debug_struct("ChunkPool")
            .field("base", &format_args!("0x{base:x}"))
            .field("len", &format_args!("0x{len:x}"))
            .finish()
    }
}

impl ChunkPool {
    #[must_use]
    pub fn new(backing: Arc<dyn BackingPool>) -> Self {
        Self { backing }
    }

    #[must_use]
    pub fn bounds(&self) -> (u64, u64) {
        self.backing.bounds()
    }

    #[must_use]
    pub fn host_ptr(&self) -> Option<*mut u8> {
        self.backing.host_ptr()
    }

    /// Reserve exactly `[start, start + len)`.
    ///
    /// A range the backing pool placed anywhere else is handed straight back
    /// and reported as [`PoolError::Displaced`].
    ///
    /// # Errors
    /// Whatever the backing pool reports, or `Displaced`.
    pub fn alloc_at(&self, start: u64, len: u64) -> Result<u64, PoolError> {
        let got = self.backing.allocate(start, len)?;
        if got != start {
            self.backing.free(got, len);
            return Err(PoolError::Displaced {
                requested: start,
                got,
            });
        }
        tracing::trace!("chunk pool: acquired 0x{:x}+0x{:x}", start, len);
        Ok(got)
    }

    pub fn free(&self, start: u64, len: u64) {
        tracing::trace!("chunk pool: returned 0x{:x}+0x{:x}", start, len);
        self.backing.free(start, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Always hands out the pool base, whatever the hint.
    struct StubbornPool {
        freed: Mutex<Vec<(u64, u64)>>,
    }

    unsafe impl BackingPool for StubbornPool {
        fn bounds(&self) -> (u64, u64) {
            (0x1000, 0x4000)
        }

        fn allocate(&self, _hint: u64, _len: u64) -> Result<u64, PoolError> {
            Ok(0x1000)
        }

        fn free(&self, addr: u64, len: u64) {
            self.freed.lock().unwrap().push((addr, len));
        }
    }

    #[test]
    fn displaced_allocation_is_undone() {
        let backing = Arc::new(StubbornPool {
            freed: Mutex::new(Vec::new()),
        });
        let pool = ChunkPool::new(backing.clone());

        assert_eq!(pool.alloc_at(0x1000, 0x1000), Ok(0x1000));
        assert_eq!(
            pool.alloc_at(0x2000, 0x1000),
            Err(PoolError::Displaced {
                requested: 0x2000,
                got: 0x1000
            })
        );
        assert_eq!(*backing.freed.lock().unwrap(), vec![(0x1000, 0x1000)]);
    }

    #[test]
    fn placed_allocation_from_range_pool() {
        let pool = ChunkPool::new(Arc::new(RangePool::new(0x1000_0000, 0x40_0000)));

        assert_eq!(pool.alloc_at(0x1010_0000, 0x10_0000), Ok(0x1010_0000));
        // Overlapping request gets placed elsewhere by the backing pool and is refused.
        assert!(matches!(
            pool.alloc_at(0x1010_0000, 0x10_0000),
            Err(PoolError::Displaced { .. })
        ));
        pool.free(0x1010_0000, 0x10_0000);
        assert_eq!(pool.alloc_at(0x1010_0000, 0x10_0000), Ok(0x1010_0000));
    }
}
