#![allow(clippy::cast_possible_truncation)]

use crate::config::MAX_ALLOC_SHIFT;
use crate::error::{HeapError, HeapResult};

/// Immutable layout of the backing pool, cut into chunks.
///
/// Every chunk is `chunk_size` bytes except the last, which is
/// `rem_chunk_size` bytes (`0 < rem_chunk_size <= chunk_size`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub pool_base: u64,
    pub pool_len: u64,
    pub chunk_size: u64,
    pub rem_chunk_size: u64,
    pub num_chunks: usize,
    pub alloc_shift: u32,
}

impl Geometry {
    /// Derive the chunk layout. A zero `chunk_size` means one chunk covering the pool.
    ///
    /// # Errors
    /// `InvalidArgument` if the pool, chunk size, or unit are inconsistent.
    pub fn new(pool_base: u64, pool_len: u64, chunk_size: u64, alloc_shift: u32) -> HeapResult<Self> {
        if alloc_shift > MAX_ALLOC_SHIFT {
            return Err(HeapError::InvalidArgument("allocation unit too large"));
        }
        let unit = 1u64 << alloc_shift;

        if pool_len == 0 {
            return Err(HeapError::InvalidArgument("empty backing pool"));
        }
        if pool_base.checked_add(pool_len).is_none() {
            return Err(HeapError::InvalidArgument("pool wraps the address space"));
        }
        if pool_base % unit != 0 || pool_len % unit != 0 {
            return Err(HeapError::InvalidArgument("pool not aligned to the allocation unit"));
        }

        let chunk_size = if chunk_size == 0 { pool_len } else { chunk_size };
        if chunk_size > pool_len {
            return Err(HeapError::InvalidArgument("chunk larger than the pool"));
        }
        if chunk_size % unit != 0 {
            return Err(HeapError::InvalidArgument("chunk not a multiple of the allocation unit"));
        }

        let rem = pool_len % chunk_size;
        let (num_chunks, rem_chunk_size) = if rem == 0 {
            (pool_len / chunk_size, chunk_size)
        } else {
            (pool_len / chunk_size + 1, rem)
        };

        Ok(Self {
            pool_base,
            pool_len,
            chunk_size,
            rem_chunk_size,
            num_chunks: num_chunks as usize,
            alloc_shift,
        })
    }

    #[must_use]
    pub const fn chunk_start(&self, index: usize) -> u64 {
        self.pool_base + index as u64 * self.chunk_size
    }

    #[must_use]
    pub const fn chunk_len(&self, index: usize) -> u64 {
        if index + 1 == self.num_chunks {
            self.rem_chunk_size
        } else {
            self.chunk_size
        }
    }

    /// Index of the chunk containing `addr`.
    #[must_use]
    pub const fn chunk_of(&self, addr: u64) -> usize {
        ((addr - self.pool_base) / self.chunk_size) as usize
    }

    /// Unit offset of `addr` from the pool base.
    #[must_use]
    pub const fn unit_of(&self, addr: u64) -> usize {
        ((addr - self.pool_base) >> self.alloc_shift) as usize
    }
}

/// The contiguous run of chunks currently owned by the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Window {
    pub base: u64,
    pub len: u64,
}

impl Window {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.len
    }

    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        !self.is_empty() && addr >= self.base && addr < self.end()
    }

    #[must_use]
    pub const fn first_chunk(&self, geom: &Geometry) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(geom.chunk_of(self.base))
        }
    }

    #[must_use]
    pub const fn last_chunk(&self, geom: &Geometry) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(geom.chunk_of(self.end() - 1))
        }
    }

    /// Units the sub-allocator may hand out: everything up to the window's end.
    #[must_use]
    pub const fn reservable_units(&self, geom: &Geometry) -> usize {
        if self.is_empty() {
            0
        } else {
            geom.unit_of(self.end())
        }
    }

    /// First unit of the window; where every reservation scan starts.
    #[must_use]
    pub const fn start_unit(&self, geom: &Geometry) -> usize {
        if self.is_empty() {
            0
        } else {
            geom.unit_of(self.base)
        }
    }
}

/// Mutable heap bookkeeping, guarded by the coordinator lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapState {
    pub window: Window,
    /// Bytes handed out, after rounding to whole units.
    pub used: u64,
    /// The shrinker never takes the window below this length.
    pub floor: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x1000_0000;

    #[test]
    fn even_split() {
        let geom = Geometry::new(BASE, 0x40_0000, 0x10_0000, 12).unwrap();
        assert_eq!(geom.num_chunks, 4);
        assert_eq!(geom.rem_chunk_size, 0x10_0000);
        assert_eq!(geom.chunk_start(3), BASE + 0x30_0000);
        assert_eq!(geom.chunk_len(3), 0x10_0000);
    }

    #[test]
    fn short_last_chunk() {
        let geom = Geometry::new(BASE, 0x38_0000, 0x10_0000, 12).unwrap();
        assert_eq!(geom.num_chunks, 4);
        assert_eq!(geom.rem_chunk_size, 0x8_0000);
        assert_eq!(geom.chunk_len(2), 0x10_0000);
        assert_eq!(geom.chunk_len(3), 0x8_0000);
        assert_eq!(geom.chunk_of(BASE + 0x37_ffff), 3);
    }

    #[test]
    fn zero_chunk_size_spans_pool() {
        let geom = Geometry::new(BASE, 0x40_0000, 0, 12).unwrap();
        assert_eq!(geom.num_chunks, 1);
        assert_eq!(geom.chunk_size, 0x40_0000);
        assert_eq!(geom.rem_chunk_size, 0x40_0000);
    }

    #[test]
    fn rejects_inconsistent_layouts() {
        assert!(Geometry::new(BASE, 0, 0, 12).is_err());
        assert!(Geometry::new(BASE + 1, 0x40_0000, 0, 12).is_err());
        assert!(Geometry::new(BASE, 0x40_0000, 0x80_0000, 12).is_err());
        assert!(Geometry::new(BASE, 0x40_0000, 0x10_0800, 12).is_err());
        assert!(Geometry::new(BASE, 0x40_0000, 0x10_0000, 31).is_err());
    }

    #[test]
    fn rejects_pools_past_the_address_space() {
        let top: u64 = 0xffff_ffff_ffc0_0000;
        assert!(Geometry::new(top, 0x40_0000, 0x10_0000, 12).is_err());
        assert!(Geometry::new(top - 0x1000, 0x40_0000, 0x10_0000, 12).is_ok());
    }

    #[test]
    fn window_edges_and_units() {
        let geom = Geometry::new(BASE, 0x40_0000, 0x10_0000, 12).unwrap();
        let empty = Window::default();
        assert_eq!(empty.first_chunk(&geom), None);
        assert_eq!(empty.last_chunk(&geom), None);
        assert_eq!(empty.reservable_units(&geom), 0);
        assert!(!empty.contains(BASE));

        let window = Window {
            base: BASE + 0x20_0000,
            len: 0x20_0000,
        };
        assert_eq!(window.first_chunk(&geom), Some(2));
        assert_eq!(window.last_chunk(&geom), Some(3));
        assert_eq!(window.start_unit(&geom), 512);
        assert_eq!(window.reservable_units(&geom), 1024);
        assert!(window.contains(BASE + 0x3f_ffff));
        assert!(!window.contains(BASE + 0x40_0000));
    }
}
