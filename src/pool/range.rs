use super::{BackingPool, HostMemory, PoolError};
use std::collections::BTreeMap;
use std::io;
use std::sync::Mutex;

/// A contiguous physical range shared by several consumers.
///
/// Tracks occupied ranges as `start -> len` and places new ranges at the
/// requested hint when it is free, otherwise in the first hole that fits.
#[derive(Debug)]
pub struct RangePool {
    base: u64,
    len: u64,
    occupied: Mutex<BTreeMap<u64, u64>>,
    host: Option<HostMemory>,
}

impl RangePool {
    /// A pool with no CPU mapping; the heap hands out unmapped handles.
    #[must_use]
    pub fn new(base: u64, len: u64) -> Self {
        Self {
            base,
            len,
            occupied: Mutex::new(BTreeMap::new()),
            host: None,
        }
    }

    /// A pool whose contents are backed by anonymous host memory.
    ///
    /// # Errors
    /// Returns the OS error if the mapping cannot be created.
    pub fn with_host_memory(base: u64, len: u64) -> io::Result<Self> {
        let len_usize = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pool too large to map"))?;
        let host = HostMemory::map(len_usize)?;
        Ok(Self {
            host: Some(host),
            ..Self::new(base, len)
        })
    }

    /// Take `[addr, addr + len)` on behalf of another pool consumer.
    ///
    /// # Errors
    /// Fails if the range is outside the pool or overlaps an occupied range.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn claim(&self, addr: u64, len: u64) -> Result<(), PoolError> {
        let mut occupied = self.occupied.lock().unwrap();
        if !self.in_bounds(addr, len) {
            return Err(PoolError::OutOfRange);
        }
        if !Self::is_free(&occupied, addr, len) {
            return Err(PoolError::Exhausted);
        }
        occupied.insert(addr, len);
        Ok(())
    }

    /// Bytes currently handed out to any consumer.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn occupied_bytes(&self) -> u64 {
        self.occupied.lock().unwrap().values().sum()
    }

    fn in_bounds(&self, addr: u64, len: u64) -> bool {
        len != 0 && addr >= self.base && addr + len <= self.base + self.len
    }

    fn is_free(occupied: &BTreeMap<u64, u64>, addr: u64, len: u64) -> bool {
        let end = addr + len;
        if let Some((&start, &size)) = occupied.range(..=addr).next_back() {
            if start + size > addr {
                return false;
            }
        }
        occupied.range(addr..end).next().is_none()
    }

    fn first_hole(&self, occupied: &BTreeMap<u64, u64>, len: u64) -> Option<u64> {
        let limit = self.base + self.len;
        let mut candidate = self.base;

        for (&start, &size) in occupied {
            if start >= candidate && start - candidate >= len {
                return Some(candidate);
            }
            candidate = candidate.max(start + size);
        }

        (candidate + len <= limit).then_some(candidate)
    }
}

// SAFETY: `host` maps exactly `len` bytes and lives as long as the pool.
unsafe impl BackingPool for RangePool {
    fn bounds(&self) -> (u64, u64) {
        (self.base, self.len)
    }

    fn allocate(&self, hint: u64, len: u64) -> Result<u64, PoolError> {
        if len == 0 || len > self.len {
            return Err(PoolError::OutOfRange);
        }

        let mut occupied = self.occupied.lock().unwrap();
        let addr = if self.in_bounds(hint, len) && Self::is_free(&occupied, hint, len) {
            hint
        } else {
            self.first_hole(&occupied, len).ok_or(PoolError::Exhausted)?
        };

        occupied.insert(addr, len);
        Ok(addr)
    }

    fn free(&self, addr: u64, len: u64) {
        match self.occupied.lock().unwrap().remove(&addr) {
            Some(size) if size != len => {
                tracing::warn!(
                    "range pool: freed 0x{:x} with length 0x{:x}, tracked 0x{:x}",
                    addr,
                    len,
                    size
                );
            }
            Some(_) => {}
            None => {
                tracing::warn!("range pool: tried to free 0x{:x} which was not tracked", addr);
            }
        }
    }

    fn host_ptr(&self) -> Option<*mut u8> {
        self.host.as_ref().map(HostMemory::as_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_is_honoured_when_free() {
        let pool = RangePool::new(0x1000, 0x4000);
        assert_eq!(pool.allocate(0x3000, 0x1000), Ok(0x3000));
        assert_eq!(pool.allocate(0x2000, 0x1000), Ok(0x2000));
        assert_eq!(pool.occupied_bytes(), 0x2000);
    }

    #[test]
    fn busy_hint_falls_back_to_first_hole() {
        let pool = RangePool::new(0x1000, 0x4000);
        pool.claim(0x1000, 0x1000).unwrap();
        pool.claim(0x3000, 0x1000).unwrap();

        assert_eq!(pool.allocate(0x3000, 0x1000), Ok(0x2000));
        assert_eq!(pool.allocate(0x3000, 0x1000), Ok(0x4000));
        assert_eq!(pool.allocate(0x3000, 0x1000), Err(PoolError::Exhausted));
    }

    #[test]
    fn claim_rejects_overlap_and_out_of_range() {
        let pool = RangePool::new(0x1000, 0x4000);
        pool.claim(0x2000, 0x2000).unwrap();

        assert_eq!(pool.claim(0x3000, 0x1000), Err(PoolError::Exhausted));
        assert_eq!(pool.claim(0x1800, 0x1000), Err(PoolError::Exhausted));
        assert_eq!(pool.claim(0x4000, 0x2000), Err(PoolError::OutOfRange));
        assert_eq!(pool.claim(0x1000, 0x1000), Ok(()));
    }

    #[test]
    fn free_returns_range() {
        let pool = RangePool::new(0x1000, 0x2000);
        let a = pool.allocate(0x1000, 0x2000).unwrap();
        assert_eq!(pool.allocate(0x1000, 0x1000), Err(PoolError::Exhausted));
        pool.free(a, 0x2000);
        assert_eq!(pool.occupied_bytes(), 0);
        assert_eq!(pool.allocate(0x2000, 0x1000), Ok(0x2000));
    }

    #[test]
    fn host_backed_pool_exposes_mapping() {
        let pool = RangePool::with_host_memory(0x1000_0000, 0x2000).unwrap();
        let host = pool.host_ptr().unwrap();
        let (_, len) = pool.bounds();

        // The mapping spans the whole pool, up to its last byte.
        let bytes = unsafe { std::slice::from_raw_parts_mut(host, len as usize) };
        bytes[len as usize - 1] = 0xa5;
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[len as usize - 1], 0xa5);

        assert!(RangePool::new(0, 0x1000).host_ptr().is_none());
    }
}
