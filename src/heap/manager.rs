#![allow(clippy::cast_possible_truncation)]

use super::bitmap::{Bitmap, Reservation};
use super::resize::Resizer;
use super::shrinker::Shrinker;
use super::state::{Geometry, HeapState, Window};
use super::{AllocFlags, Allocation, Handle, HandleKind, ResizeNotifier};
use crate::config::{HeapConfig, RetryPolicy, ShrinkPolicy};
use crate::error::{HeapError, HeapResult};
use crate::pool::{BackingPool, ChunkPool};
use crate::utils::units_for;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Observable heap counters, read under the coordinator lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub pool_base: u64,
    pub pool_len: u64,
    pub chunk_size: u64,
    pub num_chunks: usize,
    pub curr_base: u64,
    pub curr_len: u64,
    pub curr_used: u64,
    pub floor_size: u64,
    /// Releases refused since declaration (bad handle, double release).
    pub release_errors: u64,
}

struct Shared {
    name: String,
    geom: Geometry,
    device_base: u64,
    bitmap: Bitmap,
    pool: ChunkPool,
    notifier: Option<Box<dyn ResizeNotifier>>,
    retry: RetryPolicy,
    state: Mutex<HeapState>,
    release_errors: AtomicU64,
}

impl Shared {
    fn resizer(&self) -> Resizer<'_> {
        Resizer {
            name: &self.name,
            geom: &self.geom,
            bitmap: &self.bitmap,
            pool: &self.pool,
            notifier: self.notifier.as_deref(),
            retry: self.retry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeapState> {
        self.state.lock().unwrap()
    }

    fn shrink(&self) -> usize {
        let mut state = self.lock();
        self.resizer().shrink(&mut state)
    }
}

/// A device heap that borrows chunks from a contiguous backing pool on demand.
///
/// Allocations are served from one contiguous window of chunks. When a
/// request does not fit, the window grows by a chunk next to it; idle edge
/// chunks go back to the pool after releases.
pub struct ResizableHeap {
    shared: Arc<Shared>,
    shrinker: Option<Shrinker>,
}

impl std::fmt::Debug for ResizableHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResizableHeap")
            .field("name", &self.shared.name)
            .field("geometry", &self.shared.geom)
            .field("background_shrink", &self.shrinker.is_some())
            .finish_non_exhaustive()
    }
}

impl ResizableHeap {
    /// Declare a heap over `backing`.
    ///
    /// The window starts empty; nothing is taken from the pool until the first allocation.
    ///
    /// # Errors
    /// `InvalidArgument` if the configuration does not fit the pool.
    pub fn declare(
        config: HeapConfig,
        backing: Arc<dyn BackingPool>,
        notifier: Option<Box<dyn ResizeNotifier>>,
    ) -> HeapResult<Self> {
        let (pool_base, pool_len) = backing.bounds();
        let geom = Geometry::new(pool_base, pool_len, config.chunk_size, config.alloc_shift)?;
        let device_base = config.device_base.unwrap_or(pool_base);

        let shared = Arc::new(Shared {
            bitmap: Bitmap::new(
                pool_base,
                pool_len,
                device_base,
                config.alloc_shift,
                config.align_cap_order,
            ),
            pool: ChunkPool::new(backing),
            state: Mutex::new(HeapState {
                window: Window {
                    base: pool_base,
                    len: 0,
                },
                used: 0,
                floor: 0,
            }),
            name: config.name,
            geom,
            device_base,
            notifier,
            retry: config.retry,
            release_errors: AtomicU64::new(0),
        });

        let shrinker = match config.shrink {
            ShrinkPolicy::Inline => None,
            ShrinkPolicy::Background { delay } => {
                let worker = shared.clone();
                match Shrinker::spawn(&shared.name, delay, move || {
                    worker.shrink();
                }) {
                    Ok(shrinker) => Some(shrinker),
                    Err(e) => {
                        tracing::warn!(
                            "{}: no shrinker thread ({}), shrinking inline",
                            shared.name,
                            e
                        );
                        None
                    }
                }
            }
        };

        tracing::info!(
            "{}: declared over 0x{:x}+0x{:x}, {} chunks of 0x{:x}",
            shared.name,
            pool_base,
            pool_len,
            geom.num_chunks,
            geom.chunk_size
        );

        Ok(Self { shared, shrinker })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.shared.geom
    }

    /// Allocate `size` bytes, growing the window as needed.
    ///
    /// With `single_pages` the request is served as individual units.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size, a size above the pool, or conflicting
    /// flags; `HeapFull` when the window cannot grow far enough.
    ///
    /// # Panics
    /// Panics if the coordinator mutex is poisoned.
    pub fn allocate(&self, size: u64, flags: AllocFlags) -> HeapResult<Allocation> {
        self.check_request(size, flags)?;
        if flags.single_pages {
            return self.allocate_pages(units_for(size, self.shared.geom.alloc_shift), flags);
        }

        let shared = &*self.shared;
        let mut state = shared.lock();
        let resizer = shared.resizer();
        let before = state.window;

        let reservation = loop {
            if !state.window.is_empty() {
                let start = state.window.start_unit(&shared.geom);
                match shared.bitmap.reserve(size, flags.rounding(), start) {
                    Ok(r) => break r,
                    Err(HeapError::OutOfSpace { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            if let Err(e) = resizer.grow(&mut state) {
                self.grow_failed(&mut state, before);
                return Err(e);
            }
        };

        let bytes = self.bytes_of(reservation.units());
        state.used += bytes;
        drop(state);

        let phys_addr = shared.bitmap.phys_addr(reservation.offset());
        let memory_type = flags.memory_type();
        let ptr = if memory_type.is_some() {
            self.map_zeroed(phys_addr, bytes)
        } else {
            ptr::null_mut()
        };

        tracing::trace!(
            "{}: allocated 0x{:x} bytes at 0x{:x}",
            shared.name,
            bytes,
            phys_addr
        );

        Ok(Allocation {
            device_addr: shared.bitmap.device_addr(reservation.offset()),
            phys_addr,
            size: bytes,
            memory_type: if ptr.is_null() { None } else { memory_type },
            ptr,
            pages: Vec::new(),
            handle: Handle(HandleKind::Contiguous(reservation)),
        })
    }

    /// Allocate `count` discontiguous units.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero count or more units than the pool holds;
    /// `HeapFull` when the window cannot grow far enough.
    ///
    /// # Panics
    /// Panics if the coordinator mutex is poisoned.
    pub fn allocate_pages(&self, count: usize, flags: AllocFlags) -> HeapResult<Allocation> {
        if count > self.total_units() {
            return Err(HeapError::InvalidArgument("more pages than the pool holds"));
        }
        let bytes = self.bytes_of(count);
        self.check_request(bytes, flags)?;

        let shared = &*self.shared;
        let mut state = shared.lock();
        let resizer = shared.resizer();
        let before = state.window;

        let pages = loop {
            if !state.window.is_empty() {
                let start = state.window.start_unit(&shared.geom);
                match shared.bitmap.reserve_pages(count, start) {
                    Ok(pages) => break pages,
                    Err(HeapError::OutOfSpace { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            if let Err(e) = resizer.grow(&mut state) {
                self.grow_failed(&mut state, before);
                return Err(e);
            }
        };

        state.used += bytes;
        drop(state);

        let unit = shared.bitmap.unit_size();
        if flags.memory_type().is_some() {
            for page in &pages {
                self.map_zeroed(shared.bitmap.phys_addr(page.offset()), unit);
            }
        }

        let first = pages[0].offset();
        Ok(Allocation {
            device_addr: shared.bitmap.device_addr(first),
            phys_addr: shared.bitmap.phys_addr(first),
            size: bytes,
            ptr: ptr::null_mut(),
            memory_type: None,
            pages: pages
                .iter()
                .map(|p| shared.bitmap.device_addr(p.offset()))
                .collect(),
            handle: Handle(HandleKind::Pages(pages)),
        })
    }

    /// Give an allocation back and schedule the shrinker.
    ///
    /// A refused release leaves the heap untouched and is counted in
    /// [`HeapStats::release_errors`].
    ///
    /// # Errors
    /// `InvalidArgument` if the allocation lies outside the window,
    /// `DoubleRelease` if its units are already free.
    ///
    /// # Panics
    /// Panics if the coordinator mutex is poisoned.
    pub fn release(&self, allocation: &Allocation) -> HeapResult<()> {
        let shared = &*self.shared;
        let mut state = shared.lock();

        if let Err(e) = self.release_locked(&mut state, allocation) {
            shared.release_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                "{}: release of 0x{:x}+0x{:x} refused: {}",
                shared.name,
                allocation.phys_addr,
                allocation.size,
                e
            );
            return Err(e);
        }

        self.schedule_shrink(&mut state);
        Ok(())
    }

    /// Keep at least `bytes` of the pool in the window, growing now if needed.
    ///
    /// # Errors
    /// `HeapFull` if the window cannot reach the floor; every chunk acquired
    /// for it is returned and the previous floor stays in force.
    ///
    /// # Panics
    /// Panics if the coordinator mutex is poisoned.
    pub fn set_floor(&self, bytes: u64) -> HeapResult<()> {
        let shared = &*self.shared;
        let mut state = shared.lock();
        let result = shared.resizer().grow_to_floor(&mut state, bytes);
        self.schedule_shrink(&mut state);
        result
    }

    /// Run the shrinker synchronously. Returns the number of chunks reclaimed.
    #[must_use = "the count tells whether anything was reclaimed"]
    pub fn shrink_now(&self) -> usize {
        self.shared.shrink()
    }

    /// Whether `device_addr` falls inside the current window.
    ///
    /// # Panics
    /// Panics if the coordinator mutex is poisoned.
    #[must_use]
    pub fn contains(&self, device_addr: u64) -> bool {
        let shared = &*self.shared;
        device_addr
            .checked_sub(shared.device_base)
            .is_some_and(|off| shared.lock().window.contains(shared.geom.pool_base + off))
    }

    /// # Panics
    /// Panics if the coordinator mutex is poisoned.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let shared = &*self.shared;
        let state = shared.lock();
        HeapStats {
            pool_base: shared.geom.pool_base,
            pool_len: shared.geom.pool_len,
            chunk_size: shared.geom.chunk_size,
            num_chunks: shared.geom.num_chunks,
            curr_base: state.window.base,
            curr_len: state.window.len,
            curr_used: state.used,
            floor_size: state.floor,
            release_errors: shared.release_errors.load(Ordering::Relaxed),
        }
    }

    /// Units currently reserved in the sub-allocator and the reservable bound.
    #[must_use]
    pub fn bitmap_usage(&self) -> (usize, usize) {
        let bitmap = &self.shared.bitmap;
        (bitmap.reserved_units(), bitmap.reservable_units())
    }

    /// Highest reserved unit, if any.
    #[must_use]
    pub fn highest_reserved_unit(&self) -> Option<usize> {
        self.shared.bitmap.highest_reserved()
    }

    /// Wake the background shrinker, or shrink right here without one.
    fn schedule_shrink(&self, state: &mut HeapState) {
        match &self.shrinker {
            Some(shrinker) => shrinker.kick(),
            None => {
                self.shared.resizer().shrink(state);
            }
        }
    }

    /// Chunks taken for a request that still failed are left to the shrinker.
    fn grow_failed(&self, state: &mut HeapState, before: Window) {
        if state.window != before {
            self.schedule_shrink(state);
        }
    }

    fn check_request(&self, size: u64, flags: AllocFlags) -> HeapResult<()> {
        flags.validate()?;
        if size == 0 {
            return Err(HeapError::InvalidArgument("zero-sized allocation"));
        }
        if size > self.shared.geom.pool_len {
            return Err(HeapError::InvalidArgument("allocation larger than the pool"));
        }
        Ok(())
    }

    fn release_locked(&self, state: &mut HeapState, allocation: &Allocation) -> HeapResult<()> {
        let shared = &*self.shared;
        let window = state.window;
        let inside = |r: &Reservation| {
            let start = shared.bitmap.phys_addr(r.offset());
            let end = shared.bitmap.phys_addr(r.end());
            window.contains(start) && end <= window.end()
        };

        match &allocation.handle().0 {
            HandleKind::Contiguous(r) => {
                if !inside(r) || allocation.size > window.len {
                    return Err(HeapError::InvalidArgument(
                        "allocation outside the heap window",
                    ));
                }
                shared.bitmap.release(r)?;
                state.used -= self.bytes_of(r.units());
            }
            HandleKind::Pages(pages) => {
                if !pages.iter().all(inside) {
                    return Err(HeapError::InvalidArgument("page outside the heap window"));
                }
                if let Some(page) = pages.iter().find(|p| !shared.bitmap.is_reserved(p)) {
                    return Err(HeapError::DoubleRelease {
                        offset: page.offset(),
                        units: page.units(),
                    });
                }
                for page in pages {
                    shared.bitmap.release(page)?;
                    state.used -= self.bytes_of(1);
                }
            }
        }
        Ok(())
    }

    fn total_units(&self) -> usize {
        (self.shared.geom.pool_len >> self.shared.geom.alloc_shift) as usize
    }

    /// Byte size of `units`; callers keep `units` within `total_units`.
    fn bytes_of(&self, units: usize) -> u64 {
        debug_assert!(units <= self.total_units());
        (units as u64) << self.shared.geom.alloc_shift
    }

    /// CPU pointer to `[phys, phys + len)` zero-filled, or null if the pool is not mapped.
    fn map_zeroed(&self, phys: u64, len: u64) -> *mut u8 {
        let Some(host) = self.shared.pool.host_ptr() else {
            return ptr::null_mut();
        };
        let offset = (phys - self.shared.geom.pool_base) as usize;
        // SAFETY: `[phys, phys + len)` lies inside the pool, and `BackingPool`
        // implementors guarantee the host mapping covers the whole pool.
        unsafe {
            let ptr = host.add(offset);
            ptr::write_bytes(ptr, 0, len as usize);
            ptr
        }
    }
}

impl Drop for ResizableHeap {
    fn drop(&mut self) {
        if let Some(mut shrinker) = self.shrinker.take() {
            shrinker.stop();
        }

        let shared = &*self.shared;
        let mut state = shared.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.used > 0 {
            tracing::warn!(
                "{}: torn down with 0x{:x} bytes still allocated",
                shared.name,
                state.used
            );
        }
        shared.resizer().release_all(&mut state);
        state.used = 0;
    }
}
