#![allow(clippy::cast_possible_truncation)]

//! Bitmap sub-allocator over the whole backing pool.
//!
//! One bit per allocation unit; a set bit means the unit is reserved. The
//! coordinator narrows what may be handed out through `reservable_units` and
//! the `start_unit` passed to every reservation, so the bitmap never needs to
//! be resized when the window moves.

use crate::error::{HeapError, HeapResult};
use crate::utils::{align_up, order_of, units_for};
use bitvec::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How a byte size is turned into a number of units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingPolicy {
    /// `ceil(size / unit)` units, no alignment.
    Exact,
    /// Next power of two units, aligned to the order (capped).
    PowerOfTwo,
}

/// A run of reserved units, located by its unit offset from the pool base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reservation {
    offset: usize,
    units: usize,
}

impl Reservation {
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub const fn units(&self) -> usize {
        self.units
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.units
    }
}

#[derive(Debug)]
pub struct Bitmap {
    bits: spin::Mutex<BitVec<u64, Lsb0>>,
    reservable_units: AtomicUsize,
    pool_base: u64,
    device_base: u64,
    alloc_shift: u32,
    align_cap_order: u32,
}

impl Bitmap {
    #[must_use]
    pub fn new(
        pool_base: u64,
        pool_len: u64,
        device_base: u64,
        alloc_shift: u32,
        align_cap_order: u32,
    ) -> Self {
        let total_units = (pool_len >> alloc_shift) as usize;
        Self {
            bits: spin::Mutex::new(bitvec![u64, Lsb0; 0; total_units]),
            reservable_units: AtomicUsize::new(0),
            pool_base,
            device_base,
            alloc_shift,
            align_cap_order,
        }
    }

    #[must_use]
    pub const fn unit_size(&self) -> u64 {
        1 << self.alloc_shift
    }

    #[must_use]
    pub fn reservable_units(&self) -> usize {
        self.reservable_units.load(Ordering::Acquire)
    }

    /// Move the visible upper bound. Only the coordinator calls this, with its lock held.
    pub fn set_reservable_units(&self, units: usize) {
        let bits = self.bits.lock();
        self.reservable_units
            .store(units.min(bits.len()), Ordering::Release);
    }

    #[must_use]
    pub const fn device_addr(&self, offset: usize) -> u64 {
        self.device_base + ((offset as u64) << self.alloc_shift)
    }

    #[must_use]
    pub const fn phys_addr(&self, offset: usize) -> u64 {
        self.pool_base + ((offset as u64) << self.alloc_shift)
    }

    /// Units and alignment (in units) a request of `size` bytes needs.
    #[must_use]
    pub fn geometry_for(&self, size: u64, policy: RoundingPolicy) -> (usize, usize) {
        let count = units_for(size, self.alloc_shift);
        match policy {
            RoundingPolicy::Exact => (count, 1),
            RoundingPolicy::PowerOfTwo => {
                let order = order_of(count);
                (1 << order, 1 << order.min(self.align_cap_order))
            }
        }
    }

    /// Reserve a contiguous run for `size` bytes at or after `start_unit`.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size, `OutOfSpace` when the request exceeds
    /// the reservable range or no aligned free run exists.
    pub fn reserve(
        &self,
        size: u64,
        policy: RoundingPolicy,
        start_unit: usize,
    ) -> HeapResult<Reservation> {
        if size == 0 {
            return Err(HeapError::InvalidArgument("zero-sized reservation"));
        }

        let (units, align) = self.geometry_for(size, policy);
        if size > (self.reservable_units() as u64) << self.alloc_shift {
            return Err(HeapError::OutOfSpace { units });
        }

        self.reserve_run(units, align, start_unit)
    }

    /// Reserve `units` units aligned to `align` units, scanning from `start_unit`.
    ///
    /// The first free run at or after `start_unit` wins, so the result is not
    /// necessarily placed at `start_unit` itself.
    ///
    /// # Errors
    /// `OutOfSpace` if no such run ends below `reservable_units`.
    pub fn reserve_run(
        &self,
        units: usize,
        align: usize,
        start_unit: usize,
    ) -> HeapResult<Reservation> {
        if units == 0 || align == 0 {
            return Err(HeapError::InvalidArgument("empty run"));
        }

        let mut bits = self.bits.lock();
        let limit = self.reservable_units().min(bits.len());
        let offset = find_run(&bits, limit, units, align, start_unit)
            .ok_or(HeapError::OutOfSpace { units })?;

        bits[offset..offset + units].fill(true);
        drop(bits);

        tracing::trace!("bitmap: reserved units {}..+{}", offset, units);
        Ok(Reservation { offset, units })
    }

    /// Reserve `count` single units anywhere at or after `start_unit`.
    ///
    /// Either every unit is reserved or none is.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero count, `OutOfSpace` if the units run out.
    pub fn reserve_pages(&self, count: usize, start_unit: usize) -> HeapResult<Vec<Reservation>> {
        if count == 0 {
            return Err(HeapError::InvalidArgument("zero pages requested"));
        }

        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            match self.reserve_run(1, 1, start_unit) {
                Ok(page) => pages.push(page),
                Err(e) => {
                    for page in &pages {
                        if let Err(err) = self.release(page) {
                            tracing::error!(
                                "bitmap: rollback of unit {} failed: {}",
                                page.offset,
                                err
                            );
                        }
                    }
                    return Err(match e {
                        HeapError::OutOfSpace { .. } => HeapError::OutOfSpace { units: count },
                        other => other,
                    });
                }
            }
        }
        Ok(pages)
    }

    /// Clear the bits of `reservation`.
    ///
    /// # Errors
    /// `DoubleRelease` if any unit of the run is already clear; the bitmap is left untouched.
    pub fn release(&self, reservation: &Reservation) -> HeapResult<()> {
        let range = reservation.offset..reservation.end();
        let mut bits = self.bits.lock();

        if range.end > bits.len() || !bits[range.clone()].all() {
            return Err(HeapError::DoubleRelease {
                offset: reservation.offset,
                units: reservation.units,
            });
        }

        bits[range].fill(false);
        drop(bits);

        tracing::trace!(
            "bitmap: released units {}..+{}",
            reservation.offset,
            reservation.units
        );
        Ok(())
    }

    /// Whether every unit of `reservation` is currently set.
    #[must_use]
    pub fn is_reserved(&self, reservation: &Reservation) -> bool {
        let bits = self.bits.lock();
        reservation.end() <= bits.len() && bits[reservation.offset..reservation.end()].all()
    }

    /// Number of units currently reserved.
    #[must_use]
    pub fn reserved_units(&self) -> usize {
        self.bits.lock().count_ones()
    }

    /// Index of the highest reserved unit.
    #[must_use]
    pub fn highest_reserved(&self) -> Option<usize> {
        self.bits.lock().last_one()
    }
}

fn find_run(
    bits: &BitSlice<u64, Lsb0>,
    limit: usize,
    units: usize,
    align: usize,
    start: usize,
) -> Option<usize> {
    let mut idx = align_up(start, align);
    while idx + units <= limit {
        match bits[idx..idx + units].last_one() {
            None => return Some(idx),
            Some(busy) => idx = align_up(idx + busy + 1, align),
        }
    }
    None
}
