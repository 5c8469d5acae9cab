#![allow(clippy::cast_possible_truncation)]

//! Growing and shrinking the heap window one chunk at a time.
//!
//! Everything here runs with the coordinator lock held; `HeapState` is
//! borrowed mutably from the guard.

use super::bitmap::Bitmap;
use super::state::{Geometry, HeapState, Window};
use super::{NotifyError, ResizeNotifier};
use crate::config::RetryPolicy;
use crate::error::{FullReason, HeapError, HeapResult};
use crate::pool::{ChunkPool, PoolError};
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Side {
    Left,
    Right,
}

pub(super) struct Resizer<'a> {
    pub name: &'a str,
    pub geom: &'a Geometry,
    pub bitmap: &'a Bitmap,
    pub pool: &'a ChunkPool,
    pub notifier: Option<&'a dyn ResizeNotifier>,
    pub retry: RetryPolicy,
}

impl Resizer<'_> {
    /// Grow by one chunk next to the window and announce the new window.
    ///
    /// If the notifier refuses, the chunk goes back to the pool and the
    /// previous window is restored.
    pub fn grow(&self, state: &mut HeapState) -> HeapResult<()> {
        let before = state.window;
        self.extend(state)?;

        if let Err(e) = self.notify(state.window) {
            tracing::warn!(
                "{}: notifier rejected grow to 0x{:x}+0x{:x}: {}",
                self.name,
                state.window.base,
                state.window.len,
                e
            );
            self.restore(state, before);
            return Err(HeapError::HeapFull(FullReason::NotifierRejected));
        }

        tracing::debug!(
            "{}: grew to 0x{:x}+0x{:x}",
            self.name,
            state.window.base,
            state.window.len
        );
        Ok(())
    }

    /// Grow until the window is at least `floor` bytes, then make it the new floor.
    ///
    /// Either the whole growth sticks or every chunk acquired here is returned
    /// and the old floor stays.
    pub fn grow_to_floor(&self, state: &mut HeapState, floor: u64) -> HeapResult<()> {
        let floor = floor.min(self.geom.pool_len);
        let before = state.window;
        let (mut left, mut right) = (0usize, 0usize);

        while state.window.len < floor {
            match self.extend(state) {
                Ok(Side::Left) => left += 1,
                Ok(Side::Right) => right += 1,
                Err(e) => {
                    tracing::debug!(
                        "{}: floor 0x{:x} unreachable, undoing {} left and {} right chunks",
                        self.name,
                        floor,
                        left,
                        right
                    );
                    self.restore(state, before);
                    return Err(e);
                }
            }
        }

        if state.window != before {
            if let Err(e) = self.notify(state.window) {
                tracing::warn!("{}: notifier rejected floor growth: {}", self.name, e);
                self.restore(state, before);
                return Err(HeapError::HeapFull(FullReason::NotifierRejected));
            }
        }

        state.floor = floor;
        Ok(())
    }

    /// Hand idle edge chunks back to the pool, never going below the floor.
    ///
    /// Returns the number of chunks reclaimed. A notifier failure is logged
    /// and the reclaim stands.
    pub fn shrink(&self, state: &mut HeapState) -> usize {
        if state.window.len <= state.floor {
            return 0;
        }

        let mut reclaimed = 0;
        while let (Some(first), Some(last)) = (
            state.window.first_chunk(self.geom),
            state.window.last_chunk(self.geom),
        ) {
            if self.reclaim(state, last, Side::Right)
                || (first != last && self.reclaim(state, first, Side::Left))
            {
                reclaimed += 1;
            } else {
                break;
            }
        }

        if reclaimed > 0 {
            tracing::debug!(
                "{}: shrank by {} chunks to 0x{:x}+0x{:x}",
                self.name,
                reclaimed,
                state.window.base,
                state.window.len
            );
            if let Err(e) = self.notify(state.window) {
                tracing::warn!(
                    "{}: notifier failed after shrink to 0x{:x}+0x{:x}: {}",
                    self.name,
                    state.window.base,
                    state.window.len,
                    e
                );
            }
        }
        reclaimed
    }

    /// Return every owned chunk without consulting the bitmap or the notifier.
    pub fn release_all(&self, state: &mut HeapState) {
        self.free_outside(state.window, None);
        self.set_window(state, self.empty_window());
    }

    /// Take one chunk adjacent to the window, without notifying.
    fn extend(&self, state: &mut HeapState) -> HeapResult<Side> {
        let window = state.window;
        let (Some(first), Some(last)) = (
            window.first_chunk(self.geom),
            window.last_chunk(self.geom),
        ) else {
            self.acquire(0).map_err(HeapError::HeapFull)?;
            let grown = Window {
                base: self.geom.chunk_start(0),
                len: self.geom.chunk_len(0),
            };
            self.set_window(state, grown);
            return Ok(Side::Right);
        };

        let mut reason = FullReason::NoAdjacentChunk;

        if first > 0 {
            match self.acquire(first - 1) {
                Ok(()) => {
                    let len = self.geom.chunk_len(first - 1);
                    let grown = Window {
                        base: window.base - len,
                        len: window.len + len,
                    };
                    self.set_window(state, grown);
                    return Ok(Side::Left);
                }
                Err(r) => reason = r,
            }
        }

        if last + 1 < self.geom.num_chunks {
            match self.acquire(last + 1) {
                Ok(()) => {
                    let grown = Window {
                        base: window.base,
                        len: window.len + self.geom.chunk_len(last + 1),
                    };
                    self.set_window(state, grown);
                    return Ok(Side::Right);
                }
                Err(r) => reason = r,
            }
        }

        Err(HeapError::HeapFull(reason))
    }

    /// Place chunk `index` in the pool, retrying while the pool reports contention.
    fn acquire(&self, index: usize) -> Result<(), FullReason> {
        let start = self.geom.chunk_start(index);
        let len = self.geom.chunk_len(index);
        let mut attempt = 1;

        loop {
            match self.pool.alloc_at(start, len) {
                Ok(_) => return Ok(()),
                Err(PoolError::Transient) if attempt < self.retry.attempts => {
                    attempt += 1;
                    thread::sleep(self.retry.delay);
                }
                Err(PoolError::Transient) => {
                    tracing::debug!(
                        "{}: chunk {} still busy after {} attempts",
                        self.name,
                        index,
                        attempt
                    );
                    return Err(FullReason::PoolBusy);
                }
                Err(e) => {
                    tracing::debug!("{}: chunk {} unavailable: {}", self.name, index, e);
                    return Err(FullReason::PoolExhausted);
                }
            }
        }
    }

    /// Reclaim edge chunk `index` if no reservation touches it.
    fn reclaim(&self, state: &mut HeapState, index: usize, side: Side) -> bool {
        let start = self.geom.chunk_start(index);
        let len = self.geom.chunk_len(index);
        if state.window.len - len < state.floor {
            return false;
        }

        let unit = self.geom.unit_of(start);
        let units = (len >> self.geom.alloc_shift) as usize;
        let Ok(probe) = self.bitmap.reserve_run(units, 1, unit) else {
            return false;
        };

        let placed = probe.offset() == unit;
        if let Err(e) = self.bitmap.release(&probe) {
            tracing::error!("{}: probe of chunk {} lost: {}", self.name, index, e);
            return false;
        }
        if !placed {
            return false;
        }

        self.pool.free(start, len);
        let window = match side {
            Side::Left => Window {
                base: state.window.base + len,
                len: state.window.len - len,
            },
            Side::Right => Window {
                base: state.window.base,
                len: state.window.len - len,
            },
        };
        self.set_window(state, window);
        true
    }

    /// Roll back to `before`, returning chunks acquired since.
    fn restore(&self, state: &mut HeapState, before: Window) {
        self.free_outside(state.window, Some(before));
        self.set_window(state, before);
    }

    /// Free the chunks of `current` that `keep` does not cover.
    fn free_outside(&self, current: Window, keep: Option<Window>) {
        let (Some(first), Some(last)) = (
            current.first_chunk(self.geom),
            current.last_chunk(self.geom),
        ) else {
            return;
        };

        for index in first..=last {
            let start = self.geom.chunk_start(index);
            if keep.is_some_and(|k| k.contains(start)) {
                continue;
            }
            self.pool.free(start, self.geom.chunk_len(index));
        }
    }

    fn set_window(&self, state: &mut HeapState, window: Window) {
        state.window = if window.is_empty() {
            self.empty_window()
        } else {
            window
        };
        self.bitmap
            .set_reservable_units(state.window.reservable_units(self.geom));
    }

    const fn empty_window(&self) -> Window {
        Window {
            base: self.geom.pool_base,
            len: 0,
        }
    }

    fn notify(&self, window: Window) -> Result<(), NotifyError> {
        self.notifier
            .map_or(Ok(()), |n| n.resized(window.base, window.len))
    }
}
