use std::time::Duration;

/// Default allocation unit: one 4 KiB page.
pub const DEFAULT_ALLOC_SHIFT: u32 = 12;
/// Power-of-two requests are aligned to at most `1 << 8` units.
pub const DEFAULT_ALIGN_CAP_ORDER: u32 = 8;
/// Largest unit the sub-allocator accepts (1 GiB).
pub const MAX_ALLOC_SHIFT: u32 = 30;

/// How often a transient pool failure is retried while growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(1),
        }
    }
}

/// Where idle chunks are handed back to the backing pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShrinkPolicy {
    /// `release` shrinks the heap on the caller's thread.
    Inline,
    /// A worker thread shrinks the heap once releases have been quiet for `delay`.
    Background { delay: Duration },
}

impl Default for ShrinkPolicy {
    fn default() -> Self {
        Self::Background {
            delay: Duration::from_millis(50),
        }
    }
}

/// Declaration parameters of a resizable heap.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    pub name: String,
    /// Chunk size in bytes; zero means one chunk spanning the whole pool.
    pub chunk_size: u64,
    pub alloc_shift: u32,
    /// Device-visible address of the pool base. Defaults to the pool's physical base.
    pub device_base: Option<u64>,
    pub align_cap_order: u32,
    pub retry: RetryPolicy,
    pub shrink: ShrinkPolicy,
}

impl HeapConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chunk_size: 0,
            alloc_shift: DEFAULT_ALLOC_SHIFT,
            device_base: None,
            align_cap_order: DEFAULT_ALIGN_CAP_ORDER,
            retry: RetryPolicy::default(),
            shrink: ShrinkPolicy::default(),
        }
    }

    #[must_use]
    pub const fn chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    #[must_use]
    pub const fn alloc_shift(mut self, shift: u32) -> Self {
        self.alloc_shift = shift;
        self
    }

    #[must_use]
    pub const fn device_base(mut self, addr: u64) -> Self {
        self.device_base = Some(addr);
        self
    }

    #[must_use]
    pub const fn align_cap_order(mut self, order: u32) -> Self {
        self.align_cap_order = order;
        self
    }

    #[must_use]
    pub const fn retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry = RetryPolicy { attempts, delay };
        self
    }

    #[must_use]
    pub const fn inline_shrink(mut self) -> Self {
        self.shrink = ShrinkPolicy::Inline;
        self
    }

    #[must_use]
    pub const fn background_shrink(mut self, delay: Duration) -> Self {
        self.shrink = ShrinkPolicy::Background { delay };
        self
    }
}
