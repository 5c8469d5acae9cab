use thiserror::Error;

/// Why the heap could not grow by another chunk.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullReason {
    #[error("no chunk adjacent to the window is available")]
    NoAdjacentChunk,

    #[error("backing pool refused the adjacent chunk")]
    PoolExhausted,

    #[error("backing pool stayed busy after retries")]
    PoolBusy,

    #[error("resize notifier rejected the new window")]
    NotifierRejected,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("No free run of {units} units inside the heap window")]
    OutOfSpace { units: usize },

    #[error("Heap full: {0}")]
    HeapFull(FullReason),

    #[error("Double release of units {offset}..+{units}")]
    DoubleRelease { offset: usize, units: usize },
}

// A convenient alias
pub type HeapResult<T> = Result<T, HeapError>;
