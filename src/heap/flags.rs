use super::bitmap::RoundingPolicy;
use super::MemoryType;
use crate::error::{HeapError, HeapResult};

/// Flags controlling how a request is rounded, laid out and mapped.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocFlags {
    pub exact_size: bool,
    pub single_pages: bool,
    pub no_map: bool,
    pub map_writecombine: bool,
}

impl AllocFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Round to whole units instead of the next power of two.
    #[must_use]
    pub const fn exact_size(mut self) -> Self {
        self.exact_size = true;
        self
    }

    /// Hand out individual units rather than one contiguous run.
    #[must_use]
    pub const fn single_pages(mut self) -> Self {
        self.single_pages = true;
        self
    }

    /// Caller only wants the device handle.
    #[must_use]
    pub const fn no_map(mut self) -> Self {
        self.no_map = true;
        self
    }

    #[must_use]
    pub const fn map_writecombine(mut self) -> Self {
        self.map_writecombine = true;
        self
    }

    pub(crate) const fn rounding(self) -> RoundingPolicy {
        if self.exact_size {
            RoundingPolicy::Exact
        } else {
            RoundingPolicy::PowerOfTwo
        }
    }

    pub(crate) const fn memory_type(self) -> Option<MemoryType> {
        if self.no_map {
            None
        } else if self.map_writecombine {
            Some(MemoryType::WriteCombine)
        } else {
            Some(MemoryType::Cached)
        }
    }

    /// Reject combinations that contradict each other.
    pub(crate) const fn validate(self) -> HeapResult<()> {
        if self.no_map && self.map_writecombine {
            return Err(HeapError::InvalidArgument(
                "no_map and map_writecombine are exclusive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rounds_to_power_of_two_and_maps() {
        let flags = AllocFlags::new();
        assert_eq!(flags.rounding(), RoundingPolicy::PowerOfTwo);
        assert_eq!(flags.memory_type(), Some(MemoryType::Cached));
        assert!(flags.validate().is_ok());
    }

    #[test]
    fn builder_sets_flags() {
        let flags = AllocFlags::new().exact_size().map_writecombine();
        assert_eq!(flags.rounding(), RoundingPolicy::Exact);
        assert_eq!(flags.memory_type(), Some(MemoryType::WriteCombine));
        assert_eq!(AllocFlags::new().no_map().memory_type(), None);
    }

    #[test]
    fn conflicting_mapping_flags_are_rejected() {
        let flags = AllocFlags::new().no_map().map_writecombine();
        assert!(matches!(flags.validate(), Err(HeapError::InvalidArgument(_))));
    }
}
