pub mod manager;
pub mod pool;

use crate::driver::{DeviceHandle, UsmKind};

/// Description of one live USM allocation.
///
/// Immutable from creation until the matching free. `alloc_begin` is the raw
/// driver pointer (including the left redzone in sanitized builds);
/// `[user_begin, user_end)` is the range handed to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocInfo {
    pub alloc_begin: u64,
    pub user_begin: u64,
    pub user_end: u64,
    /// Total driver allocation size: left redzone + rounded user size +
    /// right redzone.
    pub alloc_size: u64,
    pub kind: UsmKind,
    /// Owning device; `None` for host allocations.
    pub device: Option<DeviceHandle>,
}

impl AllocInfo {
    /// Requested user size.
    #[must_use]
    pub const fn user_size(&self) -> u64 {
        self.user_end - self.user_begin
    }

    /// End of the raw driver allocation.
    #[must_use]
    pub const fn alloc_end(&self) -> u64 {
        self.alloc_begin + self.alloc_size
    }

    /// Whether `ptr` falls inside the raw allocation range.
    #[must_use]
    pub const fn contains(&self, ptr: u64) -> bool {
        ptr >= self.alloc_begin && ptr < self.alloc_end()
    }

    #[cfg(debug_assertions)]
    pub(crate) fn debug_check(&self) {
        debug_assert!(self.alloc_begin <= self.user_begin);
        debug_assert!(self.user_begin <= self.user_end);
        debug_assert!(self.user_end <= self.alloc_end());
    }
}

/// Optional per-allocation descriptor carried by the allocate entry points.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsmDescriptor {
    /// Requested alignment; 0 selects the device default. Must be a power of
    /// two when non-zero.
    pub alignment: u64,
}

impl UsmDescriptor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }
}

/// Rounds `val` up to the next multiple of `align` (power of two).
#[must_use]
pub const fn round_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_basics() {
        assert_eq!(round_up(0, 8), 0);
        assert_eq!(round_up(1, 8), 8);
        assert_eq!(round_up(8, 8), 8);
        assert_eq!(round_up(17, 16), 32);
    }

    #[test]
    fn alloc_info_ranges() {
        let info = AllocInfo {
            alloc_begin: 0x1000,
            user_begin: 0x1020,
            user_end: 0x1030,
            alloc_size: 0x60,
            kind: UsmKind::Device,
            device: Some(DeviceHandle(1)),
        };
        assert_eq!(info.user_size(), 0x10);
        assert_eq!(info.alloc_end(), 0x1060);
        assert!(info.contains(0x1000));
        assert!(info.contains(0x105F));
        assert!(!info.contains(0x1060));
    }
}
