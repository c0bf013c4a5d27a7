//! Shadow memory layout: address translation and redzone sizing.
//!
//! One shadow byte covers an 8-byte granule of application memory. The
//! translation from an application address to its shadow cell depends only on
//! the device class, so the whole mapping is a [`ShadowLayout`] value built
//! once per device and dispatched through the closed [`DeviceClass`] tag.

use crate::driver::{ContextHandle, DeviceClass, DriverBackend, UsmKind};
use crate::error::{UhalError, UhalResult};
use crate::registry::ShadowBounds;
use crate::usm::round_up;
use once_cell::sync::OnceCell;
use std::collections::BTreeSet;
use std::sync::Mutex;

/// log2 of the shadow granularity: one shadow byte per 8 application bytes.
pub const SHADOW_SCALE: u32 = 3;
pub const SHADOW_GRANULARITY: u64 = 1 << SHADOW_SCALE;

/// Fixed linear-device shadow base, matching the conventional host
/// address-sanitizer layout so both shadows coexist in one process.
pub const CPU_SHADOW_OFFSET: u64 = 0x7FFF_8000;

/// Low 47 bits of a split-address-space pointer.
const SPLIT_LOW_MASK: u64 = 0x7FFF_FFFF_FFFF;
/// Start of the device-private shadow sub-region, relative to the
/// reservation base.
const SPLIT_DEVICE_REGION: u64 = 0x2000_0000_0000;
/// Size of the one-per-process split-address shadow reservation.
pub const SPLIT_SHADOW_SIZE: u64 = 1 << 46;

/// Stride of the shadow page-backing walk.
pub const SHADOW_PAGE_SIZE: u64 = 4096;

const RZ_MIN: u64 = 16;
const RZ_MAX: u64 = 2048;

// ===============================================================================================
// Shadow byte encoding
// ===============================================================================================

/// Shadow byte values: 0 = all 8 bytes accessible, 1..=7 = that many leading
/// bytes accessible, and per-kind magic values for fully poisoned redzones.
/// Distinct magics exist only so a report can name the allocation kind.
#[must_use]
pub const fn redzone_magic(kind: UsmKind) -> u8 {
    match kind {
        UsmKind::Device => 0x81,
        UsmKind::Host => 0x82,
        UsmKind::Shared => 0x83,
        UsmKind::MemBuffer => 0x84,
    }
}

// ===============================================================================================
// Redzone sizing
// ===============================================================================================

/// Size-class table keyed by the user allocation size: a fixed set of powers
/// of two, monotone in the request size, capped at [`RZ_MAX`].
#[must_use]
pub const fn redzone_table(user_size: u64) -> u64 {
    let log: u64 = if user_size <= 64 - 16 {
        0
    } else if user_size <= 128 - 32 {
        1
    } else if user_size <= 512 - 64 {
        2
    } else if user_size <= 4096 - 128 {
        3
    } else if user_size <= (1 << 14) - 256 {
        4
    } else if user_size <= (1 << 15) - 512 {
        5
    } else if user_size <= (1 << 16) - 1024 {
        6
    } else {
        7
    };
    RZ_MIN << log
}

/// Effective redzone for a request: at least the table value, and at least
/// the alignment so `user_begin = alloc_begin + redzone` stays aligned.
#[must_use]
pub const fn redzone_size(user_size: u64, alignment: u64) -> u64 {
    let table = redzone_table(user_size);
    if alignment > table { alignment } else { table }
}

/// Total driver bytes needed for a sanitized allocation:
/// `[left redzone][user, rounded to alignment][right redzone]`.
#[must_use]
pub const fn needed_size(user_size: u64, alignment: u64) -> u64 {
    round_up(user_size, alignment) + 2 * redzone_size(user_size, alignment)
}

// ===============================================================================================
// Address translation
// ===============================================================================================

/// Per-device shadow mapping: class tag plus the device's shadow bounds.
#[derive(Debug, Clone, Copy)]
pub struct ShadowLayout {
    pub class: DeviceClass,
    pub bounds: ShadowBounds,
}

impl ShadowLayout {
    /// Shadow cell address covering the granule that contains `addr`.
    ///
    /// # Errors
    /// `InvalidDevice` for the `Unknown` class.
    pub fn cell(&self, addr: u64) -> UhalResult<u64> {
        match self.class {
            DeviceClass::Cpu => Ok(self.bounds.begin + (addr >> SHADOW_SCALE)),
            DeviceClass::SplitAddress => {
                let low = (addr & SPLIT_LOW_MASK) >> SHADOW_SCALE;
                if addr & !SPLIT_LOW_MASK != 0 {
                    // Device-private memory lives in its own sub-region so it
                    // can never alias host/shared shadow cells.
                    Ok(self.bounds.begin + SPLIT_DEVICE_REGION + low)
                } else {
                    Ok(self.bounds.begin + low)
                }
            }
            DeviceClass::Unknown => Err(UhalError::InvalidDevice(0)),
        }
    }

    /// Shadow range `[cell(begin), cell(end - 1)]` covering an application
    /// byte range, inclusive of the final cell.
    ///
    /// # Errors
    /// Propagates translation failure.
    pub fn cell_range(&self, begin: u64, end: u64) -> UhalResult<(u64, u64)> {
        debug_assert!(begin < end);
        Ok((self.cell(begin)?, self.cell(end - 1)?))
    }
}

// ===============================================================================================
// Device shadow-region initialization
// ===============================================================================================

static SPLIT_SHADOW: OnceCell<ShadowBounds> = OnceCell::new();

/// Shadow pages of the split-address reservation that are already backed by
/// physical memory. Shared process-wide because the reservation itself is.
static MAPPED_SHADOW_PAGES: Mutex<BTreeSet<u64>> = Mutex::new(BTreeSet::new());

/// Marks `page` as backed. Returns false when it already was.
///
/// # Panics
/// Panics if the page-set mutex is poisoned.
pub(crate) fn mark_page_backed(page: u64) -> bool {
    MAPPED_SHADOW_PAGES.lock().unwrap().insert(page)
}

/// Whether `page` of the split shadow region is already backed.
///
/// # Panics
/// Panics if the page-set mutex is poisoned.
pub(crate) fn page_is_backed(page: u64) -> bool {
    MAPPED_SHADOW_PAGES.lock().unwrap().contains(&page)
}

/// Resolves the shadow bounds for a device being registered.
///
/// The split-address reservation is a process-lifetime singleton: the driver
/// family behind this class shares one virtual address space across contexts,
/// so the region is reserved on first use and never released.
///
/// # Errors
/// `InvalidDevice` when the class is unsupported (or Cpu without a host
/// sanitizer present); driver errors from the reservation.
pub fn device_shadow_bounds<B: DriverBackend + ?Sized>(
    backend: &B,
    ctx: ContextHandle,
    class: DeviceClass,
    cpu_shadow: bool,
) -> UhalResult<ShadowBounds> {
    match class {
        DeviceClass::Cpu => {
            if !cpu_shadow {
                return Err(UhalError::InvalidDevice(0));
            }
            // The host sanitizer owns the region; we only compute into it.
            Ok(ShadowBounds {
                begin: CPU_SHADOW_OFFSET,
                end: CPU_SHADOW_OFFSET + ((SPLIT_LOW_MASK + 1) >> SHADOW_SCALE),
            })
        }
        DeviceClass::SplitAddress => SPLIT_SHADOW
            .get_or_try_init(|| {
                let begin = backend.reserve_virtual(ctx, SPLIT_SHADOW_SIZE)?;
                log::debug!(
                    "reserved split-address shadow region {begin:#x}..{:#x}",
                    begin + SPLIT_SHADOW_SIZE
                );
                Ok(ShadowBounds {
                    begin,
                    end: begin + SPLIT_SHADOW_SIZE,
                })
            })
            .copied(),
        DeviceClass::Unknown => Err(UhalError::InvalidDevice(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_layout(base: u64) -> ShadowLayout {
        ShadowLayout {
            class: DeviceClass::SplitAddress,
            bounds: ShadowBounds {
                begin: base,
                end: base + SPLIT_SHADOW_SIZE,
            },
        }
    }

    #[test]
    fn redzone_is_monotone_and_capped() {
        let mut prev = 0;
        for size in [0u64, 16, 48, 96, 448, 3968, 16000, 32000, 65000, 1 << 20] {
            let rz = redzone_table(size);
            assert!(rz >= prev, "table must be non-decreasing");
            assert!(rz.is_power_of_two());
            assert!((RZ_MIN..=RZ_MAX).contains(&rz));
            prev = rz;
        }
        assert_eq!(redzone_table(16), RZ_MIN);
        assert_eq!(redzone_table(1 << 30), RZ_MAX);
    }

    #[test]
    fn alignment_inflates_redzone() {
        assert_eq!(redzone_size(16, 8), 16);
        assert_eq!(redzone_size(16, 4096), 4096);
        // alloc_size invariant holds with the inflated redzone.
        assert_eq!(needed_size(16, 4096), 4096 + 2 * 4096);
    }

    #[test]
    fn linear_translation_collides_only_within_a_granule() {
        let layout = ShadowLayout {
            class: DeviceClass::Cpu,
            bounds: ShadowBounds {
                begin: CPU_SHADOW_OFFSET,
                end: u64::MAX,
            },
        };
        assert_eq!(layout.cell(0x1000).unwrap(), layout.cell(0x1007).unwrap());
        assert_ne!(layout.cell(0x1000).unwrap(), layout.cell(0x1008).unwrap());
        assert_eq!(layout.cell(0).unwrap(), CPU_SHADOW_OFFSET);
    }

    #[test]
    fn split_high_region_never_aliases_low() {
        let layout = split_layout(0x4000_0000_0000);
        let low_addr = 0x7F12_3456_7890u64;
        let high_addr = 0xFF00_0000_0000_0000u64 | low_addr;

        let low_cell = layout.cell(low_addr).unwrap();
        let high_cell = layout.cell(high_addr).unwrap();
        assert_ne!(low_cell, high_cell);
        assert_eq!(high_cell - low_cell, SPLIT_DEVICE_REGION);

        // Both sub-regions stay inside the reservation.
        assert!(low_cell < layout.bounds.end);
        assert!(high_cell < layout.bounds.end);
    }

    #[test]
    fn split_cells_stay_in_bounds_at_extremes() {
        let layout = split_layout(0x4000_0000_0000);
        for addr in [0u64, SPLIT_LOW_MASK, u64::MAX] {
            let cell = layout.cell(addr).unwrap();
            assert!(cell >= layout.bounds.begin && cell < layout.bounds.end);
        }
    }

    #[test]
    fn cell_range_is_inclusive() {
        let layout = split_layout(0x4000_0000_0000);
        let (lo, hi) = layout.cell_range(0x1000, 0x1010).unwrap();
        assert_eq!(hi - lo, 1, "16 bytes span two shadow cells");
        let (lo, hi) = layout.cell_range(0x1000, 0x1008).unwrap();
        assert_eq!(lo, hi, "8 aligned bytes span one cell");
    }

    #[test]
    fn unknown_class_is_rejected() {
        let layout = ShadowLayout {
            class: DeviceClass::Unknown,
            bounds: ShadowBounds { begin: 0, end: 0 },
        };
        assert!(layout.cell(0x1000).is_err());
    }

    #[test]
    fn magic_values_are_distinct() {
        let magics = [
            redzone_magic(UsmKind::Host),
            redzone_magic(UsmKind::Device),
            redzone_magic(UsmKind::Shared),
            redzone_magic(UsmKind::MemBuffer),
        ];
        for (i, a) in magics.iter().enumerate() {
            assert!(*a > 0x80, "poison magics must be out of the 0..=7 range");
            for b in &magics[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
