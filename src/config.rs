//! Process-wide runtime configuration.
//!
//! Every knob is read exactly once, at `Runtime` construction, and the
//! resulting struct is immutable from then on. Nothing in the crate consults
//! the environment after that point.

use std::env;

/// Residency forcing policy for one USM kind.
///
/// Parsed from one 4-bit sub-field of `UHAL_USM_RESIDENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResidencyPolicy {
    /// No residency forcing; the driver pages on demand.
    #[default]
    None,
    /// Force residency on the owning device only.
    Device,
    /// Force residency on every peer-capable device.
    AllDevices,
}

impl ResidencyPolicy {
    fn from_nibble(nibble: u64) -> Self {
        match nibble & 0xF {
            1 => Self::Device,
            2 => Self::AllDevices,
            _ => Self::None,
        }
    }
}

/// Immutable runtime configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Whether the USM pool allocator is enabled at all (`UHAL_USM_POOL`,
    /// default on). When off, every allocation goes straight to the driver.
    pub usm_pool: bool,
    /// Residency forcing for host allocations (`UHAL_USM_RESIDENT` bits 0-3).
    pub resident_host: ResidencyPolicy,
    /// Residency forcing for shared allocations (bits 4-7).
    pub resident_shared: ResidencyPolicy,
    /// Residency forcing for device allocations (bits 8-11).
    pub resident_device: ResidencyPolicy,
    /// Whether allocations pin their owning context
    /// (`UHAL_INDIRECT_ACCESS_TRACKING`, default off).
    pub indirect_access_tracking: bool,
    /// Whether the sanitizer layer is active (`UHAL_ENABLE_SANITIZER`,
    /// default off).
    pub sanitizer: bool,
    /// Whether CPU-class devices may be registered with the sanitizer.
    /// Requires the process itself to be built with a host address sanitizer,
    /// since the linear shadow region would otherwise alias live host memory
    /// (`UHAL_CPU_SHADOW`, default off).
    pub cpu_shadow: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            usm_pool: true,
            resident_host: ResidencyPolicy::None,
            resident_shared: ResidencyPolicy::None,
            resident_device: ResidencyPolicy::None,
            indirect_access_tracking: false,
            sanitizer: false,
            cpu_shadow: false,
        }
    }
}

impl RuntimeConfig {
    /// Reads the configuration from the process environment.
    ///
    /// Malformed values are ignored with a warning rather than failing
    /// runtime construction.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = read_flag("UHAL_USM_POOL") {
            cfg.usm_pool = v;
        }
        if let Some(v) = read_flag("UHAL_INDIRECT_ACCESS_TRACKING") {
            cfg.indirect_access_tracking = v;
        }
        if let Some(v) = read_flag("UHAL_ENABLE_SANITIZER") {
            cfg.sanitizer = v;
        }
        if let Some(v) = read_flag("UHAL_CPU_SHADOW") {
            cfg.cpu_shadow = v;
        }

        if let Ok(raw) = env::var("UHAL_USM_RESIDENT") {
            match parse_num(&raw) {
                Some(bits) => {
                    cfg.resident_host = ResidencyPolicy::from_nibble(bits);
                    cfg.resident_shared = ResidencyPolicy::from_nibble(bits >> 4);
                    cfg.resident_device = ResidencyPolicy::from_nibble(bits >> 8);
                }
                None => {
                    log::warn!("UHAL_USM_RESIDENT={raw:?} is not a number, ignoring");
                }
            }
        }

        cfg
    }

    /// Residency policy for one USM kind.
    #[must_use]
    pub const fn residency(&self, kind: crate::driver::UsmKind) -> ResidencyPolicy {
        match kind {
            crate::driver::UsmKind::Host => self.resident_host,
            crate::driver::UsmKind::Shared => self.resident_shared,
            crate::driver::UsmKind::Device | crate::driver::UsmKind::MemBuffer => {
                self.resident_device
            }
        }
    }
}

fn read_flag(name: &str) -> Option<bool> {
    let raw = env::var(name).ok()?;
    match raw.trim() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            log::warn!("{name}={other:?} is not a boolean, ignoring");
            None
        }
    }
}

fn parse_num(raw: &str) -> Option<u64> {
    let s = raw.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::UsmKind;

    #[test]
    fn defaults() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.usm_pool);
        assert!(!cfg.indirect_access_tracking);
        assert!(!cfg.sanitizer);
        assert_eq!(cfg.residency(UsmKind::Host), ResidencyPolicy::None);
    }

    #[test]
    fn residency_nibbles() {
        // 0x211: host=Device, shared=Device, device=AllDevices
        let bits = 0x211u64;
        assert_eq!(ResidencyPolicy::from_nibble(bits), ResidencyPolicy::Device);
        assert_eq!(
            ResidencyPolicy::from_nibble(bits >> 4),
            ResidencyPolicy::Device
        );
        assert_eq!(
            ResidencyPolicy::from_nibble(bits >> 8),
            ResidencyPolicy::AllDevices
        );
    }

    #[test]
    fn nibble_out_of_range_is_none() {
        assert_eq!(ResidencyPolicy::from_nibble(0xF), ResidencyPolicy::None);
    }

    #[test]
    fn parse_num_accepts_hex_and_decimal() {
        assert_eq!(parse_num("0x10"), Some(16));
        assert_eq!(parse_num("16"), Some(16));
        assert_eq!(parse_num("zz"), None);
    }
}
