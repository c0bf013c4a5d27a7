//! Device-side violation report decoding.
//!
//! Instrumented programs export one `__SanitizerReport` device-global with a
//! fixed C layout. The device writes it at most once per launch (first
//! violation wins); the host reads it back after the launch and renders a
//! diagnostic. The layout below must stay byte-compatible with the device
//! instrumentation, hence the `repr(C)` struct and the compile-time layout
//! asserts.

use std::fmt;

/// Maximum captured source-path/function length, including the NUL.
const NAME_LEN: usize = 257;

/// Raw wire layout of the report global.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawReport {
    pub flag: i32,
    pub file: [u8; NAME_LEN],
    pub line: i32,
    pub func: [u8; NAME_LEN],
    pub error_kind: i32,
    pub memory_kind: i32,
    pub access_size: u64,
    pub is_write: u8,
    pub is_recover: u8,
    pub global_id: [u64; 3],
    pub local_id: [u64; 3],
}

pub const RAW_REPORT_SIZE: usize = std::mem::size_of::<RawReport>();

const _: () = assert!(RAW_REPORT_SIZE == 600);
const _: () = assert!(std::mem::align_of::<RawReport>() == 8);
const _: () = assert!(std::mem::offset_of!(RawReport, line) == 264);
const _: () = assert!(std::mem::offset_of!(RawReport, access_size) == 536);
const _: () = assert!(std::mem::offset_of!(RawReport, local_id) == 576);

impl RawReport {
    #[must_use]
    pub const fn zeroed() -> Self {
        // All fields are plain integers; the all-zero value is the "no
        // violation" state the device starts from.
        unsafe { std::mem::zeroed() }
    }

    /// Reinterprets the bytes read back from the device-global.
    ///
    /// Returns `None` on a size mismatch, which means the program was built
    /// against a different instrumentation ABI.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != RAW_REPORT_SIZE {
            return None;
        }
        // Unaligned read: the byte buffer carries no alignment guarantee.
        Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<Self>()) })
    }
}

impl Default for RawReport {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// What went wrong, as encoded by the device instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    OutOfBounds,
    Misaligned,
    UseAfterFree,
    OutOfShadowBounds,
    Unknown,
}

impl From<i32> for ViolationKind {
    fn from(v: i32) -> Self {
        match v {
            1 => Self::OutOfBounds,
            2 => Self::Misaligned,
            3 => Self::UseAfterFree,
            4 => Self::OutOfShadowBounds,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OutOfBounds => "out-of-bounds access",
            Self::Misaligned => "misaligned access",
            Self::UseAfterFree => "use after free",
            Self::OutOfShadowBounds => "access outside shadow bounds",
            Self::Unknown => "unknown violation",
        })
    }
}

/// Which memory family the faulting access touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessedMemory {
    UsmHost,
    UsmDevice,
    UsmShared,
    Local,
    Private,
    MemBuffer,
    Unknown,
}

impl From<i32> for AccessedMemory {
    fn from(v: i32) -> Self {
        match v {
            1 => Self::UsmHost,
            2 => Self::UsmDevice,
            3 => Self::UsmShared,
            4 => Self::Local,
            5 => Self::Private,
            6 => Self::MemBuffer,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for AccessedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UsmHost => "USM host memory",
            Self::UsmDevice => "USM device memory",
            Self::UsmShared => "USM shared memory",
            Self::Local => "workgroup-local memory",
            Self::Private => "private memory",
            Self::MemBuffer => "buffer memory",
            Self::Unknown => "unknown memory",
        })
    }
}

/// Decoded, host-friendly form of a device report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationReport {
    pub error: ViolationKind,
    pub memory: AccessedMemory,
    pub access_size: u64,
    pub is_write: bool,
    /// Recoverable violations log and let the process continue.
    pub recoverable: bool,
    pub file: String,
    pub line: u32,
    pub func: String,
    pub global_id: [u64; 3],
    pub local_id: [u64; 3],
}

fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl ViolationReport {
    /// Decodes a raw report. Returns `None` while the flag is clear.
    #[must_use]
    pub fn decode(raw: &RawReport) -> Option<Self> {
        if raw.flag == 0 {
            return None;
        }
        Some(Self {
            error: ViolationKind::from(raw.error_kind),
            memory: AccessedMemory::from(raw.memory_kind),
            access_size: raw.access_size,
            is_write: raw.is_write != 0,
            recoverable: raw.is_recover != 0,
            file: c_str(&raw.file),
            line: raw.line.max(0) as u32,
            func: c_str(&raw.func),
            global_id: raw.global_id,
            local_id: raw.local_id,
        })
    }
}

impl fmt::Display for ViolationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = if self.is_write { "WRITE" } else { "READ" };
        write!(
            f,
            "{} on {} of size {} ({dir}) in {}",
            self.error, self.memory, self.access_size, self.func
        )?;
        if !self.file.is_empty() {
            write!(f, " at {}:{}", self.file, self.line)?;
        }
        write!(
            f,
            " global id ({}, {}, {}) local id ({}, {}, {})",
            self.global_id[0],
            self.global_id[1],
            self.global_id[2],
            self.local_id[0],
            self.local_id[1],
            self.local_id[2]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RawReport {
        let mut raw = RawReport::zeroed();
        raw.flag = 1;
        raw.file[..9].copy_from_slice(b"kernel.cl");
        raw.line = 42;
        raw.func[..7].copy_from_slice(b"do_work");
        raw.error_kind = 1;
        raw.memory_kind = 2;
        raw.access_size = 4;
        raw.is_write = 1;
        raw.is_recover = 0;
        raw.global_id = [63, 0, 0];
        raw.local_id = [7, 0, 0];
        raw
    }

    #[test]
    fn clear_flag_decodes_to_none() {
        assert!(ViolationReport::decode(&RawReport::zeroed()).is_none());
    }

    #[test]
    fn roundtrip_through_bytes() {
        let raw = sample();
        let bytes = unsafe {
            std::slice::from_raw_parts(
                (&raw as *const RawReport).cast::<u8>(),
                RAW_REPORT_SIZE,
            )
        };
        let back = RawReport::from_bytes(bytes).unwrap();
        let report = ViolationReport::decode(&back).unwrap();
        assert_eq!(report.error, ViolationKind::OutOfBounds);
        assert_eq!(report.memory, AccessedMemory::UsmDevice);
        assert_eq!(report.file, "kernel.cl");
        assert_eq!(report.func, "do_work");
        assert_eq!(report.line, 42);
        assert!(report.is_write);
        assert!(!report.recoverable);
        assert_eq!(report.global_id, [63, 0, 0]);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        assert!(RawReport::from_bytes(&[0u8; 4]).is_none());
    }

    #[test]
    fn unknown_enums_degrade_gracefully() {
        let mut raw = sample();
        raw.error_kind = 99;
        raw.memory_kind = -5;
        let report = ViolationReport::decode(&raw).unwrap();
        assert_eq!(report.error, ViolationKind::Unknown);
        assert_eq!(report.memory, AccessedMemory::Unknown);
        // Display never panics on odd input.
        let _ = report.to_string();
    }
}
