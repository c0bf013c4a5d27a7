//! Shadow-memory sanitizer layer.
//!
//! Mirrors every USM allocation into a per-device shadow region (one byte
//! per 8-byte granule), keeps the shadow current through asynchronous fill
//! chains, and decodes the violation reports instrumented kernels write
//! back. The layer is passive until [`crate::config::RuntimeConfig`] enables
//! it; nothing here runs for uninstrumented deployments.

pub mod launch;
pub mod report;
pub mod scheduler;
pub mod shadow;

pub use launch::{LaunchInfo, post_launch, prepare_launch};
pub use report::{AccessedMemory, RawReport, ViolationKind, ViolationReport};

use crate::driver::{DeviceHandle, DriverBackend};
use crate::error::UhalResult;
use crate::registry::{ContextInfo, DeviceInfo};
use std::sync::Arc;

/// Registers a device with the sanitizer: resolves its class and alignment
/// from the driver and assigns its shadow region bounds.
///
/// # Errors
/// `InvalidDevice` for a class without a shadow mapping (or a CPU device
/// without a host shadow present); driver errors from the reservation.
pub fn register_device<B: DriverBackend + ?Sized>(
    backend: &B,
    ctx: &ContextInfo,
    device: DeviceHandle,
    cpu_shadow: bool,
) -> UhalResult<Arc<DeviceInfo>> {
    let class = backend.device_class(device)?;
    let alignment = backend.device_alignment(device)?;
    let bounds = shadow::device_shadow_bounds(backend, ctx.handle, class, cpu_shadow)?;

    let info = Arc::new(DeviceInfo::new(Some(device), class, alignment));
    // First registration wins; re-registering the same device is a no-op.
    info.shadow.set(bounds).ok();
    ctx.add_device(info.clone());
    log::debug!(
        "device {:#x} ({class:?}) shadow {:#x}..{:#x}",
        device.0,
        bounds.begin,
        bounds.end
    );
    Ok(info)
}
