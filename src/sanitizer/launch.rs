//! Per-launch sanitizer plumbing.
//!
//! Before a kernel runs, the instrumented program needs to know where the
//! device's shadow region lives; after it runs, the host reads back the
//! violation report the instrumentation may have written. Both sides are
//! ordinary device-global IO on the launching queue, chained on the queue's
//! event tail like everything else.

use crate::driver::{
    ContextHandle, DeviceClass, DriverBackend, EventHandle, LaunchDims, ProgramHandle, QueueHandle,
};
use crate::error::{UhalError, UhalResult};
use crate::registry::ContextInfo;
use crate::sanitizer::report::{RAW_REPORT_SIZE, RawReport, ViolationReport};
use crate::sanitizer::scheduler;
use crate::sanitizer::shadow::SHADOW_SCALE;

/// Device-global names the instrumentation exports. A program missing them
/// was built without instrumentation and is launched untouched.
pub const GLOBAL_SHADOW_BEGIN: &str = "__ShadowMemoryGlobalStart";
pub const GLOBAL_SHADOW_END: &str = "__ShadowMemoryGlobalEnd";
pub const GLOBAL_DEVICE_TYPE: &str = "__DeviceType";
pub const GLOBAL_LOCAL_BEGIN: &str = "__ShadowMemoryLocalStart";
pub const GLOBAL_LOCAL_END: &str = "__ShadowMemoryLocalEnd";
pub const GLOBAL_REPORT: &str = "__SanitizerReport";

/// Device-type tags understood by the instrumentation.
const DEVICE_TAG_UNKNOWN: u64 = 0;
const DEVICE_TAG_CPU: u64 = 1;
const DEVICE_TAG_SPLIT: u64 = 2;

const fn device_tag(class: DeviceClass) -> u64 {
    match class {
        DeviceClass::Cpu => DEVICE_TAG_CPU,
        DeviceClass::SplitAddress => DEVICE_TAG_SPLIT,
        DeviceClass::Unknown => DEVICE_TAG_UNKNOWN,
    }
}

/// Per-launch resources. The workgroup-local shadow buffer lives only as
/// long as one launch; dropping the value releases it.
pub struct LaunchInfo<'a, B: DriverBackend + ?Sized> {
    backend: &'a B,
    ctx: ContextHandle,
    local_shadow: Option<(u64, u64)>,
}

impl<B: DriverBackend + ?Sized> LaunchInfo<'_, B> {
    /// Base and size of the workgroup-local shadow buffer, when one was
    /// allocated for this launch.
    #[must_use]
    pub fn local_shadow(&self) -> Option<(u64, u64)> {
        self.local_shadow
    }
}

impl<B: DriverBackend + ?Sized> Drop for LaunchInfo<'_, B> {
    fn drop(&mut self) {
        if let Some((base, _)) = self.local_shadow
            && let Err(err) = self.backend.free(self.ctx, base)
        {
            log::error!("failed to release local shadow at {base:#x}: {err}");
        }
    }
}

/// Writes a device-global if the program declares it with the expected size.
fn write_global<B: DriverBackend + ?Sized>(
    backend: &B,
    queue: QueueHandle,
    program: ProgramHandle,
    name: &str,
    data: &[u8],
    chain: &mut Option<EventHandle>,
) -> UhalResult<()> {
    match backend.device_global_size(program, name) {
        None => Ok(()),
        Some(size) if size as usize != data.len() => {
            log::warn!(
                "device-global {name} is {size} bytes, expected {}; skipping",
                data.len()
            );
            Ok(())
        }
        Some(_) => {
            let ev = backend.enqueue_global_write(queue, program, name, 0, data, chain.as_slice())?;
            *chain = Some(ev);
            Ok(())
        }
    }
}

/// Prepares one kernel launch: brings the shadow up to date, then publishes
/// the shadow bounds, device tag, and (off-CPU) a zeroed workgroup-local
/// shadow buffer to the instrumented program.
///
/// The returned [`LaunchInfo`] owns the local shadow buffer; keep it alive
/// until the launch completes.
///
/// # Errors
/// `InvalidArgument` for an unknown queue; `InvalidDevice` when the queue's
/// device never got shadow bounds; driver errors propagate.
pub fn prepare_launch<'a, B: DriverBackend + ?Sized>(
    backend: &'a B,
    ctx: &ContextInfo,
    queue_handle: QueueHandle,
    program: ProgramHandle,
    dims: &LaunchDims,
) -> UhalResult<LaunchInfo<'a, B>> {
    scheduler::update_all_shadow(backend, ctx, queue_handle)?;

    let queue = ctx
        .queue(queue_handle)
        .ok_or_else(|| UhalError::InvalidArgument(format!("unknown queue {:#x}", queue_handle.0)))?;
    let device = ctx
        .device(Some(queue.device))
        .ok_or(UhalError::InvalidDevice(queue.device.0))?;
    let bounds = *device
        .shadow
        .get()
        .ok_or(UhalError::InvalidDevice(queue.device.0))?;

    let mut chain = queue.last_event();
    write_global(
        backend,
        queue_handle,
        program,
        GLOBAL_SHADOW_BEGIN,
        &bounds.begin.to_ne_bytes(),
        &mut chain,
    )?;
    write_global(
        backend,
        queue_handle,
        program,
        GLOBAL_SHADOW_END,
        &bounds.end.to_ne_bytes(),
        &mut chain,
    )?;
    write_global(
        backend,
        queue_handle,
        program,
        GLOBAL_DEVICE_TYPE,
        &device_tag(device.class).to_ne_bytes(),
        &mut chain,
    )?;

    // CPU-class devices share the host shadow for local memory too; every
    // other class gets a per-launch buffer sized for the worst case of every
    // workgroup using all of local memory.
    let mut local_shadow = None;
    if device.class != DeviceClass::Cpu
        && backend.device_global_size(program, GLOBAL_LOCAL_BEGIN).is_some()
    {
        let local_mem = backend.device_local_mem_size(queue.device)?;
        let size = dims.workgroup_count() * (local_mem >> SHADOW_SCALE);
        if size > 0 {
            let base = backend.alloc_device(ctx.handle, queue.device, size, 8)?;
            let ev = backend.enqueue_fill(queue_handle, base, &[0u8], size, chain.as_slice())?;
            chain = Some(ev);
            write_global(
                backend,
                queue_handle,
                program,
                GLOBAL_LOCAL_BEGIN,
                &base.to_ne_bytes(),
                &mut chain,
            )?;
            write_global(
                backend,
                queue_handle,
                program,
                GLOBAL_LOCAL_END,
                &(base + size).to_ne_bytes(),
                &mut chain,
            )?;
            local_shadow = Some((base, size));
        }
    }

    if let Some(ev) = chain {
        queue.store_last_event(ev);
    }

    Ok(LaunchInfo {
        backend,
        ctx: ctx.handle,
        local_shadow,
    })
}

/// Reads back the violation report after a launch.
///
/// With `blocking` the read has completed on return and the report is
/// decoded. Otherwise the read is merely enqueued after the kernel; the
/// returned event tells the caller when the report global is stable, and a
/// later blocking call decodes it. Nothing is decoded before the event
/// completes. A program without the report global is simply uninstrumented
/// and yields no report.
///
/// # Errors
/// Driver errors from the enqueued read.
pub fn post_launch<B: DriverBackend + ?Sized>(
    backend: &B,
    ctx: &ContextInfo,
    queue_handle: QueueHandle,
    program: ProgramHandle,
    blocking: bool,
) -> UhalResult<(Option<ViolationReport>, Option<EventHandle>)> {
    match backend.device_global_size(program, GLOBAL_REPORT) {
        None => return Ok((None, None)),
        Some(size) if size as usize != RAW_REPORT_SIZE => {
            log::warn!(
                "report global is {size} bytes, expected {RAW_REPORT_SIZE}; \
                 instrumentation ABI mismatch, skipping report"
            );
            return Ok((None, None));
        }
        Some(_) => {}
    }

    let queue = ctx
        .queue(queue_handle)
        .ok_or_else(|| UhalError::InvalidArgument(format!("unknown queue {:#x}", queue_handle.0)))?;

    let mut buf = vec![0u8; RAW_REPORT_SIZE];
    let wait = queue.last_event();
    let ev = backend.enqueue_global_read(
        queue_handle,
        program,
        GLOBAL_REPORT,
        0,
        blocking,
        &mut buf,
        wait.as_slice(),
    )?;
    queue.store_last_event(ev);

    if !blocking {
        // The buffer holds nothing trustworthy until the event completes.
        return Ok((None, Some(ev)));
    }

    let report = RawReport::from_bytes(&buf).and_then(|raw| ViolationReport::decode(&raw));
    if let Some(report) = &report {
        log::error!("{report}");
    }
    Ok((report, None))
}
