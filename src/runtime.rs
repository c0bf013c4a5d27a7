//! The composed runtime surface.
//!
//! A [`Runtime`] owns one backend plus the allocation registry, the pooled
//! USM allocator, and (when enabled) the sanitizer layer, and sequences them
//! so callers only see context/device/queue lifecycle hooks, allocate/free,
//! and kernel launch.

use crate::config::{ResidencyPolicy, RuntimeConfig};
use crate::driver::{
    ContextHandle, DeviceHandle, DriverBackend, EventHandle, KernelHandle, LaunchDims,
    ProgramHandle, QueueHandle, UsmKind,
};
use crate::error::{UhalError, UhalResult};
use crate::registry::{ContextInfo, DeviceInfo, QueueInfo, Registry};
use crate::sanitizer;
use crate::sanitizer::shadow::{SHADOW_GRANULARITY, needed_size, redzone_size};
use crate::usm::manager::{PoolHandle, UsmManager};
use crate::usm::pool::PoolStats;
use crate::usm::{AllocInfo, UsmDescriptor};
use std::sync::Arc;

pub struct Runtime<B: DriverBackend> {
    backend: Arc<B>,
    config: RuntimeConfig,
    registry: Registry,
    manager: UsmManager<B>,
}

impl<B: DriverBackend> Runtime<B> {
    #[must_use]
    pub fn new(backend: Arc<B>, config: RuntimeConfig) -> Self {
        let manager = UsmManager::new(backend.clone(), config.usm_pool);
        Self {
            backend,
            config,
            registry: Registry::new(),
            manager,
        }
    }

    /// Builds a runtime configured from the process environment.
    #[must_use]
    pub fn from_env(backend: Arc<B>) -> Self {
        Self::new(backend, RuntimeConfig::from_env())
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    // --- Lifecycle hooks ----------------------------------------------------

    /// Starts tracking a driver context.
    pub fn add_context(&self, ctx: ContextHandle) {
        self.registry.add_context(ctx);
        log::debug!("context {:#x} registered", ctx.0);
    }

    /// Stops tracking a context and tears down its pools.
    ///
    /// A context still pinned by indirect-access-tracked allocations stays
    /// alive (and freeable) until its last tracked allocation goes away;
    /// teardown then happens on that final free.
    ///
    /// # Errors
    /// `InvalidContext` for an unknown handle; driver errors from slab
    /// release.
    pub fn remove_context(&self, ctx: ContextHandle) -> UhalResult<()> {
        self.registry
            .remove_context(ctx)
            .ok_or(UhalError::InvalidContext(ctx.0))?;
        if self.registry.is_retained(ctx) {
            log::debug!("context {:#x} removal deferred, pins outstanding", ctx.0);
            return Ok(());
        }
        self.manager.teardown_context(ctx)
    }

    /// Registers a device with `ctx`. With the sanitizer enabled this also
    /// assigns the device's shadow region.
    ///
    /// # Errors
    /// `InvalidContext` for an unknown context; sanitizer registration
    /// failures propagate.
    pub fn add_device(&self, ctx: ContextHandle, device: DeviceHandle) -> UhalResult<()> {
        let ctxi = self.registry.context(ctx)?;
        if self.config.sanitizer {
            sanitizer::register_device(&*self.backend, &ctxi, device, self.config.cpu_shadow)?;
        } else {
            let class = self.backend.device_class(device)?;
            let alignment = self.backend.device_alignment(device)?;
            ctxi.add_device(Arc::new(DeviceInfo::new(Some(device), class, alignment)));
        }
        Ok(())
    }

    /// Starts tracking a queue bound to `device`.
    ///
    /// # Errors
    /// `InvalidContext` / `InvalidDevice` for unknown handles.
    pub fn add_queue(
        &self,
        ctx: ContextHandle,
        queue: QueueHandle,
        device: DeviceHandle,
    ) -> UhalResult<()> {
        let ctxi = self.registry.context(ctx)?;
        if ctxi.device(Some(device)).is_none() {
            return Err(UhalError::InvalidDevice(device.0));
        }
        ctxi.add_queue(queue, Arc::new(QueueInfo::new(device)));
        Ok(())
    }

    /// # Errors
    /// `InvalidContext` for an unknown context.
    pub fn remove_queue(&self, ctx: ContextHandle, queue: QueueHandle) -> UhalResult<()> {
        let ctxi = self.registry.context(ctx)?;
        ctxi.remove_queue(queue);
        Ok(())
    }

    // --- Allocation ---------------------------------------------------------

    /// Allocates `size` bytes of `kind` USM and returns the user pointer.
    ///
    /// With the sanitizer enabled the raw allocation is widened by redzones
    /// and queued for shadow painting on the next launch; the caller still
    /// only ever sees the user range.
    ///
    /// # Errors
    /// `InvalidContext` / `InvalidDevice` for unknown handles,
    /// `InvalidValue` for a bad alignment, `InvalidArgument` for a
    /// device-kind request without a device or a foreign pool; driver
    /// out-of-memory errors propagate.
    pub fn allocate(
        &self,
        ctx: ContextHandle,
        device: Option<DeviceHandle>,
        kind: UsmKind,
        size: u64,
        desc: UsmDescriptor,
        pool: Option<PoolHandle>,
    ) -> UhalResult<u64> {
        let ctxi = self.registry.context(ctx)?;
        let devi = match device {
            Some(dev) => Some(
                ctxi.device(Some(dev))
                    .ok_or(UhalError::InvalidDevice(dev.0))?,
            ),
            None => None,
        };

        // Zero-size requests still produce a unique, freeable pointer.
        let size = size.max(1);
        let mut align = if desc.alignment != 0 {
            desc.alignment
        } else {
            devi.as_ref().map_or(SHADOW_GRANULARITY, |d| d.alignment)
        };

        let info = if self.config.sanitizer {
            // Redzone arithmetic needs granule-aligned user pointers.
            align = align.max(SHADOW_GRANULARITY);
            let redzone = redzone_size(size, align);
            let total = needed_size(size, align);
            let raw = self.manager.allocate_raw(ctx, device, kind, total, align, pool)?;
            Arc::new(AllocInfo {
                alloc_begin: raw,
                user_begin: raw + redzone,
                user_end: raw + redzone + size,
                alloc_size: total,
                kind,
                device,
            })
        } else {
            let raw = self.manager.allocate_raw(ctx, device, kind, size, align, pool)?;
            Arc::new(AllocInfo {
                alloc_begin: raw,
                user_begin: raw,
                user_end: raw + size,
                alloc_size: size,
                kind,
                device,
            })
        };

        // Residency forcing runs before the record becomes visible, so a
        // failed allocation leaves no registry entry behind.
        if let Err(err) = self.apply_residency(&ctxi, device, kind, &info) {
            self.manager.release_raw(ctx, info.alloc_begin)?;
            return Err(err);
        }

        let pending_key = match kind {
            UsmKind::Host => None,
            _ => device,
        };
        if let Err(err) =
            ctxi.register_allocation(pending_key, info.clone(), self.config.sanitizer)
        {
            // Unwind the raw allocation rather than leak it.
            self.manager.release_raw(ctx, info.alloc_begin)?;
            return Err(err);
        }

        if self.config.indirect_access_tracking {
            self.registry.pin_context(&ctxi);
        }
        Ok(info.user_begin)
    }

    fn apply_residency(
        &self,
        ctxi: &ContextInfo,
        device: Option<DeviceHandle>,
        kind: UsmKind,
        info: &AllocInfo,
    ) -> UhalResult<()> {
        match self.config.residency(kind) {
            ResidencyPolicy::None => Ok(()),
            ResidencyPolicy::Device => {
                if let Some(dev) = device {
                    self.backend
                        .make_resident(ctxi.handle, dev, info.alloc_begin, info.alloc_size)?;
                }
                Ok(())
            }
            ResidencyPolicy::AllDevices => {
                for dev in ctxi.device_handles() {
                    self.backend
                        .make_resident(ctxi.handle, dev, info.alloc_begin, info.alloc_size)?;
                }
                Ok(())
            }
        }
    }

    /// Frees a USM allocation by its user pointer.
    ///
    /// Only the exact user pointer is accepted; an interior pointer is
    /// rejected and the allocation stays live. Works on retained contexts,
    /// and the last tracked free of a removed context completes its teardown.
    ///
    /// # Errors
    /// `InvalidContext` for an unknown context, `InvalidArgument` for a
    /// pointer that is not a live user pointer; driver errors propagate.
    pub fn free(&self, ctx: ContextHandle, ptr: u64) -> UhalResult<()> {
        let ctxi = self.registry.context(ctx)?;
        let info = ctxi.resolve_exact(ptr)?;

        // A concurrent free of the same pointer may have passed resolution
        // too; only the caller that takes the record out may release it.
        if ctxi.remove_allocation(info.alloc_begin).is_none() {
            return Err(UhalError::InvalidArgument(format!(
                "pointer {ptr:#x} was already freed"
            )));
        }

        // The owning device comes from the driver, not from our own map, so
        // the pending-list removal agrees with what was actually allocated.
        let (_, device) = match self.backend.query_owner(ctx, info.alloc_begin) {
            Ok(owner) => owner,
            Err(err) => {
                ctxi.register_allocation(None, info, false).ok();
                return Err(err);
            }
        };
        let pending_key = match info.kind {
            UsmKind::Host => None,
            _ => device,
        };
        if let Some(dev) = ctxi.device(pending_key) {
            dev.remove_pending(info.alloc_begin);
        }

        if let Err(err) = self.manager.release_raw(ctx, info.alloc_begin) {
            // The raw range is still live; restore the record.
            ctxi.register_allocation(pending_key, info, false).ok();
            return Err(err);
        }

        if self.config.indirect_access_tracking {
            self.registry.unpin_context(&ctxi);
            if ctxi.pin_count() == 0 && self.registry.context(ctx).is_err() {
                // Deferred context removal completes with the last pin.
                self.manager.teardown_context(ctx)?;
            }
        }
        Ok(())
    }

    /// Looks up the allocation containing `ptr`, if any.
    ///
    /// # Errors
    /// `InvalidContext` for an unknown context.
    pub fn allocation_info(
        &self,
        ctx: ContextHandle,
        ptr: u64,
    ) -> UhalResult<Option<Arc<AllocInfo>>> {
        Ok(self.registry.context(ctx)?.resolve_containing(ptr))
    }

    /// Live raw bytes currently allocated for `kind`.
    #[must_use]
    pub fn allocated_bytes(&self, kind: UsmKind) -> u64 {
        self.manager.allocated_bytes(kind)
    }

    // --- Explicit pools -----------------------------------------------------

    /// # Errors
    /// `InvalidContext` for an unknown context.
    pub fn create_pool(&self, ctx: ContextHandle) -> UhalResult<PoolHandle> {
        self.registry.context(ctx)?;
        Ok(self.manager.create_pool(ctx))
    }

    /// # Errors
    /// `InvalidArgument` for an unknown pool.
    pub fn retain_pool(&self, pool: PoolHandle) -> UhalResult<()> {
        self.manager.retain_pool(pool)
    }

    /// # Errors
    /// `InvalidArgument` for an unknown pool; driver errors propagate.
    pub fn release_pool(&self, pool: PoolHandle) -> UhalResult<()> {
        self.manager.release_pool(pool)
    }

    #[must_use]
    pub fn pool_stats(&self, ctx: ContextHandle, pool: Option<PoolHandle>) -> PoolStats {
        self.manager.pool_stats(ctx, pool)
    }

    // --- Launch -------------------------------------------------------------

    /// Launches a kernel on `queue`, ordered after the queue's event chain.
    ///
    /// With the sanitizer enabled the launch is bracketed: the shadow is
    /// brought up to date and published to the program first, and the
    /// violation report is read back (blocking) afterwards. An unrecoverable
    /// violation terminates the process after logging the diagnostic.
    ///
    /// # Errors
    /// `InvalidContext` / `InvalidArgument` for unknown handles; driver and
    /// sanitizer errors propagate.
    pub fn launch_kernel(
        &self,
        ctx: ContextHandle,
        queue: QueueHandle,
        program: ProgramHandle,
        kernel: KernelHandle,
        dims: &LaunchDims,
    ) -> UhalResult<EventHandle> {
        let ctxi = self.registry.context(ctx)?;
        let queuei = ctxi
            .queue(queue)
            .ok_or_else(|| UhalError::InvalidArgument(format!("unknown queue {:#x}", queue.0)))?;

        if !self.config.sanitizer {
            let wait = queuei.last_event();
            let ev = self
                .backend
                .enqueue_kernel(queue, kernel, dims, wait.as_slice())?;
            queuei.store_last_event(ev);
            return Ok(ev);
        }

        let launch = sanitizer::prepare_launch(&*self.backend, &ctxi, queue, program, dims)?;
        let wait = queuei.last_event();
        let ev = self
            .backend
            .enqueue_kernel(queue, kernel, dims, wait.as_slice())?;
        queuei.store_last_event(ev);

        let (report, _) = sanitizer::post_launch(&*self.backend, &ctxi, queue, program, true)?;
        drop(launch);
        if let Some(report) = report
            && !report.recoverable
        {
            // The diagnostic is already logged; continuing would run on
            // corrupted device state.
            std::process::exit(1);
        }
        Ok(ev)
    }
}
