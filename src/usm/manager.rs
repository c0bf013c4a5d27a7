//! Raw USM allocation routed through pools.
//!
//! One [`SubPool`] exists per (context, pool, kind, device) combination,
//! created lazily on first use. The manager only deals in raw driver ranges;
//! redzone layout and registry bookkeeping live a layer above. Every
//! outgoing pointer is remembered in an owner table so the free side can
//! route it back to its pool or straight to the driver.

use crate::driver::{ContextHandle, DeviceHandle, DriverBackend, UsmKind};
use crate::error::{UhalError, UhalResult};
use crate::usm::pool::{PoolStats, SubPool};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle to an explicitly created allocation pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolHandle(pub u64);

type PoolKey = (
    ContextHandle,
    Option<PoolHandle>,
    UsmKind,
    Option<DeviceHandle>,
);

#[derive(Debug)]
struct OwnerRec {
    ctx: ContextHandle,
    /// `Some` when the range is a pool chunk, `None` for a direct driver
    /// allocation.
    pool: Option<PoolKey>,
    size: u64,
    kind: UsmKind,
}

#[derive(Debug)]
struct ExplicitPool {
    ctx: ContextHandle,
    refs: u64,
}

const fn kind_index(kind: UsmKind) -> usize {
    match kind {
        UsmKind::Host => 0,
        UsmKind::Device => 1,
        UsmKind::Shared => 2,
        UsmKind::MemBuffer => 3,
    }
}

/// The pooled USM allocator.
pub struct UsmManager<B: DriverBackend> {
    backend: Arc<B>,
    pooling: bool,
    pools: Mutex<HashMap<PoolKey, SubPool>>,
    explicit: Mutex<HashMap<PoolHandle, ExplicitPool>>,
    owners: Mutex<HashMap<u64, OwnerRec>>,
    next_pool: AtomicU64,
    /// Live raw bytes per USM kind.
    bytes: [AtomicU64; 4],
}

impl<B: DriverBackend> UsmManager<B> {
    #[must_use]
    pub fn new(backend: Arc<B>, pooling: bool) -> Self {
        Self {
            backend,
            pooling,
            pools: Mutex::new(HashMap::new()),
            explicit: Mutex::new(HashMap::new()),
            owners: Mutex::new(HashMap::new()),
            next_pool: AtomicU64::new(1),
            bytes: [const { AtomicU64::new(0) }; 4],
        }
    }

    fn driver_alloc(
        &self,
        ctx: ContextHandle,
        device: Option<DeviceHandle>,
        kind: UsmKind,
        size: u64,
        align: u64,
    ) -> UhalResult<u64> {
        match kind {
            UsmKind::Host => self.backend.alloc_host(ctx, size, align),
            UsmKind::Shared => {
                let dev = device.ok_or_else(|| {
                    UhalError::InvalidArgument("shared allocation without a device".into())
                })?;
                self.backend.alloc_shared(ctx, dev, size, align)
            }
            UsmKind::Device | UsmKind::MemBuffer => {
                let dev = device.ok_or_else(|| {
                    UhalError::InvalidArgument("device allocation without a device".into())
                })?;
                self.backend.alloc_device(ctx, dev, size, align)
            }
        }
    }

    /// Serves a raw range of `size` bytes at `align`.
    ///
    /// Poolable requests come from the matching sub-pool (growing it with a
    /// driver slab when empty); everything else goes straight to the driver.
    ///
    /// # Errors
    /// `InvalidValue` for a non-power-of-two or oversized alignment,
    /// `InvalidArgument` for an unknown or foreign explicit pool or a
    /// device-kind request without a device; driver errors propagate.
    pub fn allocate_raw(
        &self,
        ctx: ContextHandle,
        device: Option<DeviceHandle>,
        kind: UsmKind,
        size: u64,
        align: u64,
        pool: Option<PoolHandle>,
    ) -> UhalResult<u64> {
        if align != 0 && (!align.is_power_of_two() || align > self.backend.max_alignment()) {
            return Err(UhalError::InvalidValue(format!(
                "unsupported alignment {align}"
            )));
        }
        if let Some(handle) = pool {
            let explicit = self.explicit.lock().unwrap();
            match explicit.get(&handle) {
                Some(entry) if entry.ctx == ctx => {}
                Some(_) => {
                    return Err(UhalError::InvalidArgument(format!(
                        "pool {:#x} belongs to another context",
                        handle.0
                    )));
                }
                None => {
                    return Err(UhalError::InvalidArgument(format!(
                        "unknown pool {:#x}",
                        handle.0
                    )));
                }
            }
        }

        let base = if self.pooling && SubPool::poolable(size, align) {
            let key = (ctx, pool, kind, device);
            let mut pools = self.pools.lock().unwrap();
            let sub = pools.entry(key).or_default();
            let base = sub.acquire(size, align, |slab_size, slab_align| {
                self.driver_alloc(ctx, device, kind, slab_size, slab_align)
            })?;
            self.owners.lock().unwrap().insert(
                base,
                OwnerRec {
                    ctx,
                    pool: Some(key),
                    size,
                    kind,
                },
            );
            base
        } else {
            let base = self.driver_alloc(ctx, device, kind, size, align)?;
            self.owners.lock().unwrap().insert(
                base,
                OwnerRec {
                    ctx,
                    pool: None,
                    size,
                    kind,
                },
            );
            base
        };

        self.bytes[kind_index(kind)].fetch_add(size, Ordering::Relaxed);
        Ok(base)
    }

    /// Returns a raw range obtained from [`allocate_raw`](Self::allocate_raw).
    ///
    /// # Errors
    /// `InvalidArgument` for a pointer the manager never handed out,
    /// `InvalidValue` when the owning pool has already been torn down.
    pub fn release_raw(&self, ctx: ContextHandle, base: u64) -> UhalResult<()> {
        let rec = self.owners.lock().unwrap().remove(&base).ok_or_else(|| {
            UhalError::InvalidArgument(format!("pointer {base:#x} was not allocated here"))
        })?;
        debug_assert_eq!(rec.ctx, ctx);

        let result = match rec.pool {
            Some(key) => {
                let mut pools = self.pools.lock().unwrap();
                match pools.get_mut(&key) {
                    Some(sub) => sub.release(base),
                    None => Err(UhalError::InvalidValue(format!(
                        "pool for {base:#x} no longer exists"
                    ))),
                }
            }
            None => self.backend.free(ctx, base),
        };
        if result.is_err() {
            // Keep the owner record so a retry is possible.
            self.owners.lock().unwrap().insert(base, rec);
            return result;
        }
        self.bytes[kind_index(rec.kind)].fetch_sub(rec.size, Ordering::Relaxed);
        Ok(())
    }

    // --- Explicit pools -----------------------------------------------------

    /// Creates an explicit pool scoped to `ctx` with one reference.
    pub fn create_pool(&self, ctx: ContextHandle) -> PoolHandle {
        let handle = PoolHandle(self.next_pool.fetch_add(1, Ordering::Relaxed));
        self.explicit
            .lock()
            .unwrap()
            .insert(handle, ExplicitPool { ctx, refs: 1 });
        handle
    }

    /// # Errors
    /// `InvalidArgument` for an unknown pool.
    pub fn retain_pool(&self, handle: PoolHandle) -> UhalResult<()> {
        let mut explicit = self.explicit.lock().unwrap();
        let entry = explicit
            .get_mut(&handle)
            .ok_or_else(|| UhalError::InvalidArgument(format!("unknown pool {:#x}", handle.0)))?;
        entry.refs += 1;
        Ok(())
    }

    /// Drops one reference; the last reference returns every slab of the
    /// pool to the driver.
    ///
    /// # Errors
    /// `InvalidArgument` for an unknown pool; driver errors from slab frees.
    pub fn release_pool(&self, handle: PoolHandle) -> UhalResult<()> {
        let ctx = {
            let mut explicit = self.explicit.lock().unwrap();
            let entry = explicit.get_mut(&handle).ok_or_else(|| {
                UhalError::InvalidArgument(format!("unknown pool {:#x}", handle.0))
            })?;
            entry.refs -= 1;
            if entry.refs > 0 {
                return Ok(());
            }
            let ctx = entry.ctx;
            explicit.remove(&handle);
            ctx
        };
        self.drain_matching(|key| key.0 == ctx && key.1 == Some(handle))
    }

    /// Occupancy of a pool: the default pools of `ctx` when `pool` is
    /// `None`, otherwise the named pool.
    ///
    /// # Panics
    /// Panics if the pool lock is poisoned.
    #[must_use]
    pub fn pool_stats(&self, ctx: ContextHandle, pool: Option<PoolHandle>) -> PoolStats {
        let pools = self.pools.lock().unwrap();
        let mut total = PoolStats::default();
        for (key, sub) in pools.iter() {
            if key.0 == ctx && key.1 == pool {
                let s = sub.stats();
                total.live_chunks += s.live_chunks;
                total.free_chunks += s.free_chunks;
                total.slab_bytes += s.slab_bytes;
            }
        }
        total
    }

    /// Releases every slab owned by any pool of `ctx` and forgets the
    /// context's allocations. Called on context teardown, after the last
    /// user free.
    ///
    /// # Errors
    /// Driver errors from slab frees.
    pub fn teardown_context(&self, ctx: ContextHandle) -> UhalResult<()> {
        self.explicit.lock().unwrap().retain(|_, p| p.ctx != ctx);
        let leaked: Vec<u64> = {
            let mut owners = self.owners.lock().unwrap();
            let bases = owners
                .iter()
                .filter(|(_, rec)| rec.ctx == ctx)
                .map(|(base, _)| *base)
                .collect();
            owners.retain(|_, rec| rec.ctx != ctx);
            bases
        };
        if !leaked.is_empty() {
            log::warn!(
                "context {:#x} torn down with {} live allocations",
                ctx.0,
                leaked.len()
            );
        }
        self.drain_matching(|key| key.0 == ctx)
    }

    fn drain_matching(&self, select: impl Fn(&PoolKey) -> bool) -> UhalResult<()> {
        let drained: Vec<(ContextHandle, Vec<u64>)> = {
            let mut pools = self.pools.lock().unwrap();
            let keys: Vec<PoolKey> = pools.keys().copied().filter(|k| select(k)).collect();
            keys.into_iter()
                .map(|key| {
                    let mut sub = pools.remove(&key).unwrap_or_default();
                    (key.0, sub.drain_slabs())
                })
                .collect()
        };
        for (ctx, bases) in drained {
            for base in bases {
                self.backend.free(ctx, base)?;
            }
        }
        Ok(())
    }

    /// Live raw bytes currently allocated for `kind`.
    #[must_use]
    pub fn allocated_bytes(&self, kind: UsmKind) -> u64 {
        self.bytes[kind_index(kind)].load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DeviceClass;
    use crate::driver::software::SoftwareBackend;

    fn manager() -> (UsmManager<SoftwareBackend>, ContextHandle, DeviceHandle) {
        let be = Arc::new(SoftwareBackend::new());
        let ctx = be.create_context();
        let dev = be.create_device(DeviceClass::SplitAddress);
        (UsmManager::new(be, true), ctx, dev)
    }

    #[test]
    fn pooled_chunk_is_reused() {
        let (mgr, ctx, dev) = manager();
        let a = mgr
            .allocate_raw(ctx, Some(dev), UsmKind::Device, 256, 8, None)
            .unwrap();
        mgr.release_raw(ctx, a).unwrap();
        let b = mgr
            .allocate_raw(ctx, Some(dev), UsmKind::Device, 256, 8, None)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(mgr.allocated_bytes(UsmKind::Device), 256);
    }

    #[test]
    fn oversized_request_bypasses_pool() {
        let (mgr, ctx, dev) = manager();
        let big = SubPool::MAX_POOLABLE + 1;
        let ptr = mgr
            .allocate_raw(ctx, Some(dev), UsmKind::Device, big, 8, None)
            .unwrap();
        assert_eq!(mgr.pool_stats(ctx, None), PoolStats::default());
        mgr.release_raw(ctx, ptr).unwrap();
        // Straight back to the driver: the backend no longer knows it.
        assert!(mgr.backend.query_owner(ctx, ptr).is_err());
        assert_eq!(mgr.allocated_bytes(UsmKind::Device), 0);
    }

    #[test]
    fn kinds_and_devices_get_separate_pools() {
        let (mgr, ctx, dev) = manager();
        let a = mgr
            .allocate_raw(ctx, None, UsmKind::Host, 128, 8, None)
            .unwrap();
        let b = mgr
            .allocate_raw(ctx, Some(dev), UsmKind::Shared, 128, 8, None)
            .unwrap();
        assert_ne!(a, b);
        let stats = mgr.pool_stats(ctx, None);
        assert_eq!(stats.live_chunks, 2);
        // Two buckets grew one slab each.
        assert!(stats.slab_bytes >= 2 * 128);
    }

    #[test]
    fn device_kind_requires_a_device() {
        let (mgr, ctx, _dev) = manager();
        assert!(matches!(
            mgr.allocate_raw(ctx, None, UsmKind::Device, 64, 8, None),
            Err(UhalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn bad_alignment_is_invalid_value() {
        let (mgr, ctx, dev) = manager();
        assert!(matches!(
            mgr.allocate_raw(ctx, Some(dev), UsmKind::Device, 64, 24, None),
            Err(UhalError::InvalidValue(_))
        ));
    }

    #[test]
    fn foreign_pointer_is_rejected() {
        let (mgr, ctx, _dev) = manager();
        assert!(matches!(
            mgr.release_raw(ctx, 0xDEAD_BEEF),
            Err(UhalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn explicit_pool_lifecycle() {
        let (mgr, ctx, dev) = manager();
        let pool = mgr.create_pool(ctx);
        let ptr = mgr
            .allocate_raw(ctx, Some(dev), UsmKind::Device, 512, 8, Some(pool))
            .unwrap();
        assert_eq!(mgr.pool_stats(ctx, Some(pool)).live_chunks, 1);
        // The default pools are untouched.
        assert_eq!(mgr.pool_stats(ctx, None), PoolStats::default());

        mgr.retain_pool(pool).unwrap();
        mgr.release_pool(pool).unwrap();
        // Still referenced: allocation survives.
        assert_eq!(mgr.pool_stats(ctx, Some(pool)).live_chunks, 1);

        mgr.release_raw(ctx, ptr).unwrap();
        mgr.release_pool(pool).unwrap();
        assert_eq!(mgr.pool_stats(ctx, Some(pool)), PoolStats::default());
        assert!(matches!(
            mgr.allocate_raw(ctx, Some(dev), UsmKind::Device, 64, 8, Some(pool)),
            Err(UhalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn teardown_releases_slabs() {
        let (mgr, ctx, dev) = manager();
        let ptr = mgr
            .allocate_raw(ctx, Some(dev), UsmKind::Device, 128, 8, None)
            .unwrap();
        mgr.release_raw(ctx, ptr).unwrap();
        mgr.teardown_context(ctx).unwrap();
        assert_eq!(mgr.pool_stats(ctx, None), PoolStats::default());
        // The slab went back to the driver.
        assert!(mgr.backend.query_owner(ctx, ptr).is_err());
    }

    #[test]
    fn pooling_disabled_goes_straight_to_driver() {
        let be = Arc::new(SoftwareBackend::new());
        let ctx = be.create_context();
        let mgr = UsmManager::new(be, false);
        let ptr = mgr
            .allocate_raw(ctx, None, UsmKind::Host, 64, 8, None)
            .unwrap();
        assert_eq!(mgr.pool_stats(ctx, None), PoolStats::default());
        mgr.release_raw(ctx, ptr).unwrap();
    }
}
