//! Concurrent allocation bookkeeping.
//!
//! Makes every live allocation discoverable three ways: by owning context, by
//! owning device (the pending-paint list), and by containing address range
//! (an ordered map keyed by `alloc_begin`). The address map and the pending
//! lists are guarded by separate locks: the map is consulted on every free,
//! the pending list only once per launch, and serializing one behind the
//! other would couple unrelated hot paths.

use crate::driver::{ContextHandle, DeviceClass, DeviceHandle, EventHandle, QueueHandle};
use crate::error::{UhalError, UhalResult};
use crate::usm::AllocInfo;
use once_cell::sync::OnceCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Device-wide shadow region bounds, assigned once per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowBounds {
    pub begin: u64,
    pub end: u64,
}

// ===============================================================================================
// Per-object info
// ===============================================================================================

#[derive(Debug)]
struct PendingAlloc {
    seq: u64,
    info: Arc<AllocInfo>,
}

/// Per-(context, device) state. `handle == None` is the host pseudo-device,
/// created with the context to hold pending host allocations.
///
/// The pending list works in two regimes. A real device's list is drained and
/// cleared once per launch on that device. The host pseudo-device's list is a
/// persistent set walked by *every* queue: host allocations may become
/// visible to any device at any time, so each queue paints every host
/// allocation it has not seen yet, tracked by a per-queue sequence watermark.
#[derive(Debug)]
pub struct DeviceInfo {
    pub handle: Option<DeviceHandle>,
    pub class: DeviceClass,
    /// Default/minimum allocation alignment.
    pub alignment: u64,
    /// Shadow region bounds; set once during sanitizer device registration.
    pub shadow: OnceCell<ShadowBounds>,
    /// Allocations registered but not yet shadow-painted.
    pending: RwLock<Vec<PendingAlloc>>,
    next_seq: AtomicU64,
}

impl DeviceInfo {
    #[must_use]
    pub fn new(handle: Option<DeviceHandle>, class: DeviceClass, alignment: u64) -> Self {
        Self {
            handle,
            class,
            alignment,
            shadow: OnceCell::new(),
            pending: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    fn host_pseudo() -> Self {
        Self::new(None, DeviceClass::Unknown, 8)
    }

    /// Appends an allocation to the pending-paint list.
    ///
    /// # Panics
    /// Panics if the pending lock is poisoned.
    pub fn push_pending(&self, info: Arc<AllocInfo>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.pending.write().unwrap().push(PendingAlloc { seq, info });
    }

    /// Takes and clears the pending-paint list (real-device regime).
    ///
    /// # Panics
    /// Panics if the pending lock is poisoned.
    #[must_use]
    pub fn drain_pending(&self) -> Vec<Arc<AllocInfo>> {
        self.pending
            .write()
            .unwrap()
            .drain(..)
            .map(|p| p.info)
            .collect()
    }

    /// Returns entries newer than `watermark` without clearing, plus the new
    /// watermark (host pseudo-device regime).
    ///
    /// # Panics
    /// Panics if the pending lock is poisoned.
    #[must_use]
    pub fn pending_since(&self, watermark: u64) -> (Vec<Arc<AllocInfo>>, u64) {
        let list = self.pending.read().unwrap();
        let entries = list
            .iter()
            .filter(|p| p.seq > watermark)
            .map(|p| p.info.clone())
            .collect();
        let mark = list.iter().map(|p| p.seq).max().unwrap_or(watermark);
        (entries, mark.max(watermark))
    }

    /// Drops the pending entry for a freed allocation, if still present.
    ///
    /// # Panics
    /// Panics if the pending lock is poisoned.
    pub fn remove_pending(&self, alloc_begin: u64) {
        self.pending
            .write()
            .unwrap()
            .retain(|p| p.info.alloc_begin != alloc_begin);
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.read().unwrap().len()
    }
}

/// Per-queue state: the tail of the queue's shadow-update event chain.
///
/// Callers preserve causal ordering by always passing the previous value as
/// the wait event of the next enqueue before storing the new tail.
#[derive(Debug)]
pub struct QueueInfo {
    pub device: DeviceHandle,
    last_event: Mutex<Option<EventHandle>>,
    /// Highest host pseudo-device pending sequence this queue has painted.
    host_watermark: AtomicU64,
}

impl QueueInfo {
    #[must_use]
    pub fn new(device: DeviceHandle) -> Self {
        Self {
            device,
            last_event: Mutex::new(None),
            host_watermark: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn host_watermark(&self) -> u64 {
        self.host_watermark.load(Ordering::Acquire)
    }

    pub fn store_host_watermark(&self, mark: u64) {
        self.host_watermark.store(mark, Ordering::Release);
    }

    /// # Panics
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn last_event(&self) -> Option<EventHandle> {
        *self.last_event.lock().unwrap()
    }

    /// # Panics
    /// Panics if the lock is poisoned.
    pub fn store_last_event(&self, event: EventHandle) {
        *self.last_event.lock().unwrap() = Some(event);
    }
}

/// Per-context registry entry.
#[derive(Debug)]
pub struct ContextInfo {
    pub handle: ContextHandle,
    devices: RwLock<HashMap<Option<DeviceHandle>, Arc<DeviceInfo>>>,
    queues: RwLock<HashMap<QueueHandle, Arc<QueueInfo>>>,
    /// Every live allocation in the context, keyed by `alloc_begin`.
    allocations: RwLock<BTreeMap<u64, Arc<AllocInfo>>>,
    /// Outstanding indirect-access pins.
    pin_count: AtomicUsize,
}

impl ContextInfo {
    #[must_use]
    pub fn new(handle: ContextHandle) -> Self {
        let mut devices = HashMap::new();
        devices.insert(None, Arc::new(DeviceInfo::host_pseudo()));
        Self {
            handle,
            devices: RwLock::new(devices),
            queues: RwLock::new(HashMap::new()),
            allocations: RwLock::new(BTreeMap::new()),
            pin_count: AtomicUsize::new(0),
        }
    }

    /// # Panics
    /// Panics if the device lock is poisoned.
    pub fn add_device(&self, info: Arc<DeviceInfo>) {
        self.devices.write().unwrap().insert(info.handle, info);
    }

    /// # Panics
    /// Panics if the device lock is poisoned.
    #[must_use]
    pub fn device(&self, handle: Option<DeviceHandle>) -> Option<Arc<DeviceInfo>> {
        self.devices.read().unwrap().get(&handle).cloned()
    }

    /// Handles of every real device in the context.
    ///
    /// # Panics
    /// Panics if the device lock is poisoned.
    #[must_use]
    pub fn device_handles(&self) -> Vec<DeviceHandle> {
        self.devices
            .read()
            .unwrap()
            .keys()
            .filter_map(|k| *k)
            .collect()
    }

    /// # Panics
    /// Panics if the queue lock is poisoned.
    pub fn add_queue(&self, handle: QueueHandle, info: Arc<QueueInfo>) {
        self.queues.write().unwrap().insert(handle, info);
    }

    /// # Panics
    /// Panics if the queue lock is poisoned.
    pub fn remove_queue(&self, handle: QueueHandle) -> Option<Arc<QueueInfo>> {
        self.queues.write().unwrap().remove(&handle)
    }

    /// # Panics
    /// Panics if the queue lock is poisoned.
    #[must_use]
    pub fn queue(&self, handle: QueueHandle) -> Option<Arc<QueueInfo>> {
        self.queues.read().unwrap().get(&handle).cloned()
    }

    /// Inserts `info` into the address map and, when `device` names a
    /// registered device (or the pseudo-device), its pending-paint list.
    ///
    /// # Errors
    /// `InvalidOperation` if the range overlaps a live allocation; the map
    /// is left untouched.
    ///
    /// # Panics
    /// Panics if a lock is poisoned.
    pub fn register_allocation(
        &self,
        device: Option<DeviceHandle>,
        info: Arc<AllocInfo>,
        track_pending: bool,
    ) -> UhalResult<()> {
        #[cfg(debug_assertions)]
        info.debug_check();
        {
            let mut map = self.allocations.write().unwrap();
            if let Some((_, prev)) = map.range(..=info.alloc_begin).next_back()
                && prev.alloc_end() > info.alloc_begin
            {
                return Err(UhalError::InvalidOperation(format!(
                    "allocation {:#x} overlaps live range starting at {:#x}",
                    info.alloc_begin, prev.alloc_begin
                )));
            }
            if let Some((next_begin, _)) = map.range(info.alloc_begin..).next()
                && *next_begin < info.alloc_end()
            {
                return Err(UhalError::InvalidOperation(format!(
                    "allocation {:#x} overlaps live range starting at {next_begin:#x}",
                    info.alloc_begin
                )));
            }
            map.insert(info.alloc_begin, info.clone());
        }

        if track_pending {
            if let Some(dev) = self.device(device) {
                dev.push_pending(info);
            } else {
                // Registering against an unknown device is a caller bug; the
                // address map entry stays valid regardless.
                log::warn!(
                    "context {:#x}: allocation {:#x} references unregistered device",
                    self.handle.0,
                    info.alloc_begin
                );
            }
        }
        Ok(())
    }

    /// Finds the allocation whose user pointer is exactly `ptr`.
    ///
    /// Only exact user-pointer frees are recognized; an offset into a live
    /// allocation is a usage error and reported the same way as a miss.
    ///
    /// # Errors
    /// `InvalidArgument` for both a miss and an offset pointer.
    ///
    /// # Panics
    /// Panics if the allocation lock is poisoned.
    pub fn resolve_exact(&self, ptr: u64) -> UhalResult<Arc<AllocInfo>> {
        let map = self.allocations.read().unwrap();
        match map.range(..=ptr).next_back() {
            Some((_, info)) if info.user_begin == ptr => Ok(info.clone()),
            Some((_, info)) if info.contains(ptr) => {
                log::error!(
                    "pointer {ptr:#x} is {} bytes into allocation {:#x}, not its user pointer",
                    ptr - info.user_begin,
                    info.alloc_begin
                );
                Err(UhalError::InvalidArgument(format!(
                    "pointer {ptr:#x} is not the start of an allocation"
                )))
            }
            _ => {
                log::error!("pointer {ptr:#x} does not match any live allocation");
                Err(UhalError::InvalidArgument(format!(
                    "pointer {ptr:#x} is not a known allocation"
                )))
            }
        }
    }

    /// Finds the allocation whose raw range contains `ptr`, if any.
    ///
    /// # Panics
    /// Panics if the allocation lock is poisoned.
    #[must_use]
    pub fn resolve_containing(&self, ptr: u64) -> Option<Arc<AllocInfo>> {
        let map = self.allocations.read().unwrap();
        match map.range(..=ptr).next_back() {
            Some((_, info)) if info.contains(ptr) => Some(info.clone()),
            _ => None,
        }
    }

    /// Removes an allocation record. Must happen before its address range can
    /// be reused.
    ///
    /// # Panics
    /// Panics if the allocation lock is poisoned.
    pub fn remove_allocation(&self, alloc_begin: u64) -> Option<Arc<AllocInfo>> {
        self.allocations.write().unwrap().remove(&alloc_begin)
    }

    /// # Panics
    /// Panics if the allocation lock is poisoned.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.allocations.read().unwrap().len()
    }

    /// Takes an indirect-access pin. Returns the new count.
    pub fn pin(&self) -> usize {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops an indirect-access pin. Returns the new count.
    ///
    /// # Panics
    /// Debug-panics on underflow.
    pub fn unpin(&self) -> usize {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "indirect-access pin underflow");
        prev - 1
    }

    #[must_use]
    pub fn pin_count(&self) -> usize {
        self.pin_count.load(Ordering::Acquire)
    }
}

// ===============================================================================================
// Registry
// ===============================================================================================

/// Top-level context registry.
///
/// `retained` carries the extra reference taken for contexts that still own
/// indirect-access-tracked allocations: such a context survives
/// `remove_context` until its last tracked allocation is freed.
#[derive(Debug, Default)]
pub struct Registry {
    contexts: RwLock<HashMap<ContextHandle, Arc<ContextInfo>>>,
    retained: Mutex<HashMap<ContextHandle, Arc<ContextInfo>>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    /// Panics if the context lock is poisoned.
    pub fn add_context(&self, handle: ContextHandle) -> Arc<ContextInfo> {
        let info = Arc::new(ContextInfo::new(handle));
        self.contexts.write().unwrap().insert(handle, info.clone());
        info
    }

    /// Drops the registry's own reference. A context with live pins stays
    /// reachable through the retained table until the pins drain.
    ///
    /// # Panics
    /// Panics if the context lock is poisoned.
    pub fn remove_context(&self, handle: ContextHandle) -> Option<Arc<ContextInfo>> {
        self.contexts.write().unwrap().remove(&handle)
    }

    /// # Errors
    /// `InvalidContext` when the handle names neither a live nor a retained
    /// context.
    ///
    /// # Panics
    /// Panics if a lock is poisoned.
    pub fn context(&self, handle: ContextHandle) -> UhalResult<Arc<ContextInfo>> {
        if let Some(info) = self.contexts.read().unwrap().get(&handle) {
            return Ok(info.clone());
        }
        if let Some(info) = self.retained.lock().unwrap().get(&handle) {
            return Ok(info.clone());
        }
        Err(UhalError::InvalidContext(handle.0))
    }

    /// Pins `ctx` for an indirect-access-tracked allocation; the first pin
    /// takes the extra context retain.
    ///
    /// # Panics
    /// Panics if the retained lock is poisoned.
    pub fn pin_context(&self, ctx: &Arc<ContextInfo>) {
        if ctx.pin() == 1 {
            self.retained
                .lock()
                .unwrap()
                .insert(ctx.handle, ctx.clone());
        }
    }

    /// Releases one pin; the last pin drops the extra retain.
    ///
    /// # Panics
    /// Panics if the retained lock is poisoned.
    pub fn unpin_context(&self, ctx: &Arc<ContextInfo>) {
        if ctx.unpin() == 0 {
            self.retained.lock().unwrap().remove(&ctx.handle);
        }
    }

    /// Whether the registry currently holds an extra retain for `handle`.
    ///
    /// # Panics
    /// Panics if the retained lock is poisoned.
    #[must_use]
    pub fn is_retained(&self, handle: ContextHandle) -> bool {
        self.retained.lock().unwrap().contains_key(&handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::UsmKind;

    fn info(begin: u64, user: u64, size: u64, total: u64) -> Arc<AllocInfo> {
        Arc::new(AllocInfo {
            alloc_begin: begin,
            user_begin: user,
            user_end: user + size,
            alloc_size: total,
            kind: UsmKind::Device,
            device: None,
        })
    }

    #[test]
    fn exact_resolution_only() {
        let ctx = ContextInfo::new(ContextHandle(1));
        ctx.register_allocation(None, info(0x1000, 0x1040, 16, 0x100), false)
            .unwrap();

        assert!(ctx.resolve_exact(0x1040).is_ok());
        // One byte into the allocation: rejected, record stays live.
        assert!(ctx.resolve_exact(0x1041).is_err());
        assert_eq!(ctx.live_allocations(), 1);
        // Below every known allocation: not found.
        assert!(ctx.resolve_exact(0x800).is_err());
    }

    #[test]
    fn overlap_is_rejected() {
        let ctx = ContextInfo::new(ContextHandle(1));
        ctx.register_allocation(None, info(0x1000, 0x1040, 16, 0x100), false)
            .unwrap();
        // Starts inside the live range.
        assert!(
            ctx.register_allocation(None, info(0x1080, 0x10C0, 16, 0x100), false)
                .is_err()
        );
        // Ends inside the live range.
        assert!(
            ctx.register_allocation(None, info(0xF80, 0xFC0, 16, 0x100), false)
                .is_err()
        );
        // Adjacent is fine.
        ctx.register_allocation(None, info(0x1100, 0x1140, 16, 0x100), false)
            .unwrap();
        assert_eq!(ctx.live_allocations(), 2);
    }

    #[test]
    fn removed_range_can_be_reregistered() {
        let ctx = ContextInfo::new(ContextHandle(1));
        ctx.register_allocation(None, info(0x1000, 0x1040, 16, 0x100), false)
            .unwrap();
        assert!(ctx.remove_allocation(0x1000).is_some());
        ctx.register_allocation(None, info(0x1000, 0x1040, 32, 0x100), false)
            .unwrap();
    }

    #[test]
    fn pending_list_drains_once() {
        let ctx = ContextInfo::new(ContextHandle(1));
        let rec = info(0x2000, 0x2040, 8, 0x100);
        ctx.register_allocation(None, rec, true).unwrap();

        let pseudo = ctx.device(None).unwrap();
        assert_eq!(pseudo.pending_len(), 1);
        assert_eq!(pseudo.drain_pending().len(), 1);
        assert_eq!(pseudo.drain_pending().len(), 0);
        // Drained records remain in the address map.
        assert_eq!(ctx.live_allocations(), 1);
    }

    #[test]
    fn watermark_walk_is_per_consumer() {
        let dev = DeviceInfo::host_pseudo();
        dev.push_pending(info(0x2000, 0x2040, 8, 0x100));
        dev.push_pending(info(0x3000, 0x3040, 8, 0x100));

        // First consumer sees both; second pass from its watermark sees none.
        let (seen, mark) = dev.pending_since(0);
        assert_eq!(seen.len(), 2);
        let (seen, mark2) = dev.pending_since(mark);
        assert!(seen.is_empty());
        assert_eq!(mark2, mark);

        // A fresh consumer still sees everything, a new entry moves the mark.
        dev.push_pending(info(0x4000, 0x4040, 8, 0x100));
        let (seen, _) = dev.pending_since(0);
        assert_eq!(seen.len(), 3);
        let (seen, _) = dev.pending_since(mark);
        assert_eq!(seen.len(), 1);

        // Freed entries disappear for consumers that never painted them.
        dev.remove_pending(0x3000);
        let (seen, _) = dev.pending_since(0);
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn retained_context_survives_removal() {
        let reg = Registry::new();
        let handle = ContextHandle(9);
        let ctx = reg.add_context(handle);

        reg.pin_context(&ctx);
        reg.pin_context(&ctx);
        assert!(reg.is_retained(handle));

        reg.remove_context(handle);
        // Still resolvable through the retained table.
        assert!(reg.context(handle).is_ok());

        reg.unpin_context(&ctx);
        assert!(reg.is_retained(handle));
        reg.unpin_context(&ctx);
        assert!(!reg.is_retained(handle));
        assert!(reg.context(handle).is_err());
    }

    #[test]
    fn queue_last_event_overwrites() {
        let q = QueueInfo::new(DeviceHandle(3));
        assert_eq!(q.last_event(), None);
        q.store_last_event(EventHandle(5));
        q.store_last_event(EventHandle(6));
        assert_eq!(q.last_event(), Some(EventHandle(6)));
    }
}
