//! Shadow update scheduling.
//!
//! Paints the shadow region for freshly registered allocations as a chain of
//! asynchronous fills on the launching queue. Nothing here blocks the host:
//! every command waits on the previous chain tail, and the final tail is
//! stored back on the queue so the kernel launch itself can order after it.

use crate::driver::{ContextHandle, DeviceClass, DriverBackend, EventHandle, QueueHandle};
use crate::error::{UhalError, UhalResult};
use crate::registry::{ContextInfo, DeviceInfo};
use crate::sanitizer::shadow::{
    self, SHADOW_GRANULARITY, SHADOW_PAGE_SIZE, ShadowLayout, redzone_magic,
};
use crate::usm::{AllocInfo, round_up};

/// Ensures every shadow page covering `[begin_cell, end_cell]` (inclusive) is
/// backed by physical memory, mapping and zeroing pages that are not.
///
/// One physical object is created lazily and handed to the next unmapped
/// page; a successful map consumes it, so a fresh object is created for each
/// page that actually needs one while already-backed pages cost nothing.
fn ensure_backed<B: DriverBackend + ?Sized>(
    backend: &B,
    ctx: ContextHandle,
    device: &DeviceInfo,
    queue: QueueHandle,
    begin_cell: u64,
    end_cell: u64,
    chain: &mut Option<EventHandle>,
) -> UhalResult<()> {
    let handle = device
        .handle
        .ok_or_else(|| UhalError::InvalidOperation("shadow backing needs a real device".into()))?;

    let mut phys = None;
    let mut page = begin_cell - begin_cell % SHADOW_PAGE_SIZE;
    while page <= end_cell {
        if !shadow::page_is_backed(page) {
            let obj = match phys.take() {
                Some(obj) => obj,
                None => backend.create_physical(ctx, handle, SHADOW_PAGE_SIZE)?,
            };
            backend.map_virtual(
                ctx,
                page,
                SHADOW_PAGE_SIZE,
                obj,
                crate::driver::VirtualAccess::ReadWrite,
            )?;
            shadow::mark_page_backed(page);
            // A freshly visible page must read as "all accessible" until an
            // allocation claims it.
            let ev = backend.enqueue_fill(queue, page, &[0u8], SHADOW_PAGE_SIZE, chain.as_slice())?;
            *chain = Some(ev);
        }
        page += SHADOW_PAGE_SIZE;
    }
    Ok(())
}

/// Paints one allocation's shadow: zero the whole raw range, encode the
/// partial tail granule, then poison both redzones. Three-plus fills, each
/// ordered after the previous one via `chain`.
///
/// # Errors
/// `InvalidDevice` when the device has no shadow bounds; driver errors from
/// the enqueued fills or the page-backing walk.
pub fn paint_allocation<B: DriverBackend + ?Sized>(
    backend: &B,
    ctx: ContextHandle,
    device: &DeviceInfo,
    queue: QueueHandle,
    info: &AllocInfo,
    mut chain: Option<EventHandle>,
) -> UhalResult<EventHandle> {
    let bounds = *device
        .shadow
        .get()
        .ok_or(UhalError::InvalidDevice(device.handle.map_or(0, |d| d.0)))?;
    let layout = ShadowLayout {
        class: device.class,
        bounds,
    };

    let (begin_cell, end_cell) = layout.cell_range(info.alloc_begin, info.alloc_end())?;
    if layout.class == DeviceClass::SplitAddress {
        ensure_backed(backend, ctx, device, queue, begin_cell, end_cell, &mut chain)?;
    }

    // Whole raw range reads as accessible first; the refinements below only
    // ever tighten that.
    let ev = backend.enqueue_fill(
        queue,
        begin_cell,
        &[0u8],
        end_cell - begin_cell + 1,
        chain.as_slice(),
    )?;
    chain = Some(ev);

    // A user range ending mid-granule leaves `user_end % 8` leading bytes of
    // the final granule accessible.
    let tail = info.user_end % SHADOW_GRANULARITY;
    if tail != 0 {
        let cell = layout.cell(info.user_end)?;
        let ev = backend.enqueue_fill(queue, cell, &[tail as u8], 1, chain.as_slice())?;
        chain = Some(ev);
    }

    let magic = redzone_magic(info.kind);
    let (left_begin, left_end) = layout.cell_range(info.alloc_begin, info.user_begin)?;
    // cell_range is inclusive of the last granule touched; the left redzone
    // ends exactly at the (granule-aligned) user pointer.
    let ev = backend.enqueue_fill(
        queue,
        left_begin,
        &[magic],
        left_end - left_begin + 1,
        chain.as_slice(),
    )?;
    chain = Some(ev);

    let right_begin = round_up(info.user_end, SHADOW_GRANULARITY);
    if right_begin < info.alloc_end() {
        let (lo, hi) = layout.cell_range(right_begin, info.alloc_end())?;
        let ev = backend.enqueue_fill(queue, lo, &[magic], hi - lo + 1, chain.as_slice())?;
        chain = Some(ev);
    }

    log::trace!(
        "painted {:#x}..{:#x} (user {:#x}..{:#x}) on queue {:#x}",
        info.alloc_begin,
        info.alloc_end(),
        info.user_begin,
        info.user_end,
        queue.0
    );
    // At least the zero fill ran, so the chain is never empty here.
    chain.ok_or_else(|| UhalError::InvalidOperation("empty paint chain".into()))
}

/// Brings the queue's device shadow up to date before a launch.
///
/// Host allocations are visible to every device, so the host pseudo-device
/// list is walked on every queue using the queue's watermark; the device's
/// own pending list is drained outright. The chain tail becomes the queue's
/// `last_event`.
///
/// # Errors
/// `InvalidArgument` for an unknown queue, `InvalidDevice` for a queue bound
/// to an unregistered device; paint errors propagate.
pub fn update_all_shadow<B: DriverBackend + ?Sized>(
    backend: &B,
    ctx: &ContextInfo,
    queue_handle: QueueHandle,
) -> UhalResult<Option<EventHandle>> {
    let queue = ctx
        .queue(queue_handle)
        .ok_or_else(|| UhalError::InvalidArgument(format!("unknown queue {:#x}", queue_handle.0)))?;
    let device = ctx
        .device(Some(queue.device))
        .ok_or(UhalError::InvalidDevice(queue.device.0))?;
    let pseudo = ctx
        .device(None)
        .ok_or_else(|| UhalError::InvalidOperation("context lost its pseudo-device".into()))?;

    let mut chain = queue.last_event();

    let (host_pending, mark) = pseudo.pending_since(queue.host_watermark());
    for info in &host_pending {
        chain = Some(paint_allocation(
            backend,
            ctx.handle,
            &device,
            queue_handle,
            info,
            chain,
        )?);
    }
    queue.store_host_watermark(mark);

    for info in device.drain_pending() {
        chain = Some(paint_allocation(
            backend,
            ctx.handle,
            &device,
            queue_handle,
            &info,
            chain,
        )?);
    }

    if let Some(ev) = chain {
        queue.store_last_event(ev);
    }
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::software::SoftwareBackend;
    use crate::driver::UsmKind;
    use crate::registry::ContextInfo;
    use crate::sanitizer::shadow::device_shadow_bounds;
    use std::sync::Arc;

    struct Rig {
        be: SoftwareBackend,
        ctx: Arc<ContextInfo>,
        device: Arc<DeviceInfo>,
        queue: QueueHandle,
    }

    fn split_rig() -> Rig {
        let be = SoftwareBackend::new();
        let ctx_handle = be.create_context();
        let dev_handle = be.create_device(DeviceClass::SplitAddress);
        let queue = be.create_queue(dev_handle);

        let ctx = Arc::new(ContextInfo::new(ctx_handle));
        let device = Arc::new(DeviceInfo::new(
            Some(dev_handle),
            DeviceClass::SplitAddress,
            8,
        ));
        let bounds =
            device_shadow_bounds(&be, ctx_handle, DeviceClass::SplitAddress, false).unwrap();
        device.shadow.set(bounds).ok();
        ctx.add_device(device.clone());
        ctx.add_queue(queue, Arc::new(crate::registry::QueueInfo::new(dev_handle)));
        Rig {
            be,
            ctx,
            device,
            queue,
        }
    }

    fn shadow_byte(layout: &ShadowLayout, addr: u64) -> u8 {
        let cell = layout.cell(addr).unwrap();
        unsafe { *(cell as *const u8) }
    }

    fn sanitized_alloc(rig: &Rig, user_size: u64, redzone: u64) -> Arc<AllocInfo> {
        let total = round_up(user_size, 8) + 2 * redzone;
        let base = rig
            .be
            .alloc_device(
                rig.ctx.handle,
                rig.device.handle.unwrap(),
                total,
                redzone.max(16),
            )
            .unwrap();
        Arc::new(AllocInfo {
            alloc_begin: base,
            user_begin: base + redzone,
            user_end: base + redzone + user_size,
            alloc_size: total,
            kind: UsmKind::Device,
            device: rig.device.handle,
        })
    }

    #[test]
    fn paint_encodes_user_range_and_redzones() {
        let rig = split_rig();
        let info = sanitized_alloc(&rig, 16, 16);
        let layout = ShadowLayout {
            class: DeviceClass::SplitAddress,
            bounds: *rig.device.shadow.get().unwrap(),
        };

        paint_allocation(&rig.be, rig.ctx.handle, &rig.device, rig.queue, &info, None).unwrap();

        assert_eq!(shadow_byte(&layout, info.alloc_begin), 0x81);
        assert_eq!(shadow_byte(&layout, info.user_begin - 8), 0x81);
        assert_eq!(shadow_byte(&layout, info.user_begin), 0);
        assert_eq!(shadow_byte(&layout, info.user_end - 1), 0);
        assert_eq!(shadow_byte(&layout, info.user_end), 0x81);
        assert_eq!(shadow_byte(&layout, info.alloc_end() - 1), 0x81);
    }

    #[test]
    fn paint_encodes_partial_tail_granule() {
        let rig = split_rig();
        // 13 user bytes: the final granule keeps 5 accessible bytes.
        let info = sanitized_alloc(&rig, 13, 16);
        let layout = ShadowLayout {
            class: DeviceClass::SplitAddress,
            bounds: *rig.device.shadow.get().unwrap(),
        };

        paint_allocation(&rig.be, rig.ctx.handle, &rig.device, rig.queue, &info, None).unwrap();

        assert_eq!(shadow_byte(&layout, info.user_begin), 0);
        assert_eq!(shadow_byte(&layout, info.user_begin + 8), 5);
        assert_eq!(shadow_byte(&layout, info.user_begin + 16), 0x81);
    }

    #[test]
    fn repainting_leaves_the_same_shadow_pattern() {
        let rig = split_rig();
        let info = sanitized_alloc(&rig, 13, 16);
        let layout = ShadowLayout {
            class: DeviceClass::SplitAddress,
            bounds: *rig.device.shadow.get().unwrap(),
        };

        let read_range = |lo: u64, hi: u64| -> Vec<u8> {
            (lo..=hi).map(|cell| unsafe { *(cell as *const u8) }).collect()
        };
        let (lo, hi) = layout.cell_range(info.alloc_begin, info.alloc_end()).unwrap();

        paint_allocation(&rig.be, rig.ctx.handle, &rig.device, rig.queue, &info, None).unwrap();
        let first = read_range(lo, hi);

        paint_allocation(&rig.be, rig.ctx.handle, &rig.device, rig.queue, &info, None).unwrap();
        assert_eq!(read_range(lo, hi), first);
    }

    #[test]
    fn fills_chain_in_submission_order() {
        let rig = split_rig();
        let info = sanitized_alloc(&rig, 13, 16);
        let tail =
            paint_allocation(&rig.be, rig.ctx.handle, &rig.device, rig.queue, &info, None).unwrap();

        let log = rig.be.command_log();
        assert!(log.len() >= 4, "backing + zero + tail + redzones");
        for pair in log.windows(2) {
            assert_eq!(pair[1].wait_list(), &[pair[0].event()]);
        }
        assert_eq!(log.last().unwrap().event(), tail);
    }

    #[test]
    fn update_drains_device_list_and_stores_tail() {
        let rig = split_rig();
        let info = sanitized_alloc(&rig, 32, 32);
        rig.ctx
            .register_allocation(rig.device.handle, info, true)
            .unwrap();
        assert_eq!(rig.device.pending_len(), 1);

        let tail = update_all_shadow(&rig.be, &rig.ctx, rig.queue).unwrap();
        assert!(tail.is_some());
        assert_eq!(rig.device.pending_len(), 0);
        assert_eq!(rig.ctx.queue(rig.queue).unwrap().last_event(), tail);

        // Nothing left: the chain tail is unchanged.
        let again = update_all_shadow(&rig.be, &rig.ctx, rig.queue).unwrap();
        assert_eq!(again, tail);
    }

    #[test]
    fn host_allocations_paint_once_per_queue() {
        let rig = split_rig();
        let queue2 = rig.be.create_queue(rig.device.handle.unwrap());
        rig.ctx.add_queue(
            queue2,
            Arc::new(crate::registry::QueueInfo::new(rig.device.handle.unwrap())),
        );

        let base = rig.be.alloc_host(rig.ctx.handle, 48, 16).unwrap();
        let info = Arc::new(AllocInfo {
            alloc_begin: base,
            user_begin: base + 16,
            user_end: base + 32,
            alloc_size: 48,
            kind: UsmKind::Host,
            device: None,
        });
        rig.ctx.register_allocation(None, info, true).unwrap();

        update_all_shadow(&rig.be, &rig.ctx, rig.queue).unwrap();
        let after_first = rig.be.command_log().len();
        assert!(after_first > 0);

        // Same queue again: already painted, no new commands.
        update_all_shadow(&rig.be, &rig.ctx, rig.queue).unwrap();
        assert_eq!(rig.be.command_log().len(), after_first);

        // A different queue still needs its own paint pass.
        update_all_shadow(&rig.be, &rig.ctx, queue2).unwrap();
        assert!(rig.be.command_log().len() > after_first);

        // The host list itself is persistent, not drained.
        assert_eq!(rig.ctx.device(None).unwrap().pending_len(), 1);
    }
}
