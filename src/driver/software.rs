//! Software (host CPU) backend.
//!
//! Implements the full [`DriverBackend`] surface with ordinary host memory
//! and immediate command execution. Commands still produce events and
//! validate their wait lists, so the runtime's event-chain discipline is
//! exercised exactly as it would be against a real driver. Virtual-address
//! reservation uses `mmap(PROT_NONE)` and mapping uses `mprotect`, the same
//! discipline a real shadow reservation relies on.

use crate::driver::{
    ContextHandle, DeviceClass, DeviceHandle, DriverBackend, EventHandle, KernelHandle,
    LaunchDims, PhysicalHandle, ProgramHandle, QueueHandle, UsmKind, VirtualAccess,
};
use crate::error::{UhalError, UhalResult};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

const PAGE_SIZE: u64 = 4096;
const DEFAULT_ALIGNMENT: u64 = 64;
const MAX_ALIGNMENT: u64 = 1 << 16;

/// One executed command, for inspection by tests and demos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Fill {
        queue: QueueHandle,
        ptr: u64,
        pattern: Vec<u8>,
        size: u64,
        wait: Vec<EventHandle>,
        event: EventHandle,
    },
    GlobalWrite {
        queue: QueueHandle,
        program: ProgramHandle,
        name: String,
        wait: Vec<EventHandle>,
        event: EventHandle,
    },
    GlobalRead {
        queue: QueueHandle,
        program: ProgramHandle,
        name: String,
        blocking: bool,
        wait: Vec<EventHandle>,
        event: EventHandle,
    },
    Kernel {
        queue: QueueHandle,
        kernel: KernelHandle,
        workgroups: u64,
        wait: Vec<EventHandle>,
        event: EventHandle,
    },
}

impl Command {
    /// The completion event this command produced.
    #[must_use]
    pub const fn event(&self) -> EventHandle {
        match self {
            Self::Fill { event, .. }
            | Self::GlobalWrite { event, .. }
            | Self::GlobalRead { event, .. }
            | Self::Kernel { event, .. } => *event,
        }
    }

    /// The wait list the command was ordered after.
    #[must_use]
    pub fn wait_list(&self) -> &[EventHandle] {
        match self {
            Self::Fill { wait, .. }
            | Self::GlobalWrite { wait, .. }
            | Self::GlobalRead { wait, .. }
            | Self::Kernel { wait, .. } => wait,
        }
    }
}

#[derive(Debug)]
struct SwAlloc {
    layout: Layout,
    kind: UsmKind,
    device: Option<DeviceHandle>,
    ctx: ContextHandle,
}

#[derive(Debug)]
struct SwDevice {
    class: DeviceClass,
    alignment: u64,
    local_mem_size: u64,
}

#[derive(Debug, Default)]
struct SwProgram {
    globals: HashMap<String, Vec<u8>>,
}

#[derive(Debug)]
struct SwReservation {
    base: u64,
    size: u64,
}

/// Virtual-address reservations are a driver-global resource: they outlive
/// any one backend instance and are never returned to the OS, matching the
/// process-lifetime shadow reservation contract.
static RESERVATIONS: Mutex<Vec<SwReservation>> = Mutex::new(Vec::new());

#[derive(Debug)]
struct SwPhysical {
    size: u64,
    consumed: bool,
}

#[derive(Default)]
struct State {
    allocations: BTreeMap<u64, SwAlloc>,
    devices: HashMap<DeviceHandle, SwDevice>,
    queues: HashMap<QueueHandle, DeviceHandle>,
    programs: HashMap<ProgramHandle, SwProgram>,
    kernels: HashMap<KernelHandle, ProgramHandle>,
    physicals: HashMap<PhysicalHandle, SwPhysical>,
    log: Vec<Command>,
}

/// In-process backend backed by host memory.
pub struct SoftwareBackend {
    state: Mutex<State>,
    next_handle: AtomicU64,
    next_event: AtomicU64,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            // Handle 0 is reserved so Option-free code can use it as "none".
            next_handle: AtomicU64::new(1),
            next_event: AtomicU64::new(1),
        }
    }

    fn fresh_id(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn fresh_event(&self) -> EventHandle {
        EventHandle(self.next_event.fetch_add(1, Ordering::Relaxed))
    }

    /// Every event id below the counter has already completed (execution is
    /// immediate), so a valid wait list may only reference issued events.
    fn check_wait_list(&self, wait: &[EventHandle]) -> UhalResult<()> {
        let issued = self.next_event.load(Ordering::Relaxed);
        for ev in wait {
            if ev.0 == 0 || ev.0 >= issued {
                return Err(UhalError::InvalidArgument(format!(
                    "wait on unknown event {:#x}",
                    ev.0
                )));
            }
        }
        Ok(())
    }

    // --- Setup surface (not part of the DriverBackend trait) ---------------

    pub fn create_context(&self) -> ContextHandle {
        ContextHandle(self.fresh_id())
    }

    pub fn create_device(&self, class: DeviceClass) -> DeviceHandle {
        let handle = DeviceHandle(self.fresh_id());
        let mut st = self.state.lock().unwrap();
        st.devices.insert(
            handle,
            SwDevice {
                class,
                alignment: DEFAULT_ALIGNMENT,
                local_mem_size: 64 * 1024,
            },
        );
        handle
    }

    pub fn create_queue(&self, device: DeviceHandle) -> QueueHandle {
        let handle = QueueHandle(self.fresh_id());
        self.state.lock().unwrap().queues.insert(handle, device);
        handle
    }

    /// Creates a program declaring the given device-globals (name, size).
    pub fn create_program(&self, globals: &[(&str, u64)]) -> ProgramHandle {
        let handle = ProgramHandle(self.fresh_id());
        let mut prog = SwProgram::default();
        for (name, size) in globals {
            prog.globals.insert((*name).to_string(), vec![0u8; *size as usize]);
        }
        self.state.lock().unwrap().programs.insert(handle, prog);
        handle
    }

    pub fn create_kernel(&self, program: ProgramHandle) -> KernelHandle {
        let handle = KernelHandle(self.fresh_id());
        self.state.lock().unwrap().kernels.insert(handle, program);
        handle
    }

    /// Overwrites the contents of a device-global, bypassing the queue.
    /// Stands in for device-side stores in tests and demos.
    pub fn poke_global(&self, program: ProgramHandle, name: &str, data: &[u8]) -> UhalResult<()> {
        let mut st = self.state.lock().unwrap();
        let prog = st
            .programs
            .get_mut(&program)
            .ok_or_else(|| UhalError::InvalidArgument("unknown program".into()))?;
        let global = prog
            .globals
            .get_mut(name)
            .ok_or_else(|| UhalError::InvalidArgument(format!("unknown global {name}")))?;
        let n = data.len().min(global.len());
        global[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    /// The full command log, in submission order.
    #[must_use]
    pub fn command_log(&self) -> Vec<Command> {
        self.state.lock().unwrap().log.clone()
    }

    fn alloc_raw(
        &self,
        ctx: ContextHandle,
        kind: UsmKind,
        device: Option<DeviceHandle>,
        size: u64,
        align: u64,
    ) -> UhalResult<u64> {
        let align = if align == 0 { 8 } else { align };
        if !align.is_power_of_two() || align > MAX_ALIGNMENT {
            return Err(UhalError::InvalidValue(format!(
                "unsupported alignment {align}"
            )));
        }
        // Zero-size requests still hand back a unique, freeable address.
        let size = size.max(8);

        let layout = Layout::from_size_align(size as usize, align as usize)
            .map_err(|e| UhalError::InvalidValue(e.to_string()))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(match kind {
                UsmKind::Host => UhalError::OutOfHostMemory,
                _ => UhalError::OutOfDeviceMemory,
            });
        }

        self.state.lock().unwrap().allocations.insert(
            ptr as u64,
            SwAlloc {
                layout,
                kind,
                device,
                ctx,
            },
        );
        Ok(ptr as u64)
    }
}

impl Drop for SoftwareBackend {
    fn drop(&mut self) {
        let mut st = self.state.lock().unwrap();
        for (ptr, alloc) in std::mem::take(&mut st.allocations) {
            unsafe { dealloc(ptr as *mut u8, alloc.layout) };
        }
    }
}

impl DriverBackend for SoftwareBackend {
    fn alloc_host(&self, ctx: ContextHandle, size: u64, align: u64) -> UhalResult<u64> {
        self.alloc_raw(ctx, UsmKind::Host, None, size, align)
    }

    fn alloc_device(
        &self,
        ctx: ContextHandle,
        device: DeviceHandle,
        size: u64,
        align: u64,
    ) -> UhalResult<u64> {
        self.alloc_raw(ctx, UsmKind::Device, Some(device), size, align)
    }

    fn alloc_shared(
        &self,
        ctx: ContextHandle,
        device: DeviceHandle,
        size: u64,
        align: u64,
    ) -> UhalResult<u64> {
        self.alloc_raw(ctx, UsmKind::Shared, Some(device), size, align)
    }

    fn free(&self, _ctx: ContextHandle, ptr: u64) -> UhalResult<()> {
        let alloc = self
            .state
            .lock()
            .unwrap()
            .allocations
            .remove(&ptr)
            .ok_or_else(|| {
                UhalError::InvalidOperation(format!("free of untracked pointer {ptr:#x}"))
            })?;
        unsafe { dealloc(ptr as *mut u8, alloc.layout) };
        Ok(())
    }

    fn make_resident(
        &self,
        _ctx: ContextHandle,
        device: DeviceHandle,
        ptr: u64,
        size: u64,
    ) -> UhalResult<()> {
        // Host memory is always resident; only validate the device.
        let st = self.state.lock().unwrap();
        if !st.devices.contains_key(&device) {
            return Err(UhalError::InvalidDevice(device.0));
        }
        log::trace!("residency hint: {ptr:#x}+{size:#x} on device {:#x}", device.0);
        Ok(())
    }

    fn query_owner(
        &self,
        _ctx: ContextHandle,
        ptr: u64,
    ) -> UhalResult<(UsmKind, Option<DeviceHandle>)> {
        let st = self.state.lock().unwrap();
        // Largest base <= ptr, then a containment check.
        if let Some((base, alloc)) = st.allocations.range(..=ptr).next_back()
            && ptr < base + alloc.layout.size() as u64
        {
            return Ok((alloc.kind, alloc.device));
        }
        Err(UhalError::InvalidArgument(format!(
            "pointer {ptr:#x} is not a USM allocation"
        )))
    }

    fn max_alignment(&self) -> u64 {
        MAX_ALIGNMENT
    }

    fn enqueue_fill(
        &self,
        queue: QueueHandle,
        ptr: u64,
        pattern: &[u8],
        fill_size: u64,
        wait: &[EventHandle],
    ) -> UhalResult<EventHandle> {
        self.check_wait_list(wait)?;
        if pattern.is_empty() || fill_size % pattern.len() as u64 != 0 {
            return Err(UhalError::InvalidArgument(format!(
                "fill size {fill_size} not a multiple of pattern length {}",
                pattern.len()
            )));
        }

        // Immediate execution: the target must be host-addressable, which
        // holds for every allocation and mapped shadow page this backend
        // hands out.
        unsafe {
            let mut dst = ptr as *mut u8;
            let mut remaining = fill_size;
            while remaining > 0 {
                std::ptr::copy_nonoverlapping(pattern.as_ptr(), dst, pattern.len());
                dst = dst.add(pattern.len());
                remaining -= pattern.len() as u64;
            }
        }

        let event = self.fresh_event();
        self.state.lock().unwrap().log.push(Command::Fill {
            queue,
            ptr,
            pattern: pattern.to_vec(),
            size: fill_size,
            wait: wait.to_vec(),
            event,
        });
        Ok(event)
    }

    fn device_global_size(&self, program: ProgramHandle, name: &str) -> Option<u64> {
        let st = self.state.lock().unwrap();
        st.programs
            .get(&program)
            .and_then(|p| p.globals.get(name))
            .map(|g| g.len() as u64)
    }

    fn enqueue_global_write(
        &self,
        queue: QueueHandle,
        program: ProgramHandle,
        name: &str,
        offset: u64,
        data: &[u8],
        wait: &[EventHandle],
    ) -> UhalResult<EventHandle> {
        self.check_wait_list(wait)?;
        let event = self.fresh_event();
        let mut st = self.state.lock().unwrap();
        let global = st
            .programs
            .get_mut(&program)
            .and_then(|p| p.globals.get_mut(name))
            .ok_or_else(|| UhalError::InvalidArgument(format!("unknown global {name}")))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > global.len() {
            return Err(UhalError::InvalidArgument(format!(
                "write of {}..{} past global {name} ({} bytes)",
                start,
                end,
                global.len()
            )));
        }
        global[start..end].copy_from_slice(data);
        st.log.push(Command::GlobalWrite {
            queue,
            program,
            name: name.to_string(),
            wait: wait.to_vec(),
            event,
        });
        Ok(event)
    }

    fn enqueue_global_read(
        &self,
        queue: QueueHandle,
        program: ProgramHandle,
        name: &str,
        offset: u64,
        blocking: bool,
        out: &mut [u8],
        wait: &[EventHandle],
    ) -> UhalResult<EventHandle> {
        self.check_wait_list(wait)?;
        let event = self.fresh_event();
        let mut st = self.state.lock().unwrap();
        let global = st
            .programs
            .get(&program)
            .and_then(|p| p.globals.get(name))
            .ok_or_else(|| UhalError::InvalidArgument(format!("unknown global {name}")))?;
        let start = offset as usize;
        let end = start + out.len();
        if end > global.len() {
            return Err(UhalError::InvalidArgument(format!(
                "read of {}..{} past global {name} ({} bytes)",
                start,
                end,
                global.len()
            )));
        }
        out.copy_from_slice(&global[start..end]);
        st.log.push(Command::GlobalRead {
            queue,
            program,
            name: name.to_string(),
            blocking,
            wait: wait.to_vec(),
            event,
        });
        Ok(event)
    }

    fn enqueue_kernel(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        dims: &LaunchDims,
        wait: &[EventHandle],
    ) -> UhalResult<EventHandle> {
        self.check_wait_list(wait)?;
        {
            let st = self.state.lock().unwrap();
            if !st.kernels.contains_key(&kernel) {
                return Err(UhalError::InvalidArgument("unknown kernel".into()));
            }
        }
        let event = self.fresh_event();
        self.state.lock().unwrap().log.push(Command::Kernel {
            queue,
            kernel,
            workgroups: dims.workgroup_count(),
            wait: wait.to_vec(),
            event,
        });
        Ok(event)
    }

    fn reserve_virtual(&self, _ctx: ContextHandle, size: u64) -> UhalResult<u64> {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(UhalError::OutOfDeviceMemory);
        }
        let base = base as u64;
        RESERVATIONS.lock().unwrap().push(SwReservation { base, size });
        Ok(base)
    }

    fn create_physical(
        &self,
        _ctx: ContextHandle,
        _device: DeviceHandle,
        size: u64,
    ) -> UhalResult<PhysicalHandle> {
        let handle = PhysicalHandle(self.fresh_id());
        self.state.lock().unwrap().physicals.insert(
            handle,
            SwPhysical {
                size,
                consumed: false,
            },
        );
        Ok(handle)
    }

    fn map_virtual(
        &self,
        _ctx: ContextHandle,
        addr: u64,
        size: u64,
        phys: PhysicalHandle,
        access: VirtualAccess,
    ) -> UhalResult<()> {
        let in_reservation = RESERVATIONS
            .lock()
            .unwrap()
            .iter()
            .any(|r| addr >= r.base && addr + size <= r.base + r.size);
        let mut st = self.state.lock().unwrap();
        if !in_reservation || addr % PAGE_SIZE != 0 {
            return Err(UhalError::InvalidArgument(format!(
                "map target {addr:#x}+{size:#x} outside any reservation"
            )));
        }

        let entry = st
            .physicals
            .get_mut(&phys)
            .ok_or_else(|| UhalError::InvalidArgument("unknown physical handle".into()))?;
        if entry.consumed {
            return Err(UhalError::InvalidOperation(
                "physical object already mapped".into(),
            ));
        }
        if entry.size < size {
            return Err(UhalError::InvalidArgument(format!(
                "physical object of {} bytes cannot back {size} bytes",
                entry.size
            )));
        }

        let prot = match access {
            VirtualAccess::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            VirtualAccess::ReadOnly => libc::PROT_READ,
        };
        let ret = unsafe { libc::mprotect(addr as *mut libc::c_void, size as usize, prot) };
        if ret != 0 {
            return Err(UhalError::Io(std::io::Error::last_os_error()));
        }
        entry.consumed = true;
        Ok(())
    }

    fn device_class(&self, device: DeviceHandle) -> UhalResult<DeviceClass> {
        self.state
            .lock()
            .unwrap()
            .devices
            .get(&device)
            .map(|d| d.class)
            .ok_or(UhalError::InvalidDevice(device.0))
    }

    fn device_alignment(&self, device: DeviceHandle) -> UhalResult<u64> {
        self.state
            .lock()
            .unwrap()
            .devices
            .get(&device)
            .map(|d| d.alignment)
            .ok_or(UhalError::InvalidDevice(device.0))
    }

    fn device_local_mem_size(&self, device: DeviceHandle) -> UhalResult<u64> {
        self.state
            .lock()
            .unwrap()
            .devices
            .get(&device)
            .map(|d| d.local_mem_size)
            .ok_or(UhalError::InvalidDevice(device.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_roundtrip() {
        let be = SoftwareBackend::new();
        let ctx = be.create_context();
        let ptr = be.alloc_host(ctx, 128, 64).unwrap();
        assert_eq!(ptr % 64, 0);
        let (kind, dev) = be.query_owner(ctx, ptr + 10).unwrap();
        assert_eq!(kind, UsmKind::Host);
        assert!(dev.is_none());
        be.free(ctx, ptr).unwrap();
        assert!(be.free(ctx, ptr).is_err());
    }

    #[test]
    fn rejects_bad_alignment() {
        let be = SoftwareBackend::new();
        let ctx = be.create_context();
        assert!(matches!(
            be.alloc_host(ctx, 64, 48),
            Err(UhalError::InvalidValue(_))
        ));
        assert!(matches!(
            be.alloc_host(ctx, 64, MAX_ALIGNMENT * 2),
            Err(UhalError::InvalidValue(_))
        ));
    }

    #[test]
    fn fill_writes_pattern() {
        let be = SoftwareBackend::new();
        let ctx = be.create_context();
        let dev = be.create_device(DeviceClass::SplitAddress);
        let queue = be.create_queue(dev);
        let ptr = be.alloc_device(ctx, dev, 16, 8).unwrap();
        let ev = be.enqueue_fill(queue, ptr, &[0xAB], 16, &[]).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, 16) };
        assert!(bytes.iter().all(|&b| b == 0xAB));
        // The next command may wait on the fill's event.
        be.enqueue_fill(queue, ptr, &[0x00], 16, &[ev]).unwrap();
        be.free(ctx, ptr).unwrap();
    }

    #[test]
    fn wait_on_unissued_event_is_rejected() {
        let be = SoftwareBackend::new();
        let ctx = be.create_context();
        let dev = be.create_device(DeviceClass::SplitAddress);
        let queue = be.create_queue(dev);
        let ptr = be.alloc_device(ctx, dev, 8, 8).unwrap();
        let err = be.enqueue_fill(queue, ptr, &[0], 8, &[EventHandle(999)]);
        assert!(err.is_err());
        be.free(ctx, ptr).unwrap();
    }

    #[test]
    fn global_write_then_read() {
        let be = SoftwareBackend::new();
        let dev = be.create_device(DeviceClass::SplitAddress);
        let queue = be.create_queue(dev);
        let prog = be.create_program(&[("__Tag", 8)]);
        assert_eq!(be.device_global_size(prog, "__Tag"), Some(8));
        assert_eq!(be.device_global_size(prog, "__Missing"), None);

        be.enqueue_global_write(queue, prog, "__Tag", 0, &7u64.to_ne_bytes(), &[])
            .unwrap();
        let mut out = [0u8; 8];
        be.enqueue_global_read(queue, prog, "__Tag", 0, true, &mut out, &[])
            .unwrap();
        assert_eq!(u64::from_ne_bytes(out), 7);
    }

    #[test]
    fn physical_object_maps_once() {
        let be = SoftwareBackend::new();
        let ctx = be.create_context();
        let dev = be.create_device(DeviceClass::SplitAddress);
        let base = be.reserve_virtual(ctx, 1 << 20).unwrap();

        let phys = be.create_physical(ctx, dev, PAGE_SIZE).unwrap();
        be.map_virtual(ctx, base, PAGE_SIZE, phys, VirtualAccess::ReadWrite)
            .unwrap();
        // The same physical object cannot back a second page.
        assert!(matches!(
            be.map_virtual(ctx, base + PAGE_SIZE, PAGE_SIZE, phys, VirtualAccess::ReadWrite),
            Err(UhalError::InvalidOperation(_))
        ));

        // The mapped page is writable host memory now.
        let queue = be.create_queue(dev);
        be.enqueue_fill(queue, base, &[0x5A], PAGE_SIZE, &[]).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(base as *const u8, 16) };
        assert!(bytes.iter().all(|&b| b == 0x5A));
    }
}
