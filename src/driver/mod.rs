//! The driver/backend boundary.
//!
//! Everything below this trait is owned by a vendor driver: raw USM
//! allocation, asynchronous fills, device-global IO, kernel launch, and
//! virtual-memory reservation/mapping. The runtime above it never touches
//! device memory directly; it only sequences commands through events.

pub mod software;

use crate::error::UhalResult;

// ===============================================================================================
// Handles
// ===============================================================================================

macro_rules! handle_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);
    };
}

handle_type!(
    /// Opaque driver context handle.
    ContextHandle
);
handle_type!(
    /// Opaque driver device handle.
    DeviceHandle
);
handle_type!(
    /// Opaque driver queue handle.
    QueueHandle
);
handle_type!(
    /// Opaque compiled-program handle.
    ProgramHandle
);
handle_type!(
    /// Opaque kernel handle within a program.
    KernelHandle
);
handle_type!(
    /// Completion handle for one enqueued asynchronous command.
    EventHandle
);
handle_type!(
    /// Handle to a driver physical-memory object (for virtual mapping).
    PhysicalHandle
);

// ===============================================================================================
// Common types
// ===============================================================================================

/// The USM allocation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsmKind {
    Host,
    Device,
    Shared,
    /// Explicit buffer objects routed through the USM bookkeeping.
    MemBuffer,
}

/// Coarse device classification, driving shadow address arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    /// Linear (host-like) address space.
    Cpu,
    /// Accelerator whose high address bits split device-private from
    /// host/shared memory.
    SplitAddress,
    Unknown,
}

/// Access mode for a virtual-memory mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualAccess {
    ReadWrite,
    ReadOnly,
}

/// Work geometry for one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDims {
    pub num_groups: [u32; 3],
    pub group_size: [u32; 3],
}

impl LaunchDims {
    /// Total number of workgroups across all dimensions.
    #[must_use]
    pub const fn workgroup_count(&self) -> u64 {
        self.num_groups[0] as u64 * self.num_groups[1] as u64 * self.num_groups[2] as u64
    }
}

// ===============================================================================================
// Backend trait
// ===============================================================================================

/// The five-and-a-half primitives a backend must expose, plus device queries.
///
/// All pointers cross this boundary as raw 64-bit device virtual addresses;
/// lifetime and provenance bookkeeping stays on the runtime side.
pub trait DriverBackend: Send + Sync {
    // --- Memory ------------------------------------------------------------

    /// Allocate host USM (accessible from every device in the context).
    fn alloc_host(&self, ctx: ContextHandle, size: u64, align: u64) -> UhalResult<u64>;

    /// Allocate device-private USM.
    fn alloc_device(
        &self,
        ctx: ContextHandle,
        device: DeviceHandle,
        size: u64,
        align: u64,
    ) -> UhalResult<u64>;

    /// Allocate shared (migratable host/device) USM.
    fn alloc_shared(
        &self,
        ctx: ContextHandle,
        device: DeviceHandle,
        size: u64,
        align: u64,
    ) -> UhalResult<u64>;

    /// Release an allocation previously returned by one of the alloc calls.
    fn free(&self, ctx: ContextHandle, ptr: u64) -> UhalResult<()>;

    /// Force the pages of `[ptr, ptr + size)` resident on `device`. Drivers
    /// without residency control may treat this as a hint.
    fn make_resident(
        &self,
        ctx: ContextHandle,
        device: DeviceHandle,
        ptr: u64,
        size: u64,
    ) -> UhalResult<()>;

    /// Resolve the kind and owning device of an allocation.
    fn query_owner(
        &self,
        ctx: ContextHandle,
        ptr: u64,
    ) -> UhalResult<(UsmKind, Option<DeviceHandle>)>;

    /// Largest supported allocation alignment (power of two).
    fn max_alignment(&self) -> u64;

    // --- Asynchronous commands --------------------------------------------

    /// Enqueue a pattern fill of `fill_size` bytes at `ptr`, ordered after
    /// `wait`. `fill_size` must be a multiple of the pattern length.
    fn enqueue_fill(
        &self,
        queue: QueueHandle,
        ptr: u64,
        pattern: &[u8],
        fill_size: u64,
        wait: &[EventHandle],
    ) -> UhalResult<EventHandle>;

    /// Size of a named device-global in `program`, or `None` when the program
    /// does not define it.
    fn device_global_size(&self, program: ProgramHandle, name: &str) -> Option<u64>;

    /// Enqueue a write into a named device-global, ordered after `wait`.
    fn enqueue_global_write(
        &self,
        queue: QueueHandle,
        program: ProgramHandle,
        name: &str,
        offset: u64,
        data: &[u8],
        wait: &[EventHandle],
    ) -> UhalResult<EventHandle>;

    /// Enqueue a read from a named device-global, ordered after `wait`.
    ///
    /// With `blocking` the call returns only after `out` is populated and the
    /// result event is already complete.
    fn enqueue_global_read(
        &self,
        queue: QueueHandle,
        program: ProgramHandle,
        name: &str,
        offset: u64,
        blocking: bool,
        out: &mut [u8],
        wait: &[EventHandle],
    ) -> UhalResult<EventHandle>;

    /// Enqueue a kernel launch, ordered after `wait`.
    fn enqueue_kernel(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        dims: &LaunchDims,
        wait: &[EventHandle],
    ) -> UhalResult<EventHandle>;

    // --- Virtual memory ----------------------------------------------------

    /// Reserve an unbacked virtual address range of `size` bytes.
    fn reserve_virtual(&self, ctx: ContextHandle, size: u64) -> UhalResult<u64>;

    /// Create a physical-memory object of `size` bytes on `device`.
    fn create_physical(
        &self,
        ctx: ContextHandle,
        device: DeviceHandle,
        size: u64,
    ) -> UhalResult<PhysicalHandle>;

    /// Map `phys` at `[addr, addr + size)` inside a reserved range.
    ///
    /// A physical object may back at most one mapping.
    fn map_virtual(
        &self,
        ctx: ContextHandle,
        addr: u64,
        size: u64,
        phys: PhysicalHandle,
        access: VirtualAccess,
    ) -> UhalResult<()>;

    // --- Device queries ----------------------------------------------------

    /// Coarse device classification.
    fn device_class(&self, device: DeviceHandle) -> UhalResult<DeviceClass>;

    /// Default/minimum allocation alignment of `device`.
    fn device_alignment(&self, device: DeviceHandle) -> UhalResult<u64>;

    /// Size of the device's workgroup-local memory in bytes.
    fn device_local_mem_size(&self, device: DeviceHandle) -> UhalResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workgroup_count_multiplies_dims() {
        let dims = LaunchDims {
            num_groups: [4, 2, 3],
            group_size: [64, 1, 1],
        };
        assert_eq!(dims.workgroup_count(), 24);
    }

    #[test]
    fn handles_are_comparable() {
        assert_eq!(DeviceHandle(7), DeviceHandle(7));
        assert!(EventHandle(1) < EventHandle(2));
    }
}
