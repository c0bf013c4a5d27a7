//! Hardware-abstraction runtime for accelerator backends.
//!
//! The crate layers a pooled unified-shared-memory allocator and an
//! optional shadow-memory sanitizer on top of a minimal driver trait
//! ([`driver::DriverBackend`]). A [`runtime::Runtime`] ties the layers
//! together; the [`driver::software::SoftwareBackend`] runs the whole stack
//! against ordinary host memory.

pub mod config;
pub mod driver;
pub mod error;
pub mod registry;
pub mod runtime;
pub mod sanitizer;
pub mod usm;

pub use config::{ResidencyPolicy, RuntimeConfig};
pub use driver::{
    ContextHandle, DeviceClass, DeviceHandle, DriverBackend, EventHandle, KernelHandle,
    LaunchDims, ProgramHandle, QueueHandle, UsmKind,
};
pub use error::{UhalError, UhalResult};
pub use runtime::Runtime;
pub use usm::manager::PoolHandle;
pub use usm::{AllocInfo, UsmDescriptor};
