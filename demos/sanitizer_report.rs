use std::sync::Arc;
use uhal_rs::driver::software::SoftwareBackend;
use uhal_rs::sanitizer::launch::{
    GLOBAL_DEVICE_TYPE, GLOBAL_LOCAL_BEGIN, GLOBAL_LOCAL_END, GLOBAL_REPORT, GLOBAL_SHADOW_BEGIN,
    GLOBAL_SHADOW_END,
};
use uhal_rs::sanitizer::report::{RAW_REPORT_SIZE, RawReport};
use uhal_rs::{DeviceClass, LaunchDims, Runtime, RuntimeConfig, UsmDescriptor, UsmKind};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("============================================================");
    println!("         UHAL - Sanitized Kernel Launch Walkthrough         ");
    println!("============================================================");

    // 1. Backend and sanitized runtime
    println!("[+] Creating software backend with sanitizer enabled...");
    let backend = Arc::new(SoftwareBackend::new());
    let ctx = backend.create_context();
    let device = backend.create_device(DeviceClass::SplitAddress);
    let queue = backend.create_queue(device);

    let runtime = Runtime::new(
        backend.clone(),
        RuntimeConfig {
            sanitizer: true,
            ..RuntimeConfig::default()
        },
    );
    runtime.add_context(ctx);
    runtime.add_device(ctx, device)?;
    runtime.add_queue(ctx, queue, device)?;

    // 2. An "instrumented" program
    println!("[+] Building an instrumented program...");
    let program = backend.create_program(&[
        (GLOBAL_SHADOW_BEGIN, 8),
        (GLOBAL_SHADOW_END, 8),
        (GLOBAL_DEVICE_TYPE, 8),
        (GLOBAL_LOCAL_BEGIN, 8),
        (GLOBAL_LOCAL_END, 8),
        (GLOBAL_REPORT, RAW_REPORT_SIZE as u64),
    ]);
    let kernel = backend.create_kernel(program);

    // 3. Sanitized allocations
    println!("[+] Allocating sanitized USM...");
    let ptr = runtime.allocate(
        ctx,
        Some(device),
        UsmKind::Device,
        100,
        UsmDescriptor::new(),
        None,
    )?;
    let info = runtime.allocation_info(ctx, ptr)?.expect("just allocated");
    println!(
        "    user {ptr:#x} ({} bytes), raw {:#x}..{:#x} ({} bytes with redzones)",
        info.user_size(),
        info.alloc_begin,
        info.alloc_end(),
        info.alloc_size
    );

    // 4. Clean launch
    println!("[+] Launching (no violation)...");
    let dims = LaunchDims {
        num_groups: [4, 1, 1],
        group_size: [64, 1, 1],
    };
    runtime.launch_kernel(ctx, queue, program, kernel, &dims)?;
    println!("    launch completed, {} commands issued", backend.command_log().len());

    // 5. Launch with a recoverable violation "written by the device"
    println!("[+] Simulating a recoverable out-of-bounds write...");
    let mut raw = RawReport::zeroed();
    raw.flag = 1;
    raw.error_kind = 1; // out-of-bounds
    raw.memory_kind = 2; // USM device
    raw.access_size = 4;
    raw.is_write = 1;
    raw.is_recover = 1;
    raw.line = 17;
    raw.file[..12].copy_from_slice(b"saxpy.cl\0\0\0\0");
    raw.func[..5].copy_from_slice(b"saxpy");
    raw.global_id = [255, 0, 0];
    raw.local_id = [63, 0, 0];
    let bytes = unsafe {
        std::slice::from_raw_parts((&raw as *const RawReport).cast::<u8>(), RAW_REPORT_SIZE)
    };
    backend.poke_global(program, GLOBAL_REPORT, bytes)?;

    // Recoverable: the diagnostic is logged and execution continues.
    runtime.launch_kernel(ctx, queue, program, kernel, &dims)?;
    println!("    recoverable violation reported, process still alive");

    // 6. Teardown
    println!("[+] Tearing down...");
    runtime.free(ctx, ptr)?;
    runtime.remove_context(ctx)?;
    println!("[+] Done.");
    Ok(())
}
