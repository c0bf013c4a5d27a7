use std::sync::Arc;
use uhal_rs::driver::software::SoftwareBackend;
use uhal_rs::{DeviceClass, Runtime, RuntimeConfig, UsmDescriptor, UsmKind};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("============================================================");
    println!("            UHAL - Pooled USM Allocation Smoke Test         ");
    println!("============================================================");

    // 1. Bring up the software backend
    println!("[+] Creating software backend...");
    let backend = Arc::new(SoftwareBackend::new());
    let ctx = backend.create_context();
    let device = backend.create_device(DeviceClass::SplitAddress);

    let runtime = Runtime::new(backend, RuntimeConfig::default());
    runtime.add_context(ctx);
    runtime.add_device(ctx, device)?;

    // 2. Pooled allocations
    println!("[+] Allocating from the default device pool...");
    let mut ptrs = Vec::new();
    for i in 0..8 {
        let ptr = runtime.allocate(
            ctx,
            Some(device),
            UsmKind::Device,
            256 * (i + 1),
            UsmDescriptor::new(),
            None,
        )?;
        println!("    #{i}: {ptr:#x}");
        ptrs.push(ptr);
    }

    let stats = runtime.pool_stats(ctx, None);
    println!(
        "    pool: {} live / {} free chunks, {} slab bytes",
        stats.live_chunks, stats.free_chunks, stats.slab_bytes
    );
    println!(
        "    live device bytes: {}",
        runtime.allocated_bytes(UsmKind::Device)
    );

    // 3. Free and observe reuse
    println!("[+] Freeing and re-allocating...");
    let first = ptrs[0];
    runtime.free(ctx, first)?;
    let again = runtime.allocate(
        ctx,
        Some(device),
        UsmKind::Device,
        256,
        UsmDescriptor::new(),
        None,
    )?;
    println!(
        "    {first:#x} freed, next 256-byte request -> {again:#x} (reused: {})",
        again == first
    );

    // 4. Explicit pool
    println!("[+] Explicit pool lifecycle...");
    let pool = runtime.create_pool(ctx)?;
    let pooled = runtime.allocate(
        ctx,
        Some(device),
        UsmKind::Device,
        1024,
        UsmDescriptor::new(),
        Some(pool),
    )?;
    println!(
        "    pooled alloc {pooled:#x}, pool stats: {:?}",
        runtime.pool_stats(ctx, Some(pool))
    );
    runtime.free(ctx, pooled)?;
    runtime.release_pool(pool)?;

    // 5. Teardown
    println!("[+] Tearing down...");
    runtime.free(ctx, again)?;
    for ptr in ptrs.into_iter().skip(1) {
        runtime.free(ctx, ptr)?;
    }
    runtime.remove_context(ctx)?;
    println!("[+] Done.");
    Ok(())
}
