//! Kernel panic handler.
//!
//! A panic in ring 0 means a violated invariant in the trusted computing
//! base; there is nothing sensible to do but report and stop.  Output goes
//! to serial, the most reliable channel, and the CPU then halts with
//! interrupts disabled so the state stays inspectable under a debugger.

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    klog::error!("==========================================================");
    klog::error!("KERNEL PANIC on cpu {}", panicking_cpu());
    if let Some(location) = info.location() {
        klog::error!("  at {}:{}", location.file(), location.line());
    }
    klog::error!("  {}", info.message());
    klog::error!("==========================================================");

    crate::arch::cpu::halt_forever()
}

/// Best-effort CPU id for the panic banner; GS may not be set up yet.
#[cfg(not(test))]
fn panicking_cpu() -> u32 {
    crate::arch::percpu::try_current()
        .map(|c| c.cpu_id)
        .unwrap_or(0)
}
