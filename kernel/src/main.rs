//! EmberOS kernel entry point.
//!
//! The Limine bootloader loads the kernel ELF (zero-filling each LOAD
//! segment's BSS tail), sets up long mode and the higher-half direct map,
//! and calls `_start` on the bootstrap processor with interrupts disabled.
//! From there the boot order is a contract: per-CPU/SMP service first,
//! then interrupt delivery, then application processors, then the
//! scheduler and its preemption tick.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

mod acpi;
mod arch;
mod error;
mod task;
mod traps;
mod util;

use limine::request::{HhdmRequest, RsdpRequest};
use limine::BaseRevision;

use crate::error::KernelError;

/// Base revision of the Limine protocol this kernel speaks.
#[used]
#[link_section = ".limine_requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

/// Request the higher-half direct map offset.
#[used]
#[link_section = ".limine_requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

/// Request the ACPI RSDP pointer.
#[used]
#[link_section = ".limine_requests"]
static RSDP_REQUEST: RsdpRequest = RsdpRequest::new();

/// Kernel entry point called by the Limine bootloader on the BSP.
#[cfg(not(test))]
#[no_mangle]
unsafe extern "C" fn _start() -> ! {
    kernel_main()
}

#[cfg_attr(test, allow(dead_code))]
fn kernel_main() -> ! {
    klog::init();
    klog::info!("ember: kernel core booting");

    assert!(BASE_REVISION.is_supported());

    let Some(hhdm) = HHDM_REQUEST.get_response().map(|r| r.offset()) else {
        fatal("bootloader provided no higher-half direct map");
    };
    let Some(rsdp_raw) = RSDP_REQUEST.get_response().map(|r| r.address() as u64) else {
        fatal("bootloader provided no RSDP");
    };
    // Base revision >= 3 hands the RSDP over as a physical address; older
    // revisions pass a direct-map pointer. Normalize to physical.
    let rsdp_phys = if rsdp_raw >= hhdm {
        rsdp_raw - hhdm
    } else {
        rsdp_raw
    };

    let service = match arch::smp::init(rsdp_phys, hhdm) {
        Ok(service) => service,
        Err(e) => fatal_err("cpu discovery failed", e),
    };
    traps::init();

    if let Err(e) = service.boot_aps() {
        fatal_err("SMP bringup failed", e);
    }
    klog::info!(
        "ember: {}/{} CPUs online",
        arch::percpu::manager().online_count(),
        arch::percpu::manager().cpu_count()
    );

    if let Err(e) = task::sched::spawn_kernel(init_task) {
        fatal_err("could not create the init task", e);
    }
    // Kick the idling APs so the new work is picked up before their next
    // timer tick.
    for cpu in arch::percpu::manager().iter() {
        arch::smp::request_resched(cpu.cpu_id);
    }

    traps::enable_preemption_timer();
    task::sched::start_cpu()
}

/// First kernel task: report the machine, then hand the CPU back.
#[cfg_attr(test, allow(dead_code))]
fn init_task() {
    let mgr = arch::percpu::manager();
    for cpu in mgr.iter() {
        // Our own ring-0 entry stack always mirrors our TSS; remote CPUs
        // may be mid-switch, so only the local pair is stable to compare.
        if cpu.cpu_id == arch::percpu::cpu_id() {
            debug_assert_eq!(cpu.kernel_stack(), cpu.tss_rsp0());
        }
        klog::info!(
            "cpu {}: APIC {}, {}{}, rsp0={:#x}",
            cpu.cpu_id,
            cpu.apic_id,
            if cpu.is_bsp { "BSP, " } else { "" },
            if cpu.is_online() { "online" } else { "offline" },
            cpu.tss_rsp0()
        );
        task::sched::yield_now();
    }
    klog::info!("ember: init task done");
}

/// Fatal boot error: report and halt the BSP.
#[cfg_attr(test, allow(dead_code))]
fn fatal(msg: &str) -> ! {
    klog::error!("ember: {}", msg);
    arch::cpu::halt_forever()
}

#[cfg_attr(test, allow(dead_code))]
fn fatal_err(msg: &str, e: KernelError) -> ! {
    klog::error!("ember: {}: {}", msg, e);
    arch::cpu::halt_forever()
}
