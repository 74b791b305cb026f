//! SMP (Symmetric Multiprocessing) bringup.
//!
//! The BSP discovers the machine's processors from the ACPI MADT, stages
//! the real-mode trampoline at a fixed low page, and walks every AP through
//! the INIT/STARTUP IPI sequence.  Parameters travel through the trampoline
//! mailbox; each AP publishes `started`, registers itself online, and drops
//! into the scheduler.  APs are started strictly sequentially, so exactly
//! one AP reads the mailbox at a time.

use core::sync::atomic::{fence, Ordering};

use spin::Once;
use x86_64::registers::control::Cr3;

use crate::acpi;
use crate::arch::percpu::{self, CpuManager, PerCpu};
use crate::arch::trampoline::{self, ApMailbox, SIPI_VECTOR, TRAMPOLINE_ADDR};
use crate::error::KernelError;
use crate::task::sched;
use crate::traps;

/// Delay after the INIT IPI before the first SIPI.
const INIT_DELAY_US: u64 = 10_000;

/// Delay between the two SIPIs.
const SIPI_DELAY_US: u64 = 200_000;

/// How long an AP gets to write the mailbox `started` word.
const AP_START_TIMEOUT_MS: u64 = 1_000;

/// How long the whole bringup gets to reach `online_count == cpu_count`.
const ONLINE_TIMEOUT_MS: u64 = 2_000;

/// Assumed TSC frequency for busy waits.  Deliberately a ceiling: on any
/// slower clock the waits come out longer than requested, never shorter.
const ASSUMED_TSC_HZ: u64 = 5_000_000_000;

/// Page-table entry bits used for the low identity mapping.
const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITABLE: u64 = 1 << 1;
const PTE_HUGE: u64 = 1 << 7;
const PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Spare physical frames in conventional low memory, used only if the live
/// page tables lack entries covering the trampoline page.
const LOW_PDPT_FRAME: u64 = 0x9000;
const LOW_PD_FRAME: u64 = 0xA000;

/// The process-wide SMP service handle, published once during init.
static SERVICE: Once<SmpService> = Once::new();

/// SMP bringup and cross-CPU signalling.
pub struct SmpService {
	hhdm: u64,
}

/// Discover CPUs, set up the BSP, and publish the service singleton.
///
/// On success the BSP is online, its GDT/TSS/GS state is installed, and the
/// local APIC is enabled.  Must run before the scheduler starts and before
/// device interrupts are unmasked (boot ordering contract).
pub fn init(rsdp_phys: u64, hhdm: u64) -> Result<&'static SmpService, KernelError> {
	let madt = acpi::find_madt(rsdp_phys, hhdm)?;

	// The legacy PIC must be remapped and masked before the local APIC
	// takes over, or floating 8259 lines alias CPU exception vectors.
	khal::pic::disable();
	let bsp_apic_id = khal::apic::init(hhdm);

	let mgr = percpu::manager();
	let mut bsp_seen = false;
	for entry in madt.local_apics() {
		if !entry.flags.contains(acpi::LapicFlags::ENABLED) {
			continue;
		}
		let is_bsp = entry.apic_id as u32 == bsp_apic_id;
		bsp_seen |= is_bsp;
		mgr.add(entry.apic_id as u32, is_bsp)?;
	}

	if mgr.cpu_count() == 0 {
		return Err(KernelError::NoCpus);
	}
	if !bsp_seen {
		return Err(KernelError::NoBsp);
	}

	// BSP setup: its own GDT/TSS, GS base, and online publication.
	let bsp = mgr
		.iter()
		.find(|c| c.is_bsp)
		.ok_or(KernelError::NoBsp)?;
	unsafe {
		bsp.install();
	}
	mgr.mark_online(bsp);

	klog::info!(
		"smp: {} CPU(s) discovered, BSP is cpu {} (APIC {})",
		mgr.cpu_count(),
		bsp.cpu_id,
		bsp.apic_id
	);

	Ok(SERVICE.call_once(|| SmpService { hhdm }))
}

/// The published service handle, if `init` has completed.
pub fn service() -> Option<&'static SmpService> {
	SERVICE.get()
}

impl SmpService {
	/// Boot every application processor and wait for the full complement.
	///
	/// A no-op on single-CPU machines.  Fails with `ApStartupTimeout` if an
	/// AP never signals the mailbox, or `Timeout` if the online count does
	/// not converge within the bringup deadline.
	pub fn boot_aps(&self) -> Result<(), KernelError> {
		let mgr = percpu::manager();
		if mgr.cpu_count() == 1 {
			return Ok(());
		}

		unsafe {
			identity_map_low(self.hhdm);
			self.stage_trampoline();
		}

		for cpu in mgr.iter().filter(|c| !c.is_bsp) {
			unsafe {
				self.boot_one(cpu)?;
			}
		}

		wait_for_online(mgr.cpu_count(), ONLINE_TIMEOUT_MS)
	}

	/// Copy the trampoline blob to its fixed low page.
	unsafe fn stage_trampoline(&self) {
		let blob = trampoline::blob();
		let dst = (self.hhdm + TRAMPOLINE_ADDR) as *mut u8;
		core::ptr::copy_nonoverlapping(blob.as_ptr(), dst, blob.len());
		klog::debug!(
			"smp: trampoline staged at {:#x} ({} bytes, SIPI vector {:#04x})",
			TRAMPOLINE_ADDR,
			blob.len(),
			SIPI_VECTOR
		);
	}

	/// Drive one AP through INIT/SIPI/SIPI and the mailbox handshake.
	unsafe fn boot_one(&self, cpu: &'static PerCpu) -> Result<(), KernelError> {
		let mailbox = trampoline::staged_mailbox(self.hhdm);
		let (pml4, _) = Cr3::read();

		mailbox.prepare(
			pml4.start_address().as_u64(),
			cpu.stack_top(),
			cpu as *const PerCpu as u64,
			khal::apic::mmio_base(),
			percpu::manager() as *const CpuManager as u64,
			cpu as *const PerCpu as u64,
			ap_entry as usize as u64,
		);

		// Everything above must be globally visible before the AP wakes.
		fence(Ordering::SeqCst);

		klog::debug!("smp: starting cpu {} (APIC {})", cpu.cpu_id, cpu.apic_id);

		khal::apic::send_init(cpu.apic_id);
		busy_wait_us(INIT_DELAY_US);

		khal::apic::send_startup(cpu.apic_id, SIPI_VECTOR);
		busy_wait_us(SIPI_DELAY_US);

		// Second SIPI, per Intel's startup algorithm; an already-running
		// AP ignores it.
		khal::apic::send_startup(cpu.apic_id, SIPI_VECTOR);

		let deadline = Deadline::after_ms(AP_START_TIMEOUT_MS);
		while !mailbox.started() {
			if deadline.elapsed() {
				klog::error!(
					"smp: cpu {} (APIC {}) never started (trampoline stage {})",
					cpu.cpu_id,
					cpu.apic_id,
					mailbox.stage()
				);
				return Err(KernelError::ApStartupTimeout);
			}
			core::hint::spin_loop();
		}

		Ok(())
	}

	/// Ask another CPU to reschedule.
	///
	/// Silently does nothing if the target is unknown, offline, or the
	/// calling CPU itself; a stale cross-CPU wakeup is not an error.
	pub fn request_resched(&self, target: u32) {
		let mgr = percpu::manager();
		let Some(cpu) = mgr.get(target) else {
			return;
		};
		if !cpu.is_online() || cpu.cpu_id == percpu::cpu_id() {
			return;
		}
		khal::apic::send_ipi(
			cpu.apic_id,
			traps::RESCHED_VECTOR,
			khal::apic::DeliveryMode::Fixed,
			khal::apic::Level::Assert,
			khal::apic::TriggerMode::Edge,
		);
	}
}

/// Free-function form of [`SmpService::request_resched`]; a no-op before
/// the service is published.
pub fn request_resched(target: u32) {
	if let Some(svc) = service() {
		svc.request_resched(target);
	}
}

// ── AP entry ────────────────────────────────────────────────────

/// First kernel code an AP runs, called from the trampoline with CR3 set to
/// the BSP's PML4 and RSP on the stack assigned through the mailbox.
extern "C" fn ap_entry(mailbox: *const ApMailbox) -> ! {
	// Copy everything out of the mailbox before publishing `started`: the
	// BSP reuses the mailbox for the next AP as soon as it sees the flag.
	let (cpu, mgr, lapic_base) = unsafe {
		let mb = &*mailbox;
		(
			&*(mb.cpu_ptr as *const PerCpu),
			&*(mb.cpu_mgr_ptr as *const CpuManager),
			mb.lapic_ptr,
		)
	};

	unsafe {
		cpu.install();
	}
	traps::load();
	khal::apic::init_ap(lapic_base);

	unsafe {
		(*mailbox).publish_started();
	}
	mgr.mark_online(cpu);

	klog::info!("smp: cpu {} (APIC {}) online", cpu.cpu_id, cpu.apic_id);

	traps::enable_preemption_timer();
	sched::start_cpu()
}

// ── Waits ───────────────────────────────────────────────────────

/// Read the time-stamp counter.
#[inline]
fn rdtsc() -> u64 {
	unsafe { core::arch::x86_64::_rdtsc() }
}

/// A TSC-based deadline.
struct Deadline {
	end: u64,
}

impl Deadline {
	fn after_ms(ms: u64) -> Self {
		Self {
			end: rdtsc().wrapping_add(ms * (ASSUMED_TSC_HZ / 1_000)),
		}
	}

	fn elapsed(&self) -> bool {
		// Wrapping comparison; the TSC will not lap a bringup deadline.
		(rdtsc().wrapping_sub(self.end) as i64) >= 0
	}
}

/// Spin for at least `us` microseconds with a pause hint.
pub fn busy_wait_us(us: u64) {
	let cycles = us * (ASSUMED_TSC_HZ / 1_000_000);
	let start = rdtsc();
	while rdtsc().wrapping_sub(start) < cycles {
		core::hint::spin_loop();
	}
}

/// Wait until `expected` CPUs are online, or the deadline passes.
pub fn wait_for_online(expected: usize, timeout_ms: u64) -> Result<(), KernelError> {
	let mgr = percpu::manager();
	let deadline = Deadline::after_ms(timeout_ms);
	while mgr.online_count() < expected {
		if deadline.elapsed() {
			return Err(KernelError::Timeout);
		}
		core::hint::spin_loop();
	}
	Ok(())
}

// ── Low identity mapping ────────────────────────────────────────

/// Ensure virtual == physical for the first 2 MiB.
///
/// The trampoline enables paging while executing at physical `0x8000`, so
/// the instruction fetch after `mov cr0` must resolve through the live page
/// tables.  Existing entries are reused; missing levels are built from two
/// spare frames in conventional low memory.
unsafe fn identity_map_low(hhdm: u64) {
	let (pml4_frame, _) = Cr3::read();
	let pml4 = (hhdm + pml4_frame.start_address().as_u64()) as *mut u64;

	let pml4e = pml4.read_volatile();
	let pdpt_phys = if pml4e & PTE_PRESENT != 0 {
		pml4e & PTE_ADDR_MASK
	} else {
		zero_frame(hhdm, LOW_PDPT_FRAME);
		pml4.write_volatile(LOW_PDPT_FRAME | PTE_PRESENT | PTE_WRITABLE);
		LOW_PDPT_FRAME
	};

	let pdpt = (hhdm + pdpt_phys) as *mut u64;
	let pdpte = pdpt.read_volatile();
	if pdpte & PTE_PRESENT != 0 && pdpte & PTE_HUGE != 0 {
		// A 1 GiB identity page already covers low memory.
		return;
	}
	let pd_phys = if pdpte & PTE_PRESENT != 0 {
		pdpte & PTE_ADDR_MASK
	} else {
		zero_frame(hhdm, LOW_PD_FRAME);
		pdpt.write_volatile(LOW_PD_FRAME | PTE_PRESENT | PTE_WRITABLE);
		LOW_PD_FRAME
	};

	let pd = (hhdm + pd_phys) as *mut u64;
	if pd.read_volatile() & PTE_PRESENT == 0 {
		// One 2 MiB huge page: covers the trampoline page and the spare
		// table frames.
		pd.write_volatile(PTE_PRESENT | PTE_WRITABLE | PTE_HUGE);
	}

	x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(TRAMPOLINE_ADDR));
}

/// Zero a 4 KiB physical frame through the direct map.
unsafe fn zero_frame(hhdm: u64, phys: u64) {
	core::ptr::write_bytes((hhdm + phys) as *mut u8, 0, 4096);
}
