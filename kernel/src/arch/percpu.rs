//! Per-CPU state, addressable through the GS segment register.
//!
//! Each logical processor owns one `PerCpu` block holding its identity, its
//! own GDT and TSS (each core needs its own to avoid the TSS "Busy" bit #GP
//! fault), its kernel stack, and scheduling state.  The address of the block
//! doubles as the GS base, so `gs:[0]` always reads the current CPU's id.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::arch::gdt::{Gdt, Selectors};
use crate::arch::tss::Tss;
use crate::error::KernelError;

/// Maximum number of logical processors supported.
pub const MAX_CPUS: usize = 16;

/// Size of each CPU's kernel stack (32 KiB, 16-byte aligned).
pub const CPU_STACK_SIZE: usize = 32 * 1024;

/// Sentinel for "no task" in `current_task`.
pub const NO_TASK: u32 = u32::MAX;

/// MSR addresses for GS base manipulation.
const IA32_GS_BASE: u32 = 0xC000_0101;
const IA32_KERNEL_GS_BASE: u32 = 0xC000_0102;

/// Becomes true once the boot CPU has a GS base installed; before that,
/// `gs:[0]` reads are meaningless.
static PERCPU_READY: AtomicBool = AtomicBool::new(false);

// ── MSR helpers ─────────────────────────────────────────────────

#[inline]
unsafe fn wrmsr(msr: u32, value: u64) {
	let low = value as u32;
	let high = (value >> 32) as u32;
	core::arch::asm!(
		"wrmsr",
		in("ecx") msr,
		in("eax") low,
		in("edx") high,
		options(nomem, nostack, preserves_flags)
	);
}

// ── Per-CPU block ───────────────────────────────────────────────

/// Per-CPU kernel stack.
#[repr(C, align(16))]
struct CpuStack {
	data: [u8; CPU_STACK_SIZE],
}

/// One logical processor's kernel-side state.
///
/// The `cpu_id` field MUST stay at offset 0: the interrupt path and
/// `cpu_id()` read it through `gs:[0]`.
#[repr(C)]
pub struct PerCpu {
	/// Dense 0-based index (0 = BSP).  **Must be at offset 0.**
	pub cpu_id: u32,
	/// Hardware local-APIC identifier.
	pub apic_id: u32,
	/// Two scratch slots reserved for the interrupt/syscall entry stubs
	/// (offsets 8 and 16 from the GS base).
	pub scratch: [u64; 2],
	/// Top of this CPU's current ring-0 stack; always equals `tss.rsp0`.
	kernel_stack: AtomicU64,
	/// Arena id of the task running on this CPU, or `NO_TASK`.
	current_task: AtomicU32,
	/// Arena id of the task we just switched away from (cleared by the
	/// incoming task once the outgoing save is published).
	prev_task: AtomicU32,
	/// True for the bootstrap processor.
	pub is_bsp: bool,
	/// Published with release once the CPU is fully set up; never reset.
	online: AtomicBool,
	/// Set by interrupt handlers to request a switch at the interrupt tail.
	need_resched: AtomicBool,
	/// Interrupts taken on this CPU.
	pub interrupt_count: AtomicU64,
	/// Context switches performed on this CPU.
	pub switch_count: AtomicU64,
	/// This CPU's TSS.  Mutated through a raw pointer when the scheduler
	/// retargets RSP0, hence the cell.
	tss: UnsafeCell<Tss>,
	/// This CPU's own GDT (contains the TSS descriptor for `tss`).
	gdt: Gdt,
	/// Selector values for `gdt` (identical across cores).
	selectors: Selectors,
	/// The CPU's kernel stack storage.
	stack: CpuStack,
}

// A PerCpu is only ever mutated by its owning CPU after bringup; the
// cross-CPU fields (`online`, counters) are atomics.
unsafe impl Sync for PerCpu {}

impl PerCpu {
	/// Create a zeroed PerCpu.  Must be initialised via `init()`.
	const fn zeroed() -> Self {
		Self {
			cpu_id: 0,
			apic_id: 0,
			scratch: [0; 2],
			kernel_stack: AtomicU64::new(0),
			current_task: AtomicU32::new(NO_TASK),
			prev_task: AtomicU32::new(NO_TASK),
			is_bsp: false,
			online: AtomicBool::new(false),
			need_resched: AtomicBool::new(false),
			interrupt_count: AtomicU64::new(0),
			switch_count: AtomicU64::new(0),
			tss: UnsafeCell::new(Tss::new()),
			gdt: Gdt::zeroed(),
			selectors: Selectors::zeroed(),
			stack: CpuStack { data: [0; CPU_STACK_SIZE] },
		}
	}

	/// Initialise this PerCpu for a specific core.
	///
	/// Builds the TSS with this core's stack as RSP0 and a GDT whose TSS
	/// descriptor points at `self.tss`.  Runs single-threaded during
	/// discovery, before the target CPU executes any kernel code.
	fn init(&mut self, cpu_id: u32, apic_id: u32, is_bsp: bool) {
		self.cpu_id = cpu_id;
		self.apic_id = apic_id;
		self.is_bsp = is_bsp;

		let top = self.stack.data.as_ptr() as u64 + CPU_STACK_SIZE as u64;
		self.kernel_stack.store(top, Ordering::Relaxed);
		self.tss.get_mut().rsp[0] = top;

		self.selectors = self.gdt.init();
		let tss_ref: &Tss = unsafe { &*self.tss.get() };
		self.gdt.set_tss(tss_ref);
	}

	/// Top of this CPU's own (boot/idle) kernel stack.
	pub fn stack_top(&self) -> u64 {
		self.stack.data.as_ptr() as u64 + CPU_STACK_SIZE as u64
	}

	/// Load this core's GDT and TSS and install the GS base.
	///
	/// # Safety
	/// Must run on the CPU this block describes, exactly once, with
	/// interrupts disabled.
	pub unsafe fn install(&'static self) {
		self.gdt.load(&self.selectors);
		Gdt::load_tss(&self.selectors);
		set_gs_base(self);
		PERCPU_READY.store(true, Ordering::Release);
	}

	/// Current ring-0 stack top (mirrors `tss.rsp0`).
	pub fn kernel_stack(&self) -> u64 {
		self.kernel_stack.load(Ordering::Relaxed)
	}

	/// Retarget the ring-0 entry stack (on task switch).
	///
	/// Keeps `kernel_stack == tss.rsp0`: ring 3 -> ring 0 transitions must
	/// land on the running task's kernel stack.
	pub fn set_kernel_stack(&self, top: u64) {
		self.kernel_stack.store(top, Ordering::Relaxed);
		unsafe {
			Tss::set_rsp0(self.tss.get(), top);
		}
	}

	/// Read back `tss.rsp0` (invariant checks and diagnostics).
	pub fn tss_rsp0(&self) -> u64 {
		unsafe { (*self.tss.get()).rsp0() }
	}

	/// Has this CPU completed bringup?
	pub fn is_online(&self) -> bool {
		self.online.load(Ordering::Acquire)
	}

	fn set_online(&self) {
		self.online.store(true, Ordering::Release);
	}

	/// Arena id of the running task, or `NO_TASK`.
	pub fn current_task(&self) -> u32 {
		self.current_task.load(Ordering::Relaxed)
	}

	pub fn set_current_task(&self, id: u32) {
		self.current_task.store(id, Ordering::Relaxed);
	}

	/// Record the task being switched away from; the incoming task calls
	/// `take_prev_task` once the save is complete.
	pub fn set_prev_task(&self, id: u32) {
		self.prev_task.store(id, Ordering::Relaxed);
	}

	pub fn take_prev_task(&self) -> u32 {
		self.prev_task.swap(NO_TASK, Ordering::Relaxed)
	}

	/// Ask for a reschedule at the next interrupt tail.
	pub fn set_need_resched(&self) {
		self.need_resched.store(true, Ordering::Relaxed);
	}

	/// Consume a pending reschedule request.
	pub fn take_need_resched(&self) -> bool {
		self.need_resched.swap(false, Ordering::Relaxed)
	}
}

/// Static array of per-CPU blocks.  Lives for `'static`; entries beyond
/// the discovered CPU count stay zeroed.
static mut CPU_LOCALS: [PerCpu; MAX_CPUS] = {
	const INIT: PerCpu = PerCpu::zeroed();
	[INIT; MAX_CPUS]
};

// ── CPU manager ─────────────────────────────────────────────────

/// Process-wide CPU registry.
///
/// The table is append-only during single-threaded discovery; afterwards it
/// is read-only except for each entry's `online` flag.  Indices are stable
/// for the kernel's lifetime and entries are never removed.
pub struct CpuManager {
	count: AtomicUsize,
	online_count: AtomicUsize,
}

static MANAGER: CpuManager = CpuManager {
	count: AtomicUsize::new(0),
	online_count: AtomicUsize::new(0),
};

impl CpuManager {
	/// Record a discovered CPU and initialise its PerCpu block.
	///
	/// Only called from single-threaded discovery on the BSP.
	pub fn add(&self, apic_id: u32, is_bsp: bool) -> Result<&'static PerCpu, KernelError> {
		let idx = self.count.load(Ordering::Relaxed);
		if idx >= MAX_CPUS {
			return Err(KernelError::TooManyCpus);
		}
		let cpu = unsafe { &mut *core::ptr::addr_of_mut!(CPU_LOCALS[idx]) };
		cpu.init(idx as u32, apic_id, is_bsp);
		self.count.store(idx + 1, Ordering::Release);
		Ok(cpu)
	}

	/// Number of discovered CPUs.
	pub fn cpu_count(&self) -> usize {
		self.count.load(Ordering::Acquire)
	}

	/// Number of CPUs that have completed bringup.
	pub fn online_count(&self) -> usize {
		self.online_count.load(Ordering::Acquire)
	}

	/// Look up a CPU by dense index.
	pub fn get(&self, cpu_id: u32) -> Option<&'static PerCpu> {
		if (cpu_id as usize) < self.cpu_count() {
			Some(unsafe { &*core::ptr::addr_of!(CPU_LOCALS[cpu_id as usize]) })
		} else {
			None
		}
	}

	/// Iterate over all discovered CPUs.
	pub fn iter(&self) -> impl Iterator<Item = &'static PerCpu> {
		let count = self.cpu_count();
		(0..count).map(|i| unsafe { &*core::ptr::addr_of!(CPU_LOCALS[i]) })
	}

	/// Publish a CPU as online.  Release-ordered so that everything the CPU
	/// set up beforehand is visible to acquire-side observers.
	pub fn mark_online(&self, cpu: &PerCpu) {
		cpu.set_online();
		self.online_count.fetch_add(1, Ordering::AcqRel);
	}
}

/// The global CPU registry.
pub fn manager() -> &'static CpuManager {
	&MANAGER
}

// ── GS access ───────────────────────────────────────────────────

/// Install `cpu` as the GS base of the calling CPU.
///
/// Both IA32_GS_BASE and IA32_KERNEL_GS_BASE are set: in kernel mode the
/// active base must be the PerCpu pointer, and the shadow value is what a
/// later `swapgs` pair (user entry/exit) rotates through.
///
/// # Safety
/// Must run on the CPU the block describes.
pub unsafe fn set_gs_base(cpu: &'static PerCpu) {
	let ptr = cpu as *const PerCpu as u64;
	wrmsr(IA32_GS_BASE, ptr);
	wrmsr(IA32_KERNEL_GS_BASE, ptr);
}

/// Stage the user-mode GS base in the shadow MSR.
///
/// The ring-3 entry trampoline's `swapgs` activates this value while
/// parking the PerCpu pointer in the shadow.
///
/// # Safety
/// Only meaningful immediately before entering user mode.
pub unsafe fn stage_user_gs(user_gs: u64) {
	wrmsr(IA32_KERNEL_GS_BASE, user_gs);
}

/// Get the current core's id via the GS segment.
///
/// Reads the first u32 at the GS base, which is the `cpu_id` field of the
/// PerCpu block (guaranteed at offset 0 by `#[repr(C)]`).
#[inline]
pub fn cpu_id() -> u32 {
	let id: u32;
	unsafe {
		core::arch::asm!(
			"mov {:e}, gs:[0]",
			out(reg) id,
			options(nomem, nostack, preserves_flags)
		);
	}
	id
}

/// The calling CPU's PerCpu block.
///
/// # Panics
/// Panics if called before `install()` ran on the boot CPU.
pub fn current() -> &'static PerCpu {
	try_current().expect("per-CPU state accessed before installation")
}

/// The calling CPU's PerCpu block, or None before GS is set up.
pub fn try_current() -> Option<&'static PerCpu> {
	if !PERCPU_READY.load(Ordering::Acquire) {
		return None;
	}
	manager().get(cpu_id())
}

#[cfg(test)]
mod tests {
	use super::*;
	use core::mem::offset_of;

	#[test]
	fn cpu_id_is_at_gs_zero() {
		assert_eq!(offset_of!(PerCpu, cpu_id), 0);
		assert_eq!(offset_of!(PerCpu, apic_id), 4);
		// The entry-stub scratch slots sit right behind the identity pair.
		assert_eq!(offset_of!(PerCpu, scratch), 8);
	}

	#[test]
	fn init_keeps_stack_and_rsp0_in_sync() {
		// A heap block stands in for the static slot so the test does not
		// disturb CPU_LOCALS.
		let mut cpu = Box::new(PerCpu::zeroed());
		cpu.init(3, 7, false);
		assert_eq!(cpu.cpu_id, 3);
		assert_eq!(cpu.apic_id, 7);
		assert!(!cpu.is_bsp);
		assert!(!cpu.is_online());
		assert_eq!(cpu.kernel_stack(), cpu.stack_top());
		assert_eq!(cpu.tss_rsp0(), cpu.stack_top());
		assert_eq!(cpu.stack_top() % 16, 0);

		cpu.set_kernel_stack(0xFFFF_9000_0000_0000);
		assert_eq!(cpu.kernel_stack(), 0xFFFF_9000_0000_0000);
		assert_eq!(cpu.tss_rsp0(), 0xFFFF_9000_0000_0000);
	}

	#[test]
	fn need_resched_is_consumed_once() {
		let cpu = Box::new(PerCpu::zeroed());
		assert!(!cpu.take_need_resched());
		cpu.set_need_resched();
		assert!(cpu.take_need_resched());
		assert!(!cpu.take_need_resched());
	}
}
