//! IDT construction: wiring all 256 vectors to the entry stubs.

use spin::Once;

use crate::arch::gdt::KERNEL_CODE_SELECTOR;
use crate::arch::idt::{EntryOptions, GateType, Idt, PrivilegeLevel};

use super::dispatch::{self, SYSCALL_VECTOR};
use super::{handlers, stubs};

/// The shared IDT; every CPU loads the same table.
static IDT: Once<Idt> = Once::new();

/// Build the IDT and load it on the calling (bootstrap) CPU.
///
/// Every vector routes through its stub into the common entry, so all 256
/// entries look alike: interrupt gates (IF cleared on entry) on the kernel
/// code segment. Only the gate DPLs differ: `int 0x80` and `int3` must be
/// reachable from ring 3.
pub fn init() {
	dispatch::register_handler(khal::apic::TIMER_VECTOR, handlers::timer);
	dispatch::register_handler(SYSCALL_VECTOR, handlers::syscall);

	let idt = IDT.call_once(|| {
		let mut idt = Idt::new();
		for vector in 0..=255u8 {
			let mut options = EntryOptions::new()
				.set_present(true)
				.set_gate_type(GateType::Interrupt);
			if vector == SYSCALL_VECTOR || vector == 3 {
				options = options.set_privilege_level(PrivilegeLevel::Ring3);
			}
			idt.set_handler(
				vector,
				stubs::stub_address(vector),
				KERNEL_CODE_SELECTOR,
				options,
			);
		}
		idt
	});
	idt.load();

	klog::debug!("idt: 256 vectors wired to the stub table");
}

/// Load the already-built IDT on the calling CPU (AP bringup path).
pub fn load() {
	if let Some(idt) = IDT.get() {
		idt.load();
	}
}
