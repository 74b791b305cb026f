//! Interrupt and trap handling.

pub mod dispatch;
mod handlers;
mod idt;
mod stubs;

pub use dispatch::{register_handler, InterruptFrame, RESCHED_VECTOR, SYSCALL_VECTOR};
pub use idt::{init, load};
pub use stubs::has_error_code;

/// APIC timer reload value for the preemption tick (divider 16).
const TIMER_INTERVAL: u32 = 10_000_000;

/// Start the periodic preemption tick on the calling CPU.
pub fn enable_preemption_timer() {
	khal::apic::enable_timer(
		khal::apic::TIMER_VECTOR,
		TIMER_INTERVAL,
		khal::apic::TimerDivide::By16,
	);
}
