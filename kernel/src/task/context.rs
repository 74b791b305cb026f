//! The kernel context-switch primitive.
//!
//! Only the callee-preserved subset of the register file plus RFLAGS moves
//! with a task; caller-saved registers are dead at any call site by the
//! ABI, so saving them would be wasted work. A suspended task's kernel
//! stack top holds, from low to high addresses:
//!
//! ```text
//!   [sp + 0]  RFLAGS
//!   [sp + 8]  R15
//!   [sp + 16] R14
//!   [sp + 24] R13
//!   [sp + 32] R12
//!   [sp + 40] RBX
//!   [sp + 48] RBP
//!   [sp + 56] return address
//! ```
//!
//! `context_switch` produces that layout on the old stack and consumes it
//! from the new one; a freshly created task gets the same image pre-seeded
//! so the first switch "resumes" into its entry routine. Interrupts must be
//! disabled across the stack pointer swap.

core::arch::global_asm!(
	r#"
	.section .text
	.balign 16
	.global context_switch
	.global context_load

// context_switch(old_sp_out: *mut u64, new_sp: u64)
//
// Saves the callee-preserved state on the running stack, records the
// resulting stack pointer through rdi, then resumes new_sp.  Returns on
// the new stack, wherever that task last suspended.
context_switch:
	push rbp
	push rbx
	push r12
	push r13
	push r14
	push r15
	pushfq
	mov [rdi], rsp
	mov rdi, rsi
	// fall through into the restore half

// context_load(new_sp: u64) -> !
//
// The restore half alone: used by the very first schedule on each CPU,
// where there is no prior context to save.  The previous stack is simply
// abandoned.
context_load:
	mov rsp, rdi
	popfq
	pop r15
	pop r14
	pop r13
	pop r12
	pop rbx
	pop rbp
	ret
	"#
);

extern "C" {
	/// Swap from the current context to `new_sp`, storing the suspended
	/// stack pointer through `old_sp_out`.
	///
	/// Cannot fail; handing it a mismatched or live stack is a scheduler
	/// bug, not a recoverable condition.
	pub fn context_switch(old_sp_out: *mut u64, new_sp: u64);

	/// Resume `new_sp` without saving the current context.
	pub fn context_load(new_sp: u64) -> !;
}

/// Number of quadwords in a seeded first-run image.
pub const SEEDED_STACK_WORDS: usize = 8;

/// RFLAGS image for a task that has never run: reserved bit 1 only, IF
/// clear.  The task's entry path enables interrupts once it is ready.
const FRESH_TASK_RFLAGS: u64 = 0x2;

/// Seed `stack_top` so the first switch onto it returns into `entry`.
///
/// `entry` begins with the stack pointer 8 bytes below a 16-byte boundary,
/// exactly as if it had been `call`ed. Returns the stack pointer to store
/// as the task's saved `sp`.
///
/// # Safety
/// Callers must own the stack and `stack_top` must be 16-byte aligned with
/// at least `SEEDED_STACK_WORDS * 8 + 8` bytes below it.
pub unsafe fn seed_kernel_stack(stack_top: u64, entry: u64) -> u64 {
	debug_assert_eq!(stack_top % 16, 0);

	// Drop 8 bytes first so the entry routine observes call-style
	// alignment after the final `ret` consumes the return address.
	let sp = stack_top - 8 - (SEEDED_STACK_WORDS as u64) * 8;
	let words = sp as *mut u64;
	words.add(0).write(FRESH_TASK_RFLAGS); // RFLAGS
	words.add(1).write(0); // R15
	words.add(2).write(0); // R14
	words.add(3).write(0); // R13
	words.add(4).write(0); // R12
	words.add(5).write(0); // RBX
	words.add(6).write(0); // RBP
	words.add(7).write(entry); // return address
	sp
}

#[cfg(test)]
mod tests {
	use super::*;
	use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

	#[test]
	fn seeded_image_matches_the_restore_order() {
		let mut buf = vec![0u8; 4096];
		let top = (buf.as_mut_ptr() as u64 + 4096) & !15;
		let sp = unsafe { seed_kernel_stack(top, 0xDEAD_BEEF_CAFE) };

		assert_eq!(sp % 16, 8);
		assert_eq!(top - sp, 8 + SEEDED_STACK_WORDS as u64 * 8);

		let words =
			unsafe { core::slice::from_raw_parts(sp as *const u64, SEEDED_STACK_WORDS) };
		assert_eq!(words[0], 0x2, "RFLAGS: reserved bit, IF clear");
		assert_eq!(&words[1..7], &[0; 6], "callee registers start zeroed");
		assert_eq!(words[7], 0xDEAD_BEEF_CAFE, "return address targets entry");
	}

	// A real round trip through the primitive: switch onto a seeded stack,
	// run its entry routine, and load straight back into the suspended
	// test context.  Exercises both halves plus the first-run convention.

	static MAIN_SP: AtomicU64 = AtomicU64::new(0);
	static ENTERED: AtomicBool = AtomicBool::new(false);

	extern "C" fn ping() {
		ENTERED.store(true, Ordering::SeqCst);
		unsafe {
			context_load(MAIN_SP.load(Ordering::SeqCst));
		}
	}

	#[test]
	fn switch_resumes_a_seeded_stack_and_back() {
		let mut buf = vec![0u8; 16 * 1024];
		let top = (buf.as_mut_ptr() as u64 + buf.len() as u64) & !15;
		let seeded = unsafe { seed_kernel_stack(top, ping as usize as u64) };

		unsafe {
			context_switch(MAIN_SP.as_ptr(), seeded);
		}

		// `ping` ran on the seeded stack and loaded us back; our
		// callee-saved state survived the round trip (the compiler relies
		// on it for `buf` and friends to still be valid here).
		assert!(ENTERED.load(Ordering::SeqCst));
		assert_ne!(MAIN_SP.load(Ordering::SeqCst), 0);
		drop(buf);
	}
}
