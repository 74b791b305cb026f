//! The 256-entry interrupt stub table and common entry path.
//!
//! Every IDT vector points at one of 256 tiny stubs, spaced exactly 16
//! bytes apart.  A stub normalizes the stack to a uniform shape (vectors
//! where the CPU pushes an error code keep it, every other stub pushes a
//! zero), then pushes its own vector number and jumps to the shared entry.
//!
//! The common entry completes the canonical [`InterruptFrame`], balances
//! the GS base across ring crossings, and hands control to the Rust
//! dispatcher followed by the scheduler's preemption hook.
//!
//! [`InterruptFrame`]: super::dispatch::InterruptFrame

/// Vectors where the CPU pushes an error code (#DF, #TS, #NP, #SS, #GP,
/// #PF, #AC, #CP, and the VMM/security extension classes).
pub const fn has_error_code(vector: u8) -> bool {
	matches!(vector, 8 | 10..=14 | 17 | 21 | 29 | 30)
}

/// Byte distance between consecutive stubs.
pub const STUB_STRIDE: usize = 16;

core::arch::global_asm!(
	r#"
	.section .text

	// ── Common entry ────────────────────────────────────────────
	//
	// On arrival: [rsp] = vector, +8 = error code, +16 = RIP, +24 = CS,
	// +32 = RFLAGS, +40 = RSP, +48 = SS.  All gates are interrupt gates,
	// so IF is already clear; nothing here re-enables interrupts.
	.balign 16
interrupt_common:
	// Traps from ring 3 arrive with the user's GS base active; swap the
	// per-CPU pointer back in.  The matching swap on the way out keeps
	// entry/exit balanced on every path.
	test qword ptr [rsp + 24], 3
	jz 1f
	swapgs
1:
	cld

	// Complete the canonical frame (R15 lands lowest).
	push rax
	push rbx
	push rcx
	push rdx
	push rsi
	push rdi
	push rbp
	push r8
	push r9
	push r10
	push r11
	push r12
	push r13
	push r14
	push r15

	// First argument is the frame pointer; keep the unaligned frame
	// address in rbp (callee-saved) and align for the calls.
	mov rdi, rsp
	mov rbp, rsp
	and rsp, -16
	call {dispatch}

	// The preemption hook may context-switch; when this task resumes,
	// execution continues right here on its own stack and the frame
	// below is still intact.
	call {preempt}
	mov rsp, rbp

	pop r15
	pop r14
	pop r13
	pop r12
	pop r11
	pop r10
	pop r9
	pop r8
	pop rbp
	pop rdi
	pop rsi
	pop rdx
	pop rcx
	pop rbx
	pop rax

	// Returning to ring 3: park the per-CPU pointer in the shadow again.
	test qword ptr [rsp + 24], 3
	jz 2f
	swapgs
2:
	// Drop vector + error code, then return through the hardware frame.
	add rsp, 16
	iretq

	// ── Stub table ──────────────────────────────────────────────
	//
	// The IDT computes each stub as interrupt_stubs + vector * 16, so the
	// 16-byte spacing is load-bearing.  Pushes are emitted as raw bytes:
	// 6A imm8 sign-extends (vectors < 128), 68 imm32 covers the rest.
	.balign 16
	.global interrupt_stubs
interrupt_stubs:
	.set vector, 0
	.rept 256
	.balign 16
	.if (vector == 8) + ((vector >= 10) & (vector <= 14)) + (vector == 17) + (vector == 21) + (vector == 29) + (vector == 30)
	// hardware already pushed the error code
	.else
	push 0
	.endif
	.if vector < 128
	.byte 0x6a, vector
	.else
	.byte 0x68
	.long vector
	.endif
	jmp interrupt_common
	.set vector, vector + 1
	.endr
	.global interrupt_stubs_end
interrupt_stubs_end:
	"#,
	dispatch = sym super::dispatch::interrupt_dispatch,
	preempt = sym crate::task::sched::sched_check_preempt,
);

extern "C" {
	static interrupt_stubs: u8;
	static interrupt_stubs_end: u8;
}

/// Address of the entry stub for `vector`.
pub fn stub_address(vector: u8) -> usize {
	let base = unsafe { &interrupt_stubs as *const u8 as usize };
	base + vector as usize * STUB_STRIDE
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_code_vector_set_is_exact() {
		let expected = [8u8, 10, 11, 12, 13, 14, 17, 21, 29, 30];
		for v in 0..=255u8 {
			assert_eq!(has_error_code(v), expected.contains(&v), "vector {v}");
		}
	}

	#[test]
	fn table_is_dense_and_fits_the_stride() {
		let base = stub_address(0);
		let end = unsafe { &interrupt_stubs_end as *const u8 as usize };
		let len = end - base;
		// 255 full strides plus a last stub of at least one instruction.
		assert!(len > 255 * STUB_STRIDE, "table too short: {len}");
		assert!(len <= 256 * STUB_STRIDE, "table overruns stride: {len}");
		assert_eq!(base % STUB_STRIDE, 0);
	}

	#[test]
	fn stubs_normalize_the_error_code_slot() {
		// Read the first instruction of each stub out of the linked table.
		// Stubs without a hardware error code must start with `push 0`
		// (6A 00); error-code stubs start by pushing their vector.
		for v in 0..=255u8 {
			let bytes = unsafe {
				core::slice::from_raw_parts(stub_address(v) as *const u8, 2)
			};
			if has_error_code(v) {
				// All error-code vectors are < 128: push imm8 of vector.
				assert_eq!(bytes, &[0x6a, v], "vector {v}");
			} else {
				assert_eq!(bytes, &[0x6a, 0x00], "vector {v}");
			}
		}
	}
}
