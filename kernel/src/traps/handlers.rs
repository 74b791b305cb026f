//! Default interrupt and exception handlers.

use super::dispatch::InterruptFrame;
use crate::arch::percpu;
use crate::task::sched;

/// Mnemonics for the architectural exception vectors.
pub const EXCEPTION_NAMES: [&str; 32] = [
    "#DE divide error",
    "#DB debug",
    "NMI",
    "#BP breakpoint",
    "#OF overflow",
    "#BR bound range",
    "#UD invalid opcode",
    "#NM device not available",
    "#DF double fault",
    "coprocessor segment overrun",
    "#TS invalid TSS",
    "#NP segment not present",
    "#SS stack fault",
    "#GP general protection",
    "#PF page fault",
    "reserved",
    "#MF x87 floating point",
    "#AC alignment check",
    "#MC machine check",
    "#XM SIMD floating point",
    "#VE virtualization",
    "#CP control protection",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "#HV hypervisor injection",
    "#VC VMM communication",
    "#SX security",
    "reserved",
];

/// The upper bound of user-space canonical addresses.
/// Anything at or above this address is kernel memory.
const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Handle a CPU exception (vectors 0-31) without a registered handler.
///
/// A fault raised in ring 3 kills the offending task; the kernel carries
/// on. A fault in ring 0 is a kernel bug and panics with the frame.
pub fn exception(frame: &mut InterruptFrame) {
    let vector = frame.vector as usize;
    let name = EXCEPTION_NAMES.get(vector).copied().unwrap_or("unknown");

    if frame.from_user() {
        klog::error!(
            "task fault: {} (vec {}) err={:#x} rip={:#x} rsp={:#x}",
            name,
            vector,
            frame.error_code,
            frame.rip,
            frame.rsp
        );
        // The task never resumes; this abandons the interrupt frame and
        // schedules other work.
        sched::exit_current();
    }

    panic!(
        "CPU exception in ring 0: {} (vec {}) err={:#x} rip={:#x} rsp={:#x} rflags={:#x}",
        name, vector, frame.error_code, frame.rip, frame.rsp, frame.rflags
    );
}

/// APIC timer tick: acknowledge and ask for a reschedule at the tail.
pub fn timer(_frame: &mut InterruptFrame) {
    khal::apic::eoi();
    if let Some(cpu) = percpu::try_current() {
        cpu.set_need_resched();
    }
}

// ── Minimal ring-3 service gate (int 0x80) ──────────────────────

/// `log(msg_ptr, msg_len)` — write a message to the kernel log.
const SYS_LOG: u64 = 0;
/// `exit(code)` — terminate the current task.
const SYS_EXIT: u64 = 1;
/// `yield()` — give up the CPU.
const SYS_YIELD: u64 = 2;

/// Validate that a user-space range `[ptr, ptr+len)` is safe for the
/// kernel to read on behalf of a user task.
///
/// Returns `false` if `ptr` is null, `ptr + len` overflows, or any byte of
/// the range falls in kernel address space.
fn validate_user_ptr(ptr: u64, len: usize) -> bool {
    if ptr == 0 {
        return false;
    }
    if len == 0 {
        return true;
    }
    match ptr.checked_add(len as u64) {
        Some(end) => end <= USER_SPACE_END,
        None => false,
    }
}

/// Handler for the `int 0x80` gate.
///
/// Deliberately tiny: enough surface for a user task to log, yield, and
/// exit through the common interrupt path. Results return in `rax`.
pub fn syscall(frame: &mut InterruptFrame) {
    match frame.rax {
        SYS_LOG => {
            let ptr = frame.rdi;
            let len = frame.rsi as usize;
            if !validate_user_ptr(ptr, len) || len > 1024 {
                frame.rax = u64::MAX;
                return;
            }
            let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, len) };
            frame.rax = match core::str::from_utf8(bytes) {
                Ok(msg) => {
                    klog::info!("[user] {}", msg);
                    0
                }
                Err(_) => u64::MAX,
            };
        }
        SYS_EXIT => {
            klog::info!("[user] exit(code={})", frame.rdi);
            sched::exit_current();
        }
        SYS_YIELD => {
            if let Some(cpu) = percpu::try_current() {
                cpu.set_need_resched();
            }
            frame.rax = 0;
        }
        nr => {
            klog::warn!("[user] unknown syscall nr={}", nr);
            frame.rax = u64::MAX;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_pointer_validation() {
        assert!(!validate_user_ptr(0, 8));
        assert!(validate_user_ptr(0x1000, 0));
        assert!(validate_user_ptr(0x1000, 64));
        // Range crossing into kernel space.
        assert!(!validate_user_ptr(USER_SPACE_END - 4, 8));
        // Overflowing range.
        assert!(!validate_user_ptr(u64::MAX - 2, 8));
    }

    #[test]
    fn every_exception_vector_has_a_name() {
        assert_eq!(EXCEPTION_NAMES.len(), 32);
        assert_eq!(EXCEPTION_NAMES[13], "#GP general protection");
        assert_eq!(EXCEPTION_NAMES[14], "#PF page fault");
    }
}
