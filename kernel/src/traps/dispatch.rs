//! Interrupt dispatch: the uniform frame and the per-vector handler table.
//!
//! The assembly common path delivers every interrupt here with a pointer to
//! the canonical frame. Vectors are a flat 0-255 space with per-vector
//! policy: CPU exceptions, the cross-CPU reschedule IPI, the spurious
//! vector, and registered device handlers.

use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::percpu;

/// Vector used for cross-CPU preemption requests.
pub const RESCHED_VECTOR: u8 = 0xF0;

/// Vector of the ring-3 syscall gate.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// The register frame the stubs build, low to high addresses.
///
/// This layout is a public contract between the entry assembly and handler
/// code: the push order in `traps::stubs` and the hardware-pushed tail
/// produce exactly these offsets. Handlers may mutate the mutable state a
/// resume should see (e.g. `rax` for syscall returns).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    /// Vector number pushed by the entry stub.
    pub vector: u64,
    /// Hardware error code, or 0 for vectors without one.
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl InterruptFrame {
    /// Did this trap come from ring 3?
    #[inline]
    pub fn from_user(&self) -> bool {
        self.cs & 3 != 0
    }
}

/// A registered interrupt handler.
pub type InterruptHandler = fn(&mut InterruptFrame);

/// Per-vector handler table. Slots hold the handler's address, or 0.
/// Function pointers as atomics keep registration safe without locking the
/// dispatch path.
static HANDLERS: [AtomicUsize; 256] = {
    const EMPTY: AtomicUsize = AtomicUsize::new(0);
    [EMPTY; 256]
};

/// Install a handler for `vector`, replacing any previous one.
pub fn register_handler(vector: u8, handler: InterruptHandler) {
    HANDLERS[vector as usize].store(handler as usize, Ordering::Release);
}

/// Rust-side interrupt dispatcher, called by the assembly common path with
/// interrupts disabled.
///
/// Handlers that want to nest must re-enable interrupts themselves.
pub extern "C" fn interrupt_dispatch(frame: *mut InterruptFrame) {
    let frame = unsafe { &mut *frame };

    if let Some(cpu) = percpu::try_current() {
        cpu.interrupt_count.fetch_add(1, Ordering::Relaxed);
    }

    let vector = frame.vector as u8;

    let registered = HANDLERS[vector as usize].load(Ordering::Acquire);
    if registered != 0 {
        let handler: InterruptHandler = unsafe { mem::transmute(registered) };
        handler(frame);
        return;
    }

    match vector {
        0..=31 => super::handlers::exception(frame),
        RESCHED_VECTOR => {
            // The sender only wants the preemption check at our interrupt
            // tail; acknowledging is all that is left to do here.
            if let Some(cpu) = percpu::try_current() {
                cpu.set_need_resched();
            }
            khal::apic::eoi();
        }
        khal::apic::SPURIOUS_VECTOR => {
            // Spurious interrupts are not acknowledged.
        }
        _ => {
            klog::warn!(
                "unexpected interrupt vector {} (rip={:#x})",
                vector,
                frame.rip
            );
            khal::apic::eoi();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn frame_layout_is_the_published_abi() {
        assert_eq!(offset_of!(InterruptFrame, r15), 0);
        assert_eq!(offset_of!(InterruptFrame, r8), 56);
        assert_eq!(offset_of!(InterruptFrame, rbp), 64);
        assert_eq!(offset_of!(InterruptFrame, rdi), 72);
        assert_eq!(offset_of!(InterruptFrame, rsi), 80);
        assert_eq!(offset_of!(InterruptFrame, rax), 112);
        assert_eq!(offset_of!(InterruptFrame, vector), 120);
        assert_eq!(offset_of!(InterruptFrame, error_code), 128);
        assert_eq!(offset_of!(InterruptFrame, rip), 136);
        // The common path tests CS at [frame + 144] before the GPR area
        // exists, i.e. at [rsp + 24] relative to the vector slot.
        assert_eq!(offset_of!(InterruptFrame, cs), 144);
        assert_eq!(offset_of!(InterruptFrame, rflags), 152);
        assert_eq!(offset_of!(InterruptFrame, rsp), 160);
        assert_eq!(offset_of!(InterruptFrame, ss), 168);
        assert_eq!(size_of::<InterruptFrame>(), 176);
    }

    #[test]
    fn ring_detection_uses_cs_rpl() {
        let mut frame: InterruptFrame = unsafe { core::mem::zeroed() };
        frame.cs = 0x08;
        assert!(!frame.from_user());
        frame.cs = 0x23;
        assert!(frame.from_user());
    }
}
