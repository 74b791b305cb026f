//! Local APIC (Advanced Programmable Interrupt Controller) driver.
//!
//! The Local APIC is the modern interrupt controller on x86_64 systems.
//! Each CPU core has its own Local APIC. It handles:
//! - Local interrupt sources (timer, thermal, performance counters)
//! - Inter-Processor Interrupts (IPI)
//! - External interrupt routing from the I/O APIC
//!
//! The APIC registers are memory-mapped starting at the base address
//! stored in the IA32_APIC_BASE MSR (0x1B).

use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

/// IA32_APIC_BASE Model Specific Register.
const IA32_APIC_BASE_MSR: u32 = 0x1B;

/// Bit 11 of IA32_APIC_BASE MSR: Global APIC enable/disable.
const APIC_BASE_ENABLE: u64 = 1 << 11;

// --- APIC Register Offsets (from APIC base address) ---

/// Local APIC ID Register.
const APIC_REG_ID: u32 = 0x020;
/// Task Priority Register.
const APIC_REG_TPR: u32 = 0x080;
/// End of Interrupt Register.
const APIC_REG_EOI: u32 = 0x0B0;
/// Spurious Interrupt Vector Register.
const APIC_REG_SVR: u32 = 0x0F0;
/// Interrupt Command Register, bits 0-31.
const APIC_REG_ICR_LOW: u32 = 0x300;
/// Interrupt Command Register, bits 32-63 (destination field).
const APIC_REG_ICR_HIGH: u32 = 0x310;
/// LVT Timer Register.
const APIC_REG_LVT_TIMER: u32 = 0x320;
/// Timer Initial Count Register.
const APIC_REG_TIMER_INIT: u32 = 0x380;
/// Timer Divide Configuration Register.
const APIC_REG_TIMER_DIV: u32 = 0x3E0;

/// SVR bit 8: APIC Software Enable.
const SVR_APIC_ENABLE: u32 = 1 << 8;

/// ICR bit 12: Delivery Status (1 = send pending).
const ICR_SEND_PENDING: u32 = 1 << 12;

/// Spurious interrupt vector number (0xF0-0xFF range recommended).
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Timer interrupt vector number.
pub const TIMER_VECTOR: u8 = 32;

/// Timer mode: Periodic (bit 17 set).
const TIMER_PERIODIC: u32 = 1 << 17;

/// IPI delivery mode (ICR bits 8-10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeliveryMode {
    /// Deliver the vector in the ICR to the target.
    Fixed = 0b000,
    /// INIT: reset the target processor.
    Init = 0b101,
    /// STARTUP: begin execution at `vector << 12` in real mode.
    Startup = 0b110,
}

/// IPI level (ICR bit 14).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Level {
    Deassert = 0,
    Assert = 1,
}

/// IPI trigger mode (ICR bit 15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TriggerMode {
    Edge = 0,
    Level = 1,
}

/// Timer divider values for APIC_REG_TIMER_DIV.
#[allow(dead_code)]
#[repr(u32)]
pub enum TimerDivide {
    By1 = 0b1011,
    By2 = 0b0000,
    By4 = 0b0001,
    By8 = 0b0010,
    By16 = 0b0011,
    By32 = 0b1000,
    By64 = 0b1001,
    By128 = 0b1010,
}

/// The Local APIC virtual base address (set during initialization by the
/// BSP; APs inherit the same MMIO mapping).
static APIC_BASE: AtomicU64 = AtomicU64::new(0);

/// Read a Model Specific Register (MSR).
#[inline]
unsafe fn rdmsr(msr: u32) -> u64 {
    let (low, high): (u32, u32);
    core::arch::asm!(
        "rdmsr",
        in("ecx") msr,
        out("eax") low,
        out("edx") high,
        options(nomem, nostack, preserves_flags)
    );
    (high as u64) << 32 | low as u64
}

/// Write a Model Specific Register (MSR).
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

/// Read a 32-bit APIC register.
#[inline]
unsafe fn read_reg(offset: u32) -> u32 {
    let addr = APIC_BASE.load(Ordering::Relaxed) + offset as u64;
    ptr::read_volatile(addr as *const u32)
}

/// Write a 32-bit APIC register.
#[inline]
unsafe fn write_reg(offset: u32, value: u32) {
    let addr = APIC_BASE.load(Ordering::Relaxed) + offset as u64;
    ptr::write_volatile(addr as *mut u32, value);
}

/// Software-enable the local APIC of the calling CPU.
///
/// Sets the Spurious Interrupt Vector Register (vector + enable bit) and
/// clears the Task Priority Register so all priority levels are accepted.
unsafe fn enable_current() -> u32 {
    // Ensure the global APIC enable bit is set in the per-core MSR.
    let msr_value = rdmsr(IA32_APIC_BASE_MSR);
    if msr_value & APIC_BASE_ENABLE == 0 {
        wrmsr(IA32_APIC_BASE_MSR, msr_value | APIC_BASE_ENABLE);
    }

    let svr = SVR_APIC_ENABLE | SPURIOUS_VECTOR as u32;
    write_reg(APIC_REG_SVR, svr);

    // Accept all priority levels.
    write_reg(APIC_REG_TPR, 0);

    read_reg(APIC_REG_ID) >> 24
}

/// Initialize and enable the Local APIC on the bootstrap processor.
///
/// Reads the APIC MMIO base from the IA32_APIC_BASE MSR, converts it to a
/// virtual address through the HHDM offset, and software-enables the APIC.
///
/// # Arguments
///
/// * `hhdm_offset` - The Higher Half Direct Map offset from the bootloader
///
/// Returns the APIC ID of the current processor.
pub fn init(hhdm_offset: u64) -> u32 {
    unsafe {
        let msr_value = rdmsr(IA32_APIC_BASE_MSR);
        let phys_base = msr_value & 0xFFFF_FFFF_FFFF_F000;

        // The APIC registers live in MMIO space (typically 0xFEE00000),
        // which the HHDM covers.
        APIC_BASE.store(hhdm_offset + phys_base, Ordering::Relaxed);

        enable_current()
    }
}

/// Initialize the Local APIC on an application processor.
///
/// The MMIO mapping is shared across cores; `base` is the virtual base the
/// BSP established (handed over through the bringup mailbox).
///
/// Returns the APIC ID of the current processor.
pub fn init_ap(base: u64) -> u32 {
    unsafe {
        APIC_BASE.store(base, Ordering::Relaxed);
        enable_current()
    }
}

/// The virtual base address of the APIC MMIO window.
pub fn mmio_base() -> u64 {
    APIC_BASE.load(Ordering::Relaxed)
}

/// Read the local APIC ID of the calling CPU.
pub fn id() -> u32 {
    unsafe { read_reg(APIC_REG_ID) >> 24 }
}

/// Send an End of Interrupt (EOI) signal to the Local APIC.
///
/// This must be called at the end of every interrupt handler for
/// APIC-sourced interrupts (timer, IPI, etc.).
pub fn eoi() {
    unsafe {
        write_reg(APIC_REG_EOI, 0);
    }
}

/// Send an Inter-Processor Interrupt.
///
/// Writes the destination APIC ID into ICR_HIGH, then the command word into
/// ICR_LOW (which triggers the send), and spins until the APIC reports the
/// IPI as delivered to the bus.
///
/// Destination mode is always physical; no shorthand is used.
pub fn send_ipi(apic_id: u32, vector: u8, mode: DeliveryMode, level: Level, trigger: TriggerMode) {
    let cmd = vector as u32
        | (mode as u32) << 8
        | (level as u32) << 14
        | (trigger as u32) << 15;

    unsafe {
        write_reg(APIC_REG_ICR_HIGH, apic_id << 24);
        write_reg(APIC_REG_ICR_LOW, cmd);

        while read_reg(APIC_REG_ICR_LOW) & ICR_SEND_PENDING != 0 {
            core::hint::spin_loop();
        }
    }
}

/// Send an INIT IPI (assert, level-triggered) to reset the target core.
pub fn send_init(apic_id: u32) {
    send_ipi(apic_id, 0, DeliveryMode::Init, Level::Assert, TriggerMode::Level);
}

/// Send a STARTUP IPI; the target begins real-mode execution at
/// `(vector as u32) << 12`.
pub fn send_startup(apic_id: u32, vector: u8) {
    send_ipi(apic_id, vector, DeliveryMode::Startup, Level::Assert, TriggerMode::Edge);
}

/// Enable the Local APIC Timer in periodic mode.
///
/// # Arguments
///
/// * `vector` - Interrupt vector number for timer interrupts
/// * `initial_count` - Timer initial count value
/// * `divider` - Timer frequency divider
pub fn enable_timer(vector: u8, initial_count: u32, divider: TimerDivide) {
    unsafe {
        write_reg(APIC_REG_TIMER_DIV, divider as u32);

        // Configure LVT Timer: vector number + periodic mode
        write_reg(APIC_REG_LVT_TIMER, TIMER_PERIODIC | vector as u32);

        // Set initial count (starts the timer)
        write_reg(APIC_REG_TIMER_INIT, initial_count);
    }
}

/// Disable the Local APIC Timer.
#[allow(dead_code)]
pub fn disable_timer() {
    unsafe {
        // Mask the timer (bit 16 = mask)
        let lvt = read_reg(APIC_REG_LVT_TIMER);
        write_reg(APIC_REG_LVT_TIMER, lvt | (1 << 16));
    }
}
