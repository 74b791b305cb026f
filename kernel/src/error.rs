//! Kernel error kinds.
//!
//! Errors are surfaced as enumerated values up the call chain to the boot
//! path. Everything here is fatal during bringup: the caller logs the error
//! and halts the BSP. Nothing is retried internally.

use core::fmt;

/// Errors produced by CPU discovery, AP bringup, and task creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The ACPI tables contain no MADT.
    NoMadt,
    /// The MADT lists no enabled processors.
    NoCpus,
    /// No MADT entry matched the bootstrap processor's APIC id.
    NoBsp,
    /// The MADT lists more processors than the CPU table can hold.
    TooManyCpus,
    /// An application processor never signalled the bringup mailbox.
    ApStartupTimeout,
    /// A bounded wait elapsed before its condition became true.
    Timeout,
    /// A fixed-capacity allocation pool is exhausted.
    OutOfMemory,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            KernelError::NoMadt => "no MADT in ACPI tables",
            KernelError::NoCpus => "MADT lists no enabled CPUs",
            KernelError::NoBsp => "no MADT entry matches the BSP APIC id",
            KernelError::TooManyCpus => "more CPUs than the CPU table supports",
            KernelError::ApStartupTimeout => "AP did not signal startup mailbox",
            KernelError::Timeout => "bounded wait elapsed",
            KernelError::OutOfMemory => "allocation pool exhausted",
        };
        f.write_str(msg)
    }
}
