//! Serial port (COM1 UART 16550) driver.
//!
//! The UART is the kernel's most reliable output channel: it works from the
//! first instruction of boot, needs no memory mapping, and survives most
//! kinds of kernel corruption.  All log output ultimately lands here.

use core::fmt;
use spin::Mutex;

use crate::port::{inb, outb};

/// COM1 base port address
const COM1_PORT: u16 = 0x3F8;

/// Serial port driver for COM1
pub struct Serial {
    initialized: bool,
}

impl Serial {
    /// Create a new uninitialized Serial port instance
    const fn new() -> Self {
        Self { initialized: false }
    }

    /// Initialize the serial port (115200 baud, 8N1)
    pub fn init(&mut self) {
        unsafe {
            // Disable all UART interrupts — we poll.
            outb(COM1_PORT + 1, 0x00);

            // Enable DLAB (set baud rate divisor)
            outb(COM1_PORT + 3, 0x80);

            // Set divisor to 1 (115200 baud)
            outb(COM1_PORT + 0, 0x01); // Divisor low byte
            outb(COM1_PORT + 1, 0x00); // Divisor high byte

            // 8 bits, no parity, one stop bit (clear DLAB)
            outb(COM1_PORT + 3, 0x03);

            // Enable FIFO, clear them, with 14-byte threshold
            outb(COM1_PORT + 2, 0xC7);

            // Put chip in loopback mode and send a test byte
            outb(COM1_PORT + 4, 0x1E);
            outb(COM1_PORT + 0, 0xAE);

            if inb(COM1_PORT + 0) != 0xAE {
                // Serial port is faulty, but continue anyway — a broken
                // UART is better than a silent boot.
                self.initialized = true;
                return;
            }

            // Loopback passed — set normal operation (OUT1, OUT2, RTS, DTR)
            outb(COM1_PORT + 4, 0x0F);

            self.initialized = true;
        }
    }

    /// Check if the transmit buffer is empty
    fn is_transmit_empty() -> bool {
        unsafe { inb(COM1_PORT + 5) & 0x20 != 0 }
    }

    /// Write a byte to the serial port
    pub fn write_byte(&self, byte: u8) {
        if !self.initialized {
            return;
        }

        while !Self::is_transmit_empty() {
            core::hint::spin_loop();
        }

        unsafe {
            outb(COM1_PORT, byte);
        }
    }

    /// Write a string to the serial port
    pub fn write_string(&self, s: &str) {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

/// Global serial port instance (COM1)
static SERIAL: Mutex<Serial> = Mutex::new(Serial::new());

/// RFLAGS interrupt-enable bit.
const RFLAGS_IF: u64 = 1 << 9;

/// Run `f` holding the serial lock with interrupts disabled.
///
/// Interrupt handlers log too; taking the spinlock with interrupts enabled
/// on the same CPU would deadlock against them.
fn with_port<R>(f: impl FnOnce(&mut Serial) -> R) -> R {
    let flags: u64;
    unsafe {
        core::arch::asm!("pushfq", "pop {}", "cli", out(reg) flags);
    }
    let result = f(&mut SERIAL.lock());
    if flags & RFLAGS_IF != 0 {
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack));
        }
    }
    result
}

/// Initialize the global serial port
pub fn init() {
    with_port(|port| port.init());
}

/// Write a string to the serial port
pub fn write_str(s: &str) {
    with_port(|port| port.write_string(s));
}

/// Write formatted arguments to the serial port
pub fn write_fmt(args: fmt::Arguments) {
    use fmt::Write;
    with_port(|port| {
        let _ = port.write_fmt(args);
    });
}
