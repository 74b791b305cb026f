//! Global Descriptor Table (GDT) for x86_64.
//!
//! In long mode, segmentation is mostly disabled, but a GDT is still
//! required for:
//! - Defining code/data segments for ring 0 and ring 3
//! - Pointing to the TSS (Task State Segment)
//!
//! The slot layout is a cross-module contract: the user-mode entry
//! trampoline and the interrupt return path both hard-wire these selectors.

use core::arch::asm;
use core::mem::size_of;

use super::tss::Tss;

/// Number of GDT entries:
/// Null, Kernel Code, Kernel Data, User Data, User Code, TSS (2 slots).
const GDT_ENTRIES: usize = 7;

/// Kernel code segment selector (slot 1).
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
/// Kernel data segment selector (slot 2).
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
/// User data segment selector (slot 3), without RPL bits.
pub const USER_DATA_SELECTOR: u16 = 0x18;
/// User code segment selector (slot 4), without RPL bits.
pub const USER_CODE_SELECTOR: u16 = 0x20;
/// TSS descriptor selector (slots 5-6).
pub const TSS_SELECTOR: u16 = 0x28;

/// Requested Privilege Level for ring 3 selectors.
pub const RPL_USER: u16 = 3;

/// A segment descriptor in the GDT.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct SegmentDescriptor(u64);

impl SegmentDescriptor {
    /// A null descriptor (required as the first GDT entry).
    pub const NULL: Self = Self(0);

    /// 64-bit kernel code segment descriptor.
    ///
    /// Access byte: P=1, DPL=00, S=1, E=1, RW=1 = 0x9A.
    /// Flags: L=1 (long mode).
    pub const fn kernel_code() -> Self {
        Self(0x00_2F_9A_00_0000_FFFF)
    }

    /// Kernel data segment descriptor.
    ///
    /// Access byte: P=1, DPL=00, S=1, E=0, RW=1 = 0x92.
    pub const fn kernel_data() -> Self {
        Self(0x00_0F_92_00_0000_FFFF)
    }

    /// User data segment descriptor.
    ///
    /// Access byte: P=1, DPL=11, S=1, E=0, RW=1 = 0xF2.
    pub const fn user_data() -> Self {
        Self(0x00_0F_F2_00_0000_FFFF)
    }

    /// 64-bit user code segment descriptor.
    ///
    /// Access byte: P=1, DPL=11, S=1, E=1, RW=1 = 0xFA.
    /// Flags: L=1 (long mode).
    pub const fn user_code() -> Self {
        Self(0x00_2F_FA_00_0000_FFFF)
    }

    /// Raw descriptor bits.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// A TSS descriptor in the GDT (128 bits / 2 entries).
///
/// In 64-bit mode, the TSS descriptor is 16 bytes wide and occupies
/// two consecutive GDT slots.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TssDescriptor {
    low: u64,
    high: u64,
}

impl TssDescriptor {
    /// Create a TSS descriptor for the TSS at `tss_addr`.
    pub fn at(tss_addr: u64) -> Self {
        let tss_len = (size_of::<Tss>() - 1) as u64;

        let mut low: u64 = 0;

        // Limit bits 0-15
        low |= tss_len & 0xFFFF;
        // Base bits 0-15 (bits 16-31)
        low |= (tss_addr & 0xFFFF) << 16;
        // Base bits 16-23 (bits 32-39)
        low |= ((tss_addr >> 16) & 0xFF) << 32;
        // Access byte (bits 40-47): Present=1, DPL=0, Type=0x9 (64-bit TSS available)
        low |= 0x89u64 << 40;
        // Limit bits 16-19 (bits 48-51)
        low |= ((tss_len >> 16) & 0xF) << 48;
        // Base bits 24-31 (bits 56-63)
        low |= ((tss_addr >> 24) & 0xFF) << 56;

        // High: Base bits 32-63
        let high = tss_addr >> 32;

        Self { low, high }
    }
}

/// Segment selectors for GDT entries.
/// Each selector is the byte offset into the GDT.
#[derive(Debug, Clone, Copy)]
pub struct Selectors {
    pub kernel_code: u16,
    pub kernel_data: u16,
    pub user_data: u16,
    pub user_code: u16,
    pub tss: u16,
}

impl Selectors {
    /// All-zero selectors, for const initialization before `Gdt::init`.
    pub const fn zeroed() -> Self {
        Self {
            kernel_code: 0,
            kernel_data: 0,
            user_data: 0,
            user_code: 0,
            tss: 0,
        }
    }

    /// The fixed slot layout.
    pub const fn standard() -> Self {
        Self {
            kernel_code: KERNEL_CODE_SELECTOR,
            kernel_data: KERNEL_DATA_SELECTOR,
            user_data: USER_DATA_SELECTOR,
            user_code: USER_CODE_SELECTOR,
            tss: TSS_SELECTOR,
        }
    }
}

/// The Global Descriptor Table.
///
/// Layout:
/// - Entry 0:   Null descriptor (required)
/// - Entry 1:   Kernel code segment (64-bit)
/// - Entry 2:   Kernel data segment
/// - Entry 3:   User data segment
/// - Entry 4:   User code segment (64-bit)
/// - Entry 5-6: TSS descriptor (16 bytes, spans two entries)
#[repr(C, align(16))]
pub struct Gdt {
    entries: [u64; GDT_ENTRIES],
}

impl Gdt {
    /// An all-zero GDT, for const initialization.  Must be filled in via
    /// `init` before loading.
    pub const fn zeroed() -> Self {
        Self {
            entries: [0; GDT_ENTRIES],
        }
    }

    /// Populate the code/data descriptors in the fixed layout.
    pub fn init(&mut self) -> Selectors {
        self.entries[0] = SegmentDescriptor::NULL.raw();
        self.entries[1] = SegmentDescriptor::kernel_code().raw();
        self.entries[2] = SegmentDescriptor::kernel_data().raw();
        self.entries[3] = SegmentDescriptor::user_data().raw();
        self.entries[4] = SegmentDescriptor::user_code().raw();
        Selectors::standard()
    }

    /// Install the TSS descriptor (slots 5-6) for the given TSS.
    pub fn set_tss(&mut self, tss: &Tss) {
        let desc = TssDescriptor::at(tss as *const _ as u64);
        self.entries[5] = desc.low;
        self.entries[6] = desc.high;
    }

    /// Load this GDT and switch to its segments.
    ///
    /// # Safety
    ///
    /// The GDT must remain valid (and at a stable address) for as long as it
    /// is loaded.  The selectors must point to valid descriptors within it.
    pub unsafe fn load(&self, selectors: &Selectors) {
        let ptr = GdtPointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: self as *const _ as u64,
        };

        // Load the GDT
        asm!(
            "lgdt [{}]",
            in(reg) &ptr,
            options(readonly, nostack, preserves_flags)
        );

        // Reload CS by doing a far return:
        // push the new code segment selector and the return address.
        asm!(
            "push {sel}",
            "lea {tmp}, [rip + 2f]",
            "push {tmp}",
            "retfq",
            "2:",
            sel = in(reg) selectors.kernel_code as u64,
            tmp = lateout(reg) _,
            options(preserves_flags)
        );

        // Reload data segment registers
        asm!(
            "mov ds, {sel:x}",
            "mov es, {sel:x}",
            "mov ss, {sel:x}",
            sel = in(reg) selectors.kernel_data as u16,
            options(nostack, preserves_flags)
        );
    }

    /// Load the Task Register with the TSS selector.
    ///
    /// # Safety
    ///
    /// The GDT containing the referenced TSS descriptor must be loaded, and
    /// the descriptor must not be marked busy (each CPU needs its own GDT
    /// and TSS for exactly this reason).
    pub unsafe fn load_tss(selectors: &Selectors) {
        asm!(
            "ltr {sel:x}",
            sel = in(reg) selectors.tss,
            options(nostack, preserves_flags)
        );
    }
}

/// Pointer structure for the `lgdt` instruction.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_layout_matches_user_entry_contract() {
        let sel = Selectors::standard();
        assert_eq!(sel.kernel_code, 0x08);
        assert_eq!(sel.kernel_data, 0x10);
        assert_eq!(sel.user_data, 0x18);
        assert_eq!(sel.user_code, 0x20);
        assert_eq!(sel.tss, 0x28);
        // The ring 3 selectors seen by iretq.
        assert_eq!(sel.user_code | RPL_USER, 0x23);
        assert_eq!(sel.user_data | RPL_USER, 0x1b);
    }

    #[test]
    fn descriptor_access_bytes() {
        // Bits 40-47 hold the access byte.
        let access = |d: SegmentDescriptor| ((d.raw() >> 40) & 0xFF) as u8;
        assert_eq!(access(SegmentDescriptor::kernel_code()), 0x9A);
        assert_eq!(access(SegmentDescriptor::kernel_data()), 0x92);
        assert_eq!(access(SegmentDescriptor::user_data()), 0xF2);
        assert_eq!(access(SegmentDescriptor::user_code()), 0xFA);
        // Code segments carry the long-mode bit (bit 53).
        assert_ne!(SegmentDescriptor::kernel_code().raw() & (1 << 53), 0);
        assert_ne!(SegmentDescriptor::user_code().raw() & (1 << 53), 0);
        assert_eq!(SegmentDescriptor::kernel_data().raw() & (1 << 53), 0);
    }

    #[test]
    fn tss_descriptor_encodes_base_and_limit() {
        let tss = Tss::new();
        let addr = &tss as *const _ as u64;
        let desc = TssDescriptor::at(addr);

        let base = (desc.low >> 16) & 0xFFFF
            | ((desc.low >> 32) & 0xFF) << 16
            | ((desc.low >> 56) & 0xFF) << 24
            | desc.high << 32;
        assert_eq!(base, addr);

        let limit = desc.low & 0xFFFF | ((desc.low >> 48) & 0xF) << 16;
        assert_eq!(limit, (size_of::<Tss>() - 1) as u64);

        // Access byte: present, 64-bit available TSS.
        assert_eq!((desc.low >> 40) & 0xFF, 0x89);
    }
}
