//! Minimal ACPI table walking: RSDP → RSDT/XSDT → MADT.
//!
//! SMP bringup needs exactly one piece of firmware information (the set of
//! local APICs), so this module parses just enough of ACPI to find and
//! iterate the MADT. Physical table addresses are read through the
//! higher-half direct map. Firmware data is untrusted: every table is
//! signature- and checksum-validated before use.

use bitflags::bitflags;

use crate::error::KernelError;

/// Length of the ACPI 1.0 RSDP structure (the part the v1 checksum covers).
const RSDP_V1_LEN: usize = 20;

/// Offset of the OEM/table payload in an SDT (past the 36-byte header).
const SDT_HEADER_LEN: usize = 36;

/// Offset of the MADT entry list (SDT header + lapic address + flags).
const MADT_ENTRIES_OFFSET: usize = SDT_HEADER_LEN + 8;

bitflags! {
    /// Flags of a MADT Processor Local APIC entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LapicFlags: u32 {
        /// The processor is ready for use.
        const ENABLED = 1 << 0;
        /// The processor may be brought online later (hotplug).
        const ONLINE_CAPABLE = 1 << 1;
    }
}

/// One MADT Processor Local APIC entry (type 0).
#[derive(Debug, Clone, Copy)]
pub struct LocalApicEntry {
    /// ACPI processor UID.
    pub processor_uid: u8,
    /// The processor's local APIC ID.
    pub apic_id: u8,
    /// Entry flags.
    pub flags: LapicFlags,
}

/// A validated MADT.
#[derive(Debug, PartialEq)]
pub struct Madt {
    /// Physical address of the local APIC MMIO block, per firmware.
    pub lapic_address: u32,
    /// The raw interrupt-controller entry list.
    entries: &'static [u8],
}

impl Madt {
    /// Iterate the enabled-or-not Processor Local APIC entries.
    pub fn local_apics(&self) -> impl Iterator<Item = LocalApicEntry> + '_ {
        MadtEntryIter { data: self.entries }.filter_map(|(kind, body)| {
            if kind != 0 || body.len() < 6 {
                return None;
            }
            let flags = u32::from_le_bytes([body[2], body[3], body[4], body[5]]);
            Some(LocalApicEntry {
                processor_uid: body[0],
                apic_id: body[1],
                flags: LapicFlags::from_bits_truncate(flags),
            })
        })
    }
}

/// Iterator over raw MADT entries as `(type, body)` pairs, where `body`
/// excludes the 2-byte entry header.
struct MadtEntryIter {
    data: &'static [u8],
}

impl Iterator for MadtEntryIter {
    type Item = (u8, &'static [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 2 {
            return None;
        }
        let kind = self.data[0];
        let len = self.data[1] as usize;
        // A malformed length would loop forever or run off the table.
        if len < 2 || len > self.data.len() {
            return None;
        }
        let body = &self.data[2..len];
        self.data = &self.data[len..];
        Some((kind, body))
    }
}

/// Locate and validate the MADT starting from the RSDP.
///
/// `rsdp_phys` is the physical address of the RSDP; `hhdm` the direct-map
/// offset. Returns `NoMadt` if any link in the chain is missing or fails
/// validation.
pub fn find_madt(rsdp_phys: u64, hhdm: u64) -> Result<Madt, KernelError> {
    let rsdp = unsafe { phys_slice(hhdm, rsdp_phys, RSDP_V1_LEN) };
    if &rsdp[..8] != b"RSD PTR " || !checksum_ok(rsdp) {
        return Err(KernelError::NoMadt);
    }

    let revision = rsdp[15];
    if revision >= 2 {
        // ACPI 2.0+: the XSDP extends the structure with a length field, a
        // 64-bit XSDT pointer, and its own checksum over the full length.
        let ext = unsafe { phys_slice(hhdm, rsdp_phys, 36) };
        let length = u32::from_le_bytes(ext[20..24].try_into().unwrap()) as usize;
        if length >= 36 {
            let full = unsafe { phys_slice(hhdm, rsdp_phys, length) };
            if checksum_ok(full) {
                let xsdt = u64::from_le_bytes(full[24..32].try_into().unwrap());
                if let Some(madt) = find_in_sdt(hhdm, xsdt, 8) {
                    return Ok(madt);
                }
            }
        }
        // Fall through to the v1 RSDT on a malformed XSDP.
    }

    let rsdt = u32::from_le_bytes(rsdp[16..20].try_into().unwrap()) as u64;
    find_in_sdt(hhdm, rsdt, 4).ok_or(KernelError::NoMadt)
}

/// Scan an RSDT (4-byte pointers) or XSDT (8-byte pointers) for the MADT.
fn find_in_sdt(hhdm: u64, sdt_phys: u64, ptr_size: usize) -> Option<Madt> {
    if sdt_phys == 0 {
        return None;
    }
    let expected = if ptr_size == 8 { b"XSDT" } else { b"RSDT" };
    let table = load_table(hhdm, sdt_phys, expected)?;

    let pointers = &table[SDT_HEADER_LEN..];
    for chunk in pointers.chunks_exact(ptr_size) {
        let phys = if ptr_size == 8 {
            u64::from_le_bytes(chunk.try_into().unwrap())
        } else {
            u32::from_le_bytes(chunk.try_into().unwrap()) as u64
        };
        if let Some(madt) = load_table(hhdm, phys, b"APIC") {
            if madt.len() < MADT_ENTRIES_OFFSET {
                continue;
            }
            let lapic_address =
                u32::from_le_bytes(madt[SDT_HEADER_LEN..SDT_HEADER_LEN + 4].try_into().unwrap());
            return Some(Madt {
                lapic_address,
                entries: &madt[MADT_ENTRIES_OFFSET..],
            });
        }
    }
    None
}

/// Map a system description table, verifying signature and checksum.
fn load_table(hhdm: u64, phys: u64, signature: &[u8; 4]) -> Option<&'static [u8]> {
    if phys == 0 {
        return None;
    }
    let header = unsafe { phys_slice(hhdm, phys, SDT_HEADER_LEN) };
    if &header[..4] != signature {
        return None;
    }
    let length = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
    if length < SDT_HEADER_LEN {
        return None;
    }
    let table = unsafe { phys_slice(hhdm, phys, length) };
    if !checksum_ok(table) {
        return None;
    }
    Some(table)
}

/// The standard ACPI checksum: all bytes sum to zero (mod 256).
fn checksum_ok(bytes: &[u8]) -> bool {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) == 0
}

/// View physical memory through the direct map.
///
/// # Safety
/// `phys..phys+len` must be covered by the direct map and must not overlap
/// kernel-owned mutable state.
unsafe fn phys_slice(hhdm: u64, phys: u64, len: usize) -> &'static [u8] {
    core::slice::from_raw_parts((hhdm + phys) as *const u8, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fix up the checksum byte at `at` so the whole slice sums to zero.
    fn seal(bytes: &mut [u8], at: usize) {
        bytes[at] = 0;
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        bytes[at] = 0u8.wrapping_sub(sum);
    }

    /// Build a MADT with the given LAPIC entries; returns the table bytes.
    fn build_madt(lapics: &[(u8, u8, u32)]) -> Vec<u8> {
        let mut t = vec![0u8; MADT_ENTRIES_OFFSET];
        t[..4].copy_from_slice(b"APIC");
        t[8] = 1; // revision
        // lapic address + flags already zero
        for &(uid, apic_id, flags) in lapics {
            t.extend_from_slice(&[0, 8, uid, apic_id]);
            t.extend_from_slice(&flags.to_le_bytes());
        }
        let len = t.len() as u32;
        t[4..8].copy_from_slice(&len.to_le_bytes());
        seal(&mut t, 9);
        t
    }

    /// Build an RSDP (v1) + RSDT pointing at `madt`.  Returns the boxes so
    /// the backing memory outlives the parse, plus the RSDP address.
    fn build_chain(madt: &'static [u8]) -> (&'static [u8], u64) {
        let mut rsdt = vec![0u8; SDT_HEADER_LEN + 4];
        rsdt[..4].copy_from_slice(b"RSDT");
        let len = rsdt.len() as u32;
        rsdt[4..8].copy_from_slice(&len.to_le_bytes());
        let madt_addr = madt.as_ptr() as u32;
        rsdt[SDT_HEADER_LEN..].copy_from_slice(&madt_addr.to_le_bytes());
        seal(&mut rsdt, 9);
        let rsdt: &'static [u8] = Box::leak(rsdt.into_boxed_slice());

        let mut rsdp = vec![0u8; RSDP_V1_LEN];
        rsdp[..8].copy_from_slice(b"RSD PTR ");
        rsdp[15] = 0; // revision 0 → RSDT path
        let rsdt_addr = rsdt.as_ptr() as u32;
        rsdp[16..20].copy_from_slice(&rsdt_addr.to_le_bytes());
        seal(&mut rsdp, 8);
        let rsdp: &'static [u8] = Box::leak(rsdp.into_boxed_slice());

        (rsdp, rsdp.as_ptr() as u64)
    }

    // The test "direct map" is the identity map: hhdm == 0 and physical
    // addresses are host pointers into leaked buffers.

    #[test]
    fn walks_rsdp_to_madt_and_lists_enabled_lapics() {
        let madt: &'static [u8] =
            Box::leak(build_madt(&[(0, 0, 1), (1, 1, 1), (2, 2, 0)]).into_boxed_slice());
        let (_rsdp, rsdp_addr) = build_chain(madt);

        let madt = find_madt(rsdp_addr, 0).expect("chain should parse");
        let cpus: Vec<_> = madt.local_apics().collect();
        assert_eq!(cpus.len(), 3);
        assert!(cpus[0].flags.contains(LapicFlags::ENABLED));
        assert!(cpus[1].flags.contains(LapicFlags::ENABLED));
        assert!(!cpus[2].flags.contains(LapicFlags::ENABLED));
        assert_eq!(cpus[1].apic_id, 1);
    }

    #[test]
    fn rejects_bad_rsdp_checksum() {
        let madt: &'static [u8] = Box::leak(build_madt(&[(0, 0, 1)]).into_boxed_slice());
        let (rsdp, rsdp_addr) = build_chain(madt);
        // Corrupt one byte after sealing.
        unsafe {
            let p = rsdp.as_ptr() as *mut u8;
            *p.add(10) ^= 0xFF;
        }
        assert_eq!(find_madt(rsdp_addr, 0), Err(KernelError::NoMadt));
    }

    #[test]
    fn malformed_entry_length_terminates_iteration() {
        let mut bytes = build_madt(&[(0, 5, 1)]);
        // Append an entry claiming a length that runs off the table; the
        // iterator must stop rather than scan wild memory.
        bytes.extend_from_slice(&[0, 200, 9, 9, 1, 0, 0, 0]);
        let total = bytes.len() as u32;
        bytes[4..8].copy_from_slice(&total.to_le_bytes());
        seal(&mut bytes, 9);
        let madt_bytes: &'static [u8] = Box::leak(bytes.into_boxed_slice());
        let (_rsdp, rsdp_addr) = build_chain(madt_bytes);

        let madt = find_madt(rsdp_addr, 0).unwrap();
        let cpus: Vec<_> = madt.local_apics().collect();
        assert_eq!(cpus.len(), 1);
        assert_eq!(cpus[0].apic_id, 5);
    }

    #[test]
    fn checksum_helper() {
        assert!(checksum_ok(&[]));
        assert!(checksum_ok(&[0x80, 0x80]));
        assert!(!checksum_ok(&[1]));
    }
}
