// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Decoding host segment descriptors into VMCS guest-state form.

use bit_field::BitField;
use bitflags::bitflags;

use crate::hal::CpuOps;

/// Segment registers whose state the VMCS mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRegister {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Ldtr,
    Tr,
}

impl SegmentRegister {
    /// Guest-state order: the six data/code registers, then LDTR and TR.
    pub const ALL: [SegmentRegister; 8] = [
        Self::Es,
        Self::Cs,
        Self::Ss,
        Self::Ds,
        Self::Fs,
        Self::Gs,
        Self::Ldtr,
        Self::Tr,
    ];
}

bitflags! {
    /// Segment access rights in VMCS format. (SDM Vol. 3C, Section 25.4.1, Table 25-2)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentAccessRights: u32 {
        /// Type field, bits 3:0.
        const TYPE_MASK = 0xf;
        /// S: code/data rather than system descriptor.
        const CODE_DATA = 1 << 4;
        const DPL_MASK = 0b11 << 5;
        const PRESENT = 1 << 7;
        const AVAILABLE = 1 << 12;
        const LONG_MODE = 1 << 13;
        const DB = 1 << 14;
        const GRANULARITY = 1 << 15;
        const UNUSABLE = 1 << 16;
    }
}

/// A segment register's full hidden state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access_rights: SegmentAccessRights,
}

impl Segment {
    /// The state of a register holding a null selector.
    pub const fn unusable(selector: u16) -> Self {
        Self {
            selector,
            base: 0,
            limit: 0,
            access_rights: SegmentAccessRights::UNUSABLE,
        }
    }

    /// Decodes the descriptor `selector` refers to in `gdt`.
    ///
    /// System descriptors (S = 0) are 16 bytes wide in long mode; the upper half of
    /// the base comes from the following entry. Null, LDT-relative, out-of-range
    /// and not-present selectors decode as unusable.
    pub fn from_gdt(gdt: &[u64], selector: u16) -> Self {
        let index = (selector >> 3) as usize;
        let ldt_relative = selector.get_bit(2);
        if index == 0 || ldt_relative || index >= gdt.len() {
            return Self::unusable(selector);
        }

        let desc = gdt[index];
        let raw_limit = desc.get_bits(0..16) | desc.get_bits(48..52) << 16;
        let mut base = desc.get_bits(16..40) | desc.get_bits(56..64) << 24;
        let access_rights = SegmentAccessRights::from_bits_truncate(
            (desc.get_bits(40..48) | desc.get_bits(52..56) << 12) as u32,
        );
        if !access_rights.contains(SegmentAccessRights::PRESENT) {
            return Self::unusable(selector);
        }
        if !access_rights.contains(SegmentAccessRights::CODE_DATA) {
            if let Some(high) = gdt.get(index + 1) {
                base |= high.get_bits(0..32) << 32;
            }
        }
        let limit = if access_rights.contains(SegmentAccessRights::GRANULARITY) {
            (raw_limit << 12) | 0xfff
        } else {
            raw_limit
        } as u32;

        Self {
            selector,
            base,
            limit,
            access_rights,
        }
    }

    /// Re-encodes the low 8 bytes of the descriptor this segment was decoded from.
    pub fn to_descriptor(&self) -> u64 {
        let raw_limit = if self.access_rights.contains(SegmentAccessRights::GRANULARITY) {
            self.limit >> 12
        } else {
            self.limit
        } as u64;
        let ar = self.access_rights.bits() as u64;
        let mut desc = 0u64;
        desc.set_bits(0..16, raw_limit.get_bits(0..16));
        desc.set_bits(16..40, self.base.get_bits(0..24));
        desc.set_bits(40..48, ar.get_bits(0..8));
        desc.set_bits(48..52, raw_limit.get_bits(16..20));
        desc.set_bits(52..56, ar.get_bits(12..16));
        desc.set_bits(56..64, self.base.get_bits(24..32));
        desc
    }
}

/// Reads `reg` and decodes its descriptor from the current GDT.
pub fn read_segment<C: CpuOps>(reg: SegmentRegister) -> Segment {
    let selector = C::read_selector(reg);
    let gdt = C::read_gdt();
    // The GDTR image is the processor's own and stays mapped while the host runs.
    let entries = unsafe { gdt.entries() };
    Segment::from_gdt(entries, selector)
}

/// Host-state selector form: RPL and TI cleared. (SDM Vol. 3C, Section 27.2.3)
pub const fn host_selector(selector: u16) -> u16 {
    selector & !0x7
}

#[cfg(test)]
mod tests {
    use super::*;

    const KERNEL_CODE64: u64 = 0x00af_9b00_0000_ffff;
    const KERNEL_DATA: u64 = 0x00cf_9300_0000_ffff;
    // Busy 64-bit TSS at 0xffff_8000_1234_5678, limit 0x67.
    const TSS_LOW: u64 = 0x1200_8b34_5678_0067;
    const TSS_HIGH: u64 = 0xffff_8000;

    fn gdt() -> [u64; 5] {
        [0, KERNEL_CODE64, KERNEL_DATA, TSS_LOW, TSS_HIGH]
    }

    #[test]
    fn test_null_selector_is_unusable() {
        let seg = Segment::from_gdt(&gdt(), 0);
        assert_eq!(seg.access_rights, SegmentAccessRights::UNUSABLE);
        assert_eq!(seg.access_rights.bits(), 0x10000);
        assert_eq!(seg.base, 0);
        assert_eq!(seg.limit, 0);
    }

    #[test]
    fn test_code_segment() {
        let seg = Segment::from_gdt(&gdt(), 0x08);
        assert_eq!(seg.base, 0);
        assert_eq!(seg.limit, 0xffff_ffff);
        assert_eq!(seg.access_rights.bits(), 0xa09b);
        assert!(seg.access_rights.contains(SegmentAccessRights::LONG_MODE));
    }

    #[test]
    fn test_rpl_is_ignored_for_lookup() {
        let seg = Segment::from_gdt(&gdt(), 0x13);
        assert_eq!(seg.selector, 0x13);
        assert_eq!(seg.access_rights.bits(), 0xc093);
        assert_eq!(host_selector(seg.selector), 0x10);
    }

    #[test]
    fn test_system_descriptor_takes_high_base() {
        let seg = Segment::from_gdt(&gdt(), 0x18);
        assert_eq!(seg.base, 0xffff_8000_1234_5678);
        assert_eq!(seg.limit, 0x67);
        assert_eq!(seg.access_rights.bits(), 0x8b);
    }

    #[test]
    fn test_out_of_range_and_ldt_selectors() {
        assert_eq!(Segment::from_gdt(&gdt(), 0x28), Segment::unusable(0x28));
        assert_eq!(Segment::from_gdt(&gdt(), 0x0c), Segment::unusable(0x0c));
    }

    #[test]
    fn test_not_present_descriptor() {
        let table = [0, KERNEL_DATA & !(1 << 47)];
        assert_eq!(
            Segment::from_gdt(&table, 0x08).access_rights,
            SegmentAccessRights::UNUSABLE
        );
    }

    #[test]
    fn test_descriptor_round_trip() {
        for desc in [KERNEL_CODE64, KERNEL_DATA, TSS_LOW, 0x0040_9a0f_0000_1234] {
            let table = [0, desc, 0];
            let seg = Segment::from_gdt(&table, 0x08);
            assert_eq!(seg.to_descriptor(), desc, "descriptor {desc:#x}");
        }
    }
}
