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

use core::fmt;

use bit_field::BitField;
use bitflags::bitflags;
use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

use crate::Result;
use crate::frame::PhysFrame;
use crate::hal::{CpuOps, HostPhysAddr, MmHal};
use crate::msr::Msr;

/// VMCS/VMXON region in 4K size. (SDM Vol. 3C, Section 25.2)
pub struct VmxRegion<H: MmHal> {
    frame: PhysFrame<H>,
}

impl<H: MmHal> VmxRegion<H> {
    /// Allocates a zeroed region and stamps `revision_id` into its first word.
    pub fn new(revision_id: u32, shadow_indicator: bool) -> Result<Self> {
        let frame = PhysFrame::alloc_zero()?;
        let region = Self { frame };
        region.set_revision_id(revision_id, shadow_indicator);
        Ok(region)
    }

    /// Rewrites the revision identifier. The processor reads it on `vmxon`/`vmptrld`.
    pub fn set_revision_id(&self, revision_id: u32, shadow_indicator: bool) {
        let mut word = revision_id;
        word.set_bit(31, shadow_indicator);
        unsafe { (self.frame.as_mut_ptr() as *mut u32).write_volatile(word) };
    }

    pub fn revision_id(&self) -> u32 {
        let word = unsafe { (self.frame.as_mut_ptr() as *const u32).read_volatile() };
        word.get_bits(0..31)
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frame.start_paddr()
    }
}

impl<H: MmHal> fmt::Debug for VmxRegion<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmxRegion")
            .field("paddr", &self.phys_addr())
            .field("revision_id", &self.revision_id())
            .finish()
    }
}

/// MSR bitmap page. A set bit makes the matching `rdmsr`/`wrmsr` exit.
/// (SDM Vol. 3C, Section 25.6.9)
pub struct MsrBitmap<H: MmHal> {
    frame: PhysFrame<H>,
}

impl<H: MmHal> MsrBitmap<H> {
    /// A bitmap with every bit clear: no MSR access causes an exit.
    pub fn passthrough_all() -> Result<Self> {
        Ok(Self {
            frame: PhysFrame::alloc_zero()?,
        })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frame.start_paddr()
    }

    /// Byte offset (within the read half) and bit of `msr`. MSRs outside the two
    /// covered ranges always exit.
    fn locate(msr: u32) -> Option<(usize, usize)> {
        let (base, index) = match msr {
            0..=0x1fff => (0, msr as usize),
            0xc000_0000..=0xc000_1fff => (1024, (msr - 0xc000_0000) as usize),
            _ => return None,
        };
        Some((base + index / 8, index % 8))
    }

    fn set_bit(&mut self, offset: usize, msr: u32, intercept: bool) {
        if let Some((byte, bit)) = Self::locate(msr) {
            let bitmap =
                unsafe { core::slice::from_raw_parts_mut(self.frame.as_mut_ptr(), PAGE_SIZE) };
            bitmap[offset + byte].set_bit(bit, intercept);
        }
    }

    /// Makes `rdmsr` of `msr` exit, or stop exiting.
    pub fn set_read_intercept(&mut self, msr: u32, intercept: bool) {
        self.set_bit(0, msr, intercept);
    }

    /// Makes `wrmsr` of `msr` exit, or stop exiting.
    pub fn set_write_intercept(&mut self, msr: u32, intercept: bool) {
        self.set_bit(2048, msr, intercept);
    }

    /// Whether reads and writes of `msr` currently exit.
    pub fn intercepts(&self, msr: u32) -> (bool, bool) {
        let Some((byte, bit)) = Self::locate(msr) else {
            return (true, true);
        };
        let bitmap = unsafe { core::slice::from_raw_parts(self.frame.as_mut_ptr(), PAGE_SIZE) };
        (bitmap[byte].get_bit(bit), bitmap[2048 + byte].get_bit(bit))
    }
}

impl<H: MmHal> fmt::Debug for MsrBitmap<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MsrBitmap({:#x})", self.phys_addr())
    }
}

/// Reporting register of basic VMX capabilities. (SDM Vol. 3D, Appendix A.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxBasic {
    /// The 31-bit VMCS revision identifier used by the processor.
    pub revision_id: u32,
    /// The number of bytes that software should allocate for the VMXON region
    /// and any VMCS region.
    pub region_size: u16,
    /// Physical addresses used for the VMXON region, each VMCS, and data
    /// structures referenced by pointers in a VMCS are limited to 32 bits.
    pub is_32bit_address: bool,
    /// The memory type that should be used for the VMCS, for data structures
    /// referenced by pointers in the VMCS.
    pub mem_type: u8,
    /// The processor reports information in the VM-exit instruction-information
    /// field on VM exits due to execution of INS and OUTS.
    pub io_exit_info: bool,
    /// Any VMX controls that default to 1 may be cleared to 0, and the
    /// IA32_VMX_TRUE_* capability MSRs are present.
    pub vmx_flex_controls: bool,
}

impl VmxBasic {
    pub const VMX_MEMORY_TYPE_WRITE_BACK: u8 = 6;

    pub fn from_bits(msr: u64) -> Self {
        Self {
            revision_id: msr.get_bits(0..31) as u32,
            region_size: msr.get_bits(32..45) as u16,
            is_32bit_address: msr.get_bit(48),
            mem_type: msr.get_bits(50..54) as u8,
            io_exit_info: msr.get_bit(54),
            vmx_flex_controls: msr.get_bit(55),
        }
    }

    /// Read the current IA32_VMX_BASIC flags.
    pub fn read<C: CpuOps>() -> Self {
        Self::from_bits(Msr::IA32_VMX_BASIC.read::<C>())
    }
}

bitflags! {
    /// IA32_FEATURE_CONTROL flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureControlFlags: u64 {
       /// Lock bit: when set, locks this MSR from being written. when clear,
       /// VMXON causes a #GP.
       const LOCKED = 1 << 0;
       /// Enable VMX inside SMX operation.
       const VMXON_ENABLED_INSIDE_SMX = 1 << 1;
       /// Enable VMX outside SMX operation.
       const VMXON_ENABLED_OUTSIDE_SMX = 1 << 2;
   }
}

/// Control Features in Intel 64 Processor. (SDM Vol. 3C, Section 24.7)
pub struct FeatureControl;

impl FeatureControl {
    /// Read the current IA32_FEATURE_CONTROL flags.
    pub fn read<C: CpuOps>() -> FeatureControlFlags {
        FeatureControlFlags::from_bits_truncate(Msr::IA32_FEATURE_CONTROL.read::<C>())
    }

    /// Write IA32_FEATURE_CONTROL flags, preserving reserved values.
    pub fn write<C: CpuOps>(flags: FeatureControlFlags) {
        let old_value = Msr::IA32_FEATURE_CONTROL.read::<C>();
        let reserved = old_value & !(FeatureControlFlags::all().bits());
        let new_value = reserved | flags.bits();
        unsafe { Msr::IA32_FEATURE_CONTROL.write::<C>(new_value) };
    }
}
