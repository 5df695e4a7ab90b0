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

//! VMCS field access and the state layout a guest session starts from.

#![allow(non_camel_case_types)]

use x86::vmx::VmFail;
use x86_64::registers::rflags::RFlags;
use x86::vmx::vmcs::control::{
    EntryControls, ExitControls, PinbasedControls, PrimaryControls, SecondaryControls,
};

use super::definitions::VmxInstructionError;
use super::structs::{VmxBasic, VmxRegion};
use crate::ept::EptPointer;
use crate::hal::{CpuOps, HostPhysAddr, MmHal};
use crate::msr::Msr;
use crate::segmentation::{SegmentRegister, host_selector, read_segment};
use crate::{Result, VmxError};

/// DR7 value after reset: only the reserved bit 10 set.
const DR7_INIT: usize = 0x400;

macro_rules! vmcs_read {
    ($field_enum: ident, u64) => {
        impl $field_enum {
            pub fn read<C: CpuOps>(self) -> Result<u64> {
                read_field::<C>(self as u32)
            }
        }
    };
    ($field_enum: ident, $ux: ty) => {
        impl $field_enum {
            pub fn read<C: CpuOps>(self) -> Result<$ux> {
                read_field::<C>(self as u32).map(|v| v as $ux)
            }
        }
    };
}

macro_rules! vmcs_write {
    ($field_enum: ident, $ux: ty) => {
        impl $field_enum {
            pub fn write<C: CpuOps>(self, value: $ux) -> Result {
                write_field::<C>(self as u32, value as u64)
            }
        }
    };
}

/// 16-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.1.2)
#[derive(Clone, Copy, Debug)]
pub enum VmcsGuest16 {
    ES_SELECTOR = 0x800,
    CS_SELECTOR = 0x802,
    SS_SELECTOR = 0x804,
    DS_SELECTOR = 0x806,
    FS_SELECTOR = 0x808,
    GS_SELECTOR = 0x80a,
    LDTR_SELECTOR = 0x80c,
    TR_SELECTOR = 0x80e,
}
vmcs_read!(VmcsGuest16, u16);
vmcs_write!(VmcsGuest16, u16);

/// 16-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.1.3)
#[derive(Clone, Copy, Debug)]
pub enum VmcsHost16 {
    ES_SELECTOR = 0xc00,
    CS_SELECTOR = 0xc02,
    SS_SELECTOR = 0xc04,
    DS_SELECTOR = 0xc06,
    FS_SELECTOR = 0xc08,
    GS_SELECTOR = 0xc0a,
    TR_SELECTOR = 0xc0c,
}
vmcs_read!(VmcsHost16, u16);
vmcs_write!(VmcsHost16, u16);

/// 64-Bit Control Fields. (SDM Vol. 3D, Appendix B.2.1)
#[derive(Clone, Copy, Debug)]
pub enum VmcsControl64 {
    IO_BITMAP_A_ADDR = 0x2000,
    IO_BITMAP_B_ADDR = 0x2002,
    MSR_BITMAPS_ADDR = 0x2004,
    VMEXIT_MSR_STORE_ADDR = 0x2006,
    VMEXIT_MSR_LOAD_ADDR = 0x2008,
    VMENTRY_MSR_LOAD_ADDR = 0x200a,
    TSC_OFFSET = 0x2010,
    EPTP = 0x201a,
}
vmcs_read!(VmcsControl64, u64);
vmcs_write!(VmcsControl64, u64);

/// 64-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.2.3)
#[derive(Clone, Copy, Debug)]
pub enum VmcsGuest64 {
    LINK_PTR = 0x2800,
    IA32_DEBUGCTL = 0x2802,
    IA32_PAT = 0x2804,
    IA32_EFER = 0x2806,
}
vmcs_read!(VmcsGuest64, u64);
vmcs_write!(VmcsGuest64, u64);

/// 64-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.2.4)
#[derive(Clone, Copy, Debug)]
pub enum VmcsHost64 {
    IA32_PAT = 0x2c00,
    IA32_EFER = 0x2c02,
}
vmcs_read!(VmcsHost64, u64);
vmcs_write!(VmcsHost64, u64);

/// 32-Bit Control Fields. (SDM Vol. 3D, Appendix B.3.1)
#[derive(Clone, Copy, Debug)]
pub enum VmcsControl32 {
    PINBASED_EXEC_CONTROLS = 0x4000,
    PRIMARY_PROCBASED_EXEC_CONTROLS = 0x4002,
    EXCEPTION_BITMAP = 0x4004,
    PAGE_FAULT_ERR_CODE_MASK = 0x4006,
    PAGE_FAULT_ERR_CODE_MATCH = 0x4008,
    CR3_TARGET_COUNT = 0x400a,
    VMEXIT_CONTROLS = 0x400c,
    VMEXIT_MSR_STORE_COUNT = 0x400e,
    VMEXIT_MSR_LOAD_COUNT = 0x4010,
    VMENTRY_CONTROLS = 0x4012,
    VMENTRY_MSR_LOAD_COUNT = 0x4014,
    VMENTRY_INTERRUPTION_INFO_FIELD = 0x4016,
    SECONDARY_PROCBASED_EXEC_CONTROLS = 0x401e,
}
vmcs_read!(VmcsControl32, u32);
vmcs_write!(VmcsControl32, u32);

/// 32-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.3.2)
#[derive(Clone, Copy, Debug)]
pub enum VmcsReadOnly32 {
    VM_INSTRUCTION_ERROR = 0x4400,
    EXIT_REASON = 0x4402,
    VMEXIT_INTERRUPTION_INFO = 0x4404,
    VMEXIT_INTERRUPTION_ERR_CODE = 0x4406,
    IDT_VECTORING_INFO = 0x4408,
    IDT_VECTORING_ERR_CODE = 0x440a,
    VMEXIT_INSTRUCTION_LEN = 0x440c,
    VMEXIT_INSTRUCTION_INFO = 0x440e,
}
vmcs_read!(VmcsReadOnly32, u32);

/// 32-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.3.3)
#[derive(Clone, Copy, Debug)]
pub enum VmcsGuest32 {
    ES_LIMIT = 0x4800,
    CS_LIMIT = 0x4802,
    SS_LIMIT = 0x4804,
    DS_LIMIT = 0x4806,
    FS_LIMIT = 0x4808,
    GS_LIMIT = 0x480a,
    LDTR_LIMIT = 0x480c,
    TR_LIMIT = 0x480e,
    GDTR_LIMIT = 0x4810,
    IDTR_LIMIT = 0x4812,
    ES_ACCESS_RIGHTS = 0x4814,
    CS_ACCESS_RIGHTS = 0x4816,
    SS_ACCESS_RIGHTS = 0x4818,
    DS_ACCESS_RIGHTS = 0x481a,
    FS_ACCESS_RIGHTS = 0x481c,
    GS_ACCESS_RIGHTS = 0x481e,
    LDTR_ACCESS_RIGHTS = 0x4820,
    TR_ACCESS_RIGHTS = 0x4822,
    INTERRUPTIBILITY_STATE = 0x4824,
    ACTIVITY_STATE = 0x4826,
    SMBASE = 0x4828,
    IA32_SYSENTER_CS = 0x482a,
    VMX_PREEMPTION_TIMER_VALUE = 0x482e,
}
vmcs_read!(VmcsGuest32, u32);
vmcs_write!(VmcsGuest32, u32);

/// 32-Bit Host-State Field. (SDM Vol. 3D, Appendix B.3.4)
#[derive(Clone, Copy, Debug)]
pub enum VmcsHost32 {
    IA32_SYSENTER_CS = 0x4c00,
}
vmcs_read!(VmcsHost32, u32);
vmcs_write!(VmcsHost32, u32);

/// Natural-Width Control Fields. (SDM Vol. 3D, Appendix B.4.1)
#[derive(Clone, Copy, Debug)]
pub enum VmcsControlNW {
    CR0_GUEST_HOST_MASK = 0x6000,
    CR4_GUEST_HOST_MASK = 0x6002,
    CR0_READ_SHADOW = 0x6004,
    CR4_READ_SHADOW = 0x6006,
}
vmcs_read!(VmcsControlNW, usize);
vmcs_write!(VmcsControlNW, usize);

/// Natural-Width Read-Only Data Fields. (SDM Vol. 3D, Appendix B.4.2)
#[derive(Clone, Copy, Debug)]
pub enum VmcsReadOnlyNW {
    EXIT_QUALIFICATION = 0x6400,
    GUEST_LINEAR_ADDR = 0x640a,
}
vmcs_read!(VmcsReadOnlyNW, usize);

/// Natural-Width Guest-State Fields. (SDM Vol. 3D, Appendix B.4.3)
#[derive(Clone, Copy, Debug)]
pub enum VmcsGuestNW {
    CR0 = 0x6800,
    CR3 = 0x6802,
    CR4 = 0x6804,
    ES_BASE = 0x6806,
    CS_BASE = 0x6808,
    SS_BASE = 0x680a,
    DS_BASE = 0x680c,
    FS_BASE = 0x680e,
    GS_BASE = 0x6810,
    LDTR_BASE = 0x6812,
    TR_BASE = 0x6814,
    GDTR_BASE = 0x6816,
    IDTR_BASE = 0x6818,
    DR7 = 0x681a,
    RSP = 0x681c,
    RIP = 0x681e,
    RFLAGS = 0x6820,
    PENDING_DBG_EXCEPTIONS = 0x6822,
    IA32_SYSENTER_ESP = 0x6824,
    IA32_SYSENTER_EIP = 0x6826,
}
vmcs_read!(VmcsGuestNW, usize);
vmcs_write!(VmcsGuestNW, usize);

/// Natural-Width Host-State Fields. (SDM Vol. 3D, Appendix B.4.4)
#[derive(Clone, Copy, Debug)]
pub enum VmcsHostNW {
    CR0 = 0x6c00,
    CR3 = 0x6c02,
    CR4 = 0x6c04,
    FS_BASE = 0x6c06,
    GS_BASE = 0x6c08,
    TR_BASE = 0x6c0a,
    GDTR_BASE = 0x6c0c,
    IDTR_BASE = 0x6c0e,
    IA32_SYSENTER_ESP = 0x6c10,
    IA32_SYSENTER_EIP = 0x6c12,
    RSP = 0x6c14,
    RIP = 0x6c16,
}
vmcs_read!(VmcsHostNW, usize);
vmcs_write!(VmcsHostNW, usize);

/// Reads the VM-instruction error field of the current VMCS.
pub fn instruction_error<C: CpuOps>() -> VmxInstructionError {
    let raw = unsafe { C::vmread(VmcsReadOnly32::VM_INSTRUCTION_ERROR as u32) };
    VmxInstructionError(raw.unwrap_or(0) as u32)
}

/// Classifies a failed VMX instruction, fetching the error number when one was recorded.
pub fn vm_fail_to_error<C: CpuOps>(fail: VmFail) -> VmxError {
    match fail {
        VmFail::VmFailValid => VmxError::VmFailValid(instruction_error::<C>()),
        VmFail::VmFailInvalid => VmxError::VmFailInvalid,
    }
}

pub fn read_field<C: CpuOps>(field: u32) -> Result<u64> {
    unsafe { C::vmread(field) }.map_err(vm_fail_to_error::<C>)
}

pub fn write_field<C: CpuOps>(field: u32, value: u64) -> Result {
    #[cfg(feature = "tracing")]
    trace!("[tvisor] vmwrite {:#06x} <- {:#x}", field, value);
    unsafe { C::vmwrite(field, value) }.map_err(vm_fail_to_error::<C>)
}

/// `vmclear`: flushes `region` to memory and marks it clear and inactive.
pub fn clear<C: CpuOps, H: MmHal>(region: &VmxRegion<H>) -> Result {
    unsafe { C::vmclear(region.phys_addr().as_usize() as u64) }.map_err(vm_fail_to_error::<C>)
}

/// `vmptrld`: makes `region` the current VMCS of this core.
pub fn load<C: CpuOps, H: MmHal>(region: &VmxRegion<H>) -> Result {
    unsafe { C::vmptrld(region.phys_addr().as_usize() as u64) }.map_err(vm_fail_to_error::<C>)
}

/// Forces `desired` into what a VMX capability MSR allows.
///
/// Bits 31:0 of `capability` must be 1 (allowed-0 settings); bits 63:32 may be 1
/// (allowed-1 settings). (SDM Vol. 3D, Appendix A.3)
pub const fn adjust_controls(desired: u32, capability: u64) -> u32 {
    let allowed0 = capability as u32;
    let allowed1 = (capability >> 32) as u32;
    (desired & allowed1) | allowed0
}

/// Writes a 32-bit control field adjusted against `cap_msr`. Bits of `desired` the
/// processor cannot set are dropped with a warning; dropping any bit of `required`
/// is an error.
fn set_control<C: CpuOps>(
    control: VmcsControl32,
    cap_msr: Msr,
    desired: u32,
    required: u32,
) -> Result<u32> {
    let value = adjust_controls(desired, cap_msr.read::<C>());
    let dropped = desired & !value;
    if dropped & required != 0 {
        return Err(VmxError::UnsupportedFeature(alloc::format!(
            "{control:?}: required bits {:#x} not allowed by {cap_msr:?}",
            dropped & required
        )));
    }
    if dropped != 0 {
        warn!(
            "[tvisor] {:?}: bits {:#x} not supported, leaving them clear",
            control, dropped
        );
    }
    debug!("[tvisor] {:?} = {:#x}", control, value);
    control.write::<C>(value)?;
    Ok(value)
}

/// Addresses the VMCS needs beyond what is read from the host.
#[derive(Debug, Clone, Copy)]
pub struct VmcsSetup {
    pub ept_pointer: EptPointer,
    pub msr_bitmap: HostPhysAddr,
    /// Stack pointer loaded on every exit.
    pub host_rsp: u64,
    /// Exit entry point.
    pub host_rip: u64,
    /// Guest-physical address of the guest's PML4.
    pub guest_cr3: u64,
    pub guest_rip: u64,
    pub guest_rsp: u64,
}

/// Fills the current VMCS so the guest starts with the host's control registers
/// and segments on its own page tables, and exits land on `setup.host_rip`.
pub fn populate<C: CpuOps>(setup: &VmcsSetup) -> Result {
    setup_host_selectors::<C>()?;
    VmcsGuest64::LINK_PTR.write::<C>(u64::MAX)?;
    VmcsGuest64::IA32_DEBUGCTL.write::<C>(0)?;
    VmcsControl64::TSC_OFFSET.write::<C>(0)?;
    setup_guest_segments::<C>()?;
    setup_controls::<C>(setup)?;
    setup_system_state::<C>(setup)?;

    VmcsGuestNW::RSP.write::<C>(setup.guest_rsp as usize)?;
    VmcsGuestNW::RIP.write::<C>(setup.guest_rip as usize)?;
    VmcsHostNW::RSP.write::<C>(setup.host_rsp as usize)?;
    VmcsHostNW::RIP.write::<C>(setup.host_rip as usize)?;
    Ok(())
}

fn setup_host_selectors<C: CpuOps>() -> Result {
    use SegmentRegister::*;
    let sel = |reg| host_selector(C::read_selector(reg));
    VmcsHost16::ES_SELECTOR.write::<C>(sel(Es))?;
    VmcsHost16::CS_SELECTOR.write::<C>(sel(Cs))?;
    VmcsHost16::SS_SELECTOR.write::<C>(sel(Ss))?;
    VmcsHost16::DS_SELECTOR.write::<C>(sel(Ds))?;
    VmcsHost16::FS_SELECTOR.write::<C>(sel(Fs))?;
    VmcsHost16::GS_SELECTOR.write::<C>(sel(Gs))?;
    VmcsHost16::TR_SELECTOR.write::<C>(sel(Tr))?;
    Ok(())
}

fn setup_guest_segments<C: CpuOps>() -> Result {
    macro_rules! set_guest_segment {
        ($reg: ident, $name: ident) => {{
            let seg = read_segment::<C>(SegmentRegister::$reg);
            paste::paste! {
                VmcsGuest16::[<$name _SELECTOR>].write::<C>(seg.selector)?;
                VmcsGuestNW::[<$name _BASE>].write::<C>(seg.base as usize)?;
                VmcsGuest32::[<$name _LIMIT>].write::<C>(seg.limit)?;
                VmcsGuest32::[<$name _ACCESS_RIGHTS>].write::<C>(seg.access_rights.bits())?;
            }
        }};
    }

    set_guest_segment!(Es, ES);
    set_guest_segment!(Cs, CS);
    set_guest_segment!(Ss, SS);
    set_guest_segment!(Ds, DS);
    set_guest_segment!(Fs, FS);
    set_guest_segment!(Gs, GS);
    set_guest_segment!(Ldtr, LDTR);
    set_guest_segment!(Tr, TR);

    // Long-mode FS/GS bases live in MSRs, not in the descriptors.
    VmcsGuestNW::FS_BASE.write::<C>(Msr::IA32_FS_BASE.read::<C>() as usize)?;
    VmcsGuestNW::GS_BASE.write::<C>(Msr::IA32_GS_BASE.read::<C>() as usize)?;
    Ok(())
}

/// Whether the host exposes `rdtscp` (CPUID.80000001H:EDX[27]).
fn has_rdtscp<C: CpuOps>() -> bool {
    C::cpuid(0x8000_0001).edx & (1 << 27) != 0
}

/// Whether the host exposes `invpcid` (CPUID.(EAX=07H,ECX=0):EBX[10]).
fn has_invpcid<C: CpuOps>() -> bool {
    C::cpuid(0x7).ebx & (1 << 10) != 0
}

fn setup_controls<C: CpuOps>(setup: &VmcsSetup) -> Result {
    use VmcsControl32::*;

    let flex = VmxBasic::read::<C>().vmx_flex_controls;
    let cap = |plain: Msr, true_msr: Msr| if flex { true_msr } else { plain };

    set_control::<C>(
        PINBASED_EXEC_CONTROLS,
        cap(Msr::IA32_VMX_PINBASED_CTLS, Msr::IA32_VMX_TRUE_PINBASED_CTLS),
        PinbasedControls::empty().bits(),
        0,
    )?;

    let primary = PrimaryControls::HLT_EXITING
        | PrimaryControls::USE_MSR_BITMAPS
        | PrimaryControls::SECONDARY_CONTROLS;
    set_control::<C>(
        PRIMARY_PROCBASED_EXEC_CONTROLS,
        cap(
            Msr::IA32_VMX_PROCBASED_CTLS,
            Msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        ),
        primary.bits(),
        primary.bits(),
    )?;

    // The guest runs host code, so it needs the instructions the host may use.
    let mut secondary = SecondaryControls::ENABLE_EPT;
    if has_rdtscp::<C>() {
        secondary |= SecondaryControls::ENABLE_RDTSCP;
    }
    if has_invpcid::<C>() {
        secondary |= SecondaryControls::ENABLE_INVPCID;
    }
    set_control::<C>(
        SECONDARY_PROCBASED_EXEC_CONTROLS,
        Msr::IA32_VMX_PROCBASED_CTLS2,
        secondary.bits(),
        SecondaryControls::ENABLE_EPT.bits(),
    )?;

    set_control::<C>(
        VMEXIT_CONTROLS,
        cap(Msr::IA32_VMX_EXIT_CTLS, Msr::IA32_VMX_TRUE_EXIT_CTLS),
        (ExitControls::HOST_ADDRESS_SPACE_SIZE | ExitControls::ACK_INTERRUPT_ON_EXIT).bits(),
        ExitControls::HOST_ADDRESS_SPACE_SIZE.bits(),
    )?;

    set_control::<C>(
        VMENTRY_CONTROLS,
        cap(Msr::IA32_VMX_ENTRY_CTLS, Msr::IA32_VMX_TRUE_ENTRY_CTLS),
        EntryControls::IA32E_MODE_GUEST.bits(),
        EntryControls::IA32E_MODE_GUEST.bits(),
    )?;

    VmcsControl64::EPTP.write::<C>(setup.ept_pointer.bits())?;
    VmcsControl64::MSR_BITMAPS_ADDR.write::<C>(setup.msr_bitmap.as_usize() as u64)?;

    EXCEPTION_BITMAP.write::<C>(0)?;
    CR3_TARGET_COUNT.write::<C>(0)?;
    VMEXIT_MSR_STORE_COUNT.write::<C>(0)?;
    VMEXIT_MSR_LOAD_COUNT.write::<C>(0)?;
    VMENTRY_MSR_LOAD_COUNT.write::<C>(0)?;
    VMENTRY_INTERRUPTION_INFO_FIELD.write::<C>(0)?;
    Ok(())
}

/// Control registers, descriptor tables, flags and SYSENTER state, mirrored from
/// the host into both the guest-state and host-state areas. The guest keeps its
/// own CR3 and runs with interrupts masked.
fn setup_system_state<C: CpuOps>(setup: &VmcsSetup) -> Result {
    let cr0 = C::read_cr0() as usize;
    let cr3 = C::read_cr3() as usize;
    let cr4 = C::read_cr4() as usize;

    VmcsControlNW::CR0_GUEST_HOST_MASK.write::<C>(0)?;
    VmcsControlNW::CR4_GUEST_HOST_MASK.write::<C>(0)?;
    VmcsControlNW::CR0_READ_SHADOW.write::<C>(cr0)?;
    VmcsControlNW::CR4_READ_SHADOW.write::<C>(cr4)?;

    VmcsGuestNW::CR0.write::<C>(cr0)?;
    VmcsGuestNW::CR3.write::<C>(setup.guest_cr3 as usize)?;
    VmcsGuestNW::CR4.write::<C>(cr4)?;
    VmcsHostNW::CR0.write::<C>(cr0)?;
    VmcsHostNW::CR3.write::<C>(cr3)?;
    VmcsHostNW::CR4.write::<C>(cr4)?;

    VmcsGuestNW::DR7.write::<C>(DR7_INIT)?;

    let gdt = C::read_gdt();
    let idt = C::read_idt();
    VmcsGuestNW::GDTR_BASE.write::<C>(gdt.base as usize)?;
    VmcsGuest32::GDTR_LIMIT.write::<C>(gdt.limit as u32)?;
    VmcsGuestNW::IDTR_BASE.write::<C>(idt.base as usize)?;
    VmcsGuest32::IDTR_LIMIT.write::<C>(idt.limit as u32)?;
    VmcsHostNW::GDTR_BASE.write::<C>(gdt.base as usize)?;
    VmcsHostNW::IDTR_BASE.write::<C>(idt.base as usize)?;

    VmcsHostNW::TR_BASE.write::<C>(read_segment::<C>(SegmentRegister::Tr).base as usize)?;
    VmcsHostNW::FS_BASE.write::<C>(Msr::IA32_FS_BASE.read::<C>() as usize)?;
    VmcsHostNW::GS_BASE.write::<C>(Msr::IA32_GS_BASE.read::<C>() as usize)?;

    let rflags = C::read_rflags() & !RFlags::INTERRUPT_FLAG.bits();
    VmcsGuestNW::RFLAGS.write::<C>(rflags as usize)?;
    VmcsGuestNW::PENDING_DBG_EXCEPTIONS.write::<C>(0)?;
    VmcsGuest32::INTERRUPTIBILITY_STATE.write::<C>(0)?;
    VmcsGuest32::ACTIVITY_STATE.write::<C>(0)?;

    let sysenter_cs = Msr::IA32_SYSENTER_CS.read::<C>() as u32;
    let sysenter_esp = Msr::IA32_SYSENTER_ESP.read::<C>() as usize;
    let sysenter_eip = Msr::IA32_SYSENTER_EIP.read::<C>() as usize;
    VmcsGuest32::IA32_SYSENTER_CS.write::<C>(sysenter_cs)?;
    VmcsGuestNW::IA32_SYSENTER_ESP.write::<C>(sysenter_esp)?;
    VmcsGuestNW::IA32_SYSENTER_EIP.write::<C>(sysenter_eip)?;
    VmcsHost32::IA32_SYSENTER_CS.write::<C>(sysenter_cs)?;
    VmcsHostNW::IA32_SYSENTER_ESP.write::<C>(sysenter_esp)?;
    VmcsHostNW::IA32_SYSENTER_EIP.write::<C>(sysenter_eip)?;
    Ok(())
}
