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

//! [`CpuOps`] on the processor the code runs on.

use core::arch::{asm, naked_asm};
use core::mem::{offset_of, size_of};

use raw_cpuid::{CpuIdResult, cpuid};
use x86::bits64::vmx;
use x86::vmx::VmFail;
use x86_64::instructions::tables;
use x86_64::registers::control::{Cr0, Cr4};
use x86_64::registers::rflags::{self, RFlags};

use crate::hal::{CpuOps, DescriptorTable};
use crate::msr::Msr;
use crate::regs::GeneralRegisters;
use crate::segmentation::SegmentRegister;
use crate::vmx::{ExitContext, vmexit_dispatch, vmresume_failed};

/// The current processor.
pub struct X86Cpu;

impl CpuOps for X86Cpu {
    fn cpuid(leaf: u32) -> CpuIdResult {
        cpuid!(leaf, 0)
    }

    fn read_msr(msr: Msr) -> u64 {
        unsafe { x86::msr::rdmsr(msr.into()) }
    }

    unsafe fn write_msr(msr: Msr, value: u64) {
        unsafe { x86::msr::wrmsr(msr.into(), value) }
    }

    fn read_cr0() -> u64 {
        Cr0::read_raw()
    }

    unsafe fn write_cr0(value: u64) {
        unsafe { Cr0::write_raw(value) }
    }

    fn read_cr3() -> u64 {
        unsafe { x86::controlregs::cr3() }
    }

    fn read_cr4() -> u64 {
        Cr4::read_raw()
    }

    unsafe fn write_cr4(value: u64) {
        unsafe { Cr4::write_raw(value) }
    }

    fn read_selector(reg: SegmentRegister) -> u16 {
        use x86::segmentation as seg;
        match reg {
            SegmentRegister::Es => seg::es().bits(),
            SegmentRegister::Cs => seg::cs().bits(),
            SegmentRegister::Ss => seg::ss().bits(),
            SegmentRegister::Ds => seg::ds().bits(),
            SegmentRegister::Fs => seg::fs().bits(),
            SegmentRegister::Gs => seg::gs().bits(),
            SegmentRegister::Ldtr => {
                let sel: u16;
                unsafe {
                    asm!("sldt {0:x}", out(reg) sel, options(nomem, nostack, preserves_flags))
                };
                sel
            }
            SegmentRegister::Tr => unsafe { x86::task::tr() }.bits(),
        }
    }

    fn read_gdt() -> DescriptorTable {
        let gdtp = tables::sgdt();
        DescriptorTable {
            base: gdtp.base.as_u64(),
            limit: gdtp.limit,
        }
    }

    fn read_idt() -> DescriptorTable {
        let idtp = tables::sidt();
        DescriptorTable {
            base: idtp.base.as_u64(),
            limit: idtp.limit,
        }
    }

    fn read_rflags() -> u64 {
        rflags::read_raw()
    }

    unsafe fn vmxon(paddr: u64) -> Result<(), VmFail> {
        unsafe { vmx::vmxon(paddr) }
    }

    unsafe fn vmxoff() -> Result<(), VmFail> {
        unsafe { vmx::vmxoff() }
    }

    unsafe fn vmclear(paddr: u64) -> Result<(), VmFail> {
        unsafe { vmx::vmclear(paddr) }
    }

    unsafe fn vmptrld(paddr: u64) -> Result<(), VmFail> {
        unsafe { vmx::vmptrld(paddr) }
    }

    unsafe fn vmread(field: u32) -> Result<u64, VmFail> {
        unsafe { vmx::vmread(field) }
    }

    unsafe fn vmwrite(field: u32, value: u64) -> Result<(), VmFail> {
        unsafe { vmx::vmwrite(field, value) }
    }

    unsafe fn launch(ctx: &mut ExitContext) -> Result<(), VmFail> {
        let rflags = unsafe { vmx_launch(ctx) };
        if rflags == 0 {
            Ok(())
        } else if RFlags::from_bits_truncate(rflags).contains(RFlags::CARRY_FLAG) {
            Err(VmFail::VmFailInvalid)
        } else {
            Err(VmFail::VmFailValid)
        }
    }

    fn vmexit_entry() -> usize {
        vmx_exit_entry as usize
    }
}

/// Saves the callee-saved registers and the host stack and frame pointers in
/// `ctx`, then executes `vmlaunch`.
///
/// Returns 0 once [`vmx_exit_entry`] has unwound a finished session onto the
/// saved stack, or RFLAGS if `vmlaunch` fell through.
#[unsafe(naked)]
unsafe extern "C" fn vmx_launch(_ctx: *mut ExitContext) -> u64 {
    naked_asm!(
        "push rbx",
        "push rbp",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi + {host_rsp}], rsp",
        "mov [rdi + {host_rbp}], rbp",
        "vmlaunch",
        "pushfq",
        "pop rax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        "ret",
        host_rsp = const offset_of!(ExitContext, host_rsp),
        host_rbp = const offset_of!(ExitContext, host_rbp),
    )
}

/// VM-exit entry point (HOST_RIP).
///
/// Runs on the VM's host stack, whose top slot holds the `*mut ExitContext` of
/// the session. Saves the guest registers, calls [`vmexit_dispatch`], and either
/// resumes the guest or restores the launcher's stack and returns 0 from
/// [`vmx_launch`].
#[unsafe(naked)]
unsafe extern "C" fn vmx_exit_entry() -> ! {
    naked_asm!(
        save_regs_to_stack!(),
        "mov rdi, rsp",
        "mov rsi, [rsp + {regs_size}]",
        "sub rsp, 8",
        "call {dispatch}",
        "add rsp, 8",
        "test rax, rax",
        "jnz 2f",
        restore_regs_from_stack!(),
        "vmresume",
        // vmresume fell through.
        save_regs_to_stack!(),
        "mov rdi, rsp",
        "mov rsi, [rsp + {regs_size}]",
        "sub rsp, 8",
        "call {resume_failed}",
        "add rsp, 8",
        "2:",
        "mov rsi, [rsp + {regs_size}]",
        "mov rbp, [rsi + {host_rbp}]",
        "mov rsp, [rsi + {host_rsp}]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        "xor eax, eax",
        "ret",
        regs_size = const size_of::<GeneralRegisters>(),
        host_rsp = const offset_of!(ExitContext, host_rsp),
        host_rbp = const offset_of!(ExitContext, host_rbp),
        dispatch = sym vmexit_dispatch::<X86Cpu>,
        resume_failed = sym vmresume_failed::<X86Cpu>,
    )
}
