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

//! VM-exit decoding and the handler the exit entry calls.

use bit_field::BitField;
use x86_64::registers::control::Cr4Flags;

use super::definitions::VmxExitReason;
use super::vmcs::{self, VmcsGuestNW, VmcsReadOnly32, VmcsReadOnlyNW};
use crate::hal::CpuOps;
use crate::regs::{GeneralRegisters, GeneralRegistersDiff};
use crate::{Result, VmxError};

/// Returned by [`vmexit_dispatch`]: re-enter the guest.
pub const EXIT_RESUME: u64 = 0;
/// Returned by [`vmexit_dispatch`]: VMX is off, unwind to the launcher.
pub const EXIT_LEAVE: u64 = 1;

/// VM-Exit Informations. (SDM Vol. 3C, Section 25.9.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Basic exit reason, bits 15:0 of the exit-reason field.
    pub exit_reason: u32,
    /// VM-entry failure (bit 31 of the exit-reason field).
    pub entry_failure: bool,
    pub exit_qualification: u64,
    pub guest_rip: u64,
    pub exit_instruction_length: u32,
}

impl ExitInfo {
    /// Reads the exit-information fields of the current VMCS.
    pub fn read<C: CpuOps>() -> Result<Self> {
        let full_reason = VmcsReadOnly32::EXIT_REASON.read::<C>()?;
        Ok(Self {
            exit_reason: full_reason.get_bits(0..16),
            entry_failure: full_reason.get_bit(31),
            exit_qualification: VmcsReadOnlyNW::EXIT_QUALIFICATION.read::<C>()? as u64,
            guest_rip: VmcsGuestNW::RIP.read::<C>()? as u64,
            exit_instruction_length: VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN.read::<C>()?,
        })
    }

    /// The decoded basic reason, if it is one this crate knows.
    pub fn reason(&self) -> Option<VmxExitReason> {
        VmxExitReason::try_from(self.exit_reason).ok()
    }
}

/// How a guest session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The guest executed `hlt`.
    Halted,
    /// The guest exited for a reason the dispatcher does not service.
    Unhandled(ExitInfo),
    /// The exit-reason field reported a VM-entry failure.
    EntryFailed(ExitInfo),
    /// The exit could not be serviced at all.
    Failed(VmxError),
}

/// State shared between the launcher and the exit path of one guest session.
///
/// The entry trampoline stores the host's stack and frame pointers in the first
/// two fields right before `vmlaunch`; the exit entry reloads them to return
/// to the launcher. The layout of those two fields is fixed.
#[repr(C)]
#[derive(Debug)]
pub struct ExitContext {
    pub(crate) host_rsp: u64,
    pub(crate) host_rbp: u64,
    pub(crate) cpu: usize,
    pub(crate) exits: u64,
    pub(crate) last_exit: Option<ExitInfo>,
    pub(crate) last_regs: GeneralRegisters,
    pub(crate) end: Option<SessionEnd>,
    pub(crate) vmx_off: bool,
}

impl ExitContext {
    pub fn new(cpu: usize) -> Self {
        Self {
            host_rsp: 0,
            host_rbp: 0,
            cpu,
            exits: 0,
            last_exit: None,
            last_regs: GeneralRegisters::default(),
            end: None,
            vmx_off: false,
        }
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Number of exits taken in this session.
    pub fn exits(&self) -> u64 {
        self.exits
    }

    pub fn last_exit(&self) -> Option<ExitInfo> {
        self.last_exit
    }

    /// Guest registers as of the last exit.
    pub fn last_regs(&self) -> &GeneralRegisters {
        &self.last_regs
    }

    pub fn end(&self) -> Option<&SessionEnd> {
        self.end.as_ref()
    }

    /// Records how the session ended and takes the core out of VMX operation.
    pub(crate) fn finish<C: CpuOps>(&mut self, end: SessionEnd) -> u64 {
        self.end = Some(end);
        match unsafe { C::vmxoff() } {
            Ok(()) => {
                let cr4 = C::read_cr4() & !Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();
                unsafe { C::write_cr4(cr4) };
                self.vmx_off = true;
            }
            Err(err) => {
                warn!(
                    "[tvisor] core {}: vmxoff after guest exit failed: {}",
                    self.cpu,
                    vmcs::vm_fail_to_error::<C>(err)
                );
            }
        }
        EXIT_LEAVE
    }
}

/// Services one VM exit. Called by the exit entry with the guest's registers
/// saved on the host stack.
///
/// Returns [`EXIT_RESUME`] to re-enter the guest or [`EXIT_LEAVE`] once the
/// session is over and VMX has been turned off.
#[allow(improper_ctypes_definitions)]
pub extern "C" fn vmexit_dispatch<C: CpuOps>(
    regs: &mut GeneralRegisters,
    ctx: &mut ExitContext,
) -> u64 {
    ctx.exits += 1;
    if ctx.exits > 1 {
        let diff = GeneralRegistersDiff::new(ctx.last_regs, *regs);
        if !diff.is_same() {
            trace!("[tvisor] core {}: guest registers changed: {:?}", ctx.cpu, diff);
        }
    }
    ctx.last_regs = *regs;

    let info = match ExitInfo::read::<C>() {
        Ok(info) => info,
        Err(err) => {
            error!("[tvisor] core {}: cannot read exit information: {}", ctx.cpu, err);
            return ctx.finish::<C>(SessionEnd::Failed(err));
        }
    };
    ctx.last_exit = Some(info);

    if info.entry_failure {
        error!("[tvisor] core {}: VM entry failed: {:#x?}", ctx.cpu, info);
        return ctx.finish::<C>(SessionEnd::EntryFailed(info));
    }

    match info.reason() {
        Some(VmxExitReason::HLT) => {
            info!(
                "[tvisor] core {}: guest halted at {:#x}",
                ctx.cpu, info.guest_rip
            );
            ctx.finish::<C>(SessionEnd::Halted)
        }
        Some(reason) if reason.is_vmx_instruction() => {
            info!(
                "[tvisor] core {}: guest executed {:?} at {:#x}, resuming",
                ctx.cpu, reason, info.guest_rip
            );
            EXIT_RESUME
        }
        _ => {
            error!(
                "[tvisor] core {}: unhandled VM exit {:#x?}, registers {:#x?}",
                ctx.cpu, info, regs
            );
            ctx.finish::<C>(SessionEnd::Unhandled(info))
        }
    }
}

/// Called by the exit entry when `vmresume` falls through.
#[allow(improper_ctypes_definitions)]
pub extern "C" fn vmresume_failed<C: CpuOps>(
    regs: &mut GeneralRegisters,
    ctx: &mut ExitContext,
) -> u64 {
    let err = VmxError::VmFailValid(vmcs::instruction_error::<C>());
    error!("[tvisor] core {}: vmresume failed: {}", ctx.cpu, err);
    ctx.last_regs = *regs;
    ctx.finish::<C>(SessionEnd::Failed(err))
}
