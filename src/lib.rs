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

#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

mod error;
mod hal;

pub(crate) mod msr;
#[macro_use]
pub(crate) mod regs;

mod commands;
mod ept;
mod frame;
mod segmentation;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

mod vmx;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod arch;
        pub use arch::X86Cpu;
    }
}

pub use commands::{Command, UnknownCommand};
pub use ept::{
    ENTRY_COUNT, EntrySlot, EptEntry, EptFlags, EptLayout, EptMemType, EptPointer, EptTree,
    GuestPhysAddr,
};
pub use error::{Result, VmxError};
pub use frame::{ContiguousPhysFrames, PhysFrame};
pub use hal::{
    CpuMask, CpuOps, DescriptorTable, HostPhysAddr, HostVirtAddr, MAX_CPUS, MmHal, VmxHal,
};
pub use msr::Msr;
pub use regs::{GeneralRegisters, GeneralRegistersDiff};
pub use segmentation::{Segment, SegmentAccessRights, SegmentRegister};
pub use vmx::{
    CoreState, CpuResults, EXIT_LEAVE, EXIT_RESUME, ExitContext, ExitInfo, FeatureControl,
    FeatureControlFlags, GUEST_ENTRY, GUEST_IMAGE_MAX, GUEST_MAPPED_SIZE, GUEST_PAGE_TABLES,
    GUEST_STACK_TOP, HLT_IMAGE, MIN_HOST_STACK_PAGES, MsrBitmap, SessionEnd, VmConfig, VmxBasic,
    VmxExitReason, VmxInstructionError, VmxLifecycle, VmxRegion, VmxVm, VmxonRegions,
    adjust_controls, has_hardware_support, vmcs,
};
