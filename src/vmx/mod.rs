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

mod definitions;
mod exit;
mod percpu;
mod structs;
mod vm;
pub mod vmcs;

use crate::hal::CpuOps;

pub use self::definitions::{VmxExitReason, VmxInstructionError};
pub use self::exit::{EXIT_LEAVE, EXIT_RESUME, ExitContext, ExitInfo, SessionEnd};
pub(crate) use self::exit::{vmexit_dispatch, vmresume_failed};
pub use self::percpu::{CoreState, CpuResults, VmxLifecycle, VmxonRegions};
pub use self::structs::{FeatureControl, FeatureControlFlags, MsrBitmap, VmxBasic, VmxRegion};
pub use self::vm::{
    GUEST_ENTRY, GUEST_IMAGE_MAX, GUEST_MAPPED_SIZE, GUEST_PAGE_TABLES, GUEST_STACK_TOP,
    HLT_IMAGE, MIN_HOST_STACK_PAGES, VmConfig, VmxVm,
};
pub use self::vmcs::adjust_controls;

/// Return if current platform support virtualization extension.
pub fn has_hardware_support<C: CpuOps>() -> bool {
    // CPUID.01H:ECX.VMX[bit 5]
    C::cpuid(1).ecx & (1 << 5) != 0
}
