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

use alloc::format;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;
use x86_64::structures::paging::PageTableFlags;

use super::exit::{ExitContext, ExitInfo, SessionEnd};
use super::has_hardware_support;
use super::percpu::{CoreState, VmxLifecycle, VmxonRegions};
use super::structs::{MsrBitmap, VmxBasic, VmxRegion};
use super::vmcs::{self, VmcsSetup};
use crate::ept::{EptTree, GuestPhysAddr};
use crate::frame::ContiguousPhysFrames;
use crate::hal::{CpuMask, CpuOps, MmHal, VmxHal};
use crate::{Result, VmxError};

/// Smallest host stack the exit path may run on.
pub const MIN_HOST_STACK_PAGES: usize = 8;

/// A guest that halts immediately.
pub const HLT_IMAGE: &[u8] = &[0xf4];

/// Largest guest image; it must end below the guest page tables.
pub const GUEST_IMAGE_MAX: usize = PAGE_SIZE;

/// Guest-physical addresses of the guest's PML4, PDPT, PD and PT.
pub const GUEST_PAGE_TABLES: [usize; 4] = [0x1000, 0x2000, 0x3000, 0x4000];

/// Guest-virtual span identity-mapped by [`GUEST_PAGE_TABLES`].
pub const GUEST_MAPPED_SIZE: usize = 512 * PAGE_SIZE;

/// Initial guest stack pointer. The stack page sits right above the page tables.
pub const GUEST_STACK_TOP: usize = 0x6000;

/// Guest RIP at launch: the first byte of the guest image.
pub const GUEST_ENTRY: usize = 0;

/// Parameters of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Guest memory backed by EPT, in MiB.
    pub ept_size_mib: u64,
    /// Pages of host stack used by the exit path.
    pub host_stack_pages: usize,
    /// Cores that get a VMXON region.
    pub cpus: CpuMask,
    /// Bytes copied to guest-physical address 0 at creation.
    pub guest_image: &'static [u8],
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            ept_size_mib: 0x100,
            host_stack_pages: MIN_HOST_STACK_PAGES,
            cpus: CpuMask::single(0),
            guest_image: HLT_IMAGE,
        }
    }
}

impl VmConfig {
    pub fn with_ept_size_mib(mut self, ept_size_mib: u64) -> Self {
        self.ept_size_mib = ept_size_mib;
        self
    }

    pub fn with_host_stack_pages(mut self, pages: usize) -> Self {
        self.host_stack_pages = pages;
        self
    }

    pub fn with_cpus(mut self, cpus: CpuMask) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn with_guest_image(mut self, image: &'static [u8]) -> Self {
        self.guest_image = image;
        self
    }

    pub fn validate(&self) -> Result {
        if self.host_stack_pages < MIN_HOST_STACK_PAGES {
            return Err(VmxError::InvalidVmcsConfig(format!(
                "host stack of {} pages is below the minimum of {}",
                self.host_stack_pages, MIN_HOST_STACK_PAGES
            )));
        }
        if self.cpus.is_empty() {
            return Err(VmxError::InvalidVmcsConfig("no cores selected".into()));
        }
        if self.ept_size_mib == 0 {
            return Err(VmxError::InvalidVmcsConfig(
                "guest memory cannot hold the guest page tables".into(),
            ));
        }
        if self.guest_image.len() > GUEST_IMAGE_MAX {
            return Err(VmxError::InvalidVmcsConfig(format!(
                "guest image of {} bytes is larger than {:#x}",
                self.guest_image.len(),
                GUEST_IMAGE_MAX
            )));
        }
        Ok(())
    }
}

/// Everything one VM owns. Dropping it releases every page it allocated.
pub struct VmxVm<H: VmxHal> {
    config: VmConfig,
    vmxon_regions: VmxonRegions<H::Mm>,
    vmcs: VmxRegion<H::Mm>,
    ept: EptTree<H::Mm>,
    host_stack: ContiguousPhysFrames<H::Mm>,
    msr_bitmap: MsrBitmap<H::Mm>,
    exit_ctx: spin::Mutex<ExitContext>,
    active: AtomicBool,
}

impl<H: VmxHal> VmxVm<H> {
    /// Allocates the VMXON regions, the VMCS, the EPT tree with its guest memory,
    /// the host stack and the MSR bitmap, in that order, and loads the guest image.
    ///
    /// On failure everything allocated so far is released.
    pub fn create(config: VmConfig) -> Result<Self> {
        config.validate()?;
        if !has_hardware_support::<H::Cpu>() {
            return Err(VmxError::UnsupportedFeature(
                "CPU does not support feature VMX".into(),
            ));
        }
        let basic = VmxBasic::read::<H::Cpu>();
        if basic.region_size as usize > PAGE_SIZE {
            return Err(VmxError::UnsupportedFeature(
                "VMX region size is larger than 4K".into(),
            ));
        }

        let vmxon_regions = VmxonRegions::alloc(config.cpus, basic.revision_id)?;
        let vmcs = VmxRegion::new(basic.revision_id, false)?;
        let ept = EptTree::build(config.ept_size_mib)?;
        let host_stack = ContiguousPhysFrames::alloc_zero(config.host_stack_pages)?;
        let msr_bitmap = MsrBitmap::passthrough_all()?;
        if !config.guest_image.is_empty() {
            ept.write(GuestPhysAddr::from_usize(GUEST_ENTRY), config.guest_image)?;
        }
        map_guest_identity(&ept)?;

        info!(
            "[tvisor] created VM: {} MiB guest memory, EPTP {:?}, cores {:?}",
            config.ept_size_mib,
            ept.pointer(),
            config.cpus
        );
        Ok(Self {
            config,
            vmxon_regions,
            vmcs,
            ept,
            host_stack,
            msr_bitmap,
            exit_ctx: spin::Mutex::new(ExitContext::new(0)),
            active: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn cpus(&self) -> CpuMask {
        self.config.cpus
    }

    pub fn vmxon_regions(&self) -> &VmxonRegions<H::Mm> {
        &self.vmxon_regions
    }

    pub fn vmcs(&self) -> &VmxRegion<H::Mm> {
        &self.vmcs
    }

    pub fn ept(&self) -> &EptTree<H::Mm> {
        &self.ept
    }

    pub fn msr_bitmap(&self) -> &MsrBitmap<H::Mm> {
        &self.msr_bitmap
    }

    /// Whether a guest is currently running on this VM's VMCS.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Copies `bytes` into guest memory at `gpa`.
    pub fn write_guest_memory(&self, gpa: GuestPhysAddr, bytes: &[u8]) -> Result {
        self.ept.write(gpa, bytes)
    }

    /// Exit information of the most recent exit, from any session.
    pub fn last_exit(&self) -> Option<ExitInfo> {
        self.exit_ctx.lock().last_exit()
    }

    /// How the most recent session ended.
    pub fn last_session_end(&self) -> Option<SessionEnd> {
        self.exit_ctx.lock().end().cloned()
    }

    /// Runs the guest on `cpu` until it halts.
    ///
    /// The guest starts with the host's control registers and segments, its own
    /// identity-mapped page tables, RIP at [`GUEST_ENTRY`] and RSP at
    /// [`GUEST_STACK_TOP`]. When the session ends VMX is off on `cpu`.
    ///
    /// # Panics
    ///
    /// Panics if VMX is not on for `cpu`.
    pub fn launch(&self, lifecycle: &VmxLifecycle<H>, cpu: usize) -> Result<ExitInfo> {
        assert_eq!(
            lifecycle.state(cpu),
            CoreState::On,
            "launching a guest on core {cpu} without VMX on"
        );

        let outcome = spin::Mutex::new(None);
        H::on_each_cpu_mask(CpuMask::single(cpu), &|cpu| {
            let mut ctx = self.exit_ctx.lock();
            *ctx = ExitContext::new(cpu);
            let result = self.enter(&mut ctx);
            *outcome.lock() = Some((result, ctx.vmx_off));
        });

        let (result, vmx_off) = outcome.into_inner().unwrap_or((
            Err(VmxError::BadState("launch did not run on the target core")),
            false,
        ));
        if vmx_off {
            lifecycle.set_state(cpu, CoreState::Off);
        }
        result
    }

    fn enter(&self, ctx: &mut ExitContext) -> Result<ExitInfo> {
        let cpu = ctx.cpu();
        vmcs::clear::<H::Cpu, _>(&self.vmcs)?;
        vmcs::load::<H::Cpu, _>(&self.vmcs)?;

        // The exit entry finds the context in the top slot of its stack.
        let host_rsp = self.host_stack.end_vaddr().as_usize() as u64 - 8;
        unsafe { (host_rsp as *mut u64).write(ctx as *mut ExitContext as u64) };

        vmcs::populate::<H::Cpu>(&VmcsSetup {
            ept_pointer: self.ept.pointer(),
            msr_bitmap: self.msr_bitmap.phys_addr(),
            host_rsp,
            host_rip: H::Cpu::vmexit_entry() as u64,
            guest_cr3: GUEST_PAGE_TABLES[0] as u64,
            guest_rip: GUEST_ENTRY as u64,
            guest_rsp: GUEST_STACK_TOP as u64,
        })?;

        info!(
            "[tvisor] core {}: launching guest at {:#x}",
            cpu, GUEST_ENTRY
        );
        self.active.store(true, Ordering::Release);
        let entered = unsafe { H::Cpu::launch(ctx) };
        self.active.store(false, Ordering::Release);

        if let Err(fail) = entered {
            let err = vmcs::vm_fail_to_error::<H::Cpu>(fail);
            error!("[tvisor] core {}: vmlaunch failed: {}", cpu, err);
            ctx.finish::<H::Cpu>(SessionEnd::Failed(err.clone()));
            return Err(err);
        }

        match ctx.end() {
            Some(SessionEnd::Halted) => ctx
                .last_exit()
                .ok_or(VmxError::BadState("guest halted without exit information")),
            Some(SessionEnd::Unhandled(info)) => Err(VmxError::UnhandledExit(info.exit_reason)),
            Some(SessionEnd::EntryFailed(info)) => Err(VmxError::InvalidVmcsConfig(format!(
                "VM entry failed with exit reason {:#x}",
                info.exit_reason
            ))),
            Some(SessionEnd::Failed(err)) => Err(err.clone()),
            None => Err(VmxError::BadState("guest session ended without an exit")),
        }
    }

    /// Releases everything the VM owns.
    ///
    /// # Panics
    ///
    /// Panics if a guest is running on this VM.
    pub fn destroy(self) {
        drop(self);
    }
}

/// Writes a 4-level page-table chain at [`GUEST_PAGE_TABLES`] that maps the
/// first [`GUEST_MAPPED_SIZE`] bytes of guest-virtual space onto the same
/// guest-physical addresses.
fn map_guest_identity<M: MmHal>(ept: &EptTree<M>) -> Result {
    let flags = (PageTableFlags::PRESENT | PageTableFlags::WRITABLE).bits();
    let [pml4, pdpt, pd, pt] = GUEST_PAGE_TABLES;
    for (table, next) in [(pml4, pdpt), (pdpt, pd), (pd, pt)] {
        ept.write(
            GuestPhysAddr::from_usize(table),
            &(next as u64 | flags).to_le_bytes(),
        )?;
    }

    let mut entries = [0u8; PAGE_SIZE];
    for (i, entry) in entries.chunks_exact_mut(8).enumerate() {
        entry.copy_from_slice(&((i * PAGE_SIZE) as u64 | flags).to_le_bytes());
    }
    ept.write(GuestPhysAddr::from_usize(pt), &entries)
}

impl<H: VmxHal> Drop for VmxVm<H> {
    fn drop(&mut self) {
        assert!(!self.is_active(), "destroying a VM while its guest runs");
        info!("[tvisor] destroyed VM with EPTP {:?}", self.ept.pointer());
    }
}

impl<H: VmxHal> fmt::Debug for VmxVm<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmxVm")
            .field("config", &self.config)
            .field("vmcs", &self.vmcs)
            .field("ept", &self.ept)
            .field("host_stack", &self.host_stack.start_paddr())
            .field("msr_bitmap", &self.msr_bitmap)
            .field("active", &self.is_active())
            .finish()
    }
}
