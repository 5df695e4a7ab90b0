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

//! Seams between the VMX core and the host kernel.

use core::fmt;

use bit_field::BitField;
use raw_cpuid::CpuIdResult;
use x86::vmx::VmFail;

use crate::msr::Msr;
use crate::segmentation::SegmentRegister;
use crate::vmx::ExitContext;

/// Host physical address.
pub type HostPhysAddr = memory_addr::PhysAddr;
/// Host virtual address.
pub type HostVirtAddr = memory_addr::VirtAddr;

/// Number of logical cores a [`CpuMask`] can name.
pub const MAX_CPUS: usize = 64;

/// The memory-management interface the VMX core needs from the host.
pub trait MmHal: Sized + Send + Sync + 'static {
    /// Allocates one zero-filled 4 KiB frame.
    fn alloc_frame() -> Option<HostPhysAddr>;
    /// Returns a frame obtained from [`MmHal::alloc_frame`].
    fn dealloc_frame(paddr: HostPhysAddr);
    /// Allocates `count` physically contiguous 4 KiB frames.
    fn alloc_contiguous_frames(count: usize) -> Option<HostPhysAddr>;
    /// Returns frames obtained from [`MmHal::alloc_contiguous_frames`].
    fn dealloc_contiguous_frames(paddr: HostPhysAddr, count: usize);
    /// Converts a host physical address to a host virtual address.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;
    /// Converts a host virtual address to a host physical address.
    fn virt_to_phys(vaddr: HostVirtAddr) -> HostPhysAddr;
}

/// A descriptor-table register image as stored by `sgdt`/`sidt`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

impl DescriptorTable {
    /// The table as a slice of 8-byte descriptors.
    ///
    /// # Safety
    ///
    /// `base` must point to `limit + 1` readable bytes for the returned lifetime.
    pub unsafe fn entries<'a>(&self) -> &'a [u64] {
        let len = (self.limit as usize + 1) / 8;
        unsafe { core::slice::from_raw_parts(self.base as *const u64, len) }
    }
}

/// Privileged processor operations, one call per instruction.
///
/// Every method acts on the core the caller runs on.
pub trait CpuOps: Sized + Send + Sync + 'static {
    /// `cpuid` with sub-leaf 0.
    fn cpuid(leaf: u32) -> CpuIdResult;

    fn read_msr(msr: Msr) -> u64;
    /// # Safety
    ///
    /// Writing an MSR can change processor behavior arbitrarily.
    unsafe fn write_msr(msr: Msr, value: u64);

    fn read_cr0() -> u64;
    /// # Safety
    ///
    /// The value must keep the host's paging and protection state intact.
    unsafe fn write_cr0(value: u64);
    fn read_cr3() -> u64;
    fn read_cr4() -> u64;
    /// # Safety
    ///
    /// See [`CpuOps::write_cr0`].
    unsafe fn write_cr4(value: u64);

    /// Reads a segment selector, including `sldt` and `str`.
    fn read_selector(reg: SegmentRegister) -> u16;
    fn read_gdt() -> DescriptorTable;
    fn read_idt() -> DescriptorTable;
    fn read_rflags() -> u64;

    /// # Safety
    ///
    /// `paddr` must name an initialized VMXON region that stays alive while VMX is on.
    unsafe fn vmxon(paddr: u64) -> Result<(), VmFail>;
    /// # Safety
    ///
    /// No guest may be running on this core.
    unsafe fn vmxoff() -> Result<(), VmFail>;
    /// # Safety
    ///
    /// `paddr` must name a VMCS region.
    unsafe fn vmclear(paddr: u64) -> Result<(), VmFail>;
    /// # Safety
    ///
    /// `paddr` must name a cleared VMCS region.
    unsafe fn vmptrld(paddr: u64) -> Result<(), VmFail>;
    /// # Safety
    ///
    /// A VMCS must be current.
    unsafe fn vmread(field: u32) -> Result<u64, VmFail>;
    /// # Safety
    ///
    /// A VMCS must be current.
    unsafe fn vmwrite(field: u32, value: u64) -> Result<(), VmFail>;

    /// Enters the guest described by the current VMCS with `vmlaunch`.
    ///
    /// Returns `Ok` once the guest session has ended through the exit entry, or the
    /// failure class if `vmlaunch` itself fell through.
    ///
    /// # Safety
    ///
    /// The current VMCS must be fully populated and its host-state area must point at
    /// [`CpuOps::vmexit_entry`] with a stack whose top slot holds `ctx`.
    unsafe fn launch(ctx: &mut ExitContext) -> Result<(), VmFail>;

    /// Address execution resumes at on every VM exit.
    fn vmexit_entry() -> usize;
}

/// Glue between the VMX core and the host kernel.
pub trait VmxHal: Sized + Send + Sync + 'static {
    type Mm: MmHal;
    type Cpu: CpuOps;

    /// Index of the logical core the caller runs on.
    fn current_cpu() -> usize;

    /// Runs `f` on every core in `mask`, with preemption disabled, and waits for all
    /// of them to finish.
    fn on_each_cpu_mask(mask: CpuMask, f: &(dyn Fn(usize) + Sync));
}

/// A set of logical core indices below [`MAX_CPUS`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// A mask naming only `cpu`.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is not below [`MAX_CPUS`].
    pub fn single(cpu: usize) -> Self {
        assert!(cpu < MAX_CPUS, "core index {cpu} out of range");
        Self(1 << cpu)
    }

    /// A mask naming cores `0..count`.
    pub const fn first(count: usize) -> Self {
        if count >= MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn contains(self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.0.get_bit(cpu)
    }

    pub fn insert(&mut self, cpu: usize) {
        assert!(cpu < MAX_CPUS, "core index {cpu} out of range");
        self.0.set_bit(cpu, true);
    }

    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_CPUS).filter(move |&cpu| self.0.get_bit(cpu))
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
