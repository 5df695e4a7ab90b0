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

//! A simulated host: a counting frame allocator, a processor with a VMCS field
//! store and scripted VM exits, and a broadcast that runs cores one after
//! another on the calling thread. All state is thread-local, so tests running
//! in parallel do not see each other.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};

use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;
use raw_cpuid::CpuIdResult;
use x86::vmx::VmFail;

use crate::ept::{EptEntry, EptFlags};
use crate::hal::{CpuMask, CpuOps, DescriptorTable, HostPhysAddr, HostVirtAddr, MAX_CPUS, MmHal, VmxHal};
use crate::msr::Msr;
use crate::regs::GeneralRegisters;
use crate::segmentation::SegmentRegister;
use crate::vmx::{EXIT_LEAVE, ExitContext, VmxExitReason, vmexit_dispatch};

const CR4_VMXE: u64 = 1 << 13;
const FIELD_INSTRUCTION_ERROR: u32 = 0x4400;
const FIELD_EXIT_REASON: u32 = 0x4402;
const FIELD_EXIT_INSTRUCTION_LEN: u32 = 0x440c;
const FIELD_EXIT_QUALIFICATION: u32 = 0x6400;
const FIELD_GUEST_RIP: u32 = 0x681e;
const FIELD_GUEST_CR3: u32 = 0x6802;
const FIELD_EPT_POINTER: u32 = 0x201a;

const TABLE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

thread_local! {
    static MM: RefCell<MmState> = RefCell::new(MmState::default());
    static CPU: RefCell<CpuState> = RefCell::new(CpuState::new());
    static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
}

#[derive(Default)]
struct MmState {
    /// Live allocations: start address to frame count.
    live: BTreeMap<usize, usize>,
    attempts: usize,
    fail_at: Option<usize>,
}

/// Frame allocator backed by the test process heap. Physical and virtual
/// addresses are the same.
#[derive(Debug)]
pub struct MockMm;

impl MockMm {
    /// Forgets every allocation and fault. Memory still live from an earlier test
    /// on this thread is leaked.
    pub fn reset() {
        MM.with(|mm| *mm.borrow_mut() = MmState::default());
    }

    /// Frames allocated and not yet returned.
    pub fn outstanding_frames() -> usize {
        MM.with(|mm| mm.borrow().live.values().sum())
    }

    /// Allocation attempts since the last reset, failed ones included.
    pub fn allocations() -> usize {
        MM.with(|mm| mm.borrow().attempts)
    }

    /// Makes the `n`-th allocation attempt from now fail (0 is the next one).
    pub fn fail_nth_allocation(n: usize) {
        MM.with(|mm| {
            let mut mm = mm.borrow_mut();
            mm.fail_at = Some(mm.attempts + n);
        });
    }
}

impl MmHal for MockMm {
    fn alloc_frame() -> Option<HostPhysAddr> {
        Self::alloc_contiguous_frames(1)
    }

    fn dealloc_frame(paddr: HostPhysAddr) {
        Self::dealloc_contiguous_frames(paddr, 1)
    }

    fn alloc_contiguous_frames(count: usize) -> Option<HostPhysAddr> {
        MM.with(|mm| {
            let mut mm = mm.borrow_mut();
            let attempt = mm.attempts;
            mm.attempts += 1;
            if mm.fail_at == Some(attempt) {
                return None;
            }
            let layout = Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).ok()?;
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return None;
            }
            mm.live.insert(ptr as usize, count);
            Some(HostPhysAddr::from_usize(ptr as usize))
        })
    }

    fn dealloc_contiguous_frames(paddr: HostPhysAddr, count: usize) {
        MM.with(|mm| {
            let addr = paddr.as_usize();
            let live = mm.borrow_mut().live.remove(&addr);
            assert_eq!(live, Some(count), "freeing {addr:#x} ({count} frames) not allocated as such");
            let layout = Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).unwrap();
            unsafe { dealloc(addr as *mut u8, layout) };
        })
    }

    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        HostVirtAddr::from_usize(paddr.as_usize())
    }

    fn virt_to_phys(vaddr: HostVirtAddr) -> HostPhysAddr {
        HostPhysAddr::from_usize(vaddr.as_usize())
    }
}

#[derive(Clone)]
struct CoreRegs {
    cr0: u64,
    cr3: u64,
    cr4: u64,
    cr_writes: usize,
    vmx_on: bool,
    current_vmcs: Option<u64>,
}

impl Default for CoreRegs {
    fn default() -> Self {
        Self {
            cr0: 0x8005_0033,
            cr3: 0x0010_0000,
            cr4: 0x0000_06f0,
            cr_writes: 0,
            vmx_on: false,
            current_vmcs: None,
        }
    }
}

struct CpuState {
    vmx_supported: bool,
    msrs: BTreeMap<u32, u64>,
    cores: Vec<CoreRegs>,
    vmcs: BTreeMap<u64, BTreeMap<u32, u64>>,
    exits: VecDeque<u32>,
    launch_error: Option<u32>,
    gdt: Box<[u64]>,
    idt: Box<[u64]>,
}

impl CpuState {
    fn new() -> Self {
        let msrs = [
            (Msr::IA32_FEATURE_CONTROL, 0x5),
            (Msr::IA32_SYSENTER_CS, 0x10),
            (Msr::IA32_SYSENTER_ESP, 0xffff_8000_0000_8000),
            (Msr::IA32_SYSENTER_EIP, 0xffff_8000_0010_0000),
            (Msr::IA32_PAT, 0x0007_0406_0007_0406),
            (
                Msr::IA32_VMX_BASIC,
                MockCpu::REVISION_ID as u64 | 0x1000 << 32 | 6 << 50 | 1 << 54 | 1 << 55,
            ),
            (Msr::IA32_VMX_PINBASED_CTLS, 0x0000_007f_0000_0016),
            (Msr::IA32_VMX_PROCBASED_CTLS, 0xfff9_fffe_0401_e172),
            (Msr::IA32_VMX_EXIT_CTLS, 0x003f_ffff_0003_6dff),
            (Msr::IA32_VMX_ENTRY_CTLS, 0x0000_ffff_0000_11ff),
            (Msr::IA32_VMX_CR0_FIXED0, 0x8000_0021),
            (Msr::IA32_VMX_CR0_FIXED1, 0xffff_ffff),
            (Msr::IA32_VMX_CR4_FIXED0, 0x2000),
            (Msr::IA32_VMX_CR4_FIXED1, 0x0037_27ff),
            (Msr::IA32_VMX_PROCBASED_CTLS2, 0x00ff_ffff_0000_0000),
            (Msr::IA32_VMX_TRUE_PINBASED_CTLS, 0x0000_007f_0000_0016),
            (Msr::IA32_VMX_TRUE_PROCBASED_CTLS, 0xfff9_fffe_0400_6172),
            (Msr::IA32_VMX_TRUE_EXIT_CTLS, 0x003f_ffff_0003_6dfb),
            (Msr::IA32_VMX_TRUE_ENTRY_CTLS, 0x0000_ffff_0000_11fb),
            (Msr::IA32_EFER, 0xd01),
            (Msr::IA32_FS_BASE, 0x0000_7fff_f7d8_a740),
            (Msr::IA32_GS_BASE, 0xffff_8881_3ba0_0000),
        ]
        .into_iter()
        .map(|(msr, value)| (msr as u32, value))
        .collect();

        Self {
            vmx_supported: true,
            msrs,
            cores: vec![CoreRegs::default(); MAX_CPUS],
            vmcs: BTreeMap::new(),
            exits: VecDeque::new(),
            launch_error: None,
            gdt: MockCpu::GDT.to_vec().into_boxed_slice(),
            idt: vec![0; 512].into_boxed_slice(),
        }
    }

    fn current_fields(&mut self, cpu: usize) -> Result<&mut BTreeMap<u32, u64>, VmFail> {
        let core = &self.cores[cpu];
        match (core.vmx_on, core.current_vmcs) {
            (true, Some(vmcs)) => Ok(self.vmcs.entry(vmcs).or_default()),
            _ => Err(VmFail::VmFailInvalid),
        }
    }
}

fn with_cpu<R>(f: impl FnOnce(&mut CpuState, usize) -> R) -> R {
    let cpu = CURRENT_CPU.with(Cell::get);
    CPU.with(|state| f(&mut state.borrow_mut(), cpu))
}

fn read_revision_id(paddr: u64) -> u32 {
    (unsafe { (paddr as *const u32).read() }) & 0x7fff_ffff
}

fn read_u64(paddr: u64) -> u64 {
    unsafe { (paddr as *const u64).read() }
}

/// Resolves `gpa` through the EPT named by `eptp`, one level at a time.
fn ept_translate(eptp: u64, gpa: u64) -> Option<u64> {
    let mut table = eptp & TABLE_ADDR_MASK;
    for level in (0..4).rev() {
        let index = (gpa >> (12 + 9 * level)) & 0x1ff;
        let entry = EptEntry::from_bits(read_u64(table + index * 8));
        if !entry.flags().contains(EptFlags::READ) {
            return None;
        }
        table = entry.addr().as_usize() as u64;
    }
    Some(table | (gpa & 0xfff))
}

/// Resolves the guest-virtual `gva` through the guest's own 4-level tables at
/// `cr3`. Every table is read from guest memory through the EPT. A miss yields
/// the exit the fetch would cause.
fn guest_translate(eptp: u64, cr3: u64, gva: u64) -> Result<u64, VmxExitReason> {
    let ept = |gpa| ept_translate(eptp, gpa).ok_or(VmxExitReason::EPT_VIOLATION);
    let mut table = cr3 & TABLE_ADDR_MASK;
    for level in (0..4).rev() {
        let index = (gva >> (12 + 9 * level)) & 0x1ff;
        let entry = read_u64(ept(table + index * 8)?);
        // No IDT is reachable from the guest, so a page fault escalates.
        if entry & 1 == 0 {
            return Err(VmxExitReason::TRIPLE_FAULT);
        }
        table = entry & TABLE_ADDR_MASK;
    }
    ept(table | (gva & 0xfff))
}

/// Simulated processor.
#[derive(Debug)]
pub struct MockCpu;

impl MockCpu {
    pub const REVISION_ID: u32 = 0x12;

    /// Null, 64-bit code, data, and a 16-byte TSS descriptor.
    pub const GDT: [u64; 5] = [
        0,
        0x00af_9b00_0000_ffff,
        0x00cf_9300_0000_ffff,
        0x5600_8b34_1000_0067,
        0xffff_8881,
    ];

    pub fn reset() {
        CPU.with(|state| *state.borrow_mut() = CpuState::new());
        CURRENT_CPU.with(|cpu| cpu.set(0));
    }

    pub fn set_vmx_supported(supported: bool) {
        with_cpu(|state, _| state.vmx_supported = supported);
    }

    pub fn set_msr(msr: Msr, value: u64) {
        with_cpu(|state, _| state.msrs.insert(msr as u32, value));
    }

    pub fn msr(msr: Msr) -> u64 {
        with_cpu(|state, _| state.msrs.get(&(msr as u32)).copied().unwrap_or(0))
    }

    pub fn cr0(cpu: usize) -> u64 {
        with_cpu(|state, _| state.cores[cpu].cr0)
    }

    pub fn cr4(cpu: usize) -> u64 {
        with_cpu(|state, _| state.cores[cpu].cr4)
    }

    /// Writes to CR0 and CR4 on `cpu` since the last reset.
    pub fn cr_writes(cpu: usize) -> usize {
        with_cpu(|state, _| state.cores[cpu].cr_writes)
    }

    pub fn is_vmx_on(cpu: usize) -> bool {
        with_cpu(|state, _| state.cores[cpu].vmx_on)
    }

    /// Puts `cpu` in VMX operation without going through the lifecycle.
    pub fn force_vmx_on(cpu: usize) {
        with_cpu(|state, _| {
            let core = &mut state.cores[cpu];
            core.cr4 |= CR4_VMXE;
            core.vmx_on = true;
        });
    }

    pub fn current_vmcs(cpu: usize) -> Option<u64> {
        with_cpu(|state, _| state.cores[cpu].current_vmcs)
    }

    /// A field of the VMCS at `paddr`, if it was ever written.
    pub fn vmcs_field(paddr: u64, field: u32) -> Option<u64> {
        with_cpu(|state, _| state.vmcs.get(&paddr)?.get(&field).copied())
    }

    /// Queues raw exit reasons for the next guest sessions. Once the queue is
    /// empty the guest runs its code: `hlt` at the entry point halts, anything
    /// else triple-faults.
    pub fn script_exits(reasons: &[u32]) {
        with_cpu(|state, _| state.exits.extend(reasons.iter().copied()));
    }

    pub fn pending_exits() -> usize {
        with_cpu(|state, _| state.exits.len())
    }

    /// Makes the next `vmlaunch` fail with VM-instruction error `error`.
    pub fn fail_next_launch(error: u32) {
        with_cpu(|state, _| state.launch_error = Some(error));
    }

    /// Produces the next exit of the guest running on `vmcs` and records it in
    /// the exit-information fields.
    fn next_exit(state: &mut CpuState, vmcs: u64) -> u32 {
        let fields = state.vmcs.entry(vmcs).or_default();
        let reason = state.exits.pop_front().unwrap_or_else(|| {
            let field = |f: u32| fields.get(&f).copied().unwrap_or(0);
            let (rip, cr3, eptp) = (
                field(FIELD_GUEST_RIP),
                field(FIELD_GUEST_CR3),
                field(FIELD_EPT_POINTER),
            );
            match guest_translate(eptp, cr3, rip) {
                Ok(hpa) if unsafe { (hpa as *const u8).read() } == 0xf4 => {
                    VmxExitReason::HLT as u32
                }
                Ok(_) => VmxExitReason::TRIPLE_FAULT as u32,
                Err(reason) => reason as u32,
            }
        });
        let len = match VmxExitReason::try_from(reason & 0xffff) {
            Ok(VmxExitReason::HLT) => 1,
            Ok(r) if r.is_vmx_instruction() => 3,
            _ => 0,
        };
        fields.insert(FIELD_EXIT_REASON, reason as u64);
        fields.insert(FIELD_EXIT_QUALIFICATION, 0);
        fields.insert(FIELD_EXIT_INSTRUCTION_LEN, len);
        reason
    }
}

impl CpuOps for MockCpu {
    fn cpuid(leaf: u32) -> CpuIdResult {
        let supported = with_cpu(|state, _| state.vmx_supported);
        let mut result = CpuIdResult {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
        };
        match leaf {
            1 if supported => result.ecx |= 1 << 5,
            7 => result.ebx |= 1 << 10,
            0x8000_0001 => result.edx |= 1 << 27,
            _ => {}
        }
        result
    }

    fn read_msr(msr: Msr) -> u64 {
        Self::msr(msr)
    }

    unsafe fn write_msr(msr: Msr, value: u64) {
        Self::set_msr(msr, value)
    }

    fn read_cr0() -> u64 {
        with_cpu(|state, cpu| state.cores[cpu].cr0)
    }

    unsafe fn write_cr0(value: u64) {
        with_cpu(|state, cpu| {
            state.cores[cpu].cr0 = value;
            state.cores[cpu].cr_writes += 1;
        })
    }

    fn read_cr3() -> u64 {
        with_cpu(|state, cpu| state.cores[cpu].cr3)
    }

    fn read_cr4() -> u64 {
        with_cpu(|state, cpu| state.cores[cpu].cr4)
    }

    unsafe fn write_cr4(value: u64) {
        with_cpu(|state, cpu| {
            state.cores[cpu].cr4 = value;
            state.cores[cpu].cr_writes += 1;
        })
    }

    fn read_selector(reg: SegmentRegister) -> u16 {
        match reg {
            SegmentRegister::Cs => 0x08,
            SegmentRegister::Ss => 0x10,
            SegmentRegister::Tr => 0x18,
            _ => 0,
        }
    }

    fn read_gdt() -> DescriptorTable {
        with_cpu(|state, _| DescriptorTable {
            base: state.gdt.as_ptr() as u64,
            limit: (state.gdt.len() * 8 - 1) as u16,
        })
    }

    fn read_idt() -> DescriptorTable {
        with_cpu(|state, _| DescriptorTable {
            base: state.idt.as_ptr() as u64,
            limit: (state.idt.len() * 8 - 1) as u16,
        })
    }

    fn read_rflags() -> u64 {
        0x2
    }

    unsafe fn vmxon(paddr: u64) -> Result<(), VmFail> {
        with_cpu(|state, cpu| {
            let core = &mut state.cores[cpu];
            if core.cr4 & CR4_VMXE == 0 || core.vmx_on {
                return Err(VmFail::VmFailInvalid);
            }
            if read_revision_id(paddr) != Self::REVISION_ID {
                return Err(VmFail::VmFailInvalid);
            }
            core.vmx_on = true;
            Ok(())
        })
    }

    unsafe fn vmxoff() -> Result<(), VmFail> {
        with_cpu(|state, cpu| {
            let core = &mut state.cores[cpu];
            if !core.vmx_on {
                return Err(VmFail::VmFailInvalid);
            }
            core.vmx_on = false;
            core.current_vmcs = None;
            Ok(())
        })
    }

    unsafe fn vmclear(paddr: u64) -> Result<(), VmFail> {
        with_cpu(|state, cpu| {
            let core = &mut state.cores[cpu];
            if !core.vmx_on {
                return Err(VmFail::VmFailInvalid);
            }
            if core.current_vmcs == Some(paddr) {
                core.current_vmcs = None;
            }
            state.vmcs.entry(paddr).or_default();
            Ok(())
        })
    }

    unsafe fn vmptrld(paddr: u64) -> Result<(), VmFail> {
        with_cpu(|state, cpu| {
            let core = &mut state.cores[cpu];
            if !core.vmx_on || read_revision_id(paddr) != Self::REVISION_ID {
                return Err(VmFail::VmFailInvalid);
            }
            core.current_vmcs = Some(paddr);
            state.vmcs.entry(paddr).or_default();
            Ok(())
        })
    }

    unsafe fn vmread(field: u32) -> Result<u64, VmFail> {
        with_cpu(|state, cpu| {
            let fields = state.current_fields(cpu)?;
            Ok(fields.get(&field).copied().unwrap_or(0))
        })
    }

    unsafe fn vmwrite(field: u32, value: u64) -> Result<(), VmFail> {
        with_cpu(|state, cpu| {
            let fields = state.current_fields(cpu)?;
            // Bits 11:10 of the encoding = 1: exit-information (read-only) field.
            if (field >> 10) & 0b11 == 1 {
                fields.insert(FIELD_INSTRUCTION_ERROR, 13);
                return Err(VmFail::VmFailValid);
            }
            fields.insert(field, value);
            Ok(())
        })
    }

    unsafe fn launch(ctx: &mut ExitContext) -> Result<(), VmFail> {
        let vmcs = with_cpu(|state, cpu| {
            let core = &state.cores[cpu];
            let vmcs = match (core.vmx_on, core.current_vmcs) {
                (true, Some(vmcs)) => vmcs,
                _ => return Err(VmFail::VmFailInvalid),
            };
            if let Some(error) = state.launch_error.take() {
                let fields = state.vmcs.entry(vmcs).or_default();
                fields.insert(FIELD_INSTRUCTION_ERROR, error as u64);
                return Err(VmFail::VmFailValid);
            }
            Ok(vmcs)
        })?;

        let mut regs = GeneralRegisters::default();
        loop {
            with_cpu(|state, _| Self::next_exit(state, vmcs));
            if vmexit_dispatch::<MockCpu>(&mut regs, ctx) == EXIT_LEAVE {
                return Ok(());
            }
            regs.rax += 1;
        }
    }

    fn vmexit_entry() -> usize {
        0xffff_8000_dead_0000
    }
}

/// Host glue over [`MockMm`] and [`MockCpu`].
#[derive(Debug)]
pub struct MockHal;

impl VmxHal for MockHal {
    type Mm = MockMm;
    type Cpu = MockCpu;

    fn current_cpu() -> usize {
        CURRENT_CPU.with(Cell::get)
    }

    fn on_each_cpu_mask(mask: CpuMask, f: &(dyn Fn(usize) + Sync)) {
        let caller = Self::current_cpu();
        for cpu in mask.iter() {
            CURRENT_CPU.with(|current| current.set(cpu));
            f(cpu);
        }
        CURRENT_CPU.with(|current| current.set(caller));
    }
}
