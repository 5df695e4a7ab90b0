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

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU8, Ordering};

use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;
use x86_64::registers::control::Cr4Flags;

use super::has_hardware_support;
use super::structs::{FeatureControl, FeatureControlFlags, VmxBasic, VmxRegion};
use super::vmcs::vm_fail_to_error;
use crate::hal::{CpuMask, CpuOps, MAX_CPUS, MmHal, VmxHal};
use crate::msr::Msr;
use crate::{Result, VmxError};

/// VMX operation state of one logical core.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    /// The core cannot enter VMX operation.
    Unsupported = 0,
    Off = 1,
    On = 2,
}

impl CoreState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Unsupported,
            2 => Self::On,
            _ => Self::Off,
        }
    }
}

/// Per-core outcomes of a broadcast operation.
#[derive(Debug)]
pub struct CpuResults {
    results: Vec<(usize, Result)>,
}

impl CpuResults {
    /// Outcome for `cpu`, if it took part.
    pub fn get(&self, cpu: usize) -> Option<&Result> {
        self.results
            .iter()
            .find(|(c, _)| *c == cpu)
            .map(|(_, result)| result)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(usize, Result)> {
        self.results.iter()
    }

    pub fn is_ok(&self) -> bool {
        self.results.iter().all(|(_, result)| result.is_ok())
    }

    /// The first failure in core order, wrapped with the core it happened on.
    pub fn into_result(self) -> Result {
        match self.results.into_iter().find(|(_, result)| result.is_err()) {
            Some((cpu, Err(error))) => Err(VmxError::CoreFailed {
                cpu,
                error: Box::new(error),
            }),
            _ => Ok(()),
        }
    }
}

/// One VMXON region per core, allocated up front and kept alive for as long as
/// any core may be in VMX operation with it.
pub struct VmxonRegions<M: MmHal> {
    regions: Vec<Option<VmxRegion<M>>>,
}

impl<M: MmHal> VmxonRegions<M> {
    pub fn alloc(cpus: CpuMask, revision_id: u32) -> Result<Self> {
        let mut regions = Vec::new();
        for cpu in cpus.iter() {
            regions.resize_with(cpu + 1, || None);
            regions[cpu] = Some(VmxRegion::new(revision_id, false)?);
        }
        Ok(Self { regions })
    }

    pub fn get(&self, cpu: usize) -> Option<&VmxRegion<M>> {
        self.regions.get(cpu).and_then(Option::as_ref)
    }

    pub fn cpus(&self) -> CpuMask {
        let mut mask = CpuMask::empty();
        for (cpu, region) in self.regions.iter().enumerate() {
            if region.is_some() {
                mask.insert(cpu);
            }
        }
        mask
    }
}

/// Tracks which cores are in VMX operation and switches them on and off.
pub struct VmxLifecycle<H: VmxHal> {
    states: [AtomicU8; MAX_CPUS],
    _marker: PhantomData<H>,
}

impl<H: VmxHal> Default for VmxLifecycle<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: VmxHal> VmxLifecycle<H> {
    pub const fn new() -> Self {
        Self {
            states: [const { AtomicU8::new(CoreState::Off as u8) }; MAX_CPUS],
            _marker: PhantomData,
        }
    }

    pub fn state(&self, cpu: usize) -> CoreState {
        match self.states.get(cpu) {
            Some(state) => CoreState::from_u8(state.load(Ordering::Acquire)),
            None => CoreState::Unsupported,
        }
    }

    /// Whether every core in `cpus` is in VMX operation.
    pub fn is_enabled(&self, cpus: CpuMask) -> bool {
        cpus.iter().all(|cpu| self.state(cpu) == CoreState::On)
    }

    pub(crate) fn set_state(&self, cpu: usize, state: CoreState) {
        if let Some(slot) = self.states.get(cpu) {
            slot.store(state as u8, Ordering::Release);
        }
    }

    /// Turns VMX on for every core in `cpus`, each using its own region from `regions`.
    pub fn enable<M: MmHal>(&self, cpus: CpuMask, regions: &VmxonRegions<M>) -> CpuResults {
        let results = spin::Mutex::new(Vec::with_capacity(cpus.count()));
        H::on_each_cpu_mask(cpus, &|cpu| {
            let result = match regions.get(cpu) {
                Some(region) => self.enable_on_current(cpu, region),
                None => Err(VmxError::BadState("no VMXON region for this core")),
            };
            if let Err(err) = &result {
                error!("[tvisor] core {}: failed to turn on VMX: {}", cpu, err);
            }
            results.lock().push((cpu, result));
        });
        let mut results = results.into_inner();
        results.sort_by_key(|(cpu, _)| *cpu);
        CpuResults { results }
    }

    /// Turns VMX off for every core in `cpus` that is on. Cores that are not on
    /// report success without touching the processor. A failing `vmxoff` is
    /// only logged; the core is marked off regardless.
    pub fn disable(&self, cpus: CpuMask) -> CpuResults {
        let results = spin::Mutex::new(Vec::with_capacity(cpus.count()));
        H::on_each_cpu_mask(cpus, &|cpu| {
            let result = self.disable_on_current(cpu);
            results.lock().push((cpu, result));
        });
        let mut results = results.into_inner();
        results.sort_by_key(|(cpu, _)| *cpu);
        CpuResults { results }
    }

    fn enable_on_current<M: MmHal>(&self, cpu: usize, region: &VmxRegion<M>) -> Result {
        match self.state(cpu) {
            CoreState::On => return Err(VmxError::VmxAlreadyEnabled),
            CoreState::Unsupported | CoreState::Off => {}
        }
        if let Err(err) = check_vmx_capability::<H::Cpu>() {
            self.set_state(cpu, CoreState::Unsupported);
            return Err(err);
        }

        let vmx_basic = VmxBasic::read::<H::Cpu>();
        region.set_revision_id(vmx_basic.revision_id, false);

        adjust_control_registers::<H::Cpu>();
        unsafe { H::Cpu::vmxon(region.phys_addr().as_usize() as u64) }.map_err(|err| {
            let err = vm_fail_to_error::<H::Cpu>(err);
            clear_vmxe::<H::Cpu>();
            err
        })?;

        self.set_state(cpu, CoreState::On);
        info!("[tvisor] core {}: succeeded to turn on VMX.", cpu);
        Ok(())
    }

    fn disable_on_current(&self, cpu: usize) -> Result {
        if self.state(cpu) != CoreState::On {
            return Ok(());
        }
        let result = unsafe { H::Cpu::vmxoff() };
        self.set_state(cpu, CoreState::Off);
        match result {
            Ok(()) => {
                clear_vmxe::<H::Cpu>();
                info!("[tvisor] core {}: succeeded to turn off VMX.", cpu);
                Ok(())
            }
            Err(err) => {
                warn!(
                    "[tvisor] core {}: vmxoff failed: {}",
                    cpu,
                    vm_fail_to_error::<H::Cpu>(err)
                );
                Ok(())
            }
        }
    }
}

/// Checks everything VMX operation needs that software cannot change, and unlocks
/// VMXON in IA32_FEATURE_CONTROL if firmware left it unlocked.
fn check_vmx_capability<C: CpuOps>() -> Result {
    if !has_hardware_support::<C>() {
        return Err(VmxError::UnsupportedFeature(
            "CPU does not support feature VMX".into(),
        ));
    }

    let ctrl = FeatureControl::read::<C>();
    let locked = ctrl.contains(FeatureControlFlags::LOCKED);
    let vmxon_outside = ctrl.contains(FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX);
    if !locked {
        FeatureControl::write::<C>(
            ctrl | FeatureControlFlags::LOCKED | FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX,
        )
    } else if !vmxon_outside {
        return Err(VmxError::UnsupportedFeature("VMX disabled by BIOS".into()));
    }

    let vmx_basic = VmxBasic::read::<C>();
    if vmx_basic.region_size as usize > PAGE_SIZE {
        return Err(VmxError::UnsupportedFeature(
            "VMX region size is larger than 4K".into(),
        ));
    }
    if vmx_basic.mem_type != VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK {
        return Err(VmxError::UnsupportedFeature(
            "VMX memory type is not write-back".into(),
        ));
    }
    if vmx_basic.is_32bit_address {
        return Err(VmxError::UnsupportedFeature(
            "32-bit VMX not supported".into(),
        ));
    }
    Ok(())
}

/// Forces CR0 and CR4 into the values VMX operation accepts (SDM Vol. 3D,
/// Appendix A.7, A.8) and sets CR4.VMXE.
fn adjust_control_registers<C: CpuOps>() {
    macro_rules! fixed_value {
        ($value: expr, $crx: ident) => {{
            paste::paste! {
                let fixed0 = Msr::[<IA32_VMX_ $crx _FIXED0>].read::<C>();
                let fixed1 = Msr::[<IA32_VMX_ $crx _FIXED1>].read::<C>();
            }
            ($value & fixed1) | fixed0
        }};
    }

    let cr0 = fixed_value!(C::read_cr0(), CR0);
    let cr4 = fixed_value!(C::read_cr4(), CR4) | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();
    unsafe {
        C::write_cr0(cr0);
        C::write_cr4(cr4);
    }
}

fn clear_vmxe<C: CpuOps>() {
    let cr4 = C::read_cr4() & !Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();
    unsafe { C::write_cr4(cr4) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock::{MockCpu, MockHal, MockMm};

    fn setup(cpus: CpuMask) -> (VmxLifecycle<MockHal>, VmxonRegions<MockMm>) {
        MockMm::reset();
        MockCpu::reset();
        let regions = VmxonRegions::alloc(cpus, MockCpu::REVISION_ID).unwrap();
        (VmxLifecycle::new(), regions)
    }

    #[test]
    fn test_enable_disable() {
        let (lifecycle, regions) = setup(CpuMask::single(0));
        assert_eq!(lifecycle.state(0), CoreState::Off);

        lifecycle.enable(CpuMask::single(0), &regions).into_result().unwrap();
        assert_eq!(lifecycle.state(0), CoreState::On);
        assert!(MockCpu::is_vmx_on(0));
        assert_ne!(MockCpu::cr4(0) & Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits(), 0);

        lifecycle.disable(CpuMask::single(0)).into_result().unwrap();
        assert_eq!(lifecycle.state(0), CoreState::Off);
        assert!(!MockCpu::is_vmx_on(0));
        assert_eq!(MockCpu::cr4(0) & Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits(), 0);

        // A second round works the same way.
        lifecycle.enable(CpuMask::single(0), &regions).into_result().unwrap();
        lifecycle.disable(CpuMask::single(0)).into_result().unwrap();
    }

    #[test]
    fn test_enable_twice_reports_already_enabled() {
        let (lifecycle, regions) = setup(CpuMask::single(0));
        lifecycle.enable(CpuMask::single(0), &regions).into_result().unwrap();
        let err = lifecycle
            .enable(CpuMask::single(0), &regions)
            .into_result()
            .unwrap_err();
        assert_eq!(err.root_cause(), &VmxError::VmxAlreadyEnabled);
        assert_eq!(lifecycle.state(0), CoreState::On);
    }

    #[test]
    fn test_disable_when_off_is_noop() {
        let (lifecycle, _regions) = setup(CpuMask::single(0));
        let writes = MockCpu::cr_writes(0);
        let results = lifecycle.disable(CpuMask::single(0));
        assert!(results.is_ok());
        assert_eq!(MockCpu::cr_writes(0), writes);
    }

    #[test]
    fn test_disable_ignores_vmxoff_failure() {
        let (lifecycle, _regions) = setup(CpuMask::single(0));
        // Bookkeeping says on, the processor says off: vmxoff fails.
        lifecycle.set_state(0, CoreState::On);
        assert!(lifecycle.disable(CpuMask::single(0)).is_ok());
        assert_eq!(lifecycle.state(0), CoreState::Off);
    }

    #[test]
    fn test_unsupported_core_leaves_control_registers_alone() {
        let (lifecycle, regions) = setup(CpuMask::single(0));
        MockCpu::set_vmx_supported(false);
        let cr0 = MockCpu::cr0(0);
        let cr4 = MockCpu::cr4(0);

        let err = lifecycle
            .enable(CpuMask::single(0), &regions)
            .into_result()
            .unwrap_err();
        assert!(matches!(err.root_cause(), VmxError::UnsupportedFeature(_)));
        assert_eq!(lifecycle.state(0), CoreState::Unsupported);
        assert_eq!(MockCpu::cr_writes(0), 0);
        assert_eq!((MockCpu::cr0(0), MockCpu::cr4(0)), (cr0, cr4));

        // Disabling after a failed enable succeeds without touching the core.
        assert!(lifecycle.disable(CpuMask::single(0)).is_ok());
    }

    #[test]
    fn test_locked_feature_control_without_vmxon() {
        let (lifecycle, regions) = setup(CpuMask::single(0));
        MockCpu::set_msr(Msr::IA32_FEATURE_CONTROL, FeatureControlFlags::LOCKED.bits());
        let err = lifecycle
            .enable(CpuMask::single(0), &regions)
            .into_result()
            .unwrap_err();
        assert_eq!(
            err.root_cause(),
            &VmxError::UnsupportedFeature("VMX disabled by BIOS".into())
        );
        assert_eq!(MockCpu::cr_writes(0), 0);
    }

    #[test]
    fn test_unlocked_feature_control_is_locked() {
        let (lifecycle, regions) = setup(CpuMask::single(0));
        MockCpu::set_msr(Msr::IA32_FEATURE_CONTROL, 0);
        lifecycle.enable(CpuMask::single(0), &regions).into_result().unwrap();
        assert_eq!(MockCpu::msr(Msr::IA32_FEATURE_CONTROL), 0x5);
    }

    #[test]
    fn test_fixed_bits_applied() {
        let (lifecycle, regions) = setup(CpuMask::single(0));
        lifecycle.enable(CpuMask::single(0), &regions).into_result().unwrap();
        let cr0 = MockCpu::cr0(0);
        let fixed0 = MockCpu::msr(Msr::IA32_VMX_CR0_FIXED0);
        let fixed1 = MockCpu::msr(Msr::IA32_VMX_CR0_FIXED1);
        assert_eq!(cr0 & fixed0, fixed0);
        assert_eq!(cr0 & !fixed1, 0);
    }

    #[test]
    fn test_multi_core_reports_first_failure() {
        let (lifecycle, regions) = setup(CpuMask::first(2));
        // Core 3 has no region.
        let mask = CpuMask::from_bits(0b1011);
        let results = lifecycle.enable(mask, &regions);
        assert!(results.get(0).unwrap().is_ok());
        assert!(results.get(1).unwrap().is_ok());
        assert!(results.get(3).unwrap().is_err());
        assert!(results.get(2).is_none());
        match results.into_result() {
            Err(VmxError::CoreFailed { cpu, .. }) => assert_eq!(cpu, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert!(lifecycle.is_enabled(CpuMask::first(2)));
        assert!(!lifecycle.is_enabled(mask));

        lifecycle.disable(mask).into_result().unwrap();
        assert!(!MockCpu::is_vmx_on(0) && !MockCpu::is_vmx_on(1));
    }

    #[test]
    fn test_regions_cover_mask() {
        MockMm::reset();
        let regions = VmxonRegions::<MockMm>::alloc(CpuMask::from_bits(0b101), 7).unwrap();
        assert_eq!(regions.cpus(), CpuMask::from_bits(0b101));
        assert!(regions.get(1).is_none());
        assert_eq!(regions.get(2).unwrap().revision_id(), 7);
        assert_eq!(MockMm::outstanding_frames(), 2);
    }
}
