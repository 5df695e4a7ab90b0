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

use core::marker::PhantomData;

use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

use crate::hal::{HostPhysAddr, HostVirtAddr, MmHal};
use crate::{Result, VmxError};

/// A 4K-sized physical page. It is returned to the allocator on drop.
#[derive(Debug)]
pub struct PhysFrame<H: MmHal> {
    start_paddr: HostPhysAddr,
    _marker: PhantomData<H>,
}

impl<H: MmHal> PhysFrame<H> {
    /// Allocates a frame. Its contents are whatever the allocator left there.
    pub fn alloc() -> Result<Self> {
        let start_paddr = H::alloc_frame().ok_or(VmxError::MemoryAllocationFailed)?;
        assert_ne!(start_paddr.as_usize(), 0);
        Ok(Self {
            start_paddr,
            _marker: PhantomData,
        })
    }

    /// Allocates a frame and fills it with zeros.
    pub fn alloc_zero() -> Result<Self> {
        let mut f = Self::alloc()?;
        f.fill(0);
        Ok(f)
    }

    /// Takes ownership of a frame previously released with [`PhysFrame::into_raw`].
    ///
    /// # Safety
    ///
    /// `start_paddr` must come from [`PhysFrame::into_raw`] and must not be owned by
    /// anything else.
    pub unsafe fn from_raw(start_paddr: HostPhysAddr) -> Self {
        Self {
            start_paddr,
            _marker: PhantomData,
        }
    }

    /// Gives up ownership without freeing the frame.
    pub fn into_raw(self) -> HostPhysAddr {
        let paddr = self.start_paddr;
        core::mem::forget(self);
        paddr
    }

    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr
    }

    pub fn start_vaddr(&self) -> HostVirtAddr {
        H::phys_to_virt(self.start_paddr)
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.start_vaddr().as_mut_ptr()
    }

    pub fn fill(&mut self, byte: u8) {
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), byte, PAGE_SIZE) }
    }
}

impl<H: MmHal> Drop for PhysFrame<H> {
    fn drop(&mut self) {
        H::dealloc_frame(self.start_paddr);
        trace!("[tvisor] deallocated PhysFrame({:#x})", self.start_paddr);
    }
}

/// Physically contiguous frames released together on drop.
#[derive(Debug)]
pub struct ContiguousPhysFrames<H: MmHal> {
    start_paddr: HostPhysAddr,
    frame_count: usize,
    _marker: PhantomData<H>,
}

impl<H: MmHal> ContiguousPhysFrames<H> {
    pub fn alloc(frame_count: usize) -> Result<Self> {
        if frame_count == 0 {
            return Err(VmxError::InvalidVmcsConfig(
                "cannot allocate zero contiguous frames".into(),
            ));
        }
        let start_paddr =
            H::alloc_contiguous_frames(frame_count).ok_or(VmxError::MemoryAllocationFailed)?;
        assert_ne!(start_paddr.as_usize(), 0);
        Ok(Self {
            start_paddr,
            frame_count,
            _marker: PhantomData,
        })
    }

    pub fn alloc_zero(frame_count: usize) -> Result<Self> {
        let mut frames = Self::alloc(frame_count)?;
        frames.fill(0);
        Ok(frames)
    }

    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn size(&self) -> usize {
        PAGE_SIZE * self.frame_count
    }

    pub fn start_vaddr(&self) -> HostVirtAddr {
        H::phys_to_virt(self.start_paddr)
    }

    /// First virtual address past the block.
    pub fn end_vaddr(&self) -> HostVirtAddr {
        self.start_vaddr() + self.size()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.start_vaddr().as_mut_ptr()
    }

    pub fn fill(&mut self, byte: u8) {
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), byte, self.size()) }
    }
}

impl<H: MmHal> Drop for ContiguousPhysFrames<H> {
    fn drop(&mut self) {
        H::dealloc_contiguous_frames(self.start_paddr, self.frame_count);
        debug!(
            "[tvisor] deallocated ContiguousPhysFrames({:#x}, {} frames)",
            self.start_paddr, self.frame_count
        );
    }
}
