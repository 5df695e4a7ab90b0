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

//! Extended page tables backing a fixed amount of guest memory.
//!
//! The tree is built eagerly: every guest page is allocated up front and mapped
//! 4 KiB at a time, starting at guest-physical address zero. Each entry the
//! builder fills carries [`EptFlags::USED`], and teardown frees exactly the
//! frames reachable through used entries.

use core::fmt;
use core::marker::PhantomData;

use bit_field::BitField;
use bitflags::bitflags;
use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

use crate::frame::PhysFrame;
use crate::hal::{HostPhysAddr, MmHal};
use crate::{Result, VmxError};

memory_addr::def_usize_addr! {
    /// Guest physical address.
    pub type GuestPhysAddr;
}

memory_addr::def_usize_addr_formatter! {
    GuestPhysAddr = "GPA:{}";
}

/// Entries per paging structure.
pub const ENTRY_COUNT: usize = 512;

const LEVELS: usize = 4;
const MIB: u64 = 1 << 20;
const PAGES_PER_MIB: u64 = MIB / PAGE_SIZE as u64;
const PHYS_ADDR_MASK: u64 = 0x0000_ffff_ffff_f000; // bits 12..48

bitflags! {
    /// EPT paging-structure entry bits. (SDM Vol. 3C, Section 29.3.2)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EptFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// EPT memory type, leaf entries only.
        const MEM_TYPE_MASK = 0b111 << 3;
        const IGNORE_PAT = 1 << 6;
        const HUGE_PAGE = 1 << 7;
        const ACCESSED = 1 << 8;
        const DIRTY = 1 << 9;
        const EXECUTE_FOR_USER = 1 << 10;
        /// Software-available bit marking an entry the builder filled in.
        const USED = 1 << 11;
    }
}

/// Memory types an EPT leaf or EPT pointer can name. (SDM Vol. 3C, Section 29.3.7)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EptMemType {
    Uncached = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
}

/// Typed view of an entry's ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySlot {
    Empty,
    /// The entry owns the frame at this address: a child table or, at the last
    /// level, a guest page.
    Owned(HostPhysAddr),
}

/// One 8-byte EPT paging-structure entry.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct EptEntry(u64);

impl EptEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn flags(self) -> EptFlags {
        EptFlags::from_bits_truncate(self.0)
    }

    /// The frame address field. Input bits outside 12..48 are dropped on write.
    pub fn addr(self) -> HostPhysAddr {
        HostPhysAddr::from_usize((self.0 & PHYS_ADDR_MASK) as usize)
    }

    pub fn mem_type(self) -> u8 {
        self.0.get_bits(3..6) as u8
    }

    pub fn is_used(self) -> bool {
        self.flags().contains(EptFlags::USED)
    }

    pub fn slot(self) -> EntrySlot {
        if self.is_used() {
            EntrySlot::Owned(self.addr())
        } else {
            EntrySlot::Empty
        }
    }

    fn set(&mut self, paddr: HostPhysAddr, flags: EptFlags) {
        self.0 = (paddr.as_usize() as u64 & PHYS_ADDR_MASK) | flags.bits();
    }

    /// Points a non-leaf entry at a child table.
    pub fn set_table(&mut self, paddr: HostPhysAddr) {
        self.set(
            paddr,
            EptFlags::READ | EptFlags::WRITE | EptFlags::EXECUTE | EptFlags::USED,
        );
    }

    /// Maps a 4 KiB guest page with full access and write-back caching.
    pub fn set_page(&mut self, paddr: HostPhysAddr) {
        let mut flags = EptFlags::READ | EptFlags::WRITE | EptFlags::EXECUTE | EptFlags::USED;
        flags.insert(EptFlags::from_bits_retain(
            (EptMemType::WriteBack as u64) << 3,
        ));
        self.set(paddr, flags);
    }
}

impl fmt::Debug for EptEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EptEntry")
            .field("raw", &format_args!("{:#x}", self.0))
            .field("paddr", &self.addr())
            .field("flags", &self.flags())
            .finish()
    }
}

/// The 64-bit EPT pointer written to the VMCS. (SDM Vol. 3C, Section 25.6.11)
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct EptPointer(u64);

impl EptPointer {
    pub fn new(pml4: HostPhysAddr) -> Self {
        let mut bits = pml4.as_usize() as u64 & PHYS_ADDR_MASK;
        bits.set_bits(0..3, EptMemType::WriteBack as u64);
        bits.set_bits(3..6, LEVELS as u64 - 1);
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn mem_type(self) -> u8 {
        self.0.get_bits(0..3) as u8
    }

    /// Page-walk length, i.e. the number of levels.
    pub fn walk_length(self) -> usize {
        self.0.get_bits(3..6) as usize + 1
    }

    pub fn pml4_addr(self) -> HostPhysAddr {
        HostPhysAddr::from_usize((self.0 & PHYS_ADDR_MASK) as usize)
    }
}

impl fmt::Debug for EptPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EptPointer({:#x})", self.0)
    }
}

/// How many entries of each level a tree of a given size populates.
///
/// Each field counts filled entries at that level, which equals the number of
/// tables one level down. A PT entry maps a 4 KiB page, so a full PT covers
/// 2 MiB, a full PD 1 GiB and a full PDPT 512 GiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EptLayout {
    pub pt_entries: u64,
    pub pd_entries: u64,
    pub pdpt_entries: u64,
    pub pml4_entries: u64,
}

impl EptLayout {
    /// Largest size a single PML4 can map, in MiB.
    pub const MAX_SIZE_MIB: u64 = (ENTRY_COUNT as u64).pow(3) * ENTRY_COUNT as u64 / PAGES_PER_MIB;

    pub const fn for_size(size_mib: u64) -> Self {
        let pt_entries = size_mib * PAGES_PER_MIB;
        let pd_entries = pt_entries.div_ceil(ENTRY_COUNT as u64);
        let pdpt_entries = pd_entries.div_ceil(ENTRY_COUNT as u64);
        let pml4_entries = pdpt_entries.div_ceil(ENTRY_COUNT as u64);
        Self {
            pt_entries,
            pd_entries,
            pdpt_entries,
            pml4_entries,
        }
    }

    /// Paging-structure frames, the root included.
    pub const fn table_frames(&self) -> u64 {
        1 + self.pml4_entries + self.pdpt_entries + self.pd_entries
    }

    /// Every frame the tree owns: tables plus guest pages.
    pub const fn total_frames(&self) -> u64 {
        self.table_frames() + self.pt_entries
    }

    /// Entries filled at `level`, 4 being the PML4.
    pub const fn entries_at(&self, level: usize) -> u64 {
        match level {
            4 => self.pml4_entries,
            3 => self.pdpt_entries,
            2 => self.pd_entries,
            1 => self.pt_entries,
            _ => 0,
        }
    }
}

/// Guest pages covered by one entry at `level`.
const fn pages_per_entry(level: usize) -> u64 {
    (ENTRY_COUNT as u64).pow(level as u32 - 1)
}

const fn table_index(gpa: usize, level: usize) -> usize {
    (gpa >> (12 + 9 * (level - 1))) & (ENTRY_COUNT - 1)
}

unsafe fn table_entries<'a, H: MmHal>(paddr: HostPhysAddr) -> &'a mut [EptEntry; ENTRY_COUNT] {
    unsafe { &mut *(H::phys_to_virt(paddr).as_mut_ptr() as *mut [EptEntry; ENTRY_COUNT]) }
}

/// An owned paging structure at `level`, together with everything reachable
/// through its used entries. Dropping it frees the whole subtree, so a build that
/// fails halfway unwinds by dropping whatever it has linked so far.
struct EptTable<H: MmHal> {
    paddr: HostPhysAddr,
    level: usize,
    _marker: PhantomData<H>,
}

impl<H: MmHal> EptTable<H> {
    fn alloc(level: usize) -> Result<Self> {
        let frame = PhysFrame::<H>::alloc_zero()?;
        Ok(Self {
            paddr: frame.into_raw(),
            level,
            _marker: PhantomData,
        })
    }

    /// Builds a table mapping `pages` guest pages from its first entry onward.
    fn build(level: usize, pages: u64) -> Result<Self> {
        let mut table = Self::alloc(level)?;
        let span = pages_per_entry(level);
        let count = pages.div_ceil(span) as usize;
        debug_assert!(count <= ENTRY_COUNT);

        for i in 0..count {
            let child = if level == 1 {
                PhysFrame::<H>::alloc_zero()?.into_raw()
            } else {
                let remaining = pages - i as u64 * span;
                Self::build(level - 1, remaining.min(span))?.into_raw()
            };
            let entry = &mut table.entries_mut()[i];
            if level == 1 {
                entry.set_page(child);
            } else {
                entry.set_table(child);
            }
        }
        Ok(table)
    }

    fn into_raw(self) -> HostPhysAddr {
        let paddr = self.paddr;
        core::mem::forget(self);
        paddr
    }

    fn entries(&self) -> &[EptEntry; ENTRY_COUNT] {
        unsafe { table_entries::<H>(self.paddr) }
    }

    fn entries_mut(&mut self) -> &mut [EptEntry; ENTRY_COUNT] {
        unsafe { table_entries::<H>(self.paddr) }
    }
}

impl<H: MmHal> Drop for EptTable<H> {
    fn drop(&mut self) {
        release_table::<H>(self.paddr, self.level);
    }
}

/// Frees the table at `paddr` and every frame reachable from its used entries.
///
/// Every frame in the tree was handed over with [`PhysFrame::into_raw`], so it
/// is taken back here and released by its own drop.
fn release_table<H: MmHal>(paddr: HostPhysAddr, level: usize) {
    let entries = unsafe { table_entries::<H>(paddr) };
    for entry in entries.iter_mut() {
        if let EntrySlot::Owned(child) = entry.slot() {
            if level == 1 {
                drop(unsafe { PhysFrame::<H>::from_raw(child) });
            } else {
                release_table::<H>(child, level - 1);
            }
            *entry = EptEntry::empty();
        }
    }
    drop(unsafe { PhysFrame::<H>::from_raw(paddr) });
}

/// A fully populated four-level EPT tree.
pub struct EptTree<H: MmHal> {
    root: EptTable<H>,
    size_mib: u64,
}

impl<H: MmHal> EptTree<H> {
    /// Allocates the root and every table and guest page needed for `size_mib`
    /// MiB of guest memory starting at guest-physical zero.
    ///
    /// A size of zero yields a root with no entries. If any allocation fails,
    /// everything allocated so far is released before the error is returned.
    pub fn build(size_mib: u64) -> Result<Self> {
        if size_mib > EptLayout::MAX_SIZE_MIB {
            return Err(VmxError::InvalidVmcsConfig(alloc::format!(
                "EPT size {size_mib} MiB exceeds {} MiB",
                EptLayout::MAX_SIZE_MIB
            )));
        }
        let layout = EptLayout::for_size(size_mib);
        let root = EptTable::build(LEVELS, layout.pt_entries)?;
        debug!(
            "[tvisor] built EPT for {} MiB at {:#x}: {} frames",
            size_mib,
            root.paddr,
            layout.total_frames()
        );
        Ok(Self { root, size_mib })
    }

    pub fn size_mib(&self) -> u64 {
        self.size_mib
    }

    pub fn layout(&self) -> EptLayout {
        EptLayout::for_size(self.size_mib)
    }

    pub fn root_paddr(&self) -> HostPhysAddr {
        self.root.paddr
    }

    pub fn pointer(&self) -> EptPointer {
        EptPointer::new(self.root.paddr)
    }

    /// Counts used entries at each level by walking the tree. Index 0 is the PT level.
    pub fn count_used_entries(&self) -> [u64; LEVELS] {
        fn walk<H: MmHal>(paddr: HostPhysAddr, level: usize, counts: &mut [u64; LEVELS]) {
            for entry in unsafe { table_entries::<H>(paddr) }.iter() {
                if let EntrySlot::Owned(child) = entry.slot() {
                    counts[level - 1] += 1;
                    if level > 1 {
                        walk::<H>(child, level - 1, counts);
                    }
                }
            }
        }
        let mut counts = [0; LEVELS];
        walk::<H>(self.root.paddr, LEVELS, &mut counts);
        counts
    }

    /// Host-physical address backing `gpa`, or `None` outside the mapped range.
    pub fn translate(&self, gpa: GuestPhysAddr) -> Option<HostPhysAddr> {
        let gpa = gpa.as_usize();
        let mut entries = self.root.entries();
        for level in (1..=LEVELS).rev() {
            let entry = entries[table_index(gpa, level)];
            let EntrySlot::Owned(next) = entry.slot() else {
                return None;
            };
            if level == 1 {
                return Some(next + (gpa & (PAGE_SIZE - 1)));
            }
            entries = unsafe { &*table_entries::<H>(next) };
        }
        None
    }

    /// Copies `bytes` into guest memory at `gpa`, crossing page boundaries as needed.
    pub fn write(&self, gpa: GuestPhysAddr, bytes: &[u8]) -> Result {
        let mut gpa = gpa.as_usize();
        let mut rest = bytes;
        while !rest.is_empty() {
            let hpa = self
                .translate(GuestPhysAddr::from_usize(gpa))
                .ok_or(VmxError::BadState("guest address is not backed by EPT"))?;
            let chunk = rest.len().min(PAGE_SIZE - (gpa & (PAGE_SIZE - 1)));
            unsafe {
                core::ptr::copy_nonoverlapping(
                    rest.as_ptr(),
                    H::phys_to_virt(hpa).as_mut_ptr(),
                    chunk,
                );
            }
            gpa += chunk;
            rest = &rest[chunk..];
        }
        Ok(())
    }

    /// Releases the tree. Dropping it has the same effect.
    pub fn destroy(self) {
        debug!("[tvisor] destroying EPT at {:#x}", self.root.paddr);
    }
}

impl<H: MmHal> fmt::Debug for EptTree<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EptTree")
            .field("root", &self.root.paddr)
            .field("size_mib", &self.size_mib)
            .finish()
    }
}
