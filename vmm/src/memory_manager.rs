// Copyright © 2024 The Kestrel Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Guest physical address space management.
//!
//! The memory manager owns the region table: non-overlapping RAM/ROM
//! regions backed by host mmap allocations and installed as kernel
//! memory slots, plus Device and Reserved markers that carry no
//! backing at all. The absence of a slot is what makes an access trap
//! back to the VMM.

use hypervisor::{UserMemoryRegion, Vm};
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use vm_memory::mmap::MmapRegion;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Region {name} [{base:#x}, {base:#x}+{length:#x}) overlaps {other}")]
    AddressOverlap {
        name: String,
        base: u64,
        length: u64,
        other: String,
    },

    #[error("Region {0} is not aligned to the host page size")]
    Unaligned(String),

    #[error("Region {0} has no backing memory")]
    MissingBacking(String),

    #[error("Region {0} backing is smaller than the region")]
    BackingTooSmall(String),

    #[error("Region {0} is not mapped")]
    NotMapped(String),

    #[error("Failed to allocate guest RAM: {0}")]
    AllocateRam(#[source] vm_memory::mmap::MmapRegionError),

    #[error("Failed to update kernel memory slot: {0}")]
    SetUserMemoryRegion(#[source] hypervisor::HypervisorVmError),
}

pub type Result<T> = std::result::Result<T, Error>;

pub fn host_page_size() -> u64 {
    // SAFETY: trivially safe, no pointers involved.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    Ram,
    Rom,
    Device,
    Reserved,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            MemoryKind::Ram => "ram",
            MemoryKind::Rom => "rom",
            MemoryKind::Device => "device",
            MemoryKind::Reserved => "reserved",
        };
        f.pad(s)
    }
}

/// Host memory standing behind a RAM/ROM region. Two regions may
/// share one allocation at different guest addresses (the firmware
/// image does exactly that).
#[derive(Clone, Debug)]
pub struct MemoryBacking {
    pub mmap: Arc<MmapRegion>,
    pub offset: usize,
}

impl MemoryBacking {
    pub fn host_address(&self) -> *mut u8 {
        // SAFETY: offset is validated against the mmap size when the
        // region is mapped.
        unsafe { self.mmap.as_ptr().add(self.offset) }
    }
}

/// One entry of the guest physical address space.
#[derive(Debug)]
pub struct MemoryRegion {
    base: u64,
    length: u64,
    backing: Option<MemoryBacking>,
    kind: MemoryKind,
    name: String,
    slot: Option<u32>,
}

impl MemoryRegion {
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backing(&self) -> Option<&MemoryBacking> {
        self.backing.as_ref()
    }

    fn contains(&self, gpa: u64) -> bool {
        gpa >= self.base && gpa < self.base + self.length
    }

    fn overlaps(&self, base: u64, length: u64) -> bool {
        self.base < base + length && base < self.base + self.length
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:<8} {:#018x}-{:#018x} {}",
            self.kind,
            self.base,
            self.base + self.length,
            self.name
        )
    }
}

struct MemoryManagerState {
    regions: Vec<Arc<MemoryRegion>>,
    next_slot: u32,
    free_slots: Vec<u32>,
}

pub struct MemoryManager {
    vm: Arc<dyn Vm>,
    state: RwLock<MemoryManagerState>,
}

impl MemoryManager {
    pub fn new(vm: Arc<dyn Vm>) -> Self {
        MemoryManager {
            vm,
            state: RwLock::new(MemoryManagerState {
                regions: Vec::new(),
                next_slot: 0,
                free_slots: Vec::new(),
            }),
        }
    }

    /// Allocates an anonymous host mapping suitable for backing guest
    /// RAM.
    pub fn allocate_backing(&self, size: usize) -> Result<Arc<MmapRegion>> {
        Ok(Arc::new(MmapRegion::new(size).map_err(Error::AllocateRam)?))
    }

    /// Installs a region in the guest physical address space.
    ///
    /// RAM/ROM regions get a fresh kernel slot; Device and Reserved
    /// regions only occupy the table. Mapping a Device region over RAM
    /// is allowed, RAM over RAM is a configuration bug.
    pub fn map(
        &self,
        base: u64,
        length: u64,
        backing: Option<MemoryBacking>,
        kind: MemoryKind,
        name: &str,
    ) -> Result<Arc<MemoryRegion>> {
        if length == 0 {
            return Err(Error::Unaligned(name.to_string()));
        }

        let mut state = self.state.write().unwrap();

        let slot = match kind {
            MemoryKind::Ram | MemoryKind::Rom => {
                // Kernel slots are page granular; trap-only regions
                // may cover arbitrary windows.
                let page_size = host_page_size();
                if base % page_size != 0 || length % page_size != 0 {
                    return Err(Error::Unaligned(name.to_string()));
                }
                let backing = backing.as_ref().ok_or_else(|| {
                    Error::MissingBacking(name.to_string())
                })?;
                if (backing.mmap.size() - backing.offset) < length as usize {
                    return Err(Error::BackingTooSmall(name.to_string()));
                }
                if let Some(other) = state.regions.iter().find(|r| {
                    matches!(r.kind, MemoryKind::Ram | MemoryKind::Rom)
                        && r.overlaps(base, length)
                }) {
                    return Err(Error::AddressOverlap {
                        name: name.to_string(),
                        base,
                        length,
                        other: other.name.clone(),
                    });
                }

                let slot = state.free_slots.pop().unwrap_or_else(|| {
                    let slot = state.next_slot;
                    state.next_slot += 1;
                    slot
                });
                self.vm
                    .set_user_memory_region(UserMemoryRegion {
                        slot,
                        guest_phys_addr: base,
                        memory_size: length,
                        userspace_addr: backing.host_address() as u64,
                    })
                    .map_err(Error::SetUserMemoryRegion)?;
                Some(slot)
            }
            MemoryKind::Device | MemoryKind::Reserved => None,
        };

        let region = Arc::new(MemoryRegion {
            base,
            length,
            backing,
            kind,
            name: name.to_string(),
            slot,
        });
        state.regions.push(region.clone());

        Ok(region)
    }

    /// Detaches a region. RAM/ROM slots are released back to the
    /// kernel and their slot id becomes reusable.
    pub fn unmap(&self, region: &Arc<MemoryRegion>) -> Result<()> {
        let mut state = self.state.write().unwrap();

        let index = state
            .regions
            .iter()
            .position(|r| Arc::ptr_eq(r, region))
            .ok_or_else(|| Error::NotMapped(region.name.clone()))?;
        state.regions.remove(index);

        if let Some(slot) = region.slot {
            self.vm
                .set_user_memory_region(UserMemoryRegion {
                    slot,
                    guest_phys_addr: region.base,
                    memory_size: 0,
                    userspace_addr: 0,
                })
                .map_err(Error::SetUserMemoryRegion)?;
            state.free_slots.push(slot);
        }

        Ok(())
    }

    /// Translates a guest physical address to a host pointer, or None
    /// if nothing backs it.
    pub fn guest_to_host(&self, gpa: u64) -> Option<*mut u8> {
        let state = self.state.read().unwrap();
        state
            .regions
            .iter()
            .find(|r| {
                matches!(r.kind, MemoryKind::Ram | MemoryKind::Rom) && r.contains(gpa)
            })
            .map(|r| {
                let backing = r.backing.as_ref().unwrap();
                // SAFETY: the offset is within the backing by the
                // contains() check and the map-time size validation.
                unsafe { backing.host_address().add((gpa - r.base) as usize) }
            })
    }

    /// A point-in-time copy of the region table, for debugging.
    pub fn regions(&self) -> Vec<Arc<MemoryRegion>> {
        self.state.read().unwrap().regions.clone()
    }
}

impl fmt::Display for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for region in self.regions() {
            writeln!(f, "{}", region)?;
        }
        Ok(())
    }
}
