// Copyright © 2024 The Kestrel Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use crate::cpu::Vcpu;
use kvm_bindings::kvm_irq_routing_entry;
use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

///
/// An address an ioeventfd can be armed on, in one of the two guest
/// I/O address spaces.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEventAddress {
    /// Representation of an port I/O address.
    Pio(u64),
    /// Representation of a memory mapped I/O address.
    Mmio(u64),
}

///
/// A guest physical memory slot handed to the kernel. `userspace_addr`
/// of zero with `memory_size` zero removes the slot.
///
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserMemoryRegion {
    pub slot: u32,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

///
/// A message-signalled interrupt payload.
///
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsiMessage {
    pub address_lo: u32,
    pub address_hi: u32,
    pub data: u32,
}

impl MsiMessage {
    pub fn new(address: u64, data: u32) -> Self {
        MsiMessage {
            address_lo: address as u32,
            address_hi: (address >> 32) as u32,
            data,
        }
    }
}

#[derive(Error, Debug)]
///
/// Enum for VM error
///
pub enum HypervisorVmError {
    ///
    /// Create Vcpu error
    ///
    #[error("Failed to create Vcpu: {0}")]
    CreateVcpu(#[source] anyhow::Error),
    ///
    /// Identity map address error
    ///
    #[error("Failed to set identity map address: {0}")]
    SetIdentityMapAddress(#[source] anyhow::Error),
    ///
    /// TSS address error
    ///
    #[error("Failed to set TSS address: {0}")]
    SetTssAddress(#[source] anyhow::Error),
    ///
    /// Create interrupt controller error
    ///
    #[error("Failed to create interrupt controller: {0}")]
    CreateIrqChip(#[source] anyhow::Error),
    ///
    /// Create PIT error
    ///
    #[error("Failed to create PIT: {0}")]
    CreatePit(#[source] anyhow::Error),
    ///
    /// Register interrupt event error
    ///
    #[error("Failed to register irq fd: {0}")]
    RegisterIrqFd(#[source] anyhow::Error),
    ///
    /// Unregister interrupt event error
    ///
    #[error("Failed to unregister irq fd: {0}")]
    UnregisterIrqFd(#[source] anyhow::Error),
    ///
    /// Register IO event error
    ///
    #[error("Failed to register IO event: {0}")]
    RegisterIoEvent(#[source] anyhow::Error),
    ///
    /// Unregister IO event error
    ///
    #[error("Failed to unregister IO event: {0}")]
    UnregisterIoEvent(#[source] anyhow::Error),
    ///
    /// Invalid ioeventfd length, only 0/1/2/4/8 have a kernel match width
    ///
    #[error("Invalid IO event length: {0}")]
    InvalidIoEventLength(u32),
    ///
    /// Set GSI routing error
    ///
    #[error("Failed to set GSI routing: {0}")]
    SetGsiRouting(#[source] anyhow::Error),
    ///
    /// Set user memory region error
    ///
    #[error("Failed to set user memory region: {0}")]
    SetUserMemory(#[source] anyhow::Error),
    ///
    /// Assert IRQ line error
    ///
    #[error("Failed to set irq line: {0}")]
    IrqLine(#[source] anyhow::Error),
    ///
    /// Signal MSI error
    ///
    #[error("Failed to signal MSI: {0}")]
    SignalMsi(#[source] anyhow::Error),
}

///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, HypervisorVmError>;

///
/// Trait to represent a VM fd. Object safe so the VMM can be driven
/// against a test double.
///
pub trait Vm: Send + Sync {
    ///
    /// Creates a vCPU with the given index.
    ///
    fn create_vcpu(&self, id: u8) -> Result<Box<dyn Vcpu>>;
    ///
    /// Sets the address of the one-page EPT identity map.
    ///
    fn set_identity_map_address(&self, address: u64) -> Result<()>;
    ///
    /// Sets the address of the three-page TSS region.
    ///
    fn set_tss_address(&self, offset: usize) -> Result<()>;
    ///
    /// Creates the in-kernel interrupt controller (PIC pair + IOAPIC).
    ///
    fn create_irq_chip(&self) -> Result<()>;
    ///
    /// Creates the in-kernel PIT.
    ///
    fn create_pit(&self) -> Result<()>;
    ///
    /// Installs, replaces or removes a guest physical memory slot.
    ///
    fn set_user_memory_region(&self, region: UserMemoryRegion) -> Result<()>;
    ///
    /// Arms an ioeventfd on a guest I/O address. A `len` of zero means
    /// any access width and no datamatch.
    ///
    fn register_ioevent(
        &self,
        fd: &EventFd,
        addr: &IoEventAddress,
        len: u32,
        datamatch: u64,
    ) -> Result<()>;
    ///
    /// Disarms a previously registered ioeventfd.
    ///
    fn unregister_ioevent(
        &self,
        fd: &EventFd,
        addr: &IoEventAddress,
        len: u32,
        datamatch: u64,
    ) -> Result<()>;
    ///
    /// Binds an eventfd to a GSI so signalling the fd raises the
    /// interrupt without a trip through userspace.
    ///
    fn register_irqfd(&self, fd: &EventFd, gsi: u32) -> Result<()>;
    ///
    /// Removes an eventfd to GSI binding.
    ///
    fn unregister_irqfd(&self, fd: &EventFd, gsi: u32) -> Result<()>;
    ///
    /// Replaces the whole GSI routing table. There is no incremental
    /// update and no read back.
    ///
    fn set_gsi_routing(&self, entries: &[kvm_irq_routing_entry]) -> Result<()>;
    ///
    /// Asserts or deasserts an interrupt line.
    ///
    fn set_irq_line(&self, irq: u32, active: bool) -> Result<()>;
    ///
    /// Delivers a one-shot message-signalled interrupt.
    ///
    fn signal_msi(&self, msi: MsiMessage) -> Result<()>;
}
