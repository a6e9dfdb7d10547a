// Copyright © 2024 The Kestrel Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! KVM implementation of the hypervisor traits.

use crate::cpu::{self, Vcpu, VmExit};
use crate::hypervisor::{self, Hypervisor, HypervisorError};
use crate::vm::{self, IoEventAddress, MsiMessage, UserMemoryRegion, Vm};
use crate::vec_with_array_field;

pub use kvm_bindings;

use kvm_bindings::{
    kvm_fpu, kvm_irq_routing, kvm_irq_routing_entry, kvm_lapic_state, kvm_mp_state, kvm_msi,
    kvm_msr_entry, kvm_pit_config, kvm_regs, kvm_sregs, kvm_userspace_memory_region, CpuId, Msrs,
    KVM_API_VERSION, KVM_MAX_CPUID_ENTRIES,
};
use kvm_ioctls::{Kvm, NoDatamatch, VcpuExit, VcpuFd, VmFd};
use std::sync::Arc;
use vmm_sys_util::eventfd::EventFd;

/// Wrapper over KVM system ioctls.
pub struct KvmHypervisor {
    kvm: Kvm,
}

impl KvmHypervisor {
    /// Opens `/dev/kvm` and checks the API revision.
    pub fn new() -> hypervisor::Result<Self> {
        let kvm = Kvm::new().map_err(|e| HypervisorError::HypervisorCreate(e.into()))?;

        let api_version = kvm.get_api_version();
        if api_version != KVM_API_VERSION as i32 {
            return Err(HypervisorError::IncompatibleApiVersion(
                api_version,
                KVM_API_VERSION as i32,
            ));
        }

        Ok(KvmHypervisor { kvm })
    }
}

impl Hypervisor for KvmHypervisor {
    fn create_vm(&self) -> hypervisor::Result<Arc<dyn Vm>> {
        let fd = self
            .kvm
            .create_vm()
            .map_err(|e| HypervisorError::VmCreate(e.into()))?;

        Ok(Arc::new(KvmVm { fd }))
    }

    fn get_vcpu_mmap_size(&self) -> hypervisor::Result<usize> {
        self.kvm
            .get_vcpu_mmap_size()
            .map_err(|e| HypervisorError::GetVcpuMmapSize(e.into()))
    }

    fn get_supported_cpuid(&self) -> hypervisor::Result<CpuId> {
        self.kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES as usize)
            .map_err(|e| HypervisorError::GetSupportedCpuid(e.into()))
    }
}

/// Wrapper over KVM VM ioctls.
pub struct KvmVm {
    fd: VmFd,
}

impl Vm for KvmVm {
    fn create_vcpu(&self, id: u8) -> vm::Result<Box<dyn Vcpu>> {
        let fd = self
            .fd
            .create_vcpu(id as u64)
            .map_err(|e| vm::HypervisorVmError::CreateVcpu(e.into()))?;

        Ok(Box::new(KvmVcpu { fd }))
    }

    fn set_identity_map_address(&self, address: u64) -> vm::Result<()> {
        self.fd
            .set_identity_map_address(address)
            .map_err(|e| vm::HypervisorVmError::SetIdentityMapAddress(e.into()))
    }

    fn set_tss_address(&self, offset: usize) -> vm::Result<()> {
        self.fd
            .set_tss_address(offset)
            .map_err(|e| vm::HypervisorVmError::SetTssAddress(e.into()))
    }

    fn create_irq_chip(&self) -> vm::Result<()> {
        self.fd
            .create_irq_chip()
            .map_err(|e| vm::HypervisorVmError::CreateIrqChip(e.into()))
    }

    fn create_pit(&self) -> vm::Result<()> {
        let pit_config = kvm_pit_config::default();
        self.fd
            .create_pit2(pit_config)
            .map_err(|e| vm::HypervisorVmError::CreatePit(e.into()))
    }

    fn set_user_memory_region(&self, region: UserMemoryRegion) -> vm::Result<()> {
        let region = kvm_userspace_memory_region {
            slot: region.slot,
            guest_phys_addr: region.guest_phys_addr,
            memory_size: region.memory_size,
            userspace_addr: region.userspace_addr,
            flags: 0,
        };
        // SAFETY: the caller owns the backing mapping for the whole
        // lifetime of the slot.
        unsafe { self.fd.set_user_memory_region(region) }
            .map_err(|e| vm::HypervisorVmError::SetUserMemory(e.into()))
    }

    fn register_ioevent(
        &self,
        fd: &EventFd,
        addr: &IoEventAddress,
        len: u32,
        datamatch: u64,
    ) -> vm::Result<()> {
        let addr = kvm_ioctls::IoEventAddress::from(*addr);
        // The kernel derives the match width from the registered
        // length, so dispatch on it here.
        match len {
            0 => self.fd.register_ioevent(fd, &addr, NoDatamatch),
            1 => self.fd.register_ioevent(fd, &addr, datamatch as u8),
            2 => self.fd.register_ioevent(fd, &addr, datamatch as u16),
            4 => self.fd.register_ioevent(fd, &addr, datamatch as u32),
            8 => self.fd.register_ioevent(fd, &addr, datamatch),
            _ => return Err(vm::HypervisorVmError::InvalidIoEventLength(len)),
        }
        .map_err(|e| vm::HypervisorVmError::RegisterIoEvent(e.into()))
    }

    fn unregister_ioevent(
        &self,
        fd: &EventFd,
        addr: &IoEventAddress,
        len: u32,
        datamatch: u64,
    ) -> vm::Result<()> {
        let addr = kvm_ioctls::IoEventAddress::from(*addr);
        match len {
            0 => self.fd.unregister_ioevent(fd, &addr, NoDatamatch),
            1 => self.fd.unregister_ioevent(fd, &addr, datamatch as u8),
            2 => self.fd.unregister_ioevent(fd, &addr, datamatch as u16),
            4 => self.fd.unregister_ioevent(fd, &addr, datamatch as u32),
            8 => self.fd.unregister_ioevent(fd, &addr, datamatch),
            _ => return Err(vm::HypervisorVmError::InvalidIoEventLength(len)),
        }
        .map_err(|e| vm::HypervisorVmError::UnregisterIoEvent(e.into()))
    }

    fn register_irqfd(&self, fd: &EventFd, gsi: u32) -> vm::Result<()> {
        self.fd
            .register_irqfd(fd, gsi)
            .map_err(|e| vm::HypervisorVmError::RegisterIrqFd(e.into()))
    }

    fn unregister_irqfd(&self, fd: &EventFd, gsi: u32) -> vm::Result<()> {
        self.fd
            .unregister_irqfd(fd, gsi)
            .map_err(|e| vm::HypervisorVmError::UnregisterIrqFd(e.into()))
    }

    fn set_gsi_routing(&self, entries: &[kvm_irq_routing_entry]) -> vm::Result<()> {
        let mut irq_routing =
            vec_with_array_field::<kvm_irq_routing, kvm_irq_routing_entry>(entries.len());
        irq_routing[0].nr = entries.len() as u32;
        irq_routing[0].flags = 0;

        // SAFETY: irq_routing is sized for entries.len() trailing
        // elements by construction.
        unsafe {
            let routing_entries: &mut [kvm_irq_routing_entry] =
                irq_routing[0].entries.as_mut_slice(entries.len());
            routing_entries.copy_from_slice(entries);
        }

        self.fd
            .set_gsi_routing(&irq_routing[0])
            .map_err(|e| vm::HypervisorVmError::SetGsiRouting(e.into()))
    }

    fn set_irq_line(&self, irq: u32, active: bool) -> vm::Result<()> {
        self.fd
            .set_irq_line(irq, active)
            .map_err(|e| vm::HypervisorVmError::IrqLine(e.into()))
    }

    fn signal_msi(&self, msi: MsiMessage) -> vm::Result<()> {
        let msi = kvm_msi {
            address_lo: msi.address_lo,
            address_hi: msi.address_hi,
            data: msi.data,
            ..Default::default()
        };
        self.fd
            .signal_msi(msi)
            .map(|_| ())
            .map_err(|e| vm::HypervisorVmError::SignalMsi(e.into()))
    }
}

impl From<IoEventAddress> for kvm_ioctls::IoEventAddress {
    fn from(addr: IoEventAddress) -> Self {
        match addr {
            IoEventAddress::Pio(p) => kvm_ioctls::IoEventAddress::Pio(p),
            IoEventAddress::Mmio(m) => kvm_ioctls::IoEventAddress::Mmio(m),
        }
    }
}

/// Wrapper over KVM vCPU ioctls.
pub struct KvmVcpu {
    fd: VcpuFd,
}

impl Vcpu for KvmVcpu {
    fn run(&mut self) -> cpu::Result<VmExit<'_>> {
        match self.fd.run() {
            Ok(exit) => match exit {
                VcpuExit::IoOut(port, data) => Ok(VmExit::IoOut(port, data)),
                VcpuExit::IoIn(port, data) => Ok(VmExit::IoIn(port, data)),
                VcpuExit::MmioWrite(addr, data) => Ok(VmExit::MmioWrite(addr, data)),
                VcpuExit::MmioRead(addr, data) => Ok(VmExit::MmioRead(addr, data)),
                VcpuExit::Intr => Ok(VmExit::Interrupted),
                VcpuExit::Hlt => Ok(VmExit::Hlt),
                VcpuExit::Shutdown | VcpuExit::SystemEvent(_, _) => Ok(VmExit::Shutdown),
                VcpuExit::FailEntry(reason, _) => Ok(VmExit::FailEntry(reason)),
                VcpuExit::InternalError => Ok(VmExit::InternalError),
                VcpuExit::IrqWindowOpen => Ok(VmExit::Ignore),
                r => Err(cpu::HypervisorCpuError::RunVcpu(anyhow::anyhow!(
                    "Unexpected exit reason on vcpu run: {:?}",
                    r
                ))),
            },
            Err(e) => match e.errno() {
                // A kick signal landed while entering or inside the
                // guest. The caller drains its queue and re-enters.
                libc::EINTR | libc::EAGAIN => Ok(VmExit::Interrupted),
                _ => Err(cpu::HypervisorCpuError::RunVcpu(e.into())),
            },
        }
    }

    fn get_regs(&self) -> cpu::Result<kvm_regs> {
        self.fd
            .get_regs()
            .map_err(|e| cpu::HypervisorCpuError::GetRegs(e.into()))
    }

    fn set_regs(&mut self, regs: &kvm_regs) -> cpu::Result<()> {
        self.fd
            .set_regs(regs)
            .map_err(|e| cpu::HypervisorCpuError::SetRegs(e.into()))
    }

    fn get_sregs(&self) -> cpu::Result<kvm_sregs> {
        self.fd
            .get_sregs()
            .map_err(|e| cpu::HypervisorCpuError::GetSregs(e.into()))
    }

    fn set_sregs(&mut self, sregs: &kvm_sregs) -> cpu::Result<()> {
        self.fd
            .set_sregs(sregs)
            .map_err(|e| cpu::HypervisorCpuError::SetSregs(e.into()))
    }

    fn set_fpu(&mut self, fpu: &kvm_fpu) -> cpu::Result<()> {
        self.fd
            .set_fpu(fpu)
            .map_err(|e| cpu::HypervisorCpuError::SetFpu(e.into()))
    }

    fn get_lapic(&self) -> cpu::Result<kvm_lapic_state> {
        self.fd
            .get_lapic()
            .map_err(|e| cpu::HypervisorCpuError::GetLapic(e.into()))
    }

    fn set_lapic(&mut self, lapic: &kvm_lapic_state) -> cpu::Result<()> {
        self.fd
            .set_lapic(lapic)
            .map_err(|e| cpu::HypervisorCpuError::SetLapic(e.into()))
    }

    fn set_msrs(&mut self, msrs: &[kvm_msr_entry]) -> cpu::Result<()> {
        let msrs = Msrs::from_entries(msrs)
            .map_err(|e| cpu::HypervisorCpuError::SetMsrs(anyhow::anyhow!("{:?}", e)))?;
        self.fd
            .set_msrs(&msrs)
            .map(|_| ())
            .map_err(|e| cpu::HypervisorCpuError::SetMsrs(e.into()))
    }

    fn set_cpuid(&mut self, cpuid: &CpuId) -> cpu::Result<()> {
        self.fd
            .set_cpuid2(cpuid)
            .map_err(|e| cpu::HypervisorCpuError::SetCpuid(e.into()))
    }

    fn set_mp_state(&mut self, mp_state: kvm_mp_state) -> cpu::Result<()> {
        self.fd
            .set_mp_state(mp_state)
            .map_err(|e| cpu::HypervisorCpuError::SetMpState(e.into()))
    }
}
