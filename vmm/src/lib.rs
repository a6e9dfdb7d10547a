// Copyright © 2024 The Kestrel Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The kestrel virtual machine monitor.
//!
//! A Q35-class machine on top of the KVM interface: guest physical
//! memory management, a device dispatch fabric for trapped and
//! fast-path I/O, per-CPU run loops and a dedicated asynchronous I/O
//! thread, all assembled and owned by the [`Machine`].

pub mod config;
pub mod cpu;
pub mod device;
pub mod device_manager;
pub mod disk_image;
pub mod io_thread;
pub mod memory_manager;
pub mod vm;

pub use vm::{Error, Machine};

#[cfg(test)]
pub(crate) mod testing {
    //! Recording doubles for the hypervisor traits, so the VMM logic
    //! is testable without `/dev/kvm`.

    use hypervisor::kvm::kvm_bindings::{
        kvm_cpuid_entry2, kvm_fpu, kvm_irq_routing_entry, kvm_lapic_state, kvm_mp_state,
        kvm_msr_entry, kvm_regs, kvm_sregs, CpuId,
    };
    use hypervisor::vm as hv_vm;
    use hypervisor::{
        Hypervisor, HypervisorCpuError, HypervisorError, IoEventAddress, MsiMessage,
        UserMemoryRegion, Vcpu, Vm, VmExit,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use vmm_sys_util::eventfd::EventFd;

    type CpuResult<T> = std::result::Result<T, HypervisorCpuError>;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IoEventRecord {
        pub addr: IoEventAddress,
        pub len: u32,
        pub datamatch: u64,
        pub assigned: bool,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IrqFdRecord {
        pub gsi: u32,
        pub assigned: bool,
    }

    #[derive(Default)]
    pub struct MockVm {
        slots: Mutex<Vec<UserMemoryRegion>>,
        ioevents: Mutex<Vec<IoEventRecord>>,
        irqfds: Mutex<Vec<IrqFdRecord>>,
        gsi_tables: Mutex<Vec<Vec<kvm_irq_routing_entry>>>,
        irq_lines: Mutex<Vec<(u32, bool)>>,
        msis: Mutex<Vec<MsiMessage>>,
        identity_map: Mutex<Option<u64>>,
        tss: Mutex<Option<usize>>,
        irq_chip: AtomicBool,
        pit: AtomicBool,
    }

    impl MockVm {
        pub fn memory_slots(&self) -> Vec<UserMemoryRegion> {
            self.slots.lock().unwrap().clone()
        }

        pub fn ioevent_records(&self) -> Vec<IoEventRecord> {
            self.ioevents.lock().unwrap().clone()
        }

        pub fn irqfd_records(&self) -> Vec<IrqFdRecord> {
            self.irqfds.lock().unwrap().clone()
        }

        pub fn last_gsi_table(&self) -> Vec<kvm_irq_routing_entry> {
            self.gsi_tables.lock().unwrap().last().cloned().unwrap_or_default()
        }

        pub fn msi_signals(&self) -> Vec<MsiMessage> {
            self.msis.lock().unwrap().clone()
        }

        pub fn irq_lines(&self) -> Vec<(u32, bool)> {
            self.irq_lines.lock().unwrap().clone()
        }

        pub fn identity_map_address(&self) -> Option<u64> {
            *self.identity_map.lock().unwrap()
        }

        pub fn tss_address(&self) -> Option<usize> {
            *self.tss.lock().unwrap()
        }

        pub fn irq_chip_created(&self) -> bool {
            self.irq_chip.load(Ordering::SeqCst)
        }

        pub fn pit_created(&self) -> bool {
            self.pit.load(Ordering::SeqCst)
        }
    }

    impl Vm for MockVm {
        fn create_vcpu(&self, _id: u8) -> hv_vm::Result<Box<dyn Vcpu>> {
            Ok(Box::new(MockVcpu::default()))
        }

        fn set_identity_map_address(&self, address: u64) -> hv_vm::Result<()> {
            *self.identity_map.lock().unwrap() = Some(address);
            Ok(())
        }

        fn set_tss_address(&self, offset: usize) -> hv_vm::Result<()> {
            *self.tss.lock().unwrap() = Some(offset);
            Ok(())
        }

        fn create_irq_chip(&self) -> hv_vm::Result<()> {
            self.irq_chip.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn create_pit(&self) -> hv_vm::Result<()> {
            self.pit.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn set_user_memory_region(&self, region: UserMemoryRegion) -> hv_vm::Result<()> {
            self.slots.lock().unwrap().push(region);
            Ok(())
        }

        fn register_ioevent(
            &self,
            _fd: &EventFd,
            addr: &IoEventAddress,
            len: u32,
            datamatch: u64,
        ) -> hv_vm::Result<()> {
            self.ioevents.lock().unwrap().push(IoEventRecord {
                addr: *addr,
                len,
                datamatch,
                assigned: true,
            });
            Ok(())
        }

        fn unregister_ioevent(
            &self,
            _fd: &EventFd,
            addr: &IoEventAddress,
            len: u32,
            datamatch: u64,
        ) -> hv_vm::Result<()> {
            self.ioevents.lock().unwrap().push(IoEventRecord {
                addr: *addr,
                len,
                datamatch,
                assigned: false,
            });
            Ok(())
        }

        fn register_irqfd(&self, _fd: &EventFd, gsi: u32) -> hv_vm::Result<()> {
            self.irqfds.lock().unwrap().push(IrqFdRecord {
                gsi,
                assigned: true,
            });
            Ok(())
        }

        fn unregister_irqfd(&self, _fd: &EventFd, gsi: u32) -> hv_vm::Result<()> {
            self.irqfds.lock().unwrap().push(IrqFdRecord {
                gsi,
                assigned: false,
            });
            Ok(())
        }

        fn set_gsi_routing(&self, entries: &[kvm_irq_routing_entry]) -> hv_vm::Result<()> {
            self.gsi_tables.lock().unwrap().push(entries.to_vec());
            Ok(())
        }

        fn set_irq_line(&self, irq: u32, active: bool) -> hv_vm::Result<()> {
            self.irq_lines.lock().unwrap().push((irq, active));
            Ok(())
        }

        fn signal_msi(&self, msi: MsiMessage) -> hv_vm::Result<()> {
            self.msis.lock().unwrap().push(msi);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MockVcpu {
        pub regs: Option<kvm_regs>,
        pub sregs: Option<kvm_sregs>,
        pub fpu: Option<kvm_fpu>,
        pub lapic: Option<kvm_lapic_state>,
        pub msrs: Vec<kvm_msr_entry>,
        pub cpuid: Option<CpuId>,
        pub mp_state: Option<kvm_mp_state>,
    }

    impl Vcpu for MockVcpu {
        fn run(&mut self) -> CpuResult<VmExit<'_>> {
            Ok(VmExit::Shutdown)
        }

        fn get_regs(&self) -> CpuResult<kvm_regs> {
            Ok(self.regs.unwrap_or_default())
        }

        fn set_regs(&mut self, regs: &kvm_regs) -> CpuResult<()> {
            self.regs = Some(*regs);
            Ok(())
        }

        fn get_sregs(&self) -> CpuResult<kvm_sregs> {
            Ok(self.sregs.unwrap_or_default())
        }

        fn set_sregs(&mut self, sregs: &kvm_sregs) -> CpuResult<()> {
            self.sregs = Some(*sregs);
            Ok(())
        }

        fn set_fpu(&mut self, fpu: &kvm_fpu) -> CpuResult<()> {
            self.fpu = Some(*fpu);
            Ok(())
        }

        fn get_lapic(&self) -> CpuResult<kvm_lapic_state> {
            Ok(self.lapic.unwrap_or_default())
        }

        fn set_lapic(&mut self, lapic: &kvm_lapic_state) -> CpuResult<()> {
            self.lapic = Some(*lapic);
            Ok(())
        }

        fn set_msrs(&mut self, msrs: &[kvm_msr_entry]) -> CpuResult<()> {
            self.msrs = msrs.to_vec();
            Ok(())
        }

        fn set_cpuid(&mut self, cpuid: &CpuId) -> CpuResult<()> {
            self.cpuid = Some(cpuid.clone());
            Ok(())
        }

        fn set_mp_state(&mut self, mp_state: kvm_mp_state) -> CpuResult<()> {
            self.mp_state = Some(mp_state);
            Ok(())
        }
    }

    pub struct MockHypervisor {
        vm: Arc<MockVm>,
    }

    impl MockHypervisor {
        pub fn new() -> Self {
            MockHypervisor {
                vm: Arc::new(MockVm::default()),
            }
        }

        pub fn vm(&self) -> Arc<MockVm> {
            self.vm.clone()
        }
    }

    impl Hypervisor for MockHypervisor {
        fn create_vm(&self) -> std::result::Result<Arc<dyn Vm>, HypervisorError> {
            Ok(self.vm.clone())
        }

        fn get_vcpu_mmap_size(&self) -> std::result::Result<usize, HypervisorError> {
            Ok(4096)
        }

        fn get_supported_cpuid(&self) -> std::result::Result<CpuId, HypervisorError> {
            let cpuid = CpuId::from_entries(&[
                kvm_cpuid_entry2 {
                    function: 0,
                    eax: 0xd,
                    ..Default::default()
                },
                kvm_cpuid_entry2 {
                    function: 1,
                    eax: 0x0006_06a4,
                    ebx: 0x0100_0800,
                    ..Default::default()
                },
            ])
            .expect("static cpuid table fits");
            Ok(cpuid)
        }
    }
}
