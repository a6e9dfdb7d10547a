// Copyright © 2024 The Kestrel Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! vCPU threads.
//!
//! Each guest CPU runs on its own OS thread in an enter/exit loop.
//! Exits are classified here and serviced through the device manager.
//! A kick is a realtime signal with an empty handler: it bounces the
//! thread out of guest mode so pending callbacks, pause requests and
//! teardown are observed at the loop boundary, never mid-instruction.

use crate::device_manager::{DeviceManager, IoAccess};
use hypervisor::kvm::kvm_bindings::{
    kvm_fpu, kvm_lapic_state, kvm_mp_state, kvm_msr_entry, kvm_regs, kvm_segment, CpuId,
    KVM_MP_STATE_RUNNABLE, KVM_MP_STATE_UNINITIALIZED,
};
use hypervisor::{HypervisorCpuError, VmExit};
use libc::{c_int, c_void, siginfo_t};
use log::{debug, error, info};
use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::signal::{register_signal_handler, SIGRTMIN};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to create vCPU: {0}")]
    VcpuCreate(#[source] hypervisor::HypervisorVmError),

    #[error("Failed to spawn vCPU thread: {0}")]
    VcpuSpawn(#[source] std::io::Error),

    #[error("vCPU state operation failed: {0}")]
    VcpuState(#[from] HypervisorCpuError),
}

pub type Result<T> = std::result::Result<T, Error>;

// x86 power-on values.
const RESET_VECTOR_CS_BASE: u64 = 0xffff_0000;
const RESET_VECTOR_CS_SELECTOR: u16 = 0xf000;
const RESET_VECTOR_IP: u64 = 0xfff0;
const RESET_CR0: u64 = 0x6000_0010;
const RESET_RFLAGS: u64 = 0x2;
const RESET_FPU_FCW: u16 = 0x37f;
const RESET_FPU_MXCSR: u32 = 0x1f80;

const MSR_IA32_TSC: u32 = 0x0000_0010;
const MSR_IA32_SYSENTER_CS: u32 = 0x0000_0174;
const MSR_IA32_SYSENTER_ESP: u32 = 0x0000_0175;
const MSR_IA32_SYSENTER_EIP: u32 = 0x0000_0176;
const MSR_IA32_MISC_ENABLE: u32 = 0x0000_01a0;
const MSR_STAR: u32 = 0xc000_0081;
const MSR_LSTAR: u32 = 0xc000_0082;
const MSR_CSTAR: u32 = 0xc000_0083;
const MSR_SFMASK: u32 = 0xc000_0084;
const MSR_KERNEL_GS_BASE: u32 = 0xc000_0102;

const MSR_IA32_MISC_ENABLE_FAST_STRING: u64 = 0x1;

/// Work posted to a vCPU thread, executed at the loop boundary.
pub enum VcpuTask {
    /// Apply full architectural power-on state.
    Reset,
    /// Arbitrary callback.
    Callback(Box<dyn FnOnce() + Send>),
}

struct VcpuShared {
    tasks: Mutex<Vec<VcpuTask>>,
    // True only while the thread is parked or gone, never while it
    // may still re-enter the guest. pause() and teardown spin on it.
    run_interrupted: AtomicBool,
}

pub struct Vcpu {
    id: u8,
    cpuid: CpuId,
    // Moved into the thread on start.
    vcpu: Option<Box<dyn hypervisor::Vcpu>>,
    shared: Arc<VcpuShared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Vcpu {
    pub fn new(id: u8, vm: &Arc<dyn hypervisor::Vm>, cpuid: CpuId) -> Result<Self> {
        let vcpu = vm.create_vcpu(id).map_err(Error::VcpuCreate)?;
        Ok(Vcpu {
            id,
            cpuid,
            vcpu: Some(vcpu),
            shared: Arc::new(VcpuShared {
                tasks: Mutex::new(Vec::new()),
                run_interrupted: AtomicBool::new(false),
            }),
            handle: None,
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Launches the vCPU thread. It applies power-on state, waits on
    /// the barrier with its siblings and enters the run loop.
    pub fn start(
        &mut self,
        device_manager: Arc<DeviceManager>,
        barrier: Arc<Barrier>,
        kill_signalled: Arc<AtomicBool>,
        pause_signalled: Arc<AtomicBool>,
        reset_evt: EventFd,
        exit_evt: EventFd,
    ) -> Result<()> {
        let id = self.id;
        let cpuid = self.cpuid.clone();
        let mut vcpu = self.vcpu.take().expect("vCPU already started");
        let shared = self.shared.clone();

        let handle = thread::Builder::new()
            .name(format!("vcpu{}", id))
            .spawn(move || {
                extern "C" fn handle_signal(_: c_int, _: *mut siginfo_t, _: *mut c_void) {}
                // An async-signal-safe nop handler: delivery alone
                // makes the enter ioctl return with EINTR.
                if let Err(e) = register_signal_handler(SIGRTMIN(), handle_signal) {
                    error!("Failed to register vcpu signal handler: {}", e);
                    shared.run_interrupted.store(true, Ordering::SeqCst);
                    return;
                }

                // The in-kernel APIC starts in its power-on state;
                // keep a copy so machine reset can restore it.
                let init = vcpu.get_lapic().map_err(Error::VcpuState).and_then(|lapic| {
                    arch_reset(vcpu.as_mut(), id, &cpuid, &lapic)?;
                    Ok(lapic)
                });
                let pristine_lapic = match init {
                    Ok(lapic) => lapic,
                    Err(e) => {
                        error!("vcpu{}: failed to apply power-on state: {}", id, e);
                        shared.run_interrupted.store(true, Ordering::SeqCst);
                        exit_evt.write(1).ok();
                        return;
                    }
                };

                barrier.wait();

                run_loop(
                    vcpu.as_mut(),
                    id,
                    &shared,
                    &device_manager,
                    &kill_signalled,
                    &pause_signalled,
                    &pristine_lapic,
                    &cpuid,
                    &reset_evt,
                    &exit_evt,
                );
                shared.run_interrupted.store(true, Ordering::SeqCst);
            })
            .map_err(Error::VcpuSpawn)?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Posts work to run on the vCPU thread at the next safe point.
    pub fn schedule(&self, task: VcpuTask) {
        self.shared.tasks.lock().unwrap().push(task);
        self.kick();
    }

    /// Bounces the vCPU out of guest mode. Wait-free, idempotent, a
    /// no-op if the thread is not running.
    pub fn kick(&self) {
        if let Some(handle) = self.handle.as_ref() {
            // SAFETY: the thread registered an empty handler for this
            // signal before it could ever enter the guest.
            unsafe {
                libc::pthread_kill(handle.as_pthread_t() as _, SIGRTMIN());
            }
        }
    }

    /// Kicks until the thread acknowledges being at a safe point.
    /// Used by pause and teardown, which need the guarantee.
    pub fn kick_sync(&self) {
        if self.handle.is_none() {
            return;
        }
        loop {
            self.kick();
            if self.shared.run_interrupted.load(Ordering::SeqCst) {
                break;
            }
            // More effective than yielding against a priority
            // inverted vCPU thread.
            thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    pub fn unpark(&self) {
        if let Some(handle) = self.handle.as_ref() {
            handle.thread().unpark();
        }
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_loop(
    vcpu: &mut dyn hypervisor::Vcpu,
    id: u8,
    shared: &VcpuShared,
    device_manager: &DeviceManager,
    kill_signalled: &AtomicBool,
    pause_signalled: &AtomicBool,
    pristine_lapic: &kvm_lapic_state,
    cpuid: &CpuId,
    reset_evt: &EventFd,
    exit_evt: &EventFd,
) {
    loop {
        let tasks: Vec<_> = std::mem::take(&mut *shared.tasks.lock().unwrap());
        for task in tasks {
            match task {
                VcpuTask::Reset => {
                    if let Err(e) = arch_reset(vcpu, id, cpuid, pristine_lapic) {
                        error!("vcpu{}: reset failed: {}", id, e);
                        exit_evt.write(1).ok();
                        return;
                    }
                    debug!("vcpu{}: reset to power-on state", id);
                }
                VcpuTask::Callback(callback) => callback(),
            }
        }

        if kill_signalled.load(Ordering::SeqCst) {
            return;
        }

        if pause_signalled.load(Ordering::SeqCst) {
            shared.run_interrupted.store(true, Ordering::SeqCst);
            // Resume toggles the flag and unparks us. park() can wake
            // spuriously, hence the loop.
            while pause_signalled.load(Ordering::SeqCst) {
                thread::park();
            }
            continue;
        }

        shared.run_interrupted.store(false, Ordering::SeqCst);

        match vcpu.run() {
            Ok(exit) => match exit {
                VmExit::IoOut(port, data) => {
                    let size = data.len();
                    device_manager.handle_pio(port, IoAccess::Write(data), size, 1, false);
                }
                VmExit::IoIn(port, data) => {
                    let size = data.len();
                    device_manager.handle_pio(port, IoAccess::Read(data), size, 1, false);
                }
                VmExit::MmioWrite(addr, data) => {
                    device_manager.handle_mmio(addr, IoAccess::Write(data), false);
                }
                VmExit::MmioRead(addr, data) => {
                    device_manager.handle_mmio(addr, IoAccess::Read(data), false);
                }
                VmExit::Interrupted => {
                    // Kicked; the loop head picks up whatever caused
                    // it.
                }
                VmExit::Hlt => {
                    // With the in-kernel irqchip HLT blocks in the
                    // kernel; seeing it here is harmless.
                    debug!("vcpu{}: hlt exit", id);
                }
                VmExit::Ignore => {}
                VmExit::Shutdown => {
                    // Triple fault. Ask the supervisor for a machine
                    // reset and park until it pauses and resets us.
                    info!("vcpu{}: shutdown exit, requesting machine reset", id);
                    shared.run_interrupted.store(true, Ordering::SeqCst);
                    reset_evt.write(1).ok();
                    thread::park();
                }
                VmExit::FailEntry(reason) => {
                    error!("vcpu{}: entry failed, hardware reason {:#x}", id, reason);
                    exit_evt.write(1).ok();
                    return;
                }
                VmExit::InternalError => {
                    error!("vcpu{}: kernel internal error", id);
                    exit_evt.write(1).ok();
                    return;
                }
            },
            Err(e) => {
                error!("vcpu{}: run failed: {}", id, e);
                exit_evt.write(1).ok();
                return;
            }
        }
    }
}

/// Applies full x86 power-on state: real mode at the reset vector,
/// canonical control registers, default FPU, pristine LAPIC, zeroed
/// fast-path MSRs. The BSP comes up runnable, APs wait for INIT-SIPI.
pub(crate) fn arch_reset(
    vcpu: &mut dyn hypervisor::Vcpu,
    id: u8,
    cpuid: &CpuId,
    pristine_lapic: &kvm_lapic_state,
) -> Result<()> {
    let mut cpuid = cpuid.clone();
    for entry in cpuid.as_mut_slice() {
        if entry.function == 1 {
            // Initial APIC id lives in the top byte of EBX.
            entry.ebx = (entry.ebx & 0x00ff_ffff) | ((id as u32) << 24);
        }
    }
    vcpu.set_cpuid(&cpuid)?;

    let mut sregs = vcpu.get_sregs()?;
    let data_segment = kvm_segment {
        base: 0,
        limit: 0xffff,
        selector: 0,
        type_: 0x3, // Read/write, accessed
        present: 1,
        dpl: 0,
        db: 0,
        s: 1,
        l: 0,
        g: 0,
        avl: 0,
        unusable: 0,
        padding: 0,
    };
    sregs.cs = kvm_segment {
        base: RESET_VECTOR_CS_BASE,
        limit: 0xffff,
        selector: RESET_VECTOR_CS_SELECTOR,
        type_: 0xb, // Execute/read, accessed
        ..data_segment
    };
    sregs.ds = data_segment;
    sregs.es = data_segment;
    sregs.fs = data_segment;
    sregs.gs = data_segment;
    sregs.ss = data_segment;
    sregs.tr = kvm_segment {
        type_: 0xb, // 32-bit busy TSS
        s: 0,
        ..data_segment
    };
    sregs.ldt = kvm_segment {
        type_: 0x2, // LDT
        s: 0,
        ..data_segment
    };
    sregs.cr0 = RESET_CR0;
    sregs.cr2 = 0;
    sregs.cr3 = 0;
    sregs.cr4 = 0;
    sregs.cr8 = 0;
    sregs.efer = 0;
    vcpu.set_sregs(&sregs)?;

    let regs = kvm_regs {
        rflags: RESET_RFLAGS,
        rip: RESET_VECTOR_IP,
        ..Default::default()
    };
    vcpu.set_regs(&regs)?;

    let fpu = kvm_fpu {
        fcw: RESET_FPU_FCW,
        mxcsr: RESET_FPU_MXCSR,
        ..Default::default()
    };
    vcpu.set_fpu(&fpu)?;

    let msrs = [
        msr_entry(MSR_IA32_SYSENTER_CS, 0),
        msr_entry(MSR_IA32_SYSENTER_ESP, 0),
        msr_entry(MSR_IA32_SYSENTER_EIP, 0),
        msr_entry(MSR_STAR, 0),
        msr_entry(MSR_LSTAR, 0),
        msr_entry(MSR_CSTAR, 0),
        msr_entry(MSR_SFMASK, 0),
        msr_entry(MSR_KERNEL_GS_BASE, 0),
        msr_entry(MSR_IA32_TSC, 0),
        msr_entry(MSR_IA32_MISC_ENABLE, MSR_IA32_MISC_ENABLE_FAST_STRING),
    ];
    vcpu.set_msrs(&msrs)?;

    vcpu.set_lapic(pristine_lapic)?;

    let mp_state = kvm_mp_state {
        mp_state: if id == 0 {
            KVM_MP_STATE_RUNNABLE
        } else {
            KVM_MP_STATE_UNINITIALIZED
        },
    };
    vcpu.set_mp_state(mp_state)?;

    Ok(())
}

fn msr_entry(index: u32, data: u64) -> kvm_msr_entry {
    kvm_msr_entry {
        index,
        data,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockVcpu;
    use hypervisor::kvm::kvm_bindings::kvm_cpuid_entry2;

    fn test_cpuid() -> CpuId {
        CpuId::from_entries(&[kvm_cpuid_entry2 {
            function: 1,
            eax: 0x0006_06a4,
            ebx: 0x0100_0800,
            ..Default::default()
        }])
        .unwrap()
    }

    #[test]
    fn test_arch_reset_applies_power_on_state() {
        let mut vcpu = MockVcpu::default();
        let lapic = kvm_lapic_state::default();

        arch_reset(&mut vcpu, 0, &test_cpuid(), &lapic).unwrap();

        let sregs = vcpu.sregs.unwrap();
        assert_eq!(sregs.cs.base, 0xffff_0000);
        assert_eq!(sregs.cs.selector, 0xf000);
        assert_eq!(sregs.cr0, 0x6000_0010);
        assert_eq!(sregs.cr4, 0);
        assert_eq!(sregs.efer, 0);

        let regs = vcpu.regs.unwrap();
        assert_eq!(regs.rip, 0xfff0);
        assert_eq!(regs.rflags, 0x2);
        assert_eq!(regs.rax, 0);

        let fpu = vcpu.fpu.unwrap();
        assert_eq!(fpu.fcw, 0x37f);
        assert_eq!(fpu.mxcsr, 0x1f80);

        assert_eq!(vcpu.mp_state.unwrap().mp_state, KVM_MP_STATE_RUNNABLE);

        // The BSP keeps apic id 0, so leaf 1 EBX is masked clean.
        let cpuid = vcpu.cpuid.as_ref().unwrap();
        let leaf1 = cpuid.as_slice().iter().find(|e| e.function == 1).unwrap();
        assert_eq!(leaf1.ebx >> 24, 0);
    }

    #[test]
    fn test_arch_reset_marks_aps_uninitialized() {
        let mut vcpu = MockVcpu::default();
        let lapic = kvm_lapic_state::default();

        arch_reset(&mut vcpu, 3, &test_cpuid(), &lapic).unwrap();

        assert_eq!(
            vcpu.mp_state.unwrap().mp_state,
            KVM_MP_STATE_UNINITIALIZED
        );
        let cpuid = vcpu.cpuid.as_ref().unwrap();
        let leaf1 = cpuid.as_slice().iter().find(|e| e.function == 1).unwrap();
        assert_eq!(leaf1.ebx >> 24, 3);
    }
}
