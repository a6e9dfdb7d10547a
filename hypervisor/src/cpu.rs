// Copyright © 2024 The Kestrel Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use kvm_bindings::{
    kvm_fpu, kvm_lapic_state, kvm_mp_state, kvm_msr_entry, kvm_regs, kvm_sregs, CpuId,
};
use thiserror::Error;

#[derive(Error, Debug)]
///
/// Enum for CPU error
///
pub enum HypervisorCpuError {
    ///
    /// Vcpu run error
    ///
    #[error("Failed to run vcpu: {0}")]
    RunVcpu(#[source] anyhow::Error),
    ///
    /// Getting the vCPU general purpose registers failed
    ///
    #[error("Failed to get registers: {0}")]
    GetRegs(#[source] anyhow::Error),
    ///
    /// Setting the vCPU general purpose registers failed
    ///
    #[error("Failed to set registers: {0}")]
    SetRegs(#[source] anyhow::Error),
    ///
    /// Getting the vCPU special registers failed
    ///
    #[error("Failed to get special registers: {0}")]
    GetSregs(#[source] anyhow::Error),
    ///
    /// Setting the vCPU special registers failed
    ///
    #[error("Failed to set special registers: {0}")]
    SetSregs(#[source] anyhow::Error),
    ///
    /// Setting the floating point unit state failed
    ///
    #[error("Failed to set FPU state: {0}")]
    SetFpu(#[source] anyhow::Error),
    ///
    /// Getting the local APIC state failed
    ///
    #[error("Failed to get LAPIC state: {0}")]
    GetLapic(#[source] anyhow::Error),
    ///
    /// Setting the local APIC state failed
    ///
    #[error("Failed to set LAPIC state: {0}")]
    SetLapic(#[source] anyhow::Error),
    ///
    /// Setting model specific registers failed
    ///
    #[error("Failed to set MSRs: {0}")]
    SetMsrs(#[source] anyhow::Error),
    ///
    /// Setting the supported CPUID table failed
    ///
    #[error("Failed to set CPUID: {0}")]
    SetCpuid(#[source] anyhow::Error),
    ///
    /// Setting the multiprocessing state failed
    ///
    #[error("Failed to set MP state: {0}")]
    SetMpState(#[source] anyhow::Error),
}

///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, HypervisorCpuError>;

///
/// Reasons a vCPU handed control back to the VMM. Accesses that need
/// servicing borrow their data window from the shared run structure.
///
#[derive(Debug)]
pub enum VmExit<'a> {
    /// An OUT instruction trapped, data holds the written bytes.
    IoOut(u16, &'a [u8]),
    /// An IN instruction trapped, data must be filled by the handler.
    IoIn(u16, &'a mut [u8]),
    /// A write to an unbacked guest physical address trapped.
    MmioWrite(u64, &'a [u8]),
    /// A read from an unbacked guest physical address trapped.
    MmioRead(u64, &'a mut [u8]),
    /// A host signal bounced the vCPU out of guest mode.
    Interrupted,
    /// The guest executed HLT with no pending interrupt.
    Hlt,
    /// The guest triple faulted or asked for a platform shutdown.
    Shutdown,
    /// Entering guest mode failed, carries the hardware reason.
    FailEntry(u64),
    /// The kernel gave up on emulation.
    InternalError,
    /// Exit serviced inside the hypervisor wrapper, nothing to do.
    Ignore,
}

///
/// Trait to represent a vCPU fd. One per guest CPU, owned by the
/// thread that runs it.
///
pub trait Vcpu: Send {
    ///
    /// Runs the vCPU until the next exit.
    ///
    fn run(&mut self) -> Result<VmExit<'_>>;
    ///
    /// Returns the vCPU general purpose registers.
    ///
    fn get_regs(&self) -> Result<kvm_regs>;
    ///
    /// Sets the vCPU general purpose registers.
    ///
    fn set_regs(&mut self, regs: &kvm_regs) -> Result<()>;
    ///
    /// Returns the vCPU special registers.
    ///
    fn get_sregs(&self) -> Result<kvm_sregs>;
    ///
    /// Sets the vCPU special registers.
    ///
    fn set_sregs(&mut self, sregs: &kvm_sregs) -> Result<()>;
    ///
    /// Sets the floating point unit state.
    ///
    fn set_fpu(&mut self, fpu: &kvm_fpu) -> Result<()>;
    ///
    /// Returns the local APIC state.
    ///
    fn get_lapic(&self) -> Result<kvm_lapic_state>;
    ///
    /// Sets the local APIC state.
    ///
    fn set_lapic(&mut self, lapic: &kvm_lapic_state) -> Result<()>;
    ///
    /// Sets model specific registers.
    ///
    fn set_msrs(&mut self, msrs: &[kvm_msr_entry]) -> Result<()>;
    ///
    /// Installs the CPUID table exposed to the guest.
    ///
    fn set_cpuid(&mut self, cpuid: &CpuId) -> Result<()>;
    ///
    /// Sets the multiprocessing state (runnable, uninitialized, ...).
    ///
    fn set_mp_state(&mut self, mp_state: kvm_mp_state) -> Result<()>;
}
