// Copyright © 2024 The Kestrel Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use crate::vm::Vm;
use kvm_bindings::CpuId;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
///
/// Enum for hypervisor-level errors
///
pub enum HypervisorError {
    ///
    /// Hypervisor interface unavailable
    ///
    #[error("Failed to open the hypervisor interface: {0}")]
    HypervisorCreate(#[source] anyhow::Error),
    ///
    /// The kernel speaks a different API revision than we do
    ///
    #[error("Unsupported hypervisor API version: got {0}, expected {1}")]
    IncompatibleApiVersion(i32, i32),
    ///
    /// Vcpu mmap size query error
    ///
    #[error("Failed to get the vCPU mmap size: {0}")]
    GetVcpuMmapSize(#[source] anyhow::Error),
    ///
    /// Create VM error
    ///
    #[error("Failed to create VM: {0}")]
    VmCreate(#[source] anyhow::Error),
    ///
    /// Supported CPUID query error
    ///
    #[error("Failed to get supported CPUID: {0}")]
    GetSupportedCpuid(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HypervisorError>;

///
/// Trait to represent the whole hypervisor interface, from which VMs
/// are created.
///
pub trait Hypervisor: Send + Sync {
    ///
    /// Creates a new VM fd.
    ///
    fn create_vm(&self) -> Result<Arc<dyn Vm>>;
    ///
    /// Returns the size of the shared vCPU run structure.
    ///
    fn get_vcpu_mmap_size(&self) -> Result<usize>;
    ///
    /// Returns the CPUID table the host can virtualize.
    ///
    fn get_supported_cpuid(&self) -> Result<CpuId>;
}
