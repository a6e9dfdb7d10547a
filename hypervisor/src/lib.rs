// Copyright © 2024 The Kestrel Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! A thin abstraction around the KVM hypervisor interface.
//!
//! The traits in this crate front the exact ioctl surface the VMM
//! consumes, so the rest of the workspace never touches a raw fd and
//! unit tests can substitute a recording double for the kernel.

/// KVM implementation module
pub mod kvm;

/// Hypervisor related module
mod hypervisor;

/// Vm related module
pub mod vm;

/// CPU related module
mod cpu;

pub use crate::hypervisor::{Hypervisor, HypervisorError};
pub use cpu::{HypervisorCpuError, Vcpu, VmExit};
pub use kvm::KvmHypervisor;
pub use vm::{HypervisorVmError, IoEventAddress, MsiMessage, UserMemoryRegion, Vm};

use std::mem::size_of;
use std::sync::Arc;

/// Opens the host hypervisor interface.
pub fn new() -> std::result::Result<Arc<dyn Hypervisor>, HypervisorError> {
    let hv = kvm::KvmHypervisor::new()?;

    Ok(Arc::new(hv))
}

// Several KVM ioctl arguments are a fixed header immediately followed
// by a flexible array member (`kvm_irq_routing` holds its routing
// entries that way), so `size_of::<T>()` alone never covers the
// payload. Backing the whole thing with a `Vec<T>` sized to hold
// header plus `count` trailing `F` entries keeps the buffer aligned
// for `T` and the tail contiguous with it; callers treat element 0 as
// the header and write the entries into the spare capacity behind it.
pub(crate) fn vec_with_array_field<T: Default, F>(count: usize) -> Vec<T> {
    let bytes_needed = size_of::<T>() + count * size_of::<F>();
    let elements = bytes_needed.div_ceil(size_of::<T>());
    let mut storage = Vec::with_capacity(elements);
    storage.resize_with(elements, T::default);
    storage
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_bindings::{kvm_irq_routing, kvm_irq_routing_entry};

    #[test]
    fn test_vec_with_array_field_capacity() {
        let v = vec_with_array_field::<kvm_irq_routing, kvm_irq_routing_entry>(24);
        assert!(
            v.len() * size_of::<kvm_irq_routing>()
                >= size_of::<kvm_irq_routing>() + 24 * size_of::<kvm_irq_routing_entry>()
        );

        let empty = vec_with_array_field::<kvm_irq_routing, kvm_irq_routing_entry>(0);
        assert_eq!(empty.len(), 1);
    }
}
