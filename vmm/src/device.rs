// Copyright © 2024 The Kestrel Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The device trait surface.
//!
//! Emulated devices are polymorphic nodes behind `Arc<Mutex<dyn
//! Device>>`. A device declares the I/O resources and fast-path
//! ioevents it wants when `connect` runs; the device manager then
//! registers them on its behalf and routes guest accesses back through
//! `read`/`write`. PCI membership is a queryable capability rather
//! than a subclass.

use crate::config::ObjectConfig;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown device class: {0}")]
    UnknownClass(String),

    #[error("Device {0} rejected its configuration: {1}")]
    BadAttributes(String, String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub type DeviceHandle = Arc<Mutex<dyn Device>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoResourceKind {
    Pio,
    Mmio,
    Ram,
}

/// An address range a device claims in one of the I/O spaces.
/// Overlaps within a kind are allowed, dispatch order breaks the tie.
#[derive(Clone, Debug)]
pub struct IoResource {
    pub kind: IoResourceKind,
    pub base: u64,
    pub length: u64,
    pub name: String,
    pub enabled: bool,
}

impl IoResource {
    pub fn pio(base: u16, length: u16, name: &str) -> Self {
        IoResource {
            kind: IoResourceKind::Pio,
            base: base as u64,
            length: length as u64,
            name: name.to_string(),
            enabled: true,
        }
    }

    pub fn mmio(base: u64, length: u64, name: &str) -> Self {
        IoResource {
            kind: IoResourceKind::Mmio,
            base,
            length,
            name: name.to_string(),
            enabled: true,
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.enabled && addr >= self.base && addr < self.base + self.length
    }
}

/// A fast-path binding a device wants armed at connect time. A zero
/// `length` means any access width and no datamatch.
#[derive(Clone, Debug)]
pub struct IoEventRequest {
    pub kind: IoResourceKind,
    pub address: u64,
    pub length: u32,
    pub datamatch: u64,
}

/// A PCI function identity: (bus, devfn). Unique per machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciAddress {
    pub bus: u16,
    pub devfn: u8,
}

/// Trait every emulated device implements.
///
/// Lifecycle: `connect` top-down after construction, `reset` after all
/// connects and at machine reset, `disconnect` bottom-up at teardown.
/// `read`/`write` run on whichever thread caused the access and must
/// not block.
#[allow(unused_variables)]
pub trait Device: Send {
    /// The instance name.
    fn name(&self) -> &str;

    /// Wires the device up. Resources and ioevents reported by
    /// `io_resources`/`io_events` after this call get registered.
    fn connect(&mut self) {}

    /// Tears the device down, after its children.
    fn disconnect(&mut self) {}

    /// Puts the device back in its power-on state.
    fn reset(&mut self) {}

    /// The I/O resources this device currently claims.
    fn io_resources(&self) -> Vec<IoResource> {
        Vec::new()
    }

    /// The fast-path ioevents this device wants armed.
    fn io_events(&self) -> Vec<IoEventRequest> {
        Vec::new()
    }

    /// Guest read from `offset` inside `resource` into `data`.
    fn read(&mut self, resource: &IoResource, offset: u64, data: &mut [u8]) {}

    /// Guest write to `offset` inside `resource` from `data`.
    fn write(&mut self, resource: &IoResource, offset: u64, data: &[u8]) {}

    /// PCI capability: the function address if this device is a PCI
    /// function.
    fn pci_address(&self) -> Option<PciAddress> {
        None
    }
}

/// The motherboard root every other device hangs off.
pub struct SystemRoot {
    name: String,
}

impl SystemRoot {
    pub fn create(config: &ObjectConfig) -> Result<DeviceHandle> {
        Ok(Arc::new(Mutex::new(SystemRoot {
            name: config.instance_name().to_string(),
        })))
    }
}

impl Device for SystemRoot {
    fn name(&self) -> &str {
        &self.name
    }
}

type DeviceConstructor = fn(&ObjectConfig) -> Result<DeviceHandle>;

// Device classes instantiable from configuration. Emulations register
// here as they are added.
static DEVICE_CLASSES: &[(&str, DeviceConstructor)] = &[("system-root", SystemRoot::create)];

/// Instantiates a device from one object of the configured tree.
pub fn create_device(config: &ObjectConfig) -> Result<DeviceHandle> {
    DEVICE_CLASSES
        .iter()
        .find(|(class, _)| *class == config.class)
        .map(|(_, constructor)| constructor(config))
        .ok_or_else(|| Error::UnknownClass(config.class.clone()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(json: &str) -> ObjectConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_create_known_class() {
        let root = create_device(&object(r#"{ "class": "system-root" }"#)).unwrap();
        assert_eq!(root.lock().unwrap().name(), "system-root");

        let named =
            create_device(&object(r#"{ "class": "system-root", "name": "board" }"#)).unwrap();
        assert_eq!(named.lock().unwrap().name(), "board");
    }

    #[test]
    fn test_unknown_class_rejected() {
        assert!(matches!(
            create_device(&object(r#"{ "class": "flux-capacitor" }"#)),
            Err(Error::UnknownClass(_))
        ));
    }

    #[test]
    fn test_resource_contains_respects_enabled() {
        let mut resource = IoResource::pio(0x3f8, 8, "uart");
        assert!(resource.contains(0x3f8));
        assert!(resource.contains(0x3ff));
        assert!(!resource.contains(0x400));

        resource.enabled = false;
        assert!(!resource.contains(0x3f8));
    }
}
