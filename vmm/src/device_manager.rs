// Copyright © 2024 The Kestrel Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Device registry and I/O dispatch fabric.
//!
//! The device manager routes trapped PIO/MMIO accesses to the owning
//! device, arms ioeventfd fast paths that synthesize the same calls
//! from the I/O thread, and owns the GSI routing table covering the
//! legacy interrupt chips and allocated MSI entries.
//!
//! Dispatch is a linear scan over an ordered handler list. Guest I/O
//! is heavily skewed towards a handful of devices, so a handler hit
//! deep in the list floats to the front. The registry lock is never
//! held across a device callback.

use crate::device::{DeviceHandle, IoEventRequest, IoResource, IoResourceKind};
use crate::io_thread::IoThread;
use crate::memory_manager::{MemoryKind, MemoryManager, MemoryRegion};
use hypervisor::kvm::kvm_bindings::{
    kvm_irq_routing_entry, KVM_IRQ_ROUTING_IRQCHIP, KVM_IRQ_ROUTING_MSI,
};
use hypervisor::{IoEventAddress, MsiMessage, Vm};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

#[derive(Error, Debug)]
pub enum Error {
    #[error("PCI function {bus:02x}:{devfn:02x} is claimed twice")]
    PciDevfnConflict { bus: u16, devfn: u8 },

    #[error("No handler registered by this device at {0:#x}")]
    HandlerNotFound(u64),

    #[error("No route allocated for GSI {0}")]
    GsiNotFound(u32),

    #[error("Failed to create an event fd: {0}")]
    CreateEventFd(#[source] std::io::Error),

    #[error("Hypervisor operation failed: {0}")]
    Hypervisor(#[from] hypervisor::HypervisorVmError),

    #[error("Memory operation failed: {0}")]
    Memory(#[from] crate::memory_manager::Error),

    #[error("I/O thread operation failed: {0}")]
    IoThread(#[from] crate::io_thread::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// Interrupt chip indices understood by the in-kernel irqchip.
const KVM_IRQCHIP_PIC_MASTER: u32 = 0;
const KVM_IRQCHIP_PIC_SLAVE: u32 = 1;
const KVM_IRQCHIP_IOAPIC: u32 = 2;

// First GSI handed out to MSI routes, above every fixed legacy pin.
const GSI_MSI_BASE: u32 = 24;

// A handler hit at or beyond this scan depth floats to the front;
// shallower hits leave the order alone.
const PROMOTE_SCAN_DEPTH: usize = 3;

// Exit-originated device calls slower than this get flagged in debug
// mode.
const SLOW_IO: Duration = Duration::from_millis(10);

/// One guest access, seen from the device: a read to fill or written
/// bytes to consume.
pub enum IoAccess<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

/// An armed ioeventfd fast path. The kernel consumes matching writes
/// and signals `fd` instead of exiting to userspace.
pub struct IoEvent {
    pub device: DeviceHandle,
    pub kind: IoResourceKind,
    pub address: u64,
    pub length: u32,
    pub datamatch: u64,
    pub fd: EventFd,
}

impl IoEvent {
    fn io_address(&self) -> IoEventAddress {
        match self.kind {
            IoResourceKind::Pio => IoEventAddress::Pio(self.address),
            _ => IoEventAddress::Mmio(self.address),
        }
    }
}

struct IoHandler {
    resource: IoResource,
    device: DeviceHandle,
    // Present for MMIO handlers: the trap region shadowing the range.
    region: Option<Arc<MemoryRegion>>,
}

struct RegisteredDevice {
    name: String,
    handle: DeviceHandle,
}

#[derive(Default)]
struct Registry {
    devices: Vec<RegisteredDevice>,
    pio_handlers: VecDeque<IoHandler>,
    mmio_handlers: VecDeque<IoHandler>,
    io_events: Vec<Arc<IoEvent>>,
    gsi_routes: Vec<kvm_irq_routing_entry>,
    next_gsi: u32,
}

pub struct DeviceManager {
    vm: Arc<dyn Vm>,
    io_thread: Arc<IoThread>,
    memory: Arc<MemoryManager>,
    debug: bool,
    registry: Mutex<Registry>,
}

impl DeviceManager {
    /// Builds the manager around an already constructed device tree
    /// (parents before children), wires every device up and resets
    /// it.
    pub fn new(
        vm: Arc<dyn Vm>,
        io_thread: Arc<IoThread>,
        memory: Arc<MemoryManager>,
        devices: Vec<DeviceHandle>,
        debug: bool,
    ) -> Result<Arc<Self>> {
        let manager = Arc::new(DeviceManager {
            vm,
            io_thread,
            memory,
            debug,
            registry: Mutex::new(Registry::default()),
        });

        manager.setup_gsi_routing_table()?;

        for device in &devices {
            manager.register_device(device)?;
        }
        for device in &devices {
            manager.connect_device(device)?;
        }
        manager.reset_devices();

        Ok(manager)
    }

    /// Access to the I/O thread for devices submitting async work.
    pub fn io(&self) -> &Arc<IoThread> {
        &self.io_thread
    }

    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Host address of a guest physical address, if RAM backs it.
    pub fn translate_guest_memory(&self, gpa: u64) -> Option<*mut u8> {
        self.memory.guest_to_host(gpa)
    }

    fn register_device(&self, device: &DeviceHandle) -> Result<()> {
        let (name, pci) = {
            let locked = device.lock().unwrap();
            (locked.name().to_string(), locked.pci_address())
        };

        let mut registry = self.registry.lock().unwrap();
        if let Some(pci) = pci {
            for other in &registry.devices {
                if other.handle.lock().unwrap().pci_address() == Some(pci) {
                    return Err(Error::PciDevfnConflict {
                        bus: pci.bus,
                        devfn: pci.devfn,
                    });
                }
            }
        }
        registry.devices.push(RegisteredDevice {
            name,
            handle: device.clone(),
        });
        Ok(())
    }

    fn connect_device(self: &Arc<Self>, device: &DeviceHandle) -> Result<()> {
        let (resources, events) = {
            let mut locked = device.lock().unwrap();
            locked.connect();
            (locked.io_resources(), locked.io_events())
        };
        for resource in &resources {
            self.register_io_handler(device, resource)?;
        }
        for event in &events {
            self.register_io_event(device, event)?;
        }
        Ok(())
    }

    pub fn lookup_device_by_name(&self, name: &str) -> Option<DeviceHandle> {
        self.registry
            .lock()
            .unwrap()
            .devices
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.handle.clone())
    }

    /// Calls `reset` on every device, in registration order.
    pub fn reset_devices(&self) {
        let devices: Vec<_> = {
            let registry = self.registry.lock().unwrap();
            registry.devices.iter().map(|d| d.handle.clone()).collect()
        };
        for device in devices {
            device.lock().unwrap().reset();
        }
    }

    /// Tears the device tree down: disarms every fast path, drops
    /// every handler and disconnects children before parents.
    pub fn disconnect_devices(&self) {
        let events: Vec<_> = {
            let registry = self.registry.lock().unwrap();
            registry.io_events.clone()
        };
        for event in events {
            if let Err(e) = self.unregister_io_event(&event) {
                warn!("Failed to disarm ioeventfd at {:#x}: {}", event.address, e);
            }
        }

        let mut registry = self.registry.lock().unwrap();
        for handler in registry.mmio_handlers.drain(..) {
            if let Some(region) = handler.region {
                let _ = self.memory.unmap(&region);
            }
        }
        registry.pio_handlers.clear();
        let devices: Vec<_> = registry.devices.drain(..).map(|d| d.handle).collect();
        drop(registry);

        for device in devices.iter().rev() {
            device.lock().unwrap().disconnect();
        }
    }

    /// Debug listing of every device and its claimed resources.
    pub fn print_devices(&self) {
        let devices: Vec<_> = {
            let registry = self.registry.lock().unwrap();
            registry.devices.iter().map(|d| d.handle.clone()).collect()
        };
        for device in devices {
            let locked = device.lock().unwrap();
            info!("Device: {}", locked.name());
            for resource in locked.io_resources() {
                info!(
                    "\t{:?} {:#x}-{:#x} {}",
                    resource.kind,
                    resource.base,
                    resource.base + resource.length - 1,
                    resource.name
                );
            }
        }
    }

    /// Binds one I/O resource of a device into the dispatch tables.
    /// MMIO resources get a Device-kind trap region installed so
    /// accesses reach us at all.
    pub fn register_io_handler(
        &self,
        device: &DeviceHandle,
        resource: &IoResource,
    ) -> Result<()> {
        let region = match resource.kind {
            IoResourceKind::Mmio => Some(self.memory.map(
                resource.base,
                resource.length,
                None,
                MemoryKind::Device,
                &resource.name,
            )?),
            _ => None,
        };

        let handler = IoHandler {
            resource: resource.clone(),
            device: device.clone(),
            region,
        };

        let mut registry = self.registry.lock().unwrap();
        match resource.kind {
            IoResourceKind::Pio => registry.pio_handlers.push_back(handler),
            _ => registry.mmio_handlers.push_back(handler),
        }
        Ok(())
    }

    /// Removes the handler this device registered at the resource
    /// base. Inverse of `register_io_handler`.
    pub fn unregister_io_handler(
        &self,
        device: &DeviceHandle,
        resource: &IoResource,
    ) -> Result<()> {
        let mut registry = self.registry.lock().unwrap();
        let handlers = match resource.kind {
            IoResourceKind::Pio => &mut registry.pio_handlers,
            _ => &mut registry.mmio_handlers,
        };
        let index = handlers
            .iter()
            .position(|h| {
                Arc::ptr_eq(&h.device, device) && h.resource.base == resource.base
            })
            .ok_or(Error::HandlerNotFound(resource.base))?;
        let handler = handlers.remove(index).unwrap();
        drop(registry);

        if let Some(region) = handler.region {
            self.memory.unmap(&region)?;
        }
        Ok(())
    }

    /// Routes one port I/O access. `count` > 1 is the REP-string form:
    /// the data buffer holds `count` items of `size` bytes, all
    /// presented to the device at the same port offset.
    pub fn handle_pio(
        &self,
        port: u16,
        access: IoAccess,
        size: usize,
        count: usize,
        from_ioeventfd: bool,
    ) {
        let Some((resource, device)) = self.lookup_handler(port as u64, false) else {
            self.unhandled(port as u64, access, false);
            return;
        };

        let offset = port as u64 - resource.base;
        let start = self.debug.then(Instant::now);

        {
            let mut device = device.lock().unwrap();
            match access {
                IoAccess::Write(data) => {
                    if data.is_empty() {
                        // Doorbell style ioevent with no datamatch.
                        device.write(&resource, offset, data);
                    }
                    for chunk in data.chunks(size.max(1)).take(count.max(1)) {
                        device.write(&resource, offset, chunk);
                    }
                }
                IoAccess::Read(data) => {
                    for chunk in data.chunks_mut(size.max(1)).take(count.max(1)) {
                        device.read(&resource, offset, chunk);
                    }
                }
            }
        }

        if let Some(start) = start {
            if !from_ioeventfd && start.elapsed() >= SLOW_IO {
                warn!(
                    "{} slow pio port={:#x} size={} cost={:?}",
                    resource.name,
                    port,
                    size,
                    start.elapsed()
                );
            }
        }
    }

    /// Routes one memory mapped I/O access.
    pub fn handle_mmio(&self, addr: u64, access: IoAccess, from_ioeventfd: bool) {
        let Some((resource, device)) = self.lookup_handler(addr, true) else {
            self.unhandled(addr, access, true);
            return;
        };

        let offset = addr - resource.base;
        let start = self.debug.then(Instant::now);

        {
            let mut device = device.lock().unwrap();
            match access {
                IoAccess::Write(data) => device.write(&resource, offset, data),
                IoAccess::Read(data) => device.read(&resource, offset, data),
            }
        }

        if let Some(start) = start {
            if !from_ioeventfd && start.elapsed() >= SLOW_IO {
                warn!(
                    "{} slow mmio addr={:#x} cost={:?}",
                    resource.name,
                    addr,
                    start.elapsed()
                );
            }
        }
    }

    // Finds the first handler covering `addr` and applies the
    // move-to-front policy. Returns clones so the registry lock is
    // dropped before any device code runs.
    fn lookup_handler(&self, addr: u64, mmio: bool) -> Option<(IoResource, DeviceHandle)> {
        let mut registry = self.registry.lock().unwrap();
        let handlers = if mmio {
            &mut registry.mmio_handlers
        } else {
            &mut registry.pio_handlers
        };

        let index = handlers.iter().position(|h| h.resource.contains(addr))?;
        let handler = &handlers[index];
        let result = (handler.resource.clone(), handler.device.clone());

        // Move to the front for faster access next time.
        if index >= PROMOTE_SCAN_DEPTH {
            let handler = handlers.remove(index).unwrap();
            handlers.push_front(handler);
        }

        Some(result)
    }

    fn unhandled(&self, addr: u64, access: IoAccess, mmio: bool) {
        // Reads of unclaimed addresses float the bus high; writes are
        // dropped. Only worth a line when debugging a machine config.
        let what = if mmio { "mmio" } else { "io" };
        match access {
            IoAccess::Read(data) => {
                data.fill(0xff);
                if self.debug {
                    debug!("unhandled {} read addr={:#x} size={}", what, addr, data.len());
                }
            }
            IoAccess::Write(data) => {
                if self.debug {
                    debug!(
                        "unhandled {} write addr={:#x} size={} data={:x?}",
                        what,
                        addr,
                        data.len(),
                        data
                    );
                }
            }
        }
    }

    /// Arms an ioeventfd covering a guest I/O address and starts
    /// polling it: the kernel consumes matching writes and we replay
    /// them to the device from the I/O thread.
    pub fn register_io_event(
        self: &Arc<Self>,
        device: &DeviceHandle,
        request: &IoEventRequest,
    ) -> Result<Arc<IoEvent>> {
        let fd = EventFd::new(libc::EFD_NONBLOCK).map_err(Error::CreateEventFd)?;
        let event = Arc::new(IoEvent {
            device: device.clone(),
            kind: request.kind,
            address: request.address,
            length: request.length,
            datamatch: request.datamatch,
            fd,
        });

        self.vm.register_ioevent(
            &event.fd,
            &event.io_address(),
            event.length,
            event.datamatch,
        )?;

        let manager = Arc::downgrade(self);
        let poll_event = event.clone();
        self.io_thread.start_polling(
            event.fd.as_raw_fd(),
            epoll::Events::EPOLLIN,
            Box::new(move |_| {
                let _ = poll_event.fd.read();
                let Some(manager) = Weak::upgrade(&manager) else {
                    return;
                };
                // Replay the access the kernel swallowed. The written
                // value is known a priori: it is the datamatch.
                let payload = poll_event.datamatch.to_le_bytes();
                let len = poll_event.length as usize;
                match poll_event.kind {
                    IoResourceKind::Pio => manager.handle_pio(
                        poll_event.address as u16,
                        IoAccess::Write(&payload[..len]),
                        len,
                        1,
                        true,
                    ),
                    _ => manager.handle_mmio(
                        poll_event.address,
                        IoAccess::Write(&payload[..len]),
                        true,
                    ),
                }
            }),
        )?;

        self.registry.lock().unwrap().io_events.push(event.clone());
        Ok(event)
    }

    /// Disarms a fast path: stops polling (synchronously), deasserts
    /// the kernel binding and forgets the event.
    pub fn unregister_io_event(&self, event: &Arc<IoEvent>) -> Result<()> {
        self.io_thread.stop_polling(event.fd.as_raw_fd())?;
        self.vm.unregister_ioevent(
            &event.fd,
            &event.io_address(),
            event.length,
            event.datamatch,
        )?;
        self.registry
            .lock()
            .unwrap()
            .io_events
            .retain(|e| !Arc::ptr_eq(e, event));
        Ok(())
    }

    // The fixed prefix of the routing table: legacy PIC and IOAPIC
    // pins. GSI 2 is the cascade pin and stays unrouted; GSI 0 reaches
    // the IOAPIC on pin 2 for the same legacy wiring reason. All MSI
    // routes are allocated above this prefix.
    fn setup_gsi_routing_table(&self) -> Result<()> {
        let mut routes = Vec::new();

        for i in 0..8 {
            if i != 2 {
                routes.push(irqchip_route(i, KVM_IRQCHIP_PIC_MASTER, i));
            }
        }
        for i in 0..8 {
            routes.push(irqchip_route(8 + i, KVM_IRQCHIP_PIC_SLAVE, i));
        }
        for i in 0..24 {
            if i == 0 {
                routes.push(irqchip_route(0, KVM_IRQCHIP_IOAPIC, 2));
            } else if i != 2 {
                routes.push(irqchip_route(i, KVM_IRQCHIP_IOAPIC, i));
            }
        }

        {
            let mut registry = self.registry.lock().unwrap();
            registry.gsi_routes = routes;
            registry.next_gsi = GSI_MSI_BASE;
        }
        self.commit_gsi_routes()
    }

    // Pushes the whole table; the kernel interface has no incremental
    // update. The snapshot is taken under the lock, the ioctl runs
    // outside it.
    fn commit_gsi_routes(&self) -> Result<()> {
        let routes = self.registry.lock().unwrap().gsi_routes.clone();
        self.vm.set_gsi_routing(&routes)?;
        Ok(())
    }

    /// Asserts or deasserts a legacy interrupt line (GSI 0..23).
    pub fn set_irq(&self, line: u32, level: u32) -> Result<()> {
        self.vm.set_irq_line(line, level != 0)?;
        Ok(())
    }

    /// Fires a one-shot message-signalled interrupt. No routing entry
    /// needed.
    pub fn signal_msi(&self, address: u64, data: u32) -> Result<()> {
        self.vm.signal_msi(MsiMessage::new(address, data))?;
        Ok(())
    }

    /// Allocates a GSI, routes it to the MSI (address, data) pair and
    /// optionally binds `trigger` so signalling that fd raises the
    /// interrupt without calling back in here.
    pub fn add_msi_route(
        &self,
        address: u64,
        data: u32,
        trigger: Option<&EventFd>,
    ) -> Result<u32> {
        let gsi = {
            let mut registry = self.registry.lock().unwrap();
            let gsi = registry.next_gsi;
            registry.next_gsi += 1;
            registry.gsi_routes.push(msi_route(gsi, address, data));
            gsi
        };

        self.commit_gsi_routes()?;
        if let Some(trigger) = trigger {
            self.vm.register_irqfd(trigger, gsi)?;
        }
        Ok(gsi)
    }

    /// Rewrites an MSI route. An `address` of zero removes it,
    /// deassigning the irqfd when one is bound.
    pub fn update_msi_route(
        &self,
        gsi: u32,
        address: u64,
        data: u32,
        trigger: Option<&EventFd>,
    ) -> Result<()> {
        {
            let mut registry = self.registry.lock().unwrap();
            let index = registry
                .gsi_routes
                .iter()
                .position(|entry| entry.gsi == gsi)
                .ok_or(Error::GsiNotFound(gsi))?;

            if address == 0 {
                registry.gsi_routes.remove(index);
            } else {
                registry.gsi_routes[index] = msi_route(gsi, address, data);
            }
        }

        if let Some(trigger) = trigger {
            if address == 0 {
                self.vm.unregister_irqfd(trigger, gsi)?;
            } else {
                // Rebind: the fd may or may not already be attached.
                let _ = self.vm.unregister_irqfd(trigger, gsi);
                self.vm.register_irqfd(trigger, gsi)?;
            }
        }

        self.commit_gsi_routes()
    }

    #[cfg(test)]
    pub(crate) fn pio_handler_bases(&self) -> Vec<u64> {
        self.registry
            .lock()
            .unwrap()
            .pio_handlers
            .iter()
            .map(|h| h.resource.base)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn mmio_handler_bases(&self) -> Vec<u64> {
        self.registry
            .lock()
            .unwrap()
            .mmio_handlers
            .iter()
            .map(|h| h.resource.base)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn gsi_routes(&self) -> Vec<kvm_irq_routing_entry> {
        self.registry.lock().unwrap().gsi_routes.clone()
    }

    #[cfg(test)]
    pub(crate) fn armed_io_events(&self) -> Vec<Arc<IoEvent>> {
        self.registry.lock().unwrap().io_events.clone()
    }
}

fn irqchip_route(gsi: u32, chip: u32, pin: u32) -> kvm_irq_routing_entry {
    let mut entry = kvm_irq_routing_entry {
        gsi,
        type_: KVM_IRQ_ROUTING_IRQCHIP,
        ..Default::default()
    };
    entry.u.irqchip.irqchip = chip;
    entry.u.irqchip.pin = pin;
    entry
}

fn msi_route(gsi: u32, address: u64, data: u32) -> kvm_irq_routing_entry {
    let mut entry = kvm_irq_routing_entry {
        gsi,
        type_: KVM_IRQ_ROUTING_MSI,
        ..Default::default()
    };
    entry.u.msi.address_lo = address as u32;
    entry.u.msi.address_hi = (address >> 32) as u32;
    entry.u.msi.data = data;
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, PciAddress};
    use crate::testing::MockVm;
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq)]
    struct Access {
        write: bool,
        resource_base: u64,
        offset: u64,
        data: Vec<u8>,
    }

    struct TestDevice {
        name: String,
        resources: Vec<IoResource>,
        events: Vec<IoEventRequest>,
        pci: Option<PciAddress>,
        accesses: Arc<Mutex<Vec<Access>>>,
    }

    impl TestDevice {
        fn new(name: &str, resources: Vec<IoResource>) -> (DeviceHandle, Arc<Mutex<Vec<Access>>>) {
            let accesses = Arc::new(Mutex::new(Vec::new()));
            let device = TestDevice {
                name: name.to_string(),
                resources,
                events: Vec::new(),
                pci: None,
                accesses: accesses.clone(),
            };
            (Arc::new(Mutex::new(device)), accesses)
        }
    }

    impl Device for TestDevice {
        fn name(&self) -> &str {
            &self.name
        }

        fn io_resources(&self) -> Vec<IoResource> {
            self.resources.clone()
        }

        fn io_events(&self) -> Vec<IoEventRequest> {
            self.events.clone()
        }

        fn read(&mut self, resource: &IoResource, offset: u64, data: &mut [u8]) {
            data.fill(0x5a);
            self.accesses.lock().unwrap().push(Access {
                write: false,
                resource_base: resource.base,
                offset,
                data: data.to_vec(),
            });
        }

        fn write(&mut self, resource: &IoResource, offset: u64, data: &[u8]) {
            self.accesses.lock().unwrap().push(Access {
                write: true,
                resource_base: resource.base,
                offset,
                data: data.to_vec(),
            });
        }

        fn pci_address(&self) -> Option<PciAddress> {
            self.pci
        }
    }

    fn build_manager(
        devices: Vec<DeviceHandle>,
    ) -> (Arc<MockVm>, Arc<IoThread>, Arc<DeviceManager>) {
        let vm = Arc::new(MockVm::default());
        let io_thread = Arc::new(IoThread::new().unwrap());
        let memory = Arc::new(MemoryManager::new(vm.clone()));
        let manager =
            DeviceManager::new(vm.clone(), io_thread.clone(), memory, devices, false).unwrap();
        (vm, io_thread, manager)
    }

    #[test]
    fn test_unmapped_pio_reads_all_ones() {
        let (_vm, _io, manager) = build_manager(Vec::new());

        let mut data = [0u8; 4];
        manager.handle_pio(0xbeef, IoAccess::Read(&mut data), 4, 1, false);
        assert_eq!(u32::from_le_bytes(data), 0xffff_ffff);

        // Writes to nowhere are dropped on the floor.
        manager.handle_pio(0xbeef, IoAccess::Write(&[1, 2, 3, 4]), 4, 1, false);
    }

    #[test]
    fn test_mmio_move_to_front() {
        let bases = [0x1000u64, 0x2000, 0x3000, 0x4000, 0x5000];
        let resources = bases
            .iter()
            .map(|base| IoResource::mmio(*base, 0x100, "bar"))
            .collect();
        let (device, accesses) = TestDevice::new("mmio-dev", resources);
        let (_vm, _io, manager) = build_manager(vec![device]);

        assert_eq!(manager.mmio_handler_bases(), bases.to_vec());

        let read = |expected_order: &[u64]| {
            let mut data = [0u8; 4];
            manager.handle_mmio(0x4000, IoAccess::Read(&mut data), false);
            assert_eq!(data, [0x5a; 4]);
            assert_eq!(manager.mmio_handler_bases(), expected_order.to_vec());
        };

        // The first hit lands at scan index 3 and is promoted to the
        // front; every later access matches at the first probe and
        // the order stays put.
        read(&[0x4000, 0x1000, 0x2000, 0x3000, 0x5000]);
        for _ in 0..9 {
            read(&[0x4000, 0x1000, 0x2000, 0x3000, 0x5000]);
        }
        assert_eq!(accesses.lock().unwrap().len(), 10);

        // A hit at scan index 2 is too shallow to reorder anything.
        let mut data = [0u8; 4];
        manager.handle_mmio(0x2000, IoAccess::Read(&mut data), false);
        assert_eq!(
            manager.mmio_handler_bases(),
            vec![0x4000, 0x1000, 0x2000, 0x3000, 0x5000]
        );
    }

    #[test]
    fn test_io_handler_round_trip() {
        let (device, _accesses) =
            TestDevice::new("serial", vec![IoResource::pio(0x3f8, 8, "uart")]);
        let (_vm, _io, manager) = build_manager(vec![device.clone()]);

        let pio_before = manager.pio_handler_bases();
        let mmio_before = manager.mmio_handler_bases();
        let region_count = manager.memory_manager().regions().len();

        let extra_pio = IoResource::pio(0x2f8, 8, "uart2");
        let extra_mmio = IoResource::mmio(0xfebf_0000, 0x1000, "bar1");
        manager.register_io_handler(&device, &extra_pio).unwrap();
        manager.register_io_handler(&device, &extra_mmio).unwrap();
        assert_eq!(manager.pio_handler_bases().len(), pio_before.len() + 1);
        assert_eq!(
            manager.memory_manager().regions().len(),
            region_count + 1
        );

        manager.unregister_io_handler(&device, &extra_pio).unwrap();
        manager.unregister_io_handler(&device, &extra_mmio).unwrap();

        assert_eq!(manager.pio_handler_bases(), pio_before);
        assert_eq!(manager.mmio_handler_bases(), mmio_before);
        assert_eq!(manager.memory_manager().regions().len(), region_count);
    }

    #[test]
    fn test_rep_pio_presents_count_chunks() {
        let (device, accesses) =
            TestDevice::new("ide", vec![IoResource::pio(0x1f0, 8, "ata")]);
        let (_vm, _io, manager) = build_manager(vec![device]);

        let data: Vec<u8> = (0..12).collect();
        manager.handle_pio(0x1f0, IoAccess::Write(&data), 4, 3, false);

        let accesses = accesses.lock().unwrap();
        assert_eq!(accesses.len(), 3);
        for (i, access) in accesses.iter().enumerate() {
            assert!(access.write);
            assert_eq!(access.offset, 0);
            assert_eq!(access.data, data[i * 4..(i + 1) * 4].to_vec());
        }
    }

    #[test]
    fn test_pci_devfn_conflict_is_fatal() {
        let address = PciAddress { bus: 0, devfn: 0x18 };
        let pci_device = |name: &str| -> DeviceHandle {
            Arc::new(Mutex::new(TestDevice {
                name: name.to_string(),
                resources: Vec::new(),
                events: Vec::new(),
                pci: Some(address),
                accesses: Arc::new(Mutex::new(Vec::new())),
            }))
        };
        let device_a = pci_device("nic0");
        let device_b = pci_device("nic1");

        let vm = Arc::new(MockVm::default());
        let io_thread = Arc::new(IoThread::new().unwrap());
        let memory = Arc::new(MemoryManager::new(vm.clone()));
        let result = DeviceManager::new(vm, io_thread, memory, vec![device_a, device_b], false);
        assert!(matches!(result, Err(Error::PciDevfnConflict { .. })));
    }

    #[test]
    fn test_gsi_table_prefix() {
        let (vm, _io, manager) = build_manager(Vec::new());
        let routes = manager.gsi_routes();

        // Master pins 0,1,3..7 + slave pins 0..7 + IOAPIC pins for
        // every GSI but 2, with GSI 0 rerouted to pin 2.
        assert_eq!(routes.len(), 7 + 8 + 23);
        assert!(routes.iter().all(|entry| entry.gsi != 2));

        for entry in &routes {
            assert_eq!(entry.type_, KVM_IRQ_ROUTING_IRQCHIP);
            let (chip, pin) = unsafe { (entry.u.irqchip.irqchip, entry.u.irqchip.pin) };
            match entry.gsi {
                0 => assert!(
                    (chip == 0 && pin == 0) || (chip == 2 && pin == 2),
                    "gsi 0 routes to master pin 0 and ioapic pin 2"
                ),
                1..=7 => assert!(
                    (chip == 0 || chip == 2) && pin == entry.gsi,
                    "low gsi routes to its own pin"
                ),
                8..=15 => assert!(
                    (chip == 1 && pin == entry.gsi - 8) || (chip == 2 && pin == entry.gsi)
                ),
                16..=23 => assert_eq!((chip, pin), (2, entry.gsi)),
                _ => panic!("unexpected gsi {}", entry.gsi),
            }
        }

        // The whole table was pushed to the kernel.
        assert_eq!(vm.last_gsi_table().len(), routes.len());
    }

    #[test]
    fn test_msi_route_lifecycle() {
        let (vm, _io, manager) = build_manager(Vec::new());
        let baseline = manager.gsi_routes().len();

        let trigger = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        let g1 = manager
            .add_msi_route(0xfee0_0000, 0x40, Some(&trigger))
            .unwrap();
        let g2 = manager.add_msi_route(0xfee0_0000, 0x41, None).unwrap();
        assert!(g1 >= 24);
        assert_eq!(g2, g1 + 1);
        assert_eq!(manager.gsi_routes().len(), baseline + 2);
        assert_eq!(
            vm.irqfd_records(),
            vec![crate::testing::IrqFdRecord {
                gsi: g1,
                assigned: true
            }]
        );

        // Rewriting keeps the entry, updating its payload.
        manager.update_msi_route(g2, 0xfee0_1000, 0x99, None).unwrap();
        let entry = manager
            .gsi_routes()
            .into_iter()
            .find(|e| e.gsi == g2)
            .unwrap();
        assert_eq!(unsafe { entry.u.msi.address_lo }, 0xfee0_1000);
        assert_eq!(unsafe { entry.u.msi.data }, 0x99);

        // Address zero removes the route and deassigns the irqfd.
        manager.update_msi_route(g1, 0, 0, Some(&trigger)).unwrap();
        assert_eq!(manager.gsi_routes().len(), baseline + 1);
        assert_eq!(
            vm.irqfd_records().last().unwrap(),
            &crate::testing::IrqFdRecord {
                gsi: g1,
                assigned: false
            }
        );

        manager.update_msi_route(g2, 0, 0, None).unwrap();
        assert_eq!(manager.gsi_routes().len(), baseline);
        assert!(matches!(
            manager.update_msi_route(g2, 0, 0, None),
            Err(Error::GsiNotFound(_))
        ));

        assert_eq!(vm.last_gsi_table().len(), baseline);
    }

    #[test]
    fn test_irq_and_msi_passthrough() {
        let (vm, _io, manager) = build_manager(Vec::new());

        manager.set_irq(5, 1).unwrap();
        manager.set_irq(5, 0).unwrap();
        assert_eq!(vm.irq_lines(), vec![(5, true), (5, false)]);

        manager.signal_msi(0xfee0_0000, 0x31).unwrap();
        let signals = vm.msi_signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].address_lo, 0xfee0_0000);
        assert_eq!(signals[0].data, 0x31);
    }

    #[test]
    fn test_ioeventfd_round_trip() {
        let accesses = Arc::new(Mutex::new(Vec::new()));
        let device: DeviceHandle = Arc::new(Mutex::new(TestDevice {
            name: "kbd".to_string(),
            resources: vec![IoResource::pio(0x60, 4, "ps2")],
            events: vec![IoEventRequest {
                kind: IoResourceKind::Pio,
                address: 0x60,
                length: 1,
                datamatch: 0xaa,
            }],
            pci: None,
            accesses: accesses.clone(),
        }));

        let (vm, io_thread, manager) = build_manager(vec![device]);
        io_thread.start().unwrap();

        let records = vm.ioevent_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].addr, IoEventAddress::Pio(0x60));
        assert_eq!(records[0].len, 1);
        assert_eq!(records[0].datamatch, 0xaa);
        assert!(records[0].assigned);

        // The guest wrote the magic value; the kernel swallowed it and
        // signalled the fd. The device must see the synthesized write
        // shortly after.
        let event = manager.armed_io_events()[0].clone();
        event.fd.write(1).unwrap();

        let deadline = Instant::now() + Duration::from_millis(500);
        loop {
            {
                let accesses = accesses.lock().unwrap();
                if !accesses.is_empty() {
                    assert_eq!(
                        *accesses,
                        vec![Access {
                            write: true,
                            resource_base: 0x60,
                            offset: 0,
                            data: vec![0xaa],
                        }]
                    );
                    break;
                }
            }
            assert!(Instant::now() < deadline, "ioeventfd never dispatched");
            std::thread::sleep(Duration::from_millis(5));
        }

        // Disarming stops both the kernel binding and the polling.
        manager.unregister_io_event(&event).unwrap();
        assert!(manager.armed_io_events().is_empty());
        assert!(!vm.ioevent_records().last().unwrap().assigned);

        event.fd.write(1).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(accesses.lock().unwrap().len(), 1);

        io_thread.stop();
    }
}
