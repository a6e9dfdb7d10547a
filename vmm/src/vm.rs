// Copyright © 2024 The Kestrel Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Machine lifecycle.
//!
//! The machine owns every subsystem and builds them in dependency
//! order: hypervisor handles, guest memory, firmware, the in-kernel
//! interrupt hardware, vCPUs, the I/O thread and finally the device
//! tree. Reset is a strict barrier: no vCPU re-enters the guest
//! between the firmware restore and its own architectural reset.

use crate::config::{MachineConfig, ObjectConfig};
use crate::cpu::{Vcpu, VcpuTask};
use crate::device::{create_device, DeviceHandle};
use crate::device_manager::DeviceManager;
use crate::io_thread::IoThread;
use crate::memory_manager::{host_page_size, MemoryBacking, MemoryKind, MemoryManager};
use hypervisor::Hypervisor;
use libc::EFD_NONBLOCK;
use log::{debug, info};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use thiserror::Error;
use vm_memory::mmap::MmapRegion;
use vmm_sys_util::eventfd::EventFd;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] crate::config::Error),

    #[error("Hypervisor error: {0}")]
    Hypervisor(#[from] hypervisor::HypervisorError),

    #[error("VM operation failed: {0}")]
    HypervisorVm(#[from] hypervisor::HypervisorVmError),

    #[error("Memory error: {0}")]
    Memory(#[from] crate::memory_manager::Error),

    #[error("vCPU error: {0}")]
    Cpu(#[from] crate::cpu::Error),

    #[error("Device manager error: {0}")]
    DeviceManager(#[from] crate::device_manager::Error),

    #[error("Device error: {0}")]
    Device(#[from] crate::device::Error),

    #[error("I/O thread error: {0}")]
    IoThread(#[from] crate::io_thread::Error),

    #[error("Failed to load BIOS {0}: {1}")]
    BiosLoadFailed(PathBuf, #[source] std::io::Error),

    #[error("BIOS image of {0} bytes does not fit its mapping windows")]
    BiosSizeInvalid(usize),

    #[error("Failed to allocate BIOS buffer: {0}")]
    BiosAllocate(#[source] vm_memory::mmap::MmapRegionError),

    #[error("No system-root device in the configuration")]
    SystemRootMissing,

    #[error("Object {0} has an unknown or cyclic parent")]
    BadDeviceTree(String),

    #[error("Failed to create an event fd: {0}")]
    CreateEventFd(#[source] std::io::Error),

    #[error("Waiting for machine events failed: {0}")]
    WaitEvents(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// EPT identity map plus TSS: four pages the guest must never see.
const X86_EPT_IDENTITY_BASE: u64 = 0xfeff_c000;

// Q35 guest physical layout.
const LOW_RAM_SPLIT: u64 = 0xa_0000; // 640K of conventional memory
const RAM_MAIN_START: u64 = 0x10_0000; // above the legacy hole
const LOW_RAM_TOP: u64 = 0xe000_0000; // PCI hole up to 4G
const HIGH_RAM_START: u64 = 0x1_0000_0000;

const BIOS_LOW_WINDOW_TOP: u64 = 0x10_0000;
const BIOS_HIGH_WINDOW_TOP: u64 = 0x1_0000_0000;
// The low window must stay above the 640K conventional memory.
const BIOS_MAX_SIZE: u64 = BIOS_LOW_WINDOW_TOP - LOW_RAM_SPLIT;

struct BiosImage {
    backing: Arc<MmapRegion>,
    backup: Vec<u8>,
}

impl BiosImage {
    fn restore(&self) {
        // SAFETY: the backing was allocated with at least backup.len()
        // bytes and stays alive as long as the machine.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.backup.as_ptr(),
                self.backing.as_ptr(),
                self.backup.len(),
            );
        }
    }
}

pub struct Machine {
    config: MachineConfig,
    memory: Arc<MemoryManager>,
    io_thread: Arc<IoThread>,
    device_manager: Arc<DeviceManager>,
    vcpus: Vec<Vcpu>,
    bios: BiosImage,
    kill_signalled: Arc<AtomicBool>,
    pause_signalled: Arc<AtomicBool>,
    exit_evt: EventFd,
    reset_evt: EventFd,
}

impl Machine {
    /// Builds a machine on the host hypervisor.
    pub fn new(config: MachineConfig) -> Result<Self> {
        let hypervisor = hypervisor::new()?;
        Machine::with_hypervisor(config, hypervisor)
    }

    pub fn with_hypervisor(
        config: MachineConfig,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Result<Self> {
        let ram_size = config.ram_size()?;

        let mmap_size = hypervisor.get_vcpu_mmap_size()?;
        debug!("vCPU run structure is {} bytes", mmap_size);

        let vm = hypervisor.create_vm()?;
        let memory = Arc::new(MemoryManager::new(vm.clone()));

        create_ram(&memory, ram_size)?;
        let bios = load_bios(&memory, &config.bios)?;

        // vm86 emulation on older hosts needs an identity map and a
        // TSS inside guest physical memory; reserve those pages so no
        // RAM or BAR ever lands there.
        vm.set_identity_map_address(X86_EPT_IDENTITY_BASE)?;
        vm.set_tss_address((X86_EPT_IDENTITY_BASE + 0x1000) as usize)?;
        memory.map(
            X86_EPT_IDENTITY_BASE,
            4 * host_page_size(),
            None,
            MemoryKind::Reserved,
            "ept+tss",
        )?;
        vm.create_irq_chip()?;
        vm.create_pit()?;

        let cpuid = hypervisor.get_supported_cpuid()?;
        let mut vcpus = Vec::with_capacity(config.vcpu as usize);
        for id in 0..config.vcpu {
            vcpus.push(Vcpu::new(id as u8, &vm, cpuid.clone())?);
        }

        let io_thread = Arc::new(IoThread::new()?);

        let devices = build_device_tree(&config.objects)?;
        let device_manager = DeviceManager::new(
            vm.clone(),
            io_thread.clone(),
            memory.clone(),
            devices,
            config.debug,
        )?;

        Ok(Machine {
            config,
            memory,
            io_thread,
            device_manager,
            vcpus,
            bios,
            kill_signalled: Arc::new(AtomicBool::new(false)),
            pause_signalled: Arc::new(AtomicBool::new(false)),
            exit_evt: EventFd::new(EFD_NONBLOCK).map_err(Error::CreateEventFd)?,
            reset_evt: EventFd::new(EFD_NONBLOCK).map_err(Error::CreateEventFd)?,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn device_manager(&self) -> &Arc<DeviceManager> {
        &self.device_manager
    }

    /// Starts every vCPU thread, then the I/O thread.
    pub fn run(&mut self) -> Result<()> {
        let barrier = Arc::new(Barrier::new(self.vcpus.len() + 1));
        for vcpu in self.vcpus.iter_mut() {
            vcpu.start(
                self.device_manager.clone(),
                barrier.clone(),
                self.kill_signalled.clone(),
                self.pause_signalled.clone(),
                self.reset_evt.try_clone().map_err(Error::CreateEventFd)?,
                self.exit_evt.try_clone().map_err(Error::CreateEventFd)?,
            )?;
        }
        barrier.wait();
        self.io_thread.start()?;

        info!(
            "machine running: {} vCPUs, {} RAM, {} devices",
            self.config.vcpu,
            self.config.memory,
            self.config.objects.len()
        );
        if self.config.debug {
            self.device_manager.print_devices();
            debug!("guest memory map:\n{}", self.memory);
        }
        Ok(())
    }

    /// Blocks until the machine quits, servicing reset requests.
    pub fn wait(&mut self) -> Result<()> {
        let epoll_fd = epoll::create(true).map_err(Error::WaitEvents)?;
        // SAFETY: freshly created owned fd.
        let epoll_file = unsafe { std::fs::File::from_raw_fd(epoll_fd) };
        for fd in [self.exit_evt.as_raw_fd(), self.reset_evt.as_raw_fd()] {
            epoll::ctl(
                epoll_file.as_raw_fd(),
                epoll::ControlOptions::EPOLL_CTL_ADD,
                fd,
                epoll::Event::new(epoll::Events::EPOLLIN, fd as u64),
            )
            .map_err(Error::WaitEvents)?;
        }

        let mut events = vec![epoll::Event::new(epoll::Events::empty(), 0); 2];
        loop {
            let count = match epoll::wait(epoll_file.as_raw_fd(), -1, &mut events[..]) {
                Ok(count) => count,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::WaitEvents(e)),
            };
            for event in events.iter().take(count) {
                let fd = event.data as i32;
                if fd == self.reset_evt.as_raw_fd() {
                    let _ = self.reset_evt.read();
                    self.reset();
                } else if fd == self.exit_evt.as_raw_fd() {
                    let _ = self.exit_evt.read();
                    return Ok(());
                }
            }
        }
    }

    /// Parks every vCPU at its loop boundary.
    pub fn pause(&mut self) {
        if self.pause_signalled.swap(true, Ordering::SeqCst) {
            return;
        }
        for vcpu in &self.vcpus {
            vcpu.kick_sync();
        }
    }

    /// Lets paused vCPUs re-enter the guest.
    pub fn resume(&mut self) {
        if !self.pause_signalled.swap(false, Ordering::SeqCst) {
            return;
        }
        for vcpu in &self.vcpus {
            vcpu.unpark();
        }
    }

    /// Full machine reset: firmware restored from its pristine copy,
    /// devices reset, every vCPU back at the reset vector. vCPUs are
    /// held at the barrier for the whole sequence.
    pub fn reset(&mut self) {
        info!("machine reset");
        self.pause();

        self.bios.restore();
        self.device_manager.reset_devices();
        for vcpu in &self.vcpus {
            vcpu.schedule(VcpuTask::Reset);
        }

        self.resume();
    }

    /// Tears the machine down. Idempotent.
    pub fn quit(&mut self) {
        if self.kill_signalled.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("machine quitting");

        // Wake anything parked in a pause or shutdown wait as well.
        self.pause_signalled.store(false, Ordering::SeqCst);
        for vcpu in &self.vcpus {
            vcpu.kick();
            vcpu.unpark();
        }
        for vcpu in self.vcpus.iter_mut() {
            vcpu.join();
        }

        self.io_thread.stop();
        self.device_manager.disconnect_devices();
        let _ = self.exit_evt.write(1);
    }

    /// Asks a running `wait()` to return.
    pub fn exit_handle(&self) -> Result<EventFd> {
        self.exit_evt.try_clone().map_err(Error::CreateEventFd)
    }

    #[cfg(test)]
    pub(crate) fn bios_windows(&self) -> (u64, u64, usize) {
        let size = self.bios.backup.len() as u64;
        (
            BIOS_LOW_WINDOW_TOP - size,
            BIOS_HIGH_WINDOW_TOP - size,
            size as usize,
        )
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.quit();
    }
}

// Guest RAM, carved around the legacy hole below 1MiB and the PCI
// hole below 4GiB. The configured size is what the guest actually
// gets; the windows in between stay free for firmware and BARs.
fn create_ram(memory: &Arc<MemoryManager>, ram_size: u64) -> Result<()> {
    let mut remaining = ram_size;

    let low = remaining.min(LOW_RAM_SPLIT);
    let backing = MemoryBacking {
        mmap: memory.allocate_backing(low as usize)?,
        offset: 0,
    };
    memory.map(0, low, Some(backing), MemoryKind::Ram, "ram-low")?;
    remaining -= low;

    if remaining > 0 {
        let main = remaining.min(LOW_RAM_TOP - RAM_MAIN_START);
        let backing = MemoryBacking {
            mmap: memory.allocate_backing(main as usize)?,
            offset: 0,
        };
        memory.map(RAM_MAIN_START, main, Some(backing), MemoryKind::Ram, "ram-main")?;
        remaining -= main;
    }

    if remaining > 0 {
        let backing = MemoryBacking {
            mmap: memory.allocate_backing(remaining as usize)?,
            offset: 0,
        };
        memory.map(
            HIGH_RAM_START,
            remaining,
            Some(backing),
            MemoryKind::Ram,
            "ram-high",
        )?;
    }

    Ok(())
}

// The firmware lands twice in the address space, once below 1MiB and
// once below 4GiB, backed by the same writable buffer. A pristine
// copy is kept aside for machine reset.
fn load_bios(memory: &Arc<MemoryManager>, path: &std::path::Path) -> Result<BiosImage> {
    let backup =
        std::fs::read(path).map_err(|e| Error::BiosLoadFailed(path.to_path_buf(), e))?;
    let size = backup.len() as u64;
    if size == 0 || size % host_page_size() != 0 || size > BIOS_MAX_SIZE {
        return Err(Error::BiosSizeInvalid(backup.len()));
    }

    let backing = Arc::new(MmapRegion::new(backup.len()).map_err(Error::BiosAllocate)?);
    let bios = BiosImage { backing, backup };
    bios.restore();

    for window_top in [BIOS_LOW_WINDOW_TOP, BIOS_HIGH_WINDOW_TOP] {
        memory.map(
            window_top - size,
            size,
            Some(MemoryBacking {
                mmap: bios.backing.clone(),
                offset: 0,
            }),
            MemoryKind::Ram,
            "seabios",
        )?;
    }

    Ok(bios)
}

// Orders the configured objects parents-first and instantiates them.
// The system-root device anchors the tree.
fn build_device_tree(objects: &[ObjectConfig]) -> Result<Vec<DeviceHandle>> {
    if !objects.iter().any(|o| o.class == "system-root") {
        return Err(Error::SystemRootMissing);
    }

    let mut placed: Vec<&ObjectConfig> = Vec::with_capacity(objects.len());
    let mut pending: Vec<&ObjectConfig> = objects.iter().collect();
    while !pending.is_empty() {
        let before = placed.len();
        pending.retain(|object| {
            let ready = match &object.parent {
                None => true,
                Some(parent) => placed.iter().any(|p| p.instance_name() == parent.as_str()),
            };
            if ready {
                placed.push(*object);
            }
            !ready
        });
        if placed.len() == before {
            // Nothing progressed: unknown parent or a cycle.
            return Err(Error::BadDeviceTree(
                pending[0].instance_name().to_string(),
            ));
        }
    }

    placed.into_iter().map(create_device).collect::<std::result::Result<_, _>>()
        .map_err(Error::Device)
}
