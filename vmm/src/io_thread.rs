// Copyright © 2024 The Kestrel Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The dedicated I/O thread.
//!
//! A single epoll reactor dispatches fd readiness callbacks (ioeventfd
//! wakeups, device backends) and io_uring completions for asynchronous
//! disk I/O. Submissions may come from any thread; every callback runs
//! on the I/O thread. Device callbacks must not block here, anything
//! long-running has to be resubmitted as I/O.

use io_uring::{opcode, types, IoUring};
use libc::EFD_NONBLOCK;
use log::{error, warn};
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to create the epoll fd: {0}")]
    CreateEpoll(#[source] std::io::Error),

    #[error("Failed to create an event fd: {0}")]
    CreateEventFd(#[source] std::io::Error),

    #[error("epoll_ctl failed: {0}")]
    EpollCtl(#[source] std::io::Error),

    #[error("fd {0} is already being polled")]
    AlreadyPolling(RawFd),

    #[error("fd {0} is not being polled")]
    NotPolling(RawFd),

    #[error("Failed to spawn the I/O thread: {0}")]
    SpawnThread(#[source] std::io::Error),

    #[error("Failed to notify the I/O thread: {0}")]
    Notify(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Invoked on the I/O thread with the readiness mask of the fd.
pub type PollCallback = Box<dyn FnMut(epoll::Events) + Send>;

/// Invoked on the I/O thread with the kernel result of an async
/// submission: bytes transferred, or a negated errno.
pub type IoCallback = Box<dyn FnOnce(i32) + Send>;

const IO_URING_ENTRIES: u32 = 256;
// Rounds of 100ms granted to in-flight submissions at teardown.
const DRAIN_ROUNDS: u32 = 50;

struct PollSlot {
    // Taken out while its callback runs so the registry lock is not
    // held across device code.
    handler: Option<PollCallback>,
    stopped: bool,
}

struct Ring {
    ring: IoUring,
    evt: EventFd,
}

struct IoThreadShared {
    epoll_file: File,
    wake_evt: EventFd,
    kill_evt: EventFd,
    poll: Mutex<HashMap<RawFd, PollSlot>>,
    poll_returned: Condvar,
    // Created on first submission; registration of its completion
    // eventfd in the epoll set is safe from any thread.
    ring: Mutex<Option<Ring>>,
    completions: Mutex<HashMap<u64, IoCallback>>,
    next_token: AtomicU64,
    scheduled: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    thread_id: OnceLock<thread::ThreadId>,
}

pub struct IoThread {
    shared: Arc<IoThreadShared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl IoThread {
    pub fn new() -> Result<Self> {
        let epoll_fd = epoll::create(true).map_err(Error::CreateEpoll)?;
        // SAFETY: epoll_fd is a freshly created, owned fd.
        let epoll_file = unsafe { File::from_raw_fd(epoll_fd) };

        let wake_evt = EventFd::new(EFD_NONBLOCK).map_err(Error::CreateEventFd)?;
        let kill_evt = EventFd::new(EFD_NONBLOCK).map_err(Error::CreateEventFd)?;

        let shared = Arc::new(IoThreadShared {
            epoll_file,
            wake_evt,
            kill_evt,
            poll: Mutex::new(HashMap::new()),
            poll_returned: Condvar::new(),
            ring: Mutex::new(None),
            completions: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            scheduled: Mutex::new(Vec::new()),
            thread_id: OnceLock::new(),
        });

        shared.epoll_add(shared.wake_evt.as_raw_fd())?;
        shared.epoll_add(shared.kill_evt.as_raw_fd())?;

        Ok(IoThread {
            shared,
            handle: Mutex::new(None),
        })
    }

    pub fn start(&self) -> Result<()> {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("io-thread".to_string())
            .spawn(move || {
                shared.thread_id.set(thread::current().id()).ok();
                shared.run();
            })
            .map_err(Error::SpawnThread)?;
        *self.handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stops the reactor. In-flight submissions are drained first,
    /// they cannot be cancelled.
    pub fn stop(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if self.shared.kill_evt.write(1).is_ok() {
                let _ = handle.join();
            }
        }
    }

    /// Adds an fd to the reactor. The callback runs on the I/O thread
    /// each time the fd is ready.
    pub fn start_polling(
        &self,
        fd: RawFd,
        events: epoll::Events,
        callback: PollCallback,
    ) -> Result<()> {
        let mut poll = self.shared.poll.lock().unwrap();
        if poll.contains_key(&fd) {
            return Err(Error::AlreadyPolling(fd));
        }
        poll.insert(
            fd,
            PollSlot {
                handler: Some(callback),
                stopped: false,
            },
        );
        drop(poll);

        epoll::ctl(
            self.shared.epoll_file.as_raw_fd(),
            epoll::ControlOptions::EPOLL_CTL_ADD,
            fd,
            epoll::Event::new(events, fd as u64),
        )
        .map_err(Error::EpollCtl)
    }

    /// Removes an fd from the reactor. On return no further callback
    /// for this fd will run, even for readiness already drained; if
    /// one is running on the I/O thread right now, this blocks until
    /// it finishes.
    pub fn stop_polling(&self, fd: RawFd) -> Result<()> {
        // Dropping the interest first bounds the callbacks we can
        // still observe to the batch currently being dispatched.
        let _ = epoll::ctl(
            self.shared.epoll_file.as_raw_fd(),
            epoll::ControlOptions::EPOLL_CTL_DEL,
            fd,
            epoll::Event::new(epoll::Events::empty(), 0),
        );

        let mut poll = self.shared.poll.lock().unwrap();
        let in_flight = match poll.get_mut(&fd) {
            None => return Err(Error::NotPolling(fd)),
            Some(slot) if slot.handler.is_some() => false,
            Some(slot) => {
                // Callback in flight. Mark it and, unless we are that
                // very callback, wait for the dispatcher to retire it.
                slot.stopped = true;
                true
            }
        };
        if !in_flight {
            poll.remove(&fd);
        } else if self.shared.thread_id.get().copied() != Some(thread::current().id()) {
            while poll.contains_key(&fd) {
                poll = self.shared.poll_returned.wait(poll).unwrap();
            }
        }
        Ok(())
    }

    /// Runs a closure on the I/O thread.
    pub fn schedule(&self, callback: Box<dyn FnOnce() + Send>) -> Result<()> {
        self.shared.scheduled.lock().unwrap().push(callback);
        self.shared.wake_evt.write(1).map_err(Error::Notify)
    }

    /// Submits an asynchronous read of `len` bytes at `offset` into
    /// `buf`. The buffer must stay valid until the callback runs.
    pub fn read(&self, fd: RawFd, buf: *mut u8, len: usize, offset: u64, callback: IoCallback) {
        let entry = opcode::Read::new(types::Fd(fd), buf, len as u32)
            .offset(offset)
            .build();
        self.shared.submit(entry, callback);
    }

    /// Submits an asynchronous write of `len` bytes at `offset` from
    /// `buf`. The buffer must stay valid until the callback runs.
    pub fn write(&self, fd: RawFd, buf: *const u8, len: usize, offset: u64, callback: IoCallback) {
        let entry = opcode::Write::new(types::Fd(fd), buf, len as u32)
            .offset(offset)
            .build();
        self.shared.submit(entry, callback);
    }

    /// Submits an asynchronous fsync (or fdatasync).
    pub fn fsync(&self, fd: RawFd, datasync: bool, callback: IoCallback) {
        let flags = if datasync {
            types::FsyncFlags::DATASYNC
        } else {
            types::FsyncFlags::empty()
        };
        let entry = opcode::Fsync::new(types::Fd(fd)).flags(flags).build();
        self.shared.submit(entry, callback);
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl IoThreadShared {
    fn epoll_add(&self, fd: RawFd) -> Result<()> {
        epoll::ctl(
            self.epoll_file.as_raw_fd(),
            epoll::ControlOptions::EPOLL_CTL_ADD,
            fd,
            epoll::Event::new(epoll::Events::EPOLLIN, fd as u64),
        )
        .map_err(Error::EpollCtl)
    }

    fn submit(&self, entry: io_uring::squeue::Entry, callback: IoCallback) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let entry = entry.user_data(token);

        self.completions.lock().unwrap().insert(token, callback);

        let mut ring_guard = self.ring.lock().unwrap();
        if ring_guard.is_none() {
            match self.create_ring() {
                Ok(ring) => *ring_guard = Some(ring),
                Err(e) => {
                    drop(ring_guard);
                    warn!("Async I/O unavailable: {}", e);
                    self.complete(token, -e.raw_os_error().unwrap_or(libc::ENOSYS));
                    return;
                }
            }
        }
        let ring = ring_guard.as_mut().unwrap();

        loop {
            // SAFETY: the submission entry only references the caller
            // provided buffer, which outlives the completion per the
            // API contract.
            let push_result = unsafe { ring.ring.submission().push(&entry) };
            match push_result {
                Ok(()) => break,
                Err(_) => {
                    // Queue full, flush it and retry.
                    if let Err(e) = ring.ring.submit() {
                        drop(ring_guard);
                        self.complete(token, -e.raw_os_error().unwrap_or(libc::EIO));
                        return;
                    }
                }
            }
        }
        if let Err(e) = ring.ring.submit() {
            drop(ring_guard);
            self.complete(token, -e.raw_os_error().unwrap_or(libc::EIO));
        }
    }

    fn create_ring(&self) -> std::io::Result<Ring> {
        let ring = IoUring::new(IO_URING_ENTRIES)?;
        let evt = EventFd::new(EFD_NONBLOCK)?;
        ring.submitter().register_eventfd(evt.as_raw_fd())?;
        self.epoll_add(evt.as_raw_fd())
            .map_err(|_| std::io::Error::from_raw_os_error(libc::EBADF))?;
        Ok(Ring { ring, evt })
    }

    fn complete(&self, token: u64, result: i32) {
        if let Some(callback) = self.completions.lock().unwrap().remove(&token) {
            callback(result);
        }
    }

    fn process_completions(&self) {
        let mut done = Vec::new();
        {
            let mut ring_guard = self.ring.lock().unwrap();
            if let Some(ring) = ring_guard.as_mut() {
                let _ = ring.evt.read();
                for cqe in ring.ring.completion() {
                    done.push((cqe.user_data(), cqe.result()));
                }
            }
        }
        // Callbacks run without the ring lock so they may submit
        // follow-up I/O.
        for (token, result) in done {
            self.complete(token, result);
        }
    }

    fn dispatch(&self, fd: RawFd, events: epoll::Events) {
        let mut poll = self.poll.lock().unwrap();
        let Some(slot) = poll.get_mut(&fd) else {
            return;
        };
        if slot.stopped {
            return;
        }
        let Some(mut handler) = slot.handler.take() else {
            return;
        };
        drop(poll);

        handler(events);

        let mut poll = self.poll.lock().unwrap();
        let keep = matches!(poll.get_mut(&fd), Some(slot) if !slot.stopped);
        if keep {
            poll.get_mut(&fd).unwrap().handler = Some(handler);
        } else {
            poll.remove(&fd);
            self.poll_returned.notify_all();
        }
    }

    fn run(&self) {
        const EPOLL_EVENTS_LEN: usize = 64;
        let mut events =
            vec![epoll::Event::new(epoll::Events::empty(), 0); EPOLL_EVENTS_LEN];

        let wake_fd = self.wake_evt.as_raw_fd();
        let kill_fd = self.kill_evt.as_raw_fd();

        loop {
            let num_events =
                match epoll::wait(self.epoll_file.as_raw_fd(), -1, &mut events[..]) {
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!("I/O thread epoll_wait failed: {}", e);
                        return;
                    }
                };

            for event in events.iter().take(num_events) {
                let fd = event.data as RawFd;
                if fd == kill_fd {
                    self.drain();
                    return;
                } else if fd == wake_fd {
                    let _ = self.wake_evt.read();
                    let scheduled: Vec<_> =
                        std::mem::take(&mut *self.scheduled.lock().unwrap());
                    for callback in scheduled {
                        callback();
                    }
                } else if self.is_ring_evt(fd) {
                    self.process_completions();
                } else {
                    self.dispatch(fd, epoll::Events::from_bits_truncate(event.events));
                }
            }
        }
    }

    fn is_ring_evt(&self, fd: RawFd) -> bool {
        self.ring
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.evt.as_raw_fd() == fd)
            .unwrap_or(false)
    }

    fn drain(&self) {
        for _ in 0..DRAIN_ROUNDS {
            self.process_completions();
            if self.completions.lock().unwrap().is_empty() {
                return;
            }
            thread::sleep(std::time::Duration::from_millis(100));
        }
        warn!(
            "Abandoning {} in-flight I/O submissions at teardown",
            self.completions.lock().unwrap().len()
        );
    }
}
