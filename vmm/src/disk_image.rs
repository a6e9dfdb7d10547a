// Copyright © 2024 The Kestrel Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Disk image backends.
//!
//! Block devices see a disk through this trait: sector geometry plus
//! asynchronous read/write/flush whose completion callbacks run on
//! the I/O thread with the kernel return value. Only the raw format
//! lives here; anything fancier plugs in behind the same trait.

use crate::io_thread::{IoCallback, IoThread};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to open disk image {0}: {1}")]
    OpenImage(PathBuf, #[source] std::io::Error),

    #[error("Failed to query disk image {0}: {1}")]
    QueryImage(PathBuf, #[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub const SECTOR_SIZE: u64 = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageInformation {
    pub block_size: u64,
    pub total_blocks: u64,
}

/// A guest visible disk. Buffers handed in must stay valid until the
/// completion callback has run.
pub trait DiskImage: Send + Sync {
    fn information(&self) -> ImageInformation;

    /// Reads `length` bytes at byte `position` into `buffer`.
    fn read(&self, buffer: *mut u8, position: u64, length: usize, callback: IoCallback);

    /// Writes `length` bytes at byte `position` from `buffer`.
    fn write(&self, buffer: *const u8, position: u64, length: usize, callback: IoCallback);

    /// Flushes the write cache.
    fn flush(&self, callback: IoCallback);
}

/// A raw file image: the file bytes are the disk bytes.
pub struct RawImage {
    file: File,
    io: Arc<IoThread>,
    total_blocks: u64,
    readonly: bool,
}

impl RawImage {
    pub fn open(io: Arc<IoThread>, path: &Path, readonly: bool) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(!readonly)
            .open(path)
            .map_err(|e| Error::OpenImage(path.to_path_buf(), e))?;
        let len = file
            .metadata()
            .map_err(|e| Error::QueryImage(path.to_path_buf(), e))?
            .len();

        Ok(RawImage {
            file,
            io,
            total_blocks: len / SECTOR_SIZE,
            readonly,
        })
    }
}

impl DiskImage for RawImage {
    fn information(&self) -> ImageInformation {
        ImageInformation {
            block_size: SECTOR_SIZE,
            total_blocks: self.total_blocks,
        }
    }

    fn read(&self, buffer: *mut u8, position: u64, length: usize, callback: IoCallback) {
        self.io
            .read(self.file.as_raw_fd(), buffer, length, position, callback);
    }

    fn write(&self, buffer: *const u8, position: u64, length: usize, callback: IoCallback) {
        if self.readonly {
            callback(0);
            return;
        }
        self.io
            .write(self.file.as_raw_fd(), buffer, length, position, callback);
    }

    fn flush(&self, callback: IoCallback) {
        if self.readonly {
            callback(0);
            return;
        }
        self.io.fsync(self.file.as_raw_fd(), false, callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::sync::mpsc;
    use std::time::Duration;
    use vmm_sys_util::tempfile::TempFile;

    fn io_uring_available() -> bool {
        io_uring::IoUring::new(2).is_ok()
    }

    #[test]
    fn test_raw_image_information() {
        let file = TempFile::new().unwrap();
        let mut f = file.as_file();
        f.write_all(&vec![0u8; 8192]).unwrap();

        let io = Arc::new(IoThread::new().unwrap());
        let image = RawImage::open(io, file.as_path(), true).unwrap();
        assert_eq!(
            image.information(),
            ImageInformation {
                block_size: 512,
                total_blocks: 16,
            }
        );
    }

    #[test]
    fn test_readonly_write_completes_without_touching_disk() {
        let file = TempFile::new().unwrap();
        let mut f = file.as_file();
        f.write_all(&vec![0u8; 4096]).unwrap();

        let io = Arc::new(IoThread::new().unwrap());
        let image = RawImage::open(io, file.as_path(), true).unwrap();

        let data = [0xabu8; 512];
        let (tx, rx) = mpsc::channel();
        image.write(
            data.as_ptr(),
            0,
            data.len(),
            Box::new(move |ret| tx.send(ret).unwrap()),
        );
        assert_eq!(rx.recv_timeout(Duration::from_millis(100)).unwrap(), 0);
    }

    #[test]
    fn test_raw_image_round_trip() {
        if !io_uring_available() {
            return;
        }

        let file = TempFile::new().unwrap();
        let mut f = file.as_file();
        f.write_all(&vec![0u8; 8192]).unwrap();

        let io = Arc::new(IoThread::new().unwrap());
        io.start().unwrap();
        let image = RawImage::open(io.clone(), file.as_path(), false).unwrap();

        let payload = [0x5au8; 1024];
        let (tx, rx) = mpsc::channel();
        image.write(
            payload.as_ptr(),
            2048,
            payload.len(),
            Box::new(move |ret| tx.send(ret).unwrap()),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap() as usize,
            payload.len()
        );

        let mut read_back = [0u8; 1024];
        let (tx, rx) = mpsc::channel();
        image.read(
            read_back.as_mut_ptr(),
            2048,
            read_back.len(),
            Box::new(move |ret| tx.send(ret).unwrap()),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap() as usize,
            read_back.len()
        );
        assert_eq!(read_back, payload);

        let (tx, rx) = mpsc::channel();
        image.flush(Box::new(move |ret| tx.send(ret).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);

        io.stop();
    }
}
