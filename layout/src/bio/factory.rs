// SPDX-License-Identifier: MPL-2.0

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    sync::{Arc, Mutex, RwLock},
};

use crate::prelude::*;

/// How a backing store is opened.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IoAccess {
    ReadOnly,
    ReadWrite,
    CreateReadWrite,
}

/// A window of contiguous bytes on a backing store.
///
/// A region supports positioned reads and writes within its window only;
/// operations outside the window fail.
pub trait IoRegion: Send {
    /// Returns the size of the window in bytes.
    fn num_bytes(&self) -> u64;

    /// Reads bytes at an offset within the window.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes bytes at an offset within the window.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Ensures previously written bytes are persisted.
    fn flush(&self) -> Result<()>;
}

/// A handle on a named backing store that hands out [`IoRegion`] windows.
///
/// # Thread safety
///
/// A factory is a data structure of interior mutability; opening regions
/// takes `&self`. The layout above it is single-actor, so regions are not
/// expected to race with `replace_storage`.
pub trait IoFactory {
    type Region: IoRegion;

    /// Returns the writable capacity of the backing store in bytes.
    fn writable_size(&self) -> Result<u64>;

    /// Opens a region over `[start_byte, start_byte + num_bytes)`.
    fn open_region(&self, start_byte: u64, num_bytes: u64) -> Result<Self::Region>;

    /// Swaps the backing store for another, retaining in-memory state.
    fn replace_storage(&self, name: &str) -> Result<()>;
}

fn open_file(name: &str, access: IoAccess) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    match access {
        IoAccess::ReadOnly => {}
        IoAccess::ReadWrite => {
            options.write(true);
        }
        IoAccess::CreateReadWrite => {
            options.write(true).create(true);
        }
    }
    let file = options.open(name)?;
    Ok(file)
}

/// A backing store on a device node or regular file.
pub struct FileIoFactory {
    file: RwLock<Arc<File>>,
    access: IoAccess,
}

impl FileIoFactory {
    /// Opens the named file or device with the given access.
    pub fn open(name: &str, access: IoAccess) -> Result<Self> {
        let file = open_file(name, access)?;
        Ok(FileIoFactory {
            file: RwLock::new(Arc::new(file)),
            access,
        })
    }

    fn current_file(&self) -> Arc<File> {
        self.file.read().unwrap().clone()
    }

    /// Extends a regular file so that `num_bytes` are writable.
    ///
    /// Device nodes have a fixed size and are left alone by the caller.
    pub fn set_writable_size(&self, num_bytes: u64) -> Result<()> {
        let file = self.current_file();
        if file.metadata()?.len() < num_bytes {
            file.set_len(num_bytes)?;
        }
        Ok(())
    }
}

impl IoFactory for FileIoFactory {
    type Region = FileIoRegion;

    fn writable_size(&self) -> Result<u64> {
        Ok(self.current_file().metadata()?.len())
    }

    fn open_region(&self, start_byte: u64, num_bytes: u64) -> Result<FileIoRegion> {
        Ok(FileIoRegion {
            file: self.current_file(),
            start_byte,
            num_bytes,
        })
    }

    fn replace_storage(&self, name: &str) -> Result<()> {
        let file = open_file(name, self.access)?;
        *self.file.write().unwrap() = Arc::new(file);
        Ok(())
    }
}

/// A byte window on a [`FileIoFactory`] store.
pub struct FileIoRegion {
    file: Arc<File>,
    start_byte: u64,
    num_bytes: u64,
}

impl FileIoRegion {
    fn check_span(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.num_bytes {
            return_errno_with_msg!(InvalidArgs, "access is outside the region window");
        }
        Ok(())
    }
}

impl IoRegion for FileIoRegion {
    fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_span(offset, buf.len())?;
        self.file.read_exact_at(buf, self.start_byte + offset)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_span(offset, buf.len())?;
        self.file.write_all_at(buf, self.start_byte + offset)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// A backing store held in memory.
///
/// Cloning shares the same bytes, so a clone models reopening the device.
#[derive(Clone, Debug)]
pub struct MemIoFactory {
    store: Arc<Mutex<Vec<u8>>>,
}

impl MemIoFactory {
    /// Creates a zero-filled store of the given capacity.
    pub fn new(num_bytes: usize) -> Self {
        MemIoFactory {
            store: Arc::new(Mutex::new(vec![0; num_bytes])),
        }
    }
}

impl IoFactory for MemIoFactory {
    type Region = MemIoRegion;

    fn writable_size(&self) -> Result<u64> {
        Ok(self.store.lock().unwrap().len() as u64)
    }

    fn open_region(&self, start_byte: u64, num_bytes: u64) -> Result<MemIoRegion> {
        if start_byte + num_bytes > self.writable_size()? {
            return_errno_with_msg!(InvalidArgs, "region is outside the memory store");
        }
        Ok(MemIoRegion {
            store: self.store.clone(),
            start_byte,
            num_bytes,
        })
    }

    fn replace_storage(&self, _name: &str) -> Result<()> {
        return_errno_with_msg!(InvalidArgs, "a memory store has no named backing to swap");
    }
}

/// A byte window on a [`MemIoFactory`] store.
pub struct MemIoRegion {
    store: Arc<Mutex<Vec<u8>>>,
    start_byte: u64,
    num_bytes: u64,
}

impl MemIoRegion {
    fn check_span(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.num_bytes {
            return_errno_with_msg!(InvalidArgs, "access is outside the region window");
        }
        Ok(())
    }
}

impl IoRegion for MemIoRegion {
    fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_span(offset, buf.len())?;
        let store = self.store.lock().unwrap();
        let at = (self.start_byte + offset) as usize;
        buf.copy_from_slice(&store[at..at + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_span(offset, buf.len())?;
        let mut store = self.store.lock().unwrap();
        let at = (self.start_byte + offset) as usize;
        store[at..at + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
