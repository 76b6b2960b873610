//! Block device interface
//!
//! The filesystem core consumes storage through [`BlockDevice`]: sector
//! addressed reads and writes plus a small set of control commands.
//! [`RamDisk`] is an in-memory implementation used for formatting images
//! and for tests.
//!
//! # Contract
//! - `initialize` brings the device up and returns its status
//! - `status` reports NOINIT / NODISK / PROTECT without side effects
//! - `read`/`write` transfer `count` whole sectors starting at `lba`
//! - `ioctl` answers geometry queries, flushes and trim hints

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

bitflags::bitflags! {
    /// Physical drive status
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DiskStatus: u8 {
        /// Drive not initialized
        const NOINIT = 0x01;
        /// No medium in the drive
        const NODISK = 0x02;
        /// Write protected
        const PROTECT = 0x04;
    }
}

/// Block device error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// Unrecoverable read/write error
    Error,
    /// Medium is write protected
    WriteProtected,
    /// Device not initialized or no medium
    NotReady,
    /// Invalid parameter (out of range sector, unsupported command)
    ParamError,
}

/// Device control command
#[derive(Debug)]
pub enum IoctlCmd<'a> {
    /// Complete pending write operations
    Sync,
    /// Number of available sectors
    GetSectorCount(&'a mut u64),
    /// Sector size in bytes
    GetSectorSize(&'a mut u16),
    /// Erase block size in sectors (1 if unknown)
    GetBlockSize(&'a mut u32),
    /// Sectors `start..=end` no longer hold live data
    Trim { start: u64, end: u64 },
    /// Device specific command, passed through untouched
    Device { code: u8, buf: &'a mut [u8] },
}

/// Sector addressed storage
pub trait BlockDevice {
    /// Initialize the device
    fn initialize(&mut self) -> DiskStatus;
    /// Current device status
    fn status(&self) -> DiskStatus;
    /// Read `count` sectors starting at `lba` into `buf`
    fn read(&mut self, buf: &mut [u8], lba: u64, count: u32) -> Result<(), DiskError>;
    /// Write `count` sectors starting at `lba` from `buf`
    fn write(&mut self, buf: &[u8], lba: u64, count: u32) -> Result<(), DiskError>;
    /// Miscellaneous control
    fn ioctl(&mut self, cmd: IoctlCmd<'_>) -> Result<(), DiskError>;
}

// ============================================================================
// RAM Disk
// ============================================================================

struct RamState {
    data: Vec<u8>,
    initialized: bool,
    write_protect: bool,
    fail_io: bool,
    trimmed: u64,
    reads: u64,
    writes: u64,
}

/// In-memory block device
///
/// Clones share the same storage, so a test can keep a handle for
/// inspection after handing the device to a [`crate::FatFs`].
#[derive(Clone)]
pub struct RamDisk {
    ssize: u16,
    sectors: u64,
    block_size: u32,
    state: Arc<spin::Mutex<RamState>>,
}

impl RamDisk {
    /// Create a zero-filled disk of `sectors` sectors of `ssize` bytes
    pub fn new(ssize: u16, sectors: u64) -> Self {
        let bytes = ssize as usize * sectors as usize;
        Self {
            ssize,
            sectors,
            block_size: 1,
            state: Arc::new(spin::Mutex::new(RamState {
                data: vec![0u8; bytes],
                initialized: false,
                write_protect: false,
                fail_io: false,
                trimmed: 0,
                reads: 0,
                writes: 0,
            })),
        }
    }

    /// Report the given erase block size to `GetBlockSize`
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn sector_size(&self) -> u16 {
        self.ssize
    }

    pub fn sector_count(&self) -> u64 {
        self.sectors
    }

    pub fn set_write_protect(&self, wp: bool) {
        self.state.lock().write_protect = wp;
    }

    /// Make every subsequent read/write fail with `DiskError::Error`
    pub fn set_fail_io(&self, fail: bool) {
        self.state.lock().fail_io = fail;
    }

    /// Simulate a media change: the device must be initialized again
    pub fn eject(&self) {
        self.state.lock().initialized = false;
    }

    /// Total number of sectors reported through `Trim`
    pub fn trimmed_sectors(&self) -> u64 {
        self.state.lock().trimmed
    }

    /// Number of read and write calls so far
    pub fn io_counts(&self) -> (u64, u64) {
        let s = self.state.lock();
        (s.reads, s.writes)
    }

    /// Copy of one sector
    pub fn sector(&self, lba: u64) -> Vec<u8> {
        let s = self.state.lock();
        let ofs = lba as usize * self.ssize as usize;
        s.data[ofs..ofs + self.ssize as usize].to_vec()
    }

    fn range(&self, lba: u64, count: u32, len: usize) -> Result<core::ops::Range<usize>, DiskError> {
        let ss = self.ssize as usize;
        let bytes = count as usize * ss;
        if count == 0 || lba.saturating_add(count as u64) > self.sectors || len < bytes {
            return Err(DiskError::ParamError);
        }
        let start = lba as usize * ss;
        Ok(start..start + bytes)
    }
}

impl BlockDevice for RamDisk {
    fn initialize(&mut self) -> DiskStatus {
        self.state.lock().initialized = true;
        self.status()
    }

    fn status(&self) -> DiskStatus {
        let s = self.state.lock();
        let mut st = DiskStatus::empty();
        if !s.initialized {
            st |= DiskStatus::NOINIT;
        }
        if s.write_protect {
            st |= DiskStatus::PROTECT;
        }
        st
    }

    fn read(&mut self, buf: &mut [u8], lba: u64, count: u32) -> Result<(), DiskError> {
        let r = self.range(lba, count, buf.len())?;
        let mut s = self.state.lock();
        if !s.initialized {
            return Err(DiskError::NotReady);
        }
        if s.fail_io {
            return Err(DiskError::Error);
        }
        s.reads += 1;
        let n = r.len();
        buf[..n].copy_from_slice(&s.data[r]);
        Ok(())
    }

    fn write(&mut self, buf: &[u8], lba: u64, count: u32) -> Result<(), DiskError> {
        let r = self.range(lba, count, buf.len())?;
        let mut s = self.state.lock();
        if !s.initialized {
            return Err(DiskError::NotReady);
        }
        if s.write_protect {
            return Err(DiskError::WriteProtected);
        }
        if s.fail_io {
            return Err(DiskError::Error);
        }
        s.writes += 1;
        let n = r.len();
        s.data[r].copy_from_slice(&buf[..n]);
        Ok(())
    }

    fn ioctl(&mut self, cmd: IoctlCmd<'_>) -> Result<(), DiskError> {
        match cmd {
            IoctlCmd::Sync => Ok(()),
            IoctlCmd::GetSectorCount(n) => {
                *n = self.sectors;
                Ok(())
            }
            IoctlCmd::GetSectorSize(n) => {
                *n = self.ssize;
                Ok(())
            }
            IoctlCmd::GetBlockSize(n) => {
                *n = self.block_size;
                Ok(())
            }
            IoctlCmd::Trim { start, end } => {
                if end < start || end >= self.sectors {
                    return Err(DiskError::ParamError);
                }
                self.state.lock().trimmed += end - start + 1;
                Ok(())
            }
            IoctlCmd::Device { .. } => Err(DiskError::ParamError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramdisk_read_write() {
        let mut disk = RamDisk::new(512, 16);
        assert!(disk.status().contains(DiskStatus::NOINIT));
        assert!(disk.initialize().is_empty());

        let data = [0xA5u8; 1024];
        disk.write(&data, 3, 2).unwrap();
        let mut back = [0u8; 1024];
        disk.read(&mut back, 3, 2).unwrap();
        assert_eq!(back[..], data[..]);
        assert_eq!(disk.sector(4)[0], 0xA5);
    }

    #[test]
    fn test_ramdisk_bounds_and_protect() {
        let mut disk = RamDisk::new(512, 4);
        disk.initialize();
        let mut buf = [0u8; 512];
        assert_eq!(disk.read(&mut buf, 4, 1), Err(DiskError::ParamError));

        let handle = disk.clone();
        handle.set_write_protect(true);
        assert!(disk.status().contains(DiskStatus::PROTECT));
        assert_eq!(disk.write(&buf, 0, 1), Err(DiskError::WriteProtected));
    }

    #[test]
    fn test_ramdisk_ioctl() {
        let mut disk = RamDisk::new(1024, 8).with_block_size(4);
        let mut n = 0u64;
        disk.ioctl(IoctlCmd::GetSectorCount(&mut n)).unwrap();
        assert_eq!(n, 8);
        let mut ss = 0u16;
        disk.ioctl(IoctlCmd::GetSectorSize(&mut ss)).unwrap();
        assert_eq!(ss, 1024);
        disk.ioctl(IoctlCmd::Trim { start: 2, end: 5 }).unwrap();
        assert_eq!(disk.trimmed_sectors(), 4);
    }
}
