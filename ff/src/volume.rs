//! Mounted volume state and the sector window
//!
//! A [`FatVolume`] owns the geometry of one mounted filesystem and a single
//! sector-sized window. Every access to FAT, bitmap and directory sectors goes
//! through the window; it is written back lazily when it has to move or when
//! the volume is synced.
//!
//! # Structure
//! - `FatType` - FAT sub-type detected at mount time
//! - `ObjectId` - identity shared by open files and directories
//! - `FatVolume` - geometry, allocation hints, window

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::block::{BlockDevice, DiskStatus, IoctlCmd};
use crate::codec::{ld_word, st_dword, st_word};
use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::flags::FileAttr;
use crate::layout::*;
use crate::lock::LockTable;
use crate::table::ClusterTable;
use crate::time::TimeSource;

/// Shared handle to a physical block device
pub type Device = Arc<spin::Mutex<Box<dyn BlockDevice + Send>>>;

/// Window sector value meaning "nothing loaded"
pub(crate) const NO_SECTOR: u64 = u64::MAX;

/// FAT sub-type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
    ExFat,
}

/// exFAT chain status of an object
pub mod chain_status {
    /// FAT chain is valid
    pub const FAT: u8 = 0;
    /// Contiguous, no FAT entries written
    pub const CONTIGUOUS: u8 = 2;
    /// Fragmented in this session, first fragment not yet on the FAT
    pub const FRAGMENTED: u8 = 3;
    /// Flag: the containing directory was stretched
    pub const STRETCHED: u8 = 4;
}

/// Object identity shared by open files and directories
#[derive(Debug, Clone, Default)]
pub struct ObjectId {
    /// Mount ID of the volume when the object was opened
    pub id: u16,
    /// Object attribute
    pub attr: u8,
    /// exFAT chain status (see [`chain_status`])
    pub stat: u8,
    /// Start cluster (0 for an empty file or the FAT12/16 root directory)
    pub sclust: u32,
    /// Object size in bytes (valid for files, and exFAT directories)
    pub objsize: u64,
    /// exFAT: size of the first fragment - 1 (valid when stat is 3)
    pub n_cont: u32,
    /// exFAT: size of the last fragment to be written to the FAT
    pub n_frag: u32,
    /// exFAT: start cluster of the containing directory
    pub c_scl: u32,
    /// exFAT: size of the containing directory and chain status
    pub c_size: u32,
    /// exFAT: offset in the containing directory
    pub c_ofs: u32,
    /// Lock table slot + 1 (0 when not locked)
    pub lockid: usize,
}

/// A mounted FAT volume
pub struct FatVolume {
    pub(crate) dev: Device,
    pub(crate) fs_type: FatType,
    pub(crate) table: &'static dyn ClusterTable,
    /// Number of FATs (1 or 2)
    pub(crate) n_fats: u8,
    /// Window dirty flag
    pub(crate) wflag: bool,
    /// FSInfo state: bit 0 dirty, bit 7 disabled
    pub(crate) fsi_flag: u8,
    /// Mount ID
    pub(crate) id: u16,
    /// Number of root directory entries (FAT12/16)
    pub(crate) n_rootdir: u16,
    /// Sectors per cluster
    pub(crate) csize: u32,
    /// Bytes per sector
    pub(crate) ssize: u32,
    /// Number of FAT entries (clusters + 2)
    pub(crate) n_fatent: u32,
    /// Sectors per FAT
    pub(crate) fsize: u32,
    pub(crate) volbase: u64,
    pub(crate) fatbase: u64,
    /// Root directory start sector (FAT12/16) or cluster (FAT32/exFAT)
    pub(crate) dirbase: u64,
    pub(crate) database: u64,
    /// exFAT allocation bitmap start sector
    pub(crate) bitbase: u64,
    pub(crate) winsect: u64,
    pub(crate) win: Vec<u8>,
    /// Last allocated cluster hint
    pub(crate) last_clst: u32,
    /// Number of free clusters (0xFFFFFFFF when unknown)
    pub(crate) free_clst: u32,
    /// Current directory start cluster (0 is root)
    pub(crate) cdir: u32,
    pub(crate) cdc_scl: u32,
    pub(crate) cdc_size: u32,
    pub(crate) cdc_ofs: u32,
    /// Current directory path, tracked lexically on exFAT
    pub(crate) cwd: String,
    pub(crate) locks: LockTable,
    pub(crate) cfg: FsConfig,
    pub(crate) clock: Arc<dyn TimeSource + Send + Sync>,
}

impl FatVolume {
    pub fn fs_type(&self) -> FatType {
        self.fs_type
    }

    /// Cluster size in bytes
    pub fn cluster_bytes(&self) -> u32 {
        self.ssize * self.csize
    }

    /// Number of data clusters
    pub fn cluster_count(&self) -> u32 {
        self.n_fatent - 2
    }

    pub(crate) fn is_exfat(&self) -> bool {
        self.fs_type == FatType::ExFat
    }

    pub(crate) fn now(&self) -> u32 {
        self.clock.fattime()
    }

    pub(crate) fn device_status(&self) -> DiskStatus {
        self.dev.lock().status()
    }

    // ========================================================================
    // Raw disk access
    // ========================================================================

    pub(crate) fn disk_read(&self, buf: &mut [u8], lba: u64, count: u32) -> FsResult<()> {
        self.dev.lock().read(buf, lba, count).map_err(|_| FsError::DiskErr)
    }

    pub(crate) fn disk_write(&self, buf: &[u8], lba: u64, count: u32) -> FsResult<()> {
        self.dev.lock().write(buf, lba, count).map_err(|_| FsError::DiskErr)
    }

    pub(crate) fn disk_ioctl(&self, cmd: IoctlCmd<'_>) -> FsResult<()> {
        self.dev.lock().ioctl(cmd).map_err(|_| FsError::DiskErr)
    }

    // ========================================================================
    // Sector window
    // ========================================================================

    /// Write back the window if it is dirty
    pub(crate) fn sync_window(&mut self) -> FsResult<()> {
        if self.wflag {
            let wsect = self.winsect;
            self.disk_write(&self.win, wsect, 1)?;
            self.wflag = false;
            // Mirror sectors of the first FAT into the second one
            if wsect.wrapping_sub(self.fatbase) < self.fsize as u64 && self.n_fats == 2 {
                if self.disk_write(&self.win, wsect + self.fsize as u64, 1).is_err() {
                    log::warn!("[FF] FAT mirror write failed at sector {}", wsect + self.fsize as u64);
                }
            }
        }
        Ok(())
    }

    /// Load `sect` into the window, flushing the current one first
    pub(crate) fn move_window(&mut self, sect: u64) -> FsResult<()> {
        if sect != self.winsect {
            self.sync_window()?;
            let mut win = core::mem::take(&mut self.win);
            let res = self.disk_read(&mut win, sect, 1);
            self.win = win;
            if res.is_err() {
                self.winsect = NO_SECTOR;
                return Err(FsError::DiskErr);
            }
            self.winsect = sect;
        }
        Ok(())
    }

    /// Mark the window dirty
    #[inline]
    pub(crate) fn touch(&mut self) {
        self.wflag = true;
    }

    /// Flush the window, FSInfo and the device cache
    pub(crate) fn sync_fs(&mut self) -> FsResult<()> {
        self.sync_window()?;
        if self.fs_type == FatType::Fat32 && self.fsi_flag == 1 {
            let ss = self.ssize as usize;
            self.win.fill(0);
            st_dword(&mut self.win, FSI_LEAD_SIG, FSI_LEAD_SIG_VALUE);
            st_dword(&mut self.win, FSI_STRUC_SIG, FSI_STRUC_SIG_VALUE);
            st_dword(&mut self.win, FSI_FREE_COUNT, self.free_clst);
            st_dword(&mut self.win, FSI_NXT_FREE, self.last_clst);
            st_word(&mut self.win, ss - 2, 0xAA55);
            self.winsect = self.volbase + 1;
            self.disk_write(&self.win, self.winsect, 1)?;
            self.fsi_flag = 0;
        }
        self.disk_ioctl(IoctlCmd::Sync)
    }

    // ========================================================================
    // Geometry helpers
    // ========================================================================

    /// First sector of a cluster (0 if the cluster is out of range)
    pub(crate) fn clst2sect(&self, clst: u32) -> u64 {
        let c = clst.wrapping_sub(2);
        if c >= self.n_fatent - 2 {
            return 0;
        }
        self.database + self.csize as u64 * c as u64
    }

    /// Load the start cluster from a short directory entry
    pub(crate) fn ld_clust(&self, ent: &[u8]) -> u32 {
        let mut cl = ld_word(ent, DIR_FST_CLUS_LO) as u32;
        if self.fs_type == FatType::Fat32 {
            cl |= (ld_word(ent, DIR_FST_CLUS_HI) as u32) << 16;
        }
        cl
    }

    /// Store the start cluster into a short directory entry
    pub(crate) fn st_clust(&self, ent: &mut [u8], cl: u32) {
        st_word(ent, DIR_FST_CLUS_LO, cl as u16);
        if self.fs_type == FatType::Fat32 {
            st_word(ent, DIR_FST_CLUS_HI, (cl >> 16) as u16);
        }
    }

    /// Fill a cluster with zeros
    ///
    /// The window is reused as the zero buffer and ends up holding the first
    /// sector of the cluster.
    pub(crate) fn clear_cluster(&mut self, clst: u32) -> FsResult<()> {
        self.sync_window()?;
        let sect = self.clst2sect(clst);
        if sect == 0 {
            return Err(FsError::IntErr);
        }
        self.winsect = sect;
        self.win.fill(0);
        for n in 0..self.csize as u64 {
            if let Err(e) = self.disk_write(&self.win, sect + n, 1) {
                self.winsect = NO_SECTOR;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Object identity of the root directory (start cluster 0 stands for the root)
    pub(crate) fn root_object(&self) -> ObjectId {
        ObjectId {
            id: self.id,
            attr: FileAttr::DIR.bits(),
            ..ObjectId::default()
        }
    }

    /// Check that an object opened under `obj_id` still belongs to this mount
    pub(crate) fn validate(&self, obj_id: u16) -> FsResult<()> {
        if obj_id != self.id || self.device_status().contains(DiskStatus::NOINIT) {
            return Err(FsError::InvalidObject);
        }
        Ok(())
    }
}
