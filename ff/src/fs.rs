//! Drive registry
//!
//! [`FatFs`] owns the physical block devices and the logical drives mapped
//! onto them. Every operation names its drive with an optional `"N:"` path
//! prefix (the current drive otherwise), takes that drive's volume lock and
//! mounts the volume on first use.
//!
//! # Drive lifecycle
//! - `add_device` / `add_drive` - build the drive map
//! - `mount` - register a drive (and optionally mount it right away)
//! - first access - lazy mount, remount after a media change
//! - `unmount` - flush and forget the volume; the drive is disabled

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};

use crate::block::{BlockDevice, DiskStatus};
use crate::codec::ld_dword;
use crate::config::FsConfig;
use crate::dir::{dir_read, dir_sdi, get_fileinfo, DirCursor};
use crate::error::{FsError, FsResult};
use crate::flags::{FileAttr, NameFlags};
use crate::layout::{SZDIRE, XDIR_FST_CLUS};
use crate::mount::mount_volume;
use crate::name::is_separator;
use crate::path::{follow_path, split_drive};
use crate::time::{FixedClock, TimeSource};
use crate::volume::{Device, FatVolume};

/// A logical drive: one volume on a physical device
struct LogicalDrive {
    pdrv: usize,
    /// MBR partition (1-4) or 0 for auto detection
    partition: u8,
    registered: AtomicBool,
    slot: spin::Mutex<Option<FatVolume>>,
}

/// Filesystem registry
pub struct FatFs {
    devices: Vec<Device>,
    drives: Vec<LogicalDrive>,
    current: AtomicUsize,
    next_id: AtomicU16,
    pub(crate) config: FsConfig,
    pub(crate) clock: Arc<dyn TimeSource + Send + Sync>,
}

impl FatFs {
    pub fn new(config: FsConfig) -> Self {
        Self {
            devices: Vec::new(),
            drives: Vec::new(),
            current: AtomicUsize::new(0),
            next_id: AtomicU16::new(0),
            config: config.sanitized(),
            clock: Arc::new(FixedClock::default()),
        }
    }

    /// Replace the timestamp source
    pub fn with_clock(mut self, clock: Arc<dyn TimeSource + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// Attach a physical device and return its number
    pub fn add_device<D: BlockDevice + Send + 'static>(&mut self, dev: D) -> usize {
        let b: Box<dyn BlockDevice + Send> = Box::new(dev);
        self.devices.push(Arc::new(spin::Mutex::new(b)));
        self.devices.len() - 1
    }

    /// Map a new logical drive onto `partition` of device `pdrv`
    pub fn add_drive(&mut self, pdrv: usize, partition: u8) -> FsResult<usize> {
        if pdrv >= self.devices.len() || partition > 4 {
            return Err(FsError::InvalidParameter);
        }
        self.drives.push(LogicalDrive {
            pdrv,
            partition,
            registered: AtomicBool::new(false),
            slot: spin::Mutex::new(None),
        });
        Ok(self.drives.len() - 1)
    }

    pub fn drive_count(&self) -> usize {
        self.drives.len()
    }

    pub(crate) fn device(&self, pdrv: usize) -> FsResult<&Device> {
        self.devices.get(pdrv).ok_or(FsError::InvalidDrive)
    }

    /// Physical device number of a logical drive
    pub(crate) fn drive_device(&self, drive: usize) -> FsResult<usize> {
        self.drives.get(drive).map(|ld| ld.pdrv).ok_or(FsError::InvalidDrive)
    }

    /// Physical device and partition behind a logical drive
    pub(crate) fn drive_target(&self, drive: usize) -> FsResult<(&Device, u8)> {
        let ld = self.drives.get(drive).ok_or(FsError::InvalidDrive)?;
        Ok((self.device(ld.pdrv)?, ld.partition))
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register the drive named by `path`
    ///
    /// Any previous volume of the drive is forgotten. With `force` the
    /// volume is mounted immediately and mount errors are returned.
    pub fn mount(&self, path: &str, force: bool) -> FsResult<()> {
        let (drive, _) = self.resolve(path)?;
        let ld = &self.drives[drive];
        {
            let mut slot = self.lock_slot(ld)?;
            *slot = None;
        }
        ld.registered.store(true, Ordering::Release);
        if force {
            self.with_drive(drive, false, |_| Ok(()))?;
        }
        Ok(())
    }

    /// Flush and unregister the drive named by `path`
    ///
    /// Open files and directories of the drive become invalid.
    pub fn unmount(&self, path: &str) -> FsResult<()> {
        let (drive, _) = self.resolve(path)?;
        let ld = &self.drives[drive];
        let mut slot = self.lock_slot(ld)?;
        if let Some(mut vol) = slot.take() {
            if let Err(e) = vol.sync_fs() {
                log::warn!("[FF] drive {}: flush on unmount failed: {}", drive, e);
            }
            vol.locks.clear();
            log::info!("[FF] drive {} unmounted", drive);
        }
        ld.registered.store(false, Ordering::Release);
        Ok(())
    }

    /// Drop the volumes of every drive on device `pdrv` (before formatting)
    pub(crate) fn forget_device(&self, pdrv: usize) -> FsResult<()> {
        for ld in self.drives.iter().filter(|ld| ld.pdrv == pdrv) {
            *self.lock_slot(ld)? = None;
        }
        Ok(())
    }

    // ========================================================================
    // Volume access
    // ========================================================================

    /// Split the drive prefix off `path`
    pub(crate) fn resolve<'p>(&self, path: &'p str) -> FsResult<(usize, &'p str)> {
        let (drv, rest) = split_drive(path)?;
        let drive = drv.unwrap_or_else(|| self.current.load(Ordering::Acquire));
        if drive >= self.drives.len() {
            return Err(FsError::InvalidDrive);
        }
        Ok((drive, rest))
    }

    fn lock_slot<'s>(&'s self, ld: &'s LogicalDrive) -> FsResult<spin::MutexGuard<'s, Option<FatVolume>>> {
        if !self.config.reentrant {
            return Ok(ld.slot.lock());
        }
        for _ in 0..self.config.lock_spins.max(1) {
            if let Some(g) = ld.slot.try_lock() {
                return Ok(g);
            }
            core::hint::spin_loop();
        }
        Err(FsError::Timeout)
    }

    fn next_mount_id(&self) -> u16 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Run `f` on the mounted volume of `drive`, mounting it if needed
    pub(crate) fn with_drive<R>(
        &self,
        drive: usize,
        write: bool,
        f: impl FnOnce(&mut FatVolume) -> FsResult<R>,
    ) -> FsResult<R> {
        let ld = self.drives.get(drive).ok_or(FsError::InvalidDrive)?;
        if !ld.registered.load(Ordering::Acquire) {
            return Err(FsError::NotEnabled);
        }
        if write && self.config.read_only {
            return Err(FsError::WriteProtected);
        }
        let mut slot = self.lock_slot(ld)?;

        let mounted = match slot.as_ref() {
            Some(vol) => {
                let st = vol.device_status();
                if st.contains(DiskStatus::NOINIT) {
                    log::info!("[FF] drive {}: media changed, remounting", drive);
                    false
                } else if write && st.contains(DiskStatus::PROTECT) {
                    return Err(FsError::WriteProtected);
                } else {
                    true
                }
            }
            None => false,
        };
        if !mounted {
            *slot = None;
            let dev = self.device(ld.pdrv)?;
            let vol = mount_volume(dev, ld.partition, &self.config, Arc::clone(&self.clock), self.next_mount_id(), write)?;
            *slot = Some(vol);
        }
        match slot.as_mut() {
            Some(vol) => f(vol),
            None => Err(FsError::NotEnabled),
        }
    }

    /// Run `f` on the volume an open object belongs to
    ///
    /// Never mounts: a missing or remounted volume makes the object invalid.
    pub(crate) fn with_object<R>(
        &self,
        drive: usize,
        obj_id: u16,
        f: impl FnOnce(&mut FatVolume) -> FsResult<R>,
    ) -> FsResult<R> {
        let ld = self.drives.get(drive).ok_or(FsError::InvalidObject)?;
        let mut slot = self.lock_slot(ld)?;
        let vol = slot.as_mut().ok_or(FsError::InvalidObject)?;
        vol.validate(obj_id)?;
        f(vol)
    }

    /// Resolve `path` and run `f` on its volume with the drive-less remainder
    pub(crate) fn with_path<R>(
        &self,
        path: &str,
        write: bool,
        f: impl FnOnce(&mut FatVolume, &str) -> FsResult<R>,
    ) -> FsResult<R> {
        let (drive, rest) = self.resolve(path)?;
        self.with_drive(drive, write, |vol| f(vol, rest))
    }

    // ========================================================================
    // Current drive and directory
    // ========================================================================

    /// Make the drive named by `path` the current drive
    pub fn chdrive(&self, path: &str) -> FsResult<()> {
        let (drv, _) = split_drive(path)?;
        let drive = drv.ok_or(FsError::InvalidDrive)?;
        if drive >= self.drives.len() {
            return Err(FsError::InvalidDrive);
        }
        self.current.store(drive, Ordering::Release);
        Ok(())
    }

    pub fn current_drive(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Change the current directory of the volume named by `path`
    pub fn chdir(&self, path: &str) -> FsResult<()> {
        if !self.config.relative_paths {
            return Err(FsError::NotEnabled);
        }
        self.with_path(path, false, |vol, p| {
            let mut dj = DirCursor::new(vol, vol.root_object());
            match follow_path(vol, &mut dj, p) {
                Err(FsError::NoFile) => return Err(FsError::NoPath),
                r => r?,
            }
            if dj.flags().contains(NameFlags::NONAME) {
                // The origin directory itself
                vol.cdir = dj.obj.sclust;
                if vol.is_exfat() {
                    vol.cdc_scl = dj.obj.c_scl;
                    vol.cdc_size = dj.obj.c_size;
                    vol.cdc_ofs = dj.obj.c_ofs;
                }
            } else if dj.obj.attr & FileAttr::DIR.bits() != 0 {
                if vol.is_exfat() {
                    vol.cdir = ld_dword(&dj.xbuf, XDIR_FST_CLUS);
                    vol.cdc_scl = dj.obj.sclust;
                    vol.cdc_size = (dj.obj.objsize as u32 & 0xFFFF_FF00) | dj.obj.stat as u32;
                    vol.cdc_ofs = dj.blk_ofs;
                } else {
                    let ent = dj.ent;
                    vol.cdir = vol.ld_clust(&vol.win[ent..ent + SZDIRE]);
                }
            } else {
                return Err(FsError::NoPath);
            }
            vol.cwd = normalize_path(&vol.cwd, p);
            Ok(())
        })
    }

    /// Full path of the current directory of the current drive
    pub fn getcwd(&self) -> FsResult<String> {
        let drive = self.current_drive();
        let mut path = self.with_drive(drive, false, |vol| {
            if vol.is_exfat() || vol.cdir == 0 {
                return Ok(vol.cwd.clone());
            }
            parent_walk(vol)
        })?;
        if self.drives.len() > 1 {
            path.insert_str(0, &alloc::format!("{}:", drive));
        }
        Ok(path)
    }
}

/// Build the current directory path by following `..` entries up to the root
fn parent_walk(vol: &mut FatVolume) -> FsResult<String> {
    let mut names: Vec<String> = Vec::new();
    let mut dj = DirCursor::new(vol, vol.root_object());
    dj.obj.sclust = vol.cdir;
    while dj.obj.sclust != 0 {
        let ccl = dj.obj.sclust;
        // Second entry of a sub-directory is the dot-dot entry
        dir_sdi(vol, &mut dj, SZDIRE as u32)?;
        vol.move_window(dj.sect)?;
        let ent = dj.ent;
        dj.obj.sclust = vol.ld_clust(&vol.win[ent..ent + SZDIRE]);
        dir_sdi(vol, &mut dj, 0)?;
        loop {
            match dir_read(vol, &mut dj, false) {
                Ok(()) => {}
                Err(FsError::NoFile) => return Err(FsError::IntErr),
                Err(e) => return Err(e),
            }
            let ent = dj.ent;
            if vol.ld_clust(&vol.win[ent..ent + SZDIRE]) == ccl {
                break;
            }
            match crate::dir::dir_next(vol, &mut dj, false) {
                Ok(()) => {}
                Err(FsError::NoFile) => return Err(FsError::IntErr),
                Err(e) => return Err(e),
            }
        }
        names.push(get_fileinfo(vol, &dj)?.name);
    }
    let mut path = String::new();
    for n in names.iter().rev() {
        path.push('/');
        path.push_str(n);
    }
    if path.is_empty() {
        path.push('/');
    }
    Ok(path)
}

/// Apply `path` to the directory `base` lexically (`.` and `..` folded)
pub(crate) fn normalize_path(base: &str, path: &str) -> String {
    let mut segs: Vec<&str> = Vec::new();
    if !path.starts_with(is_separator) {
        segs.extend(base.split(is_separator).filter(|s| !s.is_empty()));
    }
    for seg in path.split(is_separator) {
        match seg {
            "" | "." => {}
            ".." => {
                segs.pop();
            }
            s => segs.push(s),
        }
    }
    let mut out = String::new();
    for s in &segs {
        out.push('/');
        out.push_str(s);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::RamDisk;
    use crate::mkfs::MkfsFormat;
    use crate::testutil::format_ram;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/", "a/b"), "/a/b");
        assert_eq!(normalize_path("/a/b", ".."), "/a");
        assert_eq!(normalize_path("/a/b", "../../.."), "/");
        assert_eq!(normalize_path("/a", "/x/./y"), "/x/y");
        assert_eq!(normalize_path("/a", ""), "/a");
    }

    #[test]
    fn test_unregistered_drive_is_not_enabled() {
        let mut fs = FatFs::new(FsConfig::default());
        let pd = fs.add_device(RamDisk::new(512, 2048));
        fs.add_drive(pd, 0).unwrap();
        assert_eq!(fs.with_drive(0, false, |_| Ok(())), Err(FsError::NotEnabled));
        assert_eq!(fs.resolve("3:/x").err(), Some(FsError::InvalidDrive));
        // Registered but unformatted
        fs.mount("0:", false).unwrap();
        assert_eq!(fs.mount("0:", true), Err(FsError::NoFilesystem));
    }

    #[test]
    fn test_reentrant_lock_times_out() {
        let (mut fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 0);
        fs.config.lock_spins = 10;
        let res = fs.with_drive(0, false, |_| fs.with_drive(0, false, |_| Ok(())));
        assert_eq!(res, Err(FsError::Timeout));
    }

    #[test]
    fn test_remount_after_media_change() {
        let (fs, disk) = format_ram(512, 2048, MkfsFormat::FAT, 0);
        let id1 = fs.with_drive(0, false, |vol| Ok(vol.id)).unwrap();
        disk.eject();
        assert_eq!(fs.with_object(0, id1, |_| Ok(())), Err(FsError::InvalidObject));
        let id2 = fs.with_drive(0, false, |vol| Ok(vol.id)).unwrap();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_write_protect_and_read_only() {
        let (fs, disk) = format_ram(512, 2048, MkfsFormat::FAT, 0);
        disk.set_write_protect(true);
        assert_eq!(fs.with_drive(0, true, |_| Ok(())), Err(FsError::WriteProtected));
        assert_eq!(fs.with_drive(0, false, |_| Ok(())), Ok(()));
    }

    #[test]
    fn test_chdir_and_getcwd() {
        let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 0);
        fs.mkdir("/sub").unwrap();
        fs.mkdir("/sub/Deeper Dir").unwrap();
        assert_eq!(fs.getcwd().unwrap(), "/");
        fs.chdir("sub/Deeper Dir").unwrap();
        assert_eq!(fs.getcwd().unwrap(), "/sub/Deeper Dir");
        fs.chdir("..").unwrap();
        assert_eq!(fs.getcwd().unwrap(), "/sub");
        assert_eq!(fs.chdir("missing"), Err(FsError::NoPath));
        fs.chdir("/").unwrap();
        assert_eq!(fs.getcwd().unwrap(), "/");
    }

    #[test]
    fn test_exfat_chdir_tracks_path() {
        let (fs, _disk) = format_ram(512, 16384, MkfsFormat::EXFAT, 0);
        fs.mkdir("/a").unwrap();
        fs.mkdir("/a/b").unwrap();
        fs.chdir("/a/b").unwrap();
        assert_eq!(fs.getcwd().unwrap(), "/a/b");
        assert!(fs.stat("../b").unwrap().is_dir());
        fs.chdir("..").unwrap();
        assert_eq!(fs.getcwd().unwrap(), "/a");
        assert!(fs.stat("b").unwrap().is_dir());
    }
}
