//! Volume detection and mounting
//!
//! Mounting brings the device up, locates a FAT boot sector (at LBA 0 or
//! through the MBR partition table), validates the BPB and builds the
//! [`FatVolume`] geometry.
//!
//! # Boot Sector Classes
//! - `Fat` - FAT12/16/32 boot sector
//! - `ExFat` - exFAT boot sector
//! - `NotFat` - valid boot record without a FAT BPB (possibly an MBR)
//! - `Invalid` - no boot signature
//! - `DiskError` - the sector could not be read

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;

use crate::block::{DiskStatus, IoctlCmd};
use crate::codec::{ld_dword, ld_word};
use crate::config::{FsConfig, MAX_EXFAT, MAX_FAT12, MAX_FAT16, MAX_FAT32, MAX_SS, MIN_SS};
use crate::error::{FsError, FsResult};
use crate::layout::*;
use crate::lock::LockTable;
use crate::table::table_for;
use crate::time::TimeSource;
use crate::volume::{Device, FatType, FatVolume, NO_SECTOR};

/// Classification of a candidate boot sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BootClass {
    Fat,
    ExFat,
    NotFat,
    Invalid,
    DiskError,
}

/// Volume without geometry, used to probe the device through the window
fn blank_volume(dev: Device, ssize: u32, cfg: &FsConfig, clock: Arc<dyn TimeSource + Send + Sync>) -> FatVolume {
    FatVolume {
        dev,
        fs_type: FatType::Fat12,
        table: table_for(FatType::Fat12),
        n_fats: 0,
        wflag: false,
        fsi_flag: 0,
        id: 0,
        n_rootdir: 0,
        csize: 0,
        ssize,
        n_fatent: 0,
        fsize: 0,
        volbase: 0,
        fatbase: 0,
        dirbase: 0,
        database: 0,
        bitbase: 0,
        winsect: NO_SECTOR,
        win: vec![0u8; ssize as usize],
        last_clst: 0xFFFF_FFFF,
        free_clst: 0xFFFF_FFFF,
        cdir: 0,
        cdc_scl: 0,
        cdc_size: 0,
        cdc_ofs: 0,
        cwd: String::from("/"),
        locks: LockTable::new(cfg.lock_slots),
        cfg: cfg.clone(),
        clock,
    }
}

/// Load `sect` into the window and classify it
pub(crate) fn check_fs(vol: &mut FatVolume, sect: u64) -> BootClass {
    vol.wflag = false;
    vol.winsect = NO_SECTOR;
    if vol.move_window(sect).is_err() {
        return BootClass::DiskError;
    }
    let bs = BootSector(&vol.win);
    let signed = bs.has_signature();
    if signed && bs.is_exfat() {
        return BootClass::ExFat;
    }
    if matches!(bs.jump_byte(), 0xEB | 0xE9 | 0xE8) {
        if signed && &vol.win[BS_FIL_SYS_TYPE32..BS_FIL_SYS_TYPE32 + 8] == b"FAT32   " {
            return BootClass::Fat;
        }
        let w = bs.bytes_per_sector() as usize;
        let b = bs.sectors_per_cluster();
        if w.is_power_of_two()
            && (MIN_SS..=MAX_SS).contains(&w)
            && b.is_power_of_two()
            && bs.reserved_sectors() != 0
            && (1..=2).contains(&bs.num_fats())
            && bs.root_entry_count() != 0
            && (ld_word(&vol.win, BPB_TOT_SEC16) >= 128 || ld_dword(&vol.win, BPB_TOT_SEC32) >= 0x10000)
            && ld_word(&vol.win, BPB_FAT_SZ16) != 0
        {
            return BootClass::Fat;
        }
    }
    if signed {
        BootClass::NotFat
    } else {
        BootClass::Invalid
    }
}

/// Find the boot sector of `partition` (0 = auto: LBA 0, then the first
/// FAT partition of the MBR)
///
/// On return the boot sector is in the window at `vol.winsect`.
pub(crate) fn find_volume(vol: &mut FatVolume, partition: u8) -> BootClass {
    let fmt = check_fs(vol, 0);
    if fmt != BootClass::NotFat && (!matches!(fmt, BootClass::Fat | BootClass::ExFat) || partition == 0) {
        return fmt;
    }
    if partition > 4 {
        return BootClass::Invalid;
    }

    let mut mbr_pt = [0u32; 4];
    for (i, pt) in mbr_pt.iter_mut().enumerate() {
        *pt = ld_dword(&vol.win, MBR_TABLE + i * SZ_PTE + PTE_ST_LBA);
    }
    let mut i = if partition > 0 { partition as usize - 1 } else { 0 };
    loop {
        let fmt = if mbr_pt[i] != 0 { check_fs(vol, mbr_pt[i] as u64) } else { BootClass::Invalid };
        let usable = matches!(fmt, BootClass::Fat | BootClass::ExFat | BootClass::DiskError);
        i += 1;
        if partition != 0 || usable || i >= 4 {
            return fmt;
        }
    }
}

/// Mount the volume on `dev`
///
/// `partition` selects an MBR partition (1-4) or 0 for auto detection.
pub(crate) fn mount_volume(
    dev: &Device,
    partition: u8,
    cfg: &FsConfig,
    clock: Arc<dyn TimeSource + Send + Sync>,
    id: u16,
    write_intent: bool,
) -> FsResult<FatVolume> {
    let stat = dev.lock().initialize();
    if stat.contains(DiskStatus::NOINIT) {
        return Err(FsError::NotReady);
    }
    if write_intent && stat.contains(DiskStatus::PROTECT) {
        return Err(FsError::WriteProtected);
    }

    let mut ss: u16 = 0;
    dev.lock()
        .ioctl(IoctlCmd::GetSectorSize(&mut ss))
        .map_err(|_| FsError::DiskErr)?;
    let ssize = ss as usize;
    if !ssize.is_power_of_two() || !(MIN_SS..=MAX_SS).contains(&ssize) {
        log::error!("[FF] unsupported sector size {}", ssize);
        return Err(FsError::DiskErr);
    }

    let mut vol = blank_volume(Arc::clone(dev), ssize as u32, cfg, clock);
    let partition = if cfg.multi_partition { partition } else { 0 };
    let fmt = match find_volume(&mut vol, partition) {
        BootClass::DiskError => return Err(FsError::DiskErr),
        BootClass::NotFat | BootClass::Invalid => return Err(FsError::NoFilesystem),
        f => f,
    };
    let bsect = vol.winsect;

    if fmt == BootClass::ExFat {
        if !cfg.exfat || !cfg.use_lfn {
            log::warn!("[FF] exFAT volume found but exFAT support is disabled");
            return Err(FsError::NoFilesystem);
        }
        mount_exfat(&mut vol, bsect)?;
    } else {
        mount_fat(&mut vol, bsect)?;
    }

    vol.id = id;
    vol.table = table_for(vol.fs_type);
    log::info!(
        "[FF] mounted {:?}: {} clusters of {} bytes at LBA {}",
        vol.fs_type,
        vol.n_fatent - 2,
        vol.cluster_bytes(),
        bsect
    );
    Ok(vol)
}

fn mount_exfat(vol: &mut FatVolume, bsect: u64) -> FsResult<()> {
    let bs = BootSector(&vol.win);
    if !bs.ex_zero_region_clear() || bs.ex_version() != 0x100 {
        return Err(FsError::NoFilesystem);
    }
    if 1u32.checked_shl(bs.ex_bytes_per_sector_shift() as u32) != Some(vol.ssize) {
        return Err(FsError::NoFilesystem);
    }
    let maxlba = bs.ex_total_sectors().saturating_add(bsect);
    if bs.ex_num_fats() != 1 {
        return Err(FsError::NoFilesystem);
    }
    let csize = match 1u32.checked_shl(bs.ex_sectors_per_cluster_shift() as u32) {
        Some(c) if bs.ex_sectors_per_cluster_shift() <= 25 => c,
        _ => return Err(FsError::NoFilesystem),
    };
    let nclst = bs.ex_cluster_count();
    if nclst > MAX_EXFAT {
        return Err(FsError::NoFilesystem);
    }

    vol.fsize = bs.ex_fat_size();
    vol.n_fats = 1;
    vol.csize = csize;
    vol.n_fatent = nclst + 2;
    vol.volbase = bsect;
    vol.database = bsect + bs.ex_data_offset() as u64;
    vol.fatbase = bsect + bs.ex_fat_offset() as u64;
    if maxlba < vol.database + nclst as u64 * csize as u64 {
        return Err(FsError::NoFilesystem);
    }
    vol.dirbase = bs.ex_root_cluster() as u64;
    vol.fs_type = FatType::ExFat;

    // Locate the allocation bitmap entry in the root directory
    let ss = vol.ssize as usize;
    let root = vol.clst2sect(vol.dirbase as u32);
    if root == 0 {
        return Err(FsError::NoFilesystem);
    }
    let mut so = 0u32;
    let mut i = 0usize;
    loop {
        if i == 0 {
            if so >= vol.csize {
                log::warn!("[FF] exFAT allocation bitmap entry not found");
                return Err(FsError::NoFilesystem);
            }
            vol.move_window(root + so as u64)?;
            so += 1;
        }
        if vol.win[i] == xdir_type::BITMAP {
            break;
        }
        i = (i + SZDIRE) % ss;
    }
    let mut bcl = ld_dword(&vol.win, i + 20);
    if bcl < 2 || bcl >= vol.n_fatent {
        return Err(FsError::NoFilesystem);
    }
    vol.bitbase = vol.database + vol.csize as u64 * (bcl - 2) as u64;

    // The bitmap must be contiguous
    loop {
        vol.move_window(vol.fatbase + (bcl / (vol.ssize / 4)) as u64)?;
        let cv = ld_dword(&vol.win, (bcl % (vol.ssize / 4) * 4) as usize);
        if cv == 0xFFFF_FFFF {
            break;
        }
        bcl += 1;
        if cv != bcl {
            log::warn!("[FF] exFAT allocation bitmap is fragmented");
            return Err(FsError::NoFilesystem);
        }
    }

    vol.last_clst = 0xFFFF_FFFF;
    vol.free_clst = 0xFFFF_FFFF;
    Ok(())
}

fn mount_fat(vol: &mut FatVolume, bsect: u64) -> FsResult<()> {
    let bs = BootSector(&vol.win);
    if bs.bytes_per_sector() as u32 != vol.ssize {
        return Err(FsError::NoFilesystem);
    }
    let fsize = bs.fat_size();
    let n_fats = bs.num_fats();
    if n_fats != 1 && n_fats != 2 {
        return Err(FsError::NoFilesystem);
    }
    let fasize = fsize as u64 * n_fats as u64;
    let csize = bs.sectors_per_cluster() as u32;
    if !csize.is_power_of_two() {
        return Err(FsError::NoFilesystem);
    }
    let n_rootdir = bs.root_entry_count();
    let ents_per_sect = vol.ssize / SZDIRE as u32;
    if n_rootdir as u32 % ents_per_sect != 0 {
        return Err(FsError::NoFilesystem);
    }
    let tsect = bs.total_sectors() as u64;
    let nrsv = bs.reserved_sectors() as u64;
    if nrsv == 0 {
        return Err(FsError::NoFilesystem);
    }
    let sysect = nrsv + fasize + (n_rootdir as u32 / ents_per_sect) as u64;
    if tsect < sysect {
        return Err(FsError::NoFilesystem);
    }
    let nclst = (tsect - sysect) / csize as u64;
    if nclst == 0 || nclst > MAX_FAT32 as u64 {
        return Err(FsError::NoFilesystem);
    }
    let nclst = nclst as u32;
    let fs_type = if nclst <= MAX_FAT12 {
        FatType::Fat12
    } else if nclst <= MAX_FAT16 {
        FatType::Fat16
    } else {
        FatType::Fat32
    };

    let fs_version = bs.fs_version32();
    let root_cluster = bs.root_cluster32();
    let fs_info = bs.fs_info32();

    vol.fs_type = fs_type;
    vol.fsize = fsize;
    vol.n_fats = n_fats;
    vol.csize = csize;
    vol.n_rootdir = n_rootdir;
    vol.n_fatent = nclst + 2;
    vol.volbase = bsect;
    vol.fatbase = bsect + nrsv;
    vol.database = bsect + sysect;

    let szbfat = if fs_type == FatType::Fat32 {
        if fs_version != 0 || n_rootdir != 0 {
            return Err(FsError::NoFilesystem);
        }
        vol.dirbase = root_cluster as u64;
        vol.n_fatent as u64 * 4
    } else {
        if n_rootdir == 0 {
            return Err(FsError::NoFilesystem);
        }
        vol.dirbase = vol.fatbase + fasize;
        if fs_type == FatType::Fat16 {
            vol.n_fatent as u64 * 2
        } else {
            vol.n_fatent as u64 * 3 / 2 + (vol.n_fatent & 1) as u64
        }
    };
    if (vol.fsize as u64) < (szbfat + vol.ssize as u64 - 1) / vol.ssize as u64 {
        return Err(FsError::NoFilesystem);
    }

    vol.last_clst = 0xFFFF_FFFF;
    vol.free_clst = 0xFFFF_FFFF;
    vol.fsi_flag = 0x80;
    if fs_type == FatType::Fat32 && fs_info == 1 && vol.move_window(bsect + 1).is_ok() {
        vol.fsi_flag = 0;
        let w = &vol.win;
        if ld_word(w, BS_55AA) == 0xAA55
            && ld_dword(w, FSI_LEAD_SIG) == FSI_LEAD_SIG_VALUE
            && ld_dword(w, FSI_STRUC_SIG) == FSI_STRUC_SIG_VALUE
        {
            let free = ld_dword(w, FSI_FREE_COUNT);
            let next = ld_dword(w, FSI_NXT_FREE);
            if free <= nclst {
                vol.free_clst = free;
            }
            vol.last_clst = next;
            log::debug!("[FF] FSInfo: {} free clusters, next free {}", free, next);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockDevice, RamDisk};
    use crate::codec::{st_dword, st_word};
    use crate::mkfs::{mkfs, MkfsFormat, MkfsOptions};
    use crate::time::FixedClock;
    use alloc::boxed::Box;

    fn device(disk: &RamDisk) -> Device {
        let b: Box<dyn BlockDevice + Send> = Box::new(disk.clone());
        Arc::new(spin::Mutex::new(b))
    }

    fn clock() -> Arc<dyn TimeSource + Send + Sync> {
        Arc::new(FixedClock::default())
    }

    #[test]
    fn test_blank_disk_has_no_filesystem() {
        let disk = RamDisk::new(512, 4096);
        let cfg = FsConfig::default();
        let res = mount_volume(&device(&disk), 0, &cfg, clock(), 1, false);
        assert_eq!(res.err(), Some(FsError::NoFilesystem));
    }

    #[test]
    fn test_mount_formatted_fat12() {
        let disk = RamDisk::new(512, 2048);
        let dev = device(&disk);
        let opts = MkfsOptions { fmt: MkfsFormat::FAT | MkfsFormat::SFD, ..MkfsOptions::default() };
        mkfs(&dev, 0, &opts).unwrap();
        let vol = mount_volume(&dev, 0, &FsConfig::default(), clock(), 7, false).unwrap();
        assert_eq!(vol.fs_type, FatType::Fat12);
        assert_eq!(vol.id, 7);
        assert_eq!(vol.volbase, 0);
        assert_eq!(vol.free_clst, 0xFFFF_FFFF);
    }

    #[test]
    fn test_partition_selection() {
        let disk = RamDisk::new(512, 8192);
        let dev = device(&disk);
        let mut mbr = vec![0u8; 512];
        let parts = [(2048u32, 2048u32), (4096, 4096)];
        for (i, &(start, size)) in parts.iter().enumerate() {
            let pte = MBR_TABLE + i * SZ_PTE;
            mbr[pte + PTE_SYSTEM] = partition_type::FAT12;
            st_dword(&mut mbr, pte + PTE_ST_LBA, start);
            st_dword(&mut mbr, pte + PTE_SIZ_LBA, size);
        }
        st_word(&mut mbr, BS_55AA, 0xAA55);
        {
            let mut d = dev.lock();
            d.initialize();
            d.write(&mbr, 0, 1).unwrap();
        }
        let opts = MkfsOptions { fmt: MkfsFormat::FAT, ..MkfsOptions::default() };
        mkfs(&dev, 2, &opts).unwrap();

        let cfg = FsConfig::default();
        // Partition 1 is still blank
        let res = mount_volume(&dev, 1, &cfg, clock(), 1, false);
        assert_eq!(res.err(), Some(FsError::NoFilesystem));
        let vol = mount_volume(&dev, 2, &cfg, clock(), 1, false).unwrap();
        assert_eq!(vol.volbase, 4096);
        // Auto detection skips the blank partition
        let vol = mount_volume(&dev, 0, &cfg, clock(), 2, false).unwrap();
        assert_eq!(vol.volbase, 4096);
    }

    #[test]
    fn test_exfat_rejected_when_disabled() {
        let disk = RamDisk::new(512, 16384);
        let dev = device(&disk);
        let opts = MkfsOptions { fmt: MkfsFormat::EXFAT | MkfsFormat::SFD, ..MkfsOptions::default() };
        mkfs(&dev, 0, &opts).unwrap();
        let cfg = FsConfig { exfat: false, ..FsConfig::default() };
        let res = mount_volume(&dev, 0, &cfg, clock(), 1, false);
        assert_eq!(res.err(), Some(FsError::NoFilesystem));
        let vol = mount_volume(&dev, 0, &FsConfig::default(), clock(), 1, false).unwrap();
        assert_eq!(vol.fs_type, FatType::ExFat);
    }

    #[test]
    fn test_write_protected_mount() {
        let disk = RamDisk::new(512, 2048);
        let dev = device(&disk);
        mkfs(&dev, 0, &MkfsOptions::default()).unwrap();
        disk.set_write_protect(true);
        let cfg = FsConfig::default();
        let res = mount_volume(&dev, 0, &cfg, clock(), 1, true);
        assert_eq!(res.err(), Some(FsError::WriteProtected));
        assert!(mount_volume(&dev, 0, &cfg, clock(), 1, false).is_ok());
    }
}
