//! Volume-level operations on names
//!
//! Everything here resolves a path, edits one or two directory entries and
//! flushes the volume before returning.

use alloc::string::String;
use alloc::vec::Vec;

use crate::chain::{create_chain, remove_chain};
use crate::codec::{ld_dword, ld_word, st_dword, st_qword, st_word};
use crate::dir::{dir_alloc, dir_read, dir_register, dir_remove, dir_sdi, get_fileinfo, DirCursor, FileInfo};
use crate::error::{FsError, FsResult};
use crate::exfat::{init_alloc_info, store_xdir};
use crate::flags::{FileAttr, NameFlags};
use crate::fs::FatFs;
use crate::layout::*;
use crate::lock::LockAccess;
use crate::path::{follow_path, split_drive};
use crate::time::FatTime;
use crate::unicode::{oem2uni, uni2oem, wtoupper};
use crate::volume::{FatType, FatVolume, ObjectId};

/// Resolve `path` into a fresh cursor
fn locate(vol: &mut FatVolume, path: &str) -> FsResult<DirCursor> {
    let mut dj = DirCursor::new(vol, vol.root_object());
    follow_path(vol, &mut dj, path)?;
    Ok(dj)
}

/// Copy of the short entry at the cursor
fn short_entry(vol: &mut FatVolume, dj: &DirCursor) -> FsResult<[u8; SZDIRE]> {
    vol.move_window(dj.sect)?;
    let mut ent = [0u8; SZDIRE];
    ent.copy_from_slice(dj.entry(vol));
    Ok(ent)
}

/// Write a modified short entry back at the cursor
fn put_short_entry(vol: &mut FatVolume, dj: &DirCursor, ent: &[u8; SZDIRE]) -> FsResult<()> {
    vol.move_window(dj.sect)?;
    dj.entry_mut(vol).copy_from_slice(ent);
    vol.touch();
    Ok(())
}

impl FatFs {
    /// Information about the object at `path`
    pub fn stat(&self, path: &str) -> FsResult<FileInfo> {
        self.with_path(path, false, |vol, p| {
            let dj = locate(vol, p)?;
            if dj.flags().contains(NameFlags::NONAME) {
                return Err(FsError::InvalidName);
            }
            get_fileinfo(vol, &dj)
        })
    }

    /// Remove a file or an empty directory
    pub fn unlink(&self, path: &str) -> FsResult<()> {
        self.with_path(path, true, |vol, p| {
            let mut dj = locate(vol, p)?;
            let ns = dj.flags();
            if ns.contains(NameFlags::DOT) || ns.contains(NameFlags::NONAME) {
                return Err(FsError::InvalidName);
            }
            vol.locks.check(dj.obj.sclust, dj.dptr, LockAccess::Modify)?;
            if dj.obj.attr & FileAttr::RDO.bits() != 0 {
                return Err(FsError::Denied);
            }

            let mut obj = ObjectId { id: vol.id, ..ObjectId::default() };
            if vol.is_exfat() {
                init_alloc_info(&dj.xbuf, &mut obj);
            } else {
                let ent = short_entry(vol, &dj)?;
                obj.sclust = vol.ld_clust(&ent);
            }
            let dclst = obj.sclust;

            if dj.obj.attr & FileAttr::DIR.bits() != 0 {
                if dclst == vol.cdir {
                    return Err(FsError::Denied);
                }
                vol.locks.check(dclst, 0, LockAccess::Modify)?;
                let mut sdj = DirCursor::new(vol, obj.clone());
                dir_sdi(vol, &mut sdj, 0)?;
                match dir_read(vol, &mut sdj, false) {
                    Ok(()) => return Err(FsError::Denied),
                    Err(FsError::NoFile) => {}
                    Err(e) => return Err(e),
                }
            }

            dir_remove(vol, &mut dj)?;
            if dclst != 0 {
                remove_chain(vol, &mut obj, dclst, 0)?;
            }
            vol.sync_fs()?;
            log::debug!("[FF] removed {}", p);
            Ok(())
        })
    }

    /// Create a directory
    pub fn mkdir(&self, path: &str) -> FsResult<()> {
        self.with_path(path, true, |vol, p| {
            let mut dj = DirCursor::new(vol, vol.root_object());
            match follow_path(vol, &mut dj, p) {
                Ok(()) => return Err(FsError::Exist),
                Err(FsError::NoFile) if dj.flags().contains(NameFlags::DOT) => return Err(FsError::InvalidName),
                Err(FsError::NoFile) => {}
                Err(e) => return Err(e),
            }

            let mut sobj = ObjectId { id: vol.id, ..ObjectId::default() };
            let dcl = create_chain(vol, &mut sobj, 0)?;
            if dcl == 0 {
                return Err(FsError::Denied);
            }
            let now = vol.now();
            let res = make_dir_entries(vol, &mut dj, dcl, now);
            if let Err(e) = res {
                // Give the cluster back; the original error is what matters
                let _ = remove_chain(vol, &mut sobj, dcl, 0);
                return Err(e);
            }
            vol.sync_fs()
        })
    }

    /// Rename or move an object within its volume
    ///
    /// A drive prefix on `new_path` is ignored; the object always stays on
    /// the volume of `old_path`.
    pub fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        let (_, new_rest) = split_drive(new_path)?;
        self.with_path(old_path, true, |vol, p| {
            let mut djo = locate(vol, p)?;
            if djo.flags().intersects(NameFlags::DOT | NameFlags::NONAME) {
                return Err(FsError::InvalidName);
            }
            vol.locks.check(djo.obj.sclust, djo.dptr, LockAccess::Modify)?;

            if vol.is_exfat() {
                rename_exfat(vol, &djo, new_rest)?;
            } else {
                rename_fat(vol, &djo, new_rest)?;
            }
            dir_remove(vol, &mut djo)?;
            vol.sync_fs()
        })
    }
}

/// Clear the new directory cluster and register its entry
fn make_dir_entries(vol: &mut FatVolume, dj: &mut DirCursor, dcl: u32, now: u32) -> FsResult<()> {
    vol.clear_cluster(dcl)?;
    if !vol.is_exfat() {
        // The window holds the first sector of the new cluster
        let pcl = dj.obj.sclust;
        let mut dot = [0u8; SZDIRE];
        dot[DIR_NAME..DIR_NAME + 11].fill(b' ');
        dot[DIR_NAME] = b'.';
        dot[DIR_ATTR] = FileAttr::DIR.bits();
        st_dword(&mut dot, DIR_MOD_TIME, now);
        vol.st_clust(&mut dot, dcl);
        let mut dotdot = dot;
        dotdot[DIR_NAME + 1] = b'.';
        vol.st_clust(&mut dotdot, pcl);
        vol.win[..SZDIRE].copy_from_slice(&dot);
        vol.win[SZDIRE..2 * SZDIRE].copy_from_slice(&dotdot);
        vol.touch();
    }

    dir_register(vol, dj)?;

    if vol.is_exfat() {
        let bcs = vol.cluster_bytes() as u64;
        st_dword(&mut dj.xbuf, XDIR_MOD_TIME, now);
        st_dword(&mut dj.xbuf, XDIR_FST_CLUS, dcl);
        st_qword(&mut dj.xbuf, XDIR_FILE_SIZE, bcs);
        st_qword(&mut dj.xbuf, XDIR_VALID_FILE_SIZE, bcs);
        dj.xbuf[XDIR_GEN_FLAGS] = 3;
        dj.xbuf[XDIR_ATTR] = FileAttr::DIR.bits();
        store_xdir(vol, dj)
    } else {
        let mut ent = short_entry(vol, dj)?;
        st_dword(&mut ent, DIR_MOD_TIME, now);
        vol.st_clust(&mut ent, dcl);
        ent[DIR_ATTR] = FileAttr::DIR.bits();
        put_short_entry(vol, dj, &ent)
    }
}

/// Resolve the rename target; `NoFile` means the name is free
fn target_free(vol: &mut FatVolume, djo: &DirCursor, new_path: &str) -> FsResult<DirCursor> {
    let mut djn = DirCursor::new(vol, vol.root_object());
    match follow_path(vol, &mut djn, new_path) {
        Ok(()) if djn.obj.sclust == djo.obj.sclust && djn.dptr == djo.dptr => Ok(djn),
        Ok(()) => Err(FsError::Exist),
        Err(FsError::NoFile) => Ok(djn),
        Err(e) => Err(e),
    }
}

fn rename_exfat(vol: &mut FatVolume, djo: &DirCursor, new_path: &str) -> FsResult<()> {
    let mut saved = [0u8; 2 * SZDIRE];
    saved.copy_from_slice(&djo.xbuf[..2 * SZDIRE]);
    let mut djn = target_free(vol, djo, new_path)?;
    dir_register(vol, &mut djn)?;

    let nf = djn.xbuf[XDIR_NUM_SEC];
    let nn = djn.xbuf[XDIR_NUM_NAME];
    let nh = ld_word(&djn.xbuf, XDIR_NAME_HASH);
    djn.xbuf[..2 * SZDIRE].copy_from_slice(&saved);
    djn.xbuf[XDIR_NUM_SEC] = nf;
    djn.xbuf[XDIR_NUM_NAME] = nn;
    st_word(&mut djn.xbuf, XDIR_NAME_HASH, nh);
    if djn.xbuf[XDIR_ATTR] & FileAttr::DIR.bits() == 0 {
        djn.xbuf[XDIR_ATTR] |= FileAttr::ARC.bits();
    }
    store_xdir(vol, &mut djn)
}

fn rename_fat(vol: &mut FatVolume, djo: &DirCursor, new_path: &str) -> FsResult<()> {
    let old = short_entry(vol, djo)?;
    let mut djn = target_free(vol, djo, new_path)?;
    dir_register(vol, &mut djn)?;

    let mut ent = short_entry(vol, &djn)?;
    ent[13..].copy_from_slice(&old[13..]);
    ent[DIR_ATTR] = old[DIR_ATTR];
    if ent[DIR_ATTR] & FileAttr::DIR.bits() == 0 {
        ent[DIR_ATTR] |= FileAttr::ARC.bits();
    }
    put_short_entry(vol, &djn, &ent)?;

    if ent[DIR_ATTR] & FileAttr::DIR.bits() != 0 && djo.obj.sclust != djn.obj.sclust {
        // Moved to another directory: repoint its dot-dot entry
        let sect = vol.clst2sect(vol.ld_clust(&ent));
        if sect == 0 {
            return Err(FsError::IntErr);
        }
        vol.move_window(sect)?;
        if vol.win[SZDIRE + 1] == b'.' {
            let mut dotdot = [0u8; SZDIRE];
            dotdot.copy_from_slice(&vol.win[SZDIRE..2 * SZDIRE]);
            vol.st_clust(&mut dotdot, djn.obj.sclust);
            vol.win[SZDIRE..2 * SZDIRE].copy_from_slice(&dotdot);
            vol.touch();
        }
    }
    Ok(())
}

// ============================================================================
// Attributes and timestamps
// ============================================================================

impl FatFs {
    /// Change the attributes selected by `mask` to those in `attr`
    ///
    /// Only read-only, hidden, system and archive can be changed.
    pub fn chmod(&self, path: &str, attr: FileAttr, mask: FileAttr) -> FsResult<()> {
        let mask = (mask & (FileAttr::RDO | FileAttr::HID | FileAttr::SYS | FileAttr::ARC)).bits();
        let attr = attr.bits();
        self.edit_entry(path, |vol, dj| {
            if vol.is_exfat() {
                dj.xbuf[XDIR_ATTR] = (attr & mask) | (dj.xbuf[XDIR_ATTR] & !mask);
                store_xdir(vol, dj)
            } else {
                let mut ent = short_entry(vol, dj)?;
                ent[DIR_ATTR] = (attr & mask) | (ent[DIR_ATTR] & !mask);
                put_short_entry(vol, dj, &ent)
            }
        })
    }

    /// Set the modification timestamp
    pub fn utime(&self, path: &str, time: FatTime) -> FsResult<()> {
        let tm = time.pack();
        self.edit_entry(path, |vol, dj| {
            if vol.is_exfat() {
                st_dword(&mut dj.xbuf, XDIR_MOD_TIME, tm);
                store_xdir(vol, dj)
            } else {
                let mut ent = short_entry(vol, dj)?;
                st_dword(&mut ent, DIR_MOD_TIME, tm);
                put_short_entry(vol, dj, &ent)
            }
        })
    }

    /// Resolve a named object and let `f` rewrite its entry
    fn edit_entry(
        &self,
        path: &str,
        f: impl FnOnce(&mut FatVolume, &mut DirCursor) -> FsResult<()>,
    ) -> FsResult<()> {
        self.with_path(path, true, |vol, p| {
            let mut dj = locate(vol, p)?;
            if dj.flags().intersects(NameFlags::DOT | NameFlags::NONAME) {
                return Err(FsError::InvalidName);
            }
            f(vol, &mut dj)?;
            vol.sync_fs()
        })
    }

    // ========================================================================
    // Volume information
    // ========================================================================

    /// Number of free clusters on the volume of `path`
    pub fn getfree(&self, path: &str) -> FsResult<u32> {
        self.with_path(path, false, |vol, _| {
            if vol.free_clst <= vol.n_fatent - 2 {
                return Ok(vol.free_clst);
            }
            count_free_clusters(vol)
        })
    }

    /// Sub-type, cluster count and cluster size of the volume of `path`
    pub fn volume_geometry(&self, path: &str) -> FsResult<(FatType, u32, u32)> {
        self.with_path(path, false, |vol, _| Ok((vol.fs_type(), vol.cluster_count(), vol.cluster_bytes())))
    }

    /// Volume label and serial number
    pub fn getlabel(&self, path: &str) -> FsResult<(String, u32)> {
        self.with_path(path, false, |vol, _| {
            let mut dj = DirCursor::new(vol, vol.root_object());
            dir_sdi(vol, &mut dj, 0)?;
            let label = match dir_read(vol, &mut dj, true) {
                Ok(()) => decode_label(vol, &dj),
                Err(FsError::NoFile) => String::new(),
                Err(e) => return Err(e),
            };

            vol.move_window(vol.volbase)?;
            let ofs = match vol.fs_type {
                FatType::ExFat => BPB_VOL_ID_EX,
                FatType::Fat32 => BS_VOL_ID32,
                _ => BS_VOL_ID,
            };
            Ok((label, ld_dword(&vol.win, ofs)))
        })
    }

    /// Set the volume label; an empty label removes it
    ///
    /// `label` may carry a drive prefix.
    pub fn setlabel(&self, label: &str) -> FsResult<()> {
        let (drive, text) = self.resolve(label)?;
        self.with_drive(drive, true, |vol| {
            let exfat = vol.is_exfat();
            let (name, len) = if exfat { encode_label_ex(text)? } else { encode_label(text, vol.cfg.code_page)? };

            let mut dj = DirCursor::new(vol, vol.root_object());
            dir_sdi(vol, &mut dj, 0)?;
            match dir_read(vol, &mut dj, true) {
                Ok(()) => {
                    vol.move_window(dj.sect)?;
                    let ent = dj.entry_mut(vol);
                    if exfat {
                        ent[XDIR_NUM_LABEL] = len as u8;
                        ent[XDIR_LABEL..XDIR_LABEL + 22].copy_from_slice(&name[..22]);
                    } else if len != 0 {
                        ent[DIR_NAME..DIR_NAME + 11].copy_from_slice(&name[..11]);
                    } else {
                        ent[DIR_NAME] = DDEM;
                    }
                    vol.touch();
                }
                Err(FsError::NoFile) if len != 0 => {
                    dir_alloc(vol, &mut dj, 1)?;
                    vol.move_window(dj.sect)?;
                    let ent = dj.entry_mut(vol);
                    ent.fill(0);
                    if exfat {
                        ent[XDIR_TYPE] = xdir_type::LABEL;
                        ent[XDIR_NUM_LABEL] = len as u8;
                        ent[XDIR_LABEL..XDIR_LABEL + 22].copy_from_slice(&name[..22]);
                    } else {
                        ent[DIR_ATTR] = FileAttr::VOL.bits();
                        ent[DIR_NAME..DIR_NAME + 11].copy_from_slice(&name[..11]);
                    }
                    vol.touch();
                }
                Err(FsError::NoFile) => return Ok(()),
                Err(e) => return Err(e),
            }
            vol.sync_fs()
        })
    }
}

fn decode_label(vol: &FatVolume, dj: &DirCursor) -> String {
    let ent = dj.entry(vol);
    if vol.is_exfat() {
        let n = (ent[XDIR_NUM_LABEL] as usize).min(11);
        let units: Vec<u16> = (0..n).map(|i| ld_word(ent, XDIR_LABEL + i * 2)).collect();
        return crate::unicode::utf16_to_string(&units);
    }
    let cp = vol.cfg.code_page;
    let mut s: String = ent[DIR_NAME..DIR_NAME + 11]
        .iter()
        .filter_map(|&b| char::from_u32(oem2uni(b as u16, cp) as u32))
        .collect();
    s.truncate(s.trim_end_matches(' ').len());
    s
}

/// Characters refused in any label
const BAD_LABEL_CHARS: &str = "/*:<>|\\\"?\x7F";
/// Additionally refused in FAT labels
const BAD_FAT_LABEL_CHARS: &str = "+.,;=[]";

/// Encode an exFAT label as up to 11 UTF-16 units
fn encode_label_ex(text: &str) -> FsResult<([u8; 22], usize)> {
    let mut out = [0u8; 22];
    let mut n = 0;
    for c in text.chars().take_while(|&c| c as u32 >= 0x20) {
        if BAD_LABEL_CHARS.contains(c) {
            return Err(FsError::InvalidName);
        }
        let mut units = [0u16; 2];
        for &u in c.encode_utf16(&mut units).iter() {
            if n >= 11 {
                return Err(FsError::InvalidName);
            }
            st_word(&mut out, n * 2, u);
            n += 1;
        }
    }
    Ok((out, n))
}

/// Encode a FAT label as 11 upper-case OEM bytes padded with spaces
fn encode_label(text: &str, cp: u16) -> FsResult<([u8; 22], usize)> {
    let mut out = [b' '; 22];
    let mut n = 0;
    for c in text.chars().take_while(|&c| c as u32 >= 0x20) {
        let wc = uni2oem(wtoupper(c as u32), cp);
        if wc >= 0x100 {
            if n >= 10 {
                return Err(FsError::InvalidName);
            }
            out[n] = (wc >> 8) as u8;
            n += 1;
        }
        let b = wc as u8;
        if wc == 0 || n >= 11 || (b < 0x80 && (BAD_LABEL_CHARS.contains(b as char) || BAD_FAT_LABEL_CHARS.contains(b as char))) {
            return Err(FsError::InvalidName);
        }
        out[n] = b;
        n += 1;
    }
    if out[0] == DDEM {
        return Err(FsError::InvalidName);
    }
    while n > 0 && out[n - 1] == b' ' {
        n -= 1;
    }
    Ok((out, n))
}

/// Count free clusters by scanning the FAT or the allocation bitmap
///
/// The result is cached as the volume's free cluster count.
pub(crate) fn count_free_clusters(vol: &mut FatVolume) -> FsResult<u32> {
    let mut nfree = 0u32;
    let ss = vol.ssize as usize;
    match vol.fs_type {
        FatType::Fat12 => {
            let obj = ObjectId::default();
            for clst in 2..vol.n_fatent {
                if vol.get_fat(&obj, clst)? == 0 {
                    nfree += 1;
                }
            }
        }
        FatType::ExFat => {
            let mut remain = vol.n_fatent - 2;
            let mut sect = vol.bitbase;
            let mut i = 0;
            while remain > 0 {
                if i == 0 {
                    vol.move_window(sect)?;
                    sect += 1;
                }
                let mut bm = !vol.win[i];
                for _ in 0..8 {
                    if remain == 0 {
                        break;
                    }
                    nfree += (bm & 1) as u32;
                    bm >>= 1;
                    remain -= 1;
                }
                i = (i + 1) % ss;
            }
        }
        FatType::Fat16 | FatType::Fat32 => {
            let fat16 = vol.fs_type == FatType::Fat16;
            let step = if fat16 { 2 } else { 4 };
            let mut sect = vol.fatbase;
            let mut i = 0;
            for _ in 0..vol.n_fatent {
                if i == 0 {
                    vol.move_window(sect)?;
                    sect += 1;
                }
                let free = if fat16 {
                    ld_word(&vol.win, i) == 0
                } else {
                    ld_dword(&vol.win, i) & 0x0FFF_FFFF == 0
                };
                if free {
                    nfree += 1;
                }
                i = (i + step) % ss;
            }
        }
    }
    vol.free_clst = nfree;
    vol.fsi_flag |= 1;
    Ok(nfree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::OpenMode;
    use crate::mkfs::MkfsFormat;
    use crate::testutil::format_ram;

    fn write_file(fs: &FatFs, path: &str, data: &[u8]) {
        let mut f = fs.open(path, OpenMode::WRITE | OpenMode::CREATE_ALWAYS).unwrap();
        assert_eq!(f.write(data).unwrap(), data.len());
        f.close().unwrap();
    }

    #[test]
    fn test_mkdir_rules() {
        let (fs, _disk) = format_ram(512, 16384, MkfsFormat::FAT, 512);
        fs.mkdir("/a").unwrap();
        fs.mkdir("/a/b").unwrap();
        assert!(fs.stat("/a").unwrap().is_dir());
        assert!(fs.stat("/a/b").unwrap().is_dir());
        assert_eq!(fs.mkdir("/a"), Err(FsError::Exist));
        assert_eq!(fs.mkdir("/x/y"), Err(FsError::NoPath));
        assert_eq!(fs.stat("/"), Err(FsError::InvalidName));
        // The dot-dot entry of /a/b leads back to /a
        fs.chdir("/a/b/..").unwrap();
        assert_eq!(fs.getcwd().unwrap(), "/a");
    }

    #[test]
    fn test_unlink_rules() {
        let (fs, _disk) = format_ram(512, 16384, MkfsFormat::FAT, 512);
        let free = fs.getfree("/").unwrap();
        fs.mkdir("/d").unwrap();
        write_file(&fs, "/d/f.bin", &[7u8; 1500]);
        assert_eq!(fs.getfree("/").unwrap(), free - 4);
        assert_eq!(fs.unlink("/d"), Err(FsError::Denied));

        fs.chmod("/d/f.bin", FileAttr::RDO, FileAttr::RDO).unwrap();
        assert_eq!(fs.unlink("/d/f.bin"), Err(FsError::Denied));
        fs.chmod("/d/f.bin", FileAttr::empty(), FileAttr::RDO).unwrap();
        fs.unlink("/d/f.bin").unwrap();
        assert_eq!(fs.stat("/d/f.bin"), Err(FsError::NoFile));

        fs.chdir("/d").unwrap();
        assert_eq!(fs.unlink("/d"), Err(FsError::Denied));
        fs.chdir("/").unwrap();
        fs.unlink("/d").unwrap();
        assert_eq!(fs.getfree("/").unwrap(), free);
    }

    #[test]
    fn test_rename_moves_between_directories() {
        let (fs, _disk) = format_ram(512, 16384, MkfsFormat::FAT, 512);
        fs.mkdir("/a").unwrap();
        fs.mkdir("/b").unwrap();
        write_file(&fs, "/a/f.txt", b"payload");
        fs.rename("/a/f.txt", "/b/Renamed file.txt").unwrap();
        assert_eq!(fs.stat("/a/f.txt"), Err(FsError::NoFile));
        let info = fs.stat("/b/Renamed file.txt").unwrap();
        assert_eq!(info.size, 7);
        assert!(info.attr.contains(FileAttr::ARC));

        write_file(&fs, "/b/other", b"");
        assert_eq!(fs.rename("/b/other", "/b/Renamed file.txt"), Err(FsError::Exist));
        // Case-only rename of the same object
        fs.rename("/b/other", "/b/OTHER").unwrap();
        assert_eq!(fs.stat("/b/other").unwrap().name, "OTHER");

        fs.mkdir("/a/sub").unwrap();
        fs.rename("/a/sub", "/b/sub").unwrap();
        fs.chdir("/b/sub/..").unwrap();
        assert_eq!(fs.getcwd().unwrap(), "/b");
    }

    #[test]
    fn test_rename_on_exfat() {
        let (fs, _disk) = format_ram(512, 16384, MkfsFormat::EXFAT, 0);
        fs.mkdir("/dir").unwrap();
        write_file(&fs, "/old name.txt", b"0123456789");
        fs.rename("/old name.txt", "/dir/A much longer new name.txt").unwrap();
        let info = fs.stat("/dir/A much longer new name.txt").unwrap();
        assert_eq!(info.size, 10);
        assert_eq!(fs.stat("/old name.txt"), Err(FsError::NoFile));
        let mut f = fs.open("/dir/A much longer new name.txt", OpenMode::READ).unwrap();
        let mut buf = [0u8; 10];
        f.read(&mut buf).unwrap();
        assert_eq!(&buf, b"0123456789");
    }

    #[test]
    fn test_chmod_and_utime() {
        let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 512);
        write_file(&fs, "/f", b"x");
        fs.chmod("/f", FileAttr::HID | FileAttr::DIR, FileAttr::HID | FileAttr::DIR).unwrap();
        let attr = fs.stat("/f").unwrap().attr;
        assert!(attr.contains(FileAttr::HID));
        assert!(!attr.contains(FileAttr::DIR));

        let t = FatTime { year: 2021, month: 6, day: 15, hour: 12, minute: 30, second: 44 };
        fs.utime("/f", t).unwrap();
        let info = fs.stat("/f").unwrap();
        assert_eq!(FatTime::unpack(((info.date as u32) << 16) | info.time as u32), t);
    }

    #[test]
    fn test_labels() {
        let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 512);
        let (label, serial) = fs.getlabel("").unwrap();
        assert_eq!(label, "");
        fs.setlabel("disk 1").unwrap();
        assert_eq!(fs.getlabel("").unwrap(), (String::from("DISK 1"), serial));
        assert_eq!(fs.setlabel("bad.name"), Err(FsError::InvalidName));
        assert_eq!(fs.setlabel("TWELVE_CHARS"), Err(FsError::InvalidName));
        fs.setlabel("").unwrap();
        assert_eq!(fs.getlabel("").unwrap().0, "");
        // The label never shows up as a file
        assert!(fs.opendir("/").unwrap().read().unwrap().is_none());

        let (fs, _disk) = format_ram(512, 16384, MkfsFormat::EXFAT, 0);
        fs.setlabel("Data Vol").unwrap();
        assert_eq!(fs.getlabel("").unwrap().0, "Data Vol");
        fs.setlabel("").unwrap();
        assert_eq!(fs.getlabel("").unwrap().0, "");
    }

    #[test]
    fn test_free_count_matches_scan() {
        for (fmt, sectors, au) in [
            (MkfsFormat::FAT, 2048, 512),
            (MkfsFormat::FAT32, 100_000, 512),
            (MkfsFormat::EXFAT, 16384, 0),
        ] {
            let (fs, _disk) = format_ram(512, sectors, fmt, au);
            let initial = fs.getfree("/").unwrap();
            for i in 0..6 {
                write_file(&fs, &alloc::format!("/f{}", i), b"one cluster");
            }
            for i in 0..2 {
                fs.unlink(&alloc::format!("/f{}", i)).unwrap();
            }
            assert_eq!(fs.getfree("/").unwrap(), initial - 6 + 2);
            fs.unmount("").unwrap();
            fs.mount("", true).unwrap();
            assert_eq!(fs.getfree("/").unwrap(), initial - 4);
        }
    }
}
