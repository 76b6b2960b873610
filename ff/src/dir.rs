//! Directory engine
//!
//! A [`DirCursor`] walks a directory table entry by entry. The table is
//! either the static FAT12/16 root directory or a cluster chain; the cursor
//! tracks the byte offset, the current cluster and sector, and the offset of
//! the current entry inside the volume window.
//!
//! # Operations
//! - `dir_sdi` / `dir_next` - position and advance (optionally stretching)
//! - `dir_alloc` - find a run of free entries
//! - `dir_read` / `dir_find` - enumerate and look up entries
//! - `dir_register` / `dir_remove` - create and delete entry sets
//! - `get_fileinfo` - decode the current entry

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::chain::{create_chain, fill_first_frag, fill_last_frag};
use crate::codec::{ld_dword, ld_qword, ld_word, st_qword};
use crate::config::{max_dirb, MAX_DIR, MAX_DIR_EX};
use crate::error::{FsError, FsResult};
use crate::exfat::{create_xdir, load_obj_xdir, load_xdir, store_xdir, xname_sum};
use crate::flags::{FileAttr, NameFlags, AM_LFN, AM_MASK};
use crate::layout::*;
use crate::lfn::{cmp_lfn, lfn_entries, pick_lfn, put_lfn};
use crate::name::{gen_numname, sum_sfn, SegmentName, NSFLAG};
use crate::unicode::{oem2uni, utf16_to_string, wtoupper};
use crate::volume::{chain_status, FatVolume, ObjectId};

/// Block offset value meaning "no LFN / entry block"
pub(crate) const NO_BLOCK: u32 = u32::MAX;

/// File information returned by `stat` and directory reads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    /// File size in bytes (0 for directories)
    pub size: u64,
    /// Modification date (packed FAT date)
    pub date: u16,
    /// Modification time (packed FAT time)
    pub time: u16,
    pub attr: FileAttr,
    /// Primary name (long name if present)
    pub name: String,
    /// Short name alias (empty when it equals the primary name)
    pub alt_name: String,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.attr.contains(FileAttr::DIR)
    }
}

/// Cursor over a directory table
pub(crate) struct DirCursor {
    pub obj: ObjectId,
    /// Current read/write offset in bytes
    pub dptr: u32,
    /// Current cluster (0 in the static root directory)
    pub clust: u32,
    /// Current sector (0 at the end of the table)
    pub sect: u64,
    /// Offset of the current entry inside the window
    pub ent: usize,
    /// Name being looked up or registered
    pub name: SegmentName,
    /// Offset of the first entry of the current LFN run / entry block
    pub blk_ofs: u32,
    /// Long name picked up while reading (NUL terminated)
    pub lfnbuf: Vec<u16>,
    /// exFAT entry block of the current object
    pub xbuf: Vec<u8>,
}

impl DirCursor {
    pub fn new(vol: &FatVolume, obj: ObjectId) -> Self {
        let lfn = vol.cfg.max_lfn;
        Self {
            obj,
            dptr: 0,
            clust: 0,
            sect: 0,
            ent: 0,
            name: SegmentName::default(),
            blk_ofs: NO_BLOCK,
            lfnbuf: vec![0u16; lfn + 1],
            xbuf: if vol.is_exfat() { vec![0u8; max_dirb(lfn)] } else { Vec::new() },
        }
    }

    /// Short name status flags of the current name
    pub fn flags(&self) -> NameFlags {
        self.name.flags()
    }

    /// Current entry (valid after `move_window(sect)`)
    pub fn entry<'v>(&self, vol: &'v FatVolume) -> &'v [u8] {
        &vol.win[self.ent..self.ent + SZDIRE]
    }

    pub fn entry_mut<'v>(&self, vol: &'v mut FatVolume) -> &'v mut [u8] {
        &mut vol.win[self.ent..self.ent + SZDIRE]
    }
}

fn max_dir(vol: &FatVolume) -> u32 {
    if vol.is_exfat() {
        MAX_DIR_EX
    } else {
        MAX_DIR
    }
}

// ============================================================================
// Traversal
// ============================================================================

/// Set the cursor to byte offset `ofs`
pub(crate) fn dir_sdi(vol: &mut FatVolume, dp: &mut DirCursor, ofs: u32) -> FsResult<()> {
    if ofs >= max_dir(vol) || ofs as usize % SZDIRE != 0 {
        return Err(FsError::IntErr);
    }
    dp.dptr = ofs;
    let mut clst = dp.obj.sclust;
    if clst == 0 && matches!(vol.fs_type, crate::FatType::Fat32 | crate::FatType::ExFat) {
        clst = vol.dirbase as u32;
        // The root directory always has a FAT chain
        dp.obj.stat = chain_status::FAT;
    }
    let mut ofs = ofs;
    if clst == 0 {
        if ofs as usize / SZDIRE >= vol.n_rootdir as usize {
            return Err(FsError::IntErr);
        }
        dp.sect = vol.dirbase;
    } else {
        let csz = vol.cluster_bytes();
        while ofs >= csz {
            clst = vol.get_fat(&dp.obj, clst)?;
            if clst < 2 || clst >= vol.n_fatent {
                return Err(FsError::IntErr);
            }
            ofs -= csz;
        }
        dp.sect = vol.clst2sect(clst);
    }
    dp.clust = clst;
    if dp.sect == 0 {
        return Err(FsError::IntErr);
    }
    dp.sect += (ofs / vol.ssize) as u64;
    dp.ent = (ofs % vol.ssize) as usize;
    Ok(())
}

/// Advance the cursor by one entry
///
/// At the end of the table `NoFile` is returned, unless `stretch` is set and
/// the table can grow by a cluster (a full volume is `Denied`).
pub(crate) fn dir_next(vol: &mut FatVolume, dp: &mut DirCursor, stretch: bool) -> FsResult<()> {
    let ofs = dp.dptr + SZDIRE as u32;
    if ofs >= max_dir(vol) {
        dp.sect = 0;
    }
    if dp.sect == 0 {
        return Err(FsError::NoFile);
    }

    if ofs % vol.ssize == 0 {
        dp.sect += 1;
        if dp.clust == 0 {
            if ofs as usize / SZDIRE >= vol.n_rootdir as usize {
                dp.sect = 0;
                return Err(FsError::NoFile);
            }
        } else if (ofs / vol.ssize) & (vol.csize - 1) == 0 {
            let mut clst = vol.get_fat(&dp.obj, dp.clust)?;
            if clst <= 1 {
                return Err(FsError::IntErr);
            }
            if clst >= vol.n_fatent {
                if !stretch {
                    dp.sect = 0;
                    return Err(FsError::NoFile);
                }
                clst = create_chain(vol, &mut dp.obj, dp.clust)?;
                if clst == 0 {
                    return Err(FsError::Denied);
                }
                vol.clear_cluster(clst)?;
                dp.obj.stat |= chain_status::STRETCHED;
                log::debug!("[FF] directory stretched with cluster {}", clst);
            }
            dp.clust = clst;
            dp.sect = vol.clst2sect(clst);
        }
    }
    dp.dptr = ofs;
    dp.ent = (ofs % vol.ssize) as usize;
    Ok(())
}

/// Reserve a run of `n_ent` free entries, stretching the table if needed
///
/// On success the cursor points at the last entry of the run.
pub(crate) fn dir_alloc(vol: &mut FatVolume, dp: &mut DirCursor, n_ent: usize) -> FsResult<()> {
    let res = (|| {
        dir_sdi(vol, dp, 0)?;
        let mut n = 0usize;
        loop {
            vol.move_window(dp.sect)?;
            let e = dp.entry(vol);
            let free = if vol.is_exfat() {
                e[XDIR_TYPE] & 0x80 == 0
            } else {
                e[DIR_NAME] == DDEM || e[DIR_NAME] == 0
            };
            if free {
                n += 1;
                if n == n_ent {
                    return Ok(());
                }
            } else {
                n = 0;
            }
            dir_next(vol, dp, true)?;
        }
    })();
    match res {
        Err(FsError::NoFile) => Err(FsError::Denied),
        r => r,
    }
}

// ============================================================================
// Read / Find
// ============================================================================

/// Read the next object (or the volume label when `vol_label` is set)
///
/// Skips deleted entries, dot entries and orphaned LFN entries. On FAT a
/// preceding LFN run is collected into `lfnbuf` if its checksum matches.
pub(crate) fn dir_read(vol: &mut FatVolume, dp: &mut DirCursor, vol_label: bool) -> FsResult<()> {
    let mut res = Err(FsError::NoFile);
    let mut ord = 0xFFu8;
    let mut sum = 0xFFu8;

    while dp.sect != 0 {
        if let Err(e) = vol.move_window(dp.sect) {
            res = Err(e);
            break;
        }
        let mut b = dp.entry(vol)[DIR_NAME];
        if b == 0 {
            res = Err(FsError::NoFile);
            break;
        }
        if vol.is_exfat() {
            if vol_label {
                if b == xdir_type::LABEL {
                    res = Ok(());
                    break;
                }
            } else if b == xdir_type::FILE {
                dp.blk_ofs = dp.dptr;
                res = load_xdir(vol, dp);
                if res.is_ok() {
                    dp.obj.attr = dp.xbuf[XDIR_ATTR] & AM_MASK;
                }
                break;
            }
        } else {
            let ent = dp.entry(vol);
            let attr = ent[DIR_ATTR] & AM_MASK;
            dp.obj.attr = attr;
            let is_label = (attr & !FileAttr::ARC.bits()) == FileAttr::VOL.bits();
            if b == DDEM || b == b'.' || is_label != vol_label {
                ord = 0xFF;
            } else if attr == AM_LFN {
                let csum = ent[LDIR_CHKSUM];
                if b & LLEF != 0 {
                    sum = csum;
                    b &= !LLEF;
                    ord = b;
                    dp.blk_ofs = dp.dptr;
                }
                let ent = &vol.win[dp.ent..dp.ent + SZDIRE];
                ord = if b == ord && sum == csum && pick_lfn(&mut dp.lfnbuf, ent) {
                    ord - 1
                } else {
                    0xFF
                };
            } else {
                if ord != 0 || sum != sum_sfn(ent) {
                    dp.blk_ofs = NO_BLOCK;
                }
                res = Ok(());
                break;
            }
        }
        if let Err(e) = dir_next(vol, dp, false) {
            res = Err(e);
            break;
        }
    }

    if res.is_err() {
        dp.sect = 0;
    }
    res
}

/// Find the object named by `dp.name` in the directory
pub(crate) fn dir_find(vol: &mut FatVolume, dp: &mut DirCursor) -> FsResult<()> {
    dir_sdi(vol, dp, 0)?;

    if vol.is_exfat() {
        let hash = xname_sum(&dp.name.lfn);
        loop {
            dir_read(vol, dp, false)?;
            let xb = &dp.xbuf;
            let nc = xb[XDIR_NUM_NAME] as usize;
            if nc > vol.cfg.max_lfn || ld_word(xb, XDIR_NAME_HASH) != hash {
                continue;
            }
            if nc != dp.name.lfn.len() {
                continue;
            }
            let mut di = SZDIRE * 2;
            let mut matched = true;
            for &want in dp.name.lfn.iter() {
                if di % SZDIRE == 0 {
                    di += 2;
                }
                if wtoupper(ld_word(xb, di) as u32) != wtoupper(want as u32) {
                    matched = false;
                    break;
                }
                di += 2;
            }
            if matched {
                return Ok(());
            }
        }
    }

    let nolfn = dp.flags().contains(NameFlags::NOLFN);
    let loss = dp.flags().contains(NameFlags::LOSS);
    let mut ord = 0xFFu8;
    let mut sum = 0xFFu8;
    dp.blk_ofs = NO_BLOCK;
    loop {
        vol.move_window(dp.sect)?;
        let ent = &vol.win[dp.ent..dp.ent + SZDIRE];
        let mut c = ent[DIR_NAME];
        if c == 0 {
            return Err(FsError::NoFile);
        }
        let a = ent[DIR_ATTR] & AM_MASK;
        dp.obj.attr = a;
        if c == DDEM || (a & FileAttr::VOL.bits() != 0 && a != AM_LFN) {
            ord = 0xFF;
            dp.blk_ofs = NO_BLOCK;
        } else if a == AM_LFN {
            if !nolfn {
                let csum = ent[LDIR_CHKSUM];
                if c & LLEF != 0 {
                    sum = csum;
                    c &= !LLEF;
                    ord = c;
                    dp.blk_ofs = dp.dptr;
                }
                ord = if c == ord && sum == csum && cmp_lfn(&dp.name.lfn, ent, vol.cfg.max_lfn) {
                    ord - 1
                } else {
                    0xFF
                };
            }
        } else {
            if ord == 0 && sum == sum_sfn(ent) {
                return Ok(());
            }
            if !loss && ent[..11] == dp.name.sfn[..11] {
                return Ok(());
            }
            ord = 0xFF;
            dp.blk_ofs = NO_BLOCK;
        }
        dir_next(vol, dp, false)?;
    }
}

// ============================================================================
// Register / Remove
// ============================================================================

/// Create the entry set for `dp.name` in the directory
///
/// On exFAT the new entry block is only prepared in `dp.xbuf`; the caller
/// fills in the object fields and writes it with `store_xdir`.
pub(crate) fn dir_register(vol: &mut FatVolume, dp: &mut DirCursor) -> FsResult<()> {
    if dp.flags().intersects(NameFlags::DOT | NameFlags::NONAME) {
        return Err(FsError::InvalidName);
    }
    let len = dp.name.lfn.len();

    if vol.is_exfat() {
        let n_ent = (len + 14) / 15 + 2;
        dir_alloc(vol, dp, n_ent)?;
        dp.blk_ofs = dp.dptr - (SZDIRE * (n_ent - 1)) as u32;

        if dp.obj.stat & chain_status::STRETCHED != 0 {
            dp.obj.stat &= !chain_status::STRETCHED;
            fill_first_frag(vol, &mut dp.obj)?;
            fill_last_frag(vol, &mut dp.obj, dp.clust, 0xFFFF_FFFF)?;
            if dp.obj.sclust != 0 {
                // Record the grown size in the directory's own entry block
                let mut dj = load_obj_xdir(vol, &dp.obj)?;
                dp.obj.objsize += vol.cluster_bytes() as u64;
                st_qword(&mut dj.xbuf, XDIR_FILE_SIZE, dp.obj.objsize);
                st_qword(&mut dj.xbuf, XDIR_VALID_FILE_SIZE, dp.obj.objsize);
                dj.xbuf[XDIR_GEN_FLAGS] = dp.obj.stat | 1;
                store_xdir(vol, &mut dj)?;
            }
        }

        create_xdir(&mut dp.xbuf, &dp.name.lfn);
        return Ok(());
    }

    let sn = dp.name.sfn;
    if NameFlags::from_bits_retain(sn[NSFLAG]).contains(NameFlags::LOSS) {
        // Find a free numbered short name
        dp.name.set_flags(NameFlags::NOLFN);
        let mut n = 1u32;
        loop {
            if n >= 100 {
                log::debug!("[FF] no free numbered short name");
                return Err(FsError::Denied);
            }
            gen_numname(&mut dp.name.sfn, &sn, &dp.name.lfn, n, vol.cfg.code_page);
            match dir_find(vol, dp) {
                Ok(()) => n += 1,
                Err(FsError::NoFile) => break,
                Err(e) => return Err(e),
            }
        }
        dp.name.sfn[NSFLAG] = sn[NSFLAG];
    }

    let mut n_ent = if NameFlags::from_bits_retain(sn[NSFLAG]).contains(NameFlags::LFN) {
        lfn_entries(len) + 1
    } else {
        1
    };
    dir_alloc(vol, dp, n_ent)?;
    n_ent -= 1;
    if n_ent > 0 {
        let first = dp.dptr - (n_ent * SZDIRE) as u32;
        dir_sdi(vol, dp, first)?;
        let sum = sum_sfn(&dp.name.sfn);
        loop {
            vol.move_window(dp.sect)?;
            let ent = &mut vol.win[dp.ent..dp.ent + SZDIRE];
            put_lfn(&dp.name.lfn, ent, n_ent as u8, sum);
            vol.touch();
            dir_next(vol, dp, false)?;
            n_ent -= 1;
            if n_ent == 0 {
                break;
            }
        }
    }

    vol.move_window(dp.sect)?;
    let ent = &mut vol.win[dp.ent..dp.ent + SZDIRE];
    ent.fill(0);
    ent[DIR_NAME..DIR_NAME + 11].copy_from_slice(&dp.name.sfn[..11]);
    ent[DIR_NT_RES] = dp.name.sfn[NSFLAG] & (NameFlags::BODY | NameFlags::EXT).bits();
    vol.touch();
    Ok(())
}

/// Mark the entry set at the cursor as deleted
pub(crate) fn dir_remove(vol: &mut FatVolume, dp: &mut DirCursor) -> FsResult<()> {
    let last = dp.dptr;
    if dp.blk_ofs != NO_BLOCK {
        let first = dp.blk_ofs;
        dir_sdi(vol, dp, first)?;
    }
    loop {
        vol.move_window(dp.sect)?;
        if vol.is_exfat() {
            dp.entry_mut(vol)[XDIR_TYPE] &= 0x7F;
        } else {
            dp.entry_mut(vol)[DIR_NAME] = DDEM;
        }
        vol.touch();
        if dp.dptr >= last {
            return Ok(());
        }
        match dir_next(vol, dp, false) {
            Ok(()) => {}
            Err(FsError::NoFile) => return Err(FsError::IntErr),
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// File Information
// ============================================================================

/// Decode the object at the cursor into a [`FileInfo`]
pub(crate) fn get_fileinfo(vol: &mut FatVolume, dp: &DirCursor) -> FsResult<FileInfo> {
    let mut fno = FileInfo::default();
    if dp.sect == 0 {
        return Ok(fno);
    }

    if vol.is_exfat() {
        return Ok(get_xfileinfo(&dp.xbuf, vol.cfg.max_lfn));
    }

    vol.move_window(dp.sect)?;
    let ent = dp.entry(vol);
    let cp = vol.cfg.code_page;

    if dp.blk_ofs != NO_BLOCK {
        let n = dp.lfnbuf.iter().position(|&c| c == 0).unwrap_or(dp.lfnbuf.len());
        if let Ok(s) = String::from_utf16(&dp.lfnbuf[..n]) {
            fno.name = s;
        }
    }

    let mut alt = String::new();
    for (si, &b) in ent[..11].iter().enumerate() {
        if b == b' ' {
            continue;
        }
        let b = if b == RDDEM { DDEM } else { b };
        if si == 8 {
            alt.push('.');
        }
        let wc = oem2uni(b as u16, cp);
        match char::from_u32(wc as u32) {
            Some(c) if wc != 0 => alt.push(c),
            _ => {
                alt.clear();
                break;
            }
        }
    }

    if fno.name.is_empty() {
        if alt.is_empty() {
            fno.name.push('?');
        } else {
            // Apply the NT lower case flags to the short name
            let ntres = ent[DIR_NT_RES];
            let mut lcf = NameFlags::BODY.bits();
            for c in alt.chars() {
                if c == '.' {
                    lcf = NameFlags::EXT.bits();
                }
                if c.is_ascii_uppercase() && ntres & lcf != 0 {
                    fno.name.push(c.to_ascii_lowercase());
                } else {
                    fno.name.push(c);
                }
            }
        }
        if ent[DIR_NT_RES] == 0 {
            alt.clear();
        }
    }
    fno.alt_name = alt;
    fno.attr = FileAttr::from_bits_truncate(ent[DIR_ATTR] & AM_MASK);
    fno.size = ld_dword(ent, DIR_FILE_SIZE) as u64;
    fno.time = ld_word(ent, DIR_MOD_TIME);
    fno.date = ld_word(ent, DIR_MOD_TIME + 2);
    Ok(fno)
}

/// Decode an exFAT entry block
pub(crate) fn get_xfileinfo(xb: &[u8], max_lfn: usize) -> FileInfo {
    let nc = xb[XDIR_NUM_NAME] as usize;
    let mut units: Vec<u16> = Vec::with_capacity(nc);
    let mut di = SZDIRE * 2;
    while units.len() < nc {
        if di >= max_dirb(max_lfn) {
            units.clear();
            break;
        }
        if di % SZDIRE == 0 {
            di += 2;
        }
        units.push(ld_word(xb, di));
        di += 2;
    }
    let mut name = utf16_to_string(&units);
    if name.is_empty() {
        name.push('?');
    }
    let attr = FileAttr::from_bits_truncate(xb[XDIR_ATTR] & AM_MASK);
    FileInfo {
        size: if attr.contains(FileAttr::DIR) { 0 } else { ld_qword(xb, XDIR_FILE_SIZE) },
        time: ld_word(xb, XDIR_MOD_TIME),
        date: ld_word(xb, XDIR_MOD_TIME + 2),
        attr,
        name,
        alt_name: String::new(),
    }
}
