//! File objects
//!
//! A [`File`] keeps one sector of file data buffered. Whole-sector runs of
//! a read or write bypass the buffer and go straight to the device; the
//! partial sectors at either end go through it.
//!
//! Any failure in the middle of a transfer is recorded in the handle and
//! every later operation fails with the same error until the file is
//! reopened.
//!
//! # Structure
//! - `open` - resolve or create the entry, truncate, take a lock slot
//! - `read` / `write` - buffered and direct sector transfer
//! - `seek` - cluster walk or fast seek through a link map
//! - `truncate` / `expand` - shrink or preallocate the chain
//! - `sync` / `close` - write back the buffer and the directory entry

use alloc::vec;
use alloc::vec::Vec;

use crate::chain::{create_chain, fill_first_frag, fill_last_frag, remove_chain};
use crate::codec::{ld_dword, st_dword, st_qword, st_word};
use crate::dir::{dir_register, DirCursor};
use crate::error::{FsError, FsResult};
use crate::exfat::{init_alloc_info, load_obj_xdir, store_xdir};
use crate::flags::{FileAttr, FileState, NameFlags, OpenMode};
use crate::fs::FatFs;
use crate::layout::*;
use crate::lock::LockAccess;
use crate::path::follow_path;
use crate::volume::{chain_status, FatVolume, ObjectId};

/// An open file
pub struct File<'a> {
    fs: &'a FatFs,
    drive: usize,
    pub(crate) obj: ObjectId,
    mode: OpenMode,
    state: FileState,
    /// Sticky error
    err: Option<FsError>,
    /// Read/write pointer
    fptr: u64,
    /// Cluster holding `fptr` (0 before the first cluster)
    clust: u32,
    /// Sector held in `buf` (0 if none)
    sect: u64,
    /// Directory entry location (FAT/FAT32)
    dir_sect: u64,
    dir_ofs: usize,
    /// Fragments `(length, first cluster)` for fast seek
    link_map: Option<Vec<(u32, u32)>>,
    buf: Vec<u8>,
    open: bool,
}

impl FatFs {
    /// Open or create a file
    pub fn open(&self, path: &str, mode: OpenMode) -> FsResult<File<'_>> {
        let write = mode.intersects(OpenMode::WRITE | OpenMode::CREATE_NEW | OpenMode::CREATE_ALWAYS | OpenMode::OPEN_ALWAYS);
        let (drive, rest) = self.resolve(path)?;
        self.with_drive(drive, write, |vol| {
            let f = open_in(vol, rest, mode)?;
            Ok(File {
                fs: self,
                drive,
                obj: f.obj,
                mode: f.mode,
                state: f.state,
                err: None,
                fptr: f.fptr,
                clust: f.clust,
                sect: f.sect,
                dir_sect: f.dir_sect,
                dir_ofs: f.dir_ofs,
                link_map: None,
                buf: f.buf,
                open: true,
            })
        })
    }
}

/// Volume-side result of an open
struct Opened {
    obj: ObjectId,
    mode: OpenMode,
    state: FileState,
    fptr: u64,
    clust: u32,
    sect: u64,
    dir_sect: u64,
    dir_ofs: usize,
    buf: Vec<u8>,
}

fn open_in(vol: &mut FatVolume, path: &str, mode: OpenMode) -> FsResult<Opened> {
    let create = mode.intersects(OpenMode::CREATE_ALWAYS | OpenMode::OPEN_ALWAYS | OpenMode::CREATE_NEW);
    let wants_write = mode.intersects(!OpenMode::READ);
    let acc = if wants_write { LockAccess::Write } else { LockAccess::Read };
    let mut mode = mode;
    let mut state = FileState::empty();

    let mut dj = DirCursor::new(vol, vol.root_object());
    let mut res = follow_path(vol, &mut dj, path);
    if res.is_ok() {
        res = if dj.flags().contains(NameFlags::NONAME) {
            Err(FsError::InvalidName)
        } else {
            vol.locks.check(dj.obj.sclust, dj.dptr, acc)
        };
    }

    if create {
        match res {
            Ok(()) => {
                if dj.obj.attr & (FileAttr::RDO | FileAttr::DIR).bits() != 0 {
                    return Err(FsError::Denied);
                }
                if mode.contains(OpenMode::CREATE_NEW) {
                    return Err(FsError::Exist);
                }
            }
            Err(FsError::NoFile) => {
                if !vol.locks.has_free_slot() && vol.locks.enabled() {
                    return Err(FsError::TooManyOpenFiles);
                }
                dir_register(vol, &mut dj)?;
                mode |= OpenMode::CREATE_ALWAYS;
            }
            Err(e) => return Err(e),
        }
        if mode.contains(OpenMode::CREATE_ALWAYS) {
            reset_entry(vol, &mut dj)?;
        }
    } else {
        res?;
        if dj.obj.attr & FileAttr::DIR.bits() != 0 {
            return Err(FsError::NoFile);
        }
        if mode.contains(OpenMode::WRITE) && dj.obj.attr & FileAttr::RDO.bits() != 0 {
            return Err(FsError::Denied);
        }
    }

    if mode.contains(OpenMode::CREATE_ALWAYS) {
        state |= FileState::MODIFIED;
    }
    let lockid = vol
        .locks
        .acquire(dj.obj.sclust, dj.dptr, wants_write)
        .ok_or(FsError::IntErr)?;

    let mut obj = ObjectId { id: vol.id, attr: dj.obj.attr, lockid, ..ObjectId::default() };
    if vol.is_exfat() {
        obj.c_scl = dj.obj.sclust;
        obj.c_size = (dj.obj.objsize as u32 & 0xFFFF_FF00) | dj.obj.stat as u32;
        obj.c_ofs = dj.blk_ofs;
        init_alloc_info(&dj.xbuf, &mut obj);
    } else {
        vol.move_window(dj.sect)?;
        let ent = &vol.win[dj.ent..dj.ent + SZDIRE];
        obj.sclust = vol.ld_clust(ent);
        obj.objsize = ld_dword(ent, DIR_FILE_SIZE) as u64;
    }

    let mut f = Opened {
        obj,
        mode,
        state,
        fptr: 0,
        clust: 0,
        sect: 0,
        dir_sect: dj.sect,
        dir_ofs: dj.ent,
        buf: vec![0u8; vol.ssize as usize],
    };

    if mode.contains(OpenMode::OPEN_APPEND) && f.obj.objsize > 0 {
        if let Err(e) = seek_to_end(vol, &mut f) {
            let _ = vol.locks.release(lockid);
            return Err(e);
        }
    }
    log::debug!("[FF] opened {} ({} bytes)", path, f.obj.objsize);
    Ok(f)
}

/// Reset the entry at `dj` to an empty archive file, freeing its chain
fn reset_entry(vol: &mut FatVolume, dj: &mut DirCursor) -> FsResult<()> {
    let now = vol.now();
    if vol.is_exfat() {
        let mut obj = ObjectId { id: vol.id, ..ObjectId::default() };
        init_alloc_info(&dj.xbuf, &mut obj);
        dj.xbuf[2..32].fill(0);
        dj.xbuf[38..64].fill(0);
        dj.xbuf[XDIR_ATTR] = FileAttr::ARC.bits();
        st_dword(&mut dj.xbuf, XDIR_CRT_TIME, now);
        dj.xbuf[XDIR_GEN_FLAGS] = 1;
        store_xdir(vol, dj)?;
        let scl = obj.sclust;
        if scl != 0 {
            remove_chain(vol, &mut obj, scl, 0)?;
            vol.last_clst = scl - 1;
        }
        dj.obj.attr = FileAttr::ARC.bits();
        return Ok(());
    }

    vol.move_window(dj.sect)?;
    let e = dj.ent;
    let mut ent = [0u8; SZDIRE];
    ent.copy_from_slice(&vol.win[e..e + SZDIRE]);
    let cl = vol.ld_clust(&ent);
    st_dword(&mut ent, DIR_CRT_TIME, now);
    st_dword(&mut ent, DIR_MOD_TIME, now);
    ent[DIR_ATTR] = FileAttr::ARC.bits();
    vol.st_clust(&mut ent, 0);
    st_dword(&mut ent, DIR_FILE_SIZE, 0);
    vol.win[e..e + SZDIRE].copy_from_slice(&ent);
    vol.touch();
    dj.obj.attr = FileAttr::ARC.bits();
    if cl != 0 {
        let sc = vol.winsect;
        let mut obj = ObjectId::default();
        remove_chain(vol, &mut obj, cl, 0)?;
        vol.move_window(sc)?;
        vol.last_clst = cl - 1;
    }
    Ok(())
}

/// Position an append-mode file at its end
fn seek_to_end(vol: &mut FatVolume, f: &mut Opened) -> FsResult<()> {
    let ss = vol.ssize as u64;
    let bcs = vol.cluster_bytes() as u64;
    f.fptr = f.obj.objsize;
    let mut clst = f.obj.sclust;
    let mut ofs = f.obj.objsize;
    while ofs > bcs {
        clst = vol.get_fat(&f.obj, clst)?;
        if clst <= 1 {
            return Err(FsError::IntErr);
        }
        ofs -= bcs;
    }
    f.clust = clst;
    if ofs % ss != 0 {
        let sc = vol.clst2sect(clst);
        if sc == 0 {
            return Err(FsError::IntErr);
        }
        f.sect = sc + ofs / ss;
        vol.disk_read(&mut f.buf, f.sect, 1)?;
    }
    Ok(())
}

impl<'a> File<'a> {
    /// Run `f` on the volume after checking the handle and its sticky error
    fn with_vol<R>(&mut self, f: impl FnOnce(&mut Self, &mut FatVolume) -> FsResult<R>) -> FsResult<R> {
        if !self.open {
            return Err(FsError::InvalidObject);
        }
        let fs = self.fs;
        fs.with_object(self.drive, self.obj.id, |vol| {
            if let Some(e) = self.err {
                return Err(e);
            }
            f(self, vol)
        })
    }

    /// Record a failure that leaves the handle unusable
    fn abort(&mut self, e: FsError) -> FsError {
        if self.err.is_none() {
            log::warn!("[FF] file handle failed: {}", e);
        }
        self.err = Some(e);
        e
    }

    /// Write back the buffered sector if dirty
    fn flush_buf(&mut self, vol: &mut FatVolume) -> FsResult<()> {
        if self.state.contains(FileState::DIRTY) {
            vol.disk_write(&self.buf, self.sect, 1)?;
            self.state.remove(FileState::DIRTY);
        }
        Ok(())
    }

    /// Current read/write position
    pub fn tell(&self) -> u64 {
        self.fptr
    }

    pub fn size(&self) -> u64 {
        self.obj.objsize
    }

    pub fn eof(&self) -> bool {
        self.fptr == self.obj.objsize
    }

    /// Sticky error of the handle, if any
    pub fn error(&self) -> Option<FsError> {
        self.err
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Flush cached data and update the directory entry
    pub fn sync(&mut self) -> FsResult<()> {
        self.with_vol(|f, vol| f.sync_in(vol))
    }

    fn sync_in(&mut self, vol: &mut FatVolume) -> FsResult<()> {
        if !self.state.contains(FileState::MODIFIED) {
            return Ok(());
        }
        self.flush_buf(vol)?;
        let now = vol.now();
        if vol.is_exfat() {
            self.settle_frags(vol)?;
            let mut dj = load_obj_xdir(vol, &self.obj)?;
            dj.xbuf[XDIR_ATTR] |= FileAttr::ARC.bits();
            dj.xbuf[XDIR_GEN_FLAGS] = self.obj.stat | 1;
            st_dword(&mut dj.xbuf, XDIR_FST_CLUS, self.obj.sclust);
            st_qword(&mut dj.xbuf, XDIR_FILE_SIZE, self.obj.objsize);
            st_qword(&mut dj.xbuf, XDIR_VALID_FILE_SIZE, self.obj.objsize);
            st_dword(&mut dj.xbuf, XDIR_MOD_TIME, now);
            dj.xbuf[XDIR_MOD_TIME10] = 0;
            st_dword(&mut dj.xbuf, XDIR_ACC_TIME, 0);
            store_xdir(vol, &mut dj)?;
        } else {
            vol.move_window(self.dir_sect)?;
            let e = self.dir_ofs;
            let mut ent = [0u8; SZDIRE];
            ent.copy_from_slice(&vol.win[e..e + SZDIRE]);
            ent[DIR_ATTR] |= FileAttr::ARC.bits();
            vol.st_clust(&mut ent, self.obj.sclust);
            st_dword(&mut ent, DIR_FILE_SIZE, self.obj.objsize as u32);
            st_dword(&mut ent, DIR_MOD_TIME, now);
            st_word(&mut ent, DIR_LST_ACC_DATE, 0);
            vol.win[e..e + SZDIRE].copy_from_slice(&ent);
            vol.touch();
        }
        vol.sync_fs()?;
        self.state.remove(FileState::MODIFIED);
        Ok(())
    }

    /// Write pending exFAT fragments of the chain to the FAT
    ///
    /// `clust` is the tail of the chain whenever fragments are pending.
    fn settle_frags(&mut self, vol: &mut FatVolume) -> FsResult<()> {
        if vol.is_exfat() && (self.obj.n_frag != 0 || self.obj.stat == chain_status::FRAGMENTED) {
            fill_first_frag(vol, &mut self.obj)?;
            fill_last_frag(vol, &mut self.obj, self.clust, 0xFFFF_FFFF)?;
        }
        Ok(())
    }

    /// Sync and release the handle
    pub fn close(mut self) -> FsResult<()> {
        self.close_in()
    }

    fn close_in(&mut self) -> FsResult<()> {
        if !self.open {
            return Ok(());
        }
        let synced = self.sync();
        if synced.is_ok() || self.err.is_some() {
            let lockid = self.obj.lockid;
            let fs = self.fs;
            let released = fs.with_object(self.drive, self.obj.id, |vol| vol.locks.release(lockid));
            self.open = false;
            synced?;
            return released;
        }
        synced
    }
}

impl Drop for File<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.close_in() {
                log::warn!("[FF] implicit close failed: {}", e);
            }
            self.open = false;
        }
    }
}

// ============================================================================
// Data transfer
// ============================================================================

impl<'a> File<'a> {
    /// Read up to `out.len()` bytes at the file pointer
    ///
    /// Returns the number of bytes read, less than requested only at the
    /// end of the file.
    pub fn read(&mut self, out: &mut [u8]) -> FsResult<usize> {
        self.with_vol(|f, vol| {
            if !f.mode.contains(OpenMode::READ) {
                return Err(FsError::Denied);
            }
            f.read_in(vol, out).map_err(|e| f.abort(e))
        })
    }

    fn read_in(&mut self, vol: &mut FatVolume, out: &mut [u8]) -> FsResult<usize> {
        let ss = vol.ssize as usize;
        let remain = self.obj.objsize.saturating_sub(self.fptr);
        let mut btr = (out.len() as u64).min(remain) as usize;
        let mut done = 0;

        while btr > 0 {
            if self.fptr % ss as u64 == 0 {
                let csect = ((self.fptr / ss as u64) & (vol.csize as u64 - 1)) as u32;
                if csect == 0 {
                    let clst = if self.fptr == 0 {
                        self.obj.sclust
                    } else if self.link_map.is_some() {
                        self.map_cluster(vol, self.fptr)
                    } else {
                        vol.get_fat(&self.obj, self.clust)?
                    };
                    if clst < 2 {
                        return Err(FsError::IntErr);
                    }
                    self.clust = clst;
                }
                let base = vol.clst2sect(self.clust);
                if base == 0 {
                    return Err(FsError::IntErr);
                }
                let sect = base + csect as u64;
                let mut cc = (btr / ss) as u32;
                if cc > 0 {
                    // Whole sectors go straight into the caller's buffer
                    cc = cc.min(vol.csize - csect);
                    let n = cc as usize * ss;
                    vol.disk_read(&mut out[done..done + n], sect, cc)?;
                    if self.state.contains(FileState::DIRTY) && self.sect.wrapping_sub(sect) < cc as u64 {
                        let o = done + (self.sect - sect) as usize * ss;
                        out[o..o + ss].copy_from_slice(&self.buf);
                    }
                    self.fptr += n as u64;
                    done += n;
                    btr -= n;
                    continue;
                }
                if self.sect != sect {
                    self.flush_buf(vol)?;
                    vol.disk_read(&mut self.buf, sect, 1)?;
                }
                self.sect = sect;
            }
            let ofs = (self.fptr % ss as u64) as usize;
            let n = (ss - ofs).min(btr);
            out[done..done + n].copy_from_slice(&self.buf[ofs..ofs + n]);
            self.fptr += n as u64;
            done += n;
            btr -= n;
        }
        Ok(done)
    }

    /// Write `data` at the file pointer
    ///
    /// A count short of `data.len()` means the volume is full.
    pub fn write(&mut self, data: &[u8]) -> FsResult<usize> {
        self.with_vol(|f, vol| {
            if !f.mode.contains(OpenMode::WRITE) {
                return Err(FsError::Denied);
            }
            f.write_in(vol, data).map_err(|e| f.abort(e))
        })
    }

    fn write_in(&mut self, vol: &mut FatVolume, data: &[u8]) -> FsResult<usize> {
        let ss = vol.ssize as usize;
        let mut btw = data.len();
        if !vol.is_exfat() && self.fptr + btw as u64 > 0xFFFF_FFFF {
            // FAT file size stays below 4 GiB
            btw = (0xFFFF_FFFF - self.fptr) as usize;
        }
        let mut done = 0;

        while btw > 0 {
            if self.fptr % ss as u64 == 0 {
                let csect = ((self.fptr / ss as u64) & (vol.csize as u64 - 1)) as u32;
                if csect == 0 {
                    let clst = if self.fptr == 0 {
                        match self.obj.sclust {
                            0 => create_chain(vol, &mut self.obj, 0)?,
                            c => c,
                        }
                    } else if self.link_map.is_some() {
                        self.map_cluster(vol, self.fptr)
                    } else {
                        create_chain(vol, &mut self.obj, self.clust)?
                    };
                    if clst == 0 {
                        log::debug!("[FF] volume full after {} bytes", done);
                        break;
                    }
                    self.clust = clst;
                    if self.obj.sclust == 0 {
                        self.obj.sclust = clst;
                    }
                }
                self.flush_buf(vol)?;
                let base = vol.clst2sect(self.clust);
                if base == 0 {
                    return Err(FsError::IntErr);
                }
                let sect = base + csect as u64;
                let mut cc = (btw / ss) as u32;
                if cc > 0 {
                    cc = cc.min(vol.csize - csect);
                    let n = cc as usize * ss;
                    vol.disk_write(&data[done..done + n], sect, cc)?;
                    if self.sect.wrapping_sub(sect) < cc as u64 {
                        // Keep the buffered sector coherent with what was written
                        let o = done + (self.sect - sect) as usize * ss;
                        self.buf.copy_from_slice(&data[o..o + ss]);
                        self.state.remove(FileState::DIRTY);
                    }
                    self.advance_write(n);
                    done += n;
                    btw -= n;
                    continue;
                }
                if self.sect != sect && self.fptr < self.obj.objsize {
                    vol.disk_read(&mut self.buf, sect, 1)?;
                }
                self.sect = sect;
            }
            let ofs = (self.fptr % ss as u64) as usize;
            let n = (ss - ofs).min(btw);
            self.buf[ofs..ofs + n].copy_from_slice(&data[done..done + n]);
            self.state.insert(FileState::DIRTY);
            self.advance_write(n);
            done += n;
            btw -= n;
        }
        self.state.insert(FileState::MODIFIED);
        self.settle_frags(vol)?;
        Ok(done)
    }

    fn advance_write(&mut self, n: usize) {
        self.fptr += n as u64;
        self.obj.objsize = self.obj.objsize.max(self.fptr);
    }

    // ========================================================================
    // Positioning
    // ========================================================================

    /// Move the file pointer to `ofs`
    ///
    /// In write mode a position past the end extends the file; the new area
    /// is allocated but its content is undefined. In read-only mode the
    /// position is clamped to the file size. When the volume fills up the
    /// pointer stops at the end of the allocated chain.
    pub fn seek(&mut self, ofs: u64) -> FsResult<()> {
        self.with_vol(|f, vol| {
            let r = if f.link_map.is_some() { f.seek_mapped(vol, ofs) } else { f.seek_in(vol, ofs) };
            r.map_err(|e| f.abort(e))
        })
    }

    fn seek_in(&mut self, vol: &mut FatVolume, ofs: u64) -> FsResult<()> {
        let ss = vol.ssize as u64;
        let writable = self.mode.contains(OpenMode::WRITE);
        let mut ofs = ofs;
        if !vol.is_exfat() {
            ofs = ofs.min(0xFFFF_FFFF);
        }
        if ofs > self.obj.objsize && !writable {
            ofs = self.obj.objsize;
        }
        let ifptr = self.fptr;
        self.fptr = 0;
        let mut nsect = 0u64;
        let mut extended = false;

        if ofs > 0 {
            let bcs = vol.cluster_bytes() as u64;
            let mut clst;
            if ifptr > 0 && (ofs - 1) / bcs >= (ifptr - 1) / bcs {
                // Same or later cluster: walk on from the current one
                self.fptr = (ifptr - 1) & !(bcs - 1);
                ofs -= self.fptr;
                clst = self.clust;
            } else {
                clst = self.obj.sclust;
                if clst == 0 && writable {
                    clst = create_chain(vol, &mut self.obj, 0)?;
                    self.obj.sclust = clst;
                    extended = true;
                }
                self.clust = clst;
            }
            if clst != 0 {
                while ofs > bcs {
                    ofs -= bcs;
                    self.fptr += bcs;
                    if writable {
                        if vol.is_exfat() && self.fptr > self.obj.objsize {
                            // The contiguous chain walk relies on the size
                            self.obj.objsize = self.fptr;
                            self.state.insert(FileState::MODIFIED);
                        }
                        clst = create_chain(vol, &mut self.obj, clst)?;
                        extended = true;
                        if clst == 0 {
                            ofs = 0;
                            break;
                        }
                    } else {
                        clst = vol.get_fat(&self.obj, clst)?;
                    }
                    if clst <= 1 || clst >= vol.n_fatent {
                        return Err(FsError::IntErr);
                    }
                    self.clust = clst;
                }
                self.fptr += ofs;
                if ofs % ss != 0 {
                    nsect = vol.clst2sect(clst);
                    if nsect == 0 {
                        return Err(FsError::IntErr);
                    }
                    nsect += ofs / ss;
                }
            }
        }
        if self.fptr > self.obj.objsize {
            self.obj.objsize = self.fptr;
            self.state.insert(FileState::MODIFIED);
        }
        if extended {
            self.settle_frags(vol)?;
        }
        if self.fptr % ss != 0 && nsect != self.sect {
            self.flush_buf(vol)?;
            vol.disk_read(&mut self.buf, nsect, 1)?;
            self.sect = nsect;
        }
        Ok(())
    }

    /// Seek using the cluster link map; never extends the file
    fn seek_mapped(&mut self, vol: &mut FatVolume, ofs: u64) -> FsResult<()> {
        let ss = vol.ssize as u64;
        let ofs = ofs.min(self.obj.objsize);
        self.fptr = ofs;
        if ofs > 0 {
            self.clust = self.map_cluster(vol, ofs - 1);
            let base = vol.clst2sect(self.clust);
            if base == 0 {
                return Err(FsError::IntErr);
            }
            let dsc = base + ((ofs - 1) / ss & (vol.csize as u64 - 1));
            if self.fptr % ss != 0 && dsc != self.sect {
                self.flush_buf(vol)?;
                vol.disk_read(&mut self.buf, dsc, 1)?;
                self.sect = dsc;
            }
        }
        Ok(())
    }

    /// Cluster holding byte `ofs` according to the link map (0 if outside)
    fn map_cluster(&self, vol: &FatVolume, ofs: u64) -> u32 {
        let mut cl = (ofs / vol.ssize as u64 / vol.csize as u64) as u32;
        for &(len, start) in self.link_map.iter().flatten() {
            if cl < len {
                return start + cl;
            }
            cl -= len;
        }
        0
    }

    /// Build the cluster link map of the file and switch to fast seek
    ///
    /// Returns the number of fragments. Fast seek never extends the file;
    /// writes past the mapped chain stop as if the volume were full.
    pub fn create_link_map(&mut self) -> FsResult<usize> {
        if !self.fs.config.fast_seek {
            return Err(FsError::NotEnabled);
        }
        self.with_vol(|f, vol| {
            let mut map = Vec::new();
            let mut cl = f.obj.sclust;
            if cl != 0 {
                loop {
                    let start = cl;
                    let mut len = 0u32;
                    loop {
                        let pcl = cl;
                        len += 1;
                        cl = vol.get_fat(&f.obj, pcl)?;
                        if cl <= 1 {
                            return Err(f.abort(FsError::IntErr));
                        }
                        if cl != pcl + 1 {
                            break;
                        }
                    }
                    map.push((len, start));
                    if cl >= vol.n_fatent {
                        break;
                    }
                }
            }
            let n = map.len();
            f.link_map = Some(map);
            log::debug!("[FF] link map with {} fragments", n);
            Ok(n)
        })
    }

    /// Return to normal cluster-walk seeking
    pub fn clear_link_map(&mut self) {
        self.link_map = None;
    }

    // ========================================================================
    // Size changes
    // ========================================================================

    /// Cut the file at the file pointer
    pub fn truncate(&mut self) -> FsResult<()> {
        self.with_vol(|f, vol| {
            if !f.mode.contains(OpenMode::WRITE) {
                return Err(FsError::Denied);
            }
            f.truncate_in(vol).map_err(|e| f.abort(e))
        })
    }

    fn truncate_in(&mut self, vol: &mut FatVolume) -> FsResult<()> {
        if self.fptr >= self.obj.objsize {
            return Ok(());
        }
        let mut res = Ok(());
        if self.fptr == 0 {
            if self.obj.sclust != 0 {
                let scl = self.obj.sclust;
                res = remove_chain(vol, &mut self.obj, scl, 0);
            }
            self.obj.sclust = 0;
        } else {
            match vol.get_fat(&self.obj, self.clust) {
                Ok(ncl) if ncl != 0 && ncl < vol.n_fatent => {
                    let pcl = self.clust;
                    res = remove_chain(vol, &mut self.obj, ncl, pcl);
                }
                Ok(_) => {}
                Err(e) => res = Err(e),
            }
        }
        // The size follows the pointer even if the chain release failed
        self.obj.objsize = self.fptr;
        self.state.insert(FileState::MODIFIED);
        self.link_map = None;
        res?;
        self.flush_buf(vol)
    }

    /// Preallocate a contiguous run for an empty file
    ///
    /// With `allocate_now` the run is allocated and the file size set to
    /// `size`. Otherwise the run is only located and remembered as the
    /// starting point of the next allocation.
    pub fn expand(&mut self, size: u64, allocate_now: bool) -> FsResult<()> {
        self.with_vol(|f, vol| {
            if size == 0 || f.obj.objsize != 0 || !f.mode.contains(OpenMode::WRITE) {
                return Err(FsError::Denied);
            }
            if !vol.is_exfat() && size > 0xFFFF_FFFF {
                return Err(FsError::Denied);
            }
            f.expand_in(vol, size, allocate_now)
        })
    }

    fn expand_in(&mut self, vol: &mut FatVolume, size: u64, allocate_now: bool) -> FsResult<()> {
        let bcs = vol.cluster_bytes() as u64;
        let tcl = size.div_ceil(bcs) as u32;
        let stcl = match vol.last_clst {
            c if c < 2 || c >= vol.n_fatent => 2,
            c => c,
        };
        let scl;
        let lclst;

        if vol.is_exfat() {
            scl = vol.find_bitmap(stcl, tcl)?;
            if scl == 0 {
                return Err(FsError::Denied);
            }
            if allocate_now {
                vol.change_bitmap(scl, tcl, true)?;
                lclst = scl + tcl - 1;
            } else {
                lclst = scl - 1;
            }
        } else {
            let mut run_start = stcl;
            let mut clst = stcl;
            let mut ncl = 0;
            loop {
                let v = vol.get_fat(&self.obj, clst)?;
                clst += 1;
                if clst >= vol.n_fatent {
                    clst = 2;
                }
                if v == 0 {
                    ncl += 1;
                    if ncl == tcl {
                        break;
                    }
                } else {
                    run_start = clst;
                    ncl = 0;
                }
                if clst == stcl {
                    return Err(FsError::Denied);
                }
            }
            scl = run_start;
            if allocate_now {
                for n in 0..tcl {
                    let cl = scl + n;
                    vol.put_fat(cl, if n + 1 == tcl { 0xFFFF_FFFF } else { cl + 1 })?;
                }
                lclst = scl + tcl - 1;
            } else {
                lclst = scl - 1;
            }
        }

        vol.last_clst = lclst;
        if allocate_now {
            self.obj.sclust = scl;
            self.obj.objsize = size;
            if vol.is_exfat() {
                self.obj.stat = chain_status::CONTIGUOUS;
            }
            self.state.insert(FileState::MODIFIED);
            if vol.free_clst <= vol.n_fatent - 2 {
                vol.free_clst -= tcl;
                vol.fsi_flag |= 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mkfs::MkfsFormat;
    use crate::testutil::{format_ram, with_test_volume};

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn read_all(fs: &FatFs, path: &str) -> Vec<u8> {
        let mut f = fs.open(path, OpenMode::READ).unwrap();
        let mut out = vec![0u8; f.size() as usize];
        assert_eq!(f.read(&mut out).unwrap(), out.len());
        assert!(f.eof());
        f.close().unwrap();
        out
    }

    /// Write two files in alternating cluster-sized pieces so both chains fragment
    fn interleave(fs: &FatFs, a: &str, b: &str, csz: usize, rounds: usize) -> (Vec<u8>, Vec<u8>) {
        let da = pattern(csz * rounds, 1);
        let db = pattern(csz * rounds, 2);
        let mut fa = fs.open(a, OpenMode::WRITE | OpenMode::CREATE_ALWAYS).unwrap();
        let mut fb = fs.open(b, OpenMode::WRITE | OpenMode::CREATE_ALWAYS).unwrap();
        for i in 0..rounds {
            assert_eq!(fa.write(&da[i * csz..(i + 1) * csz]).unwrap(), csz);
            assert_eq!(fb.write(&db[i * csz..(i + 1) * csz]).unwrap(), csz);
        }
        fa.close().unwrap();
        fb.close().unwrap();
        (da, db)
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (fs, _disk) = format_ram(512, 16384, MkfsFormat::FAT, 512);
        let data = pattern(3000, 7);
        let mut f = fs.open("/data.bin", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
        // Unaligned head, direct middle, buffered tail
        assert_eq!(f.write(&data[..100]).unwrap(), 100);
        assert_eq!(f.write(&data[100..]).unwrap(), 2900);
        assert_eq!(f.tell(), 3000);
        f.close().unwrap();
        assert_eq!(read_all(&fs, "/data.bin"), data);

        let mut f = fs.open("/data.bin", OpenMode::READ).unwrap();
        f.seek(1500).unwrap();
        let mut part = [0u8; 10];
        assert_eq!(f.read(&mut part).unwrap(), 10);
        assert_eq!(&part[..], &data[1500..1510]);
        f.seek(5000).unwrap();
        assert_eq!(f.tell(), 3000);
        assert_eq!(f.read(&mut part).unwrap(), 0);
    }

    #[test]
    fn test_open_mode_rules() {
        let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 512);
        fs.open("/a.txt", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap().close().unwrap();
        assert_eq!(fs.open("/a.txt", OpenMode::WRITE | OpenMode::CREATE_NEW).err(), Some(FsError::Exist));
        assert_eq!(fs.open("/none.txt", OpenMode::READ).err(), Some(FsError::NoFile));
        assert_eq!(fs.open("/no/where.txt", OpenMode::READ).err(), Some(FsError::NoPath));
        fs.mkdir("/d").unwrap();
        assert_eq!(fs.open("/d", OpenMode::READ).err(), Some(FsError::NoFile));
        assert_eq!(fs.open("/d", OpenMode::WRITE | OpenMode::OPEN_ALWAYS).err(), Some(FsError::Denied));
        assert_eq!(fs.open("/", OpenMode::READ).err(), Some(FsError::InvalidName));

        fs.chmod("/a.txt", FileAttr::RDO, FileAttr::RDO).unwrap();
        assert_eq!(fs.open("/a.txt", OpenMode::WRITE).err(), Some(FsError::Denied));
        assert!(fs.open("/a.txt", OpenMode::READ).is_ok());

        let mut f = fs.open("/a.txt", OpenMode::READ).unwrap();
        assert_eq!(f.write(b"x"), Err(FsError::Denied));
        // A rejected call is not sticky
        assert_eq!(f.error(), None);
    }

    #[test]
    fn test_append_and_create_always() {
        let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 512);
        let mut f = fs.open("/log.txt", OpenMode::WRITE | OpenMode::CREATE_ALWAYS).unwrap();
        f.write(b"abc").unwrap();
        f.close().unwrap();
        let mut f = fs.open("/log.txt", OpenMode::WRITE | OpenMode::OPEN_APPEND).unwrap();
        assert_eq!(f.tell(), 3);
        f.write(b"def").unwrap();
        f.close().unwrap();
        assert_eq!(read_all(&fs, "/log.txt"), b"abcdef");

        let free = fs.getfree("/").unwrap();
        let f = fs.open("/log.txt", OpenMode::WRITE | OpenMode::CREATE_ALWAYS).unwrap();
        assert_eq!(f.size(), 0);
        f.close().unwrap();
        assert_eq!(fs.stat("/log.txt").unwrap().size, 0);
        assert_eq!(fs.getfree("/").unwrap(), free + 1);
    }

    #[test]
    fn test_create_always_releases_exfat_chain() {
        let (fs, _disk) = format_ram(512, 16384, MkfsFormat::EXFAT, 0);
        let data = pattern(10_000, 5);
        let mut f = fs.open("/big.bin", OpenMode::WRITE | OpenMode::CREATE_ALWAYS).unwrap();
        f.write(&data).unwrap();
        f.close().unwrap();

        let free = fs.getfree("/").unwrap();
        let f = fs.open("/big.bin", OpenMode::WRITE | OpenMode::CREATE_ALWAYS).unwrap();
        assert_eq!(f.size(), 0);
        f.close().unwrap();
        // 10000 bytes span three 4 KiB clusters
        assert_eq!(fs.getfree("/").unwrap(), free + 3);

        let mut f = fs.open("/big.bin", OpenMode::WRITE).unwrap();
        f.write(&data[..100]).unwrap();
        f.close().unwrap();
        assert_eq!(read_all(&fs, "/big.bin"), &data[..100]);
    }

    #[test]
    fn test_lock_rules() {
        let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 512);
        fs.open("/f", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap().close().unwrap();
        let r1 = fs.open("/f", OpenMode::READ).unwrap();
        let r2 = fs.open("/f", OpenMode::READ).unwrap();
        assert_eq!(fs.open("/f", OpenMode::WRITE).err(), Some(FsError::Locked));
        assert_eq!(fs.unlink("/f"), Err(FsError::Locked));
        drop(r1);
        r2.close().unwrap();
        let w = fs.open("/f", OpenMode::WRITE).unwrap();
        assert_eq!(fs.open("/f", OpenMode::READ).err(), Some(FsError::Locked));
        w.close().unwrap();
        fs.unlink("/f").unwrap();
    }

    #[test]
    fn test_short_write_when_full() {
        let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 512);
        let free = fs.getfree("/").unwrap() as usize;
        let data = pattern((free + 10) * 512, 3);
        let mut f = fs.open("/big", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
        let n = f.write(&data).unwrap();
        assert_eq!(n, free * 512);
        assert_eq!(f.error(), None);
        f.close().unwrap();
        assert_eq!(fs.getfree("/").unwrap(), 0);
        assert_eq!(fs.stat("/big").unwrap().size, n as u64);
    }

    #[test]
    fn test_error_is_sticky() {
        let (fs, disk) = format_ram(512, 2048, MkfsFormat::FAT, 512);
        let mut f = fs.open("/f", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
        disk.set_fail_io(true);
        assert_eq!(f.write(&[0u8; 1024]), Err(FsError::DiskErr));
        disk.set_fail_io(false);
        assert_eq!(f.error(), Some(FsError::DiskErr));
        assert_eq!(f.write(b"x"), Err(FsError::DiskErr));
        assert_eq!(f.close(), Err(FsError::DiskErr));
        // The lock slot was released anyway
        assert!(fs.open("/f", OpenMode::WRITE).is_ok());
    }

    #[test]
    fn test_seek_extends_and_truncate_frees() {
        let (fs, _disk) = format_ram(512, 16384, MkfsFormat::FAT, 512);
        let free = fs.getfree("/").unwrap();
        let mut f = fs.open("/sparse", OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
        f.seek(10_000).unwrap();
        assert_eq!(f.size(), 10_000);
        f.write(b"end").unwrap();
        f.sync().unwrap();
        assert_eq!(fs.stat("/sparse").unwrap().size, 10_003);
        assert_eq!(fs.getfree("/").unwrap(), free - 20);

        f.seek(100).unwrap();
        f.truncate().unwrap();
        assert_eq!(f.size(), 100);
        f.close().unwrap();
        assert_eq!(fs.getfree("/").unwrap(), free - 1);

        let mut f = fs.open("/sparse", OpenMode::WRITE).unwrap();
        f.truncate().unwrap();
        f.close().unwrap();
        assert_eq!(fs.getfree("/").unwrap(), free);
        assert_eq!(fs.stat("/sparse").unwrap().size, 0);
    }

    #[test]
    fn test_expand_preallocates() {
        let (fs, _disk) = format_ram(512, 16384, MkfsFormat::FAT, 512);
        let free = fs.getfree("/").unwrap();
        let mut f = fs.open("/pre", OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
        f.expand(4096, true).unwrap();
        assert_eq!(f.size(), 4096);
        assert_eq!(f.expand(4096, true), Err(FsError::Denied));
        f.write(&pattern(4096, 9)).unwrap();
        f.close().unwrap();
        assert_eq!(fs.getfree("/").unwrap(), free - 8);
        assert_eq!(read_all(&fs, "/pre"), pattern(4096, 9));
    }

    #[test]
    fn test_fast_seek_over_fragmented_chain() {
        let (fs, _disk) = format_ram(512, 16384, MkfsFormat::FAT, 512);
        let (da, _) = interleave(&fs, "/a", "/b", 512, 6);
        let mut f = fs.open("/a", OpenMode::READ).unwrap();
        assert_eq!(f.create_link_map().unwrap(), 6);
        let mut buf = [0u8; 700];
        for ofs in [2900u64, 10, 1700] {
            f.seek(ofs).unwrap();
            let n = f.read(&mut buf).unwrap();
            let o = ofs as usize;
            assert_eq!(&buf[..n], &da[o..(o + 700).min(da.len())]);
        }
        f.clear_link_map();
        f.seek(0).unwrap();
        let mut all = vec![0u8; da.len()];
        assert_eq!(f.read(&mut all).unwrap(), da.len());
        assert_eq!(all, da);
    }

    #[test]
    fn test_exfat_fragmented_files_read_back() {
        let (fs, _disk) = format_ram(512, 16384, MkfsFormat::EXFAT, 0);
        let csz = with_test_volume(&fs, |vol| Ok(vol.cluster_bytes() as usize));
        let (da, db) = interleave(&fs, "/a", "/b", csz, 3);
        assert_eq!(read_all(&fs, "/a"), da);
        assert_eq!(read_all(&fs, "/b"), db);

        // A single file written in one go stays contiguous
        let dc = pattern(csz * 3 + 17, 5);
        let mut f = fs.open("/c", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap();
        f.write(&dc).unwrap();
        assert_eq!(f.obj.stat, chain_status::CONTIGUOUS);
        f.close().unwrap();
        assert_eq!(read_all(&fs, "/c"), dc);

        let mut f = fs.open("/a", OpenMode::WRITE).unwrap();
        f.seek(csz as u64 + 3).unwrap();
        f.truncate().unwrap();
        f.close().unwrap();
        assert_eq!(read_all(&fs, "/a"), &da[..csz + 3]);
    }
}
