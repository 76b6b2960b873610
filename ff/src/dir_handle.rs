//! Directory handles
//!
//! [`Dir`] iterates the objects of one directory. Dot entries, deleted
//! entries and the volume label are skipped. `findfirst`/`findnext` filter
//! the listing with a `*`/`?` pattern matched against both the long and the
//! short name.

use alloc::vec::Vec;

use crate::dir::{dir_next, dir_read, dir_sdi, get_fileinfo, DirCursor, FileInfo};
use crate::error::{FsError, FsResult};
use crate::exfat::init_alloc_info;
use crate::flags::{FileAttr, NameFlags};
use crate::fs::FatFs;
use crate::layout::SZDIRE;
use crate::name::{match_chars, pattern_match};
use crate::path::follow_path;
use crate::volume::FatVolume;

/// An open directory
pub struct Dir<'a> {
    fs: &'a FatFs,
    drive: usize,
    dp: DirCursor,
    /// Upper-cased search pattern of `findfirst`
    pattern: Option<Vec<u32>>,
    open: bool,
}

impl FatFs {
    /// Open a directory for listing
    pub fn opendir(&self, path: &str) -> FsResult<Dir<'_>> {
        let (drive, rest) = self.resolve(path)?;
        let dp = self.with_drive(drive, false, |vol| open_dir_in(vol, rest))?;
        Ok(Dir { fs: self, drive, dp, pattern: None, open: true })
    }

    /// Open `path` and return the first entry matching `pattern`
    pub fn findfirst(&self, path: &str, pattern: &str) -> FsResult<(Dir<'_>, Option<FileInfo>)> {
        let mut dir = self.opendir(path)?;
        dir.pattern = Some(match_chars(pattern));
        let first = dir.findnext()?;
        Ok((dir, first))
    }
}

fn open_dir_in(vol: &mut FatVolume, path: &str) -> FsResult<DirCursor> {
    let mut dp = DirCursor::new(vol, vol.root_object());
    match follow_path(vol, &mut dp, path) {
        Err(FsError::NoFile) => return Err(FsError::NoPath),
        r => r?,
    }
    if !dp.flags().contains(NameFlags::NONAME) {
        if dp.obj.attr & FileAttr::DIR.bits() == 0 {
            return Err(FsError::NoPath);
        }
        if vol.is_exfat() {
            dp.obj.c_scl = dp.obj.sclust;
            dp.obj.c_size = (dp.obj.objsize as u32 & 0xFFFF_FF00) | dp.obj.stat as u32;
            dp.obj.c_ofs = dp.blk_ofs;
            init_alloc_info(&dp.xbuf, &mut dp.obj);
        } else {
            let ent = dp.ent;
            dp.obj.sclust = vol.ld_clust(&vol.win[ent..ent + SZDIRE]);
        }
    }
    dp.obj.id = vol.id;
    dir_sdi(vol, &mut dp, 0)?;
    if dp.obj.sclust != 0 {
        dp.obj.lockid = vol
            .locks
            .acquire(dp.obj.sclust, 0, false)
            .ok_or(FsError::TooManyOpenFiles)?;
    }
    Ok(dp)
}

impl<'a> Dir<'a> {
    fn with_vol<R>(&mut self, f: impl FnOnce(&mut DirCursor, &mut FatVolume) -> FsResult<R>) -> FsResult<R> {
        if !self.open {
            return Err(FsError::InvalidObject);
        }
        let fs = self.fs;
        let dp = &mut self.dp;
        fs.with_object(self.drive, dp.obj.id, |vol| f(dp, vol))
    }

    /// Next entry of the directory, `None` at the end
    pub fn read(&mut self) -> FsResult<Option<FileInfo>> {
        self.with_vol(read_entry)
    }

    /// Restart the listing from the first entry
    pub fn rewind(&mut self) -> FsResult<()> {
        self.with_vol(|dp, vol| dir_sdi(vol, dp, 0))
    }

    /// Next entry matching the `findfirst` pattern
    pub fn findnext(&mut self) -> FsResult<Option<FileInfo>> {
        let pat = self.pattern.clone().unwrap_or_default();
        loop {
            let info = match self.read()? {
                Some(i) => i,
                None => return Ok(None),
            };
            if pat.is_empty() {
                return Ok(Some(info));
            }
            let alt_hit = !info.alt_name.is_empty() && pattern_match(&pat, &match_chars(&info.alt_name));
            if alt_hit || pattern_match(&pat, &match_chars(&info.name)) {
                return Ok(Some(info));
            }
        }
    }

    pub fn close(mut self) -> FsResult<()> {
        self.close_in()
    }

    fn close_in(&mut self) -> FsResult<()> {
        if !self.open {
            return Ok(());
        }
        let lockid = self.dp.obj.lockid;
        let sclust = self.dp.obj.sclust;
        let res = self.with_vol(|_, vol| if sclust != 0 { vol.locks.release(lockid) } else { Ok(()) });
        self.open = false;
        res
    }
}

fn read_entry(dp: &mut DirCursor, vol: &mut FatVolume) -> FsResult<Option<FileInfo>> {
    match dir_read(vol, dp, false) {
        Ok(()) => {}
        Err(FsError::NoFile) => return Ok(None),
        Err(e) => return Err(e),
    }
    let info = get_fileinfo(vol, dp)?;
    match dir_next(vol, dp, false) {
        Ok(()) => {}
        Err(FsError::NoFile) => dp.sect = 0,
        Err(e) => return Err(e),
    }
    Ok(Some(info))
}

impl Drop for Dir<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close_in() {
            log::debug!("[FF] implicit closedir failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::OpenMode;
    use crate::mkfs::MkfsFormat;
    use crate::testutil::format_ram;
    use alloc::string::String;

    fn touch(fs: &FatFs, path: &str) {
        fs.open(path, OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap().close().unwrap();
    }

    fn names(dir: &mut Dir<'_>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(info) = dir.read().unwrap() {
            out.push(info.name);
        }
        out
    }

    #[test]
    fn test_list_skips_dots_and_deleted() {
        let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 512);
        fs.mkdir("/sub").unwrap();
        touch(&fs, "/sub/one.txt");
        touch(&fs, "/sub/A long file name.dat");
        touch(&fs, "/sub/gone.txt");
        fs.unlink("/sub/gone.txt").unwrap();

        let mut dir = fs.opendir("/sub").unwrap();
        assert_eq!(names(&mut dir), ["one.txt", "A long file name.dat"]);
        // End of directory stays at the end
        assert_eq!(dir.read().unwrap(), None);
        dir.rewind().unwrap();
        assert_eq!(dir.read().unwrap().map(|i| i.name).as_deref(), Some("one.txt"));
        dir.close().unwrap();

        assert_eq!(fs.opendir("/sub/one.txt").err(), Some(FsError::NoPath));
        assert_eq!(fs.opendir("/missing").err(), Some(FsError::NoPath));
    }

    #[test]
    fn test_root_listing_on_exfat() {
        let (fs, _disk) = format_ram(512, 16384, MkfsFormat::EXFAT, 0);
        fs.mkdir("/Dir").unwrap();
        touch(&fs, "/file.bin");
        let mut dir = fs.opendir("/").unwrap();
        let mut seen = Vec::new();
        while let Some(info) = dir.read().unwrap() {
            let is_dir = info.is_dir();
            seen.push((info.name, is_dir));
        }
        assert_eq!(seen, [(String::from("Dir"), true), (String::from("file.bin"), false)]);
    }

    #[test]
    fn test_findfirst_pattern() {
        let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 512);
        for n in ["a.txt", "b.log", "Report.TXT", "c.txt.bak"] {
            touch(&fs, &alloc::format!("/{}", n));
        }
        let (mut dir, first) = fs.findfirst("/", "*.txt").unwrap();
        let mut hits = Vec::new();
        let mut next = first;
        while let Some(info) = next {
            hits.push(info.name);
            next = dir.findnext().unwrap();
        }
        assert_eq!(hits, ["a.txt", "Report.TXT"]);

        let (_, none) = fs.findfirst("/", "z*").unwrap();
        assert!(none.is_none());
        let (_, one) = fs.findfirst("/", "?.log").unwrap();
        assert_eq!(one.map(|i| i.name).as_deref(), Some("b.log"));
    }

    #[test]
    fn test_open_directory_blocks_removal() {
        let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 512);
        fs.mkdir("/d").unwrap();
        let dir = fs.opendir("/d").unwrap();
        assert_eq!(fs.unlink("/d"), Err(FsError::Locked));
        drop(dir);
        fs.unlink("/d").unwrap();
    }

    #[test]
    fn test_handle_invalid_after_unmount() {
        let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 512);
        let mut dir = fs.opendir("/").unwrap();
        fs.unmount("0:").unwrap();
        assert_eq!(dir.read(), Err(FsError::InvalidObject));
    }
}
