//! Path resolution
//!
//! A path is an optional drive prefix (`"N:"`) followed by segments
//! separated by `/` or `\`. Paths without a leading separator start at the
//! current directory of the volume when relative paths are enabled.

use alloc::string::String;

use crate::codec::ld_qword;
use crate::dir::{dir_find, dir_sdi, DirCursor};
use crate::error::{FsError, FsResult};
use crate::exfat::{init_alloc_info, load_obj_xdir};
use crate::flags::{FileAttr, NameFlags};
use crate::fs::normalize_path;
use crate::layout::{SZDIRE, XDIR_FILE_SIZE, XDIR_GEN_FLAGS};
use crate::name::{create_name, is_separator};
use crate::volume::FatVolume;

/// Split a drive prefix off `path`
///
/// Returns `None` for the drive when the path has no prefix. A prefix that
/// is not a decimal number is an `InvalidDrive`.
pub(crate) fn split_drive(path: &str) -> FsResult<(Option<usize>, &str)> {
    let head_len = path
        .char_indices()
        .find(|&(_, c)| (c as u32) < 0x20 || c == ':')
        .map(|(i, _)| i);
    match head_len {
        Some(i) if path.as_bytes()[i] == b':' => {
            let num = &path[..i];
            if num.is_empty() || !num.bytes().all(|b| b.is_ascii_digit()) {
                return Err(FsError::InvalidDrive);
            }
            let drv = num.parse::<usize>().map_err(|_| FsError::InvalidDrive)?;
            Ok((Some(drv), &path[i + 1..]))
        }
        _ => Ok((None, path)),
    }
}

/// Walk `path` from the root or the current directory
///
/// On success the cursor points at the entry of the last segment and the
/// name flags tell whether it was `NONAME` (the origin directory itself).
/// A missing intermediate segment is `NoPath`, a missing last one `NoFile`
/// with the cursor still valid for registering it.
pub(crate) fn follow_path(vol: &mut FatVolume, dp: &mut DirCursor, path: &str) -> FsResult<()> {
    if vol.is_exfat() && path.split(is_separator).any(|s| s == "..") {
        // exFAT directories carry no dot entries: fold `..` against the
        // tracked current directory and walk from the root
        let base = if vol.cfg.relative_paths { vol.cwd.clone() } else { String::from("/") };
        let abs = normalize_path(&base, path);
        return follow_path(vol, dp, &abs);
    }

    let mut path = path;
    if !path.starts_with(is_separator) && vol.cfg.relative_paths {
        dp.obj.sclust = vol.cdir;
    } else {
        path = path.trim_start_matches(is_separator);
        dp.obj.sclust = 0;
    }

    dp.obj.n_frag = 0;
    if vol.is_exfat() && dp.obj.sclust != 0 {
        // Restore the allocation state of the current directory
        dp.obj.c_scl = vol.cdc_scl;
        dp.obj.c_size = vol.cdc_size;
        dp.obj.c_ofs = vol.cdc_ofs;
        let dj = load_obj_xdir(vol, &dp.obj)?;
        dp.obj.objsize = ld_qword(&dj.xbuf, XDIR_FILE_SIZE);
        dp.obj.stat = dj.xbuf[XDIR_GEN_FLAGS] & 2;
    }

    if path.chars().next().map_or(true, |c| (c as u32) < 0x20) {
        dp.name.set_flags(NameFlags::NONAME);
        return dir_sdi(vol, dp, 0);
    }

    loop {
        path = create_name(&mut dp.name, path, &vol.cfg)?;
        let found = dir_find(vol, dp);
        let ns = dp.flags();
        match found {
            Ok(()) => {}
            Err(FsError::NoFile) if vol.cfg.relative_paths && ns.contains(NameFlags::DOT) => {
                // Dot entries are absent in the root directory (and on exFAT)
                if !ns.contains(NameFlags::LAST) {
                    continue;
                }
                dp.name.set_flags(NameFlags::NONAME);
                return Ok(());
            }
            Err(FsError::NoFile) if !ns.contains(NameFlags::LAST) => return Err(FsError::NoPath),
            Err(e) => return Err(e),
        }
        if ns.contains(NameFlags::LAST) {
            return Ok(());
        }
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_drive() {
        assert_eq!(split_drive("1:/a/b"), Ok((Some(1), "/a/b")));
        assert_eq!(split_drive("12:x"), Ok((Some(12), "x")));
        assert_eq!(split_drive("/a/b"), Ok((None, "/a/b")));
        assert_eq!(split_drive("file.txt"), Ok((None, "file.txt")));
        assert_eq!(split_drive(""), Ok((None, "")));
    }

    #[test]
    fn test_bad_drive_prefix() {
        assert_eq!(split_drive("a:/x"), Err(FsError::InvalidDrive));
        assert_eq!(split_drive(":/x"), Err(FsError::InvalidDrive));
        assert_eq!(split_drive("dir/1:"), Err(FsError::InvalidDrive));
    }
}
