//! exFAT directory entry blocks
//!
//! An exFAT object is described by a block of 3 to 19 consecutive entries:
//! the file entry, the stream extension and one or more name entries. The
//! block is loaded into the cursor's `xbuf`, edited there and written back
//! as a whole with a fresh set checksum.

use crate::codec::{ld_dword, ld_qword, ld_word, st_word};
use crate::config::max_dirb;
use crate::dir::{dir_next, dir_sdi, DirCursor};
use crate::error::{FsError, FsResult};
use crate::layout::*;
use crate::unicode::wtoupper;
use crate::volume::{FatVolume, ObjectId};

/// Checksum of an entry block (the checksum field itself is skipped)
pub(crate) fn xdir_sum(xb: &[u8]) -> u16 {
    let szblk = (xb[XDIR_NUM_SEC] as usize + 1) * SZDIRE;
    let mut sum = 0u16;
    for (i, &b) in xb[..szblk.min(xb.len())].iter().enumerate() {
        if i == XDIR_SET_SUM || i == XDIR_SET_SUM + 1 {
            continue;
        }
        sum = sum.rotate_right(1).wrapping_add(b as u16);
    }
    sum
}

/// Hash of an up-cased name, stored in the stream extension entry
pub(crate) fn xname_sum(name: &[u16]) -> u16 {
    let mut sum = 0u16;
    for &c in name.iter().take_while(|&&c| c != 0) {
        let c = wtoupper(c as u32) as u16;
        sum = sum.rotate_right(1).wrapping_add(c & 0xFF);
        sum = sum.rotate_right(1).wrapping_add(c >> 8);
    }
    sum
}

/// 32-bit rolling checksum used by the boot region and the up-case table
#[inline]
pub(crate) fn xsum32(dat: u8, sum: u32) -> u32 {
    sum.rotate_right(1).wrapping_add(dat as u32)
}

/// Load the entry block starting at the cursor into `dp.xbuf`
pub(crate) fn load_xdir(vol: &mut FatVolume, dp: &mut DirCursor) -> FsResult<()> {
    let cap = dp.xbuf.len();

    vol.move_window(dp.sect)?;
    if dp.entry(vol)[XDIR_TYPE] != xdir_type::FILE {
        return Err(FsError::IntErr);
    }
    let ent = dp.ent;
    dp.xbuf[..SZDIRE].copy_from_slice(&vol.win[ent..ent + SZDIRE]);
    let sz_ent = (dp.xbuf[XDIR_NUM_SEC] as usize + 1) * SZDIRE;
    if !(3 * SZDIRE..=19 * SZDIRE).contains(&sz_ent) {
        return Err(FsError::IntErr);
    }

    next_in_block(vol, dp)?;
    if dp.entry(vol)[XDIR_TYPE] != xdir_type::STREAM {
        return Err(FsError::IntErr);
    }
    let ent = dp.ent;
    dp.xbuf[SZDIRE..2 * SZDIRE].copy_from_slice(&vol.win[ent..ent + SZDIRE]);
    if max_dirb(dp.xbuf[XDIR_NUM_NAME] as usize) > sz_ent {
        return Err(FsError::IntErr);
    }

    let mut i = 2 * SZDIRE;
    while i < sz_ent {
        next_in_block(vol, dp)?;
        if dp.entry(vol)[XDIR_TYPE] != xdir_type::NAME {
            return Err(FsError::IntErr);
        }
        if i < cap {
            let ent = dp.ent;
            dp.xbuf[i..i + SZDIRE].copy_from_slice(&vol.win[ent..ent + SZDIRE]);
        }
        i += SZDIRE;
    }

    // Names longer than the buffer cannot be verified
    if i <= cap && xdir_sum(&dp.xbuf) != ld_word(&dp.xbuf, XDIR_SET_SUM) {
        log::warn!("[FF] entry block checksum mismatch at offset {}", dp.blk_ofs);
        return Err(FsError::IntErr);
    }
    Ok(())
}

fn next_in_block(vol: &mut FatVolume, dp: &mut DirCursor) -> FsResult<()> {
    match dir_next(vol, dp, false) {
        Err(FsError::NoFile) => Err(FsError::IntErr),
        r => r,
    }?;
    vol.move_window(dp.sect)
}

/// Write `dp.xbuf` back at `dp.blk_ofs` with an updated set checksum
pub(crate) fn store_xdir(vol: &mut FatVolume, dp: &mut DirCursor) -> FsResult<()> {
    let sum = xdir_sum(&dp.xbuf);
    st_word(&mut dp.xbuf, XDIR_SET_SUM, sum);
    let nent = dp.xbuf[XDIR_NUM_SEC] as usize + 1;

    let res = (|| {
        let first = dp.blk_ofs;
        dir_sdi(vol, dp, first)?;
        for n in 0..nent {
            vol.move_window(dp.sect)?;
            let src = &dp.xbuf[n * SZDIRE..(n + 1) * SZDIRE];
            vol.win[dp.ent..dp.ent + SZDIRE].copy_from_slice(src);
            vol.touch();
            if n + 1 < nent {
                dir_next(vol, dp, false)?;
            }
        }
        Ok(())
    })();
    match res {
        Err(FsError::DiskErr) => Err(FsError::DiskErr),
        Err(_) => Err(FsError::IntErr),
        ok => ok,
    }
}

/// Build a fresh entry block for `lfn` in `xb`
///
/// Only the type bytes, the name entries, the name length and the name hash
/// are set; the caller fills in attributes, times and allocation.
pub(crate) fn create_xdir(xb: &mut [u8], lfn: &[u16]) {
    xb[..2 * SZDIRE].fill(0);
    xb[XDIR_TYPE] = xdir_type::FILE;
    xb[SZDIRE + XDIR_TYPE] = xdir_type::STREAM;

    let mut i = 2 * SZDIRE;
    let mut nlen = 0usize;
    let mut nc1 = 0u8;
    let mut wc = 1u16;
    loop {
        xb[i] = xdir_type::NAME;
        xb[i + 1] = 0;
        i += 2;
        while i % SZDIRE != 0 {
            if wc != 0 {
                wc = lfn.get(nlen).copied().unwrap_or(0);
                if wc != 0 {
                    nlen += 1;
                }
            }
            st_word(xb, i, wc);
            i += 2;
        }
        nc1 += 1;
        if lfn.get(nlen).copied().unwrap_or(0) == 0 {
            break;
        }
    }

    xb[XDIR_NUM_NAME] = nlen as u8;
    xb[XDIR_NUM_SEC] = 1 + nc1;
    st_word(xb, XDIR_NAME_HASH, xname_sum(lfn));
}

/// Set the allocation fields of `obj` from a loaded entry block
pub(crate) fn init_alloc_info(xb: &[u8], obj: &mut ObjectId) {
    obj.sclust = ld_dword(xb, XDIR_FST_CLUS);
    obj.objsize = ld_qword(xb, XDIR_FILE_SIZE);
    obj.stat = xb[XDIR_GEN_FLAGS] & 2;
    obj.n_frag = 0;
}

/// Load the entry block of `obj` from its containing directory
pub(crate) fn load_obj_xdir(vol: &mut FatVolume, obj: &ObjectId) -> FsResult<DirCursor> {
    let parent = ObjectId {
        id: obj.id,
        sclust: obj.c_scl,
        stat: obj.c_size as u8,
        objsize: (obj.c_size & 0xFFFF_FF00) as u64,
        ..ObjectId::default()
    };
    let mut dj = DirCursor::new(vol, parent);
    dj.blk_ofs = obj.c_ofs;
    dir_sdi(vol, &mut dj, obj.c_ofs)?;
    load_xdir(vol, &mut dj)?;
    Ok(dj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    fn utf16(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    #[test]
    fn test_create_xdir_layout() {
        let mut xb = vec![0u8; max_dirb(255)];
        let name = utf16("Twenty-four characters.x");
        create_xdir(&mut xb, &name);
        assert_eq!(xb[XDIR_TYPE], xdir_type::FILE);
        assert_eq!(xb[SZDIRE + XDIR_TYPE], xdir_type::STREAM);
        assert_eq!(xb[XDIR_NUM_NAME] as usize, name.len());
        // 24 characters need two name entries
        assert_eq!(xb[XDIR_NUM_SEC], 3);
        assert_eq!(xb[2 * SZDIRE], xdir_type::NAME);
        assert_eq!(xb[3 * SZDIRE], xdir_type::NAME);
        assert_eq!(ld_word(&xb, 2 * SZDIRE + 2), 'T' as u16);
        assert_eq!(ld_word(&xb, XDIR_NAME_HASH), xname_sum(&name));
    }

    #[test]
    fn test_name_hash_ignores_case() {
        assert_eq!(xname_sum(&utf16("readme.txt")), xname_sum(&utf16("README.TXT")));
        assert_ne!(xname_sum(&utf16("readme.txt")), xname_sum(&utf16("readme.txu")));
    }

    #[test]
    fn test_set_checksum_skips_its_own_field() {
        let mut xb = vec![0u8; max_dirb(255)];
        create_xdir(&mut xb, &utf16("x"));
        let sum = xdir_sum(&xb);
        st_word(&mut xb, XDIR_SET_SUM, 0xBEEF);
        assert_eq!(xdir_sum(&xb), sum);
        xb[XDIR_ATTR] = 0x20;
        assert_ne!(xdir_sum(&xb), sum);
    }

    #[test]
    fn test_xsum32_rotates() {
        assert_eq!(xsum32(1, 0), 1);
        assert_eq!(xsum32(0, 1), 0x8000_0000);
    }
}
