//! Long file name entries
//!
//! An LFN entry carries 13 UTF-16 code units at fixed offsets. A name is
//! stored as a run of LFN entries in reverse order followed by the short
//! entry; every LFN entry holds the checksum of that short name.
//!
//! # Entry Layout
//! - Byte 0: ordinal (bit 6 marks the last entry of the run)
//! - Bytes 1-10, 14-25, 28-31: name characters
//! - Byte 11: attribute (always 0x0F)
//! - Byte 13: short name checksum
//! - Bytes 26-27: first cluster (always 0)

use crate::codec::{ld_word, st_word};
use crate::flags::AM_LFN;
use crate::layout::{LDIR_ATTR, LDIR_CHKSUM, LDIR_FST_CLUS_LO, LDIR_ORD, LDIR_TYPE, LLEF};
use crate::unicode::wtoupper;

/// Characters per LFN entry
pub const LFN_CHARS_PER_ENTRY: usize = 13;

/// Offsets of the name characters in an LFN entry
const LFN_OFS: [usize; LFN_CHARS_PER_ENTRY] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

#[inline]
fn unit_at(buf: &[u16], i: usize) -> u16 {
    buf.get(i).copied().unwrap_or(0)
}

/// Compare the part of `lfn` covered by this entry, ignoring case
pub(crate) fn cmp_lfn(lfn: &[u16], ent: &[u8], max_lfn: usize) -> bool {
    if ld_word(ent, LDIR_FST_CLUS_LO) != 0 {
        return false;
    }
    let mut i = ((ent[LDIR_ORD] & 0x3F) as usize).wrapping_sub(1).wrapping_mul(LFN_CHARS_PER_ENTRY);
    let mut wc = 1u16;
    for &ofs in LFN_OFS.iter() {
        let uc = ld_word(ent, ofs);
        if wc != 0 {
            if i >= max_lfn + 1 || wtoupper(uc as u32) != wtoupper(unit_at(lfn, i) as u32) {
                return false;
            }
            i += 1;
            wc = uc;
        } else if uc != 0xFFFF {
            return false;
        }
    }
    // Last entry matched but the name is longer
    !(ent[LDIR_ORD] & LLEF != 0 && wc != 0 && unit_at(lfn, i) != 0)
}

/// Copy the characters of this entry into a NUL terminated LFN buffer
pub(crate) fn pick_lfn(lfnbuf: &mut [u16], ent: &[u8]) -> bool {
    if ld_word(ent, LDIR_FST_CLUS_LO) != 0 {
        return false;
    }
    let cap = lfnbuf.len();
    let mut i = ((ent[LDIR_ORD] & !LLEF) as usize).wrapping_sub(1).wrapping_mul(LFN_CHARS_PER_ENTRY);
    let mut wc = 1u16;
    for &ofs in LFN_OFS.iter() {
        let uc = ld_word(ent, ofs);
        if wc != 0 {
            if i >= cap {
                return false;
            }
            lfnbuf[i] = uc;
            wc = uc;
            i += 1;
        } else if uc != 0xFFFF {
            return false;
        }
    }
    if ent[LDIR_ORD] & LLEF != 0 && wc != 0 {
        if i >= cap {
            return false;
        }
        lfnbuf[i] = 0;
    }
    true
}

/// Fill an LFN entry with part `ord` (1-based) of `lfn`
pub(crate) fn put_lfn(lfn: &[u16], ent: &mut [u8], ord: u8, sum: u8) {
    ent[LDIR_CHKSUM] = sum;
    ent[LDIR_ATTR] = AM_LFN;
    ent[LDIR_TYPE] = 0;
    st_word(ent, LDIR_FST_CLUS_LO, 0);

    let mut i = (ord as usize - 1) * LFN_CHARS_PER_ENTRY;
    let mut wc = 0u16;
    for &ofs in LFN_OFS.iter() {
        if wc != 0xFFFF {
            wc = unit_at(lfn, i);
            i += 1;
        }
        st_word(ent, ofs, wc);
        if wc == 0 {
            wc = 0xFFFF;
        }
    }
    let mut ord = ord;
    if wc == 0xFFFF || unit_at(lfn, i) == 0 {
        ord |= LLEF;
    }
    ent[LDIR_ORD] = ord;
}

/// Number of LFN entries needed for a name of `len` code units
pub(crate) fn lfn_entries(len: usize) -> usize {
    (len + LFN_CHARS_PER_ENTRY - 1) / LFN_CHARS_PER_ENTRY
}
