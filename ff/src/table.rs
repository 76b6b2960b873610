//! Cluster tables
//!
//! Each FAT sub-type implements [`ClusterTable`]. The implementation is
//! selected once at mount time and stored in the volume, so the hot paths
//! of chain traversal never branch on the sub-type.
//!
//! # Entry values
//! - `0` - free cluster
//! - `1` - reserved, never valid in a chain
//! - `2..n_fatent` - next cluster
//! - `>= n_fatent` - end of chain (or bad cluster)

use crate::codec::{ld_dword, ld_word, st_dword, st_word};
use crate::error::{FsError, FsResult};
use crate::volume::{chain_status, FatType, FatVolume, ObjectId};

/// Sub-type specific access to the cluster table
pub(crate) trait ClusterTable: Sync {
    /// Raw table entry of `clst` (range checked by the caller)
    fn get_next(&self, vol: &mut FatVolume, obj: &ObjectId, clst: u32) -> FsResult<u32>;

    /// Store a raw table entry (range checked by the caller)
    fn set_next(&self, vol: &mut FatVolume, clst: u32, val: u32) -> FsResult<()>;

    /// Claim a free cluster to follow `clst` (0 for a new chain), searching
    /// from `scl`. Returns 0 when the volume is full.
    fn allocate(&self, vol: &mut FatVolume, obj: &mut ObjectId, clst: u32, scl: u32) -> FsResult<u32> {
        let _ = obj;
        let mut scl = scl;
        let mut ncl = 0;
        if scl == clst {
            // Try the cluster right after the chain end first
            ncl = scl + 1;
            if ncl >= vol.n_fatent {
                ncl = 2;
            }
            let cs = vol.get_fat(&ObjectId::default(), ncl)?;
            if cs != 0 {
                let hint = vol.last_clst;
                if hint >= 2 && hint < vol.n_fatent {
                    scl = hint;
                }
                ncl = 0;
            }
        }
        if ncl == 0 {
            ncl = scl;
            loop {
                ncl += 1;
                if ncl >= vol.n_fatent {
                    ncl = 2;
                    if ncl > scl {
                        return Ok(0);
                    }
                }
                let cs = vol.get_fat(&ObjectId::default(), ncl)?;
                if cs == 0 {
                    break;
                }
                if ncl == scl {
                    return Ok(0);
                }
            }
        }
        vol.put_fat(ncl, 0xFFFF_FFFF)?;
        if clst != 0 {
            vol.put_fat(clst, ncl)?;
        }
        Ok(ncl)
    }

    /// Release the contiguous run `scl..=ecl`
    fn free_range(&self, vol: &mut FatVolume, scl: u32, ecl: u32) -> FsResult<()> {
        for cl in scl..=ecl {
            vol.put_fat(cl, 0)?;
        }
        Ok(())
    }
}

// ============================================================================
// FAT12
// ============================================================================

pub(crate) struct Fat12Table;

impl ClusterTable for Fat12Table {
    fn get_next(&self, vol: &mut FatVolume, _obj: &ObjectId, clst: u32) -> FsResult<u32> {
        let ss = vol.ssize;
        let mut bc = clst + clst / 2;
        vol.move_window(vol.fatbase + (bc / ss) as u64)?;
        let mut wc = vol.win[(bc % ss) as usize] as u32;
        bc += 1;
        vol.move_window(vol.fatbase + (bc / ss) as u64)?;
        wc |= (vol.win[(bc % ss) as usize] as u32) << 8;
        Ok(if clst & 1 != 0 { wc >> 4 } else { wc & 0xFFF })
    }

    fn set_next(&self, vol: &mut FatVolume, clst: u32, val: u32) -> FsResult<()> {
        let ss = vol.ssize;
        let mut bc = clst + clst / 2;
        vol.move_window(vol.fatbase + (bc / ss) as u64)?;
        let i = (bc % ss) as usize;
        vol.win[i] = if clst & 1 != 0 {
            (vol.win[i] & 0x0F) | ((val as u8) << 4)
        } else {
            val as u8
        };
        vol.touch();
        bc += 1;
        vol.move_window(vol.fatbase + (bc / ss) as u64)?;
        let i = (bc % ss) as usize;
        vol.win[i] = if clst & 1 != 0 {
            (val >> 4) as u8
        } else {
            (vol.win[i] & 0xF0) | ((val >> 8) as u8 & 0x0F)
        };
        vol.touch();
        Ok(())
    }
}

// ============================================================================
// FAT16
// ============================================================================

pub(crate) struct Fat16Table;

impl ClusterTable for Fat16Table {
    fn get_next(&self, vol: &mut FatVolume, _obj: &ObjectId, clst: u32) -> FsResult<u32> {
        let ss = vol.ssize;
        vol.move_window(vol.fatbase + (clst / (ss / 2)) as u64)?;
        Ok(ld_word(&vol.win, (clst * 2 % ss) as usize) as u32)
    }

    fn set_next(&self, vol: &mut FatVolume, clst: u32, val: u32) -> FsResult<()> {
        let ss = vol.ssize;
        vol.move_window(vol.fatbase + (clst / (ss / 2)) as u64)?;
        st_word(&mut vol.win, (clst * 2 % ss) as usize, val as u16);
        vol.touch();
        Ok(())
    }
}

// ============================================================================
// FAT32
// ============================================================================

pub(crate) struct Fat32Table;

impl ClusterTable for Fat32Table {
    fn get_next(&self, vol: &mut FatVolume, _obj: &ObjectId, clst: u32) -> FsResult<u32> {
        let ss = vol.ssize;
        vol.move_window(vol.fatbase + (clst / (ss / 4)) as u64)?;
        Ok(ld_dword(&vol.win, (clst * 4 % ss) as usize) & 0x0FFF_FFFF)
    }

    fn set_next(&self, vol: &mut FatVolume, clst: u32, val: u32) -> FsResult<()> {
        let ss = vol.ssize;
        vol.move_window(vol.fatbase + (clst / (ss / 4)) as u64)?;
        let ofs = (clst * 4 % ss) as usize;
        // The upper 4 bits are reserved and preserved
        let val = (val & 0x0FFF_FFFF) | (ld_dword(&vol.win, ofs) & 0xF000_0000);
        st_dword(&mut vol.win, ofs, val);
        vol.touch();
        Ok(())
    }
}

// ============================================================================
// exFAT
// ============================================================================

pub(crate) struct ExFatTable;

impl ClusterTable for ExFatTable {
    fn get_next(&self, vol: &mut FatVolume, obj: &ObjectId, clst: u32) -> FsResult<u32> {
        // Every object except the root directory must have a valid size
        if (obj.objsize != 0 && obj.sclust != 0) || obj.stat == chain_status::FAT {
            let cofs = clst.wrapping_sub(obj.sclust);
            let clen = (obj.objsize.wrapping_sub(1) / vol.ssize as u64 / vol.csize as u64) as u32;
            if obj.stat == chain_status::CONTIGUOUS && cofs <= clen {
                return Ok(if cofs == clen { 0x7FFF_FFFF } else { clst + 1 });
            }
            if obj.stat == chain_status::FRAGMENTED && cofs < obj.n_cont {
                return Ok(clst + 1);
            }
            if obj.stat != chain_status::CONTIGUOUS {
                if obj.n_frag != 0 {
                    // On the growing edge, not yet written to the FAT
                    return Ok(0x7FFF_FFFF);
                }
                let ss = vol.ssize;
                vol.move_window(vol.fatbase + (clst / (ss / 4)) as u64)?;
                return Ok(ld_dword(&vol.win, (clst * 4 % ss) as usize) & 0x7FFF_FFFF);
            }
        }
        Ok(1)
    }

    fn set_next(&self, vol: &mut FatVolume, clst: u32, val: u32) -> FsResult<()> {
        let ss = vol.ssize;
        vol.move_window(vol.fatbase + (clst / (ss / 4)) as u64)?;
        st_dword(&mut vol.win, (clst * 4 % ss) as usize, val);
        vol.touch();
        Ok(())
    }

    fn allocate(&self, vol: &mut FatVolume, obj: &mut ObjectId, clst: u32, scl: u32) -> FsResult<u32> {
        let ncl = vol.find_bitmap(scl, 1)?;
        if ncl == 0 {
            return Ok(0);
        }
        vol.change_bitmap(ncl, 1, true)?;
        if clst == 0 {
            obj.stat = chain_status::CONTIGUOUS;
        } else if obj.stat == chain_status::CONTIGUOUS && ncl != scl + 1 {
            // The chain got fragmented
            obj.n_cont = scl - obj.sclust;
            obj.stat = chain_status::FRAGMENTED;
        }
        if obj.stat != chain_status::CONTIGUOUS {
            if ncl == clst + 1 {
                obj.n_frag = if obj.n_frag != 0 { obj.n_frag + 1 } else { 2 };
            } else {
                if obj.n_frag == 0 {
                    obj.n_frag = 1;
                }
                crate::chain::fill_last_frag(vol, obj, clst, ncl)?;
                obj.n_frag = 1;
            }
        }
        Ok(ncl)
    }

    fn free_range(&self, vol: &mut FatVolume, scl: u32, ecl: u32) -> FsResult<()> {
        vol.change_bitmap(scl, ecl - scl + 1, false)
    }
}

pub(crate) static FAT12_TABLE: Fat12Table = Fat12Table;
pub(crate) static FAT16_TABLE: Fat16Table = Fat16Table;
pub(crate) static FAT32_TABLE: Fat32Table = Fat32Table;
pub(crate) static EXFAT_TABLE: ExFatTable = ExFatTable;

/// Cluster table implementation for a sub-type
pub(crate) fn table_for(fs_type: FatType) -> &'static dyn ClusterTable {
    match fs_type {
        FatType::Fat12 => &FAT12_TABLE,
        FatType::Fat16 => &FAT16_TABLE,
        FatType::Fat32 => &FAT32_TABLE,
        FatType::ExFat => &EXFAT_TABLE,
    }
}

// ============================================================================
// Range-checked access
// ============================================================================

impl FatVolume {
    /// Successor of `clst` in the chain of `obj`
    ///
    /// Returns 0 for a free cluster and a value `>= n_fatent` at the end of
    /// the chain. Out of range clusters and the reserved value 1 are
    /// reported as `IntErr`.
    pub(crate) fn get_fat(&mut self, obj: &ObjectId, clst: u32) -> FsResult<u32> {
        if clst < 2 || clst >= self.n_fatent {
            return Err(FsError::IntErr);
        }
        let table = self.table;
        match table.get_next(self, obj, clst)? {
            1 => {
                log::error!("[FF] cluster {} has a reserved FAT entry", clst);
                Err(FsError::IntErr)
            }
            v => Ok(v),
        }
    }

    /// Store the table entry of `clst`
    pub(crate) fn put_fat(&mut self, clst: u32, val: u32) -> FsResult<()> {
        if clst < 2 || clst >= self.n_fatent {
            return Err(FsError::IntErr);
        }
        let table = self.table;
        table.set_next(self, clst, val)
    }

    // ========================================================================
    // exFAT allocation bitmap
    // ========================================================================

    /// Find a run of `ncl` free clusters, scanning circularly from `clst`
    ///
    /// Returns the first cluster of the run or 0 if there is none.
    pub(crate) fn find_bitmap(&mut self, clst: u32, ncl: u32) -> FsResult<u32> {
        let ss = self.ssize;
        let mut clst = clst.wrapping_sub(2);
        if clst >= self.n_fatent - 2 {
            clst = 0;
        }
        let mut scl = clst;
        let mut val = clst;
        let mut ctr = 0u32;
        loop {
            self.move_window(self.bitbase + (val / 8 / ss) as u64)?;
            let mut i = val / 8 % ss;
            let mut bm: u8 = 1 << (val % 8);
            loop {
                loop {
                    let bv = self.win[i as usize] & bm;
                    bm <<= 1;
                    val += 1;
                    if val >= self.n_fatent - 2 {
                        val = 0;
                        bm = 0;
                        i = ss;
                    }
                    if bv == 0 {
                        ctr += 1;
                        if ctr == ncl {
                            return Ok(scl + 2);
                        }
                    } else {
                        scl = val;
                        ctr = 0;
                    }
                    if val == clst {
                        return Ok(0);
                    }
                    if bm == 0 {
                        break;
                    }
                }
                bm = 1;
                i += 1;
                if i >= ss {
                    break;
                }
            }
        }
    }

    /// Set (`bv` true) or clear `ncl` bits starting at cluster `clst`
    ///
    /// A bit that already holds the target value is an `IntErr`.
    pub(crate) fn change_bitmap(&mut self, clst: u32, ncl: u32, bv: bool) -> FsResult<()> {
        let ss = self.ssize;
        let clst = clst - 2;
        let mut sect = self.bitbase + (clst / 8 / ss) as u64;
        let mut i = clst / 8 % ss;
        let mut bm: u8 = 1 << (clst % 8);
        let mut ncl = ncl;
        loop {
            self.move_window(sect)?;
            sect += 1;
            loop {
                loop {
                    if bv == (self.win[i as usize] & bm != 0) {
                        log::error!("[FF] allocation bitmap out of sync at cluster {}", clst + 2);
                        return Err(FsError::IntErr);
                    }
                    self.win[i as usize] ^= bm;
                    self.touch();
                    ncl -= 1;
                    if ncl == 0 {
                        return Ok(());
                    }
                    bm <<= 1;
                    if bm == 0 {
                        break;
                    }
                }
                bm = 1;
                i += 1;
                if i >= ss {
                    break;
                }
            }
            i = 0;
        }
    }
}
