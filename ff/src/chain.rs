//! Cluster chain allocation and release

use crate::block::IoctlCmd;
use crate::error::{FsError, FsResult};
use crate::volume::{chain_status, FatType, FatVolume, ObjectId};

/// Stretch the chain of `obj` after `clst`, or create a new chain when `clst` is 0
///
/// Returns the new cluster, the existing successor if `clst` is not the end
/// of its chain, or 0 when the volume is full.
pub(crate) fn create_chain(vol: &mut FatVolume, obj: &mut ObjectId, clst: u32) -> FsResult<u32> {
    let scl = if clst == 0 {
        match vol.last_clst {
            c if c == 0 || c >= vol.n_fatent => 1,
            c => c,
        }
    } else {
        let cs = vol.get_fat(obj, clst)?;
        if cs < 2 {
            return Err(FsError::IntErr);
        }
        if cs < vol.n_fatent {
            return Ok(cs);
        }
        clst
    };
    if vol.free_clst == 0 {
        return Ok(0);
    }

    let table = vol.table;
    let ncl = table.allocate(vol, obj, clst, scl)?;
    if ncl == 0 {
        log::debug!("[FF] no free cluster (search from {})", scl);
        return Ok(0);
    }

    vol.last_clst = ncl;
    if vol.free_clst <= vol.n_fatent - 2 {
        vol.free_clst -= 1;
    }
    vol.fsi_flag |= 1;
    Ok(ncl)
}

/// Free the chain starting at `clst`
///
/// If `pclst` is not 0 it is the predecessor of `clst` and becomes the new
/// end of the chain. Clusters freed before a failure stay freed.
pub(crate) fn remove_chain(vol: &mut FatVolume, obj: &mut ObjectId, clst: u32, pclst: u32) -> FsResult<()> {
    if clst < 2 || clst >= vol.n_fatent {
        return Err(FsError::IntErr);
    }
    let exfat = vol.fs_type == FatType::ExFat;

    if pclst != 0 && (!exfat || obj.stat != chain_status::CONTIGUOUS) {
        vol.put_fat(pclst, 0xFFFF_FFFF)?;
    }

    let table = vol.table;
    let mut clst = clst;
    let mut scl = clst;
    let mut ecl = clst;
    loop {
        let nxt = vol.get_fat(obj, clst)?;
        if nxt == 0 {
            // Broken chain: release what has been walked so far
            if clst > scl {
                release_run(vol, table, scl, clst - 1)?;
            }
            break;
        }
        if vol.free_clst < vol.n_fatent - 2 {
            vol.free_clst += 1;
            vol.fsi_flag |= 1;
        }
        if ecl + 1 == nxt {
            ecl = nxt;
        } else {
            release_run(vol, table, scl, ecl)?;
            scl = nxt;
            ecl = nxt;
        }
        clst = nxt;
        if clst >= vol.n_fatent {
            break;
        }
    }

    if exfat {
        if pclst == 0 {
            obj.stat = chain_status::FAT;
        } else if obj.stat == chain_status::FAT {
            // Check whether the remaining chain became contiguous
            let mut c = obj.sclust;
            while c != pclst {
                let nxt = vol.get_fat(obj, c)?;
                if nxt < 2 {
                    return Err(FsError::IntErr);
                }
                if nxt != c + 1 {
                    break;
                }
                c += 1;
            }
            if c == pclst {
                obj.stat = chain_status::CONTIGUOUS;
            }
        } else if obj.stat == chain_status::FRAGMENTED
            && pclst >= obj.sclust
            && pclst <= obj.sclust + obj.n_cont
        {
            obj.stat = chain_status::CONTIGUOUS;
        }
    }
    Ok(())
}

/// Release one contiguous run and tell the device about it
fn release_run(
    vol: &mut FatVolume,
    table: &'static dyn crate::table::ClusterTable,
    scl: u32,
    ecl: u32,
) -> FsResult<()> {
    table.free_range(vol, scl, ecl)?;
    if vol.cfg.use_trim {
        let start = vol.clst2sect(scl);
        let end = vol.clst2sect(ecl) + vol.csize as u64 - 1;
        // Trim is a hint; devices without support simply refuse it
        let _ = vol.disk_ioctl(IoctlCmd::Trim { start, end });
    }
    Ok(())
}

/// Write the first fragment of a chain fragmented in this session to the FAT
pub(crate) fn fill_first_frag(vol: &mut FatVolume, obj: &mut ObjectId) -> FsResult<()> {
    if obj.stat == chain_status::FRAGMENTED {
        let mut cl = obj.sclust;
        for _ in 0..obj.n_cont {
            vol.put_fat(cl, cl + 1)?;
            cl += 1;
        }
        obj.stat = chain_status::FAT;
    }
    Ok(())
}

/// Write the last fragment ending at `lcl` to the FAT and link it to `term`
pub(crate) fn fill_last_frag(vol: &mut FatVolume, obj: &mut ObjectId, lcl: u32, term: u32) -> FsResult<()> {
    while obj.n_frag > 0 {
        let cl = lcl - obj.n_frag + 1;
        let next = if obj.n_frag > 1 { lcl - obj.n_frag + 2 } else { term };
        vol.put_fat(cl, next)?;
        obj.n_frag -= 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{format_ram, with_test_volume};
    use crate::mkfs::MkfsFormat;

    #[test]
    fn test_create_and_remove_fat16_chain() {
        let (fs, _disk) = format_ram(512, 16384, MkfsFormat::FAT, 512);
        with_test_volume(&fs, |vol| {
            assert_eq!(vol.fs_type, FatType::Fat16);
            let free0 = crate::ops::count_free_clusters(vol)?;
            let mut obj = ObjectId::default();
            let c1 = create_chain(vol, &mut obj, 0)?;
            obj.sclust = c1;
            let c2 = create_chain(vol, &mut obj, c1)?;
            let c3 = create_chain(vol, &mut obj, c2)?;
            assert_eq!(c2, c1 + 1);
            assert_eq!(c3, c2 + 1);
            assert_eq!(vol.get_fat(&obj, c1)?, c2);
            assert!(vol.get_fat(&obj, c3)? >= vol.n_fatent);
            // Stretching from a cluster that already has a successor returns it
            assert_eq!(create_chain(vol, &mut obj, c1)?, c2);
            assert_eq!(vol.free_clst, free0 - 3);

            remove_chain(vol, &mut obj, c2, c1)?;
            assert!(vol.get_fat(&obj, c1)? >= vol.n_fatent);
            assert_eq!(vol.get_fat(&obj, c2)?, 0);
            assert_eq!(vol.get_fat(&obj, c3)?, 0);
            assert_eq!(vol.free_clst, free0 - 1);
            Ok(())
        });
    }

    #[test]
    fn test_fat12_nibble_packing() {
        let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 0);
        with_test_volume(&fs, |vol| {
            assert_eq!(vol.fs_type, FatType::Fat12);
            let obj = ObjectId::default();
            vol.put_fat(5, 0xABC)?;
            vol.put_fat(6, 0x123)?;
            assert_eq!(vol.get_fat(&obj, 5)?, 0xABC);
            assert_eq!(vol.get_fat(&obj, 6)?, 0x123);
            vol.put_fat(5, 0)?;
            assert_eq!(vol.get_fat(&obj, 6)?, 0x123);
            vol.put_fat(6, 0)?;
            Ok(())
        });
    }

    #[test]
    fn test_out_of_range_cluster_is_internal_error() {
        let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 0);
        with_test_volume(&fs, |vol| {
            let obj = ObjectId::default();
            assert_eq!(vol.get_fat(&obj, 1), Err(FsError::IntErr));
            assert_eq!(vol.get_fat(&obj, vol.n_fatent), Err(FsError::IntErr));
            assert_eq!(vol.put_fat(0, 5), Err(FsError::IntErr));
            Ok(())
        });
    }

    #[test]
    fn test_exfat_contiguous_then_fragmented() {
        let (fs, _disk) = format_ram(512, 16384, MkfsFormat::EXFAT, 0);
        with_test_volume(&fs, |vol| {
            assert_eq!(vol.fs_type, FatType::ExFat);
            let csz = vol.cluster_bytes() as u64;
            let mut obj = ObjectId::default();
            let c1 = create_chain(vol, &mut obj, 0)?;
            obj.sclust = c1;
            obj.objsize = csz;
            assert_eq!(obj.stat, chain_status::CONTIGUOUS);
            let c2 = create_chain(vol, &mut obj, c1)?;
            obj.objsize += csz;
            assert_eq!(c2, c1 + 1);
            assert_eq!(obj.stat, chain_status::CONTIGUOUS);
            // Contiguous chains are synthesized without FAT reads
            assert_eq!(vol.get_fat(&obj, c1)?, c2);

            // Occupy the next cluster so the chain has to jump
            let mut other = ObjectId::default();
            let blocker = create_chain(vol, &mut other, 0)?;
            assert_eq!(blocker, c2 + 1);
            let c3 = create_chain(vol, &mut obj, c2)?;
            obj.objsize += csz;
            assert_ne!(c3, c2 + 1);
            assert_eq!(obj.stat, chain_status::FRAGMENTED);
            assert_eq!(obj.n_cont, c2 - c1);

            fill_first_frag(vol, &mut obj)?;
            fill_last_frag(vol, &mut obj, c3, 0xFFFF_FFFF)?;
            assert_eq!(obj.stat, chain_status::FAT);
            assert_eq!(vol.get_fat(&obj, c1)?, c2);
            assert_eq!(vol.get_fat(&obj, c2)?, c3);

            let free = crate::ops::count_free_clusters(vol)?;
            remove_chain(vol, &mut obj, c1, 0)?;
            assert_eq!(vol.free_clst, free + 3);
            assert_eq!(vol.find_bitmap(c1, 2)?, c1);
            Ok(())
        });
    }
}
