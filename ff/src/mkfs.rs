//! Volume formatting
//!
//! [`mkfs`] lays down a fresh FAT12/16/32 or exFAT volume on a whole device
//! or on an existing MBR partition, and [`fdisk`] writes a new MBR
//! partition table.
//!
//! # Structure
//! - front end: validate the device, locate the volume area and pick the
//!   filesystem type
//! - `format_exfat`: FAT, allocation bitmap, up-case table, root directory
//!   and both boot regions
//! - `format_fat`: cluster size search, boot sector (+ FSInfo and backup on
//!   FAT32), FAT copies and root directory
//! - partition type update / single-partition MBR

use alloc::vec;

use bitflags::bitflags;

use crate::block::{BlockDevice, DiskStatus, IoctlCmd};
use crate::codec::{ld_dword, ld_word, st_dword, st_qword, st_word};
use crate::config::{MAX_EXFAT, MAX_FAT12, MAX_FAT16, MAX_FAT32, MAX_SS, MIN_SS};
use crate::error::{FsError, FsResult};
use crate::exfat::xsum32;
use crate::fs::FatFs;
use crate::layout::*;
use crate::time::{FixedClock, TimeSource};
use crate::unicode::wtoupper;
use crate::volume::{Device, FatType};

bitflags! {
    /// Filesystem types `mkfs` may choose from
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MkfsFormat: u8 {
        /// FAT12 or FAT16, by cluster count
        const FAT = 0x01;
        const FAT32 = 0x02;
        const EXFAT = 0x04;
        const ANY = 0x07;
        /// Super-floppy layout: the volume starts at LBA 0 without an MBR
        const SFD = 0x08;
    }
}

/// Format parameters
///
/// Out of range values fall back to their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MkfsOptions {
    pub fmt: MkfsFormat,
    /// Number of FAT copies (1 or 2, FAT only)
    pub n_fat: u8,
    /// Data area alignment in sectors, 0 to ask the device
    pub align: u32,
    /// Root directory entries (FAT12/16 only)
    pub n_root: u32,
    /// Cluster size in bytes, 0 for automatic
    pub au_size: u32,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self { fmt: MkfsFormat::ANY, n_fat: 1, align: 0, n_root: 512, au_size: 0 }
    }
}

/// Sectors per track of the generated geometry
const N_SEC_TRACK: u32 = 63;
/// Sectors in the work buffer
const SZ_BUF: usize = 32;
/// Auto cluster size thresholds for FAT12/16 (in units of 4K sectors)
const CST: [u32; 6] = [1, 4, 16, 64, 256, 512];
/// Auto cluster size thresholds for FAT32 (in units of 128K sectors)
const CST32: [u32; 6] = [1, 2, 4, 8, 16, 32];

type Disk = dyn BlockDevice + Send;

/// Sector writes of the formatter
///
/// Every device failure becomes `DiskErr`.
fn put(d: &mut Disk, buf: &[u8], ss: usize, lba: u64, count: usize) -> FsResult<()> {
    d.write(&buf[..ss * count], lba, count as u32).map_err(|_| FsError::DiskErr)
}

fn get(d: &mut Disk, buf: &mut [u8], ss: usize, lba: u64) -> FsResult<()> {
    d.read(&mut buf[..ss], lba, 1).map_err(|_| FsError::DiskErr)
}

fn trim(d: &mut Disk, start: u64, count: u64) {
    if count == 0 {
        return;
    }
    if let Err(e) = d.ioctl(IoctlCmd::Trim { start, end: start + count - 1 }) {
        log::debug!("[FF] mkfs: trim hint ignored: {:?}", e);
    }
}

/// Prepare the device for formatting
fn start_disk(d: &mut Disk) -> FsResult<()> {
    let st = d.initialize();
    if st.contains(DiskStatus::NOINIT) {
        return Err(FsError::NotReady);
    }
    if st.contains(DiskStatus::PROTECT) {
        return Err(FsError::WriteProtected);
    }
    Ok(())
}

fn sector_size(d: &mut Disk) -> FsResult<usize> {
    let mut ss = 0u16;
    d.ioctl(IoctlCmd::GetSectorSize(&mut ss)).map_err(|_| FsError::DiskErr)?;
    let ss = ss as usize;
    if !(MIN_SS..=MAX_SS).contains(&ss) || !ss.is_power_of_two() {
        return Err(FsError::DiskErr);
    }
    Ok(ss)
}

fn sector_count(d: &mut Disk) -> FsResult<u64> {
    let mut n = 0u64;
    d.ioctl(IoctlCmd::GetSectorCount(&mut n)).map_err(|_| FsError::DiskErr)?;
    Ok(n)
}

/// Create a filesystem on `partition` (1-4) of `dev`, or on the whole
/// device when `partition` is 0
pub fn mkfs(dev: &Device, partition: u8, opts: &MkfsOptions) -> FsResult<()> {
    format(dev, partition, opts, &FixedClock::default(), true)
}

/// Volume area and work parameters shared by both formatters
struct Layout {
    ss: usize,
    b_vol: u64,
    sz_vol: u64,
    /// Alignment of the data area in sectors (power of 2)
    sz_blk: u64,
    /// Requested cluster size in sectors, 0 for automatic
    sz_au: u32,
    vsn: u32,
    trim: bool,
}

pub(crate) fn format(
    dev: &Device,
    partition: u8,
    opts: &MkfsOptions,
    clock: &dyn TimeSource,
    use_trim: bool,
) -> FsResult<()> {
    let mut guard = dev.lock();
    let d: &mut Disk = &mut **guard;
    start_disk(d)?;

    let mut sz_blk = opts.align;
    if sz_blk == 0 && d.ioctl(IoctlCmd::GetBlockSize(&mut sz_blk)).is_err() {
        sz_blk = 1;
    }
    if sz_blk == 0 || sz_blk > 0x8000 || !sz_blk.is_power_of_two() {
        sz_blk = 1;
    }
    let ss = sector_size(d)?;

    let fmt = opts.fmt & (MkfsFormat::ANY | MkfsFormat::SFD);
    let n_fat = if (1..=2).contains(&opts.n_fat) { opts.n_fat } else { 1 };
    let ents_per_sect = (ss / SZDIRE) as u32;
    let n_root = if (1..=32768).contains(&opts.n_root) && opts.n_root % ents_per_sect == 0 {
        opts.n_root
    } else {
        512
    };
    let au = if opts.au_size <= 0x100_0000 && opts.au_size & opts.au_size.wrapping_sub(1) == 0 {
        opts.au_size
    } else {
        0
    };
    let mut sz_au = au / ss as u32;

    let mut buf = vec![0u8; ss * SZ_BUF];

    // Volume area
    let (b_vol, sz_vol) = if partition != 0 {
        get(d, &mut buf, ss, 0)?;
        if ld_word(&buf, BS_55AA) != 0xAA55 || partition > 4 {
            return Err(FsError::MkfsAborted);
        }
        let pte = MBR_TABLE + (partition as usize - 1) * SZ_PTE;
        if buf[pte + PTE_SYSTEM] == 0 {
            return Err(FsError::MkfsAborted);
        }
        (ld_dword(&buf, pte + PTE_ST_LBA) as u64, ld_dword(&buf, pte + PTE_SIZ_LBA) as u64)
    } else {
        let n = sector_count(d)?;
        if !fmt.contains(MkfsFormat::SFD) && n > N_SEC_TRACK as u64 {
            (N_SEC_TRACK as u64, n - N_SEC_TRACK as u64)
        } else {
            (0, n)
        }
    };
    if sz_vol < 128 {
        return Err(FsError::MkfsAborted);
    }

    // Filesystem type
    let fsty = if fmt.contains(MkfsFormat::EXFAT)
        && ((fmt & MkfsFormat::ANY) == MkfsFormat::EXFAT || sz_vol >= 0x400_0000 || sz_au > 128)
    {
        FatType::ExFat
    } else {
        if sz_au > 128 {
            sz_au = 128;
        }
        if fmt.contains(MkfsFormat::FAT32) && (!fmt.contains(MkfsFormat::FAT) || sz_vol >= 0x400_0000) {
            FatType::Fat32
        } else if !fmt.contains(MkfsFormat::FAT) {
            return Err(FsError::InvalidParameter);
        } else {
            FatType::Fat16
        }
    };
    if fsty != FatType::ExFat && sz_vol > 0xFFFF_FFFF {
        return Err(FsError::MkfsAborted);
    }

    let lay = Layout {
        ss,
        b_vol,
        sz_vol,
        sz_blk: sz_blk as u64,
        sz_au,
        vsn: (sz_vol as u32).wrapping_add(clock.fattime()),
        trim: use_trim,
    };

    let fsty = if fsty == FatType::ExFat {
        format_exfat(d, &mut buf, &lay)?;
        FatType::ExFat
    } else {
        format_fat(d, &mut buf, &lay, fsty, fmt, n_fat, n_root)?
    };

    let sys = match fsty {
        FatType::ExFat => partition_type::EXFAT,
        FatType::Fat32 => partition_type::FAT32_LBA,
        _ if sz_vol >= 0x10000 => partition_type::FAT16,
        FatType::Fat16 => partition_type::FAT16_SMALL,
        _ => partition_type::FAT12,
    };

    if partition != 0 {
        // Keep the table, fix up the system ID
        get(d, &mut buf, ss, 0)?;
        buf[MBR_TABLE + (partition as usize - 1) * SZ_PTE + PTE_SYSTEM] = sys;
        put(d, &buf, ss, 0, 1)?;
    } else if !fmt.contains(MkfsFormat::SFD) {
        create_partition(d, &mut buf, ss, &[100], sys)?;
    }

    d.ioctl(IoctlCmd::Sync).map_err(|_| FsError::DiskErr)?;
    log::info!(
        "[FF] mkfs: {:?} volume of {} sectors at LBA {}",
        fsty,
        sz_vol,
        b_vol
    );
    Ok(())
}

// ============================================================================
// exFAT
// ============================================================================

/// Write the compressed up-case table starting at `sect`
///
/// Runs of characters that map to themselves are stored as `0xFFFF, len`.
/// Returns the table size in bytes and its checksum.
fn write_upcase(d: &mut Disk, buf: &mut [u8], ss: usize, mut sect: u64) -> FsResult<(u32, u32)> {
    let cap = buf.len();
    let mut sum = 0u32;
    let mut szb = 0u32;
    let mut si: u16 = 0;
    let mut run: u32 = 0;
    let mut st = 0u8;
    let mut i = 0usize;
    loop {
        let ch: u16;
        match st {
            0 => {
                let up = wtoupper(si as u32) as u16;
                if up != si {
                    ch = up;
                    si = si.wrapping_add(1);
                } else {
                    run = 1;
                    loop {
                        let c = si.wrapping_add(run as u16);
                        if c == 0 || wtoupper(c as u32) != c as u32 {
                            break;
                        }
                        run += 1;
                    }
                    if run >= 128 {
                        ch = 0xFFFF;
                        st = 2;
                    } else {
                        ch = si;
                        si = si.wrapping_add(1);
                        run -= 1;
                        st = if run == 0 { 0 } else { 1 };
                    }
                }
            }
            1 => {
                ch = si;
                si = si.wrapping_add(1);
                run -= 1;
                if run == 0 {
                    st = 0;
                }
            }
            _ => {
                ch = run as u16;
                si = si.wrapping_add(run as u16);
                st = 0;
            }
        }
        for b in ch.to_le_bytes() {
            sum = xsum32(b, sum);
            buf[i] = b;
            i += 1;
        }
        szb += 2;
        if si == 0 || i == cap {
            let n = i.div_ceil(ss);
            put(d, buf, ss, sect, n)?;
            sect += n as u64;
            i = 0;
        }
        if si == 0 {
            break;
        }
    }
    Ok((szb, sum))
}

fn format_exfat(d: &mut Disk, buf: &mut [u8], lay: &Layout) -> FsResult<()> {
    let ss = lay.ss;
    let (b_vol, sz_vol) = (lay.b_vol, lay.sz_vol);
    if sz_vol < 0x1000 {
        return Err(FsError::MkfsAborted);
    }
    if lay.trim {
        trim(d, b_vol, sz_vol);
    }

    let sz_au = match lay.sz_au {
        0 if sz_vol >= 0x400_0000 => 256,
        0 if sz_vol >= 0x8_0000 => 64,
        0 => 8,
        n => n,
    };
    let b_fat = b_vol + 32;
    let sz_fat = ((sz_vol / sz_au as u64 + 2) * 4).div_ceil(ss as u64);
    let b_data = (b_fat + sz_fat + lay.sz_blk - 1) & !(lay.sz_blk - 1);
    if b_data - b_vol >= sz_vol / 2 {
        return Err(FsError::MkfsAborted);
    }
    let n_clst = (sz_vol - (b_data - b_vol)) / sz_au as u64;
    if n_clst < 16 || n_clst > MAX_EXFAT as u64 {
        return Err(FsError::MkfsAborted);
    }
    let n_clst = n_clst as u32;
    let sz_fat = sz_fat as u32;

    let szb_bit = n_clst.div_ceil(8);
    let bcs = sz_au * ss as u32;
    // Clusters of the bitmap, the up-case table and the root directory
    let clen0 = szb_bit.div_ceil(bcs);
    let (szb_case, case_sum) = write_upcase(d, buf, ss, b_data + (sz_au * clen0) as u64)?;
    let clen = [clen0, szb_case.div_ceil(bcs), 1];

    // Allocation bitmap with the system clusters marked in use
    let cap = buf.len();
    let sz_buf = cap / ss;
    let mut nbit = clen.iter().sum::<u32>();
    let mut sect = b_data;
    let mut nsect = szb_bit.div_ceil(ss as u32) as usize;
    while nsect > 0 {
        buf.fill(0);
        let mut i = 0usize;
        while nbit != 0 && i / 8 < cap {
            buf[i / 8] |= 1 << (i % 8);
            i += 1;
            nbit -= 1;
        }
        let n = nsect.min(sz_buf);
        put(d, buf, ss, sect, n)?;
        sect += n as u64;
        nsect -= n;
    }

    // FAT with the three system chains
    let mut sect = b_fat;
    let mut nsect = sz_fat as usize;
    let mut next_chain = 0usize;
    let mut nbit = 0u32;
    let mut clu = 0u32;
    while nsect > 0 {
        buf.fill(0);
        let mut i = 0usize;
        if clu == 0 {
            st_dword(buf, 0, 0xFFFF_FFF8);
            st_dword(buf, 4, 0xFFFF_FFFF);
            i = 8;
            clu = 2;
        }
        loop {
            while nbit != 0 && i < cap {
                st_dword(buf, i, if nbit > 1 { clu + 1 } else { 0xFFFF_FFFF });
                i += 4;
                clu += 1;
                nbit -= 1;
            }
            if nbit == 0 && next_chain < clen.len() {
                nbit = clen[next_chain];
                next_chain += 1;
            }
            if nbit == 0 || i >= cap {
                break;
            }
        }
        let n = nsect.min(sz_buf);
        put(d, buf, ss, sect, n)?;
        sect += n as u64;
        nsect -= n;
    }

    // Root directory: label, bitmap and up-case entries
    buf.fill(0);
    buf[0] = xdir_type::LABEL;
    buf[SZDIRE] = xdir_type::BITMAP;
    st_dword(buf, SZDIRE + 20, 2);
    st_dword(buf, SZDIRE + 24, szb_bit);
    buf[SZDIRE * 2] = xdir_type::UPCASE;
    st_dword(buf, SZDIRE * 2 + XDIR_CASE_SUM, case_sum);
    st_dword(buf, SZDIRE * 2 + 20, 2 + clen[0]);
    st_dword(buf, SZDIRE * 2 + 24, szb_case);
    let mut sect = b_data + (sz_au * (clen[0] + clen[1])) as u64;
    let mut nsect = sz_au as usize;
    while nsect > 0 {
        let n = nsect.min(sz_buf);
        put(d, buf, ss, sect, n)?;
        buf[..ss].fill(0);
        sect += n as u64;
        nsect -= n;
    }

    // Main and backup boot regions
    let mut sect = b_vol;
    for _ in 0..2 {
        let b = &mut buf[..ss];
        b.fill(0);
        b[..11].copy_from_slice(b"\xEB\x76\x90EXFAT   ");
        st_qword(b, BPB_VOL_OFS_EX, b_vol);
        st_qword(b, BPB_TOT_SEC_EX, sz_vol);
        st_dword(b, BPB_FAT_OFS_EX, (b_fat - b_vol) as u32);
        st_dword(b, BPB_FAT_SZ_EX, sz_fat);
        st_dword(b, BPB_DATA_OFS_EX, (b_data - b_vol) as u32);
        st_dword(b, BPB_NUM_CLUS_EX, n_clst);
        st_dword(b, BPB_ROOT_CLUS_EX, 2 + clen[0] + clen[1]);
        st_dword(b, BPB_VOL_ID_EX, lay.vsn);
        st_word(b, BPB_FS_VER_EX, 0x100);
        b[BPB_BYTS_PER_SEC_EX] = ss.trailing_zeros() as u8;
        b[BPB_SEC_PER_CLUS_EX] = sz_au.trailing_zeros() as u8;
        b[BPB_NUM_FATS_EX] = 1;
        b[BPB_DRV_NUM_EX] = 0x80;
        st_word(b, BS_BOOT_CODE_EX, 0xFEEB);
        st_word(b, BS_55AA, 0xAA55);
        let mut sum = 0u32;
        for (i, &x) in b.iter().enumerate() {
            // Volume flags and percent-in-use change at run time
            if i != BPB_VOL_FLAG_EX && i != BPB_VOL_FLAG_EX + 1 && i != BPB_PERC_IN_USE_EX {
                sum = xsum32(x, sum);
            }
        }
        put(d, b, ss, sect, 1)?;
        sect += 1;

        // Extended boot sectors
        b.fill(0);
        st_word(b, ss - 2, 0xAA55);
        for _ in 1..9 {
            sum = b.iter().fold(sum, |s, &x| xsum32(x, s));
            put(d, b, ss, sect, 1)?;
            sect += 1;
        }
        // OEM parameters and reserved sector
        b.fill(0);
        for _ in 9..11 {
            sum = b.iter().fold(sum, |s, &x| xsum32(x, s));
            put(d, b, ss, sect, 1)?;
            sect += 1;
        }
        for ofs in (0..ss).step_by(4) {
            st_dword(b, ofs, sum);
        }
        put(d, b, ss, sect, 1)?;
        sect += 1;
    }
    Ok(())
}

// ============================================================================
// FAT12/16/32
// ============================================================================

/// Geometry chosen for a FAT volume
struct FatGeometry {
    fsty: FatType,
    /// Sectors per cluster
    pau: u32,
    sz_rsv: u32,
    sz_fat: u32,
    sz_dir: u32,
    b_fat: u64,
    n_clst: u32,
}

/// Pick cluster size and area sizes, retrying with other cluster sizes or
/// FAT32 when the cluster count falls outside the type's range
fn fat_geometry(
    lay: &Layout,
    mut fsty: FatType,
    fmt: MkfsFormat,
    n_fat: u32,
    n_root: u32,
) -> FsResult<FatGeometry> {
    let ss = lay.ss as u64;
    let sz_vol = lay.sz_vol;
    let mut sz_au = lay.sz_au;
    loop {
        let mut pau = sz_au;
        let mut sz_rsv: u32;
        let mut sz_fat: u32;
        let sz_dir: u32;
        if fsty == FatType::Fat32 {
            if pau == 0 {
                let n = sz_vol / 0x2_0000;
                pau = 1;
                for &c in CST32.iter() {
                    if c as u64 > n {
                        break;
                    }
                    pau <<= 1;
                }
            }
            let n_clst = sz_vol / pau as u64;
            sz_fat = (n_clst * 4 + 8).div_ceil(ss) as u32;
            sz_rsv = 32;
            sz_dir = 0;
            if n_clst > MAX_FAT32 as u64 {
                return Err(FsError::MkfsAborted);
            }
        } else {
            if pau == 0 {
                let n = sz_vol / 0x1000;
                pau = 1;
                for &c in CST.iter() {
                    if c as u64 > n {
                        break;
                    }
                    pau <<= 1;
                }
            }
            let n_clst = sz_vol / pau as u64;
            let nbytes = if n_clst > MAX_FAT12 as u64 {
                n_clst * 2 + 4
            } else {
                fsty = FatType::Fat12;
                (n_clst * 3 + 1) / 2 + 3
            };
            sz_fat = nbytes.div_ceil(ss) as u32;
            sz_rsv = 1;
            sz_dir = n_root * SZDIRE as u32 / ss as u32;
        }

        // Align the data area by growing the reserved area or the FATs
        let mut b_fat = lay.b_vol + sz_rsv as u64;
        let b_data = b_fat + (sz_fat * n_fat) as u64 + sz_dir as u64;
        let pad = (((b_data + lay.sz_blk - 1) & !(lay.sz_blk - 1)) - b_data) as u32;
        if fsty == FatType::Fat32 {
            sz_rsv += pad;
            b_fat += pad as u64;
        } else {
            let mut pad = pad;
            if pad % n_fat != 0 {
                pad -= 1;
                sz_rsv += 1;
                b_fat += 1;
            }
            sz_fat += pad / n_fat;
        }

        if sz_vol < b_data + pau as u64 * 16 - lay.b_vol {
            return Err(FsError::MkfsAborted);
        }
        let n_clst = ((sz_vol - sz_rsv as u64 - (sz_fat * n_fat) as u64 - sz_dir as u64) / pau as u64) as u32;

        if fsty == FatType::Fat32 && n_clst <= MAX_FAT16 {
            // Too few clusters for FAT32: halve the cluster size
            if pau > 1 {
                log::debug!("[FF] mkfs: {} clusters too few for FAT32, trying {} sectors/cluster", n_clst, pau / 2);
                sz_au = pau / 2;
                continue;
            }
            return Err(FsError::MkfsAborted);
        }
        if fsty == FatType::Fat16 {
            if n_clst > MAX_FAT16 {
                if sz_au == 0 && pau * 2 <= 64 {
                    sz_au = pau * 2;
                    continue;
                }
                if fmt.contains(MkfsFormat::FAT32) {
                    fsty = FatType::Fat32;
                    continue;
                }
                if sz_au == 0 && pau * 2 <= 128 {
                    sz_au = pau * 2;
                    continue;
                }
                return Err(FsError::MkfsAborted);
            }
            if n_clst <= MAX_FAT12 {
                if sz_au == 0 && pau * 2 <= 128 {
                    sz_au = pau * 2;
                    continue;
                }
                return Err(FsError::MkfsAborted);
            }
        }
        if fsty == FatType::Fat12 && n_clst > MAX_FAT12 {
            return Err(FsError::MkfsAborted);
        }
        return Ok(FatGeometry { fsty, pau, sz_rsv, sz_fat, sz_dir, b_fat, n_clst });
    }
}

fn format_fat(
    d: &mut Disk,
    buf: &mut [u8],
    lay: &Layout,
    fsty: FatType,
    fmt: MkfsFormat,
    n_fat: u8,
    n_root: u32,
) -> FsResult<FatType> {
    let ss = lay.ss;
    let (b_vol, sz_vol) = (lay.b_vol, lay.sz_vol);
    let g = fat_geometry(lay, fsty, fmt, n_fat as u32, n_root)?;
    let fat32 = g.fsty == FatType::Fat32;

    if lay.trim {
        trim(d, b_vol, sz_vol);
    }

    // Boot sector
    let sz_buf = buf.len() / ss;
    {
        let b = &mut buf[..ss];
        b.fill(0);
        b[..11].copy_from_slice(b"\xEB\xFE\x90MSDOS5.0");
        st_word(b, BPB_BYTS_PER_SEC, ss as u16);
        b[BPB_SEC_PER_CLUS] = g.pau as u8;
        st_word(b, BPB_RSVD_SEC_CNT, g.sz_rsv as u16);
        b[BPB_NUM_FATS] = n_fat;
        st_word(b, BPB_ROOT_ENT_CNT, if fat32 { 0 } else { n_root as u16 });
        if sz_vol < 0x10000 {
            st_word(b, BPB_TOT_SEC16, sz_vol as u16);
        } else {
            st_dword(b, BPB_TOT_SEC32, sz_vol as u32);
        }
        b[BPB_MEDIA] = 0xF8;
        st_word(b, BPB_SEC_PER_TRK, N_SEC_TRACK as u16);
        st_word(b, BPB_NUM_HEADS, 255);
        st_dword(b, BPB_HIDD_SEC, b_vol as u32);
        if fat32 {
            st_dword(b, BS_VOL_ID32, lay.vsn);
            st_dword(b, BPB_FAT_SZ32, g.sz_fat);
            st_dword(b, BPB_ROOT_CLUS32, 2);
            st_word(b, BPB_FS_INFO32, 1);
            st_word(b, BPB_BK_BOOT_SEC32, 6);
            b[BS_DRV_NUM32] = 0x80;
            b[BS_BOOT_SIG32] = 0x29;
            b[BS_VOL_LAB32..BS_VOL_LAB32 + 19].copy_from_slice(b"NO NAME    FAT32   ");
        } else {
            st_dword(b, BS_VOL_ID, lay.vsn);
            st_word(b, BPB_FAT_SZ16, g.sz_fat as u16);
            b[BS_DRV_NUM] = 0x80;
            b[BS_BOOT_SIG] = 0x29;
            b[BS_VOL_LAB..BS_VOL_LAB + 19].copy_from_slice(b"NO NAME    FAT     ");
        }
        st_word(b, BS_55AA, 0xAA55);
        put(d, b, ss, b_vol, 1)?;
    }

    if fat32 {
        // Backup boot sector, then FSInfo and its backup
        put(d, buf, ss, b_vol + 6, 1)?;
        let b = &mut buf[..ss];
        b.fill(0);
        st_dword(b, FSI_LEAD_SIG, FSI_LEAD_SIG_VALUE);
        st_dword(b, FSI_STRUC_SIG, FSI_STRUC_SIG_VALUE);
        // The root directory takes cluster 2
        st_dword(b, FSI_FREE_COUNT, g.n_clst - 1);
        st_dword(b, FSI_NXT_FREE, 2);
        st_word(b, BS_55AA, 0xAA55);
        put(d, b, ss, b_vol + 7, 1)?;
        put(d, b, ss, b_vol + 1, 1)?;
    }

    // FAT copies
    buf.fill(0);
    let mut sect = g.b_fat;
    for _ in 0..n_fat {
        match g.fsty {
            FatType::Fat32 => {
                st_dword(buf, 0, 0xFFFF_FFF8);
                st_dword(buf, 4, 0xFFFF_FFFF);
                st_dword(buf, 8, 0x0FFF_FFFF);
            }
            FatType::Fat12 => st_dword(buf, 0, 0x00FF_FFF8),
            _ => st_dword(buf, 0, 0xFFFF_FFF8),
        }
        let mut nsect = g.sz_fat as usize;
        while nsect > 0 {
            let n = nsect.min(sz_buf);
            put(d, buf, ss, sect, n)?;
            buf[..ss].fill(0);
            sect += n as u64;
            nsect -= n;
        }
    }

    // Root directory (fixed area or the first cluster)
    let mut nsect = (if fat32 { g.pau } else { g.sz_dir }) as usize;
    while nsect > 0 {
        let n = nsect.min(sz_buf);
        put(d, buf, ss, sect, n)?;
        sect += n as u64;
        nsect -= n;
    }
    Ok(g.fsty)
}

// ============================================================================
// Partitioning
// ============================================================================

/// Write an MBR with up to four primary partitions of type `sys`
///
/// Sizes are in sectors; a size of 100 or less is a percentage of the
/// device. Partitions start on a track boundary and are laid out back to
/// back until the device is full.
fn create_partition(d: &mut Disk, buf: &mut [u8], ss: usize, sizes: &[u64], sys: u8) -> FsResult<()> {
    let sz_drv = sector_count(d)?.min(0xFFFF_FFFF) as u32;

    // CHS geometry of the drive
    let n_sc = N_SEC_TRACK;
    let mut n_hd = 8u32;
    while n_hd < 256 && sz_drv / n_hd / n_sc > 1024 {
        n_hd *= 2;
    }
    if n_hd == 256 {
        n_hd = 255;
    }
    let chs = |lba: u32| -> [u8; 3] {
        let cy = lba / n_sc / n_hd;
        let hd = lba / n_sc % n_hd;
        let sc = lba % n_sc + 1;
        [hd as u8, ((cy >> 2) & 0xC0) as u8 | sc as u8, cy as u8]
    };

    let b = &mut buf[..ss];
    b.fill(0);
    let mut s_lba = n_sc;
    for (i, &size) in sizes.iter().take(4).enumerate() {
        if s_lba >= sz_drv {
            break;
        }
        let mut n_lba = size.min(0xFFFF_FFFF) as u32;
        if n_lba <= 100 {
            n_lba = if n_lba == 100 { sz_drv } else { sz_drv / 100 * n_lba };
        }
        if s_lba as u64 + n_lba as u64 > sz_drv as u64 {
            n_lba = sz_drv - s_lba;
        }
        if n_lba == 0 {
            break;
        }
        let pte = MBR_TABLE + i * SZ_PTE;
        st_dword(b, pte + PTE_ST_LBA, s_lba);
        st_dword(b, pte + PTE_SIZ_LBA, n_lba);
        b[pte + PTE_SYSTEM] = sys;
        b[pte + PTE_ST_HEAD..pte + PTE_ST_HEAD + 3].copy_from_slice(&chs(s_lba));
        b[pte + PTE_ED_HEAD..pte + PTE_ED_HEAD + 3].copy_from_slice(&chs(s_lba + n_lba - 1));
        log::debug!("[FF] partition {}: LBA {} + {} sectors, type {:#04x}", i + 1, s_lba, n_lba, sys);
        s_lba += n_lba;
    }
    st_word(b, BS_55AA, 0xAA55);
    put(d, b, ss, 0, 1)
}

/// Write a new MBR partition table to `dev`
///
/// See [`create_partition`] for the meaning of `sizes`. Every partition is
/// typed as exFAT until `mkfs` formats it.
pub fn fdisk(dev: &Device, sizes: &[u64]) -> FsResult<()> {
    let mut guard = dev.lock();
    let d: &mut Disk = &mut **guard;
    start_disk(d)?;
    let ss = sector_size(d)?;
    let mut buf = vec![0u8; ss];
    create_partition(d, &mut buf, ss, sizes, partition_type::EXFAT)?;
    d.ioctl(IoctlCmd::Sync).map_err(|_| FsError::DiskErr)
}

impl FatFs {
    /// Format the volume of the drive named by `path`
    ///
    /// Volumes mounted from the same device are forgotten first; their open
    /// objects become invalid.
    pub fn mkfs(&self, path: &str, opts: &MkfsOptions) -> FsResult<()> {
        if self.config.read_only {
            return Err(FsError::WriteProtected);
        }
        let (drive, _) = self.resolve(path)?;
        let pdrv = self.drive_device(drive)?;
        let (dev, partition) = self.drive_target(drive)?;
        let partition = if self.config.multi_partition { partition } else { 0 };
        let mut opts = *opts;
        if !self.config.exfat {
            opts.fmt.remove(MkfsFormat::EXFAT);
        }
        self.forget_device(pdrv)?;
        format(dev, partition, &opts, self.clock.as_ref(), self.config.use_trim)
    }

    /// Partition physical device `pdrv`
    pub fn fdisk(&self, pdrv: usize, sizes: &[u64]) -> FsResult<()> {
        if self.config.read_only {
            return Err(FsError::WriteProtected);
        }
        let dev = self.device(pdrv)?;
        self.forget_device(pdrv)?;
        fdisk(dev, sizes)
    }
}
