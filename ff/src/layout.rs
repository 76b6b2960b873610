//! On-disk layout
//!
//! Byte offsets of every field the engine touches, plus [`BootSector`],
//! a read-only view that decodes BPB fields out of a raw sector buffer.
//!
//! # Boot Sector Layout (FAT12/16)
//! - Bytes 0-2: Jump instruction
//! - Bytes 3-10: OEM name
//! - Bytes 11-35: BPB
//! - Bytes 36-61: Extended BPB
//! - Bytes 510-511: Signature (0x55, 0xAA)
//!
//! FAT32 moves the extended BPB to bytes 64-89 and exFAT uses its own
//! layout starting at byte 64.

use crate::codec::{ld_dword, ld_qword, ld_word};

// ============================================================================
// Boot Sector
// ============================================================================

pub const BS_JMP_BOOT: usize = 0;
pub const BPB_BYTS_PER_SEC: usize = 11;
pub const BPB_SEC_PER_CLUS: usize = 13;
pub const BPB_RSVD_SEC_CNT: usize = 14;
pub const BPB_NUM_FATS: usize = 16;
pub const BPB_ROOT_ENT_CNT: usize = 17;
pub const BPB_TOT_SEC16: usize = 19;
pub const BPB_MEDIA: usize = 21;
pub const BPB_FAT_SZ16: usize = 22;
pub const BPB_SEC_PER_TRK: usize = 24;
pub const BPB_NUM_HEADS: usize = 26;
pub const BPB_HIDD_SEC: usize = 28;
pub const BPB_TOT_SEC32: usize = 32;
pub const BS_DRV_NUM: usize = 36;
pub const BS_BOOT_SIG: usize = 38;
pub const BS_VOL_ID: usize = 39;
pub const BS_VOL_LAB: usize = 43;
pub const BS_55AA: usize = 510;

pub const BPB_FAT_SZ32: usize = 36;
pub const BPB_FS_VER32: usize = 42;
pub const BPB_ROOT_CLUS32: usize = 44;
pub const BPB_FS_INFO32: usize = 48;
pub const BPB_BK_BOOT_SEC32: usize = 50;
pub const BS_DRV_NUM32: usize = 64;
pub const BS_BOOT_SIG32: usize = 66;
pub const BS_VOL_ID32: usize = 67;
pub const BS_VOL_LAB32: usize = 71;
pub const BS_FIL_SYS_TYPE32: usize = 82;

pub const BPB_ZEROED_EX: usize = 11;
pub const BPB_VOL_OFS_EX: usize = 64;
pub const BPB_TOT_SEC_EX: usize = 72;
pub const BPB_FAT_OFS_EX: usize = 80;
pub const BPB_FAT_SZ_EX: usize = 84;
pub const BPB_DATA_OFS_EX: usize = 88;
pub const BPB_NUM_CLUS_EX: usize = 92;
pub const BPB_ROOT_CLUS_EX: usize = 96;
pub const BPB_VOL_ID_EX: usize = 100;
pub const BPB_FS_VER_EX: usize = 104;
pub const BPB_VOL_FLAG_EX: usize = 106;
pub const BPB_BYTS_PER_SEC_EX: usize = 108;
pub const BPB_SEC_PER_CLUS_EX: usize = 109;
pub const BPB_NUM_FATS_EX: usize = 110;
pub const BPB_DRV_NUM_EX: usize = 111;
pub const BPB_PERC_IN_USE_EX: usize = 112;
pub const BS_BOOT_CODE_EX: usize = 120;

// ============================================================================
// FSInfo (FAT32)
// ============================================================================

pub const FSI_LEAD_SIG: usize = 0;
pub const FSI_STRUC_SIG: usize = 484;
pub const FSI_FREE_COUNT: usize = 488;
pub const FSI_NXT_FREE: usize = 492;

pub const FSI_LEAD_SIG_VALUE: u32 = 0x4161_5252;
pub const FSI_STRUC_SIG_VALUE: u32 = 0x6141_7272;

// ============================================================================
// Partition Table (MBR)
// ============================================================================

pub const MBR_TABLE: usize = 446;
pub const SZ_PTE: usize = 16;
pub const PTE_ST_HEAD: usize = 1;
pub const PTE_SYSTEM: usize = 4;
pub const PTE_ED_HEAD: usize = 5;
pub const PTE_ST_LBA: usize = 8;
pub const PTE_SIZ_LBA: usize = 12;

/// Partition system IDs
pub mod partition_type {
    pub const FAT12: u8 = 0x01;
    pub const FAT16_SMALL: u8 = 0x04;
    pub const FAT16: u8 = 0x06;
    pub const EXFAT: u8 = 0x07;
    pub const FAT32_LBA: u8 = 0x0C;
}

// ============================================================================
// Directory Entries
// ============================================================================

/// Size of a directory entry
pub const SZDIRE: usize = 32;
/// Deleted entry mark
pub const DDEM: u8 = 0xE5;
/// Replacement of a leading 0xE5 in a live short name
pub const RDDEM: u8 = 0x05;
/// Last long name entry flag in LDIR_Ord
pub const LLEF: u8 = 0x40;

pub const DIR_NAME: usize = 0;
pub const DIR_ATTR: usize = 11;
pub const DIR_NT_RES: usize = 12;
pub const DIR_CRT_TIME: usize = 14;
pub const DIR_LST_ACC_DATE: usize = 18;
pub const DIR_FST_CLUS_HI: usize = 20;
pub const DIR_MOD_TIME: usize = 22;
pub const DIR_FST_CLUS_LO: usize = 26;
pub const DIR_FILE_SIZE: usize = 28;

pub const LDIR_ORD: usize = 0;
pub const LDIR_ATTR: usize = 11;
pub const LDIR_TYPE: usize = 12;
pub const LDIR_CHKSUM: usize = 13;
pub const LDIR_FST_CLUS_LO: usize = 26;

pub const XDIR_TYPE: usize = 0;
pub const XDIR_NUM_LABEL: usize = 1;
pub const XDIR_LABEL: usize = 2;
pub const XDIR_CASE_SUM: usize = 4;
pub const XDIR_NUM_SEC: usize = 1;
pub const XDIR_SET_SUM: usize = 2;
pub const XDIR_ATTR: usize = 4;
pub const XDIR_CRT_TIME: usize = 8;
pub const XDIR_MOD_TIME: usize = 12;
pub const XDIR_ACC_TIME: usize = 16;
pub const XDIR_MOD_TIME10: usize = 21;
pub const XDIR_GEN_FLAGS: usize = 33;
pub const XDIR_NUM_NAME: usize = 35;
pub const XDIR_NAME_HASH: usize = 36;
pub const XDIR_VALID_FILE_SIZE: usize = 40;
pub const XDIR_FST_CLUS: usize = 52;
pub const XDIR_FILE_SIZE: usize = 56;

/// exFAT directory entry types
pub mod xdir_type {
    pub const BITMAP: u8 = 0x81;
    pub const UPCASE: u8 = 0x82;
    pub const LABEL: u8 = 0x83;
    pub const FILE: u8 = 0x85;
    pub const STREAM: u8 = 0xC0;
    pub const NAME: u8 = 0xC1;
}

// ============================================================================
// Boot Sector View
// ============================================================================

/// Read-only view of a FAT or exFAT boot sector
#[derive(Clone, Copy)]
pub struct BootSector<'a>(pub &'a [u8]);

impl<'a> BootSector<'a> {
    /// Signature 0xAA55 at offset 510
    pub fn has_signature(&self) -> bool {
        ld_word(self.0, BS_55AA) == 0xAA55
    }

    pub fn jump_byte(&self) -> u8 {
        self.0[BS_JMP_BOOT]
    }

    /// "EXFAT   " at the OEM name position
    pub fn is_exfat(&self) -> bool {
        &self.0[BS_JMP_BOOT..BS_JMP_BOOT + 11] == b"\xEB\x76\x90EXFAT   "
    }

    pub fn bytes_per_sector(&self) -> u16 {
        ld_word(self.0, BPB_BYTS_PER_SEC)
    }

    pub fn sectors_per_cluster(&self) -> u8 {
        self.0[BPB_SEC_PER_CLUS]
    }

    pub fn reserved_sectors(&self) -> u16 {
        ld_word(self.0, BPB_RSVD_SEC_CNT)
    }

    pub fn num_fats(&self) -> u8 {
        self.0[BPB_NUM_FATS]
    }

    pub fn root_entry_count(&self) -> u16 {
        ld_word(self.0, BPB_ROOT_ENT_CNT)
    }

    pub fn media(&self) -> u8 {
        self.0[BPB_MEDIA]
    }

    /// Total sectors (16-bit field, falling back to the 32-bit one)
    pub fn total_sectors(&self) -> u32 {
        match ld_word(self.0, BPB_TOT_SEC16) {
            0 => ld_dword(self.0, BPB_TOT_SEC32),
            n => n as u32,
        }
    }

    /// Sectors per FAT (16-bit field, falling back to the FAT32 one)
    pub fn fat_size(&self) -> u32 {
        match ld_word(self.0, BPB_FAT_SZ16) {
            0 => ld_dword(self.0, BPB_FAT_SZ32),
            n => n as u32,
        }
    }

    pub fn fs_version32(&self) -> u16 {
        ld_word(self.0, BPB_FS_VER32)
    }

    pub fn root_cluster32(&self) -> u32 {
        ld_dword(self.0, BPB_ROOT_CLUS32)
    }

    pub fn fs_info32(&self) -> u16 {
        ld_word(self.0, BPB_FS_INFO32)
    }

    pub fn ex_version(&self) -> u16 {
        ld_word(self.0, BPB_FS_VER_EX)
    }

    pub fn ex_total_sectors(&self) -> u64 {
        ld_qword(self.0, BPB_TOT_SEC_EX)
    }

    pub fn ex_fat_offset(&self) -> u32 {
        ld_dword(self.0, BPB_FAT_OFS_EX)
    }

    pub fn ex_fat_size(&self) -> u32 {
        ld_dword(self.0, BPB_FAT_SZ_EX)
    }

    pub fn ex_data_offset(&self) -> u32 {
        ld_dword(self.0, BPB_DATA_OFS_EX)
    }

    pub fn ex_cluster_count(&self) -> u32 {
        ld_dword(self.0, BPB_NUM_CLUS_EX)
    }

    pub fn ex_root_cluster(&self) -> u32 {
        ld_dword(self.0, BPB_ROOT_CLUS_EX)
    }

    /// log2 of bytes per sector
    pub fn ex_bytes_per_sector_shift(&self) -> u8 {
        self.0[BPB_BYTS_PER_SEC_EX]
    }

    /// log2 of sectors per cluster
    pub fn ex_sectors_per_cluster_shift(&self) -> u8 {
        self.0[BPB_SEC_PER_CLUS_EX]
    }

    pub fn ex_num_fats(&self) -> u8 {
        self.0[BPB_NUM_FATS_EX]
    }

    /// Bytes 11-63 must be zero on exFAT
    pub fn ex_zero_region_clear(&self) -> bool {
        self.0[BPB_ZEROED_EX..BPB_ZEROED_EX + 53].iter().all(|&b| b == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{st_dword, st_word};

    #[test]
    fn test_boot_sector_view() {
        let mut sect = [0u8; 512];
        st_word(&mut sect, BPB_BYTS_PER_SEC, 512);
        sect[BPB_SEC_PER_CLUS] = 4;
        st_word(&mut sect, BPB_RSVD_SEC_CNT, 32);
        st_dword(&mut sect, BPB_TOT_SEC32, 100_000);
        st_dword(&mut sect, BPB_FAT_SZ32, 97);
        st_word(&mut sect, BS_55AA, 0xAA55);
        let bs = BootSector(&sect);
        assert!(bs.has_signature());
        assert_eq!(bs.bytes_per_sector(), 512);
        assert_eq!(bs.total_sectors(), 100_000);
        assert_eq!(bs.fat_size(), 97);
        assert!(!bs.is_exfat());
    }
}
