//! Runtime configuration and compile-time limits

/// Smallest supported sector size
pub const MIN_SS: usize = 512;
/// Largest supported sector size
pub const MAX_SS: usize = 4096;

/// Maximum number of clusters on a FAT12 volume
pub const MAX_FAT12: u32 = 0xFF5;
/// Maximum number of clusters on a FAT16 volume
pub const MAX_FAT16: u32 = 0xFFF5;
/// Maximum number of clusters on a FAT32 volume
pub const MAX_FAT32: u32 = 0x0FFF_FFF5;
/// Maximum number of clusters on an exFAT volume
pub const MAX_EXFAT: u32 = 0x7FFF_FFFD;

/// Maximum size of a FAT/FAT32 directory table in bytes
pub const MAX_DIR: u32 = 0x20_0000;
/// Maximum size of an exFAT directory table in bytes
pub const MAX_DIR_EX: u32 = 0x1000_0000;

/// Largest supported long file name length in UTF-16 code units
pub const LFN_LIMIT: usize = 255;

/// Filesystem configuration
///
/// One configuration is shared by every drive of a [`crate::FatFs`].
#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Enable long file names (otherwise names must be valid 8.3)
    pub use_lfn: bool,
    /// Maximum LFN length in UTF-16 code units (12..=255)
    pub max_lfn: usize,
    /// OEM code page used for short names
    pub code_page: u16,
    /// Number of lock table slots per volume (0 disables file locking)
    pub lock_slots: usize,
    /// Enable current directory and relative paths
    pub relative_paths: bool,
    /// Allow selecting a partition other than the first one
    pub multi_partition: bool,
    /// Guard volume access with a bounded try-lock
    pub reentrant: bool,
    /// Lock attempts before an operation gives up with `Timeout`
    pub lock_spins: u32,
    /// Tell the device about freed clusters
    pub use_trim: bool,
    /// Recognize and format exFAT volumes
    pub exfat: bool,
    /// Reject every write operation
    pub read_only: bool,
    /// Enable fast seek through cluster link maps
    pub fast_seek: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            use_lfn: true,
            max_lfn: LFN_LIMIT,
            code_page: 437,
            lock_slots: 10,
            relative_paths: true,
            multi_partition: true,
            reentrant: true,
            lock_spins: 1_000_000,
            use_trim: true,
            exfat: true,
            read_only: false,
            fast_seek: true,
        }
    }
}

impl FsConfig {
    /// Size of the exFAT directory entry block buffer for the configured LFN length
    pub fn xdir_buf_size(&self) -> usize {
        max_dirb(self.max_lfn)
    }

    /// Clamp fields into their valid ranges
    pub fn sanitized(mut self) -> Self {
        self.max_lfn = self.max_lfn.clamp(12, LFN_LIMIT);
        if self.lock_spins == 0 {
            self.lock_spins = 1;
        }
        self
    }
}

/// Size of an exFAT entry block able to hold a name of `nc` characters
pub const fn max_dirb(nc: usize) -> usize {
    (nc + 44) / 15 * 32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = FsConfig::default();
        assert!(cfg.use_lfn);
        assert_eq!(cfg.max_lfn, 255);
        assert_eq!(cfg.lock_slots, 10);
        assert_eq!(cfg.xdir_buf_size(), 608);
    }

    #[test]
    fn test_sanitize_clamps_lfn() {
        let cfg = FsConfig { max_lfn: 4, lock_spins: 0, ..FsConfig::default() }.sanitized();
        assert_eq!(cfg.max_lfn, 12);
        assert_eq!(cfg.lock_spins, 1);
    }
}
