//! Result codes
//!
//! Every public operation returns `FsResult<T>`. The variants form a flat
//! enumeration whose discriminants are the classic numeric result codes,
//! so `FsError::code()` can be handed to foreign callers unchanged.

use core::fmt;

use crate::block::DiskError;

/// Filesystem operation error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FsError {
    /// A hard error occurred in the low level disk I/O layer
    DiskErr = 1,
    /// Assertion failed: an on-disk structure holds a value that cannot occur
    IntErr = 2,
    /// The physical drive does not work (not initialized or no media)
    NotReady = 3,
    /// Could not find the file
    NoFile = 4,
    /// Could not find the path
    NoPath = 5,
    /// The path name format is invalid
    InvalidName = 6,
    /// Access denied due to prohibited access or directory full
    Denied = 7,
    /// Access denied due to prohibited access
    Exist = 8,
    /// The file/directory object is invalid
    InvalidObject = 9,
    /// The physical drive is write protected
    WriteProtected = 10,
    /// The logical drive number is invalid
    InvalidDrive = 11,
    /// The volume has no work area
    NotEnabled = 12,
    /// There is no valid FAT volume
    NoFilesystem = 13,
    /// mkfs aborted due to a parameter or geometry problem
    MkfsAborted = 14,
    /// Could not get a grant to access the volume within the defined period
    Timeout = 15,
    /// The operation is rejected by the file lock table
    Locked = 16,
    /// Working buffer could not be allocated
    NotEnoughCore = 17,
    /// Number of open files exceeds the lock table capacity
    TooManyOpenFiles = 18,
    /// Given parameter is invalid
    InvalidParameter = 19,
}

/// Result type used throughout the crate
pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    /// Numeric result code (0 is reserved for success)
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Short description of the error
    pub fn as_str(self) -> &'static str {
        match self {
            FsError::DiskErr => "disk I/O error",
            FsError::IntErr => "internal error",
            FsError::NotReady => "drive not ready",
            FsError::NoFile => "no such file",
            FsError::NoPath => "no such path",
            FsError::InvalidName => "invalid name",
            FsError::Denied => "access denied",
            FsError::Exist => "object already exists",
            FsError::InvalidObject => "invalid object",
            FsError::WriteProtected => "write protected",
            FsError::InvalidDrive => "invalid drive",
            FsError::NotEnabled => "volume not enabled",
            FsError::NoFilesystem => "no filesystem",
            FsError::MkfsAborted => "mkfs aborted",
            FsError::Timeout => "timeout",
            FsError::Locked => "locked",
            FsError::NotEnoughCore => "not enough memory",
            FsError::TooManyOpenFiles => "too many open files",
            FsError::InvalidParameter => "invalid parameter",
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

impl From<DiskError> for FsError {
    fn from(e: DiskError) -> Self {
        match e {
            DiskError::NotReady => FsError::NotReady,
            DiskError::WriteProtected => FsError::WriteProtected,
            DiskError::Error | DiskError::ParamError => FsError::DiskErr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(FsError::DiskErr.code(), 1);
        assert_eq!(FsError::NoPath.code(), 5);
        assert_eq!(FsError::Locked.code(), 16);
        assert_eq!(FsError::InvalidParameter.code(), 19);
    }

    #[test]
    fn test_disk_error_mapping() {
        assert_eq!(FsError::from(DiskError::Error), FsError::DiskErr);
        assert_eq!(FsError::from(DiskError::NotReady), FsError::NotReady);
        assert_eq!(FsError::from(DiskError::WriteProtected), FsError::WriteProtected);
    }

    #[test]
    fn test_display() {
        assert_eq!(FsError::Exist.to_string(), "object already exists (8)");
    }
}
