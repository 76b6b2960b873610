//! Attribute, mode and name status flags

bitflags::bitflags! {
    /// Directory entry attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileAttr: u8 {
        /// Read only
        const RDO = 0x01;
        /// Hidden
        const HID = 0x02;
        /// System
        const SYS = 0x04;
        /// Volume label
        const VOL = 0x08;
        /// Directory
        const DIR = 0x10;
        /// Archive
        const ARC = 0x20;
    }
}

/// Attribute byte of a long file name entry
pub const AM_LFN: u8 = 0x0F;
/// Mask of the defined attribute bits
pub const AM_MASK: u8 = 0x3F;

bitflags::bitflags! {
    /// File open mode
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenMode: u8 {
        /// Read access
        const READ = 0x01;
        /// Write access
        const WRITE = 0x02;
        /// Create a new file, fail if it exists
        const CREATE_NEW = 0x04;
        /// Create a new file, truncate an existing one
        const CREATE_ALWAYS = 0x08;
        /// Open the file, create it if it does not exist
        const OPEN_ALWAYS = 0x10;
        /// Like `OPEN_ALWAYS` and move the pointer to the end
        const OPEN_APPEND = 0x30;
    }
}

bitflags::bitflags! {
    /// Internal file state bits kept next to the open mode
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct FileState: u8 {
        /// File has been modified and the entry must be updated
        const MODIFIED = 0x40;
        /// Sector buffer holds unwritten data
        const DIRTY = 0x80;
    }
}

bitflags::bitflags! {
    /// Status of a name created from a path segment
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NameFlags: u8 {
        /// Out of 8.3 format
        const LOSS = 0x01;
        /// Force to create LFN entry
        const LFN = 0x02;
        /// Last segment
        const LAST = 0x04;
        /// Lower case flag (body)
        const BODY = 0x08;
        /// Lower case flag (ext)
        const EXT = 0x10;
        /// Dot entry
        const DOT = 0x20;
        /// Do not find LFN
        const NOLFN = 0x40;
        /// Not followed (the origin directory itself)
        const NONAME = 0x80;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_implies_open_always() {
        assert!(OpenMode::OPEN_APPEND.contains(OpenMode::OPEN_ALWAYS));
        assert_eq!(
            (FileAttr::RDO | FileAttr::HID | FileAttr::SYS | FileAttr::VOL).bits(),
            AM_LFN
        );
    }
}
