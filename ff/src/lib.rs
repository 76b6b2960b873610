//! FAT12/16/32 and exFAT filesystem engine
//!
//! The engine runs over any sector-addressed [`BlockDevice`] and keeps no
//! global state: a [`FatFs`] registry owns the devices, the logical drives
//! mapped onto them and the mounted volumes.
//!
//! # Architecture Overview
//!
//! - **block** - block device trait, RAM disk
//! - **volume** - mounted volume state, sector window, FSInfo sync
//! - **table / chain** - FAT entries, allocation bitmap, cluster chains
//! - **dir / lfn / exfat** - directory cursor, long names, exFAT entry sets
//! - **name / path** - name parsing, path resolution
//! - **fs** - drive registry, lazy mount, current drive and directory
//! - **file / dir_handle / ops** - the application facing API
//! - **mkfs** - formatting and partitioning
//!
//! # Example
//!
//! ```ignore
//! let mut fs = FatFs::new(FsConfig::default());
//! let pd = fs.add_device(RamDisk::new(512, 4096));
//! fs.add_drive(pd, 0)?;
//! fs.mkfs("0:", &MkfsOptions::default())?;
//! fs.mount("0:", true)?;
//! let mut f = fs.open("0:/hello.txt", OpenMode::WRITE | OpenMode::CREATE_NEW)?;
//! f.write(b"hello")?;
//! f.close()?;
//! ```

#![cfg_attr(not(test), no_std)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]

extern crate alloc;

mod block;
mod chain;
mod codec;
mod config;
mod dir;
mod dir_handle;
mod error;
mod exfat;
mod file;
mod flags;
mod fs;
mod layout;
mod lfn;
mod lock;
mod mkfs;
mod mount;
mod name;
mod ops;
mod path;
mod strio;
mod table;
mod time;
mod unicode;
mod volume;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
mod testutil;

pub use block::{BlockDevice, DiskError, DiskStatus, IoctlCmd, RamDisk};
pub use config::FsConfig;
pub use dir::FileInfo;
pub use dir_handle::Dir;
pub use error::{FsError, FsResult};
pub use file::File;
pub use flags::{FileAttr, OpenMode};
pub use fs::FatFs;
pub use mkfs::{fdisk, mkfs, MkfsFormat, MkfsOptions};
pub use time::{FatTime, FixedClock, TimeSource};
pub use volume::{Device, FatType};
