//! Helpers shared by the unit tests

use crate::block::RamDisk;
use crate::config::FsConfig;
use crate::error::FsResult;
use crate::fs::FatFs;
use crate::mkfs::{MkfsFormat, MkfsOptions};
use crate::volume::FatVolume;

/// Format a RAM disk of `sectors` sectors as a super-floppy volume and
/// mount it as drive 0
///
/// The returned disk shares its storage with the mounted device.
pub(crate) fn format_ram(ss: u16, sectors: u64, fmt: MkfsFormat, au: u32) -> (FatFs, RamDisk) {
    let disk = RamDisk::new(ss, sectors);
    let mut fs = FatFs::new(FsConfig::default());
    let pd = fs.add_device(disk.clone());
    fs.add_drive(pd, 0).unwrap();
    let opts = MkfsOptions { fmt: fmt | MkfsFormat::SFD, au_size: au, ..MkfsOptions::default() };
    fs.mkfs("0:", &opts).unwrap();
    fs.mount("0:", true).unwrap();
    (fs, disk)
}

/// Run `f` on the mounted volume of drive 0
pub(crate) fn with_test_volume<R>(fs: &FatFs, f: impl FnOnce(&mut FatVolume) -> FsResult<R>) -> R {
    fs.with_drive(0, false, f).unwrap()
}
