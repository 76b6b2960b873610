//! End-to-end behavior across modules

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::block::RamDisk;
use crate::config::FsConfig;
use crate::error::FsError;
use crate::flags::{FileAttr, OpenMode};
use crate::fs::FatFs;
use crate::mkfs::{MkfsFormat, MkfsOptions};
use crate::testutil::{format_ram, with_test_volume};

fn write_file(fs: &FatFs, path: &str, data: &[u8]) {
    let mut f = fs.open(path, OpenMode::WRITE | OpenMode::CREATE_ALWAYS).unwrap();
    assert_eq!(f.write(data).unwrap(), data.len());
    f.close().unwrap();
}

fn read_file(fs: &FatFs, path: &str) -> Vec<u8> {
    let mut f = fs.open(path, OpenMode::READ).unwrap();
    let mut out = vec![0u8; f.size() as usize];
    assert_eq!(f.read(&mut out).unwrap(), out.len());
    out
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn test_fat32_create_survives_remount() {
    let (fs, _disk) = format_ram(512, 100_000, MkfsFormat::FAT32, 4096);
    fs.mkdir("/a").unwrap();
    let mut f = fs.open("/a/f.txt", OpenMode::CREATE_NEW | OpenMode::WRITE).unwrap();
    assert_eq!(f.write(b"hello").unwrap(), 5);
    f.close().unwrap();

    fs.unmount("0:").unwrap();
    fs.mount("0:", true).unwrap();
    let info = fs.stat("/a/f.txt").unwrap();
    assert_eq!(info.size, 5);
    assert!(info.attr.contains(FileAttr::ARC));
    assert_eq!(read_file(&fs, "/a/f.txt"), b"hello");
}

#[test]
fn test_readers_exclude_writer() {
    let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 512);
    write_file(&fs, "/shared.dat", b"data");
    let r1 = fs.open("/shared.dat", OpenMode::READ).unwrap();
    let r2 = fs.open("/shared.dat", OpenMode::READ).unwrap();
    assert_eq!(fs.open("/shared.dat", OpenMode::WRITE).err(), Some(FsError::Locked));
    r1.close().unwrap();
    assert_eq!(fs.open("/shared.dat", OpenMode::WRITE).err(), Some(FsError::Locked));
    r2.close().unwrap();
    let w = fs.open("/shared.dat", OpenMode::WRITE).unwrap();
    w.close().unwrap();
}

#[test]
fn test_failed_rename_leaves_source_alone() {
    let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 512);
    fs.mkdir("/a").unwrap();
    write_file(&fs, "/a/f.txt", b"payload");

    assert_eq!(fs.rename("/a/f.txt", "/b/g.txt"), Err(FsError::NoPath));
    fs.mkdir("/b").unwrap();
    write_file(&fs, "/b/g.txt", b"other");
    assert_eq!(fs.rename("/a/f.txt", "/b/g.txt"), Err(FsError::Exist));

    assert_eq!(read_file(&fs, "/a/f.txt"), b"payload");
    assert_eq!(read_file(&fs, "/b/g.txt"), b"other");
}

#[test]
fn test_round_trip_sizes() {
    for (fmt, sectors, au) in [(MkfsFormat::FAT, 16384, 4096), (MkfsFormat::EXFAT, 16384, 0)] {
        let (fs, _disk) = format_ram(512, sectors, fmt, au);
        let cl = with_test_volume(&fs, |vol| Ok(vol.cluster_bytes() as usize));
        for (i, len) in [0, 1, 512, cl, 3 * cl + 17].into_iter().enumerate() {
            let path = format!("/rt{}.bin", i);
            let data = pattern(len, i as u8);
            write_file(&fs, &path, &data);
            assert_eq!(read_file(&fs, &path), data, "{:?} length {}", fmt, len);
        }
    }
}

#[test]
fn test_chains_match_file_sizes() {
    for (fmt, au) in [(MkfsFormat::FAT, 4096), (MkfsFormat::EXFAT, 0)] {
        let (fs, _disk) = format_ram(512, 16384, fmt, au);
        let cl = with_test_volume(&fs, |vol| Ok(vol.cluster_bytes() as usize));
        // Interleave two files so that both chains become fragmented
        for round in 0..3 {
            for name in ["/x.bin", "/y.bin"] {
                let mut f = fs.open(name, OpenMode::WRITE | OpenMode::OPEN_APPEND).unwrap();
                f.write(&pattern(cl + round * 100, round as u8)).unwrap();
                f.close().unwrap();
            }
        }
        for name in ["/x.bin", "/y.bin"] {
            let f = fs.open(name, OpenMode::READ).unwrap();
            let obj = f.obj.clone();
            let expect = (f.size() as usize).div_ceil(cl);
            let visited = with_test_volume(&fs, |vol| {
                let mut seen = Vec::new();
                let mut c = obj.sclust;
                while c >= 2 && c < vol.n_fatent {
                    assert!(!seen.contains(&c), "cycle at cluster {}", c);
                    seen.push(c);
                    c = vol.get_fat(&obj, c)?;
                }
                assert_ne!(c, 0, "chain ends in a free entry");
                Ok(seen.len())
            });
            assert_eq!(visited, expect, "{:?} {}", fmt, name);
        }
    }
}

#[test]
fn test_extended_name_round_trip() {
    let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 512);
    write_file(&fs, "/Ångström.txt", b"x");
    let mut dir = fs.opendir("/").unwrap();
    let info = dir.read().unwrap().unwrap();
    assert_eq!(info.name, "Ångström.txt");
    assert_eq!(info.alt_name, "ÅNGSTRÖM.TXT");
    assert_eq!(fs.stat(&format!("/{}", info.alt_name)).unwrap().size, 1);

    // Without long names only the 8.3 form exists
    let disk = RamDisk::new(512, 2048);
    let mut fs = FatFs::new(FsConfig { use_lfn: false, exfat: false, ..FsConfig::default() });
    let pd = fs.add_device(disk);
    fs.add_drive(pd, 0).unwrap();
    let opts = MkfsOptions { fmt: MkfsFormat::FAT | MkfsFormat::SFD, ..MkfsOptions::default() };
    fs.mkfs("0:", &opts).unwrap();
    fs.mount("0:", true).unwrap();
    write_file(&fs, "/Ångström.txt", b"x");
    let mut dir = fs.opendir("/").unwrap();
    let name: String = dir.read().unwrap().unwrap().name;
    assert_eq!(name.to_uppercase(), "ÅNGSTRÖM.TXT");
}

#[test]
fn test_truncate_then_rewrite() {
    let (fs, _disk) = format_ram(512, 16384, MkfsFormat::FAT, 1024);
    let data = pattern(5000, 7);
    write_file(&fs, "/t.bin", &data);
    let before = fs.getfree("/").unwrap();

    let mut f = fs.open("/t.bin", OpenMode::READ | OpenMode::WRITE).unwrap();
    f.truncate().unwrap();
    assert_eq!(f.size(), 0);
    f.close().unwrap();
    assert_eq!(fs.getfree("/").unwrap(), before + 5);

    let mut f = fs.open("/t.bin", OpenMode::WRITE).unwrap();
    f.write(&data).unwrap();
    f.close().unwrap();
    assert_eq!(read_file(&fs, "/t.bin"), data);
    assert_eq!(fs.getfree("/").unwrap(), before);
}
