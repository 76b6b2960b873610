//! Line and formatted text I/O on open files
//!
//! Text is UTF-8 on disk. Lines end at `'\n'`; no CR/LF translation is done.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::error::{FsError, FsResult};
use crate::file::File;

/// `fmt::Write` sink that remembers the first file error
struct Sink<'f, 'a> {
    file: &'f mut File<'a>,
    written: usize,
    err: Option<FsError>,
}

impl fmt::Write for Sink<'_, '_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        match self.file.puts(s) {
            Ok(n) => {
                self.written += n;
                Ok(())
            }
            Err(e) => {
                self.err = Some(e);
                Err(fmt::Error)
            }
        }
    }
}

impl File<'_> {
    /// Read one line of at most `max` bytes, keeping the `'\n'`
    ///
    /// Returns `None` at the end of the file. Invalid UTF-8 is replaced.
    pub fn gets(&mut self, max: usize) -> FsResult<Option<String>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while line.len() < max {
            if self.read(&mut byte)? == 0 {
                break;
            }
            line.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
        }
        if line.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    pub fn putc(&mut self, c: char) -> FsResult<()> {
        let mut enc = [0u8; 4];
        self.puts(c.encode_utf8(&mut enc)).map(|_| ())
    }

    /// Write `s` and return the number of bytes written
    ///
    /// A short write (volume full) is reported as `Denied`.
    pub fn puts(&mut self, s: &str) -> FsResult<usize> {
        let n = self.write(s.as_bytes())?;
        if n < s.len() {
            log::debug!("[FF] puts: short write {} of {} bytes", n, s.len());
            return Err(FsError::Denied);
        }
        Ok(n)
    }

    /// Write formatted text, e.g. `f.printf(format_args!("{}: {}\n", k, v))`
    pub fn printf(&mut self, args: fmt::Arguments<'_>) -> FsResult<usize> {
        let mut sink = Sink { file: self, written: 0, err: None };
        match fmt::write(&mut sink, args) {
            Ok(()) => Ok(sink.written),
            Err(_) => Err(sink.err.unwrap_or(FsError::IntErr)),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::FsError;
    use crate::flags::OpenMode;
    use crate::mkfs::MkfsFormat;
    use crate::testutil::format_ram;

    #[test]
    fn test_puts_and_gets() {
        let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 512);
        let mut f = fs.open("/log.txt", OpenMode::WRITE | OpenMode::CREATE_ALWAYS).unwrap();
        assert_eq!(f.puts("first line\n").unwrap(), 11);
        f.putc('é').unwrap();
        f.putc('\n').unwrap();
        let n = f.printf(format_args!("{}={:04}\n", "count", 42)).unwrap();
        assert_eq!(n, 11);
        f.puts("no newline").unwrap();
        f.close().unwrap();

        let mut f = fs.open("/log.txt", OpenMode::READ).unwrap();
        assert_eq!(f.gets(128).unwrap().as_deref(), Some("first line\n"));
        assert_eq!(f.gets(128).unwrap().as_deref(), Some("é\n"));
        assert_eq!(f.gets(128).unwrap().as_deref(), Some("count=0042\n"));
        // Line longer than the limit is split
        assert_eq!(f.gets(3).unwrap().as_deref(), Some("no "));
        assert_eq!(f.gets(128).unwrap().as_deref(), Some("newline"));
        assert_eq!(f.gets(128).unwrap(), None);
    }

    #[test]
    fn test_puts_on_read_only_handle() {
        let (fs, _disk) = format_ram(512, 2048, MkfsFormat::FAT, 512);
        fs.open("/r.txt", OpenMode::WRITE | OpenMode::CREATE_NEW).unwrap().close().unwrap();
        let mut f = fs.open("/r.txt", OpenMode::READ).unwrap();
        assert_eq!(f.puts("x"), Err(FsError::Denied));
        assert_eq!(f.printf(format_args!("{}", 1)), Err(FsError::Denied));
    }
}
