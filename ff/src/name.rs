//! Path segment names
//!
//! Converts one path segment into the two on-disk name forms: the UTF-16
//! long name and the space padded 8.3 short name with its status flags.
//! Also generates numbered short names and matches wildcard patterns.

use alloc::vec::Vec;

use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::flags::NameFlags;
use crate::layout::{DDEM, RDDEM};
use crate::unicode::{dbc_1st, dbc_2nd, oem_toupper, uni2oem, wtoupper};

/// Index of the status byte following the 11 short name bytes
pub(crate) const NSFLAG: usize = 11;

/// Maximum wildcard terms in a pattern
const FIND_RECURS: u32 = 4;

#[inline]
pub(crate) fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

#[inline]
fn is_terminator(c: char) -> bool {
    (c as u32) < 0x20
}

/// Created name of one path segment
#[derive(Debug, Clone)]
pub(crate) struct SegmentName {
    /// Short name in directory form plus the status byte
    pub sfn: [u8; 12],
    /// Long name (empty without LFN support)
    pub lfn: Vec<u16>,
}

impl Default for SegmentName {
    fn default() -> Self {
        Self { sfn: [b' '; 12], lfn: Vec::new() }
    }
}

impl SegmentName {
    pub fn flags(&self) -> NameFlags {
        NameFlags::from_bits_retain(self.sfn[NSFLAG])
    }

    pub fn set_flags(&mut self, f: NameFlags) {
        self.sfn[NSFLAG] = f.bits();
    }
}

/// Split the leading segment off `path` and build its name forms
///
/// Returns the remainder of the path following the segment and its separators.
pub(crate) fn create_name<'p>(name: &mut SegmentName, path: &'p str, cfg: &FsConfig) -> FsResult<&'p str> {
    if cfg.use_lfn {
        create_name_lfn(name, path, cfg)
    } else {
        create_name_sfn(name, path, cfg)
    }
}

fn create_name_lfn<'p>(name: &mut SegmentName, path: &'p str, cfg: &FsConfig) -> FsResult<&'p str> {
    let lfn = &mut name.lfn;
    lfn.clear();

    // Collect the long name up to a separator or the end of the path
    let mut rest: &'p str;
    let mut stopped_at_sep = false;
    let mut chars = path.char_indices();
    loop {
        let (pos, c) = match chars.next() {
            Some(v) => v,
            None => {
                rest = "";
                break;
            }
        };
        if is_terminator(c) {
            rest = "";
            break;
        }
        if is_separator(c) {
            rest = &path[pos..];
            stopped_at_sep = true;
            break;
        }
        if (c as u32) < 0x80 && "*:<>|\"?\x7F".contains(c) {
            return Err(FsError::InvalidName);
        }
        let mut units = [0u16; 2];
        let enc = c.encode_utf16(&mut units);
        if lfn.len() + enc.len() > cfg.max_lfn {
            return Err(FsError::InvalidName);
        }
        lfn.extend_from_slice(enc);
    }

    let mut cf = NameFlags::empty();
    if stopped_at_sep {
        rest = rest.trim_start_matches(is_separator);
        if rest.chars().next().map_or(true, is_terminator) {
            cf |= NameFlags::LAST;
        }
    } else {
        cf |= NameFlags::LAST;
    }

    let dot = u16::from(b'.');
    let space = u16::from(b' ');

    // Dot entries
    let di = lfn.len();
    if (di == 1 && lfn[0] == dot) || (di == 2 && lfn[0] == dot && lfn[1] == dot) {
        for i in 0..11 {
            name.sfn[i] = if i < di { b'.' } else { b' ' };
        }
        name.set_flags(cf | NameFlags::DOT);
        return Ok(rest);
    }

    // Snip trailing spaces and dots
    while let Some(&wc) = lfn.last() {
        if wc != space && wc != dot {
            break;
        }
        lfn.pop();
    }
    if lfn.is_empty() {
        return Err(FsError::InvalidName);
    }
    let lfn = &name.lfn;

    // Create the short name
    let mut si = 0usize;
    while si < lfn.len() && lfn[si] == space {
        si += 1;
    }
    if si > 0 || lfn[si] == dot {
        cf |= NameFlags::LOSS | NameFlags::LFN;
    }
    let mut di = lfn.len();
    while di > 0 && lfn[di - 1] != dot {
        di -= 1;
    }

    let sfn = &mut name.sfn;
    sfn[..11].fill(b' ');
    let mut i = 0usize;
    let mut ni = 8usize;
    let mut b = 0u8;
    loop {
        if si >= lfn.len() {
            break;
        }
        let mut wc = lfn[si] as u32;
        si += 1;
        if wc == space as u32 || (wc == dot as u32 && si != di) {
            // Embedded spaces and dots are dropped
            cf |= NameFlags::LOSS | NameFlags::LFN;
            continue;
        }
        if i >= ni || si == di {
            if ni == 11 {
                cf |= NameFlags::LOSS | NameFlags::LFN;
                break;
            }
            if si != di {
                cf |= NameFlags::LOSS | NameFlags::LFN;
            }
            if si > di {
                break;
            }
            si = di;
            i = 8;
            ni = 11;
            b <<= 2;
            continue;
        }
        if wc >= 0x80 {
            cf |= NameFlags::LFN;
            wc = match wc {
                0xD800..=0xDFFF => 0,
                _ => uni2oem(wtoupper(wc), cfg.code_page) as u32,
            };
        }
        if wc == 0 || (wc < 0x80 && "+,;=[]".contains(wc as u8 as char)) {
            wc = u32::from(b'_');
            cf |= NameFlags::LOSS | NameFlags::LFN;
        } else if wc < 0x80 {
            let c = wc as u8;
            if c.is_ascii_uppercase() {
                b |= 2;
            }
            if c.is_ascii_lowercase() {
                b |= 1;
                wc -= 0x20;
            }
        }
        sfn[i] = wc as u8;
        i += 1;
    }

    if sfn[0] == DDEM {
        sfn[0] = RDDEM;
    }

    if ni == 8 {
        b <<= 2;
    }
    if (b & 0x0C) == 0x0C || (b & 0x03) == 0x03 {
        cf |= NameFlags::LFN;
    }
    if !cf.contains(NameFlags::LOSS) {
        if b & 0x01 != 0 {
            cf |= NameFlags::EXT;
        }
        if b & 0x04 != 0 {
            cf |= NameFlags::BODY;
        }
    }
    name.set_flags(cf);
    Ok(rest)
}

fn create_name_sfn<'p>(name: &mut SegmentName, path: &'p str, cfg: &FsConfig) -> FsResult<&'p str> {
    let cp = cfg.code_page;
    name.lfn.clear();
    let sfn = &mut name.sfn;
    sfn[..11].fill(b' ');

    // Translate the segment into OEM bytes first
    let mut end = path.len();
    let mut bytes: Vec<u8> = Vec::new();
    for (pos, c) in path.char_indices() {
        if is_terminator(c) || is_separator(c) {
            end = pos;
            break;
        }
        let oem = uni2oem(c as u32, cp);
        if oem == 0 {
            return Err(FsError::InvalidName);
        }
        if oem >= 0x100 {
            bytes.push((oem >> 8) as u8);
        }
        bytes.push(oem as u8);
    }
    let mut rest = path[end..].trim_start_matches(is_separator);
    let last = rest.chars().next().map_or(true, is_terminator);
    if last {
        rest = "";
    }

    // Dot entries
    if bytes.first() == Some(&b'.') {
        if bytes.len() > 2 || bytes.iter().any(|&c| c != b'.') {
            return Err(FsError::InvalidName);
        }
        sfn[..bytes.len()].copy_from_slice(&bytes);
        let f = if last { NameFlags::LAST | NameFlags::DOT } else { NameFlags::DOT };
        name.set_flags(f);
        return Ok(rest);
    }

    let mut i = 0usize;
    let mut ni = 8usize;
    let mut si = 0usize;
    while si < bytes.len() {
        let mut c = bytes[si];
        si += 1;
        if c == b'.' || i >= ni {
            if ni == 11 || c != b'.' {
                return Err(FsError::InvalidName);
            }
            i = 8;
            ni = 11;
            continue;
        }
        if dbc_1st(cp, c) {
            let d = match bytes.get(si) {
                Some(&d) => d,
                None => return Err(FsError::InvalidName),
            };
            si += 1;
            if !dbc_2nd(cp, d) || i >= ni - 1 {
                return Err(FsError::InvalidName);
            }
            sfn[i] = c;
            sfn[i + 1] = d;
            i += 2;
        } else {
            if b"*+,:;<=>[]|\"?\x7F".contains(&c) {
                return Err(FsError::InvalidName);
            }
            if c >= 0x80 {
                c = oem_toupper(c, cp);
            }
            sfn[i] = c.to_ascii_uppercase();
            i += 1;
        }
    }
    if i == 0 {
        return Err(FsError::InvalidName);
    }
    if sfn[0] == DDEM {
        sfn[0] = RDDEM;
    }
    name.set_flags(if last { NameFlags::LAST } else { NameFlags::empty() });
    Ok(rest)
}

// ============================================================================
// Short Name Helpers
// ============================================================================

/// Checksum of a short name, stored in every LFN entry of the set
pub(crate) fn sum_sfn(sfn: &[u8]) -> u8 {
    sfn[..11]
        .iter()
        .fold(0u8, |sum, &b| (sum >> 1).wrapping_add(sum << 7).wrapping_add(b))
}

/// Build a numbered short name (`NAME~N`) from `src`
///
/// After five collisions the number is replaced by a hash of the long name.
pub(crate) fn gen_numname(dst: &mut [u8], src: &[u8], lfn: &[u16], seq: u32, cp: u16) {
    dst[..11].copy_from_slice(&src[..11]);
    let mut seq = seq;
    if seq > 5 {
        let mut sreg = seq;
        for &unit in lfn {
            let mut wc = unit;
            for _ in 0..16 {
                sreg = (sreg << 1) + (wc & 1) as u32;
                wc >>= 1;
                if sreg & 0x10000 != 0 {
                    sreg ^= 0x11021;
                }
            }
        }
        seq = sreg;
    }

    let mut ns = [0u8; 8];
    let mut i = 7usize;
    loop {
        let mut c = (seq % 16) as u8 + b'0';
        seq /= 16;
        if c > b'9' {
            c += 7;
        }
        ns[i] = c;
        i -= 1;
        if i == 0 || seq == 0 {
            break;
        }
    }
    ns[i] = b'~';

    let mut j = 0usize;
    while j < i && dst[j] != b' ' {
        if dbc_1st(cp, dst[j]) {
            if j == i - 1 {
                break;
            }
            j += 1;
        }
        j += 1;
    }
    loop {
        dst[j] = if i < 8 {
            let c = ns[i];
            i += 1;
            c
        } else {
            b' '
        };
        j += 1;
        if j >= 8 {
            break;
        }
    }
}

// ============================================================================
// Pattern Matching
// ============================================================================

/// Upper-cased code points of a name for pattern matching
pub(crate) fn match_chars(s: &str) -> Vec<u32> {
    s.chars().map(|c| wtoupper(c as u32)).collect()
}

#[inline]
fn at(s: &[u32], i: usize) -> u32 {
    s.get(i).copied().unwrap_or(0)
}

/// Match `nam` against a pattern of literal characters, `?` and `*`
pub(crate) fn pattern_match(pat: &[u32], nam: &[u32]) -> bool {
    matches_from(pat, 0, nam, 0, 0, FIND_RECURS)
}

fn matches_from(pat: &[u32], pat0: usize, nam: &[u32], nam0: usize, skip: u32, recur: u32) -> bool {
    let (q, a) = (u32::from(b'?'), u32::from(b'*'));
    let mut nam0 = nam0;
    let mut skip = skip;
    while skip & 0xFF != 0 {
        if at(nam, nam0) == 0 {
            return false;
        }
        nam0 += 1;
        skip -= 1;
    }
    if at(pat, pat0) == 0 && skip != 0 {
        return true;
    }

    loop {
        let mut pp = pat0;
        let mut np = nam0;
        let nchr;
        loop {
            let pc = at(pat, pp);
            if pc == q || pc == a {
                if recur == 0 {
                    return false;
                }
                let mut sk = 0u32;
                loop {
                    if at(pat, pp) == q {
                        sk += 1;
                    } else {
                        sk |= 0x100;
                    }
                    pp += 1;
                    let c = at(pat, pp);
                    if c != q && c != a {
                        break;
                    }
                }
                if matches_from(pat, pp, nam, np, sk, recur - 1) {
                    return true;
                }
                nchr = at(nam, np);
                break;
            }
            let pchr = at(pat, pp);
            let n = at(nam, np);
            pp += 1;
            np += 1;
            if pchr != n {
                nchr = n;
                break;
            }
            if pchr == 0 {
                return true;
            }
        }
        nam0 += 1;
        if !(skip != 0 && nchr != 0) {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_of(path: &str) -> (SegmentName, FsResult<&str>) {
        let mut n = SegmentName::default();
        let r = create_name(&mut n, path, &FsConfig::default());
        (n, r)
    }

    #[test]
    fn test_plain_83_name() {
        let (n, rest) = name_of("README.TXT");
        assert_eq!(rest, Ok(""));
        assert_eq!(&n.sfn[..11], b"README  TXT");
        assert!(n.flags().contains(NameFlags::LAST));
        assert!(!n.flags().contains(NameFlags::LFN));
    }

    #[test]
    fn test_lower_case_sets_nt_flags() {
        let (n, _) = name_of("readme.txt");
        assert_eq!(&n.sfn[..11], b"README  TXT");
        assert!(n.flags().contains(NameFlags::BODY | NameFlags::EXT));
        assert!(!n.flags().contains(NameFlags::LFN));

        let (n, _) = name_of("ReadMe.txt");
        assert!(n.flags().contains(NameFlags::LFN));
    }

    #[test]
    fn test_long_name_is_lossy() {
        let (n, rest) = name_of("a long file name.html/next");
        assert_eq!(rest, Ok("next"));
        assert_eq!(&n.sfn[..11], b"ALONGFILHTM");
        assert!(n.flags().contains(NameFlags::LOSS | NameFlags::LFN));
        assert!(!n.flags().contains(NameFlags::LAST));
        assert_eq!(n.lfn.len(), "a long file name.html".len());
    }

    #[test]
    fn test_extended_chars_and_replacements() {
        let (n, _) = name_of("Ångström.txt");
        assert_eq!(n.sfn[0], 0x8F);
        assert!(n.flags().contains(NameFlags::LFN));
        let (n, _) = name_of("a+b.txt");
        assert_eq!(&n.sfn[..3], b"A_B");
        assert!(n.flags().contains(NameFlags::LOSS));
    }

    #[test]
    fn test_invalid_names() {
        assert_eq!(name_of("bad*name").1, Err(FsError::InvalidName));
        assert_eq!(name_of("...").1, Err(FsError::InvalidName));
        assert_eq!(name_of("   ").1, Err(FsError::InvalidName));
        let long: alloc::string::String = core::iter::repeat('x').take(256).collect();
        assert_eq!(name_of(&long).1, Err(FsError::InvalidName));
    }

    #[test]
    fn test_dot_entries_and_trailing_separator() {
        let (n, rest) = name_of("..//x");
        assert_eq!(rest, Ok("x"));
        assert_eq!(&n.sfn[..11], b"..         ");
        assert!(n.flags().contains(NameFlags::DOT));
        let (n, rest) = name_of("dir/");
        assert_eq!(rest, Ok(""));
        assert!(n.flags().contains(NameFlags::LAST));
    }

    #[test]
    fn test_sfn_only_mode() {
        let cfg = FsConfig { use_lfn: false, ..FsConfig::default() };
        let mut n = SegmentName::default();
        assert_eq!(create_name(&mut n, "file.txt", &cfg), Ok(""));
        assert_eq!(&n.sfn[..11], b"FILE    TXT");
        assert_eq!(create_name(&mut n, "toolongname.txt", &cfg), Err(FsError::InvalidName));
        assert_eq!(create_name(&mut n, "a+b", &cfg), Err(FsError::InvalidName));
        assert_eq!(create_name(&mut n, "a.b.c", &cfg), Err(FsError::InvalidName));
    }

    #[test]
    fn test_numbered_names() {
        let mut dst = [0u8; 11];
        let lfn: Vec<u16> = "a long name.txt".encode_utf16().collect();
        gen_numname(&mut dst, b"ALONGNAMTXT", &lfn, 1, 437);
        assert_eq!(&dst, b"ALONGN~1TXT");
        gen_numname(&mut dst, b"AB      TXT", &lfn, 3, 437);
        assert_eq!(&dst, b"AB~3    TXT");
        // Past five collisions the number becomes a CRC-16 hash of the long name
        gen_numname(&mut dst, b"ALONGNAMTXT", &lfn, 6, 437);
        assert_eq!(&dst, b"ALO~6CB2TXT");
    }

    #[test]
    fn test_sfn_checksum() {
        // Checksum of "FILE    TXT" computed by hand with the rotate-add rule
        let mut sum = 0u8;
        for &b in b"FILE    TXT" {
            sum = (((sum & 1) << 7) | (sum >> 1)).wrapping_add(b);
        }
        assert_eq!(sum_sfn(b"FILE    TXT"), sum);
    }

    #[test]
    fn test_pattern_match() {
        let m = |p: &str, n: &str| pattern_match(&match_chars(p), &match_chars(n));
        assert!(m("*.txt", "readme.TXT"));
        assert!(m("*", "anything"));
        assert!(m("r?adme.*", "README.md"));
        assert!(!m("*.txt", "readme.md"));
        assert!(!m("??", "abc"));
        assert!(m("a*b*c", "aXXbYYc"));
        assert!(m("*.*", "a.b"));
    }
}
