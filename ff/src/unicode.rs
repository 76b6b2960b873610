//! Character set support
//!
//! Short names are stored in an OEM code page, long names in UTF-16.
//! Code page 437 is converted through a table; other code pages only
//! pass 7-bit ASCII. DBCS lead/trail classification is provided for the
//! double-byte code pages so short names are never split mid-character.

/// CP437 extended characters 0x80..=0xFF as Unicode
static CP437: [u16; 128] = [
    0x00C7, 0x00FC, 0x00E9, 0x00E2, 0x00E4, 0x00E0, 0x00E5, 0x00E7,
    0x00EA, 0x00EB, 0x00E8, 0x00EF, 0x00EE, 0x00EC, 0x00C4, 0x00C5,
    0x00C9, 0x00E6, 0x00C6, 0x00F4, 0x00F6, 0x00F2, 0x00FB, 0x00F9,
    0x00FF, 0x00D6, 0x00DC, 0x00A2, 0x00A3, 0x00A5, 0x20A7, 0x0192,
    0x00E1, 0x00ED, 0x00F3, 0x00FA, 0x00F1, 0x00D1, 0x00AA, 0x00BA,
    0x00BF, 0x2310, 0x00AC, 0x00BD, 0x00BC, 0x00A1, 0x00AB, 0x00BB,
    0x2591, 0x2592, 0x2593, 0x2502, 0x2524, 0x2561, 0x2562, 0x2556,
    0x2555, 0x2563, 0x2551, 0x2557, 0x255D, 0x255C, 0x255B, 0x2510,
    0x2514, 0x2534, 0x252C, 0x251C, 0x2500, 0x253C, 0x255E, 0x255F,
    0x255A, 0x2554, 0x2569, 0x2566, 0x2560, 0x2550, 0x256C, 0x2567,
    0x2568, 0x2564, 0x2565, 0x2559, 0x2558, 0x2552, 0x2553, 0x256B,
    0x256A, 0x2518, 0x250C, 0x2588, 0x2584, 0x258C, 0x2590, 0x2580,
    0x03B1, 0x00DF, 0x0393, 0x03C0, 0x03A3, 0x03C3, 0x00B5, 0x03C4,
    0x03A6, 0x0398, 0x03A9, 0x03B4, 0x221E, 0x03C6, 0x03B5, 0x2229,
    0x2261, 0x00B1, 0x2265, 0x2264, 0x2320, 0x2321, 0x00F7, 0x2248,
    0x00B0, 0x2219, 0x00B7, 0x221A, 0x207F, 0x00B2, 0x25A0, 0x00A0,
];

/// DBCS code ranges: lead byte ranges then trail byte ranges
fn dbcs_ranges(cp: u16) -> Option<[u8; 10]> {
    match cp {
        932 => Some([0x81, 0x9F, 0xE0, 0xFC, 0x40, 0x7E, 0x80, 0xFC, 0x00, 0x00]),
        936 => Some([0x81, 0xFE, 0x00, 0x00, 0x40, 0x7E, 0x80, 0xFE, 0x00, 0x00]),
        949 => Some([0x81, 0xFE, 0x00, 0x00, 0x41, 0x5A, 0x61, 0x7A, 0x81, 0xFE]),
        950 => Some([0x81, 0xFE, 0x00, 0x00, 0x40, 0x7E, 0xA1, 0xFE, 0x00, 0x00]),
        _ => None,
    }
}

/// Test if the byte is a DBC lead byte
pub fn dbc_1st(cp: u16, c: u8) -> bool {
    match dbcs_ranges(cp) {
        Some(t) => (c >= t[0] && c <= t[1]) || (t[2] != 0 && c >= t[2] && c <= t[3]),
        None => false,
    }
}

/// Test if the byte is a DBC trail byte
pub fn dbc_2nd(cp: u16, c: u8) -> bool {
    match dbcs_ranges(cp) {
        Some(t) => {
            (c >= t[4] && c <= t[5])
                || (c >= t[6] && c <= t[7])
                || (t[8] != 0 && c >= t[8] && c <= t[9])
        }
        None => false,
    }
}

/// OEM code to Unicode (0 if no mapping)
pub fn oem2uni(oem: u16, cp: u16) -> u16 {
    if oem < 0x80 {
        return oem;
    }
    if cp == 437 && oem < 0x100 {
        return CP437[(oem - 0x80) as usize];
    }
    0
}

/// Unicode to OEM code (0 if no mapping)
pub fn uni2oem(uni: u32, cp: u16) -> u16 {
    if uni < 0x80 {
        return uni as u16;
    }
    if cp == 437 && uni < 0x10000 {
        if let Some(i) = CP437.iter().position(|&c| c as u32 == uni) {
            return 0x80 + i as u16;
        }
    }
    0
}

/// Simple (one to one) Unicode upper-case conversion
pub fn wtoupper(uni: u32) -> u32 {
    if uni < 0x80 {
        return (uni as u8).to_ascii_uppercase() as u32;
    }
    let c = match char::from_u32(uni) {
        Some(c) => c,
        None => return uni,
    };
    let mut up = c.to_uppercase();
    match (up.next(), up.next()) {
        (Some(u), None) => u as u32,
        _ => uni,
    }
}

/// Upper-case an extended OEM character of a single byte code page
pub fn oem_toupper(oem: u8, cp: u16) -> u8 {
    if oem < 0x80 {
        return oem.to_ascii_uppercase();
    }
    let uni = oem2uni(oem as u16, cp);
    if uni == 0 {
        return oem;
    }
    match uni2oem(wtoupper(uni as u32), cp) {
        0 => oem,
        c => c as u8,
    }
}

/// Decode UTF-16 code units into a string, replacing invalid sequences
pub fn utf16_to_string(units: &[u16]) -> alloc::string::String {
    char::decode_utf16(units.iter().copied())
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cp437_roundtrip() {
        assert_eq!(oem2uni(0x8F, 437), 0x00C5);
        assert_eq!(uni2oem(0x00C5, 437), 0x8F);
        assert_eq!(uni2oem(0x00F6, 437), 0x94);
        assert_eq!(uni2oem(0x4E00, 437), 0);
        assert_eq!(oem2uni(0x41, 850), 0x41);
        assert_eq!(oem2uni(0x8F, 850), 0);
    }

    #[test]
    fn test_upper_case() {
        assert_eq!(wtoupper('a' as u32), 'A' as u32);
        assert_eq!(wtoupper(0x00F6), 0x00D6);
        // 'ß' uppercases to "SS" which is not a single character
        assert_eq!(wtoupper(0x00DF), 0x00DF);
        assert_eq!(oem_toupper(0x94, 437), 0x99);
        assert_eq!(oem_toupper(0xB0, 437), 0xB0);
    }

    #[test]
    fn test_dbcs_classification() {
        assert!(dbc_1st(932, 0x81));
        assert!(dbc_1st(932, 0xE0));
        assert!(!dbc_1st(932, 0xA0));
        assert!(dbc_2nd(932, 0x40));
        assert!(dbc_2nd(949, 0x81));
        assert!(!dbc_1st(437, 0x81));
        assert!(dbcs_ranges(936).is_some());
    }
}
