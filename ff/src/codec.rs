//! Little-endian field access on byte buffers
//!
//! All on-disk structures are little-endian and unaligned, so every field
//! access goes through these helpers instead of casting into packed structs.

#[inline]
pub fn ld_word(b: &[u8], ofs: usize) -> u16 {
    u16::from_le_bytes([b[ofs], b[ofs + 1]])
}

#[inline]
pub fn ld_dword(b: &[u8], ofs: usize) -> u32 {
    u32::from_le_bytes([b[ofs], b[ofs + 1], b[ofs + 2], b[ofs + 3]])
}

#[inline]
pub fn ld_qword(b: &[u8], ofs: usize) -> u64 {
    let mut v = [0u8; 8];
    v.copy_from_slice(&b[ofs..ofs + 8]);
    u64::from_le_bytes(v)
}

#[inline]
pub fn st_word(b: &mut [u8], ofs: usize, val: u16) {
    b[ofs..ofs + 2].copy_from_slice(&val.to_le_bytes());
}

#[inline]
pub fn st_dword(b: &mut [u8], ofs: usize, val: u32) {
    b[ofs..ofs + 4].copy_from_slice(&val.to_le_bytes());
}

#[inline]
pub fn st_qword(b: &mut [u8], ofs: usize, val: u64) {
    b[ofs..ofs + 8].copy_from_slice(&val.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unaligned_fields() {
        let mut buf = [0u8; 16];
        st_word(&mut buf, 1, 0xAA55);
        st_dword(&mut buf, 3, 0x4161_5252);
        st_qword(&mut buf, 7, 0x0102_0304_0506_0708);
        assert_eq!(buf[1], 0x55);
        assert_eq!(buf[2], 0xAA);
        assert_eq!(ld_word(&buf, 1), 0xAA55);
        assert_eq!(ld_dword(&buf, 3), 0x4161_5252);
        assert_eq!(ld_qword(&buf, 7), 0x0102_0304_0506_0708);
    }
}
