//! Timestamps
//!
//! FAT stores local time packed into 32 bits:
//! - bits 31-25: year since 1980
//! - bits 24-21: month (1-12)
//! - bits 20-16: day (1-31)
//! - bits 15-11: hour
//! - bits 10-5: minute
//! - bits 4-0: second / 2

/// Source of the current time for new and modified entries
pub trait TimeSource {
    /// Current time as a packed FAT timestamp
    fn fattime(&self) -> u32;
}

/// Broken-down FAT timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl FatTime {
    pub const fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        Self { year, month, day, hour, minute, second }
    }

    /// Pack into the on-disk representation
    pub fn pack(&self) -> u32 {
        let year = self.year.clamp(1980, 2107) as u32 - 1980;
        (year << 25)
            | ((self.month as u32 & 0x0F) << 21)
            | ((self.day as u32 & 0x1F) << 16)
            | ((self.hour as u32 & 0x1F) << 11)
            | ((self.minute as u32 & 0x3F) << 5)
            | ((self.second as u32 / 2) & 0x1F)
    }

    /// Unpack from the on-disk representation
    pub fn unpack(tm: u32) -> Self {
        Self {
            year: 1980 + (tm >> 25) as u16,
            month: ((tm >> 21) & 0x0F) as u8,
            day: ((tm >> 16) & 0x1F) as u8,
            hour: ((tm >> 11) & 0x1F) as u8,
            minute: ((tm >> 5) & 0x3F) as u8,
            second: ((tm & 0x1F) * 2) as u8,
        }
    }
}

/// Clock that always reports the same instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub FatTime);

impl Default for FixedClock {
    fn default() -> Self {
        FixedClock(FatTime::new(2024, 1, 1, 0, 0, 0))
    }
}

impl TimeSource for FixedClock {
    fn fattime(&self) -> u32 {
        self.0.pack()
    }
}
