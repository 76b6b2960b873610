//! Open object lock table
//!
//! Each mounted volume keeps a small table of the objects that are open.
//! An object is identified by the start cluster of its directory and the
//! offset of its entry. Readers share a slot; a writer holds it exclusively.
//!
//! # Rules
//! - Any number of readers, or exactly one writer
//! - An open object can be neither removed nor renamed
//! - A full table refuses new opens with `TooManyOpenFiles`

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{FsError, FsResult};

/// Counter value of a slot held by a writer
const WRITE_HELD: u16 = 0x100;

/// Kind of access checked against the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockAccess {
    Read,
    Write,
    /// Remove or rename: only needs the object to be closed
    Modify,
}

#[derive(Debug, Clone, Copy, Default)]
struct LockSlot {
    used: bool,
    clu: u32,
    ofs: u32,
    ctr: u16,
}

/// Per-volume table of open objects
#[derive(Debug, Clone)]
pub(crate) struct LockTable {
    slots: Vec<LockSlot>,
}

impl LockTable {
    pub fn new(slots: usize) -> Self {
        Self { slots: vec![LockSlot::default(); slots] }
    }

    /// Whether locking is enabled at all
    pub fn enabled(&self) -> bool {
        !self.slots.is_empty()
    }

    fn find(&self, clu: u32, ofs: u32) -> Option<usize> {
        self.slots.iter().position(|s| s.used && s.clu == clu && s.ofs == ofs)
    }

    /// Check whether the object may be accessed as requested
    pub fn check(&self, clu: u32, ofs: u32, acc: LockAccess) -> FsResult<()> {
        if !self.enabled() {
            return Ok(());
        }
        match self.find(clu, ofs) {
            Some(i) => {
                if acc != LockAccess::Read || self.slots[i].ctr == WRITE_HELD {
                    Err(FsError::Locked)
                } else {
                    Ok(())
                }
            }
            None if acc != LockAccess::Modify && !self.has_free_slot() => Err(FsError::TooManyOpenFiles),
            None => Ok(()),
        }
    }

    /// Whether a new object can be registered
    pub fn has_free_slot(&self) -> bool {
        self.slots.iter().any(|s| !s.used)
    }

    /// Register an access and return its lock id (slot index + 1)
    ///
    /// Returns `None` if the object is already open in a conflicting mode or
    /// the table is full.
    pub fn acquire(&mut self, clu: u32, ofs: u32, write: bool) -> Option<usize> {
        if !self.enabled() {
            return Some(0);
        }
        let i = match self.find(clu, ofs) {
            Some(i) => i,
            None => {
                let i = self.slots.iter().position(|s| !s.used)?;
                self.slots[i] = LockSlot { used: true, clu, ofs, ctr: 0 };
                i
            }
        };
        let slot = &mut self.slots[i];
        if write && slot.ctr != 0 {
            return None;
        }
        if slot.ctr == WRITE_HELD {
            return None;
        }
        slot.ctr = if write { WRITE_HELD } else { slot.ctr + 1 };
        Some(i + 1)
    }

    /// Release an access registered by [`acquire`](Self::acquire)
    pub fn release(&mut self, lockid: usize) -> FsResult<()> {
        if !self.enabled() {
            return Ok(());
        }
        let slot = lockid
            .checked_sub(1)
            .and_then(|i| self.slots.get_mut(i))
            .ok_or(FsError::IntErr)?;
        if !slot.used {
            return Err(FsError::IntErr);
        }
        slot.ctr = match slot.ctr {
            WRITE_HELD => 0,
            0 => 0,
            n => n - 1,
        };
        if slot.ctr == 0 {
            *slot = LockSlot::default();
        }
        Ok(())
    }

    /// Drop every entry (on unmount or remount)
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = LockSlot::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_use(t: &LockTable) -> usize {
        t.slots.iter().filter(|s| s.used).count()
    }

    #[test]
    fn test_readers_share_writer_excludes() {
        let mut t = LockTable::new(4);
        let r1 = t.acquire(0, 64, false).unwrap();
        let r2 = t.acquire(0, 64, false).unwrap();
        assert_eq!(r1, r2);
        assert_eq!(t.check(0, 64, LockAccess::Read), Ok(()));
        assert_eq!(t.check(0, 64, LockAccess::Write), Err(FsError::Locked));
        assert!(t.acquire(0, 64, true).is_none());
        t.release(r1).unwrap();
        t.release(r2).unwrap();
        assert_eq!(in_use(&t), 0);

        let w = t.acquire(0, 64, true).unwrap();
        assert_eq!(t.check(0, 64, LockAccess::Read), Err(FsError::Locked));
        assert_eq!(t.check(0, 64, LockAccess::Modify), Err(FsError::Locked));
        t.release(w).unwrap();
        assert_eq!(t.check(0, 64, LockAccess::Modify), Ok(()));
    }

    #[test]
    fn test_full_table() {
        let mut t = LockTable::new(2);
        t.acquire(5, 0, false).unwrap();
        t.acquire(5, 32, false).unwrap();
        assert_eq!(t.check(5, 64, LockAccess::Read), Err(FsError::TooManyOpenFiles));
        assert_eq!(t.check(5, 64, LockAccess::Modify), Ok(()));
        assert!(t.acquire(5, 64, false).is_none());
        t.clear();
        assert_eq!(in_use(&t), 0);
    }

    #[test]
    fn test_disabled_table_allows_everything() {
        let mut t = LockTable::new(0);
        assert_eq!(t.acquire(1, 0, true), Some(0));
        assert_eq!(t.acquire(1, 0, true), Some(0));
        assert_eq!(t.check(1, 0, LockAccess::Write), Ok(()));
        assert_eq!(t.release(0), Ok(()));
        assert_eq!(in_use(&t), 0);
    }
}
