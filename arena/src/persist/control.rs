//! The 4 KiB control block: which data file is live, and whether the
//! previous run shut down cleanly.

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs4::fs_std::FileExt;
use memmap2::MmapMut;

use crate::error::StoreError;

pub const CONTROL_SIZE: usize = 4096;
const MAGIC: u32 = 0xc0de_1ab1;

const OFF_MAGIC: usize = 0;
const OFF_IN_USE: usize = 4;
const OFF_DATA_USED: usize = 8;

#[inline]
fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

#[inline]
fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// A memory-mapped view of the control file. Holding one implies holding
/// an exclusive advisory lock on it, so two `Persist`s can never open the
/// same store at once.
#[derive(Debug)]
pub struct Control {
    map: MmapMut,
    _lock: File,
}

impl Control {
    /// Opens or creates the control file at `path`. Returns the control
    /// block plus whether `in_use` was still set on open (a crash during
    /// the previous run).
    pub fn open(path: &Path) -> Result<(Self, bool), StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(StoreError::Open)?;
        file.try_lock_exclusive().map_err(StoreError::Lock)?;
        let len = file.metadata().map_err(StoreError::Open)?.len();
        let fresh = len != CONTROL_SIZE as u64;
        file.set_len(CONTROL_SIZE as u64).map_err(StoreError::Resize)?;
        // Safety: `file` outlives `map` only for the duration of this scope;
        // the map is owned below and the file descriptor is reopened by the
        // OS handle, not held past this point.
        let mut map = unsafe { MmapMut::map_mut(&file).map_err(StoreError::Map)? };

        if fresh {
            write_u32(&mut map, OFF_MAGIC, MAGIC);
            write_u32(&mut map, OFF_IN_USE, 0);
            write_u32(&mut map, OFF_DATA_USED, 0);
            map.flush().map_err(StoreError::Sync)?;
        } else if read_u32(&map, OFF_MAGIC) != MAGIC {
            return Err(StoreError::BadControlBlock);
        }

        let crashed = read_u32(&map, OFF_IN_USE) != 0;
        Ok((Control { map, _lock: file }, crashed))
    }

    pub fn set_in_use(&mut self, v: bool) -> Result<(), StoreError> {
        write_u32(&mut self.map, OFF_IN_USE, v as u32);
        self.map.flush().map_err(StoreError::Sync)
    }

    pub fn data_used(&self) -> u32 {
        read_u32(&self.map, OFF_DATA_USED)
    }

    pub fn flip_data_used(&mut self) -> Result<(), StoreError> {
        let next = 1 - self.data_used();
        write_u32(&mut self.map, OFF_DATA_USED, next);
        self.map.flush().map_err(StoreError::Sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_control_starts_clean() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ctrl");
        let (ctrl, crashed) = Control::open(&path).unwrap();
        assert!(!crashed);
        assert_eq!(ctrl.data_used(), 0);
    }

    #[test]
    fn in_use_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ctrl");
        {
            let (mut ctrl, _) = Control::open(&path).unwrap();
            ctrl.set_in_use(true).unwrap();
        }
        let (_, crashed) = Control::open(&path).unwrap();
        assert!(crashed);
    }

    #[test]
    fn corrupted_magic_on_a_correctly_sized_file_is_rejected() {
        use std::io::Write;
        let dir = tempdir().unwrap();
        let path = dir.path().join("ctrl");
        {
            let mut file = OpenOptions::new().write(true).create(true).open(&path).unwrap();
            file.write_all(&vec![0xffu8; CONTROL_SIZE]).unwrap();
        }
        let err = Control::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::BadControlBlock));
    }

    #[test]
    fn flip_data_used_toggles() {
        let dir = tempdir().unwrap();
        let (mut ctrl, _) = Control::open(&dir.path().join("ctrl")).unwrap();
        assert_eq!(ctrl.data_used(), 0);
        ctrl.flip_data_used().unwrap();
        assert_eq!(ctrl.data_used(), 1);
        ctrl.flip_data_used().unwrap();
        assert_eq!(ctrl.data_used(), 0);
    }
}
