//! Crash-consistent, dual-file mmap persistence for an [`ArenaCtx`],
//! grounded on the teacher's `StorageInner::expand` growth pattern and the
//! commit/rewind protocol described in `spec.md §4.4`.

use std::cell::{RefCell, RefMut};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use libc::c_void;
use memmap2::MmapMut;

use crate::error::{AllocError, StoreError};
use crate::freelist;
use crate::persist::control::Control;
use crate::persist::dirty::{self, DirtyBitmap};
use crate::{ArenaCtx, RegionBytes, RegionConfig};

/// How large a virtual address reservation is made up front so that grows
/// never have to move the live mapping's base address.
const RESERVE_LEN: usize = 4 * 1024 * 1024 * 1024 * 1024; // 4 TiB
const PAGE_SIZE: usize = 4096;

/// Backing storage for a persisted region: a stable-address mapping of one
/// of the two data files, inside a much larger `PROT_NONE` reservation.
pub struct MappedRegion {
    base: *mut u8,
    len: usize,
    file: File,
    page_size: usize,
    dirty: Rc<RefCell<DirtyBitmap>>,
}

impl MappedRegion {
    fn remap(&mut self, new_len: usize) -> Result<(), StoreError> {
        unsafe {
            if self.len > 0 {
                libc::munmap(self.base as *mut c_void, self.len);
            }
            let ptr = libc::mmap(
                self.base as *mut c_void,
                new_len,
                libc::PROT_READ,
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.file.as_raw_fd(),
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(StoreError::Map(std::io::Error::last_os_error()));
            }
        }
        self.len = new_len;
        let n_pages = self.len.div_ceil(self.page_size);
        self.dirty.borrow_mut().resize_pages(n_pages);
        dirty::publish(self.base, self.len, &mut self.dirty.borrow_mut(), self.page_size);
        Ok(())
    }
}

impl RegionBytes for MappedRegion {
    fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.len) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base, self.len) }
    }

    fn grow(&mut self, additional: u64) -> Result<(), AllocError> {
        let new_len = self.len + additional as usize;
        if new_len > RESERVE_LEN {
            return Err(AllocError::OutOfBounds(new_len as u64));
        }
        self.file.set_len(new_len as u64).map_err(|_| AllocError::OutOfBounds(new_len as u64))?;
        self.file.sync_all().map_err(|_| AllocError::OutOfBounds(new_len as u64))?;
        self.remap(new_len).map_err(|_| AllocError::OutOfBounds(new_len as u64))
    }
}

fn data_path(ctrl_path: &Path, idx: u32) -> PathBuf {
    let mut s = ctrl_path.as_os_str().to_os_string();
    s.push(format!("_{idx}.data"));
    PathBuf::from(s)
}

fn open_data_file(path: &Path) -> Result<File, StoreError> {
    OpenOptions::new().read(true).write(true).create(true).open(path).map_err(StoreError::Open)
}

fn copy_file(src: &mut File, dst: &mut File, len: u64) -> Result<(), StoreError> {
    dst.set_len(len).map_err(StoreError::Resize)?;
    src.seek(SeekFrom::Start(0)).map_err(StoreError::Open)?;
    dst.seek(SeekFrom::Start(0)).map_err(StoreError::Open)?;
    std::io::copy(src, dst).map_err(StoreError::Open)?;
    dst.sync_all().map_err(StoreError::Sync)
}

/// The crash-consistent dual-file persistence layer: control block, two
/// mirrored data files, and a live region mapped at a stable address.
pub struct Persist {
    ctrl: Control,
    ctrl_path: PathBuf,
    live_idx: u32,
    dirty: Rc<RefCell<DirtyBitmap>>,
    last_committed_len: usize,
    ctx: Rc<RefCell<ArenaCtx<MappedRegion>>>,
}

impl Persist {
    pub fn init(ctrl_path: &Path) -> Result<Self, StoreError> {
        let os_page = page_size::get();
        if os_page != PAGE_SIZE {
            return Err(StoreError::PageSizeMismatch { expected: PAGE_SIZE, found: os_page });
        }
        dirty::install()?;

        let (mut ctrl, crashed) = Control::open(ctrl_path)?;
        let p0 = data_path(ctrl_path, 0);
        let p1 = data_path(ctrl_path, 1);
        let fresh = !p0.exists() || !p1.exists();
        let mut f0 = open_data_file(&p0)?;
        let mut f1 = open_data_file(&p1)?;

        if fresh {
            let mut bytes = vec![0u8; PAGE_SIZE];
            freelist::init_region(&mut bytes, PAGE_SIZE as u64, crate::RegionId::generate().0);
            f0.set_len(PAGE_SIZE as u64).map_err(StoreError::Resize)?;
            f0.write_all(&bytes).map_err(StoreError::Open)?;
            f0.sync_all().map_err(StoreError::Sync)?;
            copy_file(&mut f0, &mut f1, PAGE_SIZE as u64)?;
            ctrl.set_in_use(false)?;
        } else if crashed {
            let live_idx = ctrl.data_used();
            let backup_idx = 1 - live_idx;
            let (backup, live) = if backup_idx == 0 { (&mut f0, &mut f1) } else { (&mut f1, &mut f0) };
            let backup_len = backup.metadata().map_err(StoreError::Open)?.len();
            copy_file(backup, live, backup_len)?;
        }

        ctrl.set_in_use(true)?;
        let live_idx = ctrl.data_used();
        let mut live_file = if live_idx == 0 { f0 } else { f1 };
        let live_len = live_file.metadata().map_err(StoreError::Open)?.len() as usize;

        let base = unsafe {
            let p = libc::mmap(
                std::ptr::null_mut(),
                RESERVE_LEN,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                -1,
                0,
            );
            if p == libc::MAP_FAILED {
                return Err(StoreError::Map(std::io::Error::last_os_error()));
            }
            p as *mut u8
        };

        unsafe {
            let p = libc::mmap(
                base as *mut c_void,
                live_len,
                libc::PROT_READ,
                libc::MAP_SHARED | libc::MAP_FIXED,
                live_file.as_raw_fd(),
                0,
            );
            if p == libc::MAP_FAILED {
                return Err(StoreError::Map(std::io::Error::last_os_error()));
            }
        }

        let dirty = Rc::new(RefCell::new(DirtyBitmap::for_pages(live_len.div_ceil(PAGE_SIZE))));
        dirty::publish(base, live_len, &mut dirty.borrow_mut(), PAGE_SIZE);

        let region = MappedRegion { base, len: live_len, file: live_file, page_size: PAGE_SIZE, dirty: dirty.clone() };
        let ctx = ArenaCtx::init(region, RegionConfig { initial_size: live_len as u64, fixed_id: None })
            .map_err(StoreError::Alloc)?;

        tracing::info!(path = %ctrl_path.display(), live_idx, live_len, "persistence store opened");

        Ok(Persist { ctrl, ctrl_path: ctrl_path.to_path_buf(), live_idx, dirty, last_committed_len: live_len, ctx })
    }

    /// Gives mutable access to the underlying arena context.
    pub fn ctx(&mut self) -> RefMut<'_, ArenaCtx<MappedRegion>> {
        self.ctx.borrow_mut()
    }

    fn live_len(&self) -> usize {
        self.ctx.borrow().storage().len
    }

    fn msync_page(base: *mut u8, page: usize, page_size: usize) {
        unsafe {
            let addr = base.add(page * page_size) as *mut c_void;
            libc::msync(addr, page_size, libc::MS_SYNC);
        }
    }

    /// Forward or rewind commit, per `spec.md §4.4`. Any failing syscall
    /// aborts the commit and leaves the dirty bitmap untouched so a retry
    /// is possible.
    pub fn submit_changes(&mut self, reverse: bool) -> Result<(), StoreError> {
        let base = self.ctx.borrow().storage().base;
        let page_size = self.ctx.borrow().storage().page_size;

        for page in self.dirty.borrow().iter_set() {
            Self::msync_page(base, page, page_size);
        }

        if reverse {
            self.rewind(base, page_size)
        } else {
            self.forward(base, page_size)
        }
    }

    fn forward(&mut self, base: *mut u8, page_size: usize) -> Result<(), StoreError> {
        self.ctrl.flip_data_used()?;

        let live_len = self.live_len();
        let backup_idx = 1 - self.live_idx;
        let backup_path = data_path(&self.ctrl_path, backup_idx);
        let mut backup_file = open_data_file(&backup_path)?;
        let backup_len = backup_file.metadata().map_err(StoreError::Open)?.len() as usize;
        if backup_len < live_len {
            backup_file.set_len(live_len as u64).map_err(StoreError::Resize)?;
            backup_file.sync_all().map_err(StoreError::Sync)?;
        }

        let mut backup_map = unsafe { MmapMut::map_mut(&backup_file).map_err(StoreError::Map)? };
        let n_pages = live_len.div_ceil(page_size);
        for page in self.dirty.borrow().iter_set() {
            if page >= n_pages {
                continue;
            }
            let start = page * page_size;
            let end = (start + page_size).min(live_len);
            unsafe {
                let src = std::slice::from_raw_parts(base.add(start), end - start);
                backup_map[start..end].copy_from_slice(src);
            }
        }
        backup_map.flush().map_err(StoreError::Sync)?;

        self.dirty.borrow_mut().clear();
        self.ctrl.flip_data_used()?;
        self.last_committed_len = live_len;
        tracing::debug!(live_len, "forward commit complete");
        Ok(())
    }

    fn rewind(&mut self, _base: *mut u8, page_size: usize) -> Result<(), StoreError> {
        let backup_idx = 1 - self.live_idx;
        let backup_path = data_path(&self.ctrl_path, backup_idx);
        let mut backup_file = open_data_file(&backup_path)?;

        {
            let mut ctx = self.ctx.borrow_mut();
            let region = ctx.storage_mut();
            region.file.set_len(self.last_committed_len as u64).map_err(StoreError::Resize)?;
            region.file.sync_all().map_err(StoreError::Sync)?;
            region.remap(self.last_committed_len)?;
        }

        let backup_map = unsafe { MmapMut::map_mut(&backup_file).map_err(StoreError::Map)? };
        let n_pages = self.last_committed_len.div_ceil(page_size);
        {
            let mut ctx = self.ctx.borrow_mut();
            let region = ctx.storage_mut();
            for page in self.dirty.borrow().iter_set() {
                if page >= n_pages {
                    continue;
                }
                let start = page * page_size;
                let end = (start + page_size).min(self.last_committed_len);
                unsafe {
                    let dst = std::slice::from_raw_parts_mut(region.base.add(start), end - start);
                    dst.copy_from_slice(&backup_map[start..end]);
                    libc::msync(region.base.add(start) as *mut c_void, end - start, libc::MS_SYNC);
                }
            }
        }
        let _ = backup_file.flush();

        self.dirty.borrow_mut().clear();
        tracing::debug!(len = self.last_committed_len, "rewind commit complete");
        Ok(())
    }

    /// Commits a final rewind, truncates both files to the last committed
    /// size, unmaps everything, and clears `in_use` for a clean close.
    pub fn uninit(mut self) -> Result<(), StoreError> {
        self.submit_changes(true)?;
        let len = self.last_committed_len as u64;
        for idx in 0..2u32 {
            let path = data_path(&self.ctrl_path, idx);
            let f = open_data_file(&path)?;
            f.set_len(len).map_err(StoreError::Resize)?;
            f.sync_all().map_err(StoreError::Sync)?;
        }
        {
            let ctx = self.ctx.borrow();
            let region = ctx.storage();
            unsafe {
                libc::munmap(region.base as *mut c_void, RESERVE_LEN);
            }
        }
        self.ctrl.set_in_use(false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    // `Persist::init` publishes into `dirty.rs`'s process-wide SIGSEGV
    // handler statics; any test that opens a `Persist` must run serially
    // with every other such test (here and in `tests/scenarios.rs`), or a
    // concurrently-open instance can clobber another's dirty-page
    // attribution.
    #[test]
    #[serial]
    fn init_creates_paired_data_files() {
        let dir = tempdir().unwrap();
        let ctrl_path = dir.path().join("store");
        let persist = Persist::init(&ctrl_path).unwrap();
        assert!(data_path(&ctrl_path, 0).exists());
        assert!(data_path(&ctrl_path, 1).exists());
        drop(persist);
    }

    #[test]
    #[serial]
    fn alloc_commit_and_rewind() {
        let dir = tempdir().unwrap();
        let ctrl_path = dir.path().join("store");
        let mut persist = Persist::init(&ctrl_path).unwrap();

        let off = {
            let mut ctx = persist.ctx();
            let off = ctx.alloc(64);
            ctx.set_user(off);
            off
        };
        persist.submit_changes(false).unwrap();

        {
            let mut ctx = persist.ctx();
            let p = ctx.ptr(off);
            unsafe { std::ptr::write_bytes(p, 0xAB, 64) };
        }
        // Uncommitted mutation, rewound back to the last commit.
        persist.submit_changes(true).unwrap();

        let ctx = persist.ctx();
        assert_eq!(ctx.get_user(), off);
    }
}
