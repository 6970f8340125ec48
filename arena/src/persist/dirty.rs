//! SIGSEGV-driven dirty-page tracking for the persistence layer's live
//! mapping, plus the bitmap itself.
//!
//! The handler touches only plain integers and calls `mprotect`: no
//! allocation, no locking, so it stays safe to run off the signal stack.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Once, OnceLock};

use libc::{c_int, c_void, siginfo_t};

use crate::error::StoreError;

static REGION_BASE: AtomicUsize = AtomicUsize::new(0);
static REGION_LEN: AtomicUsize = AtomicUsize::new(0);
static BITMAP_PTR: AtomicUsize = AtomicUsize::new(0);
static BITMAP_WORDS: AtomicUsize = AtomicUsize::new(0);
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(4096);

static PREV_ACTION: OnceLock<libc::sigaction> = OnceLock::new();
static INSTALLED: Once = Once::new();

/// Word-per-64-pages dirty bitmap, matching the region header's own
/// bitmap shape so `commit_changes` stays a cheap linear scan.
pub struct DirtyBitmap(pub Vec<u64>);

impl DirtyBitmap {
    pub fn for_pages(n_pages: usize) -> Self {
        DirtyBitmap(vec![0u64; n_pages.div_ceil(64).max(1)])
    }

    pub fn resize_pages(&mut self, n_pages: usize) {
        self.0.resize(n_pages.div_ceil(64).max(1), 0);
    }

    #[inline]
    pub fn set(&mut self, page: usize) {
        self.0[page / 64] |= 1u64 << (page % 64);
    }

    #[inline]
    pub fn is_set(&self, page: usize) -> bool {
        self.0[page / 64] & (1u64 << (page % 64)) != 0
    }

    pub fn clear(&mut self) {
        self.0.fill(0);
    }

    /// Page indices with their bit set, in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(w, &word)| {
            (0..64u32).filter(move |b| word & (1u64 << b) != 0).map(move |b| w * 64 + b as usize)
        })
    }
}

/// Publishes the live mapping's bounds and bitmap storage for the signal
/// handler to consult. Must be called again after any grow or remap,
/// before the mapping can safely take a write fault.
pub fn publish(base: *mut u8, len: usize, bitmap: &mut DirtyBitmap, page_size: usize) {
    BITMAP_PTR.store(bitmap.0.as_mut_ptr() as usize, Ordering::Release);
    BITMAP_WORDS.store(bitmap.0.len(), Ordering::Release);
    PAGE_SIZE.store(page_size, Ordering::Release);
    REGION_LEN.store(len, Ordering::Release);
    REGION_BASE.store(base as usize, Ordering::Release);
}

/// Installs the handler once per process, chaining on top of whatever was
/// previously registered for `SIGSEGV`.
pub fn install() -> Result<(), StoreError> {
    let mut result = Ok(());
    INSTALLED.call_once(|| unsafe {
        let mut new_action: libc::sigaction = std::mem::zeroed();
        new_action.sa_sigaction = handler as usize;
        new_action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
        libc::sigemptyset(&mut new_action.sa_mask);

        let mut old_action: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(libc::SIGSEGV, &new_action, &mut old_action) != 0 {
            result = Err(StoreError::SignalHandler(std::io::Error::last_os_error()));
            return;
        }
        let _ = PREV_ACTION.set(old_action);
    });
    result
}

extern "C" fn handler(sig: c_int, info: *mut siginfo_t, ctx: *mut c_void) {
    let base = REGION_BASE.load(Ordering::Acquire);
    let len = REGION_LEN.load(Ordering::Acquire);
    let fault_addr = unsafe { (*info).si_addr() as usize };

    if base == 0 || fault_addr < base || fault_addr >= base + len {
        chain_to_previous(sig, info, ctx);
        return;
    }

    let page_size = PAGE_SIZE.load(Ordering::Acquire);
    let page_idx = (fault_addr - base) / page_size;
    let bitmap_ptr = BITMAP_PTR.load(Ordering::Acquire) as *mut u64;
    let bitmap_words = BITMAP_WORDS.load(Ordering::Acquire);
    let word_idx = page_idx / 64;
    if bitmap_ptr.is_null() || word_idx >= bitmap_words {
        chain_to_previous(sig, info, ctx);
        return;
    }

    unsafe {
        let word = bitmap_ptr.add(word_idx);
        *word |= 1u64 << (page_idx % 64);
        let page_addr = (base + page_idx * page_size) as *mut c_void;
        libc::mprotect(page_addr, page_size, libc::PROT_READ | libc::PROT_WRITE);
    }
}

fn chain_to_previous(sig: c_int, info: *mut siginfo_t, ctx: *mut c_void) {
    let Some(prev) = PREV_ACTION.get() else {
        unsafe { libc::raise(sig) };
        return;
    };
    let handler_ptr = prev.sa_sigaction;
    if handler_ptr == libc::SIG_DFL {
        unsafe { libc::raise(sig) };
        return;
    }
    if handler_ptr == libc::SIG_IGN {
        return;
    }
    unsafe {
        if prev.sa_flags & libc::SA_SIGINFO != 0 {
            let f: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
                std::mem::transmute(handler_ptr);
            f(sig, info, ctx);
        } else {
            let f: extern "C" fn(c_int) = std::mem::transmute(handler_ptr);
            f(sig);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_set_and_iter() {
        let mut bm = DirtyBitmap::for_pages(200);
        bm.set(0);
        bm.set(63);
        bm.set(64);
        bm.set(199);
        let got: Vec<usize> = bm.iter_set().collect();
        assert_eq!(got, vec![0, 63, 64, 199]);
    }

    #[test]
    fn resize_preserves_existing_words() {
        let mut bm = DirtyBitmap::for_pages(10);
        bm.set(5);
        bm.resize_pages(500);
        assert!(bm.is_set(5));
        assert_eq!(bm.0.len(), 500usize.div_ceil(64));
    }

    #[test]
    fn clear_zeroes_all_words() {
        let mut bm = DirtyBitmap::for_pages(128);
        bm.set(10);
        bm.set(100);
        bm.clear();
        assert_eq!(bm.iter_set().count(), 0);
    }
}
