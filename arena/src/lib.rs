//! A segregated free-list allocator whose heap lives inside a single,
//! user-supplied contiguous region and whose every internal link is an
//! [`Offset`], never a pointer — so the region can be memory-mapped,
//! shared between processes, persisted to disk, or relocated without
//! fixup. See `SPEC_FULL.md` for the full design.

pub mod chunk;
pub mod error;
pub mod freelist;
pub mod offset;
pub mod persist;
pub mod registry;

pub use error::AllocError;
pub use offset::Offset;
pub use registry::RegionId;

use std::cell::RefCell;
use std::rc::Rc;

use freelist::HEADER_SIZE;

/// Minimum viable region size: header plus two boundary records (one real
/// chunk, one sentinel).
pub const MIN_REGION_SIZE: u64 = HEADER_SIZE + 2 * chunk::BOUNDARY_SIZE;

/// Backing storage for a region. Implementors own the actual bytes (an
/// in-memory `Vec`, or a persistence-layer mmap) and know how to grow them.
pub trait RegionBytes {
    fn as_bytes(&self) -> &[u8];
    fn as_bytes_mut(&mut self) -> &mut [u8];

    /// Grows the backing storage by at least `additional` bytes. On
    /// success the new storage must be exactly `additional` bytes longer
    /// than before.
    fn grow(&mut self, additional: u64) -> Result<(), AllocError>;
}

/// A plain in-memory region, useful for tests and for allocators that do
/// not need persistence.
#[derive(Debug)]
pub struct VecRegion(pub Vec<u8>);

impl VecRegion {
    pub fn new(size: u64) -> Self {
        VecRegion(vec![0u8; size as usize])
    }
}

impl RegionBytes for VecRegion {
    fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    fn grow(&mut self, additional: u64) -> Result<(), AllocError> {
        let new_len = self.0.len() + additional as usize;
        self.0.resize(new_len, 0);
        Ok(())
    }
}

/// Construction parameters for a fresh or reopened region.
#[derive(Clone, Copy, Debug)]
pub struct RegionConfig {
    pub initial_size: u64,
    pub fixed_id: Option<RegionId>,
}

impl Default for RegionConfig {
    fn default() -> Self {
        RegionConfig { initial_size: MIN_REGION_SIZE.max(4096), fixed_id: None }
    }
}

/// A region plus its allocator state: the public surface described in
/// `spec.md §6`.
#[derive(Debug)]
pub struct ArenaCtx<B: RegionBytes> {
    storage: B,
    id: RegionId,
}

impl<B: RegionBytes + 'static> ArenaCtx<B> {
    /// Initializes `storage` as a region, or, if it already carries a valid
    /// arena magic, reopens it in place (preserving all live allocations —
    /// invariant 6 in `spec.md §8`).
    pub fn init(mut storage: B, cfg: RegionConfig) -> Result<Rc<RefCell<Self>>, AllocError> {
        let bytes = storage.as_bytes();
        if freelist::Header::magic(bytes) == freelist::MAGIC {
            let id = RegionId(freelist::Header::id(bytes));
            if registry::is_live(id) {
                return Err(AllocError::RegistryCollision(id.0));
            }
            let ctx = Rc::new(RefCell::new(ArenaCtx { storage, id }));
            registry::register(id, &ctx);
            tracing::debug!(region_id = id.0, "reopened existing arena");
            return Ok(ctx);
        }

        if cfg.initial_size < MIN_REGION_SIZE {
            return Err(AllocError::TooSmall { size: cfg.initial_size, min: MIN_REGION_SIZE });
        }
        if cfg.initial_size % 16 != 0 {
            return Err(AllocError::Misaligned);
        }
        if (bytes.as_ptr() as usize) % 16 != 0 {
            return Err(AllocError::Misaligned);
        }

        let id = cfg.fixed_id.unwrap_or_else(RegionId::generate);
        if registry::is_live(id) {
            return Err(AllocError::RegistryCollision(id.0));
        }

        if (storage.as_bytes().len() as u64) < cfg.initial_size {
            let extra = cfg.initial_size - storage.as_bytes().len() as u64;
            storage.grow(extra)?;
        }
        freelist::init_region(storage.as_bytes_mut(), cfg.initial_size, id.0);
        tracing::debug!(region_id = id.0, size = cfg.initial_size, "initialized new arena");

        let ctx = Rc::new(RefCell::new(ArenaCtx { storage, id }));
        registry::register(id, &ctx);
        Ok(ctx)
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Looks up the live context registered under `id`.
    pub fn get_ctx(id: RegionId) -> Option<Rc<RefCell<Self>>>
    where
        B: 'static,
    {
        registry::get(id)
    }

    pub fn set_user(&mut self, off: Offset) {
        freelist::Header::set_user_slot(self.storage.as_bytes_mut(), off);
    }

    pub fn get_user(&self) -> Offset {
        freelist::Header::user_slot(self.storage.as_bytes())
    }

    /// Converts an offset to a raw pointer into the region, or null.
    pub fn ptr(&mut self, off: Offset) -> *mut u8 {
        // Safety: `off` is either null or was produced by `off()`/`alloc()`
        // against this same region.
        unsafe { offset::to_ptr(self.storage.as_bytes_mut().as_mut_ptr(), off) }
    }

    /// Converts a raw pointer within the region to an offset.
    ///
    /// # Safety
    /// `p` must be null or point inside this region's current bytes.
    pub unsafe fn off(&self, p: *const u8) -> Offset {
        offset::to_offset(self.storage.as_bytes().as_ptr(), p)
    }

    /// Allocates `size` bytes, returning `Offset::NULL` on failure (OOM, or
    /// no grow path available).
    pub fn alloc(&mut self, size: u64) -> Offset {
        if size == 0 {
            return Offset::NULL;
        }
        let off = freelist::try_alloc(self.storage.as_bytes_mut(), size);
        if !off.is_null() {
            return off;
        }
        self.grow_and_retry(size)
    }

    fn grow_and_retry(&mut self, size: u64) -> Offset {
        let sz16 = offset::align16(size.max(1));
        let ask = freelist::grow_request_size(sz16);
        if self.storage.grow(ask).is_err() {
            tracing::warn!(requested = ask, "arena grow callback failed");
            return Offset::NULL;
        }
        freelist::extend_region(self.storage.as_bytes_mut(), ask);
        tracing::debug!(added = ask, "arena grew");
        freelist::try_alloc(self.storage.as_bytes_mut(), size)
    }

    /// Frees a previously allocated offset. A no-op on `Offset::NULL`.
    pub fn free(&mut self, off: Offset) {
        if let Err(e) = freelist::free(self.storage.as_bytes_mut(), off) {
            tracing::error!(error = %e, "arena free failed");
        }
    }

    pub fn storage(&self) -> &B {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut B {
        &mut self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_and_basic_alloc_free() {
        let ctx = ArenaCtx::init(VecRegion::new(4096), RegionConfig::default()).unwrap();
        let mut ctx = ctx.borrow_mut();
        let a = ctx.alloc(928);
        assert!(!a.is_null());
        assert_eq!(a.get() % 16, 0);
        ctx.free(a);
    }

    #[test]
    fn reopen_preserves_user_slot() {
        let id = RegionId(RegionId::generate().0);
        let cfg = RegionConfig { initial_size: 4096, fixed_id: Some(id) };
        let mut region = VecRegion::new(4096);
        {
            let ctx = ArenaCtx::init(VecRegion::new(4096), cfg).unwrap();
            let mut ctx = ctx.borrow_mut();
            let a = ctx.alloc(64);
            ctx.set_user(a);
            region.0.copy_from_slice(ctx.storage().as_bytes());
        }
        // Reopening over the same bytes with a *different* handle (previous
        // one's Rc dropped, so the id registration is gone) reuses the
        // embedded id and recovers the user slot.
        let ctx2 = ArenaCtx::init(region, RegionConfig::default()).unwrap();
        let ctx2 = ctx2.borrow();
        assert_eq!(ctx2.id(), id);
        assert!(!ctx2.get_user().is_null());
    }

    #[test]
    fn too_small_region_rejected() {
        let err = ArenaCtx::init(
            VecRegion::new(16),
            RegionConfig { initial_size: 16, fixed_id: None },
        )
        .unwrap_err();
        assert!(matches!(err, AllocError::TooSmall { .. }));
    }

    #[test]
    fn alloc_beyond_capacity_grows_region() {
        let ctx = ArenaCtx::init(
            VecRegion::new(4096),
            RegionConfig { initial_size: 4096, fixed_id: None },
        )
        .unwrap();
        let mut ctx = ctx.borrow_mut();
        let mut last = Offset::NULL;
        for _ in 0..10 {
            last = ctx.alloc(1024);
            assert!(!last.is_null());
        }
        assert!(ctx.storage().as_bytes().len() as u64 > 4096);
    }
}
