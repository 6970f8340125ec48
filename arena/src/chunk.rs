//! Chunk boundary layout.
//!
//! Every allocatable range in a region is bracketed by a 16-byte boundary
//! record: an 8-byte `prev_sz` (the payload size of the *previous* chunk)
//! followed by an 8-byte packed size word (bit0 = free, bit1/bit2 reserved
//! for a future tree-node/small-bin scheme, remaining bits = payload size).
//! When the chunk is free, the first 16 bytes of its payload are reused as
//! the `prev_free`/`next_free` free-list links — this is why the minimum
//! payload size equals the boundary record size.

use crate::offset::Offset;

/// Size of the fixed `prev_sz` + size-word header that precedes every chunk.
pub const BOUNDARY_SIZE: u64 = 16;
/// Minimum payload: large enough to hold the free-list link pair.
pub const MIN_PAYLOAD: u64 = 16;

const FREE_BIT: u64 = 1 << 0;
const NODE_BIT: u64 = 1 << 1;
const SBIN_BIT: u64 = 1 << 2;
const SIZE_SHIFT: u32 = 3;

#[inline]
fn read_u64(region: &[u8], off: u64) -> u64 {
    let o = off as usize;
    u64::from_le_bytes(region[o..o + 8].try_into().unwrap())
}

#[inline]
fn write_u64(region: &mut [u8], off: u64, v: u64) {
    let o = off as usize;
    region[o..o + 8].copy_from_slice(&v.to_le_bytes());
}

/// A cheap, `Copy` reference to a chunk boundary at a given offset. Reads
/// and writes go straight through to the backing region slice; this type
/// carries no cached state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRef {
    pub off: u64,
}

impl ChunkRef {
    #[inline]
    pub const fn at(off: u64) -> Self {
        ChunkRef { off }
    }

    #[inline]
    pub fn prev_size(self, region: &[u8]) -> u64 {
        read_u64(region, self.off)
    }

    #[inline]
    pub fn set_prev_size(self, region: &mut [u8], v: u64) {
        write_u64(region, self.off, v);
    }

    #[inline]
    fn size_word(self, region: &[u8]) -> u64 {
        read_u64(region, self.off + 8)
    }

    #[inline]
    fn set_size_word(self, region: &mut [u8], v: u64) {
        write_u64(region, self.off + 8, v);
    }

    #[inline]
    pub fn size(self, region: &[u8]) -> u64 {
        self.size_word(region) >> SIZE_SHIFT
    }

    #[inline]
    pub fn set_size(self, region: &mut [u8], sz: u64) {
        let word = self.size_word(region);
        let flags = word & ((1 << SIZE_SHIFT) - 1);
        self.set_size_word(region, (sz << SIZE_SHIFT) | flags);
    }

    #[inline]
    pub fn is_free(self, region: &[u8]) -> bool {
        self.size_word(region) & FREE_BIT != 0
    }

    #[inline]
    pub fn set_free(self, region: &mut [u8], free: bool) {
        let mut word = self.size_word(region);
        if free {
            word |= FREE_BIT;
        } else {
            word &= !FREE_BIT;
        }
        self.set_size_word(region, word);
    }

    #[inline]
    pub fn is_node(self, region: &[u8]) -> bool {
        self.size_word(region) & NODE_BIT != 0
    }

    #[inline]
    pub fn is_small_bin(self, region: &[u8]) -> bool {
        self.size_word(region) & SBIN_BIT != 0
    }

    /// Offset of this chunk's user payload (right after the boundary).
    #[inline]
    pub const fn user_offset(self) -> u64 {
        self.off + BOUNDARY_SIZE
    }

    #[inline]
    pub fn user(self) -> Offset {
        Offset(self.user_offset())
    }

    /// Reconstructs the chunk boundary that owns a given user payload offset.
    #[inline]
    pub fn from_user(user: Offset) -> Self {
        ChunkRef::at(user.get() - BOUNDARY_SIZE)
    }

    #[inline]
    pub fn next_boundary(self, region: &[u8]) -> ChunkRef {
        ChunkRef::at(self.user_offset() + self.size(region))
    }

    #[inline]
    pub fn prev_boundary(self, region: &[u8]) -> ChunkRef {
        ChunkRef::at(self.off - self.prev_size(region) - BOUNDARY_SIZE)
    }

    #[inline]
    pub fn prev_free(self, region: &[u8]) -> Offset {
        Offset(read_u64(region, self.user_offset()))
    }

    #[inline]
    pub fn set_prev_free(self, region: &mut [u8], off: Offset) {
        write_u64(region, self.user_offset(), off.get());
    }

    #[inline]
    pub fn next_free(self, region: &[u8]) -> Offset {
        Offset(read_u64(region, self.user_offset() + 8))
    }

    #[inline]
    pub fn set_next_free(self, region: &mut [u8], off: Offset) {
        write_u64(region, self.user_offset() + 8, off.get());
    }

    /// Lays out a brand-new chunk boundary with the given payload size,
    /// `prev_sz`, and free state. Does not touch the free-list links.
    pub fn init(self, region: &mut [u8], prev_sz: u64, payload_sz: u64, free: bool) {
        self.set_prev_size(region, prev_sz);
        self.set_size_word(region, (payload_sz << SIZE_SHIFT) | if free { FREE_BIT } else { 0 });
    }
}
