//! Region header layout and the segregated free-list engine: §4.2 of the
//! allocator design — bucket selection, split/coalesce, and the grow path.

use crate::chunk::{ChunkRef, BOUNDARY_SIZE, MIN_PAYLOAD};
use crate::error::AllocError;
use crate::offset::{align16, Offset};

/// Magic constant stamped into an initialized region header.
pub const MAGIC: u64 = 0xd0caffe;
/// Number of log2-size buckets, one per bit of the summary bitmap.
pub const NUM_BUCKETS: usize = 64;
/// `16 * 4 KiB`: how much the region grows by at minimum, per `spec.md §4.2`.
pub const GROWTH_QUANTUM: u64 = 16 * 4096;

const HDR_MAGIC: u64 = 0;
const HDR_ID: u64 = 8;
const HDR_SIZE: u64 = 16;
const HDR_USER_SLOT: u64 = 24;
const HDR_FREE_BMAP: u64 = 32;
const HDR_FREE_LISTS: u64 = 40;
/// Raw byte size of the header before 16-byte padding.
const HDR_RAW_SIZE: u64 = HDR_FREE_LISTS + (NUM_BUCKETS as u64) * 8;
/// Offset of the first chunk boundary: the header, padded up to 16 bytes.
pub const HEADER_SIZE: u64 = align16(HDR_RAW_SIZE);

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

/// A thin, stateless cursor over the region header at offset 0.
pub struct Header;

impl Header {
    #[inline]
    pub fn magic(region: &[u8]) -> u64 {
        read_u64(region, HDR_MAGIC)
    }

    #[inline]
    pub fn set_magic(region: &mut [u8], v: u64) {
        write_u64(region, HDR_MAGIC, v);
    }

    #[inline]
    pub fn id(region: &[u8]) -> u64 {
        read_u64(region, HDR_ID)
    }

    #[inline]
    pub fn set_id(region: &mut [u8], v: u64) {
        write_u64(region, HDR_ID, v);
    }

    #[inline]
    pub fn size(region: &[u8]) -> u64 {
        read_u64(region, HDR_SIZE)
    }

    #[inline]
    pub fn set_size(region: &mut [u8], v: u64) {
        write_u64(region, HDR_SIZE, v);
    }

    #[inline]
    pub fn user_slot(region: &[u8]) -> Offset {
        Offset(read_u64(region, HDR_USER_SLOT))
    }

    #[inline]
    pub fn set_user_slot(region: &mut [u8], v: Offset) {
        write_u64(region, HDR_USER_SLOT, v.get());
    }

    #[inline]
    pub fn bmap(region: &[u8]) -> u64 {
        read_u64(region, HDR_FREE_BMAP)
    }

    #[inline]
    fn set_bmap(region: &mut [u8], v: u64) {
        write_u64(region, HDR_FREE_BMAP, v);
    }

    #[inline]
    pub fn bucket_head(region: &[u8], bucket: u32) -> Offset {
        Offset(read_u64(region, HDR_FREE_LISTS + (bucket as u64) * 8))
    }

    #[inline]
    fn set_bucket_head(region: &mut [u8], bucket: u32, v: Offset) {
        write_u64(region, HDR_FREE_LISTS + (bucket as u64) * 8, v.get());
    }
}

/// `floor(log2(n))` for `n >= 1`.
#[inline]
pub fn log2_64(n: u64) -> u32 {
    debug_assert!(n >= 1);
    63 - n.leading_zeros()
}

/// The smallest power of two `>= n`.
#[inline]
pub fn next_pow2(n: u64) -> u64 {
    if n <= 1 {
        1
    } else {
        1u64 << (64 - (n - 1).leading_zeros())
    }
}

fn bucket_of(size: u64) -> u32 {
    log2_64(size.max(1))
}

/// Unlinks `cb` from its size bucket's doubly linked free list. Clears the
/// bucket's summary bit only if, after unlinking, that bucket's head is
/// empty — not merely because `cb` happened to be the head (see
/// `spec.md §9` Open Questions).
fn remove_from_free_list(region: &mut [u8], cb: ChunkRef) {
    let bucket = bucket_of(cb.size(region));
    let prev = cb.prev_free(region);
    let next = cb.next_free(region);
    cb.set_free(region, false);

    if !prev.is_null() {
        ChunkRef::from_user(prev).set_next_free(region, next);
    }
    if !next.is_null() {
        ChunkRef::from_user(next).set_prev_free(region, prev);
    }
    if Header::bucket_head(region, bucket) == cb.user() {
        Header::set_bucket_head(region, bucket, next);
    }
    if Header::bucket_head(region, bucket).is_null() {
        let bmap = Header::bmap(region);
        Header::set_bmap(region, bmap & !(1u64 << bucket));
    }
}

/// Pushes `cb` onto the front of its size bucket's free list.
fn add_to_free_list(region: &mut [u8], cb: ChunkRef) {
    let bucket = bucket_of(cb.size(region));
    let head = Header::bucket_head(region, bucket);
    let bmap = Header::bmap(region);
    Header::set_bmap(region, bmap | (1u64 << bucket));

    if !head.is_null() {
        ChunkRef::from_user(head).set_prev_free(region, cb.user());
    }
    cb.set_next_free(region, head);
    cb.set_prev_free(region, Offset::NULL);
    Header::set_bucket_head(region, bucket, cb.user());
    cb.set_free(region, true);
}

/// Splits `cb` so that its payload is exactly `keep_sz` bytes and returns a
/// boundary for the remainder (whose payload is `old_sz - keep_sz -
/// BOUNDARY_SIZE`). Neither half is linked into a free list; the caller
/// decides what to do with each.
fn split_chunk(region: &mut [u8], cb: ChunkRef, keep_sz: u64) -> ChunkRef {
    let old_sz = cb.size(region);
    let new_sz = old_sz - keep_sz - BOUNDARY_SIZE;
    cb.set_size(region, keep_sz);
    let new_cb = cb.next_boundary(region);
    new_cb.init(region, keep_sz, new_sz, false);
    let after = new_cb.next_boundary(region);
    after.set_prev_size(region, new_sz);
    new_cb
}

/// Merges free chunk `b` into free chunk `a` (`b` must immediately follow
/// `a`); returns `a`, now covering both payloads plus the boundary between
/// them. Neither chunk may already be linked into a free list.
fn merge_chunks(region: &mut [u8], a: ChunkRef, b: ChunkRef) -> ChunkRef {
    let merged = a.size(region) + BOUNDARY_SIZE + b.size(region);
    a.set_size(region, merged);
    let after = a.next_boundary(region);
    after.set_prev_size(region, merged);
    a
}

/// Initializes a fresh region of `size` bytes: magic, id, empty free lists,
/// one giant free chunk, and the terminal sentinel.
pub fn init_region(region: &mut [u8], size: u64, id: u64) {
    Header::set_magic(region, MAGIC);
    Header::set_id(region, id);
    Header::set_size(region, size);
    Header::set_user_slot(region, Offset::NULL);
    region[HDR_FREE_BMAP as usize..HEADER_SIZE as usize].fill(0);

    let first = ChunkRef::at(HEADER_SIZE);
    let payload = size - HEADER_SIZE - BOUNDARY_SIZE;
    first.init(region, 0, payload, false);
    let sentinel = first.next_boundary(region);
    sentinel.init(region, payload, 0, false);

    add_to_free_list(region, first);
}

/// Returns the sentinel boundary: the zero-size, never-free chunk that
/// terminates the region.
pub fn last_boundary(region: &[u8]) -> ChunkRef {
    ChunkRef::at(Header::size(region) - BOUNDARY_SIZE)
}

/// Searches the free lists for a chunk whose payload is `>= sz`, per the
/// bucket-then-bitmap strategy in `spec.md §4.2`. Does not remove it.
fn find_free(region: &[u8], sz: u64) -> Option<ChunkRef> {
    let bucket = bucket_of(sz);
    let mut cursor = Header::bucket_head(region, bucket);
    while !cursor.is_null() {
        let cb = ChunkRef::from_user(cursor);
        if cb.size(region) >= sz {
            return Some(cb);
        }
        cursor = cb.next_free(region);
    }

    // Not found in our own bucket; any strictly higher occupied bucket is
    // guaranteed to hold only chunks >= 2^bucket' >= sz.
    let bucket2 = log2_64(next_pow2(sz));
    let shifted = Header::bmap(region) >> bucket2;
    if shifted == 0 {
        return None;
    }
    let higher = bucket2 + shifted.trailing_zeros();
    let head = Header::bucket_head(region, higher);
    debug_assert!(!head.is_null());
    let cb = ChunkRef::from_user(head);
    debug_assert!(cb.size(region) >= sz, "higher bucket must satisfy request");
    Some(cb)
}

/// Attempts an allocation purely from existing free chunks (no grow).
/// Returns `Offset::NULL` if nothing fits.
pub fn try_alloc(region: &mut [u8], requested: u64) -> Offset {
    let sz = align16(requested.max(1));
    let Some(cb) = find_free(region, sz) else {
        return Offset::NULL;
    };

    let avail = cb.size(region);
    if avail >= sz + BOUNDARY_SIZE + MIN_PAYLOAD {
        remove_from_free_list(region, cb);
        let remainder = split_chunk(region, cb, sz);
        let remainder = coalesce_right_if_free(region, remainder);
        add_to_free_list(region, remainder);
    } else {
        remove_from_free_list(region, cb);
    }
    cb.user()
}

fn coalesce_right_if_free(region: &mut [u8], cb: ChunkRef) -> ChunkRef {
    let sentinel = last_boundary(region);
    let right = cb.next_boundary(region);
    if right != sentinel && right.is_free(region) {
        remove_from_free_list(region, right);
        merge_chunks(region, cb, right)
    } else {
        cb
    }
}

/// Frees the chunk owning user payload `off`, coalescing with free
/// neighbours. `off == Offset::NULL` is a no-op. A chunk already marked
/// free is a double-free: fatal in debug builds, a silent no-op otherwise
/// (`spec.md §4.2` edge case (c)).
pub fn free(region: &mut [u8], off: Offset) -> Result<(), AllocError> {
    if off.is_null() {
        return Ok(());
    }
    let mut cb = ChunkRef::from_user(off);
    if cb.is_free(region) {
        debug_assert!(false, "double free at offset {:#x}", off.get());
        return Err(AllocError::DoubleFree(off.get()));
    }

    let sentinel = last_boundary(region);
    let right = cb.next_boundary(region);
    if right != sentinel && right.is_free(region) {
        remove_from_free_list(region, right);
        cb = merge_chunks(region, cb, right);
    }

    let first = ChunkRef::at(HEADER_SIZE);
    if cb != first {
        let left = cb.prev_boundary(region);
        if left.is_free(region) {
            remove_from_free_list(region, left);
            cb = merge_chunks(region, left, cb);
        }
    }

    add_to_free_list(region, cb);
    Ok(())
}

/// Computes how many bytes to ask a grow callback for, given that `needed`
/// additional payload bytes (plus one boundary) are required. Rounds up to
/// a multiple of `GROWTH_QUANTUM`.
pub fn grow_request_size(needed: u64) -> u64 {
    let ask = needed + BOUNDARY_SIZE;
    ask.div_ceil(GROWTH_QUANTUM) * GROWTH_QUANTUM
}

/// Extends the region bookkeeping after the backing storage has already
/// been grown by exactly `added` bytes: the old sentinel becomes a new
/// free chunk, a new sentinel is laid at the new end, and the chunk is
/// inserted into its free list (coalescing with the previous last free
/// chunk if adjacent).
pub fn extend_region(region: &mut [u8], added: u64) {
    let old_size = Header::size(region);
    let old_sentinel = ChunkRef::at(old_size - BOUNDARY_SIZE);
    let new_size = old_size + added;
    Header::set_size(region, new_size);

    let new_payload = added - BOUNDARY_SIZE;
    old_sentinel.init(region, old_sentinel.prev_size(region), new_payload, false);
    let new_sentinel = old_sentinel.next_boundary(region);
    new_sentinel.init(region, new_payload, 0, false);

    let mut grown = old_sentinel;
    let first = ChunkRef::at(HEADER_SIZE);
    if grown != first {
        let left = grown.prev_boundary(region);
        if left.is_free(region) {
            remove_from_free_list(region, left);
            grown = merge_chunks(region, left, grown);
        }
    }
    add_to_free_list(region, grown);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(size: u64) -> Vec<u8> {
        let mut region = vec![0u8; size as usize];
        init_region(&mut region, size, 1);
        region
    }

    #[test]
    fn log2_and_next_pow2() {
        assert_eq!(log2_64(1), 0);
        assert_eq!(log2_64(2), 1);
        assert_eq!(log2_64(3), 1);
        assert_eq!(log2_64(1023), 9);
        assert_eq!(next_pow2(1), 1);
        assert_eq!(next_pow2(2), 2);
        assert_eq!(next_pow2(3), 4);
        assert_eq!(next_pow2(1024), 1024);
        assert_eq!(next_pow2(1025), 2048);
    }

    #[test]
    fn init_creates_one_free_chunk() {
        let region = fresh(4096);
        assert_eq!(Header::magic(&region), MAGIC);
        let first = ChunkRef::at(HEADER_SIZE);
        assert!(first.is_free(&region));
        let sentinel = last_boundary(&region);
        assert!(!sentinel.is_free(&region));
        assert_eq!(sentinel.size(&region), 0);
    }

    #[test]
    fn alloc_and_free_round_trip() {
        let mut region = fresh(4096);
        let a = try_alloc(&mut region, 100);
        assert!(!a.is_null());
        assert_eq!(a.get() % 16, 0);
        free(&mut region, a).unwrap();
        let first = ChunkRef::at(HEADER_SIZE);
        assert!(first.is_free(&region));
    }

    #[test]
    fn double_free_detected() {
        let mut region = fresh(4096);
        let a = try_alloc(&mut region, 64);
        free(&mut region, a).unwrap();
        assert!(free(&mut region, a).is_err());
    }

    #[test]
    fn no_two_adjacent_free_chunks_after_free() {
        let mut region = fresh(4096);
        let a = try_alloc(&mut region, 64);
        let b = try_alloc(&mut region, 64);
        let _c = try_alloc(&mut region, 64);
        free(&mut region, a).unwrap();
        free(&mut region, b).unwrap();

        let mut cb = ChunkRef::at(HEADER_SIZE);
        let sentinel = last_boundary(&region);
        while cb != sentinel {
            let next = cb.next_boundary(&region);
            if next != sentinel {
                assert!(!(cb.is_free(&region) && next.is_free(&region)));
            }
            cb = next;
        }
    }

    #[test]
    fn oom_without_grow_returns_null() {
        let mut region = fresh(4096);
        let a = try_alloc(&mut region, 1 << 20);
        assert!(a.is_null());
    }

    #[test]
    fn grow_request_rounds_up_to_quantum() {
        assert_eq!(grow_request_size(1), GROWTH_QUANTUM);
        assert_eq!(grow_request_size(GROWTH_QUANTUM - BOUNDARY_SIZE), GROWTH_QUANTUM);
        assert_eq!(grow_request_size(GROWTH_QUANTUM), 2 * GROWTH_QUANTUM);
    }

    #[test]
    fn extend_region_grows_last_free_chunk() {
        let mut region = fresh(4096);
        // Consume everything so the sentinel abuts the header with no free chunk.
        let mut allocs = vec![];
        loop {
            let a = try_alloc(&mut region, 128);
            if a.is_null() {
                break;
            }
            allocs.push(a);
        }
        let old_size = Header::size(&region);
        region.resize((old_size + GROWTH_QUANTUM) as usize, 0);
        extend_region(&mut region, GROWTH_QUANTUM);
        assert_eq!(Header::size(&region), old_size + GROWTH_QUANTUM);
        let b = try_alloc(&mut region, 128);
        assert!(!b.is_null());
    }
}
