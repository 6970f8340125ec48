//! Offset <-> address conversions against a region base.
//!
//! Everything that lives inside a region refers to other locations in that
//! region by [`Offset`], never by pointer. An offset of zero is reserved as
//! the null value and never denotes a real, allocatable byte.

use std::fmt;

/// A byte distance from a region's base address. `Offset(0)` is null.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(transparent)]
pub struct Offset(pub u64);

impl Offset {
    pub const NULL: Offset = Offset(0);

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Offset(null)")
        } else {
            write!(f, "Offset(0x{:x})", self.0)
        }
    }
}

impl From<u64> for Offset {
    fn from(v: u64) -> Self {
        Offset(v)
    }
}

/// Converts a pointer within `region` to an [`Offset`], or [`Offset::NULL`]
/// if `ptr` is null.
///
/// # Safety
/// `ptr` must either be null or point somewhere inside `region`.
#[inline]
pub unsafe fn to_offset(region: *const u8, ptr: *const u8) -> Offset {
    if ptr.is_null() {
        return Offset::NULL;
    }
    Offset((ptr as usize - region as usize) as u64)
}

/// Converts an [`Offset`] within `region` back to a pointer. `Offset::NULL`
/// maps to a null pointer.
///
/// # Safety
/// `off` must be `0` or a value previously produced by [`to_offset`] for this
/// same `region`, and must lie within the region's current size.
#[inline]
pub unsafe fn to_ptr(region: *mut u8, off: Offset) -> *mut u8 {
    if off.is_null() {
        std::ptr::null_mut()
    } else {
        region.add(off.0 as usize)
    }
}

/// Rounds `n` up to the nearest multiple of 16, matching the arena's payload
/// alignment.
#[inline]
pub const fn align16(n: u64) -> u64 {
    (n + 15) & !15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_offset_is_zero() {
        assert!(Offset::NULL.is_null());
        assert!(Offset(0).is_null());
        assert!(!Offset(1).is_null());
    }

    #[test]
    fn align16_rounds_up() {
        assert_eq!(align16(0), 0);
        assert_eq!(align16(1), 16);
        assert_eq!(align16(16), 16);
        assert_eq!(align16(17), 32);
    }

    #[test]
    fn roundtrip_through_region() {
        let mut buf = vec![0u8; 256];
        let base = buf.as_mut_ptr();
        unsafe {
            let p = base.add(128);
            let off = to_offset(base, p);
            assert_eq!(off, Offset(128));
            assert_eq!(to_ptr(base, off), p);
            assert_eq!(to_ptr(base, Offset::NULL), std::ptr::null_mut());
            assert_eq!(to_offset(base, std::ptr::null()), Offset::NULL);
        }
    }
}
