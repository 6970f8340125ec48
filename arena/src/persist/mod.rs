//! Crash-consistent dual-file mmap persistence for an arena region.

pub mod control;
pub mod dirty;
pub mod store;

pub use dirty::DirtyBitmap;
pub use store::{MappedRegion, Persist};
