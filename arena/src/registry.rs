//! Region-id -> live region registry (§4.3).
//!
//! Relocatable containers never hold a raw pointer across a suspension or
//! persistence boundary; they hold a [`RegionId`] and re-resolve it through
//! this process-wide table on every dereference, so the region can be
//! remapped to a new base address (or reopened by a different process)
//! between accesses.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A stable 64-bit token identifying a region, independent of its current
/// base address. The top bit is always set (`spec.md §3`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RegionId(pub u64);

impl RegionId {
    /// Generates an id from the current time, matching the original
    /// allocator's `generate_ctx_id`: top bit set, low bits from monotonic
    /// microseconds.
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        // Perturb with a counter so back-to-back calls within the same
        // microsecond still produce distinct ids.
        let bump = COUNTER.fetch_add(1, Ordering::Relaxed);
        RegionId((1u64 << 63) | micros.wrapping_add(bump))
    }
}

// Thread-local rather than a process-wide static: the arena is single-writer
// (spec.md Non-goals) and handles are `Rc`, which is not `Send`, so a
// genuinely process-wide table would need `Arc`/`Mutex` for no benefit here.
thread_local! {
    static REGISTRY: RefCell<HashMap<RegionId, Weak<dyn std::any::Any>>> = RefCell::new(HashMap::new());
}

/// Registers `handle` under `id`, replacing any previous (now-dead)
/// registration. The registry holds only a weak reference: once the last
/// strong handle drops, the id naturally falls out of the table.
pub fn register<T: std::any::Any>(id: RegionId, handle: &Rc<T>) {
    REGISTRY.with(|r| {
        r.borrow_mut().insert(id, Rc::downgrade(handle) as Weak<dyn std::any::Any>);
    });
}

/// True if `id` names a handle that is either still live or was never
/// evicted from the table (used to detect registration collisions).
pub fn is_live(id: RegionId) -> bool {
    REGISTRY.with(|r| {
        let mut reg = r.borrow_mut();
        match reg.get(&id) {
            Some(weak) if weak.strong_count() == 0 => {
                reg.remove(&id);
                false
            }
            Some(_) => true,
            None => false,
        }
    })
}

/// Looks up the live handle registered under `id`, downcasting to `T`.
pub fn get<T: std::any::Any>(id: RegionId) -> Option<Rc<T>> {
    REGISTRY.with(|r| {
        let reg = r.borrow();
        let weak = reg.get(&id)?;
        let any_rc = weak.upgrade()?;
        any_rc.downcast::<T>().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(u32);

    #[test]
    fn register_and_get_round_trip() {
        let id = RegionId::generate();
        let handle = Rc::new(Dummy(42));
        register(id, &handle);
        let got = get::<Dummy>(id).unwrap();
        assert_eq!(got.0, 42);
    }

    #[test]
    fn dropping_last_handle_evicts_id() {
        let id = RegionId::generate();
        {
            let handle = Rc::new(Dummy(1));
            register(id, &handle);
            assert!(is_live(id));
        }
        assert!(!is_live(id));
        assert!(get::<Dummy>(id).is_none());
    }

    #[test]
    fn generated_ids_have_top_bit_set() {
        let id = RegionId::generate();
        assert_ne!(id.0 & (1 << 63), 0);
    }
}
