use arena::persist::Persist;
use arena::{ArenaCtx, RegionBytes, RegionConfig, VecRegion};
use serial_test::serial;
use tempfile::tempdir;

/// Plain in-memory round-trip: allocate, write, read back, free.
#[test]
fn arena_round_trip_alloc_write_read_free() {
    let ctx = ArenaCtx::init(VecRegion::new(4096), RegionConfig::default()).unwrap();
    let mut ctx = ctx.borrow_mut();

    let off = ctx.alloc(256);
    assert!(!off.is_null());

    let p = ctx.ptr(off);
    unsafe { std::ptr::write_bytes(p, 0x5A, 256) };
    let p = ctx.ptr(off);
    let bytes = unsafe { std::slice::from_raw_parts(p, 256) };
    assert!(bytes.iter().all(|&b| b == 0x5A));

    let recovered = unsafe { ctx.off(p) };
    assert_eq!(recovered, off);

    ctx.free(off);
}

/// Repeated allocation beyond the initial region size forces growth; every
/// offset handed out before and after the grow stays valid.
#[test]
fn arena_grows_and_keeps_earlier_allocations_valid() {
    let ctx = ArenaCtx::init(VecRegion::new(4096), RegionConfig { initial_size: 4096, fixed_id: None }).unwrap();
    let mut ctx = ctx.borrow_mut();

    let mut offs = Vec::new();
    for i in 0..64u8 {
        let off = ctx.alloc(512);
        assert!(!off.is_null(), "allocation {i} failed");
        let p = ctx.ptr(off);
        unsafe { std::ptr::write_bytes(p, i, 512) };
        offs.push((off, i));
    }

    assert!(ctx.storage().as_bytes().len() as u64 > 4096, "region did not grow");

    for (off, i) in offs {
        let p = ctx.ptr(off);
        let bytes = unsafe { std::slice::from_raw_parts(p, 512) };
        assert!(bytes.iter().all(|&b| b == i), "allocation written before growth was corrupted");
    }
}

/// A committed write survives a simulated crash (process dies without
/// calling `uninit`, leaving the control block's `in_use` flag set); an
/// uncommitted write made after that point does not.
#[test]
#[serial]
fn crash_consistent_commit_survives_reopen_uncommitted_writes_do_not() {
    let dir = tempdir().unwrap();
    let ctrl_path = dir.path().join("store");

    let committed_off;
    {
        let mut persist = Persist::init(&ctrl_path).unwrap();
        let off = {
            let mut ctx = persist.ctx();
            let off = ctx.alloc(64);
            let p = ctx.ptr(off);
            unsafe { std::ptr::write_bytes(p, 0x11, 64) };
            ctx.set_user(off);
            off
        };
        persist.submit_changes(false).unwrap();
        committed_off = off;

        // An uncommitted mutation after the last forward commit.
        let mut ctx = persist.ctx();
        let p = ctx.ptr(off);
        unsafe { std::ptr::write_bytes(p, 0x22, 64) };
        drop(ctx);

        // Simulate a crash: drop the handle without calling `uninit`, so the
        // control block's `in_use` flag is never cleared.
        std::mem::forget(persist);
    }

    let mut reopened = Persist::init(&ctrl_path).unwrap();
    let mut ctx = reopened.ctx();
    assert_eq!(ctx.get_user(), committed_off);
    let p = ctx.ptr(committed_off);
    let bytes = unsafe { std::slice::from_raw_parts(p, 64) };
    assert!(bytes.iter().all(|&b| b == 0x11), "crash recovery did not restore the last committed bytes");
}
