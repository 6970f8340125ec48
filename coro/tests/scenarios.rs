use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use coro::{
    create_killer, create_timeout, sleep, wait_event, yield_now, CoroError, IoMask, ModifPack, Pool, PoolConfig, RunResult,
    Semaphore, Task,
};

fn new_pool() -> Rc<Pool> {
    Pool::new(PoolConfig::default())
}

/// Two tasks, one sleeping and one yielding repeatedly, interleave on a
/// shared log rather than running to completion one after another.
#[test]
fn sleep_and_yield_interleave_on_the_same_pool() {
    let pool = new_pool();
    let log = Rc::new(RefCell::new(Vec::new()));

    let log_a = log.clone();
    let a = Task::new(async move {
        log_a.borrow_mut().push("a-start");
        sleep(Duration::from_millis(20)).await;
        log_a.borrow_mut().push("a-end");
    });

    let log_b = log.clone();
    let b = Task::new(async move {
        for i in 0..5 {
            log_b.borrow_mut().push(if i == 0 { "b-start" } else { "b-tick" });
            yield_now().await;
        }
        log_b.borrow_mut().push("b-end");
    });

    let handle_a = pool.schedule(a, coro::ModifPack::new());
    let _handle_b = pool.schedule(b, coro::ModifPack::new());
    let result = pool.run();

    assert!(matches!(result, RunResult::Idle));
    assert!(handle_a.is_finished());

    let entries = log.borrow();
    let a_start = entries.iter().position(|e| *e == "a-start").unwrap();
    let a_end = entries.iter().position(|e| *e == "a-end").unwrap();
    let b_end = entries.iter().position(|e| *e == "b-end").unwrap();
    // b's yields should have interleaved before a's sleep finished, proving
    // the sleeping task did not block the rest of the pool.
    assert!(b_end > a_start);
    assert!(a_end > a_start);
}

/// A timed-out child task loses the race against its sleeper, yielding
/// `(None, Some(Timeout))`; a child that finishes in time wins instead.
#[test]
fn timeout_races_a_slow_task_against_the_clock() {
    let pool = new_pool();

    let slow = Task::new(async {
        sleep(Duration::from_millis(200)).await;
        42
    });
    let raced = create_timeout(slow, Duration::from_millis(20));
    let handle = pool.schedule(Task::new(raced), coro::ModifPack::new());
    pool.run();

    let (value, err) = handle.try_take().expect("timeout future should resolve");
    assert_eq!(value, None);
    assert!(matches!(err, Some(CoroError::Timeout)));
}

#[test]
fn timeout_does_not_fire_when_the_task_finishes_first() {
    let pool = new_pool();

    let fast = Task::new(async {
        yield_now().await;
        7
    });
    let raced = create_timeout(fast, Duration::from_millis(200));
    let handle = pool.schedule(Task::new(raced), coro::ModifPack::new());
    pool.run();

    let (value, err) = handle.try_take().expect("timeout future should resolve");
    assert_eq!(value, Some(7));
    assert!(err.is_none());
}

/// Firing a killer on a task blocked deep in a call chain (awaiting a
/// sub-task that is itself parked on a long sleep) unwinds every frame up
/// to the root, surfacing as an errored run. A second task scheduled
/// alongside the root fires the kill during the same `run()` call, right
/// after the nested sleep has registered with the reactor but before the
/// pool would otherwise block waiting on it.
#[test]
fn killer_unwinds_a_task_blocked_in_a_nested_call() {
    let pool = new_pool();
    let (pack, trigger) = create_killer(CoroError::Cancelled);

    let grandchild = Task::new(async {
        sleep(Duration::from_secs(3600)).await;
    });
    let root = Task::new(async move {
        grandchild.await;
    });
    let firer = Task::new(async move {
        trigger.fire();
    });

    let _root_handle: coro::TaskHandle<()> = pool.schedule(root, pack);
    let _firer_handle = pool.schedule(firer, coro::ModifPack::new());

    let result = pool.run();

    assert!(matches!(result, RunResult::Errored(_)));
}

/// Destroying a semaphore while a *nested* task (not the root) is parked on
/// `wait()` tears down the whole call-stack, not just the immediate waiter:
/// the root task surfaces the error even though it never touched the
/// semaphore itself.
#[test]
fn destroying_a_semaphore_unwinds_a_nested_waiter() {
    let pool = new_pool();
    let sem = Semaphore::new(&pool, 0);

    let sem_child = sem.clone();
    let grandchild = Task::new(async move {
        let _ = sem_child.wait().await;
    });
    let root = Task::new(async move {
        grandchild.await;
    });

    let sem_destroyer = sem.clone();
    let destroyer = Task::new(async move {
        sem_destroyer.destroy();
    });

    let _root_handle: coro::TaskHandle<()> = pool.schedule(root, ModifPack::new());
    let _destroyer_handle = pool.schedule(destroyer, ModifPack::new());

    let result = pool.run();

    assert!(matches!(result, RunResult::Errored(_)));
}

/// `wait_event` resolves once the watched descriptor becomes readable,
/// without blocking any other scheduled task in the meantime.
#[test]
fn wait_event_resolves_on_pipe_readability() {
    let pool = new_pool();
    let (r, w) = make_pipe();

    let reader = Task::new(async move {
        let mask = wait_event(r, IoMask::READABLE).await.unwrap();
        assert!(mask.intersects(IoMask::READABLE));
        let mut buf = [0u8; 4];
        unsafe { libc::read(r, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        unsafe { libc::close(r) };
        buf
    });
    let handle = pool.schedule(reader, coro::ModifPack::new());

    // Nothing is writable yet: one run() call should leave the pool idle
    // only because it's blocked on the reactor, not because it finished.
    std::thread::sleep(Duration::from_millis(5));
    unsafe {
        libc::write(w, b"ping".as_ptr() as *const libc::c_void, 4);
        libc::close(w);
    }
    pool.run();

    assert_eq!(handle.try_take(), Some(*b"ping"));
}

fn make_pipe() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    unsafe { libc::pipe(fds.as_mut_ptr()) };
    (fds[0], fds[1])
}
