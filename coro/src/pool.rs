//! The scheduler itself (`spec.md §4.5`): a ready queue, the reactor, and
//! the timer pool, driven by one `run()` call per thread. No work-stealing,
//! no cross-core scheduling — single-threaded cooperative multitasking
//! only, matching the teacher's own `Non-goals` posture on concurrency.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use crate::error::{CoroError, RunResult};
use crate::reactor::Reactor;
use crate::semaphore::Semaphore;
use crate::slab::SlabPool;
use crate::task::{make_waker, poll_task, TaskRef};
use crate::timer::TimerPool;

/// Tunables mirroring the teacher's plain config-struct-with-defaults
/// idiom: timer pool capacity, the small-object bucket table, and whether
/// to accept work injected from other OS threads.
pub struct PoolConfig {
    pub timer_cap: usize,
    pub slab_buckets: Vec<(usize, usize)>,
    pub cross_thread: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig { timer_cap: 16, slab_buckets: vec![(32, 64), (128, 32), (512, 16)], cross_thread: false }
    }
}

type Injected = Box<dyn FnOnce(&Rc<PoolInner>) + Send>;

/// The pool itself. `Pool` is an alias so the external interface reads
/// exactly as `Pool::new`/`Rc<Pool>`, while internally everything that
/// needs to name the concrete type (tasks holding a `Weak` back-reference)
/// uses `PoolInner`.
pub type Pool = PoolInner;

pub struct PoolInner {
    ready: RefCell<VecDeque<TaskRef>>,
    reactor: RefCell<Reactor>,
    timers: RefCell<TimerPool>,
    slab: RefCell<SlabPool>,
    semaphores: RefCell<Vec<Weak<Semaphore>>>,
    injector: Option<Arc<Mutex<VecDeque<Injected>>>>,
    force_stop: Cell<Option<i64>>,
}

/// A handle to a task scheduled at the top level (not awaited directly by
/// another task). Poll it for the result once the pool has driven it to
/// completion.
pub struct TaskHandle<T> {
    pub(crate) state: TaskRef,
    pub(crate) slot: Rc<RefCell<Option<T>>>,
}

impl<T> TaskHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.state.completed.get()
    }

    pub fn try_take(&self) -> Option<T> {
        self.slot.borrow_mut().take()
    }
}

impl PoolInner {
    pub fn new(cfg: PoolConfig) -> Rc<Self> {
        let injector = cfg.cross_thread.then(|| Arc::new(Mutex::new(VecDeque::new())));
        Rc::new(PoolInner {
            ready: RefCell::new(VecDeque::new()),
            reactor: RefCell::new(Reactor::new().expect("failed to create epoll instance")),
            timers: RefCell::new(TimerPool::new(cfg.timer_cap)),
            slab: RefCell::new(SlabPool::new(&cfg.slab_buckets)),
            semaphores: RefCell::new(Vec::new()),
            injector,
            force_stop: Cell::new(None),
        })
    }

    pub(crate) fn reactor(&self) -> &RefCell<Reactor> {
        &self.reactor
    }

    pub(crate) fn timers(&self) -> &RefCell<TimerPool> {
        &self.timers
    }

    pub(crate) fn slab(&self) -> &RefCell<SlabPool> {
        &self.slab
    }

    pub(crate) fn register_semaphore(&self, sem: &Rc<Semaphore>) {
        self.semaphores.borrow_mut().push(Rc::downgrade(sem));
    }

    /// A sender-side handle for scheduling work from another OS thread,
    /// available only when `PoolConfig::cross_thread` was set.
    pub fn injector(&self) -> Option<Injector> {
        self.injector.clone().map(|queue| Injector { queue })
    }

    fn drain_injected(self: &Rc<Self>) {
        let Some(queue) = &self.injector else { return };
        let jobs: Vec<Injected> = std::mem::take(&mut *queue.lock().unwrap()).into_iter().collect();
        for job in jobs {
            job(self);
        }
    }

    /// Wakes `task`: pushes it onto the ready queue unless it's already
    /// there or has finished.
    pub(crate) fn wake(&self, task: &TaskRef) {
        if task.completed.get() || task.queued.get() {
            return;
        }
        task.queued.set(true);
        self.ready.borrow_mut().push_back(task.clone());
    }

    /// Pushes `task` onto the *front* of the ready queue rather than the
    /// back, for `force_stop`'s "resuming `run()` later transparently
    /// continues the stopped task" requirement: the task that asked for the
    /// stop should be the very next thing `run()` polls, not queued behind
    /// whatever else was already ready.
    pub(crate) fn wake_front(&self, task: &TaskRef) {
        if task.completed.get() || task.queued.get() {
            return;
        }
        task.queued.set(true);
        self.ready.borrow_mut().push_front(task.clone());
    }

    /// Splices `task` out of the ready queue if it's sitting there,
    /// without running it. Used by a killer whose target hasn't been
    /// re-polled yet.
    pub(crate) fn remove_from_ready(&self, task: &TaskRef) -> bool {
        let mut ready = self.ready.borrow_mut();
        if let Some(pos) = ready.iter().position(|t| Rc::ptr_eq(t, task)) {
            ready.remove(pos);
            task.queued.set(false);
            true
        } else {
            false
        }
    }

    pub(crate) fn request_stop(&self, value: i64) {
        if self.force_stop.get().is_none() {
            self.force_stop.set(Some(value));
        }
    }

    /// Schedules a new top-level task, running any `Schedule`-flagged
    /// modifications from `modifs` before the task's first poll.
    pub fn schedule<T: 'static>(
        self: &Rc<Self>,
        task: crate::task::Task<T>,
        modifs: crate::modif::ModifPack,
    ) -> TaskHandle<T> {
        let state = task.state().clone();
        *state.pool.borrow_mut() = Rc::downgrade(self);
        state.modifs.add_pack(&modifs);
        let _ = state.modifs.run_transition(crate::modif::ModifKind::Schedule, &state);
        state.queued.set(true);
        self.ready.borrow_mut().push_back(state.clone());
        tracing::debug!(task_id = state.id.0, "task scheduled");
        TaskHandle { state, slot: task.slot.clone() }
    }

    /// Drives the pool until there is no more work (`RunResult::Idle`),
    /// a top-level task panics (`RunResult::Errored`), or `force_stop` was
    /// requested (`RunResult::Stopped`).
    pub fn run(self: &Rc<Self>) -> RunResult {
        let _span = tracing::debug_span!("pool_run").entered();
        loop {
            self.drain_injected();

            if let Some(value) = self.force_stop.take() {
                tracing::debug!(value, "run() stopped by force_stop");
                return RunResult::Stopped(value);
            }

            // Service the multiplexer, non-blocking, ahead of the ready
            // queue every iteration: a workload that keeps re-enqueuing
            // itself (e.g. a yield_now() loop) would otherwise keep the
            // ready queue permanently non-empty and starve anything parked
            // on sleep()/wait_event(), since the reactor was previously
            // only consulted once the ready queue went empty.
            if self.reactor.borrow().active_waiter_count() > 0 {
                if let Err(e) = self.reactor.borrow_mut().poll_once(false) {
                    return RunResult::Errored(e);
                }
            }

            if let Some(task) = self.ready.borrow_mut().pop_front() {
                task.queued.set(false);
                let waker = make_waker(&task);
                let mut cx = Context::from_waker(&waker);
                if let Poll::Ready(()) = poll_task(&task, &mut cx) {
                    if task.caller.borrow().is_none() {
                        if let Some(payload) = task.panic_payload.borrow_mut().take() {
                            let err = downcast_coro_error(payload);
                            tracing::warn!(task_id = task.id.0, %err, "root task errored");
                            return RunResult::Errored(err);
                        }
                    }
                }
                continue;
            }

            let has_timers_or_io = self.reactor.borrow().active_waiter_count() > 0;
            if !has_timers_or_io {
                return RunResult::Idle;
            }
            if let Err(e) = self.reactor.borrow_mut().poll_once(true) {
                return RunResult::Errored(e);
            }
        }
    }

    /// Destroys every I/O waiter, then every semaphore waiter, then drops
    /// the ready queue, in that order.
    pub fn clear(&self) {
        self.reactor.borrow_mut().cancel_all();
        for weak in self.semaphores.borrow_mut().drain(..) {
            if let Some(sem) = weak.upgrade() {
                sem.destroy();
            }
        }
        self.ready.borrow_mut().clear();
    }

    pub fn stop_io(&self, desc: RawFd) {
        self.reactor.borrow_mut().stop_io(desc);
    }
}

fn downcast_coro_error(payload: Box<dyn std::any::Any + Send>) -> CoroError {
    match payload.downcast::<CoroError>() {
        Ok(e) => *e,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(msg) => CoroError::Aborted(*msg),
            Err(_) => CoroError::Aborted("task panicked with a non-CoroError payload"),
        },
    }
}

/// A cloneable sender for submitting closures to run on the pool's owning
/// thread, drained once per `run()` iteration. Holds only the shared
/// queue, not the pool itself, so it is safely `Send` across threads.
#[derive(Clone)]
pub struct Injector {
    queue: Arc<Mutex<VecDeque<Injected>>>,
}

impl Injector {
    pub fn submit(&self, job: impl FnOnce(&Rc<PoolInner>) + Send + 'static) {
        self.queue.lock().unwrap().push_back(Box::new(job));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modif::ModifPack;
    use crate::task::Task;

    #[test]
    fn schedule_and_run_drives_task_to_completion() {
        let pool = PoolInner::new(PoolConfig::default());
        let handle = pool.schedule(Task::new(async { 7 }), ModifPack::new());
        let result = pool.run();
        assert!(matches!(result, RunResult::Idle));
        assert_eq!(handle.try_take(), Some(7));
    }

    #[test]
    fn panicking_top_level_task_surfaces_as_errored() {
        let pool = PoolInner::new(PoolConfig::default());
        let _handle = pool.schedule(Task::<()>::new(async { panic!("boom") }), ModifPack::new());
        let result = pool.run();
        assert!(matches!(result, RunResult::Errored(_)));
    }
}
