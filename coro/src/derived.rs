//! Primitives built entirely out of the modification system and the
//! scheduler's own futures (`spec.md §4.10`): nothing here touches task
//! internals that aren't already exposed through `modif`/`reactor`/
//! `semaphore`/`pool`.

use std::cell::RefCell;
use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::error::CoroError;
use crate::modif::{create_modif, create_notify_modif, ModifFlags, ModifKind, ModifPack};
use crate::pool::Pool;
use crate::reactor::IoMask;
use crate::task::{current_task, Task, TaskRef, WaitLoc};

/// Suspends once and re-queues immediately, giving every other ready task
/// a turn first.
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Suspends for `duration`, backed by a pooled `timerfd`.
pub struct Sleep {
    duration: Duration,
    timer: Option<RawFd>,
    result: Rc<RefCell<Option<Result<IoMask, CoroError>>>>,
}

pub fn sleep(duration: Duration) -> Sleep {
    Sleep { duration, timer: None, result: Rc::new(RefCell::new(None)) }
}

impl Future for Sleep {
    type Output = ();
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let Some(task) = current_task() else { return Poll::Ready(()) };
        let Some(pool) = task.pool.borrow().upgrade() else { return Poll::Ready(()) };

        if this.timer.is_none() {
            let fd = match pool.timers().borrow_mut().get_timer() {
                Ok(fd) => fd,
                Err(_) => return Poll::Ready(()),
            };
            if pool.timers().borrow().set_timer(fd, this.duration).is_err() {
                return Poll::Ready(());
            }
            this.timer = Some(fd);
            let _ = task.modifs.run_io(ModifKind::WaitIo, &task, &mut IoMask::READABLE);
            *task.wait.borrow_mut() = WaitLoc::Io(fd);
            if pool
                .reactor()
                .borrow_mut()
                .register(fd, IoMask::READABLE, task.clone(), cx.waker().clone(), this.result.clone())
                .is_err()
            {
                return Poll::Ready(());
            }
            return Poll::Pending;
        }

        match this.result.borrow_mut().take() {
            Some(_) => {
                let fd = this.timer.take().unwrap();
                pool.timers().borrow().drain(fd);
                pool.timers().borrow_mut().free_timer(fd);
                *task.wait.borrow_mut() = WaitLoc::Ready;
                let _ = task.modifs.run_io(ModifKind::UnwaitIo, &task, &mut IoMask::NONE);
                Poll::Ready(())
            }
            None => Poll::Pending,
        }
    }
}

/// Waits for `mask` readiness on `desc` via the pool's reactor.
pub struct WaitEvent {
    desc: RawFd,
    mask: IoMask,
    registered: bool,
    result: Rc<RefCell<Option<Result<IoMask, CoroError>>>>,
}

pub fn wait_event(desc: RawFd, mask: IoMask) -> WaitEvent {
    WaitEvent { desc, mask, registered: false, result: Rc::new(RefCell::new(None)) }
}

impl Future for WaitEvent {
    type Output = Result<IoMask, CoroError>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(task) = current_task() else {
            return Poll::Ready(Err(CoroError::Aborted("wait_event outside a task")));
        };
        let Some(pool) = task.pool.borrow().upgrade() else {
            return Poll::Ready(Err(CoroError::Aborted("wait_event outside a scheduled task")));
        };

        if !this.registered {
            let mut mask = this.mask;
            if let Err(e) = task.modifs.run_io(ModifKind::WaitIo, &task, &mut mask) {
                return Poll::Ready(Err(e));
            }
            this.mask = mask;
            *task.wait.borrow_mut() = WaitLoc::Io(this.desc);
            if let Err(e) =
                pool.reactor().borrow_mut().register(this.desc, mask, task.clone(), cx.waker().clone(), this.result.clone())
            {
                return Poll::Ready(Err(e));
            }
            this.registered = true;
            return Poll::Pending;
        }

        match this.result.borrow_mut().take() {
            Some(outcome) => {
                *task.wait.borrow_mut() = WaitLoc::Ready;
                let mut mask = outcome.as_ref().copied().unwrap_or(IoMask::NONE);
                let _ = task.modifs.run_io(ModifKind::UnwaitIo, &task, &mut mask);
                Poll::Ready(outcome)
            }
            None => Poll::Pending,
        }
    }
}

/// Signals the pool to stop `run()` after the current task finishes its
/// turn: pushes the calling task onto the front of the ready queue and
/// suspends, so a later call to `run()` transparently continues the task
/// right after this `.await` while surfacing `RunResult::Stopped(value)`
/// to the current one.
pub fn force_stop(value: i64) -> impl Future<Output = ()> {
    ForceStop { value, fired: false }
}

struct ForceStop {
    value: i64,
    fired: bool,
}

impl Future for ForceStop {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if !self.fired {
            self.fired = true;
            if let Some(task) = current_task() {
                if let Some(pool) = task.pool.borrow().upgrade() {
                    pool.request_stop(self.value);
                    pool.wake_front(&root_of(&task));
                }
            }
            return Poll::Pending;
        }
        Poll::Ready(())
    }
}

/// Walks a task's caller chain to the root: the ready queue only ever holds
/// root tasks, so a `force_stop()` called from a nested call must re-queue
/// the ancestor that `run()` actually polls, not the innermost frame.
fn root_of(task: &TaskRef) -> TaskRef {
    let mut current = task.clone();
    loop {
        let next = current.caller.borrow().clone();
        match next {
            Some(caller) => current = caller,
            None => return current,
        }
    }
}

/// Races `task` against a sleeper of `dur`: `(Some(value), None)` if the
/// task wins, `(None, Some(CoroError::Timeout))` if the sleeper does.
/// Polls both concurrently on every wake rather than the call-stack-killer
/// teardown `spec.md` describes: with tasks mapped onto real futures,
/// racing is a plain "poll both, first one ready wins" future, and
/// `create_killer`/`KillerTrigger` are kept as the standalone primitive
/// for direct cancellation instead.
pub fn create_timeout<T: 'static>(task: Task<T>, dur: Duration) -> CreateTimeout<T> {
    CreateTimeout { task: Box::pin(task), sleeper: Box::pin(sleep(dur)) }
}

pub struct CreateTimeout<T> {
    task: Pin<Box<Task<T>>>,
    sleeper: Pin<Box<Sleep>>,
}

impl<T: 'static> Future for CreateTimeout<T> {
    type Output = (Option<T>, Option<CoroError>);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(v) = this.task.as_mut().poll(cx) {
            return Poll::Ready((Some(v), None));
        }
        if let Poll::Ready(()) = this.sleeper.as_mut().poll(cx) {
            return Poll::Ready((None, Some(CoroError::Timeout)));
        }
        Poll::Pending
    }
}

/// Schedules `task` on `pool` and returns a handle that can itself be
/// awaited like any other task, joining the pool's own scheduling with the
/// ergonomics of a plain `Task<T>`.
pub fn create_future<T: 'static>(pool: &Rc<Pool>, task: Task<T>) -> Task<T> {
    let handle = pool.schedule(task, ModifPack::new());
    Task::new(async move {
        loop {
            if let Some(v) = handle.try_take() {
                return v;
            }
            yield_now().await;
        }
    })
}

/// A pack with Call+Schedule+Exit tracing that follows a task's live call
/// chain, plus the trigger used to unwind it (`spec.md §4.10` "killer").
pub struct KillerTrigger {
    stack: Rc<RefCell<Vec<TaskRef>>>,
    err_template: CoroError,
}

pub fn create_killer(err: CoroError) -> (ModifPack, KillerTrigger) {
    let stack = Rc::new(RefCell::new(Vec::new()));
    let mut pack = ModifPack::new();

    let s1 = stack.clone();
    pack.push(create_modif(ModifKind::Call, ModifFlags::BOTH, move |task| {
        s1.borrow_mut().push(task.clone());
        Ok(())
    }));
    let s2 = stack.clone();
    pack.push(create_modif(ModifKind::Schedule, ModifFlags::BOTH, move |task| {
        s2.borrow_mut().push(task.clone());
        Ok(())
    }));
    let s3 = stack.clone();
    pack.push(create_notify_modif(ModifKind::Exit, ModifFlags::BOTH, move |task| {
        s3.borrow_mut().retain(|t| !Rc::ptr_eq(t, task));
    }));

    (pack, KillerTrigger { stack, err_template: clone_coro_error(&err) })
}

fn clone_coro_error(err: &CoroError) -> CoroError {
    match err {
        CoroError::Cancelled => CoroError::Cancelled,
        CoroError::Timeout => CoroError::Timeout,
        CoroError::ModifRejected => CoroError::ModifRejected,
        CoroError::SemDestroyed => CoroError::SemDestroyed,
        CoroError::Aborted(s) => CoroError::Aborted(s),
        CoroError::Io(_) | CoroError::Reactor(_) => CoroError::Aborted("killer error not cloneable"),
    }
}

impl KillerTrigger {
    /// Tears down the innermost live frame on the tracked call chain:
    /// splices it out of wherever it's currently parked (ready queue, I/O
    /// wait, or semaphore wait) and force-completes it with the killer's
    /// error, letting the unwind cascade up through every `Task::poll`
    /// ancestor to the root.
    pub fn fire(&self) {
        let Some(target) = self.stack.borrow().last().cloned() else { return };
        let err = clone_coro_error(&self.err_template);
        let wait = target.wait.borrow().clone();
        let pool = target.pool.borrow().upgrade();

        // Splice the target out of wherever it's parked, keeping hold of
        // whichever waker would otherwise have resumed it, so force_kill
        // can run first and that waker can drive the unwind afterwards.
        let resume_waker = match &wait {
            WaitLoc::Ready => {
                if let Some(pool) = &pool {
                    pool.remove_from_ready(&target);
                }
                None
            }
            WaitLoc::Io(fd) => pool.as_ref().and_then(|p| p.reactor().borrow_mut().take_waiter_for_task(*fd, target.id)),
            WaitLoc::Sem { sem, waiter_id } => sem.upgrade().and_then(|s| s.cancel_waiter(*waiter_id)),
            WaitLoc::None => None,
        };

        target.force_kill(err);
        if let Some(w) = resume_waker {
            w.wake();
        }
    }
}

/// Awaits every task to completion concurrently, preserving input order.
/// A hand-rolled `Future` rather than a `for task in tasks { task.await }`
/// loop: the latter would fully drain task 0 before task 1 is ever polled,
/// serializing work that should interleave.
pub fn wait_all<T: 'static>(tasks: Vec<Task<T>>) -> WaitAll<T> {
    WaitAll { slots: tasks.into_iter().map(|t| (Box::pin(t), None)).collect() }
}

pub struct WaitAll<T> {
    slots: Vec<(Pin<Box<Task<T>>>, Option<T>)>,
}

impl<T: 'static + Unpin> Future for WaitAll<T> {
    type Output = Vec<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Vec<T>> {
        let this = self.get_mut();
        let mut all_ready = true;
        for (fut, slot) in this.slots.iter_mut() {
            if slot.is_none() {
                match fut.as_mut().poll(cx) {
                    Poll::Ready(v) => *slot = Some(v),
                    Poll::Pending => all_ready = false,
                }
            }
        }
        if all_ready {
            Poll::Ready(this.slots.iter_mut().map(|(_, s)| s.take().unwrap()).collect())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modif::ModifPack;
    use crate::pool::PoolConfig;

    #[test]
    fn yield_now_completes_on_second_poll() {
        let pool = crate::pool::PoolInner::new(PoolConfig::default());
        let handle = pool.schedule(
            Task::new(async {
                yield_now().await;
                9
            }),
            ModifPack::new(),
        );
        pool.run();
        assert_eq!(handle.try_take(), Some(9));
    }

    #[test]
    fn wait_all_preserves_order() {
        let pool = crate::pool::PoolInner::new(PoolConfig::default());
        let tasks = vec![Task::new(async { 1 }), Task::new(async { 2 }), Task::new(async { 3 })];
        let handle = pool.schedule(Task::new(wait_all(tasks)), ModifPack::new());
        pool.run();
        assert_eq!(handle.try_take(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn force_stop_suspends_and_resumes_on_next_run() {
        let pool = crate::pool::PoolInner::new(PoolConfig::default());
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        let handle = pool.schedule(
            Task::new(async move {
                log2.borrow_mut().push("before");
                force_stop(7).await;
                log2.borrow_mut().push("after");
            }),
            ModifPack::new(),
        );

        let result = pool.run();
        assert!(matches!(result, crate::error::RunResult::Stopped(7)));
        assert_eq!(*log.borrow(), vec!["before"]);
        assert!(!handle.is_finished());

        let result = pool.run();
        assert!(matches!(result, crate::error::RunResult::Idle));
        assert_eq!(*log.borrow(), vec!["before", "after"]);
        assert!(handle.is_finished());
    }

    #[test]
    fn killer_fires_on_ready_queued_task_before_its_first_poll() {
        let pool = crate::pool::PoolInner::new(PoolConfig::default());
        let (pack, trigger) = create_killer(CoroError::Cancelled);
        let _handle: crate::pool::TaskHandle<()> = pool.schedule(Task::new(async {}), pack);
        trigger.fire();
        let result = pool.run();
        assert!(matches!(result, crate::error::RunResult::Errored(_)));
    }
}
