//! The task handle and state block (`spec.md §4.5`), mapped onto a real
//! `Future` rather than a hand-rolled coroutine frame: Rust's `async`/
//! `.await` already generates the state machine the original spec asks a
//! task to be.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::error::CoroError;
use crate::modif::{ModifKind, ModifTable};
use crate::pool::PoolInner;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskId(pub u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Where a suspended task is currently parked, so a killer or `stop_io`
/// can find and force-wake it without a separate global index.
#[derive(Clone)]
pub(crate) enum WaitLoc {
    None,
    Ready,
    Io(RawFd),
    Sem { sem: Weak<crate::semaphore::Semaphore>, waiter_id: usize },
}

/// The state block behind every task: reference-counted and shared
/// between the pool's ready queue, the reactor/semaphore waiter lists, and
/// any `Task<T>` handles awaiting it.
pub struct TaskState {
    pub id: TaskId,
    pub(crate) pool: RefCell<Weak<PoolInner>>,
    pub(crate) caller: RefCell<Option<TaskRef>>,
    pub(crate) fut: RefCell<Option<Pin<Box<dyn Future<Output = ()>>>>>,
    pub modifs: ModifTable,
    pub(crate) panic_payload: RefCell<Option<Box<dyn Any + Send>>>,
    pub(crate) queued: Cell<bool>,
    pub(crate) started: Cell<bool>,
    pub(crate) completed: Cell<bool>,
    pub(crate) call_entered: Cell<bool>,
    pub(crate) wait: RefCell<WaitLoc>,
}

pub type TaskRef = Rc<TaskState>;

impl TaskState {
    pub(crate) fn new(fut: Pin<Box<dyn Future<Output = ()>>>) -> Self {
        TaskState {
            id: TaskId::next(),
            pool: RefCell::new(Weak::new()),
            caller: RefCell::new(None),
            fut: RefCell::new(Some(fut)),
            modifs: ModifTable::new(),
            panic_payload: RefCell::new(None),
            queued: Cell::new(false),
            started: Cell::new(false),
            completed: Cell::new(false),
            call_entered: Cell::new(false),
            wait: RefCell::new(WaitLoc::None),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_stub_with_id(id: TaskId) -> Rc<Self> {
        Rc::new(TaskState {
            id,
            pool: RefCell::new(Weak::new()),
            caller: RefCell::new(None),
            fut: RefCell::new(Some(Box::pin(std::future::ready(())))),
            modifs: ModifTable::new(),
            panic_payload: RefCell::new(None),
            queued: Cell::new(false),
            started: Cell::new(false),
            completed: Cell::new(false),
            call_entered: Cell::new(false),
            wait: RefCell::new(WaitLoc::None),
        })
    }

    pub(crate) fn wake_self(self: &Rc<Self>) {
        if let Some(pool) = self.pool.borrow().upgrade() {
            pool.wake(self);
        }
    }

    /// Force-completes this task with `err` without ever resuming its
    /// body, then wakes the chain of ancestors so the panic it leaves
    /// behind unwinds through every caller's `Task::poll` up to the root
    /// (a killer's "destroy every frame but the root").
    pub(crate) fn force_kill(self: &Rc<Self>, err: CoroError) {
        if self.completed.get() {
            return;
        }
        self.modifs.run_notify(ModifKind::Exit, self);
        *self.fut.borrow_mut() = None;
        *self.wait.borrow_mut() = WaitLoc::None;
        *self.panic_payload.borrow_mut() = Some(Box::new(err));
        // Only a root task (no caller) needs to be visited by run()'s
        // ready-queue loop directly; a callee's completion is discovered
        // when whatever wakes its caller's waker re-drives the poll chain.
        // wake_self() must run before `completed` is set: pool.wake()
        // no-ops on an already-completed task, so a root task killed while
        // sitting in the ready queue (spliced out by the caller first)
        // would otherwise never be re-queued to surface its panic.
        if self.caller.borrow().is_none() {
            self.wake_self();
        }
        self.completed.set(true);
    }
}

#[cfg(test)]
pub(crate) fn dummy_task_ref_for_modif_tests(id: TaskId) -> TaskRef {
    TaskState::new_stub_with_id(id)
}

const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);

unsafe fn clone_raw(ptr: *const ()) -> RawWaker {
    Rc::increment_strong_count(ptr as *const TaskState);
    RawWaker::new(ptr, &WAKER_VTABLE)
}

unsafe fn wake_raw(ptr: *const ()) {
    let rc = Rc::from_raw(ptr as *const TaskState);
    rc.wake_self();
}

unsafe fn wake_by_ref_raw(ptr: *const ()) {
    let rc = std::mem::ManuallyDrop::new(Rc::from_raw(ptr as *const TaskState));
    rc.wake_self();
}

unsafe fn drop_raw(ptr: *const ()) {
    drop(Rc::from_raw(ptr as *const TaskState));
}

pub(crate) fn make_waker(state: &TaskRef) -> Waker {
    let ptr = Rc::into_raw(state.clone()) as *const ();
    unsafe { Waker::from_raw(RawWaker::new(ptr, &WAKER_VTABLE)) }
}

thread_local! {
    static CURRENT: RefCell<Vec<TaskRef>> = RefCell::new(Vec::new());
}

/// The task whose future is synchronously on the call stack right now, if
/// any — used to identify the "caller" when one task awaits another.
pub(crate) fn current_task() -> Option<TaskRef> {
    CURRENT.with(|c| c.borrow().last().cloned())
}

/// Polls `state`'s future once, running Enter/Leave/Exit notifications
/// around the delegate poll and capturing panics into the task's
/// exception slot (`spec.md`'s "exceptions-as-control-flow", mapped to
/// `catch_unwind`/`resume_unwind`).
pub(crate) fn poll_task(state: &TaskRef, cx: &mut Context<'_>) -> Poll<()> {
    if state.completed.get() {
        return Poll::Ready(());
    }
    CURRENT.with(|c| c.borrow_mut().push(state.clone()));

    if state.started.get() {
        state.modifs.run_notify(ModifKind::Enter, state);
    } else {
        state.started.set(true);
    }

    let result = {
        let mut fut_slot = state.fut.borrow_mut();
        let fut = fut_slot.as_mut().expect("polled a task with no future");
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| fut.as_mut().poll(cx)))
    };

    let out = match result {
        Ok(Poll::Pending) => {
            state.modifs.run_notify(ModifKind::Leave, state);
            Poll::Pending
        }
        Ok(Poll::Ready(())) => {
            state.modifs.run_notify(ModifKind::Leave, state);
            state.modifs.run_notify(ModifKind::Exit, state);
            state.completed.set(true);
            *state.fut.borrow_mut() = None;
            Poll::Ready(())
        }
        Err(payload) => {
            *state.panic_payload.borrow_mut() = Some(payload);
            state.modifs.run_notify(ModifKind::Leave, state);
            state.modifs.run_notify(ModifKind::Exit, state);
            state.completed.set(true);
            *state.fut.borrow_mut() = None;
            Poll::Ready(())
        }
    };

    CURRENT.with(|c| {
        c.borrow_mut().pop();
    });
    out
}

/// A typed task handle: awaitable like any other future, but suspending
/// through it runs the call/leave/enter/exit bookkeeping `spec.md §4.5`
/// describes for "await on a task from inside another task".
pub struct Task<T> {
    pub(crate) state: TaskRef,
    pub(crate) slot: Rc<RefCell<Option<T>>>,
}

impl<T: 'static> Task<T> {
    pub fn new(fut: impl Future<Output = T> + 'static) -> Self {
        let slot = Rc::new(RefCell::new(None));
        let slot2 = slot.clone();
        let wrapped: Pin<Box<dyn Future<Output = ()>>> = Box::pin(async move {
            let v = fut.await;
            *slot2.borrow_mut() = Some(v);
        });
        Task { state: Rc::new(TaskState::new(wrapped)), slot }
    }

    pub fn id(&self) -> TaskId {
        self.state.id
    }

    pub(crate) fn state(&self) -> &TaskRef {
        &self.state
    }
}

impl<T: 'static> Future for Task<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();

        if !this.state.call_entered.get() {
            this.state.call_entered.set(true);
            if let Some(caller) = current_task() {
                caller.modifs.run_notify(ModifKind::Leave, &caller);
                *this.state.caller.borrow_mut() = Some(caller.clone());
                *this.state.pool.borrow_mut() = caller.pool.borrow().clone();
                this.state.modifs.graft_from(&caller.modifs, true);
                if let Err(e) = this.state.modifs.run_transition(ModifKind::Call, &this.state) {
                    caller.modifs.run_notify(ModifKind::Enter, &caller);
                    std::panic::panic_any(e);
                }
            }
        }

        match poll_task(&this.state, cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => {
                if let Some(payload) = this.state.panic_payload.borrow_mut().take() {
                    std::panic::resume_unwind(payload);
                }
                let value = this.slot.borrow_mut().take().expect("task completed without a value");
                Poll::Ready(value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_poll_without_pool_still_produces_value() {
        let task = Task::new(async { 41 + 1 });
        let waker = make_waker(&task.state);
        let mut cx = Context::from_waker(&waker);
        let mut pinned = Box::pin(task);
        match pinned.as_mut().poll(&mut cx) {
            Poll::Ready(v) => assert_eq!(v, 42),
            Poll::Pending => panic!("expected ready"),
        }
    }

    #[test]
    fn panicking_task_resumes_unwind_through_await() {
        let task: Task<i32> = Task::new(async { panic!("boom") });
        let waker = make_waker(&task.state);
        let mut cx = Context::from_waker(&waker);
        let mut pinned = Box::pin(task);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| pinned.as_mut().poll(&mut cx)));
        assert!(result.is_err());
    }
}
