//! The counting semaphore (`spec.md §4.8`): FIFO waiters, a `WaitSem`/
//! `UnwaitSem` modification tap per waiter, and the zero-delta "release
//! everyone" broadcast form.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use crate::error::CoroError;
use crate::modif::ModifKind;
use crate::pool::PoolInner;
use crate::task::{current_task, TaskRef, WaitLoc};

struct SemWaiter {
    id: usize,
    task: TaskRef,
    waker: Waker,
    result: Rc<RefCell<Option<Result<(), CoroError>>>>,
}

/// A counting semaphore whose waiters park cooperatively rather than
/// blocking a thread.
pub struct Semaphore {
    counter: RefCell<i64>,
    waiters: RefCell<VecDeque<SemWaiter>>,
    next_waiter_id: RefCell<usize>,
    pool: Weak<PoolInner>,
}

impl Semaphore {
    pub fn new(pool: &Rc<PoolInner>, initial: i64) -> Rc<Self> {
        let sem = Rc::new(Semaphore {
            counter: RefCell::new(initial),
            waiters: RefCell::new(VecDeque::new()),
            next_waiter_id: RefCell::new(0),
            pool: Rc::downgrade(pool),
        });
        pool.register_semaphore(&sem);
        sem
    }

    #[cfg(test)]
    fn new_detached(initial: i64) -> Rc<Self> {
        Rc::new(Semaphore {
            counter: RefCell::new(initial),
            waiters: RefCell::new(VecDeque::new()),
            next_waiter_id: RefCell::new(0),
            pool: Weak::new(),
        })
    }

    pub fn count(&self) -> i64 {
        *self.counter.borrow()
    }

    /// Takes one unit without blocking if available.
    pub fn try_decrement(&self) -> bool {
        let mut c = self.counter.borrow_mut();
        if *c > 0 {
            *c -= 1;
            true
        } else {
            false
        }
    }

    /// Waits for one unit, suspending the calling task if none is
    /// available right now.
    pub fn wait(self: &Rc<Self>) -> SemWaitFuture {
        SemWaitFuture { sem: self.clone(), registered: None }
    }

    /// `delta == 0` releases every current waiter and zeroes the counter
    /// (the "broadcast" form); otherwise adds `delta` and wakes waiters
    /// while the counter stays positive.
    pub fn signal(&self, delta: i64) {
        let mut c = self.counter.borrow_mut();
        if delta == 0 && *c <= 0 {
            *c = 0;
            drop(c);
            let drained: Vec<_> = self.waiters.borrow_mut().drain(..).collect();
            for w in drained {
                self.release_waiter(w, Ok(()));
            }
            return;
        }
        *c += delta;
        while *c > 0 {
            let Some(w) = self.waiters.borrow_mut().pop_front() else { break };
            *c -= 1;
            drop(c);
            self.release_waiter(w, Ok(()));
            c = self.counter.borrow_mut();
        }
    }

    /// Destroys every waiter's entire call-stack and clears the queue; used
    /// when the semaphore is dropped while tasks are still parked on it
    /// (`spec.md §4.8`: "every waiter's entire call-stack is destroyed").
    /// A plain `Err` handed back through the waiter's own future would only
    /// unwind as far as whatever immediately awaited `wait()` — a nested
    /// callee that swallowed the error would leave its ancestors running.
    /// Instead each waiter's task is force-killed the same way a killer
    /// tears down its target, so the panic cascades through every caller's
    /// `Task::poll` up to the root regardless of who's watching the result.
    pub fn destroy(&self) {
        let drained: Vec<_> = self.waiters.borrow_mut().drain(..).collect();
        for w in drained {
            let _ = w.task.modifs.run_sem(ModifKind::UnwaitSem, &w.task, w.id);
            w.task.force_kill(CoroError::SemDestroyed);
            w.waker.wake();
        }
    }

    fn release_waiter(&self, w: SemWaiter, outcome: Result<(), CoroError>) {
        let _ = w.task.modifs.run_sem(ModifKind::UnwaitSem, &w.task, w.id);
        *w.task.wait.borrow_mut() = WaitLoc::Ready;
        *w.result.borrow_mut() = Some(outcome);
        w.waker.wake();
    }

    /// Erases the waiter identified by `id` from the FIFO, returning the
    /// waker it was registered with so the caller can re-drive the root
    /// task's poll chain itself (`spec.md`'s "erase from the wait list").
    /// The waiter's own future is never resumed through the normal path.
    pub(crate) fn cancel_waiter(&self, id: usize) -> Option<Waker> {
        let mut waiters = self.waiters.borrow_mut();
        let pos = waiters.iter().position(|w| w.id == id)?;
        Some(waiters.remove(pos).unwrap().waker)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.destroy();
    }
}

pub struct SemWaitFuture {
    sem: Rc<Semaphore>,
    registered: Option<(usize, Rc<RefCell<Option<Result<(), CoroError>>>>)>,
}

impl Future for SemWaitFuture {
    type Output = Result<(), CoroError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.registered.is_none() {
            if this.sem.try_decrement() {
                return Poll::Ready(Ok(()));
            }
            let Some(task) = current_task() else {
                return Poll::Ready(Err(CoroError::Aborted("semaphore wait outside a task")));
            };
            let id = {
                let mut next = this.sem.next_waiter_id.borrow_mut();
                let id = *next;
                *next += 1;
                id
            };
            if let Err(e) = task.modifs.run_sem(ModifKind::WaitSem, &task, id) {
                return Poll::Ready(Err(e));
            }
            let result = Rc::new(RefCell::new(None));
            *task.wait.borrow_mut() = WaitLoc::Sem { sem: Rc::downgrade(&this.sem), waiter_id: id };
            this.sem.waiters.borrow_mut().push_back(SemWaiter {
                id,
                task: task.clone(),
                waker: cx.waker().clone(),
                result: result.clone(),
            });
            this.registered = Some((id, result));
            return Poll::Pending;
        }

        let (_, result) = this.registered.as_ref().unwrap();
        match result.borrow_mut().take() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_decrement_respects_available_count() {
        let sem = Semaphore::new_detached(1);
        assert!(sem.try_decrement());
        assert!(!sem.try_decrement());
    }

    #[test]
    fn zero_delta_signal_broadcasts_and_zeroes_counter() {
        let sem = Semaphore::new_detached(-3);
        sem.signal(0);
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn positive_signal_increments_when_no_waiters() {
        let sem = Semaphore::new_detached(0);
        sem.signal(2);
        assert_eq!(sem.count(), 2);
    }
}
