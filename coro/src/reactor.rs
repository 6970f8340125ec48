//! The epoll-based readiness multiplexer (`spec.md §4.6`, readiness-style
//! backend). Awaiters on the same descriptor with overlapping masks are
//! rejected to keep the per-fd accounting injective, as the spec requires.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::task::Waker;

use crate::error::CoroError;
use crate::task::TaskRef;

/// A bitmask of readiness events, mirroring the `EPOLLIN`/`EPOLLOUT`/etc.
/// bits directly so no translation table is needed at the syscall
/// boundary.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct IoMask(pub u32);

impl IoMask {
    pub const NONE: IoMask = IoMask(0);
    pub const READABLE: IoMask = IoMask(libc::EPOLLIN as u32);
    pub const WRITABLE: IoMask = IoMask(libc::EPOLLOUT as u32);
    pub const ERROR: IoMask = IoMask(libc::EPOLLERR as u32);
    pub const HUP: IoMask = IoMask(libc::EPOLLHUP as u32);

    pub fn intersects(self, other: IoMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for IoMask {
    type Output = IoMask;
    fn bitor(self, rhs: Self) -> Self::Output {
        IoMask(self.0 | rhs.0)
    }
}

struct Waiter {
    mask: IoMask,
    task: TaskRef,
    waker: Waker,
    result: std::rc::Rc<std::cell::RefCell<Option<Result<IoMask, CoroError>>>>,
}

struct FdState {
    composite: IoMask,
    waiters: Vec<Waiter>,
}

/// The reactor owns the epoll instance and per-fd waiter bookkeeping. One
/// lives per pool; it is never shared across threads.
pub struct Reactor {
    epoll_fd: RawFd,
    fds: HashMap<RawFd, FdState>,
}

impl Reactor {
    pub fn new() -> Result<Self, CoroError> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(CoroError::Reactor(std::io::Error::last_os_error()));
        }
        Ok(Reactor { epoll_fd, fds: HashMap::new() })
    }

    pub fn active_waiter_count(&self) -> usize {
        self.fds.values().map(|s| s.waiters.len()).sum()
    }

    /// Registers a new waiter for `fd`/`mask`. Returns an error if another
    /// waiter on the same fd already has an overlapping mask.
    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        mask: IoMask,
        task: TaskRef,
        waker: Waker,
        result: std::rc::Rc<std::cell::RefCell<Option<Result<IoMask, CoroError>>>>,
    ) -> Result<(), CoroError> {
        let entry = self.fds.entry(fd).or_insert_with(|| FdState { composite: IoMask::NONE, waiters: Vec::new() });
        if entry.waiters.iter().any(|w| w.mask.intersects(mask)) {
            return Err(CoroError::Aborted("overlapping waiter mask on the same descriptor"));
        }
        let new_composite = entry.composite | mask;
        let op = if entry.composite.is_empty() { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_MOD };
        if new_composite.0 != entry.composite.0 || op == libc::EPOLL_CTL_ADD {
            let mut ev = libc::epoll_event { events: new_composite.0, u64: fd as u64 };
            let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
            if rc != 0 {
                return Err(CoroError::Reactor(std::io::Error::last_os_error()));
            }
        }
        entry.composite = new_composite;
        entry.waiters.push(Waiter { mask, task, waker, result });
        Ok(())
    }

    /// Forces every waiter on `fd` awake with `Err(CoroError::Cancelled)`
    /// and removes the fd from epoll entirely.
    pub fn stop_io(&mut self, fd: RawFd) {
        if let Some(state) = self.fds.remove(&fd) {
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
            for w in state.waiters {
                *w.result.borrow_mut() = Some(Err(CoroError::Cancelled));
                w.waker.wake();
            }
        }
    }

    /// Erases exactly the waiter belonging to `task_id` on `fd` without
    /// waking it, returning its waker so a killer can drive the unwind
    /// itself. Used instead of `stop_io` when only one of possibly several
    /// waiters on the fd is being torn down.
    pub(crate) fn take_waiter_for_task(&mut self, fd: RawFd, task_id: crate::task::TaskId) -> Option<Waker> {
        let state = self.fds.get_mut(&fd)?;
        let pos = state.waiters.iter().position(|w| w.task.id == task_id)?;
        let w = state.waiters.remove(pos);
        if state.waiters.is_empty() {
            self.fds.remove(&fd);
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
        Some(w.waker)
    }

    /// Wakes every waiter currently registered, across every fd, with
    /// `Err(CoroError::Cancelled)` — used by `Pool::clear`.
    pub fn cancel_all(&mut self) {
        for (fd, state) in self.fds.drain() {
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
            for w in state.waiters {
                *w.result.borrow_mut() = Some(Err(CoroError::Cancelled));
                w.waker.wake();
            }
        }
    }

    /// Services one round of completions. `block` selects whether to wait
    /// indefinitely (used when the ready queue is otherwise empty) or
    /// return immediately.
    pub fn poll_once(&mut self, block: bool) -> Result<(), CoroError> {
        if self.fds.is_empty() {
            return Ok(());
        }
        let timeout = if block { -1 } else { 0 };
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 64];
        let n = unsafe { libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), events.len() as i32, timeout) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(CoroError::Reactor(err));
        }
        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;
            let delivered = IoMask(ev.events);
            self.dispatch(fd, delivered);
        }
        Ok(())
    }

    fn dispatch(&mut self, fd: RawFd, delivered: IoMask) {
        let Some(state) = self.fds.get_mut(&fd) else { return };
        let mut remaining = Vec::with_capacity(state.waiters.len());
        let mut composite = IoMask::NONE;
        for w in state.waiters.drain(..) {
            if w.mask.intersects(delivered) {
                *w.result.borrow_mut() = Some(Ok(delivered));
                w.waker.wake();
            } else {
                composite = composite | w.mask;
                remaining.push(w);
            }
        }
        state.waiters = remaining;
        state.composite = composite;

        if state.waiters.is_empty() {
            self.fds.remove(&fd);
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        } else {
            let mut ev = libc::epoll_event { events: composite.0, u64: fd as u64 };
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev);
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reactor_creates_and_closes_cleanly() {
        let reactor = Reactor::new().unwrap();
        assert_eq!(reactor.active_waiter_count(), 0);
    }
}
