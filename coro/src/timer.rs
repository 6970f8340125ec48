//! The pooled OS timer source (`spec.md §4.7`): a free-stack of
//! `timerfd` descriptors up to a compile-time-configured cap, so that
//! repeated `sleep`/`create_timeout` calls don't pay a syscall for every
//! new timer.

use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::CoroError;

pub struct TimerPool {
    free: Vec<RawFd>,
    cap: usize,
}

impl TimerPool {
    pub fn new(cap: usize) -> Self {
        TimerPool { free: Vec::new(), cap }
    }

    /// Pops a timer from the free stack, creating a new one if it's empty.
    pub fn get_timer(&mut self) -> Result<RawFd, CoroError> {
        if let Some(fd) = self.free.pop() {
            return Ok(fd);
        }
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK) };
        if fd < 0 {
            return Err(CoroError::Reactor(std::io::Error::last_os_error()));
        }
        Ok(fd)
    }

    /// Arms `timer` to fire once after `duration`.
    pub fn set_timer(&self, timer: RawFd, duration: Duration) -> Result<(), CoroError> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec {
                tv_sec: duration.as_secs() as libc::time_t,
                tv_nsec: duration.subsec_nanos() as i64,
            },
        };
        let rc = unsafe { libc::timerfd_settime(timer, 0, &spec, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(CoroError::Reactor(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Drains the timer's expiration counter so it can be reused without
    /// spuriously appearing readable.
    pub fn drain(&self, timer: RawFd) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(timer, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
        }
    }

    /// Returns `timer` to the free stack, closing it instead if the stack
    /// is already at capacity.
    pub fn free_timer(&mut self, timer: RawFd) {
        if self.free.len() < self.cap {
            self.free.push(timer);
        } else {
            unsafe {
                libc::close(timer);
            }
        }
    }
}

impl Drop for TimerPool {
    fn drop(&mut self) {
        for fd in self.free.drain(..) {
            unsafe {
                libc::close(fd);
            }
        }
    }
}
