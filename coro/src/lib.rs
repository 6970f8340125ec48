//! A single-threaded cooperative task scheduler: a ready queue, an
//! epoll-based I/O multiplexer, a pooled timer source, counting
//! semaphores, a small-object allocator for the pool's own bookkeeping,
//! and a modification (interceptor) system tapping every transition a
//! task goes through. Coroutines are real `async`/`.await` futures; there
//! is no hand-rolled state machine underneath `Task<T>`.

pub mod derived;
pub mod error;
pub mod modif;
pub mod pool;
pub mod reactor;
pub mod semaphore;
pub mod slab;
pub mod task;
pub mod timer;

pub use derived::{
    create_future, create_killer, create_timeout, force_stop, sleep, wait_all, wait_event, yield_now, KillerTrigger,
};
pub use error::{CoroError, RunResult};
pub use modif::{
    create_io_modif, create_modif, create_notify_modif, create_sem_modif, ModifFlags, ModifHandle, ModifKind, ModifPack,
};
pub use pool::{Pool, PoolConfig, TaskHandle};
pub use reactor::IoMask;
pub use semaphore::Semaphore;
pub use task::{Task, TaskId};
