use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoroError {
    #[error("the awaited operation was cancelled")]
    Cancelled,
    #[error("operation timed out")]
    Timeout,
    #[error("a modification callback rejected a transition")]
    ModifRejected,
    #[error("semaphore was destroyed while tasks were waiting on it")]
    SemDestroyed,
    #[error("I/O error")]
    Io(#[source] std::io::Error),
    #[error("the multiplexer reported a fatal error")]
    Reactor(#[source] std::io::Error),
    #[error("an internal scheduler invariant was violated: {0}")]
    Aborted(&'static str),
}

/// The outcome of a call to [`crate::Pool::run`].
#[derive(Debug)]
#[non_exhaustive]
pub enum RunResult {
    /// The ready queue and multiplexer both drained with nothing left to do.
    Idle,
    /// A multiplexer or OS-level failure forced the run loop to stop.
    Errored(CoroError),
    /// An internal invariant was violated.
    Aborted(&'static str),
    /// `force_stop` was called; `run()` can be called again to resume.
    Stopped(i64),
}
