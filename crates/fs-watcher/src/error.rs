//! Error taxonomy for the watcher backends.
//!
//! Only one condition is ever recovered locally: a subscription reporting a
//! transient loss of its transport, which is an event (not an error) handled
//! inside the listen loop. Everything here surfaces to the supervising server,
//! which owns the decision to tear down and recreate the watcher.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connecting to the change service or spawning the poller failed.
    /// Surfaced by `wait_for_init`; never retried at this layer.
    #[error("failed to initialize file watcher: {0}")]
    Init(String),

    /// The polling watcher's transport broke (broken pipe, eof, disconnect).
    /// The caller must restart the whole watcher.
    #[error("file watcher process died: {0}")]
    WatcherDied(String),

    /// The subscription delivered an event kind the configured subscription
    /// should never produce. Fail fast rather than silently ignore.
    #[error("subscription invariant violated: {0}")]
    UnexpectedEvent(String),

    /// An operation was called outside the initialized window.
    #[error("watcher not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
