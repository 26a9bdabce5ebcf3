//! Watcher backends and the contract they share.
//!
//! The server drives every backend the same way: `start_init`, then
//! `wait_for_init`, then any number of `wait_for_changed_files` /
//! `get_and_clear_changed_files` rounds, then `stop`.

pub mod dummy;
pub mod polling;
pub mod subscription;

use crate::error::Result;
use crate::event::{ChangeSet, WatcherMetadata};
use async_trait::async_trait;
use std::process::ExitStatus;
use std::time::Duration;

/// Interval between polls, for both the polling backend's change loop and its
/// process-exit watch. Coarse on purpose; latency is not this backend's job.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Capability contract every backend satisfies.
///
/// Methods take `&self`: backends guard their own state, and the server may
/// call into a backend from more than one task.
#[async_trait]
pub trait FileWatcher: Send + Sync {
    /// Short backend name for log attribution.
    fn name(&self) -> &'static str;

    /// Begin connecting or spawning. Non-blocking; failures surface from
    /// [`FileWatcher::wait_for_init`].
    async fn start_init(&self);

    /// Suspend until the backend is ready, or fail fatally if the connect or
    /// spawn failed. No retry happens at this layer.
    async fn wait_for_init(&self) -> Result<()>;

    /// Atomically snapshot and reset the accumulated changes and metadata.
    /// Backends that never track metadata return `None` for it.
    async fn get_and_clear_changed_files(&self) -> Result<(ChangeSet, Option<WatcherMetadata>)>;

    /// Suspend until at least one changed file is pending. Callable
    /// repeatedly.
    async fn wait_for_changed_files(&self) -> Result<()>;

    /// Idempotent teardown.
    async fn stop(&self) -> Result<()>;

    /// Suspend until the backend's owned process exits. Backends that own no
    /// process never resolve; callers must race this against other signals.
    async fn waitpid(&self) -> Result<ExitStatus>;

    /// Best-effort identifier of the owned process, if any.
    async fn getpid(&self) -> Option<u32>;
}
