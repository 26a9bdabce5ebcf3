//! File-change detection for the sift analysis server.
//!
//! A long-running server needs to learn, incrementally and reliably, which
//! source files changed since it last looked, so it can re-analyze only what
//! is necessary. This crate presents one uniform [`FileWatcher`] contract over
//! structurally different change sources:
//!
//! - [`DummyWatcher`]: a no-op for headless operation and tests.
//! - [`PollingWatcher`]: drives an external poll-based watcher subprocess and
//!   accumulates the path batches it writes over a pipe.
//! - [`SubscriptionWatcher`]: holds a persistent connection to a
//!   change-subscription service, consumes its events on a background listen
//!   loop, and tracks source-control transaction scopes so mergebase
//!   recomputation never races a working-copy update.
//!
//! Callers drive every backend the same way: `start_init`, `wait_for_init`,
//! then rounds of `wait_for_changed_files` / `get_and_clear_changed_files`,
//! ending in `stop`.

pub mod backend;
pub mod config;
pub mod error;
pub mod event;
pub mod transaction;

pub use backend::dummy::DummyWatcher;
pub use backend::polling::PollingWatcher;
pub use backend::subscription::{SubscriptionClient, SubscriptionConnection, SubscriptionWatcher};
pub use backend::FileWatcher;
pub use config::{SubscribeSettings, WatcherConfig};
pub use error::{Error, Result};
pub use event::{ChangeSet, ScopePayload, SubscriptionEvent, WatcherMetadata};
pub use transaction::{DeferredAction, TransactionTracker};
