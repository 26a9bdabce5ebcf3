//! Nested source-control transaction tracking.
//!
//! While any transaction scope is open, repository state must not be read, so
//! work that touches it (mergebase recomputation) is deferred here and flushed
//! the moment the nesting depth returns to zero.

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

/// A unit of work postponed until no transaction is in flight.
pub type DeferredAction = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Depth counter with a FIFO queue of deferred actions.
///
/// Owned by a single task (the listen loop); not shared.
pub struct TransactionTracker {
    depth: u32,
    deferred: VecDeque<DeferredAction>,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self {
            depth: 0,
            deferred: VecDeque::new(),
        }
    }

    /// No transaction is currently open.
    pub fn is_idle(&self) -> bool {
        self.depth == 0
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// A transaction scope opened.
    pub fn enter(&mut self) {
        self.depth += 1;
        debug!("transaction entered, depth now {}", self.depth);
    }

    /// A transaction scope closed. On returning to depth zero, every deferred
    /// action runs to completion in registration order before this returns.
    pub async fn leave(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::UnexpectedEvent(
                "transaction leave without a matching enter".to_string(),
            ));
        }
        self.depth -= 1;
        debug!("transaction left, depth now {}", self.depth);

        if self.depth == 0 && !self.deferred.is_empty() {
            debug!("flushing {} deferred action(s)", self.deferred.len());
            while let Some(action) = self.deferred.pop_front() {
                action.await?;
            }
        }
        Ok(())
    }

    /// Run `action` now if idle, otherwise queue it until the depth next
    /// returns to zero.
    pub async fn register(&mut self, action: DeferredAction) -> Result<()> {
        if self.depth == 0 {
            action.await
        } else {
            self.deferred.push_back(action);
            Ok(())
        }
    }
}

impl Default for TransactionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording_action(log: &Arc<Mutex<Vec<u32>>>, id: u32) -> DeferredAction {
        let log = log.clone();
        Box::pin(async move {
            log.lock().unwrap().push(id);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_idle_registration_runs_immediately() {
        let mut tracker = TransactionTracker::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        tracker.register(recording_action(&log, 1)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_deferred_actions_flush_in_registration_order() {
        let mut tracker = TransactionTracker::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        tracker.enter();
        for id in 0..5 {
            tracker.register(recording_action(&log, id)).await.unwrap();
        }
        assert!(log.lock().unwrap().is_empty());

        tracker.leave().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(tracker.is_idle());
    }

    #[tokio::test]
    async fn test_nested_scopes_flush_only_at_depth_zero() {
        let mut tracker = TransactionTracker::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        tracker.enter();
        tracker.register(recording_action(&log, 1)).await.unwrap();
        tracker.enter();
        assert_eq!(tracker.depth(), 2);

        // Depth decreased but did not reach zero: nothing may run yet.
        tracker.leave().await.unwrap();
        assert!(log.lock().unwrap().is_empty());

        tracker.leave().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_leave_without_enter_is_an_error() {
        let mut tracker = TransactionTracker::new();
        let result = tracker.leave().await;
        assert!(matches!(result, Err(Error::UnexpectedEvent(_))));
    }

    #[tokio::test]
    async fn test_queue_clears_after_flush() {
        let mut tracker = TransactionTracker::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        tracker.enter();
        tracker.register(recording_action(&log, 1)).await.unwrap();
        tracker.leave().await.unwrap();

        // A later enter/leave cycle must not replay old actions.
        tracker.enter();
        tracker.leave().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }
}
