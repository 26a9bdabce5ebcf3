//! No-op backend for headless operation and tests.

use crate::backend::FileWatcher;
use crate::error::Result;
use crate::event::{ChangeSet, WatcherMetadata};
use async_trait::async_trait;
use std::process::ExitStatus;

/// A watcher that never reports anything.
#[derive(Debug, Default)]
pub struct DummyWatcher;

impl DummyWatcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileWatcher for DummyWatcher {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn start_init(&self) {}

    async fn wait_for_init(&self) -> Result<()> {
        Ok(())
    }

    async fn get_and_clear_changed_files(&self) -> Result<(ChangeSet, Option<WatcherMetadata>)> {
        Ok((ChangeSet::new(), None))
    }

    async fn wait_for_changed_files(&self) -> Result<()> {
        // Nothing ever changes; park the caller forever.
        futures::future::pending().await
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn waitpid(&self) -> Result<ExitStatus> {
        // No owned process to wait on.
        futures::future::pending().await
    }

    async fn getpid(&self) -> Option<u32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_drain_is_always_empty() {
        let watcher = DummyWatcher::new();
        watcher.start_init().await;
        watcher.wait_for_init().await.unwrap();

        let (files, metadata) = watcher.get_and_clear_changed_files().await.unwrap();
        assert!(files.is_empty());
        assert!(metadata.is_none());
    }

    #[tokio::test]
    async fn test_waitpid_never_resolves() {
        let watcher = DummyWatcher::new();
        let result = timeout(Duration::from_millis(50), watcher.waitpid()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let watcher = DummyWatcher::new();
        watcher.stop().await.unwrap();
        watcher.stop().await.unwrap();
        assert_eq!(watcher.getpid().await, None);
    }

    #[tokio::test]
    async fn test_contract_is_object_safe() {
        let watcher: Box<dyn FileWatcher> = Box::new(DummyWatcher::new());
        assert_eq!(watcher.name(), "dummy");
        watcher.start_init().await;
        watcher.wait_for_init().await.unwrap();
    }
}
