//! Polling backend: drives an external poll-based watcher process.
//!
//! The poller is spawned over the configured roots and writes one JSON array
//! of changed paths per line on its stdout. It is not a real file-watch
//! subscription — the process polls internally; we only accumulate whatever
//! batches it has produced since we last looked. Any break in that pipe is
//! fatal: the supervising server restarts the whole watcher.

use crate::backend::{FileWatcher, POLL_INTERVAL};
use crate::config::WatcherConfig;
use crate::error::{Error, Result};
use crate::event::{ChangeSet, WatcherMetadata};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// The poller process plus the channel its batches arrive on.
struct Connection {
    child: Child,
    batches: mpsc::UnboundedReceiver<ChangeSet>,
}

enum Phase {
    Uninitialized,
    Ready(Connection),
    Failed(String),
    Stopped,
}

struct PollingState {
    phase: Phase,
    pending: ChangeSet,
}

/// Watcher backed by an external polling subprocess.
pub struct PollingWatcher {
    config: WatcherConfig,
    /// Single lock over connection and pending set, so only one fetch is ever
    /// in flight against the process channel.
    state: Mutex<PollingState>,
}

impl PollingWatcher {
    pub fn new(config: WatcherConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PollingState {
                phase: Phase::Uninitialized,
                pending: ChangeSet::new(),
            }),
        }
    }

    fn spawn_poller(&self) -> std::io::Result<Child> {
        Command::new(&self.config.poll_program)
            .args(&self.config.poll_args)
            .args(&self.config.roots)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    /// Read decoded batches from the poller and forward them until the pipe
    /// closes. Dropping the sender is how fetch observes death.
    fn spawn_reader(stdout: ChildStdout) -> mpsc::UnboundedReceiver<ChangeSet> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Vec<PathBuf>>(line) {
                            Ok(paths) => {
                                let batch: ChangeSet = paths.into_iter().collect();
                                debug!("poller delivered a batch of {} path(s)", batch.len());
                                if tx.send(batch).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("undecodable batch from poller: {}", e);
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("poller closed its change pipe");
                        break;
                    }
                    Err(e) => {
                        warn!("error reading from poller: {}", e);
                        break;
                    }
                }
            }
        });
        rx
    }

    /// Union every batch currently available into `pending`. Must be called
    /// with the state lock held.
    fn fetch(state: &mut PollingState) -> Result<()> {
        let batches = match &mut state.phase {
            Phase::Ready(conn) => &mut conn.batches,
            Phase::Uninitialized => {
                return Err(Error::NotInitialized("polling watcher was never started"))
            }
            Phase::Failed(reason) => return Err(Error::Init(reason.clone())),
            Phase::Stopped => return Err(Error::NotInitialized("polling watcher was stopped")),
        };
        drain_batches(batches, &mut state.pending)
    }
}

/// Move every already-delivered batch from the reader channel into `pending`.
///
/// A disconnected channel means the poller died (broken pipe, eof or an
/// explicit disconnect); in that case `pending` is left exactly as it was, so
/// a failed fetch never publishes a partial read.
fn drain_batches(
    batches: &mut mpsc::UnboundedReceiver<ChangeSet>,
    pending: &mut ChangeSet,
) -> Result<()> {
    let mut fresh = ChangeSet::new();
    loop {
        match batches.try_recv() {
            Ok(batch) => fresh.extend(batch),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                return Err(Error::WatcherDied(
                    "change pipe closed (broken pipe, eof or disconnect)".to_string(),
                ));
            }
        }
    }
    pending.extend(fresh);
    Ok(())
}

#[async_trait]
impl FileWatcher for PollingWatcher {
    fn name(&self) -> &'static str {
        "polling"
    }

    async fn start_init(&self) {
        let mut state = self.state.lock().await;
        if !matches!(state.phase, Phase::Uninitialized) {
            warn!("polling watcher start_init called twice, ignoring");
            return;
        }
        match self.spawn_poller() {
            Ok(mut child) => {
                let Some(stdout) = child.stdout.take() else {
                    state.phase = Phase::Failed("poller spawned without a stdout pipe".to_string());
                    return;
                };
                info!(
                    "spawned poller {} (pid {:?}) over {} root(s)",
                    self.config.poll_program.display(),
                    child.id(),
                    self.config.roots.len()
                );
                let batches = Self::spawn_reader(stdout);
                state.phase = Phase::Ready(Connection { child, batches });
            }
            Err(e) => {
                state.phase = Phase::Failed(format!(
                    "could not spawn poller {}: {}",
                    self.config.poll_program.display(),
                    e
                ));
            }
        }
    }

    async fn wait_for_init(&self) -> Result<()> {
        let state = self.state.lock().await;
        match &state.phase {
            Phase::Ready(_) => Ok(()),
            Phase::Failed(reason) => Err(Error::Init(reason.clone())),
            Phase::Uninitialized => Err(Error::NotInitialized(
                "wait_for_init called before start_init",
            )),
            Phase::Stopped => Err(Error::NotInitialized("polling watcher was stopped")),
        }
    }

    async fn get_and_clear_changed_files(&self) -> Result<(ChangeSet, Option<WatcherMetadata>)> {
        let mut state = self.state.lock().await;
        PollingWatcher::fetch(&mut state)?;
        let files = std::mem::take(&mut state.pending);
        Ok((files, None))
    }

    async fn wait_for_changed_files(&self) -> Result<()> {
        loop {
            {
                let mut state = self.state.lock().await;
                PollingWatcher::fetch(&mut state)?;
                if !state.pending.is_empty() {
                    return Ok(());
                }
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut state.phase, Phase::Stopped) {
            Phase::Ready(mut conn) => {
                if let Err(e) = conn.child.start_kill() {
                    debug!("poller already gone on stop: {}", e);
                }
                match conn.child.wait().await {
                    Ok(status) => info!("poller stopped ({})", status),
                    Err(e) => warn!("failed to reap poller: {}", e),
                }
            }
            _ => debug!("polling watcher stop with no live poller"),
        }
        Ok(())
    }

    async fn waitpid(&self) -> Result<ExitStatus> {
        loop {
            {
                let mut state = self.state.lock().await;
                match &mut state.phase {
                    Phase::Ready(conn) => {
                        if let Some(status) = conn.child.try_wait()? {
                            return Ok(status);
                        }
                    }
                    Phase::Failed(reason) => return Err(Error::Init(reason.clone())),
                    Phase::Uninitialized => {
                        return Err(Error::NotInitialized("polling watcher was never started"))
                    }
                    // Already reaped; there is no longer a process to wait on.
                    Phase::Stopped => return futures::future::pending().await,
                }
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn getpid(&self) -> Option<u32> {
        let state = self.state.lock().await;
        match &state.phase {
            Phase::Ready(conn) => conn.child.id(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_unions_batches_and_collapses_duplicates() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pending = ChangeSet::new();

        tx.send([PathBuf::from("a.js")].into_iter().collect())
            .unwrap();
        tx.send(
            [PathBuf::from("a.js"), PathBuf::from("b.js")]
                .into_iter()
                .collect(),
        )
        .unwrap();

        drain_batches(&mut rx, &mut pending).unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.contains(&PathBuf::from("a.js")));
        assert!(pending.contains(&PathBuf::from("b.js")));
    }

    #[tokio::test]
    async fn test_drain_on_dead_channel_leaves_pending_untouched() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pending: ChangeSet = [PathBuf::from("old.js")].into_iter().collect();

        tx.send([PathBuf::from("late.js")].into_iter().collect())
            .unwrap();
        drop(tx);

        let result = drain_batches(&mut rx, &mut pending);
        assert!(matches!(result, Err(Error::WatcherDied(_))));
        // Neither the pre-death batch nor anything else leaked in.
        let expected: ChangeSet = [PathBuf::from("old.js")].into_iter().collect();
        assert_eq!(pending, expected);
    }

    #[tokio::test]
    async fn test_operations_before_start_init_are_typed_errors() {
        let watcher = PollingWatcher::new(WatcherConfig::default());
        assert!(matches!(
            watcher.wait_for_init().await,
            Err(Error::NotInitialized(_))
        ));
        assert!(matches!(
            watcher.get_and_clear_changed_files().await,
            Err(Error::NotInitialized(_))
        ));
    }
}
