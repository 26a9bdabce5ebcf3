//! Subscription backend: a persistent connection to the change service and
//! the background listen loop consuming its events.
//!
//! The loop is the only writer of the shared pending state. Readers either
//! drain it atomically or park on the notifier, so nothing can interleave
//! between a snapshot and its reset. Source-control transaction scopes are
//! tracked so mergebase recomputation never reads repository state while a
//! transaction is in flight.

use crate::backend::FileWatcher;
use crate::config::{SubscribeSettings, WatcherConfig, TRANSACTION_SCOPE, UPDATE_SCOPE};
use crate::error::{Error, Result};
use crate::event::{ChangeSet, ScopePayload, SubscriptionEvent, WatcherMetadata};
use crate::transaction::{DeferredAction, TransactionTracker};
use async_trait::async_trait;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Deadline handed to every `next_event` request. One week: long enough to
/// never time out spuriously, short enough that the transport is forced into
/// periodic bookkeeping instead of an unbounded wait.
const EVENT_DEADLINE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How long to sleep when the transport reports no live connection, so we do
/// not busy-spin while it reconnects internally.
const UNAVAILABLE_BACKOFF: Duration = Duration::from_secs(1);

/// Factory for subscription connections. The wire protocol lives entirely
/// behind this seam.
#[async_trait]
pub trait SubscriptionClient: Send + Sync + 'static {
    type Connection: SubscriptionConnection;

    /// Establish one subscription. Called once per `start_init`; reconnect
    /// and backoff beyond init are the transport's own business.
    async fn connect(&self, settings: SubscribeSettings) -> Result<Self::Connection>;
}

/// One live subscription to the change service.
#[async_trait]
pub trait SubscriptionConnection: Send + 'static {
    /// Wait up to `deadline` for the next event.
    async fn next_event(&mut self, deadline: Duration) -> Result<SubscriptionEvent>;

    /// Query the current mergebase. Only valid while no source-control
    /// transaction is in flight; the listen loop guarantees that.
    async fn mergebase(&mut self) -> Result<String>;

    /// Close the subscription. The service process itself is not ours to
    /// terminate.
    async fn close(&mut self) -> Result<()>;
}

/// State guarded by a single non-suspending critical section, so a drain is
/// atomic from the scheduler's point of view.
struct Inner {
    pending: ChangeSet,
    metadata: WatcherMetadata,
    mergebase: Option<String>,
}

/// State shared between the backend handle and its listen loop.
struct Shared<C> {
    conn: Mutex<C>,
    inner: StdMutex<Inner>,
    /// Signalled only when `pending` transitions from empty to non-empty.
    notifier: Notify,
    track_mergebase: bool,
}

enum Phase<C> {
    Uninitialized,
    Connecting(JoinHandle<Result<C>>),
    Ready {
        shared: Arc<Shared<C>>,
        listen: Option<JoinHandle<Result<()>>>,
    },
    Failed(String),
    Stopped,
}

/// Watcher backed by a persistent change-subscription service.
pub struct SubscriptionWatcher<T: SubscriptionClient> {
    client: Arc<T>,
    settings: SubscribeSettings,
    track_mergebase: bool,
    phase: Mutex<Phase<T::Connection>>,
}

impl<T: SubscriptionClient> SubscriptionWatcher<T> {
    pub fn new(client: T, config: &WatcherConfig) -> Self {
        Self {
            client: Arc::new(client),
            settings: SubscribeSettings::from_config(config),
            track_mergebase: config.lazy_mode,
            phase: Mutex::new(Phase::Uninitialized),
        }
    }

    async fn shared(&self) -> Result<Arc<Shared<T::Connection>>> {
        let phase = self.phase.lock().await;
        match &*phase {
            Phase::Ready { shared, .. } => Ok(Arc::clone(shared)),
            Phase::Failed(_) | Phase::Connecting(_) | Phase::Uninitialized => Err(
                Error::NotInitialized("subscription watcher is not initialized"),
            ),
            Phase::Stopped => Err(Error::NotInitialized("subscription watcher was stopped")),
        }
    }

    /// Await the background listen loop's terminal result. The loop only
    /// terminates on failure or cancellation, so this is how a supervisor
    /// observes that event consumption died.
    pub async fn join_listen(&self) -> Result<()> {
        let handle = {
            let mut phase = self.phase.lock().await;
            match &mut *phase {
                Phase::Ready { listen, .. } => listen.take(),
                _ => None,
            }
        };
        match handle {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => Err(Error::Task(e)),
            },
            None => Err(Error::NotInitialized("no running listen loop to join")),
        }
    }
}

fn spawn_listen_loop<C: SubscriptionConnection>(shared: Arc<Shared<C>>) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let result = listen_loop(&shared).await;
        if let Err(ref e) = result {
            error!("subscription listen loop terminated: {}", e);
        }
        result
    })
}

async fn listen_loop<C: SubscriptionConnection>(shared: &Arc<Shared<C>>) -> Result<()> {
    let mut transactions = TransactionTracker::new();
    loop {
        let event = {
            let mut conn = shared.conn.lock().await;
            conn.next_event(EVENT_DEADLINE).await?
        };
        dispatch(shared, &mut transactions, event).await?;
    }
}

async fn dispatch<C: SubscriptionConnection>(
    shared: &Arc<Shared<C>>,
    transactions: &mut TransactionTracker,
    event: SubscriptionEvent,
) -> Result<()> {
    match event {
        SubscriptionEvent::FilesChanged(paths) => {
            if paths.is_empty() {
                return Ok(());
            }
            debug!("subscription delivered {} changed path(s)", paths.len());
            let became_nonempty = {
                let mut inner = shared.inner.lock().unwrap();
                let was_empty = inner.pending.is_empty();
                inner.pending.extend(paths);
                was_empty && !inner.pending.is_empty()
            };
            if became_nonempty {
                shared.notifier.notify_waiters();
            }
        }
        SubscriptionEvent::StateEnter { name, payload } => match name.as_str() {
            UPDATE_SCOPE => {
                let payload = ScopePayload::from_value(payload.as_ref());
                info!(
                    "working-copy update started (revision {:?})",
                    payload.revision
                );
            }
            TRANSACTION_SCOPE => transactions.enter(),
            other => debug!("ignoring enter of unrecognized scope {}", other),
        },
        SubscriptionEvent::StateLeave { name, payload } => match name.as_str() {
            UPDATE_SCOPE => {
                let payload = ScopePayload::from_value(payload.as_ref());
                let old = {
                    let mut inner = shared.inner.lock().unwrap();
                    inner.metadata.total_update_distance += payload.distance;
                    inner.mergebase.clone()
                };
                info!(
                    "working-copy update finished at revision {:?} (distance {})",
                    payload.revision, payload.distance
                );
                if shared.track_mergebase {
                    let action = recompute_mergebase_action(Arc::clone(shared), old);
                    transactions.register(action).await?;
                }
            }
            TRANSACTION_SCOPE => transactions.leave().await?,
            other => debug!("ignoring leave of unrecognized scope {}", other),
        },
        SubscriptionEvent::Unavailable => {
            warn!("subscription connection unavailable, waiting for the transport to recover");
            sleep(UNAVAILABLE_BACKOFF).await;
        }
        SubscriptionEvent::Other(kind) => {
            return Err(Error::UnexpectedEvent(format!(
                "event kind `{}` cannot occur under our subscription settings",
                kind
            )));
        }
    }
    Ok(())
}

/// Recompute the mergebase once no transaction is in flight.
///
/// `old` is the mergebase captured when the update finished. If the stored
/// value has moved on by the time this runs, a newer update already queued its
/// own recompute and this one must not overwrite it.
fn recompute_mergebase_action<C: SubscriptionConnection>(
    shared: Arc<Shared<C>>,
    old: Option<String>,
) -> DeferredAction {
    Box::pin(async move {
        {
            let inner = shared.inner.lock().unwrap();
            if inner.mergebase != old {
                debug!("skipping mergebase recompute, a newer update superseded it");
                return Ok(());
            }
        }
        let fresh = {
            let mut conn = shared.conn.lock().await;
            conn.mergebase().await?
        };
        if old.as_deref() != Some(fresh.as_str()) {
            info!("mergebase moved to {}", fresh);
            let mut inner = shared.inner.lock().unwrap();
            inner.mergebase = Some(fresh);
            inner.metadata.changed_mergebase = true;
        }
        Ok(())
    })
}

#[async_trait]
impl<T: SubscriptionClient> FileWatcher for SubscriptionWatcher<T> {
    fn name(&self) -> &'static str {
        "subscription"
    }

    async fn start_init(&self) {
        let mut phase = self.phase.lock().await;
        if !matches!(*phase, Phase::Uninitialized) {
            warn!("subscription watcher start_init called twice, ignoring");
            return;
        }
        let client = Arc::clone(&self.client);
        let settings = self.settings.clone();
        debug!(
            "connecting subscription {} over {} root(s)",
            settings.subscription_prefix,
            settings.roots.len()
        );
        *phase = Phase::Connecting(tokio::spawn(
            async move { client.connect(settings).await },
        ));
    }

    async fn wait_for_init(&self) -> Result<()> {
        let mut phase = self.phase.lock().await;
        match std::mem::replace(&mut *phase, Phase::Uninitialized) {
            Phase::Connecting(handle) => {
                let mut conn = match handle.await {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(e)) => {
                        let reason = e.to_string();
                        *phase = Phase::Failed(reason.clone());
                        return Err(Error::Init(reason));
                    }
                    Err(e) => {
                        let reason = format!("connect task failed: {}", e);
                        *phase = Phase::Failed(reason.clone());
                        return Err(Error::Init(reason));
                    }
                };

                // In lazy mode the first mergebase is part of init: consumers
                // need a baseline before any update can move it.
                let mergebase = if self.track_mergebase {
                    match conn.mergebase().await {
                        Ok(mergebase) => {
                            info!("initial mergebase is {}", mergebase);
                            Some(mergebase)
                        }
                        Err(e) => {
                            let reason = format!("initial mergebase query failed: {}", e);
                            *phase = Phase::Failed(reason.clone());
                            return Err(Error::Init(reason));
                        }
                    }
                } else {
                    None
                };

                let shared = Arc::new(Shared {
                    conn: Mutex::new(conn),
                    inner: StdMutex::new(Inner {
                        pending: ChangeSet::new(),
                        metadata: WatcherMetadata::default(),
                        mergebase,
                    }),
                    notifier: Notify::new(),
                    track_mergebase: self.track_mergebase,
                });
                let listen = spawn_listen_loop(Arc::clone(&shared));
                info!("subscription watcher initialized");
                *phase = Phase::Ready {
                    shared,
                    listen: Some(listen),
                };
                Ok(())
            }
            ready @ Phase::Ready { .. } => {
                *phase = ready;
                Ok(())
            }
            Phase::Failed(reason) => {
                *phase = Phase::Failed(reason.clone());
                Err(Error::Init(reason))
            }
            Phase::Uninitialized => Err(Error::NotInitialized(
                "wait_for_init called before start_init",
            )),
            Phase::Stopped => {
                *phase = Phase::Stopped;
                Err(Error::NotInitialized("subscription watcher was stopped"))
            }
        }
    }

    async fn get_and_clear_changed_files(&self) -> Result<(ChangeSet, Option<WatcherMetadata>)> {
        let shared = self.shared().await?;
        // Single critical section: snapshot and reset together, so no event
        // can land between the read and the reset. Metadata resets even when
        // the drained set is empty; that is the contract, not an oversight.
        let mut inner = shared.inner.lock().unwrap();
        let files = std::mem::take(&mut inner.pending);
        let metadata = std::mem::take(&mut inner.metadata);
        Ok((files, Some(metadata)))
    }

    async fn wait_for_changed_files(&self) -> Result<()> {
        let shared = self.shared().await?;
        loop {
            // Arm the notifier before checking, so a signal landing between
            // the check and the await cannot be lost.
            let notified = shared.notifier.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !shared.inner.lock().unwrap().pending.is_empty() {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn stop(&self) -> Result<()> {
        let mut phase = self.phase.lock().await;
        match std::mem::replace(&mut *phase, Phase::Stopped) {
            Phase::Ready { shared, listen } => {
                if let Some(listen) = listen {
                    listen.abort();
                }
                let mut conn = shared.conn.lock().await;
                if let Err(e) = conn.close().await {
                    warn!("error closing subscription connection: {}", e);
                }
                info!("subscription watcher stopped");
            }
            Phase::Connecting(handle) => handle.abort(),
            _ => debug!("subscription watcher stop with nothing to tear down"),
        }
        Ok(())
    }

    async fn waitpid(&self) -> Result<ExitStatus> {
        // The change service is not owned by this process and is expected to
        // self-heal through reconnection; its lifetime must never be read as
        // this watcher's lifetime.
        futures::future::pending().await
    }

    async fn getpid(&self) -> Option<u32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverClient;

    struct NeverConnection;

    #[async_trait]
    impl SubscriptionConnection for NeverConnection {
        async fn next_event(&mut self, _deadline: Duration) -> Result<SubscriptionEvent> {
            futures::future::pending().await
        }

        async fn mergebase(&mut self) -> Result<String> {
            Ok(String::new())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl SubscriptionClient for NeverClient {
        type Connection = NeverConnection;

        async fn connect(&self, _settings: SubscribeSettings) -> Result<Self::Connection> {
            Ok(NeverConnection)
        }
    }

    #[tokio::test]
    async fn test_operations_before_start_init_are_typed_errors() {
        let watcher = SubscriptionWatcher::new(NeverClient, &WatcherConfig::default());
        assert!(matches!(
            watcher.wait_for_init().await,
            Err(Error::NotInitialized(_))
        ));
        assert!(matches!(
            watcher.get_and_clear_changed_files().await,
            Err(Error::NotInitialized(_))
        ));
        assert!(matches!(
            watcher.wait_for_changed_files().await,
            Err(Error::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_before_init_is_ok_and_idempotent() {
        let watcher = SubscriptionWatcher::new(NeverClient, &WatcherConfig::default());
        watcher.stop().await.unwrap();
        watcher.stop().await.unwrap();
        assert!(matches!(
            watcher.wait_for_init().await,
            Err(Error::NotInitialized(_))
        ));
    }
}
