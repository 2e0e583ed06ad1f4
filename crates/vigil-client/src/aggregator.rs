//! Presence intent batching.
//!
//! Callers declare intents (`enter`/`leave` a channel); the aggregator
//! coalesces them and a single flush loop applies them in batched
//! [`UpdateRequest`]s. At most one flush is ever in flight. Urgent flushes
//! are throttled so a burst of intents becomes one request; a periodic
//! flush re-asserts every present channel so the server-side session
//! timeout never lapses while the client is alive.
//!
//! Opposite intents for the same channel collapse: the newest wins, and
//! waiters from the superseded intent resolve with the batch that carries
//! the newer one. A failed flush re-queues its intents (waiters intact) and
//! retries with exponential backoff, capped at the periodic interval.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use vigil_core::{ClientId, Environment, UpdateRequest};

use crate::api::PresenceApi;
use crate::error::ClientError;

/// Flush timing knobs.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Delay between an intent arriving and the urgent flush it triggers.
    pub throttle: Duration,
    /// Cadence of presence re-assertion when no intents are pending.
    pub interval: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self { throttle: Duration::from_millis(100), interval: Duration::from_secs(30) }
    }
}

/// Resolves when the intent it was issued for has been applied.
///
/// Dropping the aggregator before the intent is serviced resolves the
/// completion with [`ClientError::Cancelled`].
#[derive(Debug)]
pub struct Completion {
    rx: Option<oneshot::Receiver<()>>,
}

impl Completion {
    /// Already satisfied: the channel was in the desired state.
    fn ready() -> Self {
        Self { rx: None }
    }

    fn pending(rx: oneshot::Receiver<()>) -> Self {
        Self { rx: Some(rx) }
    }

    /// Wait until the intent has been applied server-side.
    pub async fn wait(self) -> Result<(), ClientError> {
        match self.rx {
            None => Ok(()),
            Some(rx) => rx.await.map_err(|_| ClientError::Cancelled),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntentKind {
    Enter,
    Leave,
}

#[derive(Debug)]
struct PendingIntent {
    kind: IntentKind,
    waiters: Vec<oneshot::Sender<()>>,
}

#[derive(Debug, Default)]
struct AggState {
    /// Channels the last successful flush asserted presence in.
    present: HashSet<String>,
    /// Net pending intent per channel.
    queue: HashMap<String, PendingIntent>,
}

#[derive(Debug)]
struct AggInner<A> {
    api: Arc<A>,
    client_id: ClientId,
    state: StdMutex<AggState>,
    kick: Notify,
}

enum FlushResult {
    Idle,
    Applied,
    Failed,
}

/// Batches presence intents into throttled, deduplicated flushes.
#[derive(Debug)]
pub struct Aggregator<A: PresenceApi> {
    inner: Arc<AggInner<A>>,
    flush_task: JoinHandle<()>,
}

impl<A: PresenceApi> Aggregator<A> {
    /// Create an aggregator with default timing.
    pub fn new(api: Arc<A>, client_id: impl Into<ClientId>) -> Self {
        Self::with_config(api, client_id, AggregatorConfig::default())
    }

    /// Create an aggregator with default timing and a freshly minted client
    /// id. Each aggregator stands for one tab or device, so a new id per
    /// instance keeps their sessions distinct server-side.
    pub fn with_generated_id(api: Arc<A>, env: &impl Environment) -> Self {
        let id = env.random_u64();
        Self::new(api, format!("{id:016x}"))
    }

    /// The client id sent with every flush.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Create an aggregator with explicit timing.
    pub fn with_config(
        api: Arc<A>,
        client_id: impl Into<ClientId>,
        config: AggregatorConfig,
    ) -> Self {
        let inner = Arc::new(AggInner {
            api,
            client_id: client_id.into(),
            state: StdMutex::new(AggState::default()),
            kick: Notify::new(),
        });
        let flush_task = tokio::spawn(flush_loop(Arc::clone(&inner), config));
        Self { inner, flush_task }
    }

    /// Declare the intent to be present in `channel`.
    pub fn enter(&self, channel: &str) -> Result<Completion, ClientError> {
        self.intend(channel, IntentKind::Enter)
    }

    /// Declare the intent to leave `channel`.
    pub fn leave(&self, channel: &str) -> Result<Completion, ClientError> {
        self.intend(channel, IntentKind::Leave)
    }

    /// Channels asserted by the most recent successful flush, sorted.
    pub fn present_channels(&self) -> Vec<String> {
        let state = lock(&self.inner.state);
        let mut channels: Vec<String> = state.present.iter().cloned().collect();
        channels.sort_unstable();
        channels
    }

    /// Best-effort teardown: hand the transport one beacon leaving every
    /// channel this client is (or is about to stop being) present in, and
    /// stop the flush loop. Pending completions resolve as cancelled.
    pub fn teardown(self) {
        let request = {
            let mut state = lock(&self.inner.state);
            let mut leaves: BTreeSet<String> = state.present.drain().collect();
            for (channel, intent) in state.queue.drain() {
                if intent.kind == IntentKind::Leave {
                    leaves.insert(channel);
                }
            }
            UpdateRequest {
                client_id: self.inner.client_id.clone(),
                present_channels: Vec::new(),
                leave_channels: leaves.into_iter().collect(),
            }
        };
        if !request.leave_channels.is_empty() {
            self.inner.api.send_beacon(request);
        }
    }

    fn intend(&self, channel: &str, kind: IntentKind) -> Result<Completion, ClientError> {
        if channel.is_empty() {
            return Err(ClientError::InvalidChannel(channel.to_string()));
        }
        if self.inner.api.user_id().is_none() {
            return Err(ClientError::NotAuthenticated);
        }

        let mut state = lock(&self.inner.state);
        if let Some(intent) = state.queue.get_mut(channel) {
            // Newest intent wins; earlier waiters ride along and resolve
            // with the batch that carries it.
            intent.kind = kind;
            let (tx, rx) = oneshot::channel();
            intent.waiters.push(tx);
            self.inner.kick.notify_one();
            return Ok(Completion::pending(rx));
        }

        let desired_present = kind == IntentKind::Enter;
        if state.present.contains(channel) == desired_present {
            return Ok(Completion::ready());
        }

        let (tx, rx) = oneshot::channel();
        state.queue.insert(channel.to_string(), PendingIntent { kind, waiters: vec![tx] });
        self.inner.kick.notify_one();
        Ok(Completion::pending(rx))
    }
}

impl<A: PresenceApi> Drop for Aggregator<A> {
    fn drop(&mut self) {
        self.flush_task.abort();
    }
}

async fn flush_loop<A: PresenceApi>(inner: Arc<AggInner<A>>, config: AggregatorConfig) {
    let mut backoff = config.throttle;
    loop {
        let kicked = tokio::select! {
            () = inner.kick.notified() => true,
            () = tokio::time::sleep(config.interval) => false,
        };
        if kicked {
            // Let a burst of intents coalesce into one request.
            tokio::time::sleep(backoff).await;
        }

        match inner.flush().await {
            FlushResult::Idle | FlushResult::Applied => backoff = config.throttle,
            FlushResult::Failed => {
                backoff = (backoff * 2).min(config.interval);
                inner.kick.notify_one();
            }
        }
    }
}

impl<A: PresenceApi> AggInner<A> {
    /// Apply pending intents (and re-assert present channels) in one
    /// request. On failure the drained intents go back in the queue, unless
    /// a newer intent for the same channel arrived mid-flight.
    async fn flush(&self) -> FlushResult {
        let (request, drained) = {
            let mut state = lock(&self.state);
            if state.queue.is_empty() && state.present.is_empty() {
                return FlushResult::Idle;
            }

            let drained: Vec<(String, PendingIntent)> = state.queue.drain().collect();
            let mut present: BTreeSet<String> = state.present.iter().cloned().collect();
            let mut leaves = Vec::new();
            for (channel, intent) in &drained {
                match intent.kind {
                    IntentKind::Enter => {
                        present.insert(channel.clone());
                    }
                    IntentKind::Leave => {
                        present.remove(channel);
                        leaves.push(channel.clone());
                    }
                }
            }
            leaves.sort_unstable();

            let request = UpdateRequest {
                client_id: self.client_id.clone(),
                present_channels: present.into_iter().collect(),
                leave_channels: leaves,
            };
            (request, drained)
        };

        match self.api.update(&request).await {
            Ok(()) => {
                {
                    let mut state = lock(&self.state);
                    state.present = request.present_channels.iter().cloned().collect();
                }
                for (_, intent) in drained {
                    for waiter in intent.waiters {
                        // A dropped completion is not an error.
                        drop(waiter.send(()));
                    }
                }
                FlushResult::Applied
            }
            Err(error) => {
                tracing::warn!(%error, "presence flush failed, re-queueing");
                let mut state = lock(&self.state);
                for (channel, intent) in drained {
                    if let Some(newer) = state.queue.get_mut(&channel) {
                        newer.waiters.extend(intent.waiters);
                    } else {
                        state.queue.insert(channel, intent);
                    }
                }
                FlushResult::Failed
            }
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
