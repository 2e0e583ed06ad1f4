//! Async driver binding a [`ClientChannel`] to a bus and API.
//!
//! The driver performs the actions the state machine emits: snapshot
//! fetches go through [`PresenceApi`], listening runs as a background pump
//! task over a bus subscription, and every mirror change is published on a
//! `watch` channel for consumers to observe.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use vigil_core::{BusStream, ChannelSnapshot, MessageBus, UserId, channel_topic};

use crate::api::PresenceApi;
use crate::channel::{ChannelAction, ChannelEvent, ChannelStatus, ClientChannel};
use crate::error::ClientError;

/// Live mirror of one channel, kept current by a background pump.
#[derive(Debug)]
pub struct ChannelDriver<A: PresenceApi, B: MessageBus> {
    inner: Arc<Inner<A, B>>,
}

#[derive(Debug)]
struct Inner<A, B> {
    api: Arc<A>,
    bus: Arc<B>,
    channel: Mutex<ClientChannel>,
    mirror: watch::Sender<Vec<UserId>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl<A: PresenceApi, B: MessageBus> ChannelDriver<A, B> {
    /// Subscribe to `name`, fetching the initial snapshot.
    ///
    /// The initial fetch runs inline so a failure surfaces to the caller
    /// instead of silently dropping the subscription.
    pub async fn subscribe(api: Arc<A>, bus: Arc<B>, name: &str) -> Result<Self, ClientError> {
        let mut channel = ClientChannel::new(name);
        let mut actions = channel.handle(ChannelEvent::Subscribe { snapshot: None });
        if actions.contains(&ChannelAction::FetchSnapshot) {
            let snapshot = api.get_channel(name).await?;
            actions = channel.handle(ChannelEvent::SnapshotFetched { snapshot });
        }
        Ok(Self::start(api, bus, channel, actions).await)
    }

    /// Subscribe to `name` seeded with an already-fetched snapshot.
    pub async fn subscribe_with_snapshot(
        api: Arc<A>,
        bus: Arc<B>,
        name: &str,
        snapshot: ChannelSnapshot,
    ) -> Self {
        let mut channel = ClientChannel::new(name);
        let actions = channel.handle(ChannelEvent::Subscribe { snapshot: Some(snapshot) });
        Self::start(api, bus, channel, actions).await
    }

    async fn start(
        api: Arc<A>,
        bus: Arc<B>,
        channel: ClientChannel,
        actions: Vec<ChannelAction>,
    ) -> Self {
        let mirror = watch::Sender::new(channel.users());
        let inner = Arc::new(Inner {
            api,
            bus,
            channel: Mutex::new(channel),
            mirror,
            pump: StdMutex::new(None),
        });
        Arc::clone(&inner).dispatch(actions).await;
        Self { inner }
    }

    /// A receiver observing every change to the mirrored present set.
    pub fn watch(&self) -> watch::Receiver<Vec<UserId>> {
        self.inner.mirror.subscribe()
    }

    /// The present set as currently mirrored, sorted.
    pub fn present(&self) -> Vec<UserId> {
        self.inner.mirror.subscribe().borrow().clone()
    }

    /// Current lifecycle state of the mirror.
    pub async fn status(&self) -> ChannelStatus {
        self.inner.channel.lock().await.status()
    }

    /// Stop mirroring: the pump is aborted and the present set empties.
    pub async fn unsubscribe(&self) {
        let actions = {
            let mut channel = self.inner.channel.lock().await;
            let actions = channel.handle(ChannelEvent::Unsubscribe);
            self.inner.mirror.send_replace(channel.users());
            actions
        };
        Arc::clone(&self.inner).dispatch(actions).await;
    }
}

impl<A: PresenceApi, B: MessageBus> Drop for ChannelDriver<A, B> {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.inner.pump).take() {
            pump.abort();
        }
    }
}

impl<A: PresenceApi, B: MessageBus> Inner<A, B> {
    /// Perform the state machine's actions. Boxed because snapshot fetches
    /// feed results back into the machine, which can emit further actions.
    fn dispatch(
        self: Arc<Self>,
        actions: Vec<ChannelAction>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            for action in actions {
                match action {
                    ChannelAction::FetchSnapshot => Arc::clone(&self).fetch_snapshot().await,
                    ChannelAction::Listen { from_id } => Arc::clone(&self).listen(from_id).await,
                    ChannelAction::StopListening => {
                        if let Some(pump) = lock(&self.pump).take() {
                            pump.abort();
                        }
                    }
                }
            }
        })
    }

    async fn fetch_snapshot(self: Arc<Self>) {
        let name = self.channel.lock().await.name().to_string();
        match self.api.get_channel(&name).await {
            Ok(snapshot) => {
                let actions = {
                    let mut channel = self.channel.lock().await;
                    let actions = channel.handle(ChannelEvent::SnapshotFetched { snapshot });
                    self.mirror.send_replace(channel.users());
                    actions
                };
                self.dispatch(actions).await;
            }
            Err(error) => {
                tracing::warn!(channel = %name, %error, "snapshot fetch failed, dropping subscription");
                self.drop_subscription().await;
            }
        }
    }

    async fn listen(self: Arc<Self>, from_id: u64) {
        let name = self.channel.lock().await.name().to_string();
        match self.bus.subscribe(&channel_topic(&name), from_id).await {
            Ok(stream) => {
                let handle = tokio::spawn(pump(Arc::clone(&self), stream));
                // A pump being replaced during resync has already stopped
                // itself; its handle is just dropped.
                drop(lock(&self.pump).replace(handle));
            }
            Err(error) => {
                tracing::warn!(channel = %name, %error, "bus subscribe failed, dropping subscription");
                self.drop_subscription().await;
            }
        }
    }

    async fn drop_subscription(self: Arc<Self>) {
        let actions = {
            let mut channel = self.channel.lock().await;
            let actions = channel.handle(ChannelEvent::Unsubscribe);
            self.mirror.send_replace(channel.users());
            actions
        };
        self.dispatch(actions).await;
    }
}

/// Deliver bus messages into the state machine until the stream ends or the
/// machine stops this listener.
async fn pump<A: PresenceApi, B: MessageBus>(inner: Arc<Inner<A, B>>, mut stream: BusStream) {
    loop {
        let Some(msg) = stream.recv().await else {
            let actions = inner.channel.lock().await.handle(ChannelEvent::StreamEnded);
            Arc::clone(&inner).dispatch(actions).await;
            return;
        };

        let actions = {
            let mut channel = inner.channel.lock().await;
            let actions =
                channel.handle(ChannelEvent::Delta { seq: msg.seq, payload: msg.payload });
            inner.mirror.send_replace(channel.users());
            actions
        };

        // A stop aimed at this listener: finish the remaining actions (the
        // resync fetch) and end instead of aborting ourselves.
        if actions.contains(&ChannelAction::StopListening) {
            let rest: Vec<ChannelAction> =
                actions.into_iter().filter(|a| *a != ChannelAction::StopListening).collect();
            Arc::clone(&inner).dispatch(rest).await;
            return;
        }
        Arc::clone(&inner).dispatch(actions).await;
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
