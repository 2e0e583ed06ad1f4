//! End-to-end tests: aggregator → service → bus → channel mirror.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use vigil_client::{Aggregator, ApiError, ChannelDriver, PresenceApi};
use vigil_core::{ChannelSnapshot, Environment, MemoryBus, UpdateRequest, UserId};
use vigil_harness::{LoopbackApi, SimEnv, init_tracing};
use vigil_server::{PresenceService, PresenceStore, Sweeper};

type Service = PresenceService<SimEnv, MemoryBus>;

fn setup() -> (SimEnv, Arc<MemoryBus>, Arc<Service>) {
    init_tracing();
    let env = SimEnv::new();
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(PresenceStore::new(env.clone(), Arc::clone(&bus)));
    (env, bus, Arc::new(PresenceService::new(store)))
}

#[tokio::test(start_paused = true)]
async fn presence_propagates_to_observers() {
    let (env, bus, service) = setup();

    let observer = Arc::new(LoopbackApi::new(Arc::clone(&service), Some(2)));
    let driver = ChannelDriver::subscribe(observer, Arc::clone(&bus), "room1")
        .await
        .unwrap();
    assert!(driver.present().is_empty());

    let actor = Arc::new(LoopbackApi::new(Arc::clone(&service), Some(1)));
    let aggregator = Aggregator::with_generated_id(actor, &env);
    aggregator.enter("room1").unwrap().wait().await.unwrap();

    let mut watch = driver.watch();
    watch.wait_for(|users| users == &vec![1]).await.unwrap();

    aggregator.leave("room1").unwrap().wait().await.unwrap();
    watch.wait_for(Vec::is_empty).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn teardown_beacon_clears_presence() {
    let (_env, bus, service) = setup();

    let observer = Arc::new(LoopbackApi::new(Arc::clone(&service), Some(2)));
    let driver = ChannelDriver::subscribe(observer, Arc::clone(&bus), "room1")
        .await
        .unwrap();
    let mut watch = driver.watch();

    let actor = Arc::new(LoopbackApi::new(Arc::clone(&service), Some(1)));
    let aggregator = Aggregator::new(actor, "client-a");
    aggregator.enter("room1").unwrap().wait().await.unwrap();
    watch.wait_for(|users| users == &vec![1]).await.unwrap();

    aggregator.teardown();
    watch.wait_for(Vec::is_empty).await.unwrap();
    assert!(service.get("room1").await.unwrap().user_ids.is_empty());
}

#[tokio::test(start_paused = true)]
async fn session_timeout_clears_presence() {
    let (env, bus, service) = setup();
    let sweeper = Sweeper::new(Arc::clone(service.store()));

    let observer = Arc::new(LoopbackApi::new(Arc::clone(&service), Some(2)));
    let driver = ChannelDriver::subscribe(observer, Arc::clone(&bus), "room1")
        .await
        .unwrap();
    let mut watch = driver.watch();

    let actor = Arc::new(LoopbackApi::new(Arc::clone(&service), Some(1)));
    let aggregator = Aggregator::new(actor, "client-a");
    aggregator.enter("room1").unwrap().wait().await.unwrap();
    watch.wait_for(|users| users == &vec![1]).await.unwrap();

    // Stop flushing so nothing refreshes the session, then let it lapse.
    drop(aggregator);
    env.advance(Duration::from_secs(61));
    sweeper.auto_leave_all(env.now()).await.unwrap();

    watch.wait_for(Vec::is_empty).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn resync_converges_on_the_authoritative_snapshot() {
    init_tracing();
    let env = SimEnv::new();
    // Tiny replay window: a mirror whose view predates the retained history
    // sees a sequence gap on its first delivered message.
    let bus = Arc::new(MemoryBus::with_replay_window(1));
    let store = Arc::new(PresenceStore::new(env, Arc::clone(&bus)));
    let service: Arc<Service> = Arc::new(PresenceService::new(store));

    let actor = Arc::new(LoopbackApi::new(Arc::clone(&service), Some(1)));
    let aggregator = Aggregator::new(actor, "client-a");
    aggregator.enter("room-with-history").unwrap().wait().await.unwrap();
    let other = Arc::new(LoopbackApi::new(Arc::clone(&service), Some(3)));
    let other_agg = Aggregator::new(other, "client-c");
    other_agg.enter("room-with-history").unwrap().wait().await.unwrap();

    let observer = Arc::new(LoopbackApi::new(Arc::clone(&service), Some(2)));
    let stale = ChannelSnapshot { user_ids: Vec::new(), last_message_id: 0 };
    let driver = ChannelDriver::subscribe_with_snapshot(
        observer,
        Arc::clone(&bus),
        "room-with-history",
        stale,
    )
    .await;

    // Whatever the stale starting point, the mirror must converge on what
    // a fresh query reports.
    let authoritative = service.get("room-with-history").await.unwrap();
    let mut watch = driver.watch();
    watch.wait_for(|users| users == &authoritative.user_ids).await.unwrap();
}

/// Delegating API that fails the first N updates.
struct FlakyApi {
    inner: LoopbackApi<SimEnv, MemoryBus>,
    failures_left: AtomicUsize,
}

#[async_trait]
impl PresenceApi for FlakyApi {
    fn user_id(&self) -> Option<UserId> {
        self.inner.user_id()
    }

    async fn get_channel(&self, channel: &str) -> Result<ChannelSnapshot, ApiError> {
        self.inner.get_channel(channel).await
    }

    async fn update(&self, request: &UpdateRequest) -> Result<(), ApiError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ApiError::Unavailable("injected fault".to_string()));
        }
        self.inner.update(request).await
    }

    fn send_beacon(&self, request: UpdateRequest) {
        self.inner.send_beacon(request);
    }
}

#[tokio::test(start_paused = true)]
async fn flush_retries_until_the_service_recovers() {
    let (_env, bus, service) = setup();

    let api = Arc::new(FlakyApi {
        inner: LoopbackApi::new(Arc::clone(&service), Some(1)),
        failures_left: AtomicUsize::new(3),
    });
    let aggregator = Aggregator::new(api, "client-a");

    // The intent survives the injected failures and lands eventually.
    aggregator.enter("room1").unwrap().wait().await.unwrap();
    assert_eq!(service.get("room1").await.unwrap().user_ids, vec![1]);

    let observer = Arc::new(LoopbackApi::new(Arc::clone(&service), Some(2)));
    let driver = ChannelDriver::subscribe(observer, bus, "room1").await.unwrap();
    assert_eq!(driver.present(), vec![1]);
}
