//! Expiry sweep tests across the store, sweeper, and bus.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vigil_core::{Delta, DeltaKind, Environment, MemoryBus, MessageBus, channel_topic};
use vigil_server::{PresenceStore, Sweeper};

/// Test environment with a manually advanced clock.
#[derive(Clone)]
struct ManualEnv {
    start: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualEnv {
    fn new() -> Self {
        Self { start: Instant::now(), offset: Arc::new(Mutex::new(Duration::ZERO)) }
    }

    fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap() += by;
    }
}

impl Environment for ManualEnv {
    fn now(&self) -> Instant {
        self.start + *self.offset.lock().unwrap()
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        buffer.fill(0);
    }
}

fn setup() -> (ManualEnv, Arc<PresenceStore<ManualEnv, MemoryBus>>, Arc<MemoryBus>) {
    let env = ManualEnv::new();
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(PresenceStore::new(env.clone(), Arc::clone(&bus)));
    (env, store, bus)
}

async fn published(bus: &MemoryBus, channel: &str) -> Vec<Delta> {
    let topic = channel_topic(channel);
    let last = bus.last_id(&topic).await.unwrap();
    let mut stream = bus.subscribe(&topic, 0).await.unwrap();
    let mut out = Vec::new();
    for _ in 0..last {
        out.push(Delta::decode(&stream.recv().await.unwrap().payload).unwrap());
    }
    out
}

#[tokio::test]
async fn sweep_expires_only_due_sessions() {
    let (env, store, bus) = setup();
    let sweeper = Sweeper::new(Arc::clone(&store));

    // Channel A: user 1 expires at t+10, user 2 at t+100.
    store.enter("a", 1, "c1", Duration::from_secs(10)).await.unwrap();
    store.enter("a", 2, "c2", Duration::from_secs(100)).await.unwrap();
    // Channel B: user 3 expires at t+50.
    store.enter("b", 3, "c3", Duration::from_secs(50)).await.unwrap();

    // At t+20 only channel A is due, and only its 10s session expires.
    env.advance(Duration::from_secs(20));
    assert_eq!(store.channels_due(env.now()), vec!["a".to_string()]);
    sweeper.auto_leave_all(env.now()).await.unwrap();

    assert_eq!(store.query("a").await.unwrap().user_ids, vec![2]);
    assert_eq!(store.query("b").await.unwrap().user_ids, vec![3]);
    assert_eq!(
        published(&bus, "a").await,
        vec![
            Delta::new(DeltaKind::Enter, 1),
            Delta::new(DeltaKind::Enter, 2),
            Delta::new(DeltaKind::Leave, 1),
        ]
    );
    assert_eq!(published(&bus, "b").await, vec![Delta::new(DeltaKind::Enter, 3)]);

    // A's index entry now reflects the surviving t+100 session.
    assert!(store.channels_due(env.now() + Duration::from_secs(29)).is_empty());
    assert_eq!(store.channels_due(env.now() + Duration::from_secs(30)), vec!["b".to_string()]);
}

#[tokio::test]
async fn sweep_retires_fully_expired_channel() {
    let (env, store, bus) = setup();
    let sweeper = Sweeper::new(Arc::clone(&store));

    store.enter("room", 7, "c1", Duration::from_secs(10)).await.unwrap();
    env.advance(Duration::from_secs(11));
    sweeper.auto_leave_all(env.now()).await.unwrap();

    assert!(store.indexed_channels().is_empty());
    assert!(store.query("room").await.unwrap().user_ids.is_empty());
    assert_eq!(
        published(&bus, "room").await,
        vec![Delta::new(DeltaKind::Enter, 7), Delta::new(DeltaKind::Leave, 7)]
    );
}

#[tokio::test]
async fn reenter_before_sweep_keeps_user_present() {
    let (env, store, bus) = setup();
    let sweeper = Sweeper::new(Arc::clone(&store));

    store.enter("room", 7, "c1", Duration::from_secs(10)).await.unwrap();
    env.advance(Duration::from_secs(8));
    // Heartbeat refresh pushes the expiry out before the sweep runs.
    store.enter("room", 7, "c1", Duration::from_secs(10)).await.unwrap();
    env.advance(Duration::from_secs(5));
    sweeper.auto_leave_all(env.now()).await.unwrap();

    assert_eq!(store.query("room").await.unwrap().user_ids, vec![7]);
    // A refresh emits no delta, and nothing ever expired.
    assert_eq!(published(&bus, "room").await, vec![Delta::new(DeltaKind::Enter, 7)]);
}

#[tokio::test]
async fn query_sweeps_without_waiting_for_the_sweeper() {
    let (env, store, bus) = setup();

    store.enter("room", 7, "c1", Duration::from_secs(10)).await.unwrap();
    env.advance(Duration::from_secs(30));

    // Reading the channel must never show expired sessions, sweep or not.
    let snapshot = store.query("room").await.unwrap();
    assert!(snapshot.user_ids.is_empty());
    assert_eq!(
        published(&bus, "room").await,
        vec![Delta::new(DeltaKind::Enter, 7), Delta::new(DeltaKind::Leave, 7)]
    );
}
