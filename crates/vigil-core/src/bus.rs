//! Ordered message bus contract and in-process implementation.
//!
//! Presence deltas travel over a per-topic ordered bus. The contract the
//! protocol relies on is deliberately narrow:
//!
//! - `publish` assigns each message a per-topic sequence id that is strictly
//!   increasing, starting at 1
//! - `subscribe(topic, from_id)` replays the retained backlog with ids
//!   greater than `from_id`, then delivers live messages in order
//! - `last_id` is a point query for the topic's most recent id
//!
//! No ordering exists across topics, and the replay window is bounded: a
//! subscriber asking for ids that have been truncated simply observes a gap
//! in sequence ids and is expected to resync from a snapshot.
//!
//! [`MemoryBus`] is the in-process reference implementation. Production
//! deployments substitute a bus with the same contract; the wire protocol
//! behind it is out of scope here.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// One message delivered on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Per-topic sequence id, strictly increasing from 1.
    pub seq: u64,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

/// Errors from bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The bus (or the topic) is no longer reachable.
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

/// An active subscription to one topic.
///
/// Dropping the stream unsubscribes. A stream that yields `None` has been
/// disconnected (slow-consumer eviction or bus shutdown); subscribers treat
/// this like a sequence gap.
#[derive(Debug)]
pub struct BusStream {
    backlog: VecDeque<BusMessage>,
    live: mpsc::Receiver<BusMessage>,
}

impl BusStream {
    /// Receive the next message in sequence order.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        if let Some(msg) = self.backlog.pop_front() {
            return Some(msg);
        }
        self.live.recv().await
    }
}

/// Ordered per-topic publish/subscribe.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publish a payload, returning the sequence id it was assigned.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<u64, BusError>;

    /// The most recent sequence id on the topic, 0 if nothing was published.
    async fn last_id(&self, topic: &str) -> Result<u64, BusError>;

    /// Subscribe, replaying retained messages with ids greater than
    /// `from_id` before live delivery begins.
    async fn subscribe(&self, topic: &str, from_id: u64) -> Result<BusStream, BusError>;
}

/// Per-subscriber live buffer. A subscriber falling further behind than this
/// is evicted and must resync.
const SUBSCRIBER_BUFFER: usize = 64;

/// Default number of messages retained per topic for replay.
const DEFAULT_REPLAY_WINDOW: usize = 1000;

#[derive(Debug, Default)]
struct Topic {
    next_seq: u64,
    retained: VecDeque<BusMessage>,
    subscribers: Vec<mpsc::Sender<BusMessage>>,
}

/// In-process [`MessageBus`] with a bounded per-topic replay window.
#[derive(Debug)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, Topic>>,
    replay_window: usize,
}

impl MemoryBus {
    /// Create a bus with the default replay window.
    pub fn new() -> Self {
        Self::with_replay_window(DEFAULT_REPLAY_WINDOW)
    }

    /// Create a bus retaining at most `window` messages per topic.
    pub fn with_replay_window(window: usize) -> Self {
        Self { topics: Mutex::new(HashMap::new()), replay_window: window }
    }

    fn lock_topics(&self) -> std::sync::MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<u64, BusError> {
        let mut topics = self.lock_topics();
        let entry = topics.entry(topic.to_string()).or_default();

        entry.next_seq += 1;
        let msg = BusMessage { seq: entry.next_seq, payload };

        entry.retained.push_back(msg.clone());
        while entry.retained.len() > self.replay_window {
            entry.retained.pop_front();
        }

        // Slow or dropped subscribers are evicted; they will observe their
        // stream ending and resync.
        let before = entry.subscribers.len();
        entry.subscribers.retain(|tx| tx.try_send(msg.clone()).is_ok());
        let evicted = before - entry.subscribers.len();
        if evicted > 0 {
            tracing::debug!(topic, evicted, "dropped lagging subscribers");
        }

        Ok(msg.seq)
    }

    async fn last_id(&self, topic: &str) -> Result<u64, BusError> {
        Ok(self.lock_topics().get(topic).map_or(0, |t| t.next_seq))
    }

    async fn subscribe(&self, topic: &str, from_id: u64) -> Result<BusStream, BusError> {
        let mut topics = self.lock_topics();
        let entry = topics.entry(topic.to_string()).or_default();

        // Backlog and live registration happen under the same lock, so no
        // message can slip between replay and live delivery.
        let backlog: VecDeque<BusMessage> =
            entry.retained.iter().filter(|m| m.seq > from_id).cloned().collect();

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        entry.subscribers.push(tx);

        Ok(BusStream { backlog, live: rx })
    }
}
