//! Per-channel subscription state machine.
//!
//! `ClientChannel` mirrors one channel's present set by applying the ordered
//! delta stream on top of a fetched snapshot. It is sans-IO: events go in,
//! actions come out, and the caller (normally [`ChannelDriver`]) performs
//! the fetching and listening those actions name.
//!
//! ```text
//! Unsubscribed ── Subscribe ──▶ Subscribing ── SnapshotFetched ──▶ Synced
//!        ▲                                                           │
//!        └────────── Unsubscribe ──────────┐          sequence gap   │
//!                                          │                         ▼
//!                                          └───────────────────── Resyncing
//! ```
//!
//! A delta is applied only when its sequence id is exactly `last_seen + 1`.
//! Any other id means the stream can no longer be trusted (a missed message
//! or a stale replay), and the whole mirror is rebuilt from a fresh snapshot
//! rather than patched.
//!
//! [`ChannelDriver`]: crate::ChannelDriver

use std::collections::BTreeSet;

use vigil_core::{ChannelSnapshot, Delta, DeltaKind, UserId};

/// Subscription lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Not mirroring; the present set is empty and events are ignored.
    Unsubscribed,
    /// Waiting for the initial snapshot.
    Subscribing,
    /// Mirroring live: deltas apply in sequence.
    Synced,
    /// A gap was observed; waiting for a recovery snapshot. Deltas are
    /// ignored until it arrives.
    Resyncing,
}

/// Input to the state machine.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Begin mirroring, optionally seeded with an already-fetched snapshot.
    Subscribe {
        /// Seed snapshot; `None` asks for a fetch.
        snapshot: Option<ChannelSnapshot>,
    },
    /// A requested snapshot arrived.
    SnapshotFetched {
        /// The fetched channel state.
        snapshot: ChannelSnapshot,
    },
    /// A message arrived on the channel's topic.
    Delta {
        /// Bus sequence id of the message.
        seq: u64,
        /// Encoded delta payload.
        payload: Vec<u8>,
    },
    /// The listening stream ended without an explicit unsubscribe.
    StreamEnded,
    /// Stop mirroring.
    Unsubscribe,
}

/// Output of the state machine; the caller performs these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAction {
    /// Fetch a snapshot and feed it back as [`ChannelEvent::SnapshotFetched`].
    FetchSnapshot,
    /// Start delivering bus messages with sequence ids after `from_id`.
    Listen {
        /// Replay floor; the snapshot's `last_message_id`.
        from_id: u64,
    },
    /// Stop the active listener.
    StopListening,
}

/// Mirror of one channel's present set.
#[derive(Debug)]
pub struct ClientChannel {
    name: String,
    status: ChannelStatus,
    users: BTreeSet<UserId>,
    last_seen_id: u64,
}

impl ClientChannel {
    /// Create an unsubscribed mirror for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ChannelStatus::Unsubscribed,
            users: BTreeSet::new(),
            last_seen_id: 0,
        }
    }

    /// The mirrored channel's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    /// Present users, sorted.
    pub fn users(&self) -> Vec<UserId> {
        self.users.iter().copied().collect()
    }

    /// Sequence id of the last delta accounted for.
    pub fn last_seen_id(&self) -> u64 {
        self.last_seen_id
    }

    /// Advance the state machine.
    pub fn handle(&mut self, event: ChannelEvent) -> Vec<ChannelAction> {
        match event {
            ChannelEvent::Subscribe { snapshot } => self.on_subscribe(snapshot),
            ChannelEvent::SnapshotFetched { snapshot } => self.on_snapshot(snapshot),
            ChannelEvent::Delta { seq, payload } => self.on_delta(seq, &payload),
            ChannelEvent::StreamEnded => self.on_stream_ended(),
            ChannelEvent::Unsubscribe => self.on_unsubscribe(),
        }
    }

    fn on_subscribe(&mut self, snapshot: Option<ChannelSnapshot>) -> Vec<ChannelAction> {
        match snapshot {
            Some(snapshot) => {
                self.adopt(snapshot);
                vec![ChannelAction::Listen { from_id: self.last_seen_id }]
            }
            None => {
                self.status = ChannelStatus::Subscribing;
                vec![ChannelAction::FetchSnapshot]
            }
        }
    }

    fn on_snapshot(&mut self, snapshot: ChannelSnapshot) -> Vec<ChannelAction> {
        match self.status {
            ChannelStatus::Subscribing | ChannelStatus::Resyncing => {
                self.adopt(snapshot);
                vec![ChannelAction::Listen { from_id: self.last_seen_id }]
            }
            // A fetch resolving after unsubscribe is dropped; a stale fetch
            // resolving while already synced must not rewind the mirror.
            ChannelStatus::Unsubscribed | ChannelStatus::Synced => Vec::new(),
        }
    }

    fn on_delta(&mut self, seq: u64, payload: &[u8]) -> Vec<ChannelAction> {
        if self.status != ChannelStatus::Synced {
            // While resyncing, the pending snapshot supersedes everything
            // in flight; applying these would double-count.
            return Vec::new();
        }
        if seq != self.last_seen_id + 1 {
            // Gap or stale replay; either way this stream can no longer be
            // trusted, so the mirror is rebuilt rather than patched.
            tracing::debug!(
                channel = %self.name,
                expected = self.last_seen_id + 1,
                got = seq,
                "sequence gap, resyncing"
            );
            self.status = ChannelStatus::Resyncing;
            return vec![ChannelAction::StopListening, ChannelAction::FetchSnapshot];
        }

        // In-sequence. An undecodable payload is a protocol violation scoped
        // to this one message: skip it, but account for its id so the
        // subscription survives.
        match Delta::decode(payload) {
            Ok(delta) => self.apply(delta),
            Err(error) => {
                tracing::warn!(channel = %self.name, seq, %error, "skipping undecodable delta");
            }
        }
        self.last_seen_id = seq;
        Vec::new()
    }

    fn on_stream_ended(&mut self) -> Vec<ChannelAction> {
        if self.status != ChannelStatus::Synced {
            return Vec::new();
        }
        // Eviction or bus restart; indistinguishable from a gap.
        tracing::debug!(channel = %self.name, "delta stream ended, resyncing");
        self.status = ChannelStatus::Resyncing;
        vec![ChannelAction::FetchSnapshot]
    }

    fn on_unsubscribe(&mut self) -> Vec<ChannelAction> {
        self.status = ChannelStatus::Unsubscribed;
        self.users.clear();
        self.last_seen_id = 0;
        vec![ChannelAction::StopListening]
    }

    fn adopt(&mut self, snapshot: ChannelSnapshot) {
        self.users = snapshot.user_ids.into_iter().collect();
        self.last_seen_id = snapshot.last_message_id;
        self.status = ChannelStatus::Synced;
    }

    fn apply(&mut self, delta: Delta) {
        match delta.kind {
            DeltaKind::Enter => {
                self.users.insert(delta.user_id);
            }
            DeltaKind::Leave => {
                self.users.remove(&delta.user_id);
            }
        }
    }
}
