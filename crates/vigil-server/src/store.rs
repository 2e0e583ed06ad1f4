//! Presence store.
//!
//! ## Responsibilities
//!
//! - Session bookkeeping: enter/leave/query over (user, client) sessions
//!   with per-session expiry
//! - Delta emission: exactly one enter when a user's live-session count goes
//!   0→1, exactly one leave at 1→0, nothing otherwise
//! - Global expiry index: channel → minimum session expiry, so the sweeper
//!   visits only channels that can have something to expire
//!
//! ## Atomicity
//!
//! Each channel is a single-owner state object behind its own async lock;
//! every mutating operation (enter, leave, the channel's expiry sweep) runs
//! start-to-finish under that lock, and deltas are published before the lock
//! is released. Operations on distinct channels never contend.
//!
//! A delta the bus refuses is parked in the channel's backlog: the state
//! mutation stands, the error propagates to the caller, and every later
//! operation on the channel delivers the backlog, in order, before anything
//! newer. The channel keeps its index entry while a backlog exists, so the
//! sweeper revisits it even if no traffic does.
//!
//! An emptied channel is retired once its backlog has drained: its map entry
//! and index entry are removed and the state is marked defunct so a racing
//! `enter` holding a stale slot retries against a fresh one.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use vigil_core::{
    ChannelCount, ChannelSnapshot, Delta, DeltaKind, Environment, MessageBus, SessionKey, UserId,
};

use crate::broadcast::Broadcaster;
use crate::error::StoreError;

/// Default session timeout applied when the caller does not supply one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-channel session table and derived live-user counts.
#[derive(Debug, Default)]
struct ChannelState {
    /// Session → expiry. A session is live while `expiry > now`.
    sessions: HashMap<SessionKey, Instant>,
    /// User → number of live sessions. Entries are removed at zero.
    live_counts: HashMap<UserId, u32>,
    /// Deltas the bus has not yet accepted, oldest first.
    pending: VecDeque<Delta>,
    /// Set when this channel was emptied and retired from the channel map.
    defunct: bool,
}

impl ChannelState {
    /// Insert or refresh a session. Returns true iff this took the owning
    /// user's live-session count from 0 to 1.
    fn upsert(&mut self, key: SessionKey, expires_at: Instant) -> bool {
        let user_id = key.user_id;
        if self.sessions.insert(key, expires_at).is_some() {
            // Refresh of an already-live session.
            return false;
        }
        let count = self.live_counts.entry(user_id).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Remove a session if present. Returns `Some(user_now_absent)` when a
    /// session was removed, `None` for a no-op.
    fn remove(&mut self, key: &SessionKey) -> Option<bool> {
        self.sessions.remove(key)?;
        Some(self.decrement(key.user_id))
    }

    /// Remove every session with `expiry <= now`; returns the users whose
    /// last session expired, sorted for deterministic delta order.
    fn expire(&mut self, now: Instant) -> Vec<UserId> {
        let expired: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut departed = Vec::new();
        for key in expired {
            self.sessions.remove(&key);
            if self.decrement(key.user_id) {
                departed.push(key.user_id);
            }
        }
        departed.sort_unstable();
        departed
    }

    /// Decrement a user's live count; true iff it reached zero.
    fn decrement(&mut self, user_id: UserId) -> bool {
        match self.live_counts.get_mut(&user_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.live_counts.remove(&user_id);
                true
            }
            None => false,
        }
    }

    fn min_expiry(&self) -> Option<Instant> {
        self.sessions.values().min().copied()
    }

    fn user_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.live_counts.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

type Slot = Arc<Mutex<ChannelState>>;

/// Atomic per-channel presence bookkeeping backed by an ordered bus.
#[derive(Debug)]
pub struct PresenceStore<E: Environment, B: MessageBus> {
    env: E,
    broadcaster: Broadcaster<B>,
    channels: StdMutex<HashMap<String, Slot>>,
    /// Channel → minimum session expiry. Absent only for channels with no
    /// sessions and no undelivered deltas.
    expiry_index: StdMutex<HashMap<String, Instant>>,
}

impl<E: Environment, B: MessageBus> PresenceStore<E, B> {
    /// Create a store publishing deltas on the given bus.
    pub fn new(env: E, bus: Arc<B>) -> Self {
        Self {
            env,
            broadcaster: Broadcaster::new(bus),
            channels: StdMutex::new(HashMap::new()),
            expiry_index: StdMutex::new(HashMap::new()),
        }
    }

    /// The store's environment.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Atomically upsert a session with expiry `now + timeout`.
    ///
    /// Emits an enter delta iff this made the user present. Re-entering an
    /// already-live session only refreshes its expiry. The channel's index
    /// entry is lowered to the new expiry if smaller, never raised.
    pub async fn enter(
        &self,
        channel: &str,
        user_id: UserId,
        client_id: &str,
        timeout: Duration,
    ) -> Result<(), StoreError> {
        let expires_at = self.env.now() + timeout;
        loop {
            let slot = self.get_or_create(channel);
            let mut state = slot.lock().await;
            if state.defunct {
                continue;
            }

            let newly_present = state.upsert(SessionKey::new(user_id, client_id), expires_at);
            if newly_present {
                state.pending.push_back(Delta::new(DeltaKind::Enter, user_id));
            }
            // Index before touching the bus: the sweeper must see this
            // channel even when publishing fails.
            self.lower_index_entry(channel, expires_at);
            return self.flush_pending(channel, &mut state).await;
        }
    }

    /// Atomically remove a session. No-op without a delta if absent.
    ///
    /// Emits a leave delta iff this removed the user's last live session.
    pub async fn leave(
        &self,
        channel: &str,
        user_id: UserId,
        client_id: &str,
    ) -> Result<(), StoreError> {
        let Some(slot) = self.get(channel) else {
            return Ok(());
        };
        let mut state = slot.lock().await;
        if state.defunct {
            return Ok(());
        }

        let key = SessionKey::new(user_id, client_id);
        if state.remove(&key) == Some(true) {
            state.pending.push_back(Delta::new(DeltaKind::Leave, user_id));
        }
        let published = self.flush_pending(channel, &mut state).await;
        self.retire_or_reindex(channel, &mut state);
        published
    }

    /// Expire every session in `channel` with expiry `<= now`, emitting one
    /// leave delta per user whose last session expired.
    ///
    /// Runs under the channel lock, so it composes atomically with
    /// concurrent `enter`/`leave` on the same channel.
    pub async fn auto_leave(&self, channel: &str, now: Instant) -> Result<(), StoreError> {
        let Some(slot) = self.get(channel) else {
            return Ok(());
        };
        let mut state = slot.lock().await;
        if state.defunct {
            return Ok(());
        }

        let departed = state.expire(now);
        if !departed.is_empty() {
            tracing::debug!(channel, departed = departed.len(), "expired stale sessions");
        }
        for user_id in departed {
            state.pending.push_back(Delta::new(DeltaKind::Leave, user_id));
        }
        let published = self.flush_pending(channel, &mut state).await;
        self.retire_or_reindex(channel, &mut state);
        published
    }

    /// Sweep the channel, then snapshot its unique present users together
    /// with the last published sequence id.
    pub async fn query(&self, channel: &str) -> Result<ChannelSnapshot, StoreError> {
        self.auto_leave(channel, self.env.now()).await?;

        if let Some(slot) = self.get(channel) {
            let state = slot.lock().await;
            if !state.defunct {
                // last_id is read under the channel lock: no delta can be
                // published between the user snapshot and the id.
                let last_message_id = self.broadcaster.last_id(channel).await?;
                return Ok(ChannelSnapshot { user_ids: state.user_ids(), last_message_id });
            }
        }

        let last_message_id = self.broadcaster.last_id(channel).await?;
        Ok(ChannelSnapshot { user_ids: Vec::new(), last_message_id })
    }

    /// Count-only variant of [`query`](Self::query).
    pub async fn count(&self, channel: &str) -> Result<ChannelCount, StoreError> {
        let snapshot = self.query(channel).await?;
        Ok(ChannelCount {
            count: snapshot.user_ids.len(),
            last_message_id: snapshot.last_message_id,
        })
    }

    /// Debug only: purge all state for one channel without emitting deltas.
    pub async fn clear(&self, channel: &str) {
        if let Some(slot) = self.get(channel) {
            let mut state = slot.lock().await;
            if state.defunct {
                return;
            }
            state.sessions.clear();
            state.live_counts.clear();
            state.pending.clear();
            state.defunct = true;
            lock(&self.channels).remove(channel);
            lock(&self.expiry_index).remove(channel);
        }
    }

    /// Channels whose minimum session expiry is `<= now`.
    pub fn channels_due(&self, now: Instant) -> Vec<String> {
        lock(&self.expiry_index)
            .iter()
            .filter(|(_, min_expiry)| **min_expiry <= now)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Every channel currently holding at least one session.
    pub fn indexed_channels(&self) -> Vec<String> {
        lock(&self.expiry_index).keys().cloned().collect()
    }

    fn get(&self, channel: &str) -> Option<Slot> {
        lock(&self.channels).get(channel).map(Arc::clone)
    }

    fn get_or_create(&self, channel: &str) -> Slot {
        Arc::clone(lock(&self.channels).entry(channel.to_string()).or_default())
    }

    fn lower_index_entry(&self, channel: &str, expires_at: Instant) {
        let mut index = lock(&self.expiry_index);
        let entry = index.entry(channel.to_string()).or_insert(expires_at);
        if expires_at < *entry {
            *entry = expires_at;
        }
    }

    /// Deliver the channel's delta backlog in publish order. On failure the
    /// remaining deltas stay parked for the next operation or sweep visit.
    async fn flush_pending(
        &self,
        channel: &str,
        state: &mut ChannelState,
    ) -> Result<(), StoreError> {
        while let Some(delta) = state.pending.front().copied() {
            self.broadcaster.publish(channel, delta.kind, delta.user_id).await?;
            state.pending.pop_front();
        }
        Ok(())
    }

    /// Recompute the channel's index entry from its remaining sessions, or
    /// retire the channel entirely when empty and fully published.
    fn retire_or_reindex(&self, channel: &str, state: &mut ChannelState) {
        if let Some(min_expiry) = state.min_expiry() {
            lock(&self.expiry_index).insert(channel.to_string(), min_expiry);
        } else if state.pending.is_empty() {
            state.defunct = true;
            lock(&self.channels).remove(channel);
            lock(&self.expiry_index).remove(channel);
        } else {
            // Emptied with deltas still owed: stay due so the next sweep
            // pass drains the backlog before retiring the channel.
            lock(&self.expiry_index).insert(channel.to_string(), self.env.now());
        }
    }
}

/// Poison-recovering lock helper for the synchronous maps. Channel state
/// itself lives behind async locks; these guard only map membership and the
/// index, and are never held across an await point.
fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
