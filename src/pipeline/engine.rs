//! Session state registry
//!
//! Owns one [`SessionState`] per live session and routes every message to
//! that session's handlers. Touched only from the engine's control thread.
//!
//! ## Lifecycle
//!
//! ```text
//! first telemetry message ──► SessionState created (handlers instantiated)
//!          │
//!          ▼
//! handle_message() ──► every handler, in order, one message at a time
//!          │
//! session_end ──► end watermark recorded, telemetry still dispatched
//!          │
//! caught up (event time >= watermark, or consumer drained)
//!   / idle timeout / max-sessions pressure
//!          │
//!          ▼
//! finish() on every handler, session marked ended
//!          │
//!          ▼
//! next iterate_ready_messages() drains its incidents, then drops it
//! ```
//!
//! `session_end` arrives on the trigger topic, which the consumer reads
//! round-robin with the raw topics. It can therefore overtake the tail of
//! its session's telemetry, so it only sets a watermark. Dropped sessions
//! leave a tombstone for one idle timeout so stragglers do not reopen them.

use super::state::SessionState;
use super::types::{DerivedEvent, Payload, RawEvent, SessionId};
use crate::handlers::HandlerSet;
use std::collections::{HashMap, HashSet};

/// Outcome of routing one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Every handler of the session observed the message
    Accepted,

    /// Sequence index not above the last accepted one; nothing observed it
    OutOfOrder { last_index: u64 },

    /// Not routed: derived-event echo, a message for a session that already
    /// ended, or a duplicate `session_end`
    Ignored,
}

/// Registry of per-session handler state
pub struct SessionRegistry {
    handlers: HandlerSet,

    sessions: HashMap<SessionId, SessionState>,

    /// Live sessions holding an end watermark
    awaiting_end: HashSet<SessionId>,

    /// `session_end` seen before any telemetry: (end timestamp, wall clock)
    early_ends: HashMap<SessionId, (i64, i64)>,

    /// Dropped sessions and when they were dropped (wall clock)
    tombstones: HashMap<SessionId, i64>,

    /// Sessions idle this long (wall clock) are finished
    idle_timeout_ms: i64,

    max_sessions: usize,

    /// Timestamp function in milliseconds (for testing with mock time)
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl SessionRegistry {
    /// Create a registry using system time for activity tracking
    pub fn new(handlers: HandlerSet, idle_timeout_ms: u64, max_sessions: usize) -> Self {
        Self::new_with_timestamp_fn(
            handlers,
            idle_timeout_ms,
            max_sessions,
            Box::new(|| chrono::Utc::now().timestamp_millis()),
        )
    }

    /// Create a registry with a custom timestamp function
    pub fn new_with_timestamp_fn(
        handlers: HandlerSet,
        idle_timeout_ms: u64,
        max_sessions: usize,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        if handlers.is_empty() {
            log::warn!("⚠️  No handlers configured; sessions will never emit derived events");
        }

        Self {
            handlers,
            sessions: HashMap::new(),
            awaiting_end: HashSet::new(),
            early_ends: HashMap::new(),
            tombstones: HashMap::new(),
            idle_timeout_ms: i64::try_from(idle_timeout_ms).unwrap_or(i64::MAX),
            max_sessions: max_sessions.max(1),
            now_fn,
        }
    }

    /// Route one message to every handler of its session
    ///
    /// Session state is created lazily on the first telemetry message. A
    /// `session_end` records an end watermark at its timestamp; its index does
    /// not take part in ordering since it comes from a different topic than
    /// the telemetry. The session finishes once its telemetry reaches the
    /// watermark, or on [`settle_pending_ends`](Self::settle_pending_ends).
    pub fn handle_message(&mut self, session_id: SessionId, event: &RawEvent, index: u64) -> Dispatch {
        let now = (self.now_fn)();

        if self.tombstones.contains_key(&session_id) {
            log::debug!("Dropping {} for ended session {}", event.payload.kind_name(), session_id);
            return Dispatch::Ignored;
        }

        match event.payload {
            Payload::Incident { .. } => return Dispatch::Ignored,
            Payload::SessionEnd => return self.record_end(session_id, event.timestamp, now),
            _ => {}
        }

        let handlers = &self.handlers;
        let state = self
            .sessions
            .entry(session_id)
            .or_insert_with(|| SessionState::new(session_id, handlers.instantiate(), now));

        if let Some((end_ts, _)) = self.early_ends.remove(&session_id) {
            state.mark_end(end_ts);
            self.awaiting_end.insert(session_id);
        }

        if state.ended {
            log::debug!("Dropping {} for ended session {}", event.payload.kind_name(), session_id);
            return Dispatch::Ignored;
        }

        if !state.accepts(index) {
            return Dispatch::OutOfOrder {
                last_index: state.last_index.unwrap_or_default(),
            };
        }

        state.dispatch(event, index, now);

        if state.caught_up() {
            let end_ts = state.end_timestamp();
            state.finish(end_ts);
            self.awaiting_end.remove(&session_id);
            log::debug!("Session {} ended", session_id);
        }

        Dispatch::Accepted
    }

    fn record_end(&mut self, session_id: SessionId, end_ts: i64, now: i64) -> Dispatch {
        let Some(state) = self.sessions.get_mut(&session_id) else {
            let entry = self.early_ends.entry(session_id).or_insert((end_ts, now));
            entry.0 = entry.0.max(end_ts);
            log::debug!("Session {} end seen before its telemetry", session_id);
            return Dispatch::Accepted;
        };

        if state.ended {
            return Dispatch::Ignored;
        }

        state.mark_end(end_ts);
        state.last_activity = now;

        if state.caught_up() {
            let end_ts = state.end_timestamp();
            state.finish(end_ts);
            self.awaiting_end.remove(&session_id);
            log::debug!("Session {} ended", session_id);
        } else {
            self.awaiting_end.insert(session_id);
        }

        Dispatch::Accepted
    }

    /// Finish every session holding an end watermark
    ///
    /// Called once the consumer has nothing left to deliver: any telemetry
    /// the end overtook has been dispatched by then. Ends seen for sessions
    /// that never produced telemetry are discarded. Returns the number of
    /// sessions finished.
    pub fn settle_pending_ends(&mut self) -> usize {
        self.early_ends.clear();

        let mut finished = 0;
        for session_id in self.awaiting_end.drain() {
            if let Some(state) = self.sessions.get_mut(&session_id) {
                if !state.ended {
                    let end_ts = state.end_timestamp();
                    state.finish(end_ts);
                    finished += 1;
                }
            }
        }

        if finished > 0 {
            log::debug!("Settled {} ended sessions", finished);
        }
        finished
    }

    /// Hand every ready derived event to `callback`, then drop ended sessions
    ///
    /// Handlers apply their own reset policy as events are taken. Returns the
    /// number of events emitted.
    pub fn iterate_ready_messages(&mut self, mut callback: impl FnMut(SessionId, DerivedEvent)) -> usize {
        let mut emitted = 0;

        for (session_id, state) in self.sessions.iter_mut() {
            let session_id = *session_id;
            emitted += state.drain_ready(|incident| callback(session_id, DerivedEvent::from_incident(session_id, incident)));
        }

        let now = (self.now_fn)();
        let awaiting_end = &mut self.awaiting_end;
        let tombstones = &mut self.tombstones;
        let mut dropped = 0;
        self.sessions.retain(|session_id, state| {
            if !state.ended {
                return true;
            }
            awaiting_end.remove(session_id);
            tombstones.insert(*session_id, now);
            dropped += 1;
            false
        });
        if dropped > 0 {
            log::debug!("Dropped {} ended sessions", dropped);
        }

        emitted
    }

    /// Finish sessions that went idle, then the oldest ones beyond capacity
    ///
    /// Evicted sessions stay registered until the next
    /// [`iterate_ready_messages`](Self::iterate_ready_messages) emits what
    /// their handlers had pending. Tombstones and early ends older than the
    /// idle timeout are forgotten. Returns the number of sessions finished.
    pub fn evict_idle(&mut self) -> usize {
        let now = (self.now_fn)();
        let idle_timeout_ms = self.idle_timeout_ms;
        let mut evicted = 0;

        self.tombstones
            .retain(|_, dropped_at| now.saturating_sub(*dropped_at) < idle_timeout_ms);
        self.early_ends
            .retain(|_, (_, seen_at)| now.saturating_sub(*seen_at) < idle_timeout_ms);

        for state in self.sessions.values_mut() {
            if !state.ended && now.saturating_sub(state.last_activity) >= idle_timeout_ms {
                let end_ts = state.end_timestamp();
                state.finish(end_ts);
                evicted += 1;
            }
        }

        let mut live: Vec<(i64, SessionId)> = self
            .sessions
            .iter()
            .filter(|(_, state)| !state.ended)
            .map(|(id, state)| (state.last_activity, *id))
            .collect();

        if live.len() > self.max_sessions {
            live.sort_unstable();
            let excess = live.len() - self.max_sessions;
            for (_, session_id) in live.into_iter().take(excess) {
                if let Some(state) = self.sessions.get_mut(&session_id) {
                    let end_ts = state.end_timestamp();
                    state.finish(end_ts);
                    evicted += 1;
                }
            }
            log::warn!("⚠️  Session cap {} reached, evicted {} oldest sessions", self.max_sessions, excess);
        }

        if evicted > 0 {
            log::info!("🧹 Finished {} idle sessions ({} live)", evicted, self.live_sessions());
        }

        evicted
    }

    /// Sessions still registered, ended ones included
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.values().filter(|state| !state.ended).count()
    }

    pub fn get(&self, session_id: SessionId) -> Option<&SessionState> {
        self.sessions.get(&session_id)
    }

    /// Sessions waiting for their telemetry to catch up with a `session_end`
    pub fn pending_ends(&self) -> usize {
        self.awaiting_end.len() + self.early_ends.len()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.names()
    }
}
