//! Per-session state bundle owned by the registry

use crate::handlers::MessageHandler;
use crate::pipeline::types::{Incident, RawEvent, SessionId};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// One handler instance plus its health within this session
struct HandlerSlot {
    handler: Box<dyn MessageHandler>,
    faulted: bool,
}

impl HandlerSlot {
    /// Run `f` against the handler, disabling it for this session if it panics
    fn guard<T>(
        &mut self,
        session_id: SessionId,
        stage: &str,
        f: impl FnOnce(&mut dyn MessageHandler) -> T,
    ) -> Option<T> {
        if self.faulted {
            return None;
        }

        let handler = &mut self.handler;
        match catch_unwind(AssertUnwindSafe(|| f(handler.as_mut()))) {
            Ok(value) => Some(value),
            Err(_) => {
                self.faulted = true;
                log::error!(
                    "❌ Handler {} panicked during {} for session {}; disabled for this session",
                    self.handler.name(),
                    stage,
                    session_id
                );
                None
            }
        }
    }
}

/// Per-session rolling state
///
/// Holds one accumulator per configured handler, in dispatch order, plus the
/// ordering and liveness bookkeeping the registry needs.
pub struct SessionState {
    session_id: SessionId,
    slots: Vec<HandlerSlot>,

    /// Last accepted sequence index
    pub last_index: Option<u64>,

    /// Latest event time seen (ms)
    pub last_event_ts: i64,

    /// Wall-clock time of the last accepted message (ms)
    pub last_activity: i64,

    /// Event time of the `session_end`, once one has been seen
    pub end_watermark: Option<i64>,

    /// Finished; dropped after its ready events are emitted
    pub ended: bool,
}

impl SessionState {
    pub fn new(session_id: SessionId, handlers: Vec<Box<dyn MessageHandler>>, now: i64) -> Self {
        Self {
            session_id,
            slots: handlers
                .into_iter()
                .map(|handler| HandlerSlot { handler, faulted: false })
                .collect(),
            last_index: None,
            last_event_ts: i64::MIN,
            last_activity: now,
            end_watermark: None,
            ended: false,
        }
    }

    /// Whether `index` may be dispatched next
    pub fn accepts(&self, index: u64) -> bool {
        self.last_index.map_or(true, |last| index > last)
    }

    /// Run every handler over one event, in order, and record `index` as accepted
    pub fn dispatch(&mut self, event: &RawEvent, index: u64, now: i64) {
        let session_id = self.session_id;
        for slot in &mut self.slots {
            slot.guard(session_id, "handle", |h| h.handle(event));
        }

        self.last_index = Some(index);
        self.last_event_ts = self.last_event_ts.max(event.timestamp);
        self.last_activity = now;
    }

    /// Record a `session_end`; the latest one wins
    pub fn mark_end(&mut self, end_timestamp: i64) {
        self.end_watermark = Some(self.end_watermark.map_or(end_timestamp, |w| w.max(end_timestamp)));
    }

    /// Telemetry has reached the end watermark
    pub fn caught_up(&self) -> bool {
        self.end_watermark
            .map_or(false, |end| self.last_index.is_some() && self.last_event_ts >= end)
    }

    /// Event time handlers are finished at
    pub fn end_timestamp(&self) -> i64 {
        self.end_watermark
            .map_or(self.last_event_ts, |end| end.max(self.last_event_ts))
    }

    /// Settle every handler and mark the session ended
    pub fn finish(&mut self, end_timestamp: i64) {
        if self.ended {
            return;
        }

        let session_id = self.session_id;
        for slot in &mut self.slots {
            slot.guard(session_id, "finish", |h| h.finish(end_timestamp));
        }
        self.ended = true;
    }

    /// Drain every ready incident, handler by handler in dispatch order
    pub fn drain_ready(&mut self, mut callback: impl FnMut(Incident)) -> usize {
        let session_id = self.session_id;
        let mut emitted = 0;

        for slot in &mut self.slots {
            while let Some(Some(incident)) = slot.guard(session_id, "take_ready", |h| h.take_ready()) {
                callback(incident);
                emitted += 1;
            }
        }

        emitted
    }

    pub fn faulted_handlers(&self) -> Vec<&'static str> {
        self.slots
            .iter()
            .filter(|slot| slot.faulted)
            .map(|slot| slot.handler.name())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{IncidentKind, Payload};
    use serde_json::json;

    /// Records every event and is ready after each one
    struct Echo {
        seen: Vec<u64>,
    }

    impl MessageHandler for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn handle(&mut self, event: &RawEvent) {
            self.seen.push(event.index);
        }

        fn finish(&mut self, _end_timestamp: i64) {}

        fn take_ready(&mut self) -> Option<Incident> {
            self.seen
                .pop()
                .map(|index| Incident::new(IncidentKind::ClickRage, 0, json!({ "index": index })))
        }
    }

    struct Faulty;

    impl MessageHandler for Faulty {
        fn name(&self) -> &'static str {
            "faulty"
        }

        fn handle(&mut self, _event: &RawEvent) {
            panic!("detector bug");
        }

        fn finish(&mut self, _end_timestamp: i64) {}

        fn take_ready(&mut self) -> Option<Incident> {
            None
        }
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let handlers: Vec<Box<dyn MessageHandler>> = vec![Box::new(Faulty), Box::new(Echo { seen: Vec::new() })];
        let mut state = SessionState::new(1, handlers, 0);

        state.dispatch(&RawEvent::new(1, 0, 10, Payload::Unknown), 0, 0);
        state.dispatch(&RawEvent::new(1, 1, 20, Payload::Unknown), 1, 0);

        assert_eq!(state.faulted_handlers(), vec!["faulty"]);
        assert_eq!(state.drain_ready(|_| {}), 2);
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Stage {
        TakeReady,
        Finish,
    }

    /// Holds one incident per event and panics at `stage`
    struct PanicsAt {
        stage: Stage,
        held: usize,
    }

    impl MessageHandler for PanicsAt {
        fn name(&self) -> &'static str {
            match self.stage {
                Stage::TakeReady => "panics_on_take",
                Stage::Finish => "panics_on_finish",
            }
        }

        fn handle(&mut self, _event: &RawEvent) {
            self.held += 1;
        }

        fn finish(&mut self, _end_timestamp: i64) {
            if self.stage == Stage::Finish {
                panic!("finish bug");
            }
        }

        fn take_ready(&mut self) -> Option<Incident> {
            if self.stage == Stage::TakeReady {
                panic!("take_ready bug");
            }
            if self.held == 0 {
                return None;
            }
            self.held -= 1;
            Some(Incident::new(IncidentKind::DeadClick, 0, json!({})))
        }
    }

    #[test]
    fn test_panic_in_take_ready_is_isolated() {
        let handlers: Vec<Box<dyn MessageHandler>> = vec![
            Box::new(PanicsAt { stage: Stage::TakeReady, held: 0 }),
            Box::new(Echo { seen: Vec::new() }),
        ];
        let mut state = SessionState::new(1, handlers, 0);
        state.dispatch(&RawEvent::new(1, 0, 10, Payload::Unknown), 0, 0);

        let mut kinds = Vec::new();
        assert_eq!(state.drain_ready(|incident| kinds.push(incident.kind)), 1);
        assert_eq!(kinds, vec![IncidentKind::ClickRage]);
        assert_eq!(state.faulted_handlers(), vec!["panics_on_take"]);

        // Disabled for the rest of the session, never retried
        state.dispatch(&RawEvent::new(1, 1, 20, Payload::Unknown), 1, 0);
        assert_eq!(state.drain_ready(|_| {}), 1);
    }

    #[test]
    fn test_panic_in_finish_still_ends_session() {
        let handlers: Vec<Box<dyn MessageHandler>> = vec![
            Box::new(PanicsAt { stage: Stage::Finish, held: 0 }),
            Box::new(Echo { seen: Vec::new() }),
        ];
        let mut state = SessionState::new(1, handlers, 0);
        state.dispatch(&RawEvent::new(1, 0, 10, Payload::Unknown), 0, 0);

        state.finish(10);
        assert!(state.ended);
        assert_eq!(state.faulted_handlers(), vec!["panics_on_finish"]);

        // The faulted handler's held incident is lost, the other still emits
        let mut kinds = Vec::new();
        assert_eq!(state.drain_ready(|incident| kinds.push(incident.kind)), 1);
        assert_eq!(kinds, vec![IncidentKind::ClickRage]);
    }

    #[test]
    fn test_end_watermark() {
        let mut state = SessionState::new(1, Vec::new(), 0);
        state.mark_end(500);
        assert!(!state.caught_up());
        assert_eq!(state.end_timestamp(), 500);

        state.dispatch(&RawEvent::new(1, 0, 400, Payload::Unknown), 0, 0);
        assert!(!state.caught_up());

        // A later end moves the watermark forward, an earlier one does not
        state.mark_end(450);
        assert_eq!(state.end_watermark, Some(500));

        state.dispatch(&RawEvent::new(1, 1, 500, Payload::Unknown), 1, 0);
        assert!(state.caught_up());
    }

    #[test]
    fn test_accepts_only_increasing_indices() {
        let mut state = SessionState::new(1, Vec::new(), 0);
        assert!(state.accepts(0));

        state.dispatch(&RawEvent::new(1, 5, 10, Payload::Unknown), 5, 0);
        assert!(!state.accepts(5));
        assert!(!state.accepts(4));
        assert!(state.accepts(6));
    }
}
