//! The unit of work that travels between stages.
//!
//! An `Event` is owned by exactly one holder at a time: the producer, a pool
//! queue, or the stage currently running it. Terminal transitions (`finish`
//! with no continuation left, `expire`) consume the event, so a finished
//! event cannot be touched again through safe code; the runtime state check
//! backs that up for anything that slips through.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use super::continuation::{Context, Continuation};
use super::deadline::Deadline;
use super::stage::StageRef;
use crate::error::TicketError;
use crate::metrics;
use crate::server::ConnectionContext;
use crate::session::Session;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Pending,
    Dispatched,
    Completed,
    TimedOut,
}

impl EventState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EventState::Completed | EventState::TimedOut)
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventState::Pending => "pending",
            EventState::Dispatched => "dispatched",
            EventState::Completed => "completed",
            EventState::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}

/// Kind of hop recorded in an event's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Handle,
    Resume,
    Reschedule,
    Timeout,
    Complete,
    Expire,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub stage: String,
    pub transition: Transition,
}

#[derive(Debug)]
struct History {
    hops: Vec<Hop>,
    max_hops: usize,
    overflowed: bool,
}

/// Closed set of event kinds a stage can be handed.
pub enum Payload {
    /// A request read off a client connection.
    Session(SessionRequest),
    /// Bytes from an in-process producer.
    Raw(Vec<u8>),
}

pub struct SessionRequest {
    pub connection: Arc<ConnectionContext>,
    /// Request bytes without the wire terminator.
    pub request: Vec<u8>,
}

impl SessionRequest {
    /// State of the connection the request came in on.
    pub fn session(&self) -> &Session {
        self.connection.session()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Session(s) => f
                .debug_struct("Session")
                .field("connection", &s.connection.id())
                .field("len", &s.request.len())
                .finish(),
            Payload::Raw(bytes) => f.debug_struct("Raw").field("len", &bytes.len()).finish(),
        }
    }
}

/// What the producer learns once an event reaches a terminal state.
#[derive(Debug)]
pub struct Outcome {
    pub id: u64,
    pub state: EventState,
    pub response: Vec<u8>,
    pub history: Vec<Hop>,
}

type Sink = Box<dyn FnOnce(Outcome) + Send>;

/// Producer-side handle for one event's outcome.
///
/// Meant for code outside the worker pools (the client harness, tests);
/// stage code must never block on it.
pub struct Ticket {
    rx: mpsc::Receiver<Outcome>,
}

impl Ticket {
    pub fn wait(self) -> Result<Outcome, TicketError> {
        self.rx.recv().map_err(|_| TicketError::Dropped)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<Outcome, TicketError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => TicketError::Timeout,
            mpsc::RecvTimeoutError::Disconnected => TicketError::Dropped,
        })
    }
}

pub struct Event {
    id: u64,
    payload: Payload,
    response: Vec<u8>,
    continuation: Option<Continuation>,
    deadline: Option<Deadline>,
    history: Option<History>,
    state: EventState,
    sink: Option<Sink>,
}

impl Event {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            payload,
            response: Vec::new(),
            continuation: None,
            deadline: None,
            history: None,
            state: EventState::Pending,
            sink: None,
        }
    }

    /// Create an event together with the ticket its outcome is delivered to.
    pub fn with_ticket(payload: Payload) -> (Self, Ticket) {
        let (tx, rx) = mpsc::channel();
        let event = Self::new(payload).on_complete(move |outcome| {
            let _ = tx.send(outcome);
        });
        (event, Ticket { rx })
    }

    /// Register where the terminal outcome goes. Replaces any earlier sink.
    pub fn on_complete<F>(mut self, sink: F) -> Self
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> EventState {
        self.state
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Request bytes regardless of payload kind.
    pub fn request(&self) -> &[u8] {
        match &self.payload {
            Payload::Session(s) => &s.request,
            Payload::Raw(bytes) => bytes,
        }
    }

    /// Session of the originating connection; `None` for raw events.
    pub fn session(&self) -> Option<&Session> {
        match &self.payload {
            Payload::Session(s) => Some(s.session()),
            Payload::Raw(_) => None,
        }
    }

    pub fn response(&self) -> &[u8] {
        &self.response
    }

    pub fn set_response(&mut self, response: impl Into<Vec<u8>>) {
        self.response = response.into();
    }

    pub fn attach_deadline(&mut self, deadline: Deadline) {
        self.deadline = Some(deadline);
    }

    pub fn deadline(&self) -> Option<&Deadline> {
        self.deadline.as_ref()
    }

    pub fn has_expired(&self) -> bool {
        self.deadline.as_ref().is_some_and(Deadline::has_expired)
    }

    /// Start recording hops, keeping at most `max_hops`.
    pub fn enable_history(&mut self, max_hops: usize) {
        if self.history.is_none() {
            self.history = Some(History {
                hops: Vec::new(),
                max_hops,
                overflowed: false,
            });
        }
    }

    pub fn history(&self) -> &[Hop] {
        self.history.as_ref().map_or(&[], |h| h.hops.as_slice())
    }

    pub fn has_continuation(&self) -> bool {
        self.continuation.is_some()
    }

    /// Attach a continuation. Attaching over an existing one is a defect:
    /// pop it first, or use [`Event::nest`].
    pub fn push(&mut self, continuation: Continuation) {
        if let Some(existing) = &self.continuation {
            crate::invariant_violation!(
                "event {} already holds a continuation for '{}'",
                self.id,
                existing.target().name()
            );
        }
        self.continuation = Some(continuation);
    }

    pub fn pop(&mut self) -> Option<Continuation> {
        self.continuation.take()
    }

    /// Push `continuation` on top of whatever chain the event carries.
    pub fn nest(&mut self, mut continuation: Continuation) {
        if let Some(below) = self.pop() {
            continuation.link(below);
        }
        self.push(continuation);
    }

    /// Done at this level: resume the top continuation on the calling thread,
    /// or complete the event when none is left.
    pub fn finish(self) {
        self.unwind("finish");
    }

    /// Same as [`Event::finish`]; used by handlers that answer inline without
    /// handing the event to another stage first.
    pub fn finish_immediate(self) {
        self.unwind("finish_immediate");
    }

    /// Like [`Event::finish`], but the resume runs on a worker of the target
    /// stage's own pool instead of the calling thread.
    pub fn reschedule(mut self) {
        self.ensure_live("reschedule");
        match self.continuation.take() {
            Some(top) => {
                let (target, context, rest) = top.into_parts();
                self.continuation = rest;
                self.record(target.name(), Transition::Reschedule);
                target.enqueue_resume(self, context);
            }
            None => self.settle(EventState::Completed),
        }
    }

    /// Time the event out: every pending continuation gets its timeout
    /// handler, then the outcome is delivered as `TimedOut`.
    pub fn expire(mut self) {
        self.ensure_live("expire");
        self.state = EventState::TimedOut;
        while let Some(top) = self.continuation.take() {
            let (target, context, rest) = top.into_parts();
            self.continuation = rest;
            self.record(target.name(), Transition::Timeout);
            target.timeout(&mut self, context);
        }
        self.deliver(Transition::Expire);
    }

    fn unwind(mut self, op: &'static str) {
        self.ensure_live(op);
        match self.continuation.take() {
            Some(top) => {
                let (target, context, rest) = top.into_parts();
                self.continuation = rest;
                self.record(target.name(), Transition::Resume);
                target.resume(self, context);
            }
            None => self.settle(EventState::Completed),
        }
    }

    fn settle(mut self, state: EventState) {
        self.state = state;
        self.deliver(Transition::Complete);
    }

    fn deliver(mut self, transition: Transition) {
        let last_stage = self
            .history()
            .last()
            .map(|h| h.stage.clone())
            .unwrap_or_default();
        self.record(&last_stage, transition);
        match self.state {
            EventState::TimedOut => metrics::inc_events_timed_out(),
            _ => metrics::inc_events_completed(),
        }
        tracing::trace!(event = self.id, state = %self.state, "event terminal");

        if let Some(sink) = self.sink.take() {
            sink(Outcome {
                id: self.id,
                state: self.state,
                response: std::mem::take(&mut self.response),
                history: self.history.take().map(|h| h.hops).unwrap_or_default(),
            });
        }
    }

    fn ensure_live(&self, op: &str) {
        if self.state.is_terminal() {
            crate::invariant_violation!("{op} on event {} which is already {}", self.id, self.state);
        }
    }

    pub(crate) fn mark_dispatched(&mut self) {
        if self.state == EventState::Pending {
            self.state = EventState::Dispatched;
        } else if self.state.is_terminal() {
            crate::invariant_violation!("event {} re-dispatched after it was {}", self.id, self.state);
        }
    }

    /// Put a popped continuation back on top; used when a queued resume expires.
    pub(crate) fn restore(&mut self, target: StageRef, context: Context) {
        let mut top = Continuation::from_parts(target, context);
        if let Some(rest) = self.continuation.take() {
            top.link(rest);
        }
        self.continuation = Some(top);
    }

    pub(crate) fn record(&mut self, stage: &str, transition: Transition) {
        let id = self.id;
        let Some(history) = self.history.as_mut() else {
            return;
        };
        if history.hops.len() >= history.max_hops {
            if !history.overflowed {
                history.overflowed = true;
                tracing::warn!(event = id, max = history.max_hops, "event history full, dropping further hops");
            }
            return;
        }
        history.hops.push(Hop {
            stage: stage.to_string(),
            transition,
        });
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            metrics::inc_events_discarded();
            tracing::warn!(event = self.id, state = %self.state, "event dropped before completion");
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("payload", &self.payload)
            .field("continuation", &self.continuation)
            .field("has_deadline", &self.deadline.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::test_support::recording_stage;

    #[test]
    fn finish_without_continuation_completes() {
        let (ev, ticket) = Event::with_ticket(Payload::Raw(b"ping".to_vec()));
        let mut ev = ev;
        ev.set_response("pong");
        ev.finish();
        let outcome = ticket.wait().unwrap();
        assert_eq!(outcome.state, EventState::Completed);
        assert_eq!(outcome.response, b"pong");
    }

    #[test]
    fn pop_on_empty_event_is_none() {
        let mut ev = Event::new(Payload::Raw(Vec::new()));
        assert!(ev.pop().is_none());
        assert!(!ev.has_continuation());
    }

    #[test]
    #[should_panic(expected = "already holds a continuation")]
    fn double_push_is_fatal() {
        let (stage, _log) = recording_stage("a");
        let mut ev = Event::new(Payload::Raw(Vec::new()));
        ev.push(Continuation::new(stage.clone()));
        ev.push(Continuation::new(stage));
    }

    #[test]
    fn push_after_pop_is_allowed() {
        let (stage, _log) = recording_stage("a");
        let mut ev = Event::new(Payload::Raw(Vec::new()));
        ev.push(Continuation::new(stage.clone()));
        assert!(ev.pop().is_some());
        ev.push(Continuation::new(stage));
        assert!(ev.has_continuation());
    }

    #[test]
    fn finish_resumes_top_continuation_synchronously() {
        let (stage, log) = recording_stage("upstream");
        let (ev, ticket) = Event::with_ticket(Payload::Raw(Vec::new()));
        let mut ev = ev;
        ev.push(Continuation::with_context(stage, 7u32));
        ev.finish_immediate();
        assert_eq!(log.lock().as_slice(), ["resume upstream ctx=7"]);
        assert_eq!(ticket.wait().unwrap().state, EventState::Completed);
    }

    #[test]
    fn nested_chain_unwinds_lifo() {
        let (outer, log) = recording_stage("outer");
        let inner = crate::pipeline::stage::test_support::recording_stage_with_log("inner", &log);
        let (ev, ticket) = Event::with_ticket(Payload::Raw(Vec::new()));
        let mut ev = ev;
        ev.push(Continuation::with_context(outer, 1u32));
        ev.nest(Continuation::with_context(inner, 2u32));
        ev.finish();
        assert_eq!(
            log.lock().as_slice(),
            ["resume inner ctx=2", "resume outer ctx=1"]
        );
        assert_eq!(ticket.wait().unwrap().state, EventState::Completed);
    }

    #[test]
    fn expire_runs_timeout_handlers_not_resume() {
        let (outer, log) = recording_stage("outer");
        let inner = crate::pipeline::stage::test_support::recording_stage_with_log("inner", &log);
        let (ev, ticket) = Event::with_ticket(Payload::Raw(Vec::new()));
        let mut ev = ev;
        ev.push(Continuation::new(outer));
        ev.nest(Continuation::new(inner));
        ev.expire();
        assert_eq!(log.lock().as_slice(), ["timeout inner", "timeout outer"]);
        assert_eq!(ticket.wait().unwrap().state, EventState::TimedOut);
    }

    #[test]
    #[should_panic(expected = "already completed")]
    fn finishing_a_terminal_event_is_fatal() {
        let mut ev = Event::new(Payload::Raw(Vec::new()));
        ev.state = EventState::Completed;
        ev.finish();
    }

    #[test]
    #[should_panic(expected = "already timed out")]
    fn expiring_a_terminal_event_is_fatal() {
        let mut ev = Event::new(Payload::Raw(Vec::new()));
        ev.state = EventState::TimedOut;
        ev.expire();
    }

    #[test]
    fn history_records_hops_up_to_cap() {
        let (stage, _log) = recording_stage("s");
        let (ev, ticket) = Event::with_ticket(Payload::Raw(Vec::new()));
        let mut ev = ev;
        ev.enable_history(2);
        ev.record("s", Transition::Handle);
        ev.push(Continuation::new(stage));
        ev.finish();
        let outcome = ticket.wait().unwrap();
        assert_eq!(
            outcome.history,
            vec![
                Hop {
                    stage: "s".into(),
                    transition: Transition::Handle
                },
                Hop {
                    stage: "s".into(),
                    transition: Transition::Resume
                },
            ]
        );
    }

    #[test]
    fn dropped_event_disconnects_ticket() {
        let (ev, ticket) = Event::with_ticket(Payload::Raw(Vec::new()));
        drop(ev);
        assert!(matches!(ticket.wait(), Err(TicketError::Dropped)));
    }
}
