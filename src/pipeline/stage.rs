//! Stages: named processing units bound to one worker pool.
//!
//! A stage author implements [`Stage`]; the registry wraps it in a
//! [`StageRef`], which owns the lifecycle state, the downstream links and the
//! lane in the bound pool. Stage objects are shared by every worker of the
//! pool, so their state must be immutable or behind their own lock.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::RwLock;

use super::continuation::{Context, Continuation};
use super::event::{Event, Transition};
use super::pool::{Job, WorkerPool};
use crate::error::StageError;
use crate::metrics;

/// Per-event business logic of one stage type.
pub trait Stage: Send + Sync + 'static {
    /// Validate the bound downstream stages. Runs once, before the pools start.
    fn initialize(&self, links: &Links<'_>) -> Result<(), StageError> {
        let _ = links;
        Ok(())
    }

    /// Process one event. Must not block on downstream work: either finish the
    /// event or push a continuation and hand it on.
    fn handle(&self, me: &StageRef, event: Event);

    /// A continuation targeting this stage fired.
    fn resume(&self, me: &StageRef, event: Event, context: Context) {
        let _ = (me, context);
        event.finish();
    }

    /// A continuation targeting this stage was unwound by `expire()`.
    fn timeout(&self, me: &StageRef, event: &mut Event, context: Context) {
        let _ = (me, event, context);
    }

    fn cleanup(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StageState {
    Uninitialized = 0,
    Initialized = 1,
    Running = 2,
    CleanedUp = 3,
}

impl StageState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => StageState::Uninitialized,
            1 => StageState::Initialized,
            2 => StageState::Running,
            _ => StageState::CleanedUp,
        }
    }
}

/// Event history settings applied to events entering the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPolicy {
    pub enabled: bool,
    pub max_hops: usize,
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_hops: 100,
        }
    }
}

/// Downstream stages bound to a stage, in configured order.
pub struct Links<'a> {
    stage: &'a str,
    next: &'a [StageRef],
}

impl<'a> Links<'a> {
    pub fn stage_name(&self) -> &str {
        self.stage
    }

    pub fn get(&self, name: &str) -> Option<&StageRef> {
        self.next.iter().find(|s| s.name() == name)
    }

    pub fn first(&self) -> Option<&StageRef> {
        self.next.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageRef> {
        self.next.iter()
    }

    pub fn len(&self) -> usize {
        self.next.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }
}

struct StageCell {
    name: String,
    kind: String,
    pool: Arc<WorkerPool>,
    lane: usize,
    next_names: Vec<String>,
    next: RwLock<Vec<StageRef>>,
    state: AtomicU8,
    history: HistoryPolicy,
    logic: Box<dyn Stage>,
}

/// Shared handle to a running stage.
#[derive(Clone)]
pub struct StageRef(Arc<StageCell>);

impl StageRef {
    pub(crate) fn new(
        name: &str,
        kind: &str,
        logic: Box<dyn Stage>,
        pool: Arc<WorkerPool>,
        next_names: Vec<String>,
        history: HistoryPolicy,
    ) -> Self {
        let lane = pool.add_lane(name);
        StageRef(Arc::new(StageCell {
            name: name.to_string(),
            kind: kind.to_string(),
            pool,
            lane,
            next_names,
            next: RwLock::new(Vec::new()),
            state: AtomicU8::new(StageState::Uninitialized as u8),
            history,
            logic,
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Factory key the stage was built from.
    pub fn kind(&self) -> &str {
        &self.0.kind
    }

    pub fn state(&self) -> StageState {
        StageState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.0.pool
    }

    pub fn downstream(&self) -> Vec<StageRef> {
        self.0.next.read().clone()
    }

    pub fn next_stage(&self, name: &str) -> Option<StageRef> {
        self.0.next.read().iter().find(|s| s.name() == name).cloned()
    }

    pub fn first_downstream(&self) -> Option<StageRef> {
        self.0.next.read().first().cloned()
    }

    pub fn queue_len(&self) -> usize {
        self.0.pool.lane_len(self.0.lane)
    }

    /// A continuation that resumes this stage.
    pub fn continuation(&self) -> Continuation {
        Continuation::new(self.clone())
    }

    pub fn continuation_with<T: std::any::Any + Send>(&self, context: T) -> Continuation {
        Continuation::with_context(self.clone(), context)
    }

    /// Queue `event` on this stage. Returns immediately; a worker of the
    /// bound pool runs [`Stage::handle`] later.
    pub fn submit(&self, mut event: Event) {
        self.ensure_running("submit");
        if self.0.history.enabled {
            event.enable_history(self.0.history.max_hops);
        }
        event.mark_dispatched();
        metrics::inc_events_submitted();
        tracing::trace!(stage = %self.0.name, event = event.id(), "submit");
        self.0.pool.enqueue(
            self.0.lane,
            Job::Dispatch {
                stage: self.clone(),
                event,
            },
        );
    }

    pub(crate) fn enqueue_resume(&self, event: Event, context: Context) {
        self.ensure_running("reschedule");
        self.0.pool.enqueue(
            self.0.lane,
            Job::Resume {
                stage: self.clone(),
                event,
                context,
            },
        );
    }

    pub(crate) fn dispatch(&self, mut event: Event) {
        event.record(&self.0.name, Transition::Handle);
        self.0.logic.handle(self, event);
    }

    pub(crate) fn resume(&self, event: Event, context: Context) {
        self.0.logic.resume(self, event, context);
    }

    pub(crate) fn timeout(&self, event: &mut Event, context: Context) {
        self.0.logic.timeout(self, event, context);
    }

    /// Bind downstream names to stages and let the stage validate them.
    pub(crate) fn initialize<F>(&self, resolve: F) -> Result<(), StageError>
    where
        F: Fn(&str) -> Option<StageRef>,
    {
        let mut bound = Vec::with_capacity(self.0.next_names.len());
        for name in &self.0.next_names {
            match resolve(name) {
                Some(stage) => bound.push(stage),
                None => {
                    return Err(StageError::UnknownDownstream {
                        stage: self.0.name.clone(),
                        next: name.clone(),
                    });
                }
            }
        }

        self.0.logic.initialize(&Links {
            stage: &self.0.name,
            next: &bound,
        })?;

        *self.0.next.write() = bound;
        self.0
            .state
            .store(StageState::Initialized as u8, Ordering::Release);
        tracing::trace!(stage = %self.0.name, "initialized");
        Ok(())
    }

    pub(crate) fn mark_running(&self) {
        self.0
            .state
            .store(StageState::Running as u8, Ordering::Release);
    }

    /// Release stage resources and drop the downstream links. Idempotent.
    pub(crate) fn cleanup(&self) {
        let prev = self
            .0
            .state
            .swap(StageState::CleanedUp as u8, Ordering::AcqRel);
        if StageState::from_u8(prev) == StageState::CleanedUp {
            return;
        }
        self.0.logic.cleanup();
        self.0.next.write().clear();
        tracing::trace!(stage = %self.0.name, "cleaned up");
    }

    fn ensure_running(&self, op: &str) {
        let state = self.state();
        if state != StageState::Running {
            crate::invariant_violation!("{op} to stage '{}' in state {state:?}", self.0.name);
        }
    }
}

impl fmt::Debug for StageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRef")
            .field("name", &self.0.name)
            .field("kind", &self.0.kind)
            .field("pool", &self.0.pool.name())
            .field("state", &self.state())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::pipeline::event::Payload;

    #[test]
    fn new_stage_is_uninitialized() {
        let (stage, _) = recording_stage("s");
        assert_eq!(stage.state(), StageState::Uninitialized);
        assert_eq!(stage.kind(), "Recording");
        assert!(stage.downstream().is_empty());
    }

    #[test]
    #[should_panic(expected = "submit to stage 's'")]
    fn submit_to_stage_that_is_not_running_is_fatal() {
        let (stage, _) = recording_stage("s");
        stage.submit(Event::new(Payload::Raw(Vec::new())));
    }

    #[test]
    fn initialize_fails_on_unknown_downstream() {
        let pool = Arc::new(WorkerPool::new("p", 1));
        let stage = StageRef::new(
            "a",
            "Recording",
            Box::new(NoopStage),
            pool,
            vec!["missing".to_string()],
            HistoryPolicy::default(),
        );
        let err = stage.initialize(|_| None).unwrap_err();
        assert!(matches!(err, StageError::UnknownDownstream { ref next, .. } if next == "missing"));
        assert_eq!(stage.state(), StageState::Uninitialized);
    }

    #[test]
    fn initialize_binds_downstream_in_order() {
        let (b, _) = recording_stage("b");
        let (c, _) = recording_stage("c");
        let pool = Arc::new(WorkerPool::new("p", 1));
        let a = StageRef::new(
            "a",
            "Noop",
            Box::new(NoopStage),
            pool,
            vec!["c".to_string(), "b".to_string()],
            HistoryPolicy::default(),
        );
        a.initialize(|name| match name {
            "b" => Some(b.clone()),
            "c" => Some(c.clone()),
            _ => None,
        })
        .unwrap();
        assert_eq!(a.state(), StageState::Initialized);
        let names: Vec<_> = a.downstream().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, ["c", "b"]);
        assert_eq!(a.first_downstream().unwrap().name(), "c");
        assert!(a.next_stage("b").is_some());
    }

    #[test]
    fn cleanup_is_idempotent_and_unlinks() {
        let (b, _) = recording_stage("b");
        let pool = Arc::new(WorkerPool::new("p", 1));
        let a = StageRef::new(
            "a",
            "Noop",
            Box::new(NoopStage),
            pool,
            vec!["b".to_string()],
            HistoryPolicy::default(),
        );
        a.initialize(|_| Some(b.clone())).unwrap();
        a.cleanup();
        a.cleanup();
        assert_eq!(a.state(), StageState::CleanedUp);
        assert!(a.downstream().is_empty());
    }

    struct NoopStage;

    impl Stage for NoopStage {
        fn handle(&self, _me: &StageRef, event: Event) {
            event.finish();
        }
    }
}
