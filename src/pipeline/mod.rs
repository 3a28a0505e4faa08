//! Staged event pipeline: events hop between named stages, each stage runs on
//! a worker pool, and hand-offs are non-blocking with continuations carrying
//! the way back.

pub mod continuation;
pub mod deadline;
pub mod event;
pub mod layout;
pub mod pool;
pub mod registry;
pub mod stage;
pub mod sweeper;

pub use continuation::{Context, Continuation, take_context};
pub use deadline::{Deadline, WeakDeadline};
pub use event::{Event, EventState, Hop, Outcome, Payload, SessionRequest, Ticket, Transition};
pub use layout::{PipelineLayout, PoolSpec, StageSpec};
pub use pool::WorkerPool;
pub use registry::{Registry, RegistryState, StageFactory};
pub use stage::{HistoryPolicy, Links, Stage, StageRef, StageState};
pub use sweeper::Sweeper;
