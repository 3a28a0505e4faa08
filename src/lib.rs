//! sedadb: a staged event-driven server core.
//!
//! Requests arrive on the front-end reactor ([`server`]), become events, and
//! travel through named stages running on worker pools ([`pipeline`]). The
//! registry builds the pipeline from config; the built-in stages live in
//! [`stages`].

#[doc(hidden)]
pub use tracing as __tracing;

/// Report a broken internal invariant (a defect in stage code, not a runtime
/// condition) and panic. The server binary turns the panic into an abort.
#[macro_export]
macro_rules! invariant_violation {
    ($($arg:tt)+) => {{
        let msg = format!($($arg)+);
        $crate::__tracing::error!(%msg, "invariant violation");
        panic!("invariant violation: {}", msg)
    }};
}

pub mod config;
pub mod constants;
pub mod error;
pub mod metrics;
pub mod pidfile;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stages;

pub use config::{Backend, Config, ServerConfig};
pub use error::{PipelineError, ServerError, Status};
pub use pipeline::{Event, Registry, Stage, StageRef};
pub use server::{ListenAddr, Server, ServerOptions, ShutdownHandle};
pub use session::{KvAccessor, Session};
