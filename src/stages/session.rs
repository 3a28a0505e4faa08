//! Entry stage for client requests.
//!
//! With a downstream stage configured, the request is handed on and the reply
//! comes back through a continuation. Without one, the stage answers with the
//! default greeting.

use crate::constants::{DEFAULT_GREETING, NO_DATA_RESPONSE};
use crate::error::StageError;
use crate::pipeline::{Context, Event, Links, Stage, StageRef, StageSpec};
use crate::protocol;

#[derive(Debug, Default)]
pub struct SessionStage;

impl SessionStage {
    pub fn make(_spec: &StageSpec) -> Result<Box<dyn Stage>, StageError> {
        Ok(Box::new(SessionStage))
    }
}

impl Stage for SessionStage {
    fn initialize(&self, links: &Links<'_>) -> Result<(), StageError> {
        if links.len() > 1 {
            tracing::debug!(
                stage = links.stage_name(),
                next = links.len(),
                "only the first downstream stage receives requests"
            );
        }
        Ok(())
    }

    fn handle(&self, me: &StageRef, mut event: Event) {
        tracing::debug!(
            stage = me.name(),
            event = event.id(),
            len = event.request().len(),
            db = ?event.session().and_then(|s| s.current_db()),
            "session request"
        );

        match me.first_downstream() {
            Some(next) if !protocol::is_blank(event.request()) => {
                event.push(me.continuation());
                next.submit(event);
            }
            _ => {
                event.set_response(DEFAULT_GREETING);
                event.push(me.continuation());
                event.finish_immediate();
            }
        }
    }

    fn resume(&self, me: &StageRef, mut event: Event, _context: Context) {
        if event.response().is_empty() {
            event.set_response(NO_DATA_RESPONSE);
        }
        tracing::trace!(stage = me.name(), event = event.id(), "session reply ready");
        event.finish();
    }

    fn timeout(&self, me: &StageRef, event: &mut Event, _context: Context) {
        tracing::warn!(stage = me.name(), event = event.id(), "session request timed out");
    }
}
