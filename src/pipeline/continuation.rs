use std::any::Any;
use std::fmt;

use super::stage::StageRef;

/// Opaque per-continuation state handed back to the target stage on resume.
pub type Context = Option<Box<dyn Any + Send>>;

/// Recover a typed context; `None` if absent or of another type.
pub fn take_context<T: Any>(context: Context) -> Option<T> {
    context.and_then(|c| c.downcast::<T>().ok()).map(|b| *b)
}

/// "Resume `target` with `context`" once the event finishes downstream.
///
/// Continuations form a LIFO chain through `next`: the top one fires first and
/// the rest stay attached to the event for the resumed stage to unwind.
pub struct Continuation {
    target: StageRef,
    context: Context,
    next: Option<Box<Continuation>>,
}

impl Continuation {
    pub fn new(target: StageRef) -> Self {
        Self {
            target,
            context: None,
            next: None,
        }
    }

    pub fn with_context<T: Any + Send>(target: StageRef, context: T) -> Self {
        Self {
            target,
            context: Some(Box::new(context)),
            next: None,
        }
    }

    pub(crate) fn from_parts(target: StageRef, context: Context) -> Self {
        Self {
            target,
            context,
            next: None,
        }
    }

    pub fn target(&self) -> &StageRef {
        &self.target
    }

    /// Number of continuations in this chain, this one included.
    pub fn depth(&self) -> usize {
        1 + self.next.as_ref().map_or(0, |n| n.depth())
    }

    /// Put `below` underneath this continuation.
    pub(crate) fn link(&mut self, below: Continuation) {
        if self.next.is_some() {
            crate::invariant_violation!(
                "continuation for stage '{}' is already linked",
                self.target.name()
            );
        }
        self.next = Some(Box::new(below));
    }

    pub(crate) fn into_parts(self) -> (StageRef, Context, Option<Continuation>) {
        (self.target, self.context, self.next.map(|n| *n))
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("target", &self.target.name())
            .field("has_context", &self.context.is_some())
            .field("depth", &self.depth())
            .finish()
    }
}
