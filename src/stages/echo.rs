use crate::error::StageError;
use crate::pipeline::{Event, Stage, StageRef, StageSpec};

/// Answers every event inline: with the configured `Reply`, or with the
/// request bytes when none is set.
#[derive(Debug, Default)]
pub struct EchoStage {
    reply: Option<Vec<u8>>,
}

impl EchoStage {
    pub fn new(reply: Option<&[u8]>) -> Self {
        Self {
            reply: reply.map(<[u8]>::to_vec),
        }
    }

    pub fn make(spec: &StageSpec) -> Result<Box<dyn Stage>, StageError> {
        let reply = match spec.section.get("Reply") {
            None => None,
            Some(toml::Value::String(s)) => Some(s.as_bytes()),
            Some(other) => {
                return Err(StageError::Rejected {
                    stage: spec.name.clone(),
                    reason: format!("Reply must be a string, got {}", other.type_str()),
                });
            }
        };
        Ok(Box::new(EchoStage::new(reply)))
    }
}

impl Stage for EchoStage {
    fn handle(&self, me: &StageRef, mut event: Event) {
        let response = match &self.reply {
            Some(reply) => reply.clone(),
            None => event.request().to_vec(),
        };
        tracing::trace!(stage = me.name(), event = event.id(), len = response.len(), "echo");
        event.set_response(response);
        event.finish_immediate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineLayout;

    #[test]
    fn reply_key_must_be_a_string() {
        let layout = PipelineLayout::from_toml_str(
            "[SEDA_BASE]\nThreadPools = \"P\"\nSTAGES = \"E\"\n[P]\ncount = 1\n[E]\nThreadId = \"P\"\nReply = 3\n",
        )
        .unwrap();
        let err = EchoStage::make(&layout.stages[0]).err().unwrap();
        assert!(err.to_string().contains("Reply must be a string"));
    }
}
