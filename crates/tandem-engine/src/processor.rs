//! The application callback that turns (state, event) into new state.

use crate::error::ProcessorError;
use crate::state::StateValue;
use tandem_client::{OutboundRecord, PartitionId};

/// A decoded event handed to the processor.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord<K, E> {
    pub partition: PartitionId,
    pub offset: u64,
    /// Milliseconds since epoch
    pub timestamp: i64,
    pub key: K,
    pub value: E,
}

/// Outcome of processing one event.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorResult<S> {
    /// Written to the state log and the cache once the event is committed
    pub new_state: StateValue<S>,
    /// Published before the event is committed
    pub output: Vec<OutboundRecord>,
}

impl<S> ProcessorResult<S> {
    pub fn new(new_state: StateValue<S>) -> Self {
        Self {
            new_state,
            output: Vec::new(),
        }
    }

    pub fn state(state: S) -> Self {
        Self::new(StateValue::Present(state))
    }

    /// Delete the key's state.
    pub fn tombstone() -> Self {
        Self::new(StateValue::Tombstone)
    }

    pub fn with_output(mut self, record: OutboundRecord) -> Self {
        self.output.push(record);
        self
    }
}

/// Processes one event against the current state of its key.
///
/// Called on the event loop task. Implementations must not block and must
/// tolerate redelivery: an event whose processing fails, or whose commit is
/// lost to a crash, is delivered again.
pub trait StateAndEventProcessor<K, S, E>: Send + Sync {
    fn on_next(
        &self,
        state: Option<&S>,
        event: &EventRecord<K, E>,
    ) -> Result<ProcessorResult<S>, ProcessorError>;
}

impl<K, S, E, F> StateAndEventProcessor<K, S, E> for F
where
    F: Fn(Option<&S>, &EventRecord<K, E>) -> Result<ProcessorResult<S>, ProcessorError> + Send + Sync,
{
    fn on_next(
        &self,
        state: Option<&S>,
        event: &EventRecord<K, E>,
    ) -> Result<ProcessorResult<S>, ProcessorError> {
        self(state, event)
    }
}
