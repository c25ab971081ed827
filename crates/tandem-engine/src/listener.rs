//! State notifications delivered to the embedding application.

use crate::state::StateValue;
use std::collections::HashMap;
use tandem_client::PartitionId;

/// A change in the cached state the application may want to mirror.
#[derive(Debug, Clone)]
pub enum Notification<K, S> {
    /// The partition's state was replayed up to its assignment-time end
    /// offset; events for it are flowing again.
    PartitionSynced {
        partition: PartitionId,
        states: HashMap<K, S>,
    },
    /// The partition was revoked or lost. `states` is its final content.
    PartitionLost {
        partition: PartitionId,
        states: HashMap<K, S>,
    },
    /// Values that were just committed by the event loop or
    /// [`EngineHandle::on_processor_state_updated`](crate::EngineHandle::on_processor_state_updated).
    PostCommit { updates: HashMap<K, StateValue<S>> },
}

/// Receives [`Notification`]s synchronously on the engine task that caused
/// them. Must not block.
pub trait StateListener<K, S>: Send + Sync {
    fn on_notification(&self, notification: Notification<K, S>);
}

impl<K, S, F> StateListener<K, S> for F
where
    F: Fn(Notification<K, S>) + Send + Sync,
{
    fn on_notification(&self, notification: Notification<K, S>) {
        self(notification)
    }
}

/// Listener that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl<K, S> StateListener<K, S> for NoopListener {
    fn on_notification(&self, _notification: Notification<K, S>) {}
}
