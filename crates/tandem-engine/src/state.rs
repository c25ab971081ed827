//! Cached state values and the bounds engine type parameters must meet.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

/// Key of a state entry. Keys are JSON-encoded on both logs.
pub trait StateKey: Eq + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> StateKey for T where T: Eq + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{}

/// Value held in the state cache.
pub trait StateData: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> StateData for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Payload of an event record.
pub trait EventData: DeserializeOwned + Send + Sync + 'static {}

impl<T> EventData for T where T: DeserializeOwned + Send + Sync + 'static {}

/// A state value or the marker that the key was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateValue<S> {
    Present(S),
    Tombstone,
}

impl<S> StateValue<S> {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, StateValue::Tombstone)
    }

    pub fn as_present(&self) -> Option<&S> {
        match self {
            StateValue::Present(s) => Some(s),
            StateValue::Tombstone => None,
        }
    }

    pub fn into_present(self) -> Option<S> {
        match self {
            StateValue::Present(s) => Some(s),
            StateValue::Tombstone => None,
        }
    }
}

impl<S> From<Option<S>> for StateValue<S> {
    fn from(value: Option<S>) -> Self {
        match value {
            Some(s) => StateValue::Present(s),
            None => StateValue::Tombstone,
        }
    }
}

/// A stored state value with the record timestamp it was written at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry<S> {
    /// Milliseconds since epoch
    pub timestamp: i64,
    pub value: StateValue<S>,
}

impl<S> StateEntry<S> {
    pub fn new(timestamp: i64, value: StateValue<S>) -> Self {
        Self { timestamp, value }
    }

    pub fn present(timestamp: i64, value: S) -> Self {
        Self::new(timestamp, StateValue::Present(value))
    }

    pub fn tombstone(timestamp: i64) -> Self {
        Self::new(timestamp, StateValue::Tombstone)
    }
}
