//! JSON encoding between typed engine values and record bytes.
//!
//! A `None` payload on the state topic is a tombstone. Event records must
//! carry a payload.

use crate::error::Result;
use crate::state::StateValue;
use bytes::Bytes;
use serde::de::{DeserializeOwned, Error as _};
use serde::Serialize;

pub fn encode_key<K: Serialize>(key: &K) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(key)?))
}

pub fn decode_key<K: DeserializeOwned>(bytes: &[u8]) -> Result<K> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_state<S: Serialize>(value: &StateValue<S>) -> Result<Option<Bytes>> {
    match value {
        StateValue::Present(state) => Ok(Some(Bytes::from(serde_json::to_vec(state)?))),
        StateValue::Tombstone => Ok(None),
    }
}

pub fn decode_state<S: DeserializeOwned>(payload: Option<&Bytes>) -> Result<StateValue<S>> {
    match payload {
        Some(bytes) => Ok(StateValue::Present(serde_json::from_slice(bytes)?)),
        None => Ok(StateValue::Tombstone),
    }
}

pub fn decode_event<E: DeserializeOwned>(payload: Option<&Bytes>) -> Result<E> {
    match payload {
        Some(bytes) => Ok(serde_json::from_slice(bytes)?),
        None => Err(serde_json::Error::custom("event record has no payload").into()),
    }
}
