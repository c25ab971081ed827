//! # tandem-engine
//!
//! Co-processes a partitioned event log with a compacted state log.
//!
//! Each worker of a consumer group owns a set of event partitions. For every
//! owned partition it replays the paired state partition into an in-memory
//! cache, keeps the event partition paused until that replay has reached the
//! end offset seen at assignment, then feeds each event together with the
//! current state of its key into a [`StateAndEventProcessor`].
//!
//! ## Components
//!
//! - [`PartitionStateCache`] - last-write-wins state per owned partition
//! - [`PartitionSyncTracker`] - replay targets of newly assigned partitions
//! - [`RebalanceCoordinator`] - pause, seed and tear down on rebalance
//! - [`StateAndEventEngine`] - the state loop and the event loop
//!
//! ## Delivery
//!
//! Events are processed at least once. The processor's output and the new
//! state record are published before the event offset is committed; a failed
//! processor call leaves the offset uncommitted and the event is polled again.

pub mod cache;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
mod event_loop;
pub mod listener;
pub mod processor;
pub mod state;
mod state_loop;
pub mod sync;

pub use cache::{MergeOutcome, PartitionStateCache};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use coordinator::{PartitionPhase, RebalanceCoordinator, StateCommand, SyncEvent};
pub use engine::{EngineBuilder, EngineHandle, StateAndEventEngine};
pub use error::{EngineError, ProcessorError, Result};
pub use listener::{NoopListener, Notification, StateListener};
pub use processor::{EventRecord, ProcessorResult, StateAndEventProcessor};
pub use state::{EventData, StateData, StateEntry, StateKey, StateValue};
pub use sync::PartitionSyncTracker;
