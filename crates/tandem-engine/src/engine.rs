//! Engine assembly and the handle returned by [`StateAndEventEngine::start`].
//!
//! # Example
//!
//! ```rust,ignore
//! use tandem_engine::{EngineConfig, ProcessorResult, StateAndEventEngine};
//!
//! let config = EngineConfig::new("sessions", "clicks", "clicks.state");
//! let engine = StateAndEventEngine::<String, u64, Click>::builder(config)
//!     .event_consumer(broker.consumer("sessions"))
//!     .state_consumer(broker.consumer("sessions-state"))
//!     .producer(broker.producer())
//!     .metadata(broker.clone())
//!     .processor(|count: Option<&u64>, _click: &EventRecord<String, Click>| {
//!         Ok(ProcessorResult::state(count.copied().unwrap_or(0) + 1))
//!     })
//!     .build()?;
//!
//! let handle = engine.start().await?;
//! let clicks = handle.get_value(&"user-1".to_string());
//! handle.close().await?;
//! ```

use crate::cache::PartitionStateCache;
use crate::config::EngineConfig;
use crate::coordinator::{self, PartitionPhase, RebalanceCoordinator};
use crate::error::{EngineError, Result};
use crate::event_loop::EventLoop;
use crate::listener::{NoopListener, Notification, StateListener};
use crate::processor::StateAndEventProcessor;
use crate::state::{EventData, StateData, StateEntry, StateKey, StateValue};
use crate::state_loop::StateLoop;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tandem_client::{
    ConsumerClient, LogConsumer, LogMetadata, LogProducer, PartitionId, ProducerClient,
    RebalanceListener,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Cache and listener shared by the event loop and the handle.
pub(crate) struct SharedState<K, S> {
    pub(crate) cache: Arc<PartitionStateCache<K, S>>,
    pub(crate) listener: Arc<dyn StateListener<K, S>>,
}

impl<K: StateKey, S: StateData> SharedState<K, S> {
    /// Make committed values visible immediately and announce them.
    pub(crate) fn on_processor_state_updated(
        &self,
        updates: HashMap<PartitionId, HashMap<K, StateEntry<S>>>,
    ) -> HashMap<K, StateValue<S>> {
        let mut delta = HashMap::new();
        for (partition, entries) in updates {
            let applied = self.cache.apply_committed(partition, entries);
            if applied.is_empty() {
                debug!(partition, "No committed state applied, partition not owned");
            }
            delta.extend(applied);
        }

        if !delta.is_empty() {
            self.listener.on_notification(Notification::PostCommit {
                updates: delta.clone(),
            });
        }
        delta
    }
}

/// A configured, not yet running engine.
pub struct StateAndEventEngine<K, S, E> {
    config: EngineConfig,
    event_consumer: Box<dyn LogConsumer>,
    state_consumer: Box<dyn LogConsumer>,
    producer: Box<dyn LogProducer>,
    metadata: Arc<dyn LogMetadata>,
    processor: Arc<dyn StateAndEventProcessor<K, S, E>>,
    listener: Arc<dyn StateListener<K, S>>,
}

impl<K: StateKey, S: StateData, E: EventData> StateAndEventEngine<K, S, E> {
    pub fn builder(config: EngineConfig) -> EngineBuilder<K, S, E> {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate the topics, join the event consumer group and spawn the
    /// state and event loops.
    ///
    /// Fails without spawning anything when the topics are not
    /// co-partitioned or the subscription fails.
    pub async fn start(self) -> Result<EngineHandle<K, S>> {
        let config = self.config;
        if config.validate_partition_counts {
            let partitions = coordinator::validate_partition_counts(
                self.metadata.as_ref(),
                &config.event_topic,
                &config.state_topic,
            )?;
            debug!(partitions, "Event and state topics are co-partitioned");
        }

        let client_config = config.client_config();
        let mut event_client = ConsumerClient::new(
            format!("{}-events", config.group_id),
            self.event_consumer,
            client_config.clone(),
        );
        let state_client = ConsumerClient::new(
            format!("{}-state", config.group_id),
            self.state_consumer,
            client_config.clone(),
        );
        let producer = ProducerClient::new(
            format!("{}-producer", config.group_id),
            self.producer,
            client_config,
        );

        let cache: Arc<PartitionStateCache<K, S>> = Arc::new(PartitionStateCache::new());
        let shared = Arc::new(SharedState {
            cache: Arc::clone(&cache),
            listener: Arc::clone(&self.listener),
        });
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (synced_tx, synced_rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(RebalanceCoordinator::new(
            config.event_topic.clone(),
            config.state_topic.clone(),
            Arc::clone(&cache),
            Arc::clone(&self.listener),
            Arc::clone(&self.metadata),
            command_tx,
        ));

        let rebalance_listener: Arc<dyn RebalanceListener> = coordinator.clone();
        if let Err(e) = event_client
            .subscribe(&[config.event_topic.clone()], rebalance_listener)
            .await
        {
            event_client.close().await;
            return Err(e.into());
        }

        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);

        let state_loop = StateLoop::new(
            state_client,
            config.state_topic.clone(),
            Arc::clone(&cache),
            Arc::clone(&self.listener),
            Arc::clone(&self.metadata),
            command_rx,
            synced_tx,
            Arc::clone(&shutdown),
            config.poll_timeout(),
        );
        let event_loop = EventLoop::new(
            event_client,
            producer,
            config.state_topic.clone(),
            Arc::clone(&coordinator),
            Arc::clone(&shared),
            self.processor,
            synced_rx,
            Arc::clone(&shutdown),
            config.poll_timeout(),
        );

        let state_task = tokio::spawn(state_loop.run());
        let event_task = tokio::spawn(event_loop.run());
        info!(
            group_id = %config.group_id,
            event_topic = %config.event_topic,
            state_topic = %config.state_topic,
            "Engine started"
        );

        Ok(EngineHandle {
            shared,
            coordinator,
            shutdown,
            tasks: vec![state_task, event_task],
        })
    }
}

/// Builder for [`StateAndEventEngine`]
pub struct EngineBuilder<K, S, E> {
    config: EngineConfig,
    event_consumer: Option<Box<dyn LogConsumer>>,
    state_consumer: Option<Box<dyn LogConsumer>>,
    producer: Option<Box<dyn LogProducer>>,
    metadata: Option<Arc<dyn LogMetadata>>,
    processor: Option<Arc<dyn StateAndEventProcessor<K, S, E>>>,
    listener: Option<Arc<dyn StateListener<K, S>>>,
    _types: PhantomData<fn() -> (K, S, E)>,
}

impl<K: StateKey, S: StateData, E: EventData> EngineBuilder<K, S, E> {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            event_consumer: None,
            state_consumer: None,
            producer: None,
            metadata: None,
            processor: None,
            listener: None,
            _types: PhantomData,
        }
    }

    /// Consumer that joins the group on the event topic
    pub fn event_consumer(mut self, consumer: impl LogConsumer + 'static) -> Self {
        self.event_consumer = Some(Box::new(consumer));
        self
    }

    /// Consumer that replays the state topic by manual assignment
    pub fn state_consumer(mut self, consumer: impl LogConsumer + 'static) -> Self {
        self.state_consumer = Some(Box::new(consumer));
        self
    }

    pub fn producer(mut self, producer: impl LogProducer + 'static) -> Self {
        self.producer = Some(Box::new(producer));
        self
    }

    pub fn metadata(mut self, metadata: impl LogMetadata + 'static) -> Self {
        self.metadata = Some(Arc::new(metadata));
        self
    }

    pub fn processor(mut self, processor: impl StateAndEventProcessor<K, S, E> + 'static) -> Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    pub fn listener(mut self, listener: impl StateListener<K, S> + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub fn build(self) -> Result<StateAndEventEngine<K, S, E>> {
        self.config.validate()?;
        Ok(StateAndEventEngine {
            event_consumer: self.event_consumer.ok_or_else(|| missing("event_consumer"))?,
            state_consumer: self.state_consumer.ok_or_else(|| missing("state_consumer"))?,
            producer: self.producer.ok_or_else(|| missing("producer"))?,
            metadata: self.metadata.ok_or_else(|| missing("metadata"))?,
            processor: self.processor.ok_or_else(|| missing("processor"))?,
            listener: self.listener.unwrap_or_else(|| Arc::new(NoopListener)),
            config: self.config,
        })
    }
}

fn missing(what: &str) -> EngineError {
    EngineError::InvalidConfig(format!("{} is required", what))
}

/// Handle to a running engine.
pub struct EngineHandle<K, S> {
    shared: Arc<SharedState<K, S>>,
    coordinator: Arc<RebalanceCoordinator<K, S>>,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<Result<()>>>,
}

impl<K: StateKey, S: StateData> EngineHandle<K, S> {
    /// Visible value of `key` in any owned partition.
    ///
    /// Scans every owned partition; prefer
    /// [`get_value_in_partition`](Self::get_value_in_partition) when the
    /// key's partition is known.
    pub fn get_value(&self, key: &K) -> Option<S> {
        self.shared.cache.get(key)
    }

    pub fn get_value_in_partition(&self, partition: PartitionId, key: &K) -> Option<S> {
        self.shared
            .cache
            .get_in(partition, key)
            .and_then(|entry| entry.value.into_present())
    }

    /// Apply state that was durably written outside the event loop and
    /// notify the listener. Returns the applied delta.
    pub fn on_processor_state_updated(
        &self,
        updates: HashMap<PartitionId, HashMap<K, StateEntry<S>>>,
    ) -> HashMap<K, StateValue<S>> {
        self.shared.on_processor_state_updated(updates)
    }

    pub fn active_partitions(&self) -> Vec<PartitionId> {
        self.coordinator.active_partitions()
    }

    pub fn phase(&self, partition: PartitionId) -> PartitionPhase {
        self.coordinator.phase(partition)
    }

    /// Ask both loops to stop after their current poll. Returns immediately.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop both loops, wait for them to close their clients, and return
    /// the first fatal error either loop hit.
    pub async fn close(self) -> Result<()> {
        info!("Closing engine");
        self.stop();
        self.wait().await
    }

    /// Wait until both loops have stopped, by [`stop`](Self::stop) or by a
    /// fatal error in either one.
    pub async fn wait(self) -> Result<()> {
        let mut first_error = None;
        for task in self.tasks {
            let outcome = match task.await {
                Ok(result) => result,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
