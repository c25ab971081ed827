//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tandem_client::{MemoryBroker, OutboundRecord, PartitionId, TopicPartition};
use tandem_engine::{
    EngineConfig, EngineHandle, EventRecord, Notification, ProcessorError, ProcessorResult,
    StateAndEventEngine, StateAndEventProcessor, StateEntry,
};
use tokio::time::sleep;

pub const GROUP: &str = "ledger";
pub const EVENTS: &str = "ledger.events";
pub const STATE: &str = "ledger.state";

/// Initialize tracing for tests (safe to call from every test)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tandem_engine=debug".parse().unwrap())
                .add_directive("tandem_client=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F>(condition: F, timeout: Duration) -> Result<()>
where
    F: Fn() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return Ok(());
        }
        sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("Condition not met within {:?}", timeout)
}

/// Wait with the default 5s timeout
pub async fn eventually<F>(condition: F) -> Result<()>
where
    F: Fn() -> bool,
{
    wait_for(condition, Duration::from_secs(5)).await
}

/// Run `future` with a 10s cap so a hung engine fails the test
pub async fn bounded<T>(future: impl Future<Output = T>) -> Result<T> {
    Ok(tokio::time::timeout(Duration::from_secs(10), future).await?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub amount: i64,
    /// Close the account instead of depositing
    #[serde(default)]
    pub close: bool,
}

/// Adds deposits to the account balance. Fails on the configured offsets
/// the first time each is seen.
#[derive(Default)]
pub struct Ledger {
    pub seen: Mutex<Vec<(PartitionId, u64, Option<i64>)>>,
    pub fail_once: Mutex<Vec<(PartitionId, u64)>>,
}

impl Ledger {
    pub fn failing_once(partition: PartitionId, offset: u64) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            fail_once: Mutex::new(vec![(partition, offset)]),
        }
    }

    pub fn offsets(&self, partition: PartitionId) -> Vec<u64> {
        self.seen
            .lock()
            .iter()
            .filter(|(p, _, _)| *p == partition)
            .map(|(_, o, _)| *o)
            .collect()
    }
}

impl StateAndEventProcessor<String, Balance, Deposit> for Ledger {
    fn on_next(
        &self,
        state: Option<&Balance>,
        event: &EventRecord<String, Deposit>,
    ) -> Result<ProcessorResult<Balance>, ProcessorError> {
        self.seen
            .lock()
            .push((event.partition, event.offset, state.map(|b| b.amount)));

        let mut fail_once = self.fail_once.lock();
        if let Some(i) = fail_once
            .iter()
            .position(|f| *f == (event.partition, event.offset))
        {
            fail_once.remove(i);
            return Err(ProcessorError::new(format!(
                "ledger unavailable for offset {}",
                event.offset
            )));
        }

        if event.value.close {
            return Ok(ProcessorResult::tombstone());
        }
        let amount = state.map_or(0, |b| b.amount) + event.value.amount;
        let audit = OutboundRecord::new("ledger.audit", event.key.clone(), amount.to_string());
        Ok(ProcessorResult::state(Balance { amount }).with_output(audit))
    }
}

/// Listener that records every notification
pub type Recorded = Arc<Mutex<Vec<Notification<String, Balance>>>>;

pub fn broker(partitions: u32) -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.create_topic(EVENTS, partitions, false).unwrap();
    broker.create_topic(STATE, partitions, true).unwrap();
    broker.create_topic("ledger.audit", 1, false).unwrap();
    broker
}

pub fn config() -> EngineConfig {
    EngineConfig::builder()
        .group_id(GROUP)
        .event_topic(EVENTS)
        .state_topic(STATE)
        .poll_timeout(Duration::from_millis(20))
        .close_timeout(Duration::from_secs(1))
        .retry_delays(Duration::from_millis(1), Duration::from_millis(5))
        .build()
}

pub async fn start(
    broker: &MemoryBroker,
    processor: Arc<Ledger>,
    recorded: Recorded,
) -> Result<EngineHandle<String, Balance>> {
    let handle = StateAndEventEngine::<String, Balance, Deposit>::builder(config())
        .event_consumer(broker.consumer(GROUP))
        .state_consumer(broker.consumer(format!("{}-state", GROUP)))
        .producer(broker.producer())
        .metadata(broker.clone())
        .processor(SharedLedger(processor))
        .listener(move |n: Notification<String, Balance>| recorded.lock().push(n))
        .build()?
        .start()
        .await?;
    Ok(handle)
}

/// Lets a test keep a handle on the processor it gave the engine
pub struct SharedLedger(pub Arc<Ledger>);

impl StateAndEventProcessor<String, Balance, Deposit> for SharedLedger {
    fn on_next(
        &self,
        state: Option<&Balance>,
        event: &EventRecord<String, Deposit>,
    ) -> Result<ProcessorResult<Balance>, ProcessorError> {
        self.0.on_next(state, event)
    }
}

pub fn deposit(broker: &MemoryBroker, partition: PartitionId, account: &str, amount: i64) -> u64 {
    let value = serde_json::to_vec(&Deposit {
        amount,
        close: false,
    })
    .unwrap();
    let (_, offset) = broker
        .produce(OutboundRecord::new(EVENTS, key(account), value).with_partition(partition))
        .unwrap();
    offset
}

/// Deposit with an explicit record timestamp
pub fn deposit_at(broker: &MemoryBroker, partition: PartitionId, account: &str, amount: i64, timestamp: i64) -> u64 {
    let value = serde_json::to_vec(&Deposit {
        amount,
        close: false,
    })
    .unwrap();
    let (_, offset) = broker
        .produce(
            OutboundRecord::new(EVENTS, key(account), value)
                .with_partition(partition)
                .with_timestamp(timestamp),
        )
        .unwrap();
    offset
}

pub fn close_account(broker: &MemoryBroker, partition: PartitionId, account: &str) -> u64 {
    let value = serde_json::to_vec(&Deposit {
        amount: 0,
        close: true,
    })
    .unwrap();
    let (_, offset) = broker
        .produce(OutboundRecord::new(EVENTS, key(account), value).with_partition(partition))
        .unwrap();
    offset
}

pub fn write_balance(broker: &MemoryBroker, partition: PartitionId, account: &str, amount: i64, timestamp: i64) {
    let value = serde_json::to_vec(&Balance { amount }).unwrap();
    broker
        .produce(
            OutboundRecord::new(STATE, key(account), value)
                .with_partition(partition)
                .with_timestamp(timestamp),
        )
        .unwrap();
}

pub fn key(account: &str) -> Vec<u8> {
    serde_json::to_vec(account).unwrap()
}

pub fn committed(broker: &MemoryBroker, partition: PartitionId) -> Option<u64> {
    broker.committed_offset(GROUP, &TopicPartition::new(EVENTS, partition))
}

pub fn entry(timestamp: i64, amount: i64) -> StateEntry<Balance> {
    StateEntry::present(timestamp, Balance { amount })
}
