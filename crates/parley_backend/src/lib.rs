#![forbid(unsafe_code)]

pub mod memory;

use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use parley_domain::Channel;
use parley_protocol::Record;
use thiserror::Error;

/// Errors surfaced by ordered-log backends.
#[derive(Debug, Error)]
pub enum LogError {
	#[error("log publish failed: {0}")]
	Publish(String),

	#[error("log subscribe failed: {0}")]
	Subscribe(String),

	#[error("log backend closed")]
	Closed,
}

/// Errors surfaced by directory/read-model store backends.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("store unavailable: {0}")]
	Unavailable(String),

	#[error("store data invalid: {0}")]
	InvalidData(String),
}

/// Handler invoked for every delivered record, on the backend's own
/// delivery task. Receives the log-assigned sequence and the raw payload.
pub type DeliveryHandler = Box<dyn FnMut(u64, Bytes) -> BoxFuture<'static, ()> + Send>;

/// Queue-group handler. Returning `Err` withholds the ack: the consumer
/// position does not advance and the record is redelivered.
pub type AckHandler = Box<dyn FnMut(u64, Bytes) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Open subscription handle.
pub trait Subscription: Send {
	/// Release the subscription. Idempotent; double close is a no-op.
	fn close(&mut self);
}

/// Durable, ordered, per-topic pub/sub capability.
///
/// Sequence numbers are assigned by the log at publish time, are monotonic
/// and stable per topic, and delivery is at-least-once in sequence order.
#[async_trait]
pub trait OrderedLog: Send + Sync {
	async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), LogError>;

	/// Subscribe starting at `start` (inclusive).
	async fn subscribe_from_seq(
		&self,
		topic: &str,
		start: u64,
		handler: DeliveryHandler,
	) -> Result<Box<dyn Subscription>, LogError>;

	/// Subscribe starting at the first record published at or after `start`.
	async fn subscribe_from_time(
		&self,
		topic: &str,
		start: SystemTime,
		handler: DeliveryHandler,
	) -> Result<Box<dyn Subscription>, LogError>;

	/// Join a named competing-consumer group; each record is delivered to
	/// exactly one currently-connected group member.
	async fn subscribe_queue(&self, topic: &str, group: &str, handler: AckHandler)
	-> Result<Box<dyn Subscription>, LogError>;
}

/// Channel directory capability.
#[async_trait]
pub trait ChannelStore: Send + Sync {
	async fn get(&self, name: &str) -> Result<Option<Channel>, StoreError>;

	async fn save(&self, channel: &Channel) -> Result<(), StoreError>;

	/// Names of public channels.
	async fn list_channels(&self) -> Result<Vec<String>, StoreError>;
}

/// Bounded recent-history read model capability.
#[async_trait]
pub trait HistoryStore: Send + Sync {
	/// Up to `n` most recent records in ascending sequence order, plus the
	/// sequence at which live delivery should resume (one past the newest
	/// returned record; 0 when the batch is empty).
	async fn get_recent(&self, channel: &str, n: usize) -> Result<(Vec<Record>, u64), StoreError>;

	/// Append one record; the store trims to its configured capacity.
	async fn append_message(&self, channel: &str, record: &Record) -> Result<(), StoreError>;
}
