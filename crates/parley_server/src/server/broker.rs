#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::SystemTime;

use parley_backend::{DeliveryHandler, LogError, OrderedLog, Subscription};
use parley_protocol::{EncodeError, Record, decode_record, encode_record};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::server::ingest::{IngestHandle, IngestRegistry};

/// Log topic carrying a channel's records.
pub fn chat_topic(channel: &str) -> String {
	format!("chat.{channel}")
}

#[derive(Debug, Error)]
pub enum BrokerError {
	#[error(transparent)]
	Log(#[from] LogError),

	#[error("ingest start failed: {0}")]
	Ingest(#[source] LogError),

	#[error(transparent)]
	Encode(#[from] EncodeError),
}

/// Channel-level pub/sub facade over the ordered log.
///
/// Subscribing also guarantees the channel's ingest consumer is running for
/// at least the lifetime of the returned guard.
#[derive(Clone)]
pub struct Broker {
	log: Arc<dyn OrderedLog>,
	ingest: IngestRegistry,
}

impl Broker {
	pub fn new(log: Arc<dyn OrderedLog>, ingest: IngestRegistry) -> Self {
		Self { log, ingest }
	}

	/// Subscribe to `channel` starting at `start_seq` (inclusive). Records
	/// authored by `echo_from` are suppressed; pass `None` to receive
	/// everything.
	pub async fn subscribe(
		&self,
		channel: &str,
		echo_from: Option<&str>,
		start_seq: u64,
		sink: mpsc::Sender<Record>,
	) -> Result<SubscriptionGuard, BrokerError> {
		let sub = self
			.log
			.subscribe_from_seq(&chat_topic(channel), start_seq, delivery_handler(echo_from, sink))
			.await?;

		self.guard_with_ingest(channel, sub).await
	}

	/// Subscribe to `channel` from now, ignoring existing history.
	pub async fn subscribe_new(
		&self,
		channel: &str,
		echo_from: Option<&str>,
		sink: mpsc::Sender<Record>,
	) -> Result<SubscriptionGuard, BrokerError> {
		let sub = self
			.log
			.subscribe_from_time(&chat_topic(channel), SystemTime::now(), delivery_handler(echo_from, sink))
			.await?;

		self.guard_with_ingest(channel, sub).await
	}

	/// Publish one record to the channel's topic. The log assigns `seq`;
	/// whatever the record carries is ignored by consumers. No retry.
	pub async fn send(&self, channel: &str, record: &Record) -> Result<(), BrokerError> {
		let payload = encode_record(record)?;
		self.log.publish(&chat_topic(channel), payload).await?;
		metrics::counter!("parley_server_publishes_total").increment(1);
		Ok(())
	}

	async fn guard_with_ingest(
		&self,
		channel: &str,
		mut sub: Box<dyn Subscription>,
	) -> Result<SubscriptionGuard, BrokerError> {
		match self.ingest.run(channel).await {
			Ok(handle) => Ok(SubscriptionGuard {
				sub: Some(sub),
				ingest: Some(handle),
			}),
			Err(e) => {
				sub.close();
				Err(BrokerError::Ingest(e))
			}
		}
	}
}

fn delivery_handler(echo_from: Option<&str>, sink: mpsc::Sender<Record>) -> DeliveryHandler {
	let echo_from = echo_from.map(str::to_string);

	Box::new(move |seq, payload| {
		let echo_from = echo_from.clone();
		let sink = sink.clone();

		Box::pin(async move {
			let mut record = match decode_record(&payload) {
				Ok(record) => record,
				Err(e) => {
					warn!(seq, error = %e, "broker: undecodable record; substituting placeholder");
					metrics::counter!("parley_server_decode_errors_total").increment(1);
					Record::unavailable(seq)
				}
			};
			record.seq = seq;

			if let Some(me) = echo_from.as_deref()
				&& record.from == me
			{
				metrics::counter!("parley_server_echo_suppressed_total").increment(1);
				return;
			}

			// Receiver gone means the session is tearing down.
			let _ = sink.send(record).await;
		})
	})
}

/// Owns one live subscription plus the ingest liveness handle backing it.
pub struct SubscriptionGuard {
	sub: Option<Box<dyn Subscription>>,
	ingest: Option<IngestHandle>,
}

impl SubscriptionGuard {
	/// Release both halves. Idempotent; the log subscription is closed
	/// before the ingest handle.
	pub fn close(&mut self) {
		if let Some(mut sub) = self.sub.take() {
			sub.close();
		}
		if let Some(mut handle) = self.ingest.take() {
			handle.close();
		}
	}
}

impl Drop for SubscriptionGuard {
	fn drop(&mut self) {
		self.close();
	}
}
