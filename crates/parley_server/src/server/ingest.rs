#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use parley_backend::{AckHandler, HistoryStore, LogError, OrderedLog, Subscription};
use parley_protocol::{Record, UNAVAILABLE_TEXT, decode_record};
use tracing::{debug, warn};

use crate::server::broker::chat_topic;

/// Queue group name shared by every ingest consumer, so each record is
/// appended to the read model exactly once regardless of fan-out.
pub const INGEST_GROUP: &str = "ingest";

/// Refcounted per-channel ingest registry.
///
/// The first `run` for a channel opens the queue-group subscription that
/// feeds the recent-history read model; subsequent calls for an already
/// active channel only bump the refcount. The last released handle closes
/// the subscription.
#[derive(Clone)]
pub struct IngestRegistry {
	log: Arc<dyn OrderedLog>,
	history: Arc<dyn HistoryStore>,
	inner: Arc<Mutex<HashMap<String, ActiveIngest>>>,
}

struct ActiveIngest {
	refs: usize,
	sub: Box<dyn Subscription>,
}

impl IngestRegistry {
	pub fn new(log: Arc<dyn OrderedLog>, history: Arc<dyn HistoryStore>) -> Self {
		Self {
			log,
			history,
			inner: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	/// Ensure the ingest consumer for `channel` is running and return a
	/// handle that keeps it alive. Cheap no-op when already active.
	pub async fn run(&self, channel: &str) -> Result<IngestHandle, LogError> {
		if let Some(active) = lock(&self.inner).get_mut(channel) {
			active.refs += 1;
			return Ok(self.handle(channel));
		}

		let sub = self
			.log
			.subscribe_queue(&chat_topic(channel), INGEST_GROUP, self.append_handler(channel))
			.await?;

		let mut map = lock(&self.inner);
		match map.get_mut(channel) {
			// Lost the race with a concurrent `run`; keep theirs.
			Some(active) => {
				active.refs += 1;
				drop(map);
				let mut sub = sub;
				sub.close();
			}
			None => {
				debug!(channel, "ingest: consumer started");
				map.insert(channel.to_string(), ActiveIngest { refs: 1, sub });
			}
		}

		Ok(self.handle(channel))
	}

	fn handle(&self, channel: &str) -> IngestHandle {
		IngestHandle {
			inner: Arc::clone(&self.inner),
			channel: channel.to_string(),
			closed: false,
		}
	}

	fn append_handler(&self, channel: &str) -> AckHandler {
		let history = Arc::clone(&self.history);
		let channel = channel.to_string();

		Box::new(move |seq, payload| {
			let history = Arc::clone(&history);
			let channel = channel.clone();

			Box::pin(async move {
				let record = match decode_record(&payload) {
					Ok(mut record) => {
						record.seq = seq;
						record
					}
					Err(e) => {
						warn!(channel, seq, error = %e, "ingest: undecodable record; storing placeholder");
						metrics::counter!("parley_server_decode_errors_total").increment(1);

						let mut record = Record::unavailable(seq);
						record.text = format!("ingest: {UNAVAILABLE_TEXT}");

						// The payload will never decode better; append
						// best-effort and ack either way.
						if let Err(e) = history.append_message(&channel, &record).await {
							warn!(channel, seq, error = %e, "ingest: placeholder append failed");
						}
						return Ok(());
					}
				};

				if let Err(e) = history.append_message(&channel, &record).await {
					warn!(channel, seq, error = %e, "ingest: append failed; record will be redelivered");
					return Err(anyhow::Error::new(e));
				}

				metrics::counter!("parley_server_ingest_appends_total").increment(1);
				Ok(())
			})
		})
	}

	#[cfg(test)]
	pub(crate) fn active_channels(&self) -> usize {
		lock(&self.inner).len()
	}
}

/// Liveness handle for one channel's ingest consumer.
pub struct IngestHandle {
	inner: Arc<Mutex<HashMap<String, ActiveIngest>>>,
	channel: String,
	closed: bool,
}

impl IngestHandle {
	/// Release this handle. Idempotent; the last release for a channel
	/// closes the queue-group subscription.
	pub fn close(&mut self) {
		if self.closed {
			return;
		}
		self.closed = true;

		let mut map = lock(&self.inner);
		let Some(active) = map.get_mut(&self.channel) else {
			return;
		};

		active.refs -= 1;
		if active.refs == 0 {
			if let Some(mut active) = map.remove(&self.channel) {
				active.sub.close();
			}
			debug!(channel = %self.channel, "ingest: consumer stopped");
		}
	}
}

impl Drop for IngestHandle {
	fn drop(&mut self) {
		self.close();
	}
}

fn lock<K, V>(m: &Mutex<HashMap<K, V>>) -> MutexGuard<'_, HashMap<K, V>> {
	match m.lock() {
		Ok(guard) => guard,
		Err(poisoned) => poisoned.into_inner(),
	}
}
