#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, warn};

use crate::{AckHandler, DeliveryHandler, LogError, OrderedLog, Subscription};

/// Delay before redelivering an unacked queue-group record.
const REDELIVERY_DELAY: Duration = Duration::from_millis(50);

/// In-memory ordered log.
///
/// Sequences are dense per topic starting at 0. Live subscriptions replay
/// from their start position and then follow the head; queue groups keep a
/// durable per-group cursor that starts at the topic head when the group is
/// first created and advances only on ack.
pub struct MemoryLog {
	topics: Mutex<HashMap<String, Arc<TopicState>>>,

	// Dropping the log drops this sender, which stops all delivery tasks.
	shutdown_tx: watch::Sender<bool>,
}

struct TopicState {
	entries: Mutex<Vec<Entry>>,
	len_tx: watch::Sender<usize>,
	groups: Mutex<HashMap<String, GroupHandle>>,
}

struct Entry {
	payload: Bytes,
	time: SystemTime,
}

struct GroupHandle {
	ctl_tx: mpsc::UnboundedSender<GroupCtl>,
	next_member_id: u64,
}

enum GroupCtl {
	AddMember { id: u64, handler: AckHandler },
	RemoveMember { id: u64 },
}

impl Default for MemoryLog {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryLog {
	pub fn new() -> Self {
		let (shutdown_tx, _) = watch::channel(false);
		Self {
			topics: Mutex::new(HashMap::new()),
			shutdown_tx,
		}
	}

	async fn topic(&self, name: &str) -> Arc<TopicState> {
		let mut topics = self.topics.lock().await;
		topics
			.entry(name.to_string())
			.or_insert_with(|| {
				let (len_tx, _) = watch::channel(0usize);
				Arc::new(TopicState {
					entries: Mutex::new(Vec::new()),
					len_tx,
					groups: Mutex::new(HashMap::new()),
				})
			})
			.clone()
	}

	fn spawn_live(&self, topic: Arc<TopicState>, start: usize, handler: DeliveryHandler) -> Box<dyn Subscription> {
		let (stop_tx, stop_rx) = watch::channel(false);
		let shutdown_rx = self.shutdown_tx.subscribe();
		let len_rx = topic.len_tx.subscribe();

		tokio::spawn(run_live(topic, start, handler, stop_rx, shutdown_rx, len_rx));

		Box::new(LiveSubscription { stop: Some(stop_tx) })
	}
}

#[async_trait]
impl OrderedLog for MemoryLog {
	async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), LogError> {
		let topic = self.topic(topic).await;

		let len = {
			let mut entries = topic.entries.lock().await;
			entries.push(Entry {
				payload,
				time: SystemTime::now(),
			});
			entries.len()
		};

		topic.len_tx.send_replace(len);
		Ok(())
	}

	async fn subscribe_from_seq(
		&self,
		topic: &str,
		start: u64,
		handler: DeliveryHandler,
	) -> Result<Box<dyn Subscription>, LogError> {
		let topic = self.topic(topic).await;
		Ok(self.spawn_live(topic, start as usize, handler))
	}

	async fn subscribe_from_time(
		&self,
		topic: &str,
		start: SystemTime,
		handler: DeliveryHandler,
	) -> Result<Box<dyn Subscription>, LogError> {
		let topic = self.topic(topic).await;

		let cursor = {
			let entries = topic.entries.lock().await;
			entries.iter().position(|e| e.time >= start).unwrap_or(entries.len())
		};

		Ok(self.spawn_live(topic, cursor, handler))
	}

	async fn subscribe_queue(
		&self,
		topic_name: &str,
		group: &str,
		handler: AckHandler,
	) -> Result<Box<dyn Subscription>, LogError> {
		let topic = self.topic(topic_name).await;

		let mut groups = topic.groups.lock().await;
		if !groups.contains_key(group) {
			let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
			let start = topic.entries.lock().await.len();
			let len_rx = topic.len_tx.subscribe();
			let shutdown_rx = self.shutdown_tx.subscribe();

			debug!(topic = topic_name, group, start, "memory log: starting queue group");
			tokio::spawn(run_group(Arc::clone(&topic), start, ctl_rx, len_rx, shutdown_rx));

			groups.insert(
				group.to_string(),
				GroupHandle {
					ctl_tx,
					next_member_id: 0,
				},
			);
		}
		let Some(entry) = groups.get_mut(group) else {
			return Err(LogError::Closed);
		};

		let id = entry.next_member_id;
		entry.next_member_id += 1;

		entry
			.ctl_tx
			.send(GroupCtl::AddMember { id, handler })
			.map_err(|_| LogError::Closed)?;

		Ok(Box::new(QueueSubscription {
			ctl_tx: entry.ctl_tx.clone(),
			member_id: id,
			closed: false,
		}))
	}
}

async fn run_live(
	topic: Arc<TopicState>,
	mut cursor: usize,
	mut handler: DeliveryHandler,
	mut stop_rx: watch::Receiver<bool>,
	mut shutdown_rx: watch::Receiver<bool>,
	mut len_rx: watch::Receiver<usize>,
) {
	loop {
		// The subscription handle dropped its sender; stop delivering.
		if stop_rx.has_changed().is_err() {
			return;
		}

		let len = *len_rx.borrow_and_update();
		if cursor < len {
			let payload = {
				let entries = topic.entries.lock().await;
				entries[cursor].payload.clone()
			};

			handler(cursor as u64, payload).await;
			cursor += 1;
			continue;
		}

		tokio::select! {
			r = stop_rx.changed() => {
				if r.is_err() || *stop_rx.borrow() {
					return;
				}
			}
			r = len_rx.changed() => {
				if r.is_err() {
					return;
				}
			}
			_ = shutdown_rx.changed() => return,
		}
	}
}

async fn run_group(
	topic: Arc<TopicState>,
	start: usize,
	mut ctl_rx: mpsc::UnboundedReceiver<GroupCtl>,
	mut len_rx: watch::Receiver<usize>,
	mut shutdown_rx: watch::Receiver<bool>,
) {
	let mut members: Vec<(u64, AckHandler)> = Vec::new();
	let mut cursor = start;
	let mut rr: usize = 0;

	loop {
		while let Ok(cmd) = ctl_rx.try_recv() {
			apply_ctl(&mut members, cmd);
		}

		let len = *len_rx.borrow_and_update();
		if cursor < len && !members.is_empty() {
			let payload = {
				let entries = topic.entries.lock().await;
				entries[cursor].payload.clone()
			};

			let idx = rr % members.len();
			rr = rr.wrapping_add(1);
			let (member_id, handler) = &mut members[idx];
			let member_id = *member_id;

			match handler(cursor as u64, payload).await {
				Ok(()) => cursor += 1,
				Err(e) => {
					// No ack: hold position and redeliver.
					warn!(seq = cursor, member_id, error = %e, "memory log: queue delivery not acked");
					tokio::time::sleep(REDELIVERY_DELAY).await;
				}
			}
			continue;
		}

		tokio::select! {
			cmd = ctl_rx.recv() => {
				match cmd {
					Some(cmd) => apply_ctl(&mut members, cmd),
					None => return,
				}
			}
			r = len_rx.changed() => {
				if r.is_err() {
					return;
				}
			}
			_ = shutdown_rx.changed() => return,
		}
	}
}

fn apply_ctl(members: &mut Vec<(u64, AckHandler)>, cmd: GroupCtl) {
	match cmd {
		GroupCtl::AddMember { id, handler } => members.push((id, handler)),
		GroupCtl::RemoveMember { id } => members.retain(|(m, _)| *m != id),
	}
}

struct LiveSubscription {
	stop: Option<watch::Sender<bool>>,
}

impl Subscription for LiveSubscription {
	fn close(&mut self) {
		// Dropping the sender stops the delivery task.
		self.stop.take();
	}
}

struct QueueSubscription {
	ctl_tx: mpsc::UnboundedSender<GroupCtl>,
	member_id: u64,
	closed: bool,
}

impl Subscription for QueueSubscription {
	fn close(&mut self) {
		if self.closed {
			return;
		}
		self.closed = true;
		let _ = self.ctl_tx.send(GroupCtl::RemoveMember { id: self.member_id });
	}
}

impl Drop for QueueSubscription {
	fn drop(&mut self) {
		self.close();
	}
}
