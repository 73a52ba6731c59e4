#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parley_domain::Channel;
use parley_protocol::Record;
use tokio::sync::Mutex;

use crate::{ChannelStore, HistoryStore, StoreError};

pub const DEFAULT_HISTORY_CAPACITY: usize = 150;

/// In-memory channel directory plus bounded per-channel history read model.
pub struct MemoryStore {
	channels: Mutex<HashMap<String, Channel>>,
	history: Mutex<HashMap<String, VecDeque<Record>>>,
	capacity: usize,
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new(DEFAULT_HISTORY_CAPACITY)
	}
}

impl MemoryStore {
	pub fn new(capacity: usize) -> Self {
		Self {
			channels: Mutex::new(HashMap::new()),
			history: Mutex::new(HashMap::new()),
			capacity,
		}
	}
}

#[async_trait]
impl ChannelStore for MemoryStore {
	async fn get(&self, name: &str) -> Result<Option<Channel>, StoreError> {
		Ok(self.channels.lock().await.get(name).cloned())
	}

	async fn save(&self, channel: &Channel) -> Result<(), StoreError> {
		self.channels
			.lock()
			.await
			.insert(channel.name.as_str().to_string(), channel.clone());
		Ok(())
	}

	async fn list_channels(&self) -> Result<Vec<String>, StoreError> {
		let channels = self.channels.lock().await;
		let mut names: Vec<String> = channels
			.values()
			.filter(|c| !c.is_private())
			.map(|c| c.name.as_str().to_string())
			.collect();
		names.sort();
		Ok(names)
	}
}

#[async_trait]
impl HistoryStore for MemoryStore {
	async fn get_recent(&self, channel: &str, n: usize) -> Result<(Vec<Record>, u64), StoreError> {
		let history = self.history.lock().await;
		let Some(entries) = history.get(channel) else {
			return Ok((Vec::new(), 0));
		};

		let skip = entries.len().saturating_sub(n);
		let batch: Vec<Record> = entries.iter().skip(skip).cloned().collect();

		// Live delivery resumes one past the newest record handed out.
		let resume = batch.last().map(|r| r.seq + 1).unwrap_or(0);
		Ok((batch, resume))
	}

	async fn append_message(&self, channel: &str, record: &Record) -> Result<(), StoreError> {
		let mut history = self.history.lock().await;
		let entries = history.entry(channel.to_string()).or_default();

		entries.push_back(record.clone());
		while entries.len() > self.capacity {
			entries.pop_front();
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use parley_domain::ChannelName;

	use super::*;

	fn record(seq: u64, text: &str) -> Record {
		Record {
			seq,
			text: text.to_string(),
			from: "member-a".to_string(),
			..Record::default()
		}
	}

	#[tokio::test]
	async fn get_recent_returns_last_n_ascending_with_resume_seq() {
		let store = MemoryStore::new(150);
		for seq in 0..5 {
			store
				.append_message("general", &record(seq, &format!("m{seq}")))
				.await
				.unwrap();
		}

		let (batch, resume) = store.get_recent("general", 3).await.unwrap();
		assert_eq!(batch.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![2, 3, 4]);
		assert_eq!(resume, 5);
	}

	#[tokio::test]
	async fn get_recent_on_unknown_channel_is_empty_with_zero_resume() {
		let store = MemoryStore::default();
		let (batch, resume) = store.get_recent("nowhere", 10).await.unwrap();
		assert!(batch.is_empty());
		assert_eq!(resume, 0);
	}

	#[tokio::test]
	async fn append_trims_to_capacity() {
		let store = MemoryStore::new(3);
		for seq in 0..10 {
			store.append_message("general", &record(seq, "x")).await.unwrap();
		}

		let (batch, resume) = store.get_recent("general", 100).await.unwrap();
		assert_eq!(batch.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![7, 8, 9]);
		assert_eq!(resume, 10);
	}

	#[tokio::test]
	async fn list_channels_excludes_private() {
		let store = MemoryStore::default();
		store
			.save(&Channel::new(ChannelName::new("general").unwrap(), false))
			.await
			.unwrap();
		store
			.save(&Channel::new(ChannelName::new("ops").unwrap(), true))
			.await
			.unwrap();

		assert_eq!(store.list_channels().await.unwrap(), vec!["general".to_string()]);
	}

	#[tokio::test]
	async fn save_replaces_existing_channel() {
		let store = MemoryStore::default();
		let mut ch = Channel::new(ChannelName::new("general").unwrap(), false);
		store.save(&ch).await.unwrap();

		ch.register(parley_domain::Nick::new("john").unwrap()).unwrap();
		store.save(&ch).await.unwrap();

		let got = store.get("general").await.unwrap().unwrap();
		assert_eq!(got.member_count(), 1);
	}
}
