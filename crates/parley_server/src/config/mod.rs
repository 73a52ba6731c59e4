#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_protocol::framing::DEFAULT_MAX_FRAME_SIZE;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub seed: Vec<SeedChannel>,
}

/// Server settings loaded by the server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// How many records the read model keeps per channel.
	pub history_capacity: usize,
	/// How many records the catch-up push fetches.
	pub history_fetch: usize,
	/// On-demand replay window size.
	pub replay_window: u64,
	/// Upper bound on one replay collection.
	pub replay_deadline: Duration,
	/// Live-delivery queue capacity per session.
	pub delivery_queue_capacity: usize,
	/// Maximum wire frame payload size.
	pub max_frame_bytes: usize,
	/// Maximum accepted chat text length, in characters.
	pub max_chat_len: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			metrics_bind: None,
			history_capacity: 150,
			history_fetch: 100,
			replay_window: 150,
			replay_deadline: Duration::from_secs(2),
			delivery_queue_capacity: 256,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			max_chat_len: 1024,
		}
	}
}

/// Dev seeding: channels (and their members) pre-registered at startup so a
/// fresh in-memory deployment is immediately usable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedChannel {
	pub name: String,

	#[serde(default)]
	pub private: bool,

	#[serde(default)]
	pub members: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	seed: Vec<SeedChannel>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	history_capacity: Option<usize>,
	history_fetch: Option<usize>,
	replay_window: Option<u64>,
	replay_deadline_ms: Option<u64>,
	delivery_queue_capacity: Option<usize>,
	max_frame_bytes: Option<usize>,
	max_chat_len: Option<usize>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				history_capacity: file.server.history_capacity.unwrap_or(defaults.history_capacity),
				history_fetch: file.server.history_fetch.unwrap_or(defaults.history_fetch),
				replay_window: file.server.replay_window.unwrap_or(defaults.replay_window),
				replay_deadline: file
					.server
					.replay_deadline_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.replay_deadline),
				delivery_queue_capacity: file
					.server
					.delivery_queue_capacity
					.unwrap_or(defaults.delivery_queue_capacity),
				max_frame_bytes: file.server.max_frame_bytes.unwrap_or(defaults.max_frame_bytes),
				max_chat_len: file.server.max_chat_len.unwrap_or(defaults.max_chat_len),
			},
			seed: file.seed,
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("PARLEY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_HISTORY_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.server.history_capacity = capacity;
		info!(capacity, "server config: history_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_HISTORY_FETCH")
		&& let Ok(fetch) = v.trim().parse::<usize>()
	{
		cfg.server.history_fetch = fetch;
		info!(fetch, "server config: history_fetch overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_REPLAY_WINDOW")
		&& let Ok(window) = v.trim().parse::<u64>()
	{
		cfg.server.replay_window = window;
		info!(window, "server config: replay_window overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_REPLAY_DEADLINE_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.server.replay_deadline = Duration::from_millis(ms);
		info!(ms, "server config: replay_deadline overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_DELIVERY_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.server.delivery_queue_capacity = capacity;
		info!(capacity, "server config: delivery_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.trim().parse::<usize>()
	{
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_MAX_CHAT_LEN")
		&& let Ok(len) = v.trim().parse::<usize>()
	{
		cfg.server.max_chat_len = len;
		info!(len, "server config: max_chat_len overridden by env");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_apply_with_empty_file() {
		let cfg = ServerConfig::from_file(FileConfig::default());
		assert_eq!(cfg.server.history_capacity, 150);
		assert_eq!(cfg.server.replay_window, 150);
		assert!(cfg.server.metrics_bind.is_none());
		assert!(cfg.seed.is_empty());
	}

	#[test]
	fn file_values_override_defaults() {
		let file: FileConfig = toml::from_str(
			r#"
			[server]
			metrics_bind = "127.0.0.1:9100"
			history_capacity = 10
			replay_deadline_ms = 500

			[[seed]]
			name = "general"
			members = ["john", "jane"]

			[[seed]]
			name = "ops"
			private = true
			"#,
		)
		.expect("parse");

		let cfg = ServerConfig::from_file(file);
		assert_eq!(cfg.server.metrics_bind.as_deref(), Some("127.0.0.1:9100"));
		assert_eq!(cfg.server.history_capacity, 10);
		assert_eq!(cfg.server.replay_deadline, Duration::from_millis(500));
		assert_eq!(cfg.server.history_fetch, 100);

		assert_eq!(cfg.seed.len(), 2);
		assert_eq!(cfg.seed[0].name, "general");
		assert_eq!(cfg.seed[0].members, vec!["john", "jane"]);
		assert!(cfg.seed[1].private);
	}
}
