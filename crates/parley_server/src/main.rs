#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;

use parley_backend::memory::{MemoryLog, MemoryStore};
use parley_backend::{ChannelStore as _, HistoryStore, OrderedLog};
use parley_domain::{Channel, ChannelName, Nick};
use parley_util::endpoint::TcpEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{SeedChannel, ServerConfig};
use crate::server::broker::Broker;
use crate::server::ingest::IngestRegistry;
use crate::server::session::{SessionContext, SessionSettings, run_session};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind tcp://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: tcp://127.0.0.1:18203)\n\
\t         Format: tcp://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "tcp://127.0.0.1:18203".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected tcp://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = TcpEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let addr: SocketAddr = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	addr
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// Pre-register channels and members from the `[seed]` config table. Issued
/// member secrets are logged so seeded members can actually join.
async fn seed_channels(store: &MemoryStore, seed: &[SeedChannel]) {
	for entry in seed {
		let name = match ChannelName::new(entry.name.clone()) {
			Ok(name) => name,
			Err(e) => {
				warn!(name = %entry.name, error = %e, "seed: skipping channel with invalid name");
				continue;
			}
		};

		let mut channel = Channel::new(name, entry.private);
		if let Some(secret) = channel.secret.as_deref() {
			info!(channel = %channel.name, secret, "seed: private channel created");
		}

		for nick in &entry.members {
			let nick = match Nick::new(nick.clone()) {
				Ok(nick) => nick,
				Err(e) => {
					warn!(channel = %channel.name, nick, error = %e, "seed: skipping member with invalid nick");
					continue;
				}
			};

			match channel.register(nick.clone()) {
				Ok(secret) => info!(channel = %channel.name, %nick, secret, "seed: member registered"),
				Err(e) => warn!(channel = %channel.name, %nick, error = %e, "seed: member registration failed"),
			}
		}

		if let Err(e) = store.save(&channel).await {
			warn!(channel = %channel.name, error = %e, "seed: channel save failed");
		} else {
			info!(channel = %channel.name, members = channel.member_count(), "seed: channel ready");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let server_cfg: ServerConfig = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let log: Arc<dyn OrderedLog> = Arc::new(MemoryLog::new());
	let store = Arc::new(MemoryStore::new(server_cfg.server.history_capacity));

	seed_channels(&store, &server_cfg.seed).await;

	let history: Arc<dyn HistoryStore> = Arc::clone(&store) as Arc<dyn HistoryStore>;
	let broker = Broker::new(Arc::clone(&log), IngestRegistry::new(Arc::clone(&log), Arc::clone(&history)));

	let ctx = SessionContext {
		broker,
		channels: store,
		history,
		settings: SessionSettings {
			max_frame_bytes: server_cfg.server.max_frame_bytes,
			delivery_queue_capacity: server_cfg.server.delivery_queue_capacity,
			history_fetch: server_cfg.server.history_fetch,
			replay_window: server_cfg.server.replay_window,
			replay_deadline: server_cfg.server.replay_deadline,
			max_chat_len: server_cfg.server.max_chat_len,
		},
	};

	let listener = TcpListener::bind(bind_addr).await?;
	info!(bind = %bind_addr, "parley_server: listening");

	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				continue;
			}
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("parley_server_connections_total").increment(1);
		info!(conn_id, remote = %remote, "accepted connection");

		let ctx = ctx.clone();
		tokio::spawn(async move {
			if let Err(e) = run_session(conn_id, stream, ctx).await {
				warn!(conn_id, error = %e, "session exited with error");
			}
		});
	}
}
