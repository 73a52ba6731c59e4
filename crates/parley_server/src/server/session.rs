#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use parley_backend::{ChannelStore, HistoryStore};
use parley_domain::User;
use parley_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, encode_frame, try_decode_frame_from_buffer};
use parley_protocol::{ChatSend, Frame, FrameType, HandshakeRequest, HistoryRequest, META_NICK, Record};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::server::broker::{Broker, BrokerError, SubscriptionGuard};
use crate::util::time::unix_ms_now;

/// Per-session tunables.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	/// Maximum wire frame payload size.
	pub max_frame_bytes: usize,

	/// Capacity of the live-delivery queue between broker and writer.
	pub delivery_queue_capacity: usize,

	/// How many records the catch-up push fetches from the read model.
	pub history_fetch: usize,

	/// On-demand replay window: a `history_request { to }` replays records
	/// with seq in `[to - window, to)`.
	pub replay_window: u64,

	/// Upper bound on how long one replay collection may run.
	pub replay_deadline: Duration,

	/// Maximum accepted chat text length, in characters.
	pub max_chat_len: usize,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			delivery_queue_capacity: 256,
			history_fetch: 100,
			replay_window: 150,
			replay_deadline: Duration::from_secs(2),
			max_chat_len: 1024,
		}
	}
}

#[derive(Debug, Error)]
pub enum SessionError {
	#[error("transport error: {0}")]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Framing(#[from] FramingError),
}

/// Shared services a session runs against.
#[derive(Clone)]
pub struct SessionContext {
	pub broker: Broker,
	pub channels: Arc<dyn ChannelStore>,
	pub history: Arc<dyn HistoryStore>,
	pub settings: SessionSettings,
}

/// One-shot shutdown signal shared by the session's tasks.
///
/// `raise` is safe to call from any task any number of times; the watch
/// value transitions exactly once.
#[derive(Clone)]
struct Shutdown {
	raised: Arc<AtomicBool>,
	tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
	fn new() -> Self {
		let (tx, _) = watch::channel(false);
		Self {
			raised: Arc::new(AtomicBool::new(false)),
			tx: Arc::new(tx),
		}
	}

	fn subscribe(&self) -> watch::Receiver<bool> {
		self.tx.subscribe()
	}

	fn raise(&self) {
		if self
			.raised
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_ok()
		{
			let _ = self.tx.send(true);
		}
	}
}

enum Outbound {
	Frame(Frame),

	/// Written like any other frame, then the connection is torn down.
	Fatal(Frame),
}

/// Drive one client connection through handshake, catch-up and the dual
/// relay loops. Returns once the connection is fully released.
pub async fn run_session<T>(conn_id: u64, transport: T, ctx: SessionContext) -> Result<(), SessionError>
where
	T: AsyncRead + AsyncWrite + Send + 'static,
{
	let (mut reader, writer) = tokio::io::split(transport);
	let shutdown = Shutdown::new();
	let (out_tx, out_rx) = mpsc::channel::<Outbound>(ctx.settings.delivery_queue_capacity);

	let writer_task = tokio::spawn(run_writer(
		conn_id,
		writer,
		out_rx,
		shutdown.clone(),
		ctx.settings.max_frame_bytes,
	));

	let result = drive(conn_id, &mut reader, &out_tx, &shutdown, &ctx).await;

	// Closing: whichever loop lost, tear down exactly once.
	shutdown.raise();
	drop(out_tx);
	let _ = writer_task.await;

	debug!(conn_id, "session: closed");
	result
}

async fn drive<R: AsyncRead + Unpin>(
	conn_id: u64,
	reader: &mut R,
	out_tx: &mpsc::Sender<Outbound>,
	shutdown: &Shutdown,
	ctx: &SessionContext,
) -> Result<(), SessionError> {
	let max = ctx.settings.max_frame_bytes;
	let mut buf = BytesMut::with_capacity(8 * 1024);

	// AwaitingHandshake.
	let handshake = match read_next::<_, HandshakeRequest>(reader, &mut buf, max).await {
		Ok(Some(handshake)) => handshake,
		Ok(None) => {
			// Connection vanished before any frame: silent close.
			debug!(conn_id, "session: closed before handshake");
			return Ok(());
		}
		Err(SessionError::Framing(e)) => {
			debug!(conn_id, error = %e, "session: malformed handshake frame");
			send_fatal(out_tx, "join fail: malformed handshake").await;
			return Ok(());
		}
		Err(e) => return Err(e),
	};

	if let Err(e) = handshake.validate() {
		send_fatal(out_tx, e.to_string()).await;
		return Ok(());
	}

	// Joining.
	let channel = match ctx.channels.get(&handshake.channel).await {
		Ok(Some(channel)) => channel,
		Ok(None) => {
			send_fatal(out_tx, format!("join fail: no such channel: {}", handshake.channel)).await;
			return Ok(());
		}
		Err(e) => {
			warn!(conn_id, channel = %handshake.channel, error = %e, "session: channel directory unavailable");
			send_fatal(out_tx, "join fail: channel directory unavailable").await;
			return Ok(());
		}
	};

	let user = match channel.join(&handshake.nick, &handshake.secret) {
		Ok(user) => user,
		Err(e) => {
			send_fatal(out_tx, format!("join fail: {e}")).await;
			return Ok(());
		}
	};

	let channel_name = channel.name.as_str().to_string();
	let identity = user.id.to_string();
	info!(conn_id, channel = %channel_name, nick = %user.nick, member_id = %identity, "session: joined");

	// Catch-up, then live subscription with no gap and no duplicate.
	let (rec_tx, rec_rx) = mpsc::channel::<Record>(ctx.settings.delivery_queue_capacity);
	let mut guard = match catch_up(conn_id, ctx, &channel_name, &identity, handshake.last_seq, out_tx, rec_tx).await {
		Ok(guard) => guard,
		Err(e) => {
			warn!(conn_id, channel = %channel_name, error = %e, "session: subscribe failed");
			send_fatal(out_tx, "subscribe failed").await;
			return Ok(());
		}
	};

	// Sent once the subscription is live, so a client that waits for this
	// frame cannot fall into a gap between catch-up and live delivery.
	let _ = out_tx
		.send(Outbound::Frame(Frame::info(format!(
			"joined {channel_name} as {}",
			user.nick
		))))
		.await;

	let pump = tokio::spawn(pump_records(rec_rx, out_tx.clone(), shutdown.subscribe()));

	// Active.
	let result = inbound_loop(conn_id, reader, &mut buf, out_tx, shutdown, ctx, &channel_name, &user).await;

	shutdown.raise();
	guard.close();
	let _ = pump.await;
	result
}

/// Push recent history (unless resuming) and open the live subscription at
/// the matching sequence. Store failures degrade to a live-only subscribe.
async fn catch_up(
	conn_id: u64,
	ctx: &SessionContext,
	channel: &str,
	identity: &str,
	last_seq: Option<u64>,
	out_tx: &mpsc::Sender<Outbound>,
	rec_tx: mpsc::Sender<Record>,
) -> Result<SubscriptionGuard, BrokerError> {
	if let Some(last_seq) = last_seq {
		debug!(conn_id, channel, last_seq, "session: resuming from client seq");
		return ctx.broker.subscribe(channel, Some(identity), last_seq, rec_tx).await;
	}

	match ctx.history.get_recent(channel, ctx.settings.history_fetch).await {
		Ok((batch, resume)) if !batch.is_empty() => {
			debug!(conn_id, channel, count = batch.len(), resume, "session: pushing catch-up history");
			let _ = out_tx.send(Outbound::Frame(Frame::history(&batch))).await;
			ctx.broker.subscribe(channel, Some(identity), resume, rec_tx).await
		}
		Ok(_) => ctx.broker.subscribe_new(channel, Some(identity), rec_tx).await,
		Err(e) => {
			warn!(conn_id, channel, error = %e, "session: history fetch failed; delivering live only");
			let _ = out_tx
				.send(Outbound::Frame(Frame::error("history unavailable; live messages only")))
				.await;
			ctx.broker.subscribe_new(channel, Some(identity), rec_tx).await
		}
	}
}

#[allow(clippy::too_many_arguments)]
async fn inbound_loop<R: AsyncRead + Unpin>(
	conn_id: u64,
	reader: &mut R,
	buf: &mut BytesMut,
	out_tx: &mpsc::Sender<Outbound>,
	shutdown: &Shutdown,
	ctx: &SessionContext,
	channel: &str,
	user: &User,
) -> Result<(), SessionError> {
	let max = ctx.settings.max_frame_bytes;
	let mut shutdown_rx = shutdown.subscribe();

	loop {
		if *shutdown_rx.borrow_and_update() {
			return Ok(());
		}

		let next = tokio::select! {
			next = read_next::<_, Frame>(reader, buf, max) => next,
			_ = shutdown_rx.changed() => return Ok(()),
		};

		match next {
			Ok(Some(frame)) => handle_frame(conn_id, frame, out_tx, ctx, channel, user).await,
			Ok(None) => {
				debug!(conn_id, "session: client disconnected");
				return Ok(());
			}
			Err(SessionError::Framing(FramingError::Json(e))) => {
				// Frame boundary is intact; reject the one request.
				metrics::counter!("parley_server_decode_errors_total").increment(1);
				send_error(out_tx, format!("malformed frame: {e}")).await;
			}
			Err(SessionError::Framing(e)) => {
				// Cannot resync the byte stream after an oversized prefix.
				send_fatal(out_tx, e.to_string()).await;
				return Ok(());
			}
			Err(e) => return Err(e),
		}
	}
}

async fn handle_frame(
	conn_id: u64,
	frame: Frame,
	out_tx: &mpsc::Sender<Outbound>,
	ctx: &SessionContext,
	channel: &str,
	user: &User,
) {
	match frame.kind {
		FrameType::Chat => {
			let send: ChatSend = match frame.decode_data() {
				Ok(send) => send,
				Err(e) => {
					send_error(out_tx, format!("invalid chat payload: {e}")).await;
					return;
				}
			};

			if send.text.is_empty() {
				send_error(out_tx, "chat rejected: empty text").await;
				return;
			}
			if send.text.chars().count() > ctx.settings.max_chat_len {
				send_error(
					out_tx,
					format!("chat rejected: text exceeds {} characters", ctx.settings.max_chat_len),
				)
				.await;
				return;
			}

			let mut meta = send.meta;
			meta.insert(META_NICK.to_string(), user.nick.to_string());

			// `seq` is left at 0; the log assigns the real one.
			let record = Record {
				meta,
				time: unix_ms_now(),
				seq: 0,
				text: send.text,
				from: user.id.to_string(),
			};

			if let Err(e) = ctx.broker.send(channel, &record).await {
				warn!(conn_id, channel, error = %e, "session: publish failed; message dropped");
				send_error(out_tx, "send failed; message was not delivered").await;
			}
		}

		FrameType::HistoryRequest => {
			let req: HistoryRequest = match frame.decode_data() {
				Ok(req) => req,
				Err(e) => {
					send_error(out_tx, format!("invalid history request: {e}")).await;
					return;
				}
			};

			match collect_replay(ctx, channel, req.to).await {
				Ok(batch) => {
					let _ = out_tx.send(Outbound::Frame(Frame::history(&batch))).await;
				}
				Err(e) => {
					warn!(conn_id, channel, to = req.to, error = %e, "session: replay failed");
					send_error(out_tx, "history replay failed").await;
				}
			}
		}

		FrameType::History | FrameType::Error | FrameType::Info => {
			send_error(out_tx, "unsupported frame type").await;
		}
	}
}

/// Replay records with seq in `[to - window, to)` through a short-lived
/// anonymous subscription. The deadline bounds collection so a topic
/// shorter than the window cannot hang the call; whatever was collected is
/// returned.
async fn collect_replay(ctx: &SessionContext, channel: &str, to: u64) -> Result<Vec<Record>, BrokerError> {
	if to == 0 {
		return Ok(Vec::new());
	}

	let offset = to.saturating_sub(ctx.settings.replay_window);
	let (tx, mut rx) = mpsc::channel::<Record>(ctx.settings.delivery_queue_capacity);
	let mut guard = ctx.broker.subscribe(channel, None, offset, tx).await?;

	let deadline = Instant::now() + ctx.settings.replay_deadline;
	let mut batch = Vec::new();

	loop {
		let remaining = deadline.saturating_duration_since(Instant::now());
		match tokio::time::timeout(remaining, rx.recv()).await {
			Ok(Some(record)) => {
				if record.seq >= to {
					break;
				}
				let done = record.seq + 1 == to;
				batch.push(record);
				if done {
					break;
				}
			}
			Ok(None) => break,
			Err(_) => break,
		}
	}

	guard.close();
	Ok(batch)
}

/// Forward live records from the broker sink to the writer as chat frames.
async fn pump_records(mut rx: mpsc::Receiver<Record>, out_tx: mpsc::Sender<Outbound>, mut shutdown_rx: watch::Receiver<bool>) {
	loop {
		if *shutdown_rx.borrow_and_update() {
			return;
		}

		tokio::select! {
			record = rx.recv() => {
				let Some(record) = record else { return };
				if out_tx.send(Outbound::Frame(Frame::chat(&record))).await.is_err() {
					return;
				}
			}
			_ = shutdown_rx.changed() => return,
		}
	}
}

/// Single-writer task: every outbound frame crosses this loop, so frame
/// writes never interleave.
async fn run_writer<W: AsyncWrite + Unpin>(
	conn_id: u64,
	mut writer: W,
	mut rx: mpsc::Receiver<Outbound>,
	shutdown: Shutdown,
	max_frame_bytes: usize,
) {
	let mut shutdown_rx = shutdown.subscribe();

	loop {
		// Drain queued frames before honoring shutdown, so an error frame
		// queued just before teardown still reaches the client.
		let item = match rx.try_recv() {
			Ok(item) => Some(item),
			Err(mpsc::error::TryRecvError::Empty) => {
				if *shutdown_rx.borrow_and_update() {
					break;
				}
				tokio::select! {
					item = rx.recv() => item,
					_ = shutdown_rx.changed() => continue,
				}
			}
			Err(mpsc::error::TryRecvError::Disconnected) => None,
		};
		let Some(item) = item else { break };

		let (frame, fatal) = match item {
			Outbound::Frame(frame) => (frame, false),
			Outbound::Fatal(frame) => (frame, true),
		};

		match encode_frame(&frame, max_frame_bytes) {
			Ok(bytes) => {
				if let Err(e) = writer.write_all(&bytes).await {
					debug!(conn_id, error = %e, "session: write failed");
					break;
				}
				metrics::counter!("parley_server_frames_out_total").increment(1);
			}
			Err(e) => {
				warn!(conn_id, error = %e, "session: dropping unencodable frame");
			}
		}

		if fatal {
			break;
		}
	}

	let _ = writer.shutdown().await;
	shutdown.raise();
}

async fn read_next<R, M>(reader: &mut R, buf: &mut BytesMut, max: usize) -> Result<Option<M>, SessionError>
where
	R: AsyncRead + Unpin,
	M: DeserializeOwned,
{
	loop {
		match try_decode_frame_from_buffer::<M>(buf, max) {
			Ok(Some(msg)) => {
				metrics::counter!("parley_server_frames_in_total").increment(1);
				return Ok(Some(msg));
			}
			Ok(None) => {}
			Err(e) => return Err(e.into()),
		}

		if reader.read_buf(buf).await? == 0 {
			return Ok(None);
		}
	}
}

async fn send_error(out_tx: &mpsc::Sender<Outbound>, message: impl Into<String>) {
	let _ = out_tx.send(Outbound::Frame(Frame::error(message))).await;
}

async fn send_fatal(out_tx: &mpsc::Sender<Outbound>, message: impl Into<String>) {
	let _ = out_tx.send(Outbound::Fatal(Frame::error(message))).await;
}
