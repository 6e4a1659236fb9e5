#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, anyhow};
use prost::Message as _;
use relay_domain::{MessageScope, RawInbound, RoomKey, UserId};
use relay_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FrameBuffer, FramingError, encode_frame};
use relay_protocol::pb::envelope::Msg;
use relay_protocol::{codes, envelope, pb};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SecretString;
use crate::server::auth::{AuthSettings, authenticate_hello};
use crate::server::registry::{RoomEvent, RoomEventKind};
use crate::server::router::MessageRouter;
use crate::server::session::{JoinError, JoinPolicy, Session, resolve_target};
use crate::util::time::unix_ms_now;

const EVENTS_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const AUTH_REJECT_LINGER: Duration = Duration::from_secs(1);
/// Room left in a frame for the fields a persisted message carries beyond its inbound form.
const SEND_REPLY_HEADROOM: usize = 1024;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: u32,
	/// Depth of the per-session outbound event queue.
	pub subscriber_queue_capacity: usize,

	pub auth_token: Option<SecretString>,
	pub auth_hmac_secret: Option<SecretString>,

	pub send_rate_limit_burst: u32,
	pub send_rate_limit_per_minute: u32,

	pub join_policy: JoinPolicy,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
			subscriber_queue_capacity: 1024,
			auth_token: None,
			auth_hmac_secret: None,
			send_rate_limit_burst: 0,
			send_rate_limit_per_minute: 0,
			join_policy: JoinPolicy::Open,
		}
	}
}

impl ConnectionSettings {
	fn auth(&self) -> AuthSettings {
		AuthSettings {
			auth_token: self.auth_token.clone(),
			hmac_secret: self.auth_hmac_secret.clone(),
		}
	}
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	router: Arc<MessageRouter>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("relay_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("relay_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let max_frame = settings.max_frame_bytes as usize;

	let (mut control_send, mut control_recv) =
		connection.accept_bi().await.context("accept control bidirectional stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<pb::Envelope>();
	let reader_task = tokio::spawn(async move {
		let mut frames = FrameBuffer::new(max_frame);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("relay_server_control_bytes_in_total").increment(n as u64);
			frames.extend(&tmp[..n]);

			loop {
				match frames.next_frame::<pb::Envelope>() {
					Ok(Some(env)) => {
						metrics::counter!("relay_server_envelopes_in_total").increment(1);
						if ctrl_tx.send(env).is_err() {
							return Ok(());
						}
					}
					Ok(None) => break,
					Err(e) => {
						metrics::counter!("relay_server_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	let hello = wait_for_hello(&mut ctrl_rx).await?;
	info!(conn_id, client_name = %hello.client_name, "received Hello");
	metrics::counter!("relay_server_hello_total").increment(1);

	let bound = match authenticate_hello(conn_id, &hello, &settings.auth()) {
		Ok(bound) => bound,
		Err(e) => {
			warn!(conn_id, error = %e, "unauthorized: missing/invalid auth token");
			send_envelope(
				&mut control_send,
				envelope("", error_msg(codes::UNAUTHORIZED, "invalid auth token", "")),
				max_frame,
			)
			.await
			.ok();
			let _ = control_send.finish();
			// Linger until the client has read the Error and closed.
			let _ = tokio::time::timeout(AUTH_REJECT_LINGER, connection.closed()).await;
			reader_task.abort();
			return Ok(());
		}
	};

	let (event_tx, event_rx) = mpsc::channel::<RoomEvent>(settings.subscriber_queue_capacity.max(1));
	let mut session = Session::new(conn_id, bound.identity, bound.authenticated, event_tx);
	info!(conn_id, identity = %session.identity(), authenticated = bound.authenticated, "session bound");

	let welcome = pb::Welcome {
		server_name: format!("relay-server/{}", env!("CARGO_PKG_VERSION")),
		session_id: conn_id,
		identity: session.identity().to_string(),
		server_time_unix_ms: unix_ms_now(),
		max_frame_bytes: settings.max_frame_bytes,
	};
	send_envelope(&mut control_send, envelope("", Msg::Welcome(welcome)), max_frame)
		.await
		.context("send Welcome")?;

	let mut events_task = tokio::spawn(run_events_writer(conn_id, connection.clone(), event_rx, max_frame));

	let registry = router.registry().clone();
	let mut send_limiter = TokenBucket::new(settings.send_rate_limit_burst, settings.send_rate_limit_per_minute);

	let loop_result = async {
		while let Some(env) = ctrl_rx.recv().await {
			let request_id = env.request_id;
			let Some(msg) = env.msg else {
				continue;
			};

			let reply = match msg {
				Msg::Join(join) => match join_target(join.target, &session, &router, settings.join_policy).await {
					Ok(key) => {
						let room_key = key.to_string();
						if session.join(key, &registry).await {
							debug!(conn_id, %room_key, "joined");
						}
						Msg::Joined(pb::Joined { room_key })
					}
					Err(e) => error_msg(e.code(), &e.to_string(), &request_id),
				},

				Msg::Leave(leave) => match target_scope(leave.target) {
					Ok(scope) => {
						let key = scope.routing_key(session.identity());
						let room_key = key.to_string();
						if session.leave(&key, &registry).await {
							debug!(conn_id, %room_key, "left");
						}
						Msg::Left(pb::Left { room_key })
					}
					Err(e) => error_msg(e.code(), &e.to_string(), &request_id),
				},

				Msg::Send(send) => {
					if send_limiter.as_mut().is_some_and(|b| !b.allow()) {
						metrics::counter!("relay_server_send_rate_limited_total").increment(1);
						send_failure(codes::RATE_LIMITED, "send rate limit exceeded")
					} else if send
						.message
						.as_ref()
						.is_some_and(|m| m.encoded_len() + SEND_REPLY_HEADROOM > max_frame)
					{
						send_failure(codes::INVALID_MESSAGE, "message too large to relay")
					} else {
						let raw = send.message.map(RawInbound::from).unwrap_or_default();
						match router.route(raw, Some(&session.origin())).await {
							Ok(message) => Msg::SendResult(pb::SendResult {
								success: true,
								message: Some(pb::ChatMessage::from(&message)),
								error_code: String::new(),
								error: String::new(),
							}),
							Err(e) => send_failure(e.code(), &e.to_string()),
						}
					}
				}

				Msg::History(req) => match history(req, &session, &router, settings.join_policy).await {
					Ok(messages) => {
						let messages = messages.iter().map(pb::ChatMessage::from).collect::<Vec<_>>();
						let total = messages.len();
						let result = fit_history(messages, &request_id, max_frame);
						if result.messages.len() < total {
							debug!(conn_id, total, kept = result.messages.len(), "history trimmed to frame limit");
						}
						Msg::HistoryResult(result)
					}
					Err(e) => error_msg(e.code(), &e.to_string(), &request_id),
				},

				Msg::CreateRoom(req) => {
					let name = req.name.trim();
					if name.is_empty() {
						error_msg(codes::INVALID_MESSAGE, "room name must not be blank", &request_id)
					} else {
						let members = req.members.into_iter().filter_map(|m| UserId::new(m).ok()).collect::<Vec<_>>();
						match router.create_room(name, session.identity(), &members).await {
							Ok(room) => Msg::RoomCreated(pb::RoomCreated {
								room: Some(pb::RoomInfo::from(&room)),
							}),
							Err(e) => error_msg(e.code(), &e.to_string(), &request_id),
						}
					}
				}

				Msg::Ping(ping) => Msg::Pong(pb::Pong {
					client_time_unix_ms: ping.client_time_unix_ms,
					server_time_unix_ms: unix_ms_now(),
				}),

				Msg::Hello(_) => {
					debug!(conn_id, "ignoring duplicate Hello");
					continue;
				}

				other => {
					warn!(conn_id, "unhandled control message: {:?}", other);
					error_msg(codes::PROTOCOL, "unexpected message on control stream", &request_id)
				}
			};

			send_envelope(&mut control_send, envelope(request_id, reply), max_frame).await?;
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	debug!(conn_id, keys = session.keys().count(), "connection closing, removing subscriptions");
	session.disconnect(&registry).await;

	let _ = reader_task.await;
	if tokio::time::timeout(EVENTS_DRAIN_TIMEOUT, &mut events_task).await.is_err() {
		events_task.abort();
	}

	loop_result
}

async fn run_events_writer(
	conn_id: u64,
	connection: quinn::Connection,
	mut event_rx: mpsc::Receiver<RoomEvent>,
	max_frame: usize,
) -> anyhow::Result<()> {
	let (mut events_send, _events_recv) = connection.accept_bi().await.context("accept events bidirectional stream")?;
	debug!(conn_id, "events stream ready");

	while let Some(event) = event_rx.recv().await {
		let env = envelope("", Msg::Event(event_envelope(event)));
		let frame = match encode_frame(&env, max_frame) {
			Ok(frame) => frame,
			Err(FramingError::FrameTooLarge { len, max }) => {
				warn!(conn_id, len, max, "dropping oversized event");
				continue;
			}
			Err(e) => return Err(anyhow!(e).context("encode event frame")),
		};

		events_send.write_all(&frame).await.context("events stream write failed")?;
		metrics::counter!("relay_server_events_out_total").increment(1);
	}

	let _ = events_send.finish();
	Ok(())
}

fn event_envelope(event: RoomEvent) -> pb::EventEnvelope {
	use pb::event_envelope::Event;

	let payload = match event.kind {
		RoomEventKind::Chat(message) => Event::ChatMessage(pb::ChatMessage::from(message.as_ref())),
		RoomEventKind::PeerJoined(who) => Event::PeerJoined(pb::PeerPresence {
			identity: who.into_string(),
		}),
		RoomEventKind::PeerLeft(who) => Event::PeerLeft(pb::PeerPresence {
			identity: who.into_string(),
		}),
	};

	pb::EventEnvelope {
		room_key: event.key.to_string(),
		server_time_unix_ms: unix_ms_now(),
		event: Some(payload),
	}
}

fn target_scope(target: Option<pb::Target>) -> Result<MessageScope, JoinError> {
	let target = target.ok_or_else(|| JoinError::InvalidTarget("missing target".to_string()))?;
	MessageScope::try_from(target).map_err(|e| JoinError::InvalidTarget(e.to_string()))
}

async fn join_target(
	target: Option<pb::Target>,
	session: &Session,
	router: &MessageRouter,
	policy: JoinPolicy,
) -> Result<RoomKey, JoinError> {
	let scope = target_scope(target)?;
	resolve_target(&scope, session.identity(), router, policy).await
}

/// History of a conversation the session would be allowed to join.
async fn history(
	req: pb::History,
	session: &Session,
	router: &MessageRouter,
	policy: JoinPolicy,
) -> Result<Vec<relay_domain::Message>, JoinError> {
	let limit = Some(req.limit);
	let key = join_target(req.target, session, router, policy).await?;
	let result = match &key {
		RoomKey::Direct(pair) => router.history_direct(pair.low(), pair.high(), limit).await,
		RoomKey::Room(room_id) => router.history_room(room_id, limit).await,
	};
	result.map_err(JoinError::Storage)
}

fn error_msg(code: &str, message: &str, request_id: &str) -> Msg {
	Msg::Error(pb::Error {
		code: code.to_string(),
		message: message.to_string(),
		request_id: request_id.to_string(),
	})
}

fn send_failure(code: &str, error: &str) -> Msg {
	Msg::SendResult(pb::SendResult {
		success: false,
		message: None,
		error_code: code.to_string(),
		error: error.to_string(),
	})
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::UnboundedReceiver<pb::Envelope>) -> anyhow::Result<pb::Hello> {
	while let Some(env) = ctrl_rx.recv().await {
		let Some(msg) = env.msg else { continue };
		if let Msg::Hello(h) = msg {
			return Ok(h);
		}
	}
	Err(anyhow!("connection closed before Hello"))
}

/// Keeps the newest messages that fit in one reply frame, dropping the oldest.
fn fit_history(mut messages: Vec<pb::ChatMessage>, request_id: &str, max_frame: usize) -> pb::HistoryResult {
	let empty = envelope(request_id, Msg::HistoryResult(pb::HistoryResult::default())).encoded_len();
	// Nested length prefixes grow by at most four bytes each once the result is non-empty.
	let mut budget = max_frame.saturating_sub(empty + 8);

	let mut keep_from = messages.len();
	for (i, m) in messages.iter().enumerate().rev() {
		let len = prost::encoding::message::encoded_len(1, m);
		if len > budget {
			break;
		}
		budget -= len;
		keep_from = i;
	}

	messages.drain(..keep_from);
	pb::HistoryResult { messages }
}

/// Encodes a control reply, replacing one that cannot fit in a frame with `REPLY_TOO_LARGE`.
fn encode_reply(env: pb::Envelope, max_frame: usize) -> anyhow::Result<Vec<u8>> {
	match encode_frame(&env, max_frame) {
		Ok(frame) => Ok(frame),
		Err(FramingError::FrameTooLarge { len, max }) => {
			warn!(len, max, request_id = %env.request_id, "reply exceeds frame limit");
			metrics::counter!("relay_server_replies_too_large_total").increment(1);
			let msg = error_msg(
				codes::REPLY_TOO_LARGE,
				&format!("reply of {len} bytes exceeds the {max} byte frame limit"),
				&env.request_id,
			);
			encode_frame(&envelope(env.request_id, msg), max_frame).map_err(|e| anyhow!(e).context("encode error reply"))
		}
		Err(e) => Err(anyhow!(e).context("encode reply")),
	}
}

async fn send_envelope(send: &mut quinn::SendStream, env: pb::Envelope, max_frame: usize) -> anyhow::Result<()> {
	let frame = encode_reply(env, max_frame)?;
	metrics::counter!("relay_server_envelopes_out_total").increment(1);
	metrics::counter!("relay_server_control_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn token_bucket_disabled_by_zero() {
		assert!(TokenBucket::new(0, 60).is_none());
		assert!(TokenBucket::new(5, 0).is_none());
	}

	#[test]
	fn token_bucket_allows_burst_then_throttles() {
		let mut bucket = TokenBucket::new(3, 1).expect("enabled");
		assert!(bucket.allow());
		assert!(bucket.allow());
		assert!(bucket.allow());
		assert!(!bucket.allow());
	}

	#[test]
	fn presence_events_carry_room_key_and_identity() {
		let alice = UserId::new("alice").expect("user");
		let key = RoomKey::direct(&alice, &UserId::new("bob").expect("user"));
		let env = event_envelope(RoomEvent {
			key: key.clone(),
			kind: RoomEventKind::PeerJoined(alice),
		});
		assert_eq!(env.room_key, "dm:alice-bob");
		assert_eq!(
			env.event,
			Some(pb::event_envelope::Event::PeerJoined(pb::PeerPresence {
				identity: "alice".to_string(),
			}))
		);
	}

	fn chat(id: &str, body_len: usize) -> pb::ChatMessage {
		pb::ChatMessage {
			id: id.to_string(),
			sender_id: "alice".to_string(),
			body: "x".repeat(body_len),
			..pb::ChatMessage::default()
		}
	}

	#[test]
	fn history_keeps_newest_messages_that_fit() {
		let max_frame = 4096;
		let messages = vec![chat("m1", 1500), chat("m2", 1500), chat("m3", 1500)];
		let result = fit_history(messages, "7", max_frame);

		let ids = result.messages.iter().map(|m| m.id.as_str()).collect::<Vec<_>>();
		assert_eq!(ids, ["m2", "m3"]);
		let frame = encode_frame(&envelope("7", Msg::HistoryResult(result)), max_frame).expect("fits");
		assert!(frame.len() <= max_frame + 4);
	}

	#[test]
	fn history_that_fits_is_untouched() {
		let messages = vec![chat("m1", 10), chat("m2", 10)];
		assert_eq!(fit_history(messages.clone(), "1", 4096).messages, messages);
	}

	#[test]
	fn oversized_reply_becomes_error_with_same_request_id() {
		let reply = envelope(
			"42",
			Msg::SendResult(pb::SendResult {
				success: true,
				message: Some(chat("m1", 8192)),
				error_code: String::new(),
				error: String::new(),
			}),
		);
		let frame = encode_reply(reply, 4096).expect("fallback encodes");

		let mut buf = FrameBuffer::new(4096);
		buf.extend(&frame);
		let env = buf.next_frame::<pb::Envelope>().expect("decode").expect("frame");
		assert_eq!(env.request_id, "42");
		match env.msg {
			Some(Msg::Error(e)) => {
				assert_eq!(e.code, codes::REPLY_TOO_LARGE);
				assert_eq!(e.request_id, "42");
			}
			other => panic!("expected Error, got {other:?}"),
		}
	}

	#[test]
	fn missing_target_is_invalid() {
		let err = target_scope(None).expect_err("missing");
		assert_eq!(err.code(), codes::INVALID_TARGET);
	}
}
