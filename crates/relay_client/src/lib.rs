#![forbid(unsafe_code)]

//! QUIC client for the relay: a request/response control half and a push events half.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use quinn::{Endpoint, TransportConfig, VarInt};
use relay_domain::{Message, RawInbound, Room, UserId};
use relay_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FrameBuffer, FramingError, encode_frame};
use relay_protocol::pb::envelope::Msg;
use relay_protocol::{ConvertError, envelope, pb};
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, info, warn};

pub const DEFAULT_SERVER_PORT: u16 = 18203;

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server host (DNS name or IP literal); also used as TLS server name.
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	pub client_name: String,

	/// Identity claimed in `Hello`. A signed auth token overrides it server-side.
	pub identity: Option<String>,

	pub auth_token: Option<String>,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,
}

impl ClientConfig {
	/// Parse `quic://host:port` (scheme optional) into `(host, port)`.
	pub fn parse_quic_endpoint(endpoint: &str) -> Result<(String, u16), ClientError> {
		let invalid = |why: &str| ClientError::Protocol(format!("invalid endpoint {endpoint:?} (expected quic://host:port): {why}"));

		let rest = endpoint.trim();
		let rest = rest.strip_prefix("quic://").unwrap_or(rest);
		let (host, port) = rest.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
		let host = host.trim_start_matches('[').trim_end_matches(']');
		if host.is_empty() {
			return Err(invalid("missing host"));
		}
		let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
		Ok((host.to_string(), port))
	}

	/// Convenience: create a config from `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, ClientError> {
		let (host, port) = Self::parse_quic_endpoint(endpoint)?;
		Ok(Self {
			server_host: host,
			server_port: port,
			server_addr: None,
			..Self::default()
		})
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: DEFAULT_SERVER_PORT,
			server_addr: Some(SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_SERVER_PORT))),
			client_name: format!("relay-client/{}", env!("CARGO_PKG_VERSION")),
			identity: None,
			auth_token: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	#[error("failed to connect: {0}")]
	Connect(String),

	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Unexpected message ordering or types.
	#[error("protocol error: {0}")]
	Protocol(String),

	/// The server answered with an error code.
	#[error("server error {code}: {message}")]
	Server { code: String, message: String },

	#[error("io error: {0}")]
	Io(String),

	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientError {
	fn from(e: anyhow::Error) -> Self {
		ClientError::Other(format!("{e:#}"))
	}
}

impl From<ConvertError> for ClientError {
	fn from(e: ConvertError) -> Self {
		ClientError::Protocol(e.to_string())
	}
}

impl ClientError {
	/// Wire error code when the server rejected the request.
	pub fn server_code(&self) -> Option<&str> {
		match self {
			ClientError::Server { code, .. } => Some(code),
			_ => None,
		}
	}
}

/// A decoded push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
	Chat { room_key: String, message: Message },
	PeerJoined { room_key: String, identity: String },
	PeerLeft { room_key: String, identity: String },
}

impl TryFrom<pb::EventEnvelope> for RelayEvent {
	type Error = ClientError;

	fn try_from(ev: pb::EventEnvelope) -> Result<Self, Self::Error> {
		use pb::event_envelope::Event;

		let room_key = ev.room_key;
		match ev.event {
			Some(Event::ChatMessage(m)) => Ok(RelayEvent::Chat {
				room_key,
				message: Message::try_from(m)?,
			}),
			Some(Event::PeerJoined(p)) => Ok(RelayEvent::PeerJoined {
				room_key,
				identity: p.identity,
			}),
			Some(Event::PeerLeft(p)) => Ok(RelayEvent::PeerLeft {
				room_key,
				identity: p.identity,
			}),
			None => Err(ClientError::Protocol("empty event envelope".to_string())),
		}
	}
}

/// Control half of a session: handshake, joins, sends and history.
pub struct SessionControl {
	conn: quinn::Connection,
	control_send: quinn::SendStream,
	control_recv: quinn::RecvStream,
	frames: FrameBuffer,
	max_frame_bytes: usize,
	next_request_id: u64,
	events_opened: bool,
}

/// Events reader half of a session.
pub struct SessionEvents {
	events_recv: quinn::RecvStream,
	// Keep the send half alive so the peer doesn't see an immediate FIN.
	_events_send_keepalive: quinn::SendStream,
	frames: FrameBuffer,
}

impl SessionControl {
	/// Connect and perform the Hello/Welcome handshake.
	pub async fn connect(cfg: ClientConfig) -> Result<(Self, pb::Welcome), ClientError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs: Vec<SocketAddr> = hostport
					.to_socket_addrs()
					.map_err(|e| ClientError::Connect(format!("failed to resolve {hostport}: {e}")))?
					.collect();
				if addrs.is_empty() {
					return Err(ClientError::Connect(format!("DNS resolution returned no addresses for {hostport}")));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientError::Connect(last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")))
		})?;

		info!(remote = %conn.remote_address(), "connected");

		let (mut control_send, control_recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientError::Io(format!("timeout opening control stream after {connect_timeout:?}")))?
			.map_err(|e| ClientError::Io(format!("open_bi(control) failed: {e}")))?;

		let hello = pb::Hello {
			client_name: cfg.client_name,
			identity: cfg.identity.unwrap_or_default(),
			auth_token: cfg.auth_token.unwrap_or_default(),
		};
		write_envelope(&mut control_send, &envelope("", Msg::Hello(hello)), cfg.max_frame_bytes)
			.await
			.map_err(|e| ClientError::Io(format!("send Hello failed: {e}")))?;

		let mut control = Self {
			conn,
			control_send,
			control_recv,
			frames: FrameBuffer::new(cfg.max_frame_bytes),
			max_frame_bytes: cfg.max_frame_bytes,
			next_request_id: 1,
			events_opened: false,
		};

		let welcome_env = tokio::time::timeout(connect_timeout, control.read_envelope())
			.await
			.map_err(|_| ClientError::Protocol(format!("timeout waiting for Welcome after {connect_timeout:?}")))??;

		let welcome = match welcome_env.msg {
			Some(Msg::Welcome(w)) => w,
			Some(Msg::Error(e)) => {
				return Err(ClientError::Server {
					code: e.code,
					message: e.message,
				});
			}
			other => return Err(ClientError::Protocol(format!("expected Welcome, got {other:?}"))),
		};

		debug!(
			server_name = %welcome.server_name,
			session_id = welcome.session_id,
			identity = %welcome.identity,
			max_frame_bytes = welcome.max_frame_bytes,
			"received Welcome"
		);

		if welcome.max_frame_bytes > 0 {
			control.max_frame_bytes = (welcome.max_frame_bytes as usize).min(control.max_frame_bytes);
		}

		Ok((control, welcome))
	}

	/// Send one request and wait for the reply carrying the same request id.
	async fn request(&mut self, msg: Msg) -> Result<Msg, ClientError> {
		let request_id = self.next_request_id.to_string();
		self.next_request_id += 1;

		write_envelope(&mut self.control_send, &envelope(request_id.clone(), msg), self.max_frame_bytes).await?;

		loop {
			let resp = self.read_envelope().await?;
			if resp.request_id != request_id {
				warn!(expected = %request_id, got = %resp.request_id, "skipping reply for another request");
				continue;
			}
			return match resp.msg {
				Some(Msg::Error(e)) => Err(ClientError::Server {
					code: e.code,
					message: e.message,
				}),
				Some(msg) => Ok(msg),
				None => Err(ClientError::Protocol("empty reply envelope".to_string())),
			};
		}
	}

	async fn read_envelope(&mut self) -> Result<pb::Envelope, ClientError> {
		let mut tmp = [0u8; 8192];

		loop {
			if let Some(env) = self.frames.next_frame::<pb::Envelope>()? {
				return Ok(env);
			}

			let n = match self.control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => {
					return Err(ClientError::Protocol("stream closed before receiving full message".to_string()));
				}
				Err(e) => return Err(ClientError::Io(e.to_string())),
			};

			self.frames.extend(&tmp[..n]);
		}
	}

	async fn join(&mut self, kind: pb::target::Kind) -> Result<String, ClientError> {
		let target = Some(pb::Target { kind: Some(kind) });
		match self.request(Msg::Join(pb::Join { target })).await? {
			Msg::Joined(j) => {
				debug!(room_key = %j.room_key, "join acknowledged");
				Ok(j.room_key)
			}
			other => Err(unexpected("Joined", &other)),
		}
	}

	async fn leave(&mut self, kind: pb::target::Kind) -> Result<String, ClientError> {
		let target = Some(pb::Target { kind: Some(kind) });
		match self.request(Msg::Leave(pb::Leave { target })).await? {
			Msg::Left(l) => Ok(l.room_key),
			other => Err(unexpected("Left", &other)),
		}
	}

	/// Subscribe to the 1:1 room with `peer`. Returns the room key.
	pub async fn join_peer(&mut self, peer: &str) -> Result<String, ClientError> {
		self.join(pb::target::Kind::Peer(peer.to_string())).await
	}

	pub async fn join_room(&mut self, room_id: &str) -> Result<String, ClientError> {
		self.join(pb::target::Kind::RoomId(room_id.to_string())).await
	}

	pub async fn leave_peer(&mut self, peer: &str) -> Result<String, ClientError> {
		self.leave(pb::target::Kind::Peer(peer.to_string())).await
	}

	pub async fn leave_room(&mut self, room_id: &str) -> Result<String, ClientError> {
		self.leave(pb::target::Kind::RoomId(room_id.to_string())).await
	}

	/// Send a message in either inbound shape and return its persisted form.
	pub async fn send(&mut self, raw: RawInbound) -> Result<Message, ClientError> {
		let req = pb::SendMessage {
			message: Some(raw.into()),
		};
		match self.request(Msg::Send(req)).await? {
			Msg::SendResult(r) if r.success => {
				let m = r
					.message
					.ok_or_else(|| ClientError::Protocol("successful SendResult without message".to_string()))?;
				Ok(Message::try_from(m)?)
			}
			Msg::SendResult(r) => Err(ClientError::Server {
				code: r.error_code,
				message: r.error,
			}),
			other => Err(unexpected("SendResult", &other)),
		}
	}

	/// Direct message; the sender is the session identity.
	pub async fn send_direct(&mut self, peer: &str, text: &str) -> Result<Message, ClientError> {
		self.send(RawInbound {
			receiver: Some(peer.to_string()),
			message: Some(text.to_string()),
			..RawInbound::default()
		})
		.await
	}

	pub async fn send_room(&mut self, room_id: &str, text: &str) -> Result<Message, ClientError> {
		self.send(RawInbound {
			room: Some(room_id.to_string()),
			message: Some(text.to_string()),
			..RawInbound::default()
		})
		.await
	}

	async fn history(&mut self, kind: pb::target::Kind, limit: u32) -> Result<Vec<Message>, ClientError> {
		let req = pb::History {
			target: Some(pb::Target { kind: Some(kind) }),
			limit,
		};
		match self.request(Msg::History(req)).await? {
			Msg::HistoryResult(h) => Ok(h
				.messages
				.into_iter()
				.map(Message::try_from)
				.collect::<Result<Vec<_>, _>>()?),
			other => Err(unexpected("HistoryResult", &other)),
		}
	}

	/// Most recent messages with `peer`, oldest first. `limit = 0` selects the server default.
	pub async fn history_direct(&mut self, peer: &str, limit: u32) -> Result<Vec<Message>, ClientError> {
		self.history(pb::target::Kind::Peer(peer.to_string()), limit).await
	}

	pub async fn history_room(&mut self, room_id: &str, limit: u32) -> Result<Vec<Message>, ClientError> {
		self.history(pb::target::Kind::RoomId(room_id.to_string()), limit).await
	}

	/// Create a named room owned by the session identity.
	pub async fn create_room(&mut self, name: &str, members: &[UserId]) -> Result<Room, ClientError> {
		let req = pb::CreateRoom {
			name: name.to_string(),
			members: members.iter().map(ToString::to_string).collect(),
		};
		match self.request(Msg::CreateRoom(req)).await? {
			Msg::RoomCreated(pb::RoomCreated { room: Some(room) }) => Ok(Room::try_from(room)?),
			other => Err(unexpected("RoomCreated", &other)),
		}
	}

	/// Send a keepalive ping and await the pong response.
	pub async fn ping(&mut self, client_time_unix_ms: i64) -> Result<pb::Pong, ClientError> {
		match self.request(Msg::Ping(pb::Ping { client_time_unix_ms })).await? {
			Msg::Pong(p) => Ok(p),
			other => Err(unexpected("Pong", &other)),
		}
	}

	/// Open the events stream. Push events queue server-side until this is called.
	pub async fn open_events(&mut self) -> Result<SessionEvents, ClientError> {
		if self.events_opened {
			return Err(ClientError::Protocol(
				"events stream already opened; reuse the existing SessionEvents".to_string(),
			));
		}

		let (mut send, recv) = self
			.conn
			.open_bi()
			.await
			.map_err(|e| ClientError::Io(format!("open_bi(events) failed: {e}")))?;

		// Force a STREAM frame so the server observes the stream promptly.
		send.write_all(&[0u8])
			.await
			.map_err(|e| ClientError::Io(format!("failed to write events stream activation byte: {e}")))?;
		send.flush()
			.await
			.map_err(|e| ClientError::Io(format!("failed to flush events stream activation byte: {e}")))?;

		self.events_opened = true;
		debug!("events stream opened");

		Ok(SessionEvents {
			events_recv: recv,
			_events_send_keepalive: send,
			frames: FrameBuffer::new(self.max_frame_bytes),
		})
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}
}

impl SessionEvents {
	/// Next push event, or `None` once the server closes the stream.
	pub async fn next_event(&mut self) -> Result<Option<pb::EventEnvelope>, ClientError> {
		let mut tmp = [0u8; 8192];

		loop {
			while let Some(env) = self.frames.next_frame::<pb::Envelope>()? {
				match env.msg {
					Some(Msg::Event(ev)) => {
						debug!(room_key = %ev.room_key, event_kind = event_kind(&ev), "events stream decoded");
						return Ok(Some(ev));
					}
					Some(other) => warn!("unexpected message on events stream: {:?}", other),
					None => {}
				}
			}

			let n = match self.events_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => {
					info!("events stream closed");
					return Ok(None);
				}
				Err(e) => return Err(ClientError::Io(e.to_string())),
			};

			self.frames.extend(&tmp[..n]);
		}
	}

	/// Run the events loop until EOF or error.
	pub async fn run_events_loop<F>(&mut self, mut on_event: F) -> Result<(), ClientError>
	where
		F: FnMut(pb::EventEnvelope),
	{
		while let Some(ev) = self.next_event().await? {
			on_event(ev);
		}
		Ok(())
	}
}

fn unexpected(expected: &str, got: &Msg) -> ClientError {
	ClientError::Protocol(format!("expected {expected}, got {got:?}"))
}

fn event_kind(ev: &pb::EventEnvelope) -> &'static str {
	match ev.event.as_ref() {
		Some(pb::event_envelope::Event::ChatMessage(_)) => "chat_message",
		Some(pb::event_envelope::Event::PeerJoined(_)) => "peer_joined",
		Some(pb::event_envelope::Event::PeerLeft(_)) => "peer_left",
		None => "empty",
	}
}

async fn write_envelope(send: &mut quinn::SendStream, env: &pb::Envelope, max_frame_bytes: usize) -> Result<(), ClientError> {
	let frame = encode_frame(env, max_frame_bytes)?;
	send.write_all(&frame).await.map_err(|e| ClientError::Io(e.to_string()))?;
	send.flush().await.map_err(|e| ClientError::Io(e.to_string()))?;
	Ok(())
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<quinn::ClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![relay_protocol::ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;

	let mut cfg = quinn::ClientConfig::new(Arc::new(quic_tls));

	// Control + events.
	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(8));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_targets_local_dev_server() {
		let cfg = ClientConfig::default();
		assert_eq!(cfg.server_host, "localhost");
		assert_eq!(cfg.server_addr.map(|a| a.port()), Some(DEFAULT_SERVER_PORT));
		assert!(cfg.max_frame_bytes > 0);
	}

	#[test]
	fn endpoint_parsing() {
		assert_eq!(
			ClientConfig::parse_quic_endpoint("quic://relay.example:443").expect("parse"),
			("relay.example".to_string(), 443)
		);
		assert_eq!(
			ClientConfig::parse_quic_endpoint("[::1]:18203").expect("parse"),
			("::1".to_string(), 18203)
		);
		assert!(ClientConfig::parse_quic_endpoint("quic://nohost").is_err());
		assert!(ClientConfig::parse_quic_endpoint("quic://:80").is_err());
		assert!(ClientConfig::parse_quic_endpoint("host:99999").is_err());
	}

	#[test]
	fn presence_event_decodes() {
		let ev = pb::EventEnvelope {
			room_key: "room:R1".to_string(),
			server_time_unix_ms: 1,
			event: Some(pb::event_envelope::Event::PeerLeft(pb::PeerPresence {
				identity: "bob".to_string(),
			})),
		};
		assert_eq!(
			RelayEvent::try_from(ev).expect("decode"),
			RelayEvent::PeerLeft {
				room_key: "room:R1".to_string(),
				identity: "bob".to_string(),
			}
		);
	}

	#[test]
	fn server_errors_expose_their_code() {
		let e = ClientError::Server {
			code: "RATE_LIMITED".to_string(),
			message: "slow down".to_string(),
		};
		assert_eq!(e.server_code(), Some("RATE_LIMITED"));
		assert_eq!(ClientError::Io("x".to_string()).server_code(), None);
	}
}
