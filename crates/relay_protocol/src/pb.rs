#![forbid(unsafe_code)]

//! Wire messages (`relay.v1`), declared directly with `prost` derives.
//!
//! Field tags are part of the protocol; never renumber an existing field.

/// Outer frame for every message on the control and events streams.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,
	/// Echoed back on the response to a request.
	#[prost(string, tag = "2")]
	pub request_id: String,
	#[prost(
		oneof = "envelope::Msg",
		tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25"
	)]
	pub msg: Option<envelope::Msg>,
}

pub mod envelope {
	#[allow(clippy::large_enum_variant)]
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		#[prost(message, tag = "10")]
		Hello(super::Hello),
		#[prost(message, tag = "11")]
		Welcome(super::Welcome),
		#[prost(message, tag = "12")]
		Join(super::Join),
		#[prost(message, tag = "13")]
		Joined(super::Joined),
		#[prost(message, tag = "14")]
		Leave(super::Leave),
		#[prost(message, tag = "15")]
		Left(super::Left),
		#[prost(message, tag = "16")]
		Send(super::SendMessage),
		#[prost(message, tag = "17")]
		SendResult(super::SendResult),
		#[prost(message, tag = "18")]
		History(super::History),
		#[prost(message, tag = "19")]
		HistoryResult(super::HistoryResult),
		#[prost(message, tag = "20")]
		CreateRoom(super::CreateRoom),
		#[prost(message, tag = "21")]
		RoomCreated(super::RoomCreated),
		#[prost(message, tag = "22")]
		Ping(super::Ping),
		#[prost(message, tag = "23")]
		Pong(super::Pong),
		#[prost(message, tag = "24")]
		Error(super::Error),
		#[prost(message, tag = "25")]
		Event(super::EventEnvelope),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
	#[prost(string, tag = "1")]
	pub client_name: String,
	/// Claimed identity; ignored when a signed token carries one.
	#[prost(string, tag = "2")]
	pub identity: String,
	#[prost(string, tag = "3")]
	pub auth_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Welcome {
	#[prost(string, tag = "1")]
	pub server_name: String,
	#[prost(uint64, tag = "2")]
	pub session_id: u64,
	/// Identity the server bound to this session.
	#[prost(string, tag = "3")]
	pub identity: String,
	#[prost(int64, tag = "4")]
	pub server_time_unix_ms: i64,
	#[prost(uint32, tag = "5")]
	pub max_frame_bytes: u32,
}

/// Conversation selector: a peer for 1:1 rooms, or a named room id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Target {
	#[prost(oneof = "target::Kind", tags = "1, 2")]
	pub kind: Option<target::Kind>,
}

pub mod target {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Kind {
		#[prost(string, tag = "1")]
		Peer(String),
		#[prost(string, tag = "2")]
		RoomId(String),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Join {
	#[prost(message, optional, tag = "1")]
	pub target: Option<Target>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Joined {
	#[prost(string, tag = "1")]
	pub room_key: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Leave {
	#[prost(message, optional, tag = "1")]
	pub target: Option<Target>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Left {
	#[prost(string, tag = "1")]
	pub room_key: String,
}

/// An inbound message in either the legacy or the generalized shape.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InboundMessage {
	#[prost(string, optional, tag = "1")]
	pub from: Option<String>,
	#[prost(string, optional, tag = "2")]
	pub to: Option<String>,
	#[prost(string, optional, tag = "3")]
	pub text: Option<String>,
	#[prost(string, optional, tag = "4")]
	pub sender: Option<String>,
	#[prost(string, optional, tag = "5")]
	pub receiver: Option<String>,
	#[prost(string, optional, tag = "6")]
	pub room: Option<String>,
	#[prost(string, optional, tag = "7")]
	pub message: Option<String>,
	#[prost(string, optional, tag = "8")]
	pub image: Option<String>,
	#[prost(bool, optional, tag = "9")]
	pub is_group: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessage {
	#[prost(message, optional, tag = "1")]
	pub message: Option<InboundMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendResult {
	#[prost(bool, tag = "1")]
	pub success: bool,
	#[prost(message, optional, tag = "2")]
	pub message: Option<ChatMessage>,
	#[prost(string, tag = "3")]
	pub error_code: String,
	#[prost(string, tag = "4")]
	pub error: String,
}

/// A persisted chat message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatMessage {
	#[prost(string, tag = "1")]
	pub id: String,
	#[prost(string, tag = "2")]
	pub sender_id: String,
	#[prost(oneof = "chat_message::Scope", tags = "3, 4")]
	pub scope: Option<chat_message::Scope>,
	#[prost(string, tag = "5")]
	pub body: String,
	#[prost(string, tag = "6")]
	pub attachment_url: String,
	#[prost(int64, tag = "7")]
	pub created_at_unix_ms: i64,
	#[prost(bool, tag = "8")]
	pub edited: bool,
	#[prost(bool, tag = "9")]
	pub deleted: bool,
}

pub mod chat_message {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Scope {
		#[prost(string, tag = "3")]
		PeerId(String),
		#[prost(string, tag = "4")]
		RoomId(String),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct History {
	#[prost(message, optional, tag = "1")]
	pub target: Option<Target>,
	/// 0 selects the server default.
	#[prost(uint32, tag = "2")]
	pub limit: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HistoryResult {
	#[prost(message, repeated, tag = "1")]
	pub messages: Vec<ChatMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateRoom {
	#[prost(string, tag = "1")]
	pub name: String,
	#[prost(string, repeated, tag = "2")]
	pub members: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomInfo {
	#[prost(string, tag = "1")]
	pub room_id: String,
	#[prost(string, tag = "2")]
	pub name: String,
	#[prost(string, tag = "3")]
	pub creator: String,
	#[prost(string, repeated, tag = "4")]
	pub members: Vec<String>,
	#[prost(int64, tag = "5")]
	pub created_at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomCreated {
	#[prost(message, optional, tag = "1")]
	pub room: Option<RoomInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
	#[prost(string, tag = "1")]
	pub code: String,
	#[prost(string, tag = "2")]
	pub message: String,
	#[prost(string, tag = "3")]
	pub request_id: String,
}

/// Push event delivered on the events stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventEnvelope {
	#[prost(string, tag = "1")]
	pub room_key: String,
	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
	#[prost(oneof = "event_envelope::Event", tags = "10, 11, 12")]
	pub event: Option<event_envelope::Event>,
}

pub mod event_envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Event {
		#[prost(message, tag = "10")]
		ChatMessage(super::ChatMessage),
		#[prost(message, tag = "11")]
		PeerJoined(super::PeerPresence),
		#[prost(message, tag = "12")]
		PeerLeft(super::PeerPresence),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeerPresence {
	#[prost(string, tag = "1")]
	pub identity: String,
}
