#![forbid(unsafe_code)]

pub mod convert;
pub mod framing;
pub mod pb;

pub use convert::ConvertError;
pub use framing::{DEFAULT_MAX_FRAME_SIZE, FrameBuffer, FramingError, decode_frame, encode_frame};

/// ALPN identifier negotiated on every relay QUIC connection.
pub const ALPN: &[u8] = b"relay-v1";

/// Current protocol version written into `pb::Envelope.version`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Stable error codes carried in `pb::Error.code` and `pb::SendResult.error_code`.
pub mod codes {
	pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
	pub const STORAGE_UNAVAILABLE: &str = "STORAGE_UNAVAILABLE";
	pub const INVALID_TARGET: &str = "INVALID_TARGET";
	pub const NOT_A_MEMBER: &str = "NOT_A_MEMBER";
	pub const NOT_FOUND: &str = "NOT_FOUND";
	pub const RATE_LIMITED: &str = "RATE_LIMITED";
	pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
	pub const PROTOCOL: &str = "PROTOCOL";
	pub const REPLY_TOO_LARGE: &str = "REPLY_TOO_LARGE";
}

/// Wrap a message variant into a versioned envelope.
pub fn envelope(request_id: impl Into<String>, msg: pb::envelope::Msg) -> pb::Envelope {
	pb::Envelope {
		version: PROTOCOL_VERSION,
		request_id: request_id.into(),
		msg: Some(msg),
	}
}
