#![forbid(unsafe_code)]

use core::fmt;
use core::fmt::Write as _;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod message;
pub mod normalize;

pub use message::{Message, MessageScope, NewMessage, Room};
pub use normalize::{NormalizeError, RawInbound, normalize};

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Identity of a chat participant.
///
/// Free-form; the relay never resolves it against a user directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a `UserId` from a non-blank value. Surrounding whitespace is dropped.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.len() == id.len() {
			Ok(Self(id))
		} else {
			Ok(Self(trimmed.to_string()))
		}
	}

	/// Placeholder identity for a connection that never presented one.
	pub fn anonymous(conn_id: u64) -> Self {
		Self(format!("anonymous-{conn_id}"))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Identifier of a named group room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a `RoomId` from a non-blank value. Surrounding whitespace is dropped.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(trimmed.to_string()))
	}

	/// Fresh server-assigned room id.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
	}
}

/// Unordered pair of identities sharing a 1:1 conversation.
///
/// Always stored sorted, so the pair built from `(a, b)` equals the one built from `(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirectPair {
	low: UserId,
	high: UserId,
}

impl DirectPair {
	pub fn new(a: &UserId, b: &UserId) -> Self {
		if a <= b {
			Self {
				low: a.clone(),
				high: b.clone(),
			}
		} else {
			Self {
				low: b.clone(),
				high: a.clone(),
			}
		}
	}

	pub fn low(&self) -> &UserId {
		&self.low
	}

	pub fn high(&self) -> &UserId {
		&self.high
	}

	pub fn contains(&self, id: &UserId) -> bool {
		&self.low == id || &self.high == id
	}
}

/// Routing key of a conversation: the unit of subscription and of delivery ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoomKey {
	Direct(DirectPair),
	Room(RoomId),
}

impl RoomKey {
	/// Key of the implicit 1:1 room between two identities.
	pub fn direct(a: &UserId, b: &UserId) -> Self {
		RoomKey::Direct(DirectPair::new(a, b))
	}

	pub fn room(id: RoomId) -> Self {
		RoomKey::Room(id)
	}

	pub fn is_direct(&self) -> bool {
		matches!(self, RoomKey::Direct(_))
	}
}

/// Writes `id` with `\\` and `-` escaped, so the single bare `-` in a direct key is the separator.
fn write_escaped(f: &mut fmt::Formatter<'_>, id: &str) -> fmt::Result {
	for c in id.chars() {
		if matches!(c, '-' | '\\') {
			f.write_char('\\')?;
		}
		f.write_char(c)?;
	}
	Ok(())
}

impl fmt::Display for RoomKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RoomKey::Direct(pair) => {
				f.write_str("dm:")?;
				write_escaped(f, pair.low.as_str())?;
				f.write_char('-')?;
				write_escaped(f, pair.high.as_str())
			}
			RoomKey::Room(id) => write!(f, "room:{id}"),
		}
	}
}
