#![forbid(unsafe_code)]

//! Durable message log and named-room catalog.

mod memory;
mod sql;

pub use memory::InMemoryStore;
pub use sql::SqlStore;

use relay_domain::{Message, NewMessage, Room, RoomId, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("store unavailable: {0}")]
	Unavailable(String),
	#[error("corrupt row: {0}")]
	Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
	fn from(e: sqlx::Error) -> Self {
		StoreError::Unavailable(e.to_string())
	}
}

/// Read/write contract the router needs from a backend.
///
/// Query results are the most recent `limit` rows, returned oldest first.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	/// Assign id and timestamp, persist, and return the stored form.
	async fn append(&self, msg: NewMessage) -> Result<Message, StoreError>;

	/// Direct messages exchanged between `a` and `b`, in either direction.
	async fn query_direct(&self, a: &UserId, b: &UserId, limit: usize) -> Result<Vec<Message>, StoreError>;

	async fn query_room(&self, room: &RoomId, limit: usize) -> Result<Vec<Message>, StoreError>;

	/// Register a named room. The creator is always a member.
	async fn create_room(&self, name: &str, creator: &UserId, members: &[UserId]) -> Result<Room, StoreError>;

	async fn room(&self, id: &RoomId) -> Result<Option<Room>, StoreError>;
}
