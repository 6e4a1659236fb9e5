#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};

use relay_domain::{Message, MessageId, MessageScope, NewMessage, Room, RoomId, UserId};
use tokio::sync::Mutex;

use super::{MessageStore, StoreError};
use crate::util::time::MonotonicClock;

/// Process-local store; contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryStore {
	inner: Mutex<Inner>,
	clock: MonotonicClock,
}

#[derive(Debug, Default)]
struct Inner {
	messages: Vec<Message>,
	rooms: HashMap<RoomId, Room>,
}

impl InMemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

/// Last `limit` matches, oldest first. `messages` is already in insertion order.
fn recent<'a>(messages: impl DoubleEndedIterator<Item = &'a Message>, limit: usize) -> Vec<Message> {
	let mut out: Vec<Message> = messages.rev().take(limit).cloned().collect();
	out.reverse();
	out
}

#[async_trait::async_trait]
impl MessageStore for InMemoryStore {
	async fn append(&self, msg: NewMessage) -> Result<Message, StoreError> {
		let mut inner = self.inner.lock().await;
		let stored = msg.into_persisted(MessageId::new_v4(), self.clock.next_ms());
		inner.messages.push(stored.clone());
		Ok(stored)
	}

	async fn query_direct(&self, a: &UserId, b: &UserId, limit: usize) -> Result<Vec<Message>, StoreError> {
		let inner = self.inner.lock().await;
		let between = inner.messages.iter().filter(|m| match &m.scope {
			MessageScope::Direct { peer } => (&m.sender == a && peer == b) || (&m.sender == b && peer == a),
			MessageScope::Room { .. } => false,
		});
		Ok(recent(between, limit))
	}

	async fn query_room(&self, room: &RoomId, limit: usize) -> Result<Vec<Message>, StoreError> {
		let inner = self.inner.lock().await;
		let in_room = inner
			.messages
			.iter()
			.filter(|m| matches!(&m.scope, MessageScope::Room { room_id } if room_id == room));
		Ok(recent(in_room, limit))
	}

	async fn create_room(&self, name: &str, creator: &UserId, members: &[UserId]) -> Result<Room, StoreError> {
		let mut inner = self.inner.lock().await;
		let mut set: BTreeSet<UserId> = members.iter().cloned().collect();
		set.insert(creator.clone());

		let room = Room {
			id: RoomId::generate(),
			name: name.to_string(),
			creator: creator.clone(),
			members: set,
			created_at_ms: self.clock.next_ms(),
		};
		inner.rooms.insert(room.id.clone(), room.clone());
		Ok(room)
	}

	async fn room(&self, id: &RoomId) -> Result<Option<Room>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner.rooms.get(id).cloned())
	}
}
