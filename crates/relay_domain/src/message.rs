#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{MessageId, RoomId, RoomKey, UserId};

/// Delivery scope of a message. Exactly one target, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageScope {
	/// 1:1 message addressed to `peer`.
	Direct {
		#[serde(rename = "peerId")]
		peer: UserId,
	},
	/// Group message posted to a named room.
	Room {
		#[serde(rename = "roomId")]
		room_id: RoomId,
	},
}

impl MessageScope {
	/// Routing key for a message with this scope sent by `sender`.
	pub fn routing_key(&self, sender: &UserId) -> RoomKey {
		match self {
			MessageScope::Direct { peer } => RoomKey::direct(sender, peer),
			MessageScope::Room { room_id } => RoomKey::room(room_id.clone()),
		}
	}
}

/// A normalized message that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
	pub sender: UserId,
	pub scope: MessageScope,
	/// Trimmed, never empty.
	pub body: String,
	pub attachment_url: Option<String>,
}

impl NewMessage {
	pub fn routing_key(&self) -> RoomKey {
		self.scope.routing_key(&self.sender)
	}

	/// Attach the store-assigned identity and timestamp.
	pub fn into_persisted(self, id: MessageId, created_at_ms: i64) -> Message {
		Message {
			id,
			sender: self.sender,
			scope: self.scope,
			body: self.body,
			attachment_url: self.attachment_url,
			created_at_ms,
			edited: false,
			deleted: false,
		}
	}
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
	pub id: MessageId,
	#[serde(rename = "senderId")]
	pub sender: UserId,
	pub scope: MessageScope,
	pub body: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub attachment_url: Option<String>,
	#[serde(rename = "createdAt")]
	pub created_at_ms: i64,
	#[serde(default)]
	pub edited: bool,
	#[serde(default)]
	pub deleted: bool,
}

impl Message {
	pub fn routing_key(&self) -> RoomKey {
		self.scope.routing_key(&self.sender)
	}
}

/// A named group room from the room catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
	pub id: RoomId,
	pub name: String,
	pub creator: UserId,
	pub members: BTreeSet<UserId>,
	#[serde(rename = "createdAt")]
	pub created_at_ms: i64,
}

impl Room {
	pub fn is_member(&self, id: &UserId) -> bool {
		&self.creator == id || self.members.contains(id)
	}

	pub fn key(&self) -> RoomKey {
		RoomKey::room(self.id.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(s: &str) -> UserId {
		UserId::new(s).expect("valid UserId")
	}

	#[test]
	fn direct_messages_in_either_direction_share_a_key() {
		let a_to_b = MessageScope::Direct { peer: user("bob") }.routing_key(&user("alice"));
		let b_to_a = MessageScope::Direct { peer: user("alice") }.routing_key(&user("bob"));
		assert_eq!(a_to_b, b_to_a);
	}

	#[test]
	fn room_scope_ignores_sender() {
		let room = RoomId::new("R1").expect("valid");
		let scope = MessageScope::Room { room_id: room.clone() };
		assert_eq!(scope.routing_key(&user("a")), scope.routing_key(&user("b")));
		assert_eq!(scope.routing_key(&user("a")), RoomKey::room(room));
	}

	#[test]
	fn message_json_shape() {
		let msg = NewMessage {
			sender: user("alice"),
			scope: MessageScope::Direct { peer: user("bob") },
			body: "hi".to_string(),
			attachment_url: None,
		}
		.into_persisted(MessageId::new_v4(), 42);

		let json = serde_json::to_value(&msg).expect("serialize");
		assert_eq!(json["senderId"], "alice");
		assert_eq!(json["scope"]["kind"], "direct");
		assert_eq!(json["scope"]["peerId"], "bob");
		assert_eq!(json["createdAt"], 42);
		assert_eq!(json["edited"], false);
		assert!(json.get("attachmentUrl").is_none());

		let back: Message = serde_json::from_value(json).expect("deserialize");
		assert_eq!(back, msg);
	}

	#[test]
	fn creator_is_always_a_member() {
		let room = Room {
			id: RoomId::new("r").expect("valid"),
			name: "general".to_string(),
			creator: user("alice"),
			members: BTreeSet::from([user("bob")]),
			created_at_ms: 1,
		};
		assert!(room.is_member(&user("alice")));
		assert!(room.is_member(&user("bob")));
		assert!(!room.is_member(&user("carol")));
	}
}
