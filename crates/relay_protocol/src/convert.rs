#![forbid(unsafe_code)]

//! Conversions between wire messages and domain types.

use relay_domain::{Message, MessageId, MessageScope, ParseIdError, RawInbound, Room, RoomId, UserId};
use thiserror::Error;

use crate::pb;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvertError {
	#[error("missing field: {0}")]
	MissingField(&'static str),
	#[error("invalid {field}: {source}")]
	InvalidId {
		field: &'static str,
		#[source]
		source: ParseIdError,
	},
}

fn parse_id<T, F>(field: &'static str, value: &str, make: F) -> Result<T, ConvertError>
where
	F: FnOnce(&str) -> Result<T, ParseIdError>,
{
	make(value).map_err(|source| ConvertError::InvalidId { field, source })
}

impl From<RawInbound> for pb::InboundMessage {
	fn from(raw: RawInbound) -> Self {
		Self {
			from: raw.from,
			to: raw.to,
			text: raw.text,
			sender: raw.sender,
			receiver: raw.receiver,
			room: raw.room,
			message: raw.message,
			image: raw.image,
			is_group: raw.is_group,
		}
	}
}

impl From<pb::InboundMessage> for RawInbound {
	fn from(m: pb::InboundMessage) -> Self {
		Self {
			from: m.from,
			to: m.to,
			text: m.text,
			sender: m.sender,
			receiver: m.receiver,
			room: m.room,
			message: m.message,
			image: m.image,
			is_group: m.is_group,
		}
	}
}

impl From<&Message> for pb::ChatMessage {
	fn from(m: &Message) -> Self {
		let scope = match &m.scope {
			MessageScope::Direct { peer } => pb::chat_message::Scope::PeerId(peer.to_string()),
			MessageScope::Room { room_id } => pb::chat_message::Scope::RoomId(room_id.to_string()),
		};
		Self {
			id: m.id.to_string(),
			sender_id: m.sender.to_string(),
			scope: Some(scope),
			body: m.body.clone(),
			attachment_url: m.attachment_url.clone().unwrap_or_default(),
			created_at_unix_ms: m.created_at_ms,
			edited: m.edited,
			deleted: m.deleted,
		}
	}
}

impl TryFrom<pb::ChatMessage> for Message {
	type Error = ConvertError;

	fn try_from(m: pb::ChatMessage) -> Result<Self, Self::Error> {
		let scope = match m.scope.ok_or(ConvertError::MissingField("scope"))? {
			pb::chat_message::Scope::PeerId(peer) => MessageScope::Direct {
				peer: parse_id("peer_id", &peer, |s| UserId::new(s))?,
			},
			pb::chat_message::Scope::RoomId(room) => MessageScope::Room {
				room_id: parse_id("room_id", &room, |s| RoomId::new(s))?,
			},
		};
		Ok(Message {
			id: parse_id("id", &m.id, |s: &str| s.parse::<MessageId>())?,
			sender: parse_id("sender_id", &m.sender_id, |s| UserId::new(s))?,
			scope,
			body: m.body,
			attachment_url: Some(m.attachment_url).filter(|u| !u.is_empty()),
			created_at_ms: m.created_at_unix_ms,
			edited: m.edited,
			deleted: m.deleted,
		})
	}
}

impl From<&MessageScope> for pb::Target {
	fn from(scope: &MessageScope) -> Self {
		let kind = match scope {
			MessageScope::Direct { peer } => pb::target::Kind::Peer(peer.to_string()),
			MessageScope::Room { room_id } => pb::target::Kind::RoomId(room_id.to_string()),
		};
		Self { kind: Some(kind) }
	}
}

impl TryFrom<pb::Target> for MessageScope {
	type Error = ConvertError;

	fn try_from(t: pb::Target) -> Result<Self, Self::Error> {
		match t.kind.ok_or(ConvertError::MissingField("target"))? {
			pb::target::Kind::Peer(peer) => Ok(MessageScope::Direct {
				peer: parse_id("peer", &peer, |s| UserId::new(s))?,
			}),
			pb::target::Kind::RoomId(room) => Ok(MessageScope::Room {
				room_id: parse_id("room_id", &room, |s| RoomId::new(s))?,
			}),
		}
	}
}

impl From<&Room> for pb::RoomInfo {
	fn from(r: &Room) -> Self {
		Self {
			room_id: r.id.to_string(),
			name: r.name.clone(),
			creator: r.creator.to_string(),
			members: r.members.iter().map(ToString::to_string).collect(),
			created_at_unix_ms: r.created_at_ms,
		}
	}
}

impl TryFrom<pb::RoomInfo> for Room {
	type Error = ConvertError;

	fn try_from(r: pb::RoomInfo) -> Result<Self, Self::Error> {
		let members = r
			.members
			.iter()
			.map(|m| parse_id("members", m, |s| UserId::new(s)))
			.collect::<Result<_, _>>()?;
		Ok(Room {
			id: parse_id("room_id", &r.room_id, |s| RoomId::new(s))?,
			name: r.name,
			creator: parse_id("creator", &r.creator, |s| UserId::new(s))?,
			members,
			created_at_ms: r.created_at_unix_ms,
		})
	}
}

#[cfg(test)]
mod tests {
	use relay_domain::{NewMessage, normalize};

	use super::*;

	fn persisted(raw: RawInbound) -> Message {
		let new: NewMessage = normalize(&raw).expect("normalize");
		new.into_persisted(MessageId::new_v4(), 1_700_000_000_000)
	}

	#[test]
	fn chat_message_survives_the_wire() {
		let mut raw = RawInbound::to_room("alice", "R1", "hello");
		raw.image = Some("https://img.example/a.png".to_string());
		let msg = persisted(raw);

		let wire = pb::ChatMessage::from(&msg);
		assert_eq!(wire.scope, Some(pb::chat_message::Scope::RoomId("R1".to_string())));

		let back = Message::try_from(wire).expect("convert");
		assert_eq!(back, msg);
	}

	#[test]
	fn empty_attachment_reads_as_none() {
		let msg = persisted(RawInbound::direct("alice", "bob", "hi"));
		let wire = pb::ChatMessage::from(&msg);
		assert_eq!(wire.attachment_url, "");
		assert_eq!(Message::try_from(wire).expect("convert").attachment_url, None);
	}

	#[test]
	fn chat_message_without_scope_is_rejected() {
		let mut wire = pb::ChatMessage::from(&persisted(RawInbound::direct("alice", "bob", "hi")));
		wire.scope = None;
		assert_eq!(Message::try_from(wire), Err(ConvertError::MissingField("scope")));
	}

	#[test]
	fn target_requires_non_blank_id() {
		let t = pb::Target {
			kind: Some(pb::target::Kind::Peer("  ".to_string())),
		};
		match MessageScope::try_from(t) {
			Err(ConvertError::InvalidId { field: "peer", .. }) => {}
			other => panic!("expected InvalidId, got: {other:?}"),
		}
		assert_eq!(
			MessageScope::try_from(pb::Target { kind: None }),
			Err(ConvertError::MissingField("target"))
		);
	}

	#[test]
	fn inbound_shape_fields_are_preserved() {
		let raw = RawInbound {
			from: Some("alice".to_string()),
			to: Some("team".to_string()),
			text: Some("hi".to_string()),
			is_group: Some(true),
			..RawInbound::default()
		};
		let wire: pb::InboundMessage = raw.clone().into();
		assert_eq!(wire.is_group, Some(true));
		assert_eq!(RawInbound::from(wire), raw);
	}
}
