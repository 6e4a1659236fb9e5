#![forbid(unsafe_code)]

//! Reconciles the two inbound message shapes into one [`NewMessage`].
//!
//! Shape A (legacy direct): `{from, to, text}` with optional `image` and `isGroup`.
//! Shape B (generalized): `{sender, receiver | room, message}` with optional `image`.
//!
//! Blank values count as absent in every fallback chain.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{MessageScope, NewMessage, RoomId, UserId};

/// An inbound message as submitted by a client, in either shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInbound {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub from: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub to: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sender: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub receiver: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub room: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,

	#[serde(default, alias = "attachmentUrl", skip_serializing_if = "Option::is_none")]
	pub image: Option<String>,
	#[serde(default, rename = "isGroup", alias = "is_group", skip_serializing_if = "Option::is_none")]
	pub is_group: Option<bool>,
}

impl RawInbound {
	/// Shape B direct message.
	pub fn direct(sender: impl Into<String>, receiver: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			sender: Some(sender.into()),
			receiver: Some(receiver.into()),
			message: Some(message.into()),
			..Self::default()
		}
	}

	/// Shape B room message.
	pub fn to_room(sender: impl Into<String>, room: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			sender: Some(sender.into()),
			room: Some(room.into()),
			message: Some(message.into()),
			..Self::default()
		}
	}

	/// Resolved sender without validation, `sender ?? from`.
	pub fn claimed_sender(&self) -> Option<&str> {
		first_present(&[&self.sender, &self.from])
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
	#[error("message has no sender")]
	MissingSender,
	#[error("message body is empty")]
	EmptyBody,
	#[error("message has neither a receiver nor a room")]
	MissingTarget,
}

/// Normalize a raw inbound message.
pub fn normalize(raw: &RawInbound) -> Result<NewMessage, NormalizeError> {
	let sender = raw
		.claimed_sender()
		.and_then(|s| UserId::new(s).ok())
		.ok_or(NormalizeError::MissingSender)?;

	let body = first_present(&[&raw.message, &raw.text])
		.map(|s| s.trim().to_string())
		.ok_or(NormalizeError::EmptyBody)?;

	let receiver = first_present(&[&raw.receiver, &raw.to]);
	let room = match first_present(&[&raw.room]) {
		Some(room) => Some(room),
		// Legacy group messages carried the room id in `to`/`receiver`.
		None if raw.is_group.unwrap_or(false) => receiver,
		None => None,
	};

	let scope = if let Some(room) = room {
		let room_id = RoomId::new(room).map_err(|_| NormalizeError::MissingTarget)?;
		MessageScope::Room { room_id }
	} else {
		let peer = receiver
			.and_then(|r| UserId::new(r).ok())
			.ok_or(NormalizeError::MissingTarget)?;
		MessageScope::Direct { peer }
	};

	let attachment_url = first_present(&[&raw.image]).map(|s| s.trim().to_string());

	Ok(NewMessage {
		sender,
		scope,
		body,
		attachment_url,
	})
}

fn first_present<'a>(candidates: &[&'a Option<String>]) -> Option<&'a str> {
	candidates
		.iter()
		.filter_map(|c| c.as_deref())
		.find(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(json: &str) -> RawInbound {
		serde_json::from_str(json).expect("valid json")
	}

	#[test]
	fn legacy_and_generalized_shapes_normalize_identically() {
		let a = normalize(&parse(r#"{"from":"alice","to":"bob","text":"hi"}"#)).expect("shape A");
		let b = normalize(&parse(r#"{"sender":"alice","receiver":"bob","message":"hi"}"#)).expect("shape B");
		assert_eq!(a, b);
		assert_eq!(
			a.scope,
			MessageScope::Direct {
				peer: UserId::new("bob").expect("valid")
			}
		);
	}

	#[test]
	fn room_wins_over_receiver() {
		let msg = normalize(&parse(r#"{"sender":"alice","receiver":"bob","room":"R1","message":"hey"}"#))
			.expect("normalize");
		assert_eq!(
			msg.scope,
			MessageScope::Room {
				room_id: RoomId::new("R1").expect("valid")
			}
		);
	}

	#[test]
	fn legacy_group_flag_reads_room_from_to() {
		let msg = normalize(&parse(r#"{"from":"alice","to":"team","text":"standup","isGroup":true}"#))
			.expect("normalize");
		assert_eq!(
			msg.scope,
			MessageScope::Room {
				room_id: RoomId::new("team").expect("valid")
			}
		);
	}

	#[test]
	fn body_and_ids_are_trimmed() {
		let msg = normalize(&parse(r#"{"from":" alice ","to":"bob ","text":"  hello  ","image":" "}"#))
			.expect("normalize");
		assert_eq!(msg.sender.as_str(), "alice");
		assert_eq!(msg.body, "hello");
		assert_eq!(msg.attachment_url, None);
	}

	#[test]
	fn blank_primary_field_falls_back() {
		let msg = normalize(&parse(r#"{"sender":"  ","from":"alice","message":"","text":"hi","to":"bob"}"#))
			.expect("normalize");
		assert_eq!(msg.sender.as_str(), "alice");
		assert_eq!(msg.body, "hi");
	}

	#[test]
	fn attachment_is_kept() {
		let msg = normalize(&parse(
			r#"{"from":"alice","to":"bob","text":"look","image":"https://img.example/cat.png"}"#,
		))
		.expect("normalize");
		assert_eq!(msg.attachment_url.as_deref(), Some("https://img.example/cat.png"));
	}

	#[test]
	fn rejects_incomplete_messages() {
		assert_eq!(
			normalize(&parse(r#"{"to":"bob","text":"hi"}"#)),
			Err(NormalizeError::MissingSender)
		);
		assert_eq!(
			normalize(&parse(r#"{"from":"alice","to":"bob","text":"   "}"#)),
			Err(NormalizeError::EmptyBody)
		);
		assert_eq!(
			normalize(&parse(r#"{"from":"alice","text":"hi"}"#)),
			Err(NormalizeError::MissingTarget)
		);
		assert_eq!(
			normalize(&parse(r#"{"from":"alice","text":"hi","isGroup":true}"#)),
			Err(NormalizeError::MissingTarget)
		);
	}

	#[test]
	fn constructors_build_shape_b() {
		let msg = normalize(&RawInbound::to_room("alice", "R1", "yo")).expect("normalize");
		assert_eq!(msg.routing_key().to_string(), "room:R1");
		let msg = normalize(&RawInbound::direct("bob", "alice", "yo")).expect("normalize");
		assert_eq!(msg.routing_key().to_string(), "dm:alice-bob");
	}
}
