#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::str::FromStr;

use relay_domain::{MessageScope, RoomKey, UserId};
use relay_protocol::codes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::server::registry::{RoomEvent, RoomRegistry, SessionRef};
use crate::server::router::{MessageRouter, RouteError, RouteOrigin};

/// Who may join a named room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JoinPolicy {
	/// Any session may join any room id.
	#[default]
	Open,
	/// The room must exist in the catalog and list the joiner as creator or member.
	Members,
}

#[derive(Debug, Error)]
#[error("unknown room join policy {0:?} (expected open or members)")]
pub struct ParseJoinPolicyError(String);

impl FromStr for JoinPolicy {
	type Err = ParseJoinPolicyError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"open" => Ok(JoinPolicy::Open),
			"members" => Ok(JoinPolicy::Members),
			_ => Err(ParseJoinPolicyError(s.to_string())),
		}
	}
}

#[derive(Debug, Error)]
pub enum JoinError {
	#[error("invalid target: {0}")]
	InvalidTarget(String),
	#[error("{identity} is not a member of room {room_id}")]
	NotAMember { identity: UserId, room_id: String },
	#[error("room {0} not found")]
	NotFound(String),
	#[error(transparent)]
	Storage(RouteError),
}

impl JoinError {
	pub fn code(&self) -> &'static str {
		match self {
			JoinError::InvalidTarget(_) => codes::INVALID_TARGET,
			JoinError::NotAMember { .. } => codes::NOT_A_MEMBER,
			JoinError::NotFound(_) => codes::NOT_FOUND,
			JoinError::Storage(e) => e.code(),
		}
	}
}

/// Map a join/history target to the room key `identity` would subscribe to.
pub async fn resolve_target(
	scope: &MessageScope,
	identity: &UserId,
	router: &MessageRouter,
	policy: JoinPolicy,
) -> Result<RoomKey, JoinError> {
	match scope {
		MessageScope::Direct { peer } => Ok(RoomKey::direct(identity, peer)),
		MessageScope::Room { room_id } => {
			if policy == JoinPolicy::Open {
				return Ok(RoomKey::room(room_id.clone()));
			}
			let room = router
				.room(room_id)
				.await
				.map_err(JoinError::Storage)?
				.ok_or_else(|| JoinError::NotFound(room_id.to_string()))?;
			if !room.is_member(identity) {
				return Err(JoinError::NotAMember {
					identity: identity.clone(),
					room_id: room_id.to_string(),
				});
			}
			Ok(room.key())
		}
	}
}

/// Per-connection state: identity, held room keys and the outbound queue.
#[derive(Debug)]
pub struct Session {
	handle: SessionRef,
	authenticated: bool,
	keys: HashSet<RoomKey>,
}

impl Session {
	pub fn new(conn_id: u64, identity: UserId, authenticated: bool, tx: mpsc::Sender<RoomEvent>) -> Self {
		Self {
			handle: SessionRef::new(conn_id, identity, tx),
			authenticated,
			keys: HashSet::new(),
		}
	}

	pub fn identity(&self) -> &UserId {
		&self.handle.identity
	}

	pub fn origin(&self) -> RouteOrigin {
		RouteOrigin {
			identity: self.handle.identity.clone(),
			authenticated: self.authenticated,
		}
	}

	pub fn keys(&self) -> impl Iterator<Item = &RoomKey> {
		self.keys.iter()
	}

	/// Subscribe to `key`. Returns `false` if already held.
	pub async fn join(&mut self, key: RoomKey, registry: &RoomRegistry) -> bool {
		let fresh = registry.subscribe(&key, &self.handle).await;
		self.keys.insert(key);
		fresh
	}

	pub async fn leave(&mut self, key: &RoomKey, registry: &RoomRegistry) -> bool {
		self.keys.remove(key);
		registry.unsubscribe(key, self.handle.conn_id).await
	}

	/// Drop every subscription, then the queue sender.
	pub async fn disconnect(self, registry: &RoomRegistry) {
		registry.remove_session(self.handle.conn_id, self.keys.iter()).await;
	}
}
