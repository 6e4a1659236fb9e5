#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use relay_domain::{Message, NormalizeError, RawInbound, Room, RoomId, RoomKey, UserId, normalize};
use relay_protocol::codes;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::server::registry::{RoomEvent, RoomEventKind, RoomRegistry};
use crate::server::store::{MessageStore, StoreError};

pub const DEFAULT_HISTORY_LIMIT: usize = 100;
pub const MAX_HISTORY_LIMIT: usize = 1000;

/// `None` and `0` select the default; anything above the maximum is capped.
pub fn history_limit(requested: Option<u32>) -> usize {
	match requested {
		None | Some(0) => DEFAULT_HISTORY_LIMIT,
		Some(n) => (n as usize).min(MAX_HISTORY_LIMIT),
	}
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
	/// Upper bound on a single store call before it counts as an outage.
	pub store_timeout: Duration,
	pub debug_log_events: bool,
}

impl Default for RouterConfig {
	fn default() -> Self {
		Self {
			store_timeout: Duration::from_secs(5),
			debug_log_events: false,
		}
	}
}

/// Identity of the session a message arrived on.
#[derive(Debug, Clone)]
pub struct RouteOrigin {
	pub identity: UserId,
	/// The identity was presented by the client rather than assigned as a placeholder.
	pub authenticated: bool,
}

#[derive(Debug, Error)]
pub enum RouteError {
	#[error("invalid message: {0}")]
	InvalidMessage(#[from] NormalizeError),
	#[error("sender {claimed:?} does not match session identity {session}")]
	SenderMismatch { claimed: String, session: UserId },
	#[error("storage unavailable: {0}")]
	StorageUnavailable(String),
}

impl RouteError {
	pub fn code(&self) -> &'static str {
		match self {
			RouteError::InvalidMessage(_) | RouteError::SenderMismatch { .. } => codes::INVALID_MESSAGE,
			RouteError::StorageUnavailable(_) => codes::STORAGE_UNAVAILABLE,
		}
	}
}

/// One lock per room key, created on demand and dropped with its last holder.
#[derive(Debug, Default)]
struct KeyedLocks {
	locks: Mutex<HashMap<RoomKey, Weak<Mutex<()>>>>,
}

impl KeyedLocks {
	async fn lock(&self, key: &RoomKey) -> OwnedMutexGuard<()> {
		let lock = {
			let mut locks = self.locks.lock().await;
			match locks.get(key).and_then(Weak::upgrade) {
				Some(lock) => lock,
				None => {
					locks.retain(|_, w| w.strong_count() > 0);
					let lock = Arc::new(Mutex::new(()));
					locks.insert(key.clone(), Arc::downgrade(&lock));
					lock
				}
			}
		};
		lock.lock_owned().await
	}
}

/// Normalize, persist, then fan out.
///
/// Append and fan-out for one room key run under that key's send lock, so every subscriber
/// of a key observes messages in persistence order. The registry is only consulted after
/// the store call has returned.
pub struct MessageRouter {
	store: Arc<dyn MessageStore>,
	registry: RoomRegistry,
	send_locks: KeyedLocks,
	cfg: RouterConfig,
}

impl MessageRouter {
	pub fn new(store: Arc<dyn MessageStore>, registry: RoomRegistry, cfg: RouterConfig) -> Self {
		Self {
			store,
			registry,
			send_locks: KeyedLocks::default(),
			cfg,
		}
	}

	pub fn registry(&self) -> &RoomRegistry {
		&self.registry
	}

	async fn store_call<T, F>(&self, op: &'static str, fut: F) -> Result<T, RouteError>
	where
		F: Future<Output = Result<T, StoreError>>,
	{
		let err = match tokio::time::timeout(self.cfg.store_timeout, fut).await {
			Ok(Ok(v)) => return Ok(v),
			Ok(Err(e)) => e.to_string(),
			Err(_) => format!("{op} timed out after {:?}", self.cfg.store_timeout),
		};
		metrics::counter!("relay_server_storage_failures_total", "op" => op).increment(1);
		warn!(op, error = %err, "store call failed");
		Err(RouteError::StorageUnavailable(err))
	}

	/// Route one inbound message and return its persisted form.
	///
	/// A session origin fills a missing sender; an authenticated origin must match a
	/// sender the message claims for itself.
	pub async fn route(&self, mut raw: RawInbound, origin: Option<&RouteOrigin>) -> Result<Message, RouteError> {
		if let Some(origin) = origin.filter(|o| o.authenticated) {
			let claimed = raw.claimed_sender().map(|s| s.trim().to_string());
			match claimed {
				None => raw.sender = Some(origin.identity.to_string()),
				Some(claimed) if claimed != origin.identity.as_str() => {
					metrics::counter!("relay_server_route_rejected_total", "reason" => "sender_mismatch").increment(1);
					return Err(RouteError::SenderMismatch {
						claimed,
						session: origin.identity.clone(),
					});
				}
				Some(_) => {}
			}
		}

		let new = normalize(&raw).inspect_err(|e| {
			metrics::counter!("relay_server_route_rejected_total", "reason" => "invalid").increment(1);
			debug!(error = %e, "router: rejected inbound message");
		})?;
		let key = new.routing_key();

		let _send_guard = self.send_locks.lock(&key).await;

		let stored = Arc::new(self.store_call("append", self.store.append(new)).await?);

		let subscribers = self.registry.subscribers_of(&key).await;
		let mut delivered = 0usize;
		for sub in &subscribers {
			let event = RoomEvent {
				key: key.clone(),
				kind: RoomEventKind::Chat(Arc::clone(&stored)),
			};
			if self.registry.deliver(sub, event).is_ok() {
				delivered += 1;
			}
		}

		metrics::counter!("relay_server_messages_routed_total").increment(1);
		if self.cfg.debug_log_events {
			debug!(
				room_key = %key,
				message_id = %stored.id,
				subscribers = subscribers.len(),
				delivered,
				"router: fanned out message"
			);
		}

		Ok(Arc::unwrap_or_clone(stored))
	}

	pub async fn history_direct(&self, a: &UserId, b: &UserId, limit: Option<u32>) -> Result<Vec<Message>, RouteError> {
		self.store_call("query_direct", self.store.query_direct(a, b, history_limit(limit)))
			.await
	}

	pub async fn history_room(&self, room: &RoomId, limit: Option<u32>) -> Result<Vec<Message>, RouteError> {
		self.store_call("query_room", self.store.query_room(room, history_limit(limit)))
			.await
	}

	pub async fn create_room(&self, name: &str, creator: &UserId, members: &[UserId]) -> Result<Room, RouteError> {
		let room = self
			.store_call("create_room", self.store.create_room(name, creator, members))
			.await?;
		debug!(room_id = %room.id, creator = %room.creator, members = room.members.len(), "router: room created");
		Ok(room)
	}

	pub async fn room(&self, id: &RoomId) -> Result<Option<Room>, RouteError> {
		self.store_call("room", self.store.room(id)).await
	}
}
