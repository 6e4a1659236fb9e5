#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use relay_domain::{Message, RoomKey, UserId};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::debug;

/// Event pushed to a subscribed session.
#[derive(Debug, Clone)]
pub struct RoomEvent {
	pub key: RoomKey,
	pub kind: RoomEventKind,
}

#[derive(Debug, Clone)]
pub enum RoomEventKind {
	Chat(Arc<Message>),
	PeerJoined(UserId),
	PeerLeft(UserId),
}

/// Registry-side handle to one session's outbound queue.
#[derive(Debug, Clone)]
pub struct SessionRef {
	pub conn_id: u64,
	pub identity: UserId,
	tx: mpsc::Sender<RoomEvent>,
}

impl SessionRef {
	pub fn new(conn_id: u64, identity: UserId, tx: mpsc::Sender<RoomEvent>) -> Self {
		Self { conn_id, identity, tx }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
	QueueFull,
	Closed,
}

impl DeliveryFailure {
	fn as_str(self) -> &'static str {
		match self {
			DeliveryFailure::QueueFull => "full",
			DeliveryFailure::Closed => "closed",
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
	pub debug_logs: bool,
}

/// Room key -> subscribed sessions.
///
/// The outer map lock is only held to look up, insert or remove an entry. Each entry has
/// its own lock, so subscribe/unsubscribe/snapshot on one key are linearizable and other
/// keys are never blocked. An entry emptied by `unsubscribe` is marked retired before it
/// leaves the map; a subscriber that raced onto it retries against a fresh entry.
#[derive(Debug, Clone, Default)]
pub struct RoomRegistry {
	rooms: Arc<RwLock<HashMap<RoomKey, Arc<Mutex<RoomEntry>>>>>,
	cfg: RegistryConfig,
}

#[derive(Debug, Default)]
struct RoomEntry {
	subscribers: BTreeMap<u64, SessionRef>,
	retired: bool,
}

impl RoomRegistry {
	pub fn new(cfg: RegistryConfig) -> Self {
		Self {
			rooms: Arc::default(),
			cfg,
		}
	}

	async fn entry_for(&self, key: &RoomKey) -> Arc<Mutex<RoomEntry>> {
		if let Some(entry) = self.rooms.read().await.get(key) {
			return Arc::clone(entry);
		}
		let mut rooms = self.rooms.write().await;
		let entry = Arc::clone(rooms.entry(key.clone()).or_default());
		metrics::gauge!("relay_server_rooms").set(rooms.len() as f64);
		entry
	}

	async fn existing(&self, key: &RoomKey) -> Option<Arc<Mutex<RoomEntry>>> {
		self.rooms.read().await.get(key).cloned()
	}

	/// Drop `entry` from the map if it is still the one registered under `key`.
	async fn remove_if_current(&self, key: &RoomKey, entry: &Arc<Mutex<RoomEntry>>) {
		let mut rooms = self.rooms.write().await;
		if rooms.get(key).is_some_and(|cur| Arc::ptr_eq(cur, entry)) {
			rooms.remove(key);
			metrics::gauge!("relay_server_rooms").set(rooms.len() as f64);
		}
	}

	/// Add `session` to `key`. Returns `false` if it was already subscribed.
	///
	/// On a fresh subscription the other subscribers receive `PeerJoined`.
	pub async fn subscribe(&self, key: &RoomKey, session: &SessionRef) -> bool {
		loop {
			let entry = self.entry_for(key).await;
			let mut guard = entry.lock().await;
			if guard.retired {
				drop(guard);
				self.remove_if_current(key, &entry).await;
				continue;
			}
			if guard.subscribers.contains_key(&session.conn_id) {
				return false;
			}

			for other in guard.subscribers.values() {
				let _ = self.deliver(
					other,
					RoomEvent {
						key: key.clone(),
						kind: RoomEventKind::PeerJoined(session.identity.clone()),
					},
				);
			}
			guard.subscribers.insert(session.conn_id, session.clone());
			metrics::gauge!("relay_server_subscriptions").increment(1.0);

			if self.cfg.debug_logs {
				debug!(room_key = %key, conn_id = session.conn_id, subs = guard.subscribers.len(), "registry: subscribed");
			}
			return true;
		}
	}

	/// Remove `conn_id` from `key`. Returns `false` if it was not subscribed.
	///
	/// Remaining subscribers receive `PeerLeft`; the key is dropped once empty.
	pub async fn unsubscribe(&self, key: &RoomKey, conn_id: u64) -> bool {
		let Some(entry) = self.existing(key).await else {
			return false;
		};

		let mut guard = entry.lock().await;
		let Some(removed) = guard.subscribers.remove(&conn_id) else {
			return false;
		};
		metrics::gauge!("relay_server_subscriptions").decrement(1.0);

		for other in guard.subscribers.values() {
			let _ = self.deliver(
				other,
				RoomEvent {
					key: key.clone(),
					kind: RoomEventKind::PeerLeft(removed.identity.clone()),
				},
			);
		}

		let emptied = guard.subscribers.is_empty();
		if emptied {
			guard.retired = true;
		}
		if self.cfg.debug_logs {
			debug!(room_key = %key, conn_id, subs = guard.subscribers.len(), "registry: unsubscribed");
		}
		drop(guard);

		if emptied {
			self.remove_if_current(key, &entry).await;
		}
		true
	}

	/// Unsubscribe `conn_id` from every key in `keys`.
	pub async fn remove_session<'a>(&self, conn_id: u64, keys: impl IntoIterator<Item = &'a RoomKey>) {
		for key in keys {
			self.unsubscribe(key, conn_id).await;
		}
	}

	/// Snapshot of the sessions subscribed to `key` right now.
	pub async fn subscribers_of(&self, key: &RoomKey) -> Vec<SessionRef> {
		let Some(entry) = self.existing(key).await else {
			return Vec::new();
		};
		let guard = entry.lock().await;
		guard.subscribers.values().cloned().collect()
	}

	#[cfg(test)]
	pub async fn subscriber_count(&self, key: &RoomKey) -> usize {
		match self.existing(key).await {
			Some(entry) => entry.lock().await.subscribers.len(),
			None => 0,
		}
	}

	/// Live keys; exported as the `relay_server_rooms` gauge.
	#[cfg(test)]
	pub async fn room_count(&self) -> usize {
		self.rooms.read().await.len()
	}

	/// Non-blocking enqueue onto one subscriber's queue.
	pub fn deliver(&self, target: &SessionRef, event: RoomEvent) -> Result<(), DeliveryFailure> {
		let failure = match target.tx.try_send(event) {
			Ok(()) => return Ok(()),
			Err(mpsc::error::TrySendError::Full(_)) => DeliveryFailure::QueueFull,
			Err(mpsc::error::TrySendError::Closed(_)) => DeliveryFailure::Closed,
		};
		metrics::counter!("relay_server_delivery_failures_total", "reason" => failure.as_str()).increment(1);
		debug!(conn_id = target.conn_id, identity = %target.identity, reason = failure.as_str(), "registry: delivery failed");
		Err(failure)
	}
}
