#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use relay_domain::{Message, MessageScope, NewMessage, RawInbound, Room, RoomId, RoomKey, UserId};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::registry::{RegistryConfig, RoomEvent, RoomEventKind, RoomRegistry, SessionRef};
use crate::server::router::{MessageRouter, RouteError, RouteOrigin, RouterConfig, history_limit};
use crate::server::store::{InMemoryStore, MessageStore, StoreError};

/// In-memory store that can be switched into an outage or made to stall.
#[derive(Default)]
struct FlakyStore {
	inner: InMemoryStore,
	down: AtomicBool,
	stall: AtomicBool,
}

impl FlakyStore {
	async fn gate(&self) -> Result<(), StoreError> {
		if self.stall.load(Ordering::SeqCst) {
			tokio::time::sleep(Duration::from_secs(60)).await;
		}
		if self.down.load(Ordering::SeqCst) {
			return Err(StoreError::Unavailable("connection refused".to_string()));
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl MessageStore for FlakyStore {
	async fn append(&self, msg: NewMessage) -> Result<Message, StoreError> {
		self.gate().await?;
		self.inner.append(msg).await
	}

	async fn query_direct(&self, a: &UserId, b: &UserId, limit: usize) -> Result<Vec<Message>, StoreError> {
		self.gate().await?;
		self.inner.query_direct(a, b, limit).await
	}

	async fn query_room(&self, room: &RoomId, limit: usize) -> Result<Vec<Message>, StoreError> {
		self.gate().await?;
		self.inner.query_room(room, limit).await
	}

	async fn create_room(&self, name: &str, creator: &UserId, members: &[UserId]) -> Result<Room, StoreError> {
		self.gate().await?;
		self.inner.create_room(name, creator, members).await
	}

	async fn room(&self, id: &RoomId) -> Result<Option<Room>, StoreError> {
		self.gate().await?;
		self.inner.room(id).await
	}
}

struct Harness {
	store: Arc<FlakyStore>,
	registry: RoomRegistry,
	router: Arc<MessageRouter>,
}

fn harness() -> Harness {
	let store = Arc::new(FlakyStore::default());
	let registry = RoomRegistry::new(RegistryConfig::default());
	let router = Arc::new(MessageRouter::new(
		store.clone(),
		registry.clone(),
		RouterConfig {
			store_timeout: Duration::from_millis(200),
			debug_log_events: true,
		},
	));
	Harness {
		store,
		registry,
		router,
	}
}

fn uid(s: &str) -> UserId {
	UserId::new(s).expect("valid UserId")
}

fn room_key(id: &str) -> RoomKey {
	RoomKey::room(RoomId::new(id).expect("valid RoomId"))
}

async fn join(reg: &RoomRegistry, key: &RoomKey, conn_id: u64, name: &str) -> mpsc::Receiver<RoomEvent> {
	let (tx, rx) = mpsc::channel(64);
	reg.subscribe(key, &SessionRef::new(conn_id, uid(name), tx)).await;
	rx
}

/// Next chat event, skipping presence notifications.
async fn next_chat(rx: &mut mpsc::Receiver<RoomEvent>) -> Arc<Message> {
	loop {
		let ev = timeout(Duration::from_millis(500), rx.recv())
			.await
			.expect("expected an event within timeout")
			.expect("queue open");
		if let RoomEventKind::Chat(m) = ev.kind {
			return m;
		}
	}
}

fn no_chat_queued(rx: &mut mpsc::Receiver<RoomEvent>) -> bool {
	while let Ok(ev) = rx.try_recv() {
		if matches!(ev.kind, RoomEventKind::Chat(_)) {
			return false;
		}
	}
	true
}

#[tokio::test]
async fn direct_message_reaches_both_peers_and_history() {
	let h = harness();
	let key = RoomKey::direct(&uid("A"), &uid("B"));
	let mut rx_a = join(&h.registry, &key, 1, "A").await;
	let mut rx_b = join(&h.registry, &key, 2, "B").await;

	let sent = h
		.router
		.route(RawInbound::direct("A", "B", "hello"), None)
		.await
		.expect("route");

	for rx in [&mut rx_a, &mut rx_b] {
		let got = next_chat(rx).await;
		assert_eq!(got.body, "hello");
		assert_eq!(got.sender, uid("A"));
		assert_eq!(*got, sent);
	}

	let history = h.router.history_direct(&uid("A"), &uid("B"), Some(10)).await.expect("history");
	assert_eq!(history, vec![sent]);
}

#[tokio::test]
async fn either_direction_shares_one_key() {
	let h = harness();
	let key = RoomKey::direct(&uid("A"), &uid("B"));
	let mut rx = join(&h.registry, &key, 1, "A").await;

	h.router.route(RawInbound::direct("A", "B", "1"), None).await.expect("route");
	h.router.route(RawInbound::direct("B", "A", "2"), None).await.expect("route");

	assert_eq!(next_chat(&mut rx).await.body, "1");
	assert_eq!(next_chat(&mut rx).await.body, "2");
}

#[tokio::test]
async fn message_is_persisted_before_any_subscriber_sees_it() {
	let h = harness();
	let key = room_key("R1");
	let mut rx = join(&h.registry, &key, 1, "watcher").await;

	let store = Arc::clone(&h.store);
	let observer = tokio::spawn(async move {
		let got = next_chat(&mut rx).await;
		let persisted = store
			.query_room(&RoomId::new("R1").expect("room"), 10)
			.await
			.expect("query");
		(got, persisted)
	});

	h.router
		.route(RawInbound::to_room("alice", "R1", "ordered"), None)
		.await
		.expect("route");

	let (got, persisted) = observer.await.expect("observer");
	assert!(persisted.iter().any(|m| m.id == got.id));
}

#[tokio::test]
async fn store_outage_rejects_send_without_fanout() {
	let h = harness();
	let key = room_key("R1");
	let mut rx = join(&h.registry, &key, 1, "alice").await;

	h.store.down.store(true, Ordering::SeqCst);
	let err = h
		.router
		.route(RawInbound::to_room("alice", "R1", "lost"), None)
		.await
		.expect_err("must fail");
	assert!(matches!(err, RouteError::StorageUnavailable(_)));
	assert_eq!(err.code(), relay_protocol::codes::STORAGE_UNAVAILABLE);
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(no_chat_queued(&mut rx));

	// Subscriptions survive the outage.
	assert_eq!(h.registry.subscriber_count(&key).await, 1);
	h.store.down.store(false, Ordering::SeqCst);
	h.router
		.route(RawInbound::to_room("alice", "R1", "back"), None)
		.await
		.expect("route after recovery");
	assert_eq!(next_chat(&mut rx).await.body, "back");
}

#[tokio::test]
async fn stalled_store_times_out_as_unavailable() {
	let h = harness();
	h.store.stall.store(true, Ordering::SeqCst);
	let err = h
		.router
		.route(RawInbound::direct("alice", "bob", "slow"), None)
		.await
		.expect_err("must time out");
	assert!(matches!(err, RouteError::StorageUnavailable(ref m) if m.contains("timed out")));
}

#[tokio::test]
async fn closed_subscriber_does_not_fail_the_route() {
	let h = harness();
	let key = room_key("R1");
	let mut rx1 = join(&h.registry, &key, 1, "u1").await;
	let rx2 = join(&h.registry, &key, 2, "u2").await;
	let mut rx3 = join(&h.registry, &key, 3, "u3").await;
	drop(rx2);

	h.router
		.route(RawInbound::to_room("u1", "R1", "still here"), None)
		.await
		.expect("route succeeds despite closed subscriber");

	assert_eq!(next_chat(&mut rx1).await.body, "still here");
	assert_eq!(next_chat(&mut rx3).await.body, "still here");
}

#[tokio::test]
async fn full_subscriber_queue_does_not_block_others() {
	let h = harness();
	let key = room_key("R1");
	let mut rx1 = join(&h.registry, &key, 1, "u1").await;
	let mut rx3 = join(&h.registry, &key, 3, "u3").await;

	let (slow_tx, mut slow_rx) = mpsc::channel(1);
	h.registry.subscribe(&key, &SessionRef::new(2, uid("u2"), slow_tx.clone())).await;
	slow_tx
		.try_send(RoomEvent {
			key: key.clone(),
			kind: RoomEventKind::PeerJoined(uid("filler")),
		})
		.expect("fill the only slot");

	for body in ["first", "second"] {
		let sent = timeout(
			Duration::from_millis(500),
			h.router.route(RawInbound::to_room("u1", "R1", body), None),
		)
		.await
		.expect("route never waits on a full queue")
		.expect("route succeeds despite full subscriber");
		assert_eq!(sent.body, body);
	}

	for rx in [&mut rx1, &mut rx3] {
		assert_eq!(next_chat(rx).await.body, "first");
		assert_eq!(next_chat(rx).await.body, "second");
	}
	assert!(no_chat_queued(&mut slow_rx));

	let stored = h
		.router
		.history_room(&RoomId::new("R1").expect("room"), None)
		.await
		.expect("history");
	assert_eq!(stored.len(), 2);
}

#[tokio::test]
async fn invalid_message_is_neither_stored_nor_broadcast() {
	let h = harness();
	let key = room_key("R1");
	let mut rx = join(&h.registry, &key, 1, "alice").await;

	let err = h
		.router
		.route(RawInbound::to_room("alice", "R1", "   "), None)
		.await
		.expect_err("blank body");
	assert!(matches!(err, RouteError::InvalidMessage(_)));

	let err = h
		.router
		.route(
			RawInbound {
				sender: Some("alice".to_string()),
				message: Some("no target".to_string()),
				..RawInbound::default()
			},
			None,
		)
		.await
		.expect_err("missing target");
	assert_eq!(err.code(), relay_protocol::codes::INVALID_MESSAGE);

	assert!(no_chat_queued(&mut rx));
	let stored = h
		.router
		.history_room(&RoomId::new("R1").expect("room"), None)
		.await
		.expect("history");
	assert!(stored.is_empty());
}

#[tokio::test]
async fn session_origin_fills_sender_and_rejects_impersonation() {
	let h = harness();
	let origin = RouteOrigin {
		identity: uid("alice"),
		authenticated: true,
	};

	let raw = RawInbound {
		room: Some("R1".to_string()),
		message: Some("implicit sender".to_string()),
		..RawInbound::default()
	};
	let msg = h.router.route(raw, Some(&origin)).await.expect("route");
	assert_eq!(msg.sender, uid("alice"));
	assert!(matches!(msg.scope, MessageScope::Room { .. }));

	let err = h
		.router
		.route(RawInbound::direct("mallory", "bob", "hi"), Some(&origin))
		.await
		.expect_err("mismatch");
	assert!(matches!(err, RouteError::SenderMismatch { .. }));
	assert_eq!(err.code(), relay_protocol::codes::INVALID_MESSAGE);

	// Placeholder identities neither fill nor police the sender.
	let anonymous = RouteOrigin {
		identity: UserId::anonymous(7),
		authenticated: false,
	};
	let msg = h
		.router
		.route(RawInbound::direct("mallory", "bob", "hi"), Some(&anonymous))
		.await
		.expect("route");
	assert_eq!(msg.sender, uid("mallory"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_arrive_in_persistence_order() {
	let h = harness();
	let key = room_key("R1");
	let mut rx = join(&h.registry, &key, 1, "watcher").await;

	let mut tasks = Vec::new();
	for i in 0..40 {
		let router = Arc::clone(&h.router);
		tasks.push(tokio::spawn(async move {
			router
				.route(RawInbound::to_room(format!("u{}", i % 4), "R1", format!("m{i}")), None)
				.await
		}));
	}
	for t in tasks {
		t.await.expect("task").expect("route");
	}

	let mut received = Vec::new();
	for _ in 0..40 {
		received.push(next_chat(&mut rx).await.id);
	}
	let persisted: Vec<_> = h
		.router
		.history_room(&RoomId::new("R1").expect("room"), Some(100))
		.await
		.expect("history")
		.into_iter()
		.map(|m| m.id)
		.collect();
	assert_eq!(received, persisted);
}

#[test]
fn history_limit_defaults_and_caps() {
	assert_eq!(history_limit(None), 100);
	assert_eq!(history_limit(Some(0)), 100);
	assert_eq!(history_limit(Some(7)), 7);
	assert_eq!(history_limit(Some(50_000)), 1000);
}
