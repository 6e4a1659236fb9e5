#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::{Context, anyhow};
use relay_domain::{Message, MessageId, MessageScope, NewMessage, Room, RoomId, UserId};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use super::{MessageStore, StoreError};
use crate::util::time::MonotonicClock;

const SCOPE_DIRECT: &str = "direct";
const SCOPE_ROOM: &str = "room";

type MessageRow = (String, String, String, String, String, Option<String>, i64, bool, bool);

/// `sqlx` store over SQLite or Postgres, picked from the URL scheme.
pub struct SqlStore {
	backend: SqlBackend,
	clock: MonotonicClock,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);
			// Every connection to `:memory:` is a separate database.
			let in_memory = database_url.contains(":memory:");
			let mut pool_opts = SqlitePoolOptions::new();
			if in_memory {
				pool_opts = pool_opts.max_connections(1).idle_timeout(None).max_lifetime(None);
			}
			let pool = pool_opts.connect_with(opts).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			SqlBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.connect(database_url)
				.await
				.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			SqlBackend::Postgres(pool)
		} else {
			return Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"));
		};

		let newest: (Option<i64>,) = match &backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT MAX(created_at) FROM messages")
				.fetch_one(pool)
				.await
				.context("read newest timestamp (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT MAX(created_at) FROM messages")
				.fetch_one(pool)
				.await
				.context("read newest timestamp (postgres)")?,
		};
		let clock = match newest.0 {
			Some(ts) => MonotonicClock::starting_after(ts),
			None => MonotonicClock::new(),
		};

		info!(kind = backend.kind(), "message store connected");
		Ok(Self { backend, clock })
	}
}

impl SqlBackend {
	fn kind(&self) -> &'static str {
		match self {
			SqlBackend::Sqlite(_) => "sqlite",
			SqlBackend::Postgres(_) => "postgres",
		}
	}
}

fn scope_columns(scope: &MessageScope) -> (&'static str, &str) {
	match scope {
		MessageScope::Direct { peer } => (SCOPE_DIRECT, peer.as_str()),
		MessageScope::Room { room_id } => (SCOPE_ROOM, room_id.as_str()),
	}
}

fn corrupt(field: &str, value: &str) -> StoreError {
	StoreError::Corrupt(format!("{field}={value:?}"))
}

fn message_from_row(row: MessageRow) -> Result<Message, StoreError> {
	let (id, sender, kind, target, body, attachment_url, created_at_ms, edited, deleted) = row;
	let scope = match kind.as_str() {
		SCOPE_DIRECT => MessageScope::Direct {
			peer: UserId::new(target.as_str()).map_err(|_| corrupt("target_id", &target))?,
		},
		SCOPE_ROOM => MessageScope::Room {
			room_id: RoomId::new(target.as_str()).map_err(|_| corrupt("target_id", &target))?,
		},
		other => return Err(corrupt("scope_kind", other)),
	};
	Ok(Message {
		id: id.parse::<MessageId>().map_err(|_| corrupt("id", &id))?,
		sender: UserId::new(sender.as_str()).map_err(|_| corrupt("sender_id", &sender))?,
		scope,
		body,
		attachment_url,
		created_at_ms,
		edited,
		deleted,
	})
}

fn messages_from_rows(rows: Vec<MessageRow>) -> Result<Vec<Message>, StoreError> {
	rows.into_iter().map(message_from_row).collect()
}

fn room_from_parts(row: (String, String, String, i64), member_rows: Vec<(String,)>) -> Result<Room, StoreError> {
	let (id, name, creator, created_at_ms) = row;
	let mut members = BTreeSet::new();
	for (m,) in member_rows {
		members.insert(UserId::new(m.as_str()).map_err(|_| corrupt("member_id", &m))?);
	}
	Ok(Room {
		id: RoomId::new(id.as_str()).map_err(|_| corrupt("room id", &id))?,
		name,
		creator: UserId::new(creator.as_str()).map_err(|_| corrupt("creator", &creator))?,
		members,
		created_at_ms,
	})
}

const SELECT_COLUMNS: &str = "id, sender_id, scope_kind, target_id, body, attachment_url, created_at, edited, deleted";

#[async_trait::async_trait]
impl MessageStore for SqlStore {
	async fn append(&self, msg: NewMessage) -> Result<Message, StoreError> {
		let stored = msg.into_persisted(MessageId::new_v4(), self.clock.next_ms());
		let (kind, target) = scope_columns(&stored.scope);
		let id = stored.id.to_string();

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, sender_id, scope_kind, target_id, body, attachment_url, created_at, edited, deleted) \
					 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(&id)
				.bind(stored.sender.as_str())
				.bind(kind)
				.bind(target)
				.bind(&stored.body)
				.bind(stored.attachment_url.as_deref())
				.bind(stored.created_at_ms)
				.bind(stored.edited)
				.bind(stored.deleted)
				.execute(pool)
				.await?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, sender_id, scope_kind, target_id, body, attachment_url, created_at, edited, deleted) \
					 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
				)
				.bind(&id)
				.bind(stored.sender.as_str())
				.bind(kind)
				.bind(target)
				.bind(&stored.body)
				.bind(stored.attachment_url.as_deref())
				.bind(stored.created_at_ms)
				.bind(stored.edited)
				.bind(stored.deleted)
				.execute(pool)
				.await?;
			}
		}

		Ok(stored)
	}

	async fn query_direct(&self, a: &UserId, b: &UserId, limit: usize) -> Result<Vec<Message>, StoreError> {
		let limit = limit as i64;
		let rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let sql = format!(
					"SELECT {SELECT_COLUMNS} FROM (\
					 SELECT * FROM messages WHERE scope_kind = 'direct' \
					 AND ((sender_id = ? AND target_id = ?) OR (sender_id = ? AND target_id = ?)) \
					 ORDER BY seq DESC LIMIT ?) AS recent ORDER BY seq ASC"
				);
				sqlx::query_as(&sql)
					.bind(a.as_str())
					.bind(b.as_str())
					.bind(b.as_str())
					.bind(a.as_str())
					.bind(limit)
					.fetch_all(pool)
					.await?
			}
			SqlBackend::Postgres(pool) => {
				let sql = format!(
					"SELECT {SELECT_COLUMNS} FROM (\
					 SELECT * FROM messages WHERE scope_kind = 'direct' \
					 AND ((sender_id = $1 AND target_id = $2) OR (sender_id = $2 AND target_id = $1)) \
					 ORDER BY seq DESC LIMIT $3) AS recent ORDER BY seq ASC"
				);
				sqlx::query_as(&sql)
					.bind(a.as_str())
					.bind(b.as_str())
					.bind(limit)
					.fetch_all(pool)
					.await?
			}
		};
		messages_from_rows(rows)
	}

	async fn query_room(&self, room: &RoomId, limit: usize) -> Result<Vec<Message>, StoreError> {
		let limit = limit as i64;
		let rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let sql = format!(
					"SELECT {SELECT_COLUMNS} FROM (\
					 SELECT * FROM messages WHERE scope_kind = 'room' AND target_id = ? \
					 ORDER BY seq DESC LIMIT ?) AS recent ORDER BY seq ASC"
				);
				sqlx::query_as(&sql)
					.bind(room.as_str())
					.bind(limit)
					.fetch_all(pool)
					.await?
			}
			SqlBackend::Postgres(pool) => {
				let sql = format!(
					"SELECT {SELECT_COLUMNS} FROM (\
					 SELECT * FROM messages WHERE scope_kind = 'room' AND target_id = $1 \
					 ORDER BY seq DESC LIMIT $2) AS recent ORDER BY seq ASC"
				);
				sqlx::query_as(&sql)
					.bind(room.as_str())
					.bind(limit)
					.fetch_all(pool)
					.await?
			}
		};
		messages_from_rows(rows)
	}

	async fn create_room(&self, name: &str, creator: &UserId, members: &[UserId]) -> Result<Room, StoreError> {
		let mut set: BTreeSet<UserId> = members.iter().cloned().collect();
		set.insert(creator.clone());
		let room = Room {
			id: RoomId::generate(),
			name: name.to_string(),
			creator: creator.clone(),
			members: set,
			created_at_ms: self.clock.next_ms(),
		};

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				sqlx::query("INSERT INTO rooms (id, name, creator, created_at) VALUES (?, ?, ?, ?)")
					.bind(room.id.as_str())
					.bind(&room.name)
					.bind(room.creator.as_str())
					.bind(room.created_at_ms)
					.execute(&mut *tx)
					.await?;
				for member in &room.members {
					sqlx::query("INSERT INTO room_members (room_id, member_id) VALUES (?, ?)")
						.bind(room.id.as_str())
						.bind(member.as_str())
						.execute(&mut *tx)
						.await?;
				}
				tx.commit().await?;
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				sqlx::query("INSERT INTO rooms (id, name, creator, created_at) VALUES ($1, $2, $3, $4)")
					.bind(room.id.as_str())
					.bind(&room.name)
					.bind(room.creator.as_str())
					.bind(room.created_at_ms)
					.execute(&mut *tx)
					.await?;
				for member in &room.members {
					sqlx::query("INSERT INTO room_members (room_id, member_id) VALUES ($1, $2)")
						.bind(room.id.as_str())
						.bind(member.as_str())
						.execute(&mut *tx)
						.await?;
				}
				tx.commit().await?;
			}
		}

		Ok(room)
	}

	async fn room(&self, id: &RoomId) -> Result<Option<Room>, StoreError> {
		let (row, members) = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let row: Option<(String, String, String, i64)> =
					sqlx::query_as("SELECT id, name, creator, created_at FROM rooms WHERE id = ?")
						.bind(id.as_str())
						.fetch_optional(pool)
						.await?;
				let Some(row) = row else {
					return Ok(None);
				};
				let members: Vec<(String,)> =
					sqlx::query_as("SELECT member_id FROM room_members WHERE room_id = ? ORDER BY member_id")
						.bind(id.as_str())
						.fetch_all(pool)
						.await?;
				(row, members)
			}
			SqlBackend::Postgres(pool) => {
				let row: Option<(String, String, String, i64)> =
					sqlx::query_as("SELECT id, name, creator, created_at FROM rooms WHERE id = $1")
						.bind(id.as_str())
						.fetch_optional(pool)
						.await?;
				let Some(row) = row else {
					return Ok(None);
				};
				let members: Vec<(String,)> =
					sqlx::query_as("SELECT member_id FROM room_members WHERE room_id = $1 ORDER BY member_id")
						.bind(id.as_str())
						.fetch_all(pool)
						.await?;
				(row, members)
			}
		};
		room_from_parts(row, members).map(Some)
	}
}

#[cfg(test)]
mod tests {
	use relay_domain::{RawInbound, normalize};

	use super::*;

	fn uid(s: &str) -> UserId {
		UserId::new(s).expect("user id")
	}

	async fn memory_store() -> SqlStore {
		SqlStore::connect("sqlite::memory:").await.expect("connect sqlite memory")
	}

	async fn put(store: &SqlStore, raw: RawInbound) -> Message {
		store.append(normalize(&raw).expect("normalize")).await.expect("append")
	}

	#[tokio::test]
	async fn append_then_query_direct_round_trips_all_columns() {
		let store = memory_store().await;
		let mut raw = RawInbound::direct("alice", "bob", "  hello  ");
		raw.image = Some("https://img.example/x.png".to_string());
		let stored = put(&store, raw).await;
		assert_eq!(stored.body, "hello");

		let back = store.query_direct(&uid("bob"), &uid("alice"), 10).await.expect("query");
		assert_eq!(back, vec![stored]);
	}

	#[tokio::test]
	async fn direct_query_excludes_other_pairs_and_rooms() {
		let store = memory_store().await;
		let a = put(&store, RawInbound::direct("alice", "bob", "1")).await;
		put(&store, RawInbound::direct("alice", "carol", "2")).await;
		put(&store, RawInbound::to_room("alice", "bob", "3")).await;
		let b = put(&store, RawInbound::direct("bob", "alice", "4")).await;

		let got = store.query_direct(&uid("alice"), &uid("bob"), 100).await.expect("query");
		assert_eq!(got, vec![a, b]);
	}

	#[tokio::test]
	async fn room_query_returns_latest_window_ascending() {
		let store = memory_store().await;
		for i in 0..4 {
			put(&store, RawInbound::to_room("alice", "R1", format!("m{i}"))).await;
		}
		put(&store, RawInbound::to_room("alice", "R2", "elsewhere")).await;

		let got = store
			.query_room(&RoomId::new("R1").expect("room"), 3)
			.await
			.expect("query");
		let bodies: Vec<_> = got.iter().map(|m| m.body.as_str()).collect();
		assert_eq!(bodies, vec!["m1", "m2", "m3"]);
	}

	#[tokio::test]
	async fn room_catalog_persists_members() {
		let store = memory_store().await;
		let room = store
			.create_room("team", &uid("alice"), &[uid("bob"), uid("alice")])
			.await
			.expect("create");
		assert_eq!(room.members.len(), 2);

		let back = store.room(&room.id).await.expect("lookup").expect("room exists");
		assert_eq!(back, room);
		assert!(store.room(&RoomId::generate()).await.expect("lookup").is_none());
	}

	#[tokio::test]
	async fn unsupported_scheme_is_rejected() {
		let err = SqlStore::connect("mysql://localhost/db").await.err().expect("must fail");
		assert!(err.to_string().contains("unsupported"));
	}
}
