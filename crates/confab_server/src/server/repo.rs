#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use confab_domain::{MessageId, Role, RoomId, UserId};
use sqlx::FromRow;
use thiserror::Error;

/// Durable persistence failures, mapped from the underlying driver.
#[derive(Debug, Error)]
pub enum RepoError {
	#[error("not found")]
	NotFound,

	#[error("conflict")]
	Conflict,

	#[error("invalid participant set")]
	InvalidParticipants,

	#[error("database unavailable: {0}")]
	Unavailable(#[from] sqlx::Error),
}

pub type RepoResult<T> = Result<T, RepoError>;

fn map_insert_err(e: sqlx::Error) -> RepoError {
	if e.as_database_error().is_some_and(|d| d.is_unique_violation()) {
		RepoError::Conflict
	} else {
		RepoError::Unavailable(e)
	}
}

#[derive(Debug, Clone, FromRow)]
pub struct ChatRoomRow {
	pub id: i64,
	pub name: Option<String>,
	pub is_group_chat: bool,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
	pub id: i64,
	pub room_id: i64,
	pub sender_id: i64,
	pub content: String,
	pub attachment: Option<String>,
	pub attachment_type: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl MessageRow {
	/// A message counts as edited once its update landed noticeably after
	/// creation (> 2 s), so the initial insert itself never marks it.
	pub fn is_edited(&self) -> bool {
		(self.updated_at - self.created_at) > chrono::Duration::seconds(2)
	}
}

#[derive(Debug, Clone, FromRow)]
pub struct NotificationRow {
	pub id: i64,
	pub user_id: i64,
	pub room_id: Option<i64>,
	pub content: String,
	pub created_at: DateTime<Utc>,
	pub is_read: bool,
}

const MESSAGE_COLUMNS: &str = "id, room_id, sender_id, content, attachment, attachment_type, created_at, updated_at";

/// Durable CRUD for rooms, participants, messages and notifications. The
/// REST surface shares this database; the gateway only touches the
/// operations below.
#[derive(Clone)]
pub struct ChatRepo {
	backend: RepoBackend,
}

#[derive(Clone)]
enum RepoBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl ChatRepo {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			// A pooled in-memory sqlite database must stay on one connection,
			// otherwise every pool checkout sees a fresh empty database.
			let pool = if database_url.contains(":memory:") {
				sqlx::sqlite::SqlitePoolOptions::new()
					.max_connections(1)
					.connect(database_url)
					.await
					.context("connect sqlite")?
			} else {
				sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?
			};

			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: RepoBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: RepoBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	/// Round-trip probe for the readiness endpoint.
	pub async fn ping(&self) -> RepoResult<()> {
		match &self.backend {
			RepoBackend::Sqlite(pool) => {
				sqlx::query("SELECT 1").execute(pool).await?;
			}
			RepoBackend::Postgres(pool) => {
				sqlx::query("SELECT 1").execute(pool).await?;
			}
		}

		Ok(())
	}

	pub async fn get_room(&self, room_id: RoomId) -> RepoResult<Option<ChatRoomRow>> {
		let row = match &self.backend {
			RepoBackend::Sqlite(pool) => {
				sqlx::query_as::<_, ChatRoomRow>("SELECT id, name, is_group_chat, created_at FROM chat_rooms WHERE id = ?")
					.bind(room_id.as_i64())
					.fetch_optional(pool)
					.await?
			}
			RepoBackend::Postgres(pool) => {
				sqlx::query_as::<_, ChatRoomRow>("SELECT id, name, is_group_chat, created_at FROM chat_rooms WHERE id = $1")
					.bind(room_id.as_i64())
					.fetch_optional(pool)
					.await?
			}
		};

		Ok(row)
	}

	pub async fn is_participant(&self, room_id: RoomId, user_id: UserId) -> RepoResult<bool> {
		let row: Option<(i64,)> = match &self.backend {
			RepoBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT 1 FROM chat_room_participants WHERE room_id = ? AND user_id = ?")
					.bind(room_id.as_i64())
					.bind(user_id.as_i64())
					.fetch_optional(pool)
					.await?
			}
			RepoBackend::Postgres(pool) => {
				sqlx::query_as("SELECT 1 FROM chat_room_participants WHERE room_id = $1 AND user_id = $2")
					.bind(room_id.as_i64())
					.bind(user_id.as_i64())
					.fetch_optional(pool)
					.await?
			}
		};

		Ok(row.is_some())
	}

	pub async fn list_participant_ids(&self, room_id: RoomId, exclude: Option<UserId>) -> RepoResult<Vec<UserId>> {
		let rows: Vec<(i64,)> = match (&self.backend, exclude) {
			(RepoBackend::Sqlite(pool), Some(user_id)) => {
				sqlx::query_as("SELECT user_id FROM chat_room_participants WHERE room_id = ? AND user_id != ? ORDER BY user_id")
					.bind(room_id.as_i64())
					.bind(user_id.as_i64())
					.fetch_all(pool)
					.await?
			}
			(RepoBackend::Sqlite(pool), None) => {
				sqlx::query_as("SELECT user_id FROM chat_room_participants WHERE room_id = ? ORDER BY user_id")
					.bind(room_id.as_i64())
					.fetch_all(pool)
					.await?
			}
			(RepoBackend::Postgres(pool), Some(user_id)) => {
				sqlx::query_as(
					"SELECT user_id FROM chat_room_participants WHERE room_id = $1 AND user_id != $2 ORDER BY user_id",
				)
				.bind(room_id.as_i64())
				.bind(user_id.as_i64())
				.fetch_all(pool)
				.await?
			}
			(RepoBackend::Postgres(pool), None) => {
				sqlx::query_as("SELECT user_id FROM chat_room_participants WHERE room_id = $1 ORDER BY user_id")
					.bind(room_id.as_i64())
					.fetch_all(pool)
					.await?
			}
		};

		Ok(rows.into_iter().map(|(id,)| UserId(id)).collect())
	}

	pub async fn create_message(
		&self,
		room_id: RoomId,
		sender_id: UserId,
		content: &str,
		attachment: Option<(&str, &str)>,
	) -> RepoResult<MessageRow> {
		let now = Utc::now();
		let (attachment_ref, attachment_type) = match attachment {
			Some((a, t)) => (Some(a), Some(t)),
			None => (None, None),
		};

		let row = match &self.backend {
			RepoBackend::Sqlite(pool) => {
				sqlx::query_as::<_, MessageRow>(&format!(
					"INSERT INTO messages (room_id, sender_id, content, attachment, attachment_type, created_at, updated_at) \
					VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING {MESSAGE_COLUMNS}"
				))
				.bind(room_id.as_i64())
				.bind(sender_id.as_i64())
				.bind(content)
				.bind(attachment_ref)
				.bind(attachment_type)
				.bind(now)
				.bind(now)
				.fetch_one(pool)
				.await?
			}
			RepoBackend::Postgres(pool) => {
				sqlx::query_as::<_, MessageRow>(&format!(
					"INSERT INTO messages (room_id, sender_id, content, attachment, attachment_type, created_at, updated_at) \
					VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {MESSAGE_COLUMNS}"
				))
				.bind(room_id.as_i64())
				.bind(sender_id.as_i64())
				.bind(content)
				.bind(attachment_ref)
				.bind(attachment_type)
				.bind(now)
				.bind(now)
				.fetch_one(pool)
				.await?
			}
		};

		Ok(row)
	}

	pub async fn get_message(&self, message_id: MessageId) -> RepoResult<Option<MessageRow>> {
		let row = match &self.backend {
			RepoBackend::Sqlite(pool) => {
				sqlx::query_as::<_, MessageRow>(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
					.bind(message_id.as_i64())
					.fetch_optional(pool)
					.await?
			}
			RepoBackend::Postgres(pool) => {
				sqlx::query_as::<_, MessageRow>(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"))
					.bind(message_id.as_i64())
					.fetch_optional(pool)
					.await?
			}
		};

		Ok(row)
	}

	/// Sender-only edit. Returns `None` when the message does not exist in
	/// the room or the caller is not its sender.
	pub async fn update_message(
		&self,
		message_id: MessageId,
		room_id: RoomId,
		sender_id: UserId,
		content: &str,
	) -> RepoResult<Option<MessageRow>> {
		let now = Utc::now();

		let row = match &self.backend {
			RepoBackend::Sqlite(pool) => {
				sqlx::query_as::<_, MessageRow>(&format!(
					"UPDATE messages SET content = ?, updated_at = ? \
					WHERE id = ? AND room_id = ? AND sender_id = ? RETURNING {MESSAGE_COLUMNS}"
				))
				.bind(content)
				.bind(now)
				.bind(message_id.as_i64())
				.bind(room_id.as_i64())
				.bind(sender_id.as_i64())
				.fetch_optional(pool)
				.await?
			}
			RepoBackend::Postgres(pool) => {
				sqlx::query_as::<_, MessageRow>(&format!(
					"UPDATE messages SET content = $1, updated_at = $2 \
					WHERE id = $3 AND room_id = $4 AND sender_id = $5 RETURNING {MESSAGE_COLUMNS}"
				))
				.bind(content)
				.bind(now)
				.bind(message_id.as_i64())
				.bind(room_id.as_i64())
				.bind(sender_id.as_i64())
				.fetch_optional(pool)
				.await?
			}
		};

		Ok(row)
	}

	/// Sender-only delete. Returns `false` when nothing matched.
	pub async fn delete_message(&self, message_id: MessageId, room_id: RoomId, sender_id: UserId) -> RepoResult<bool> {
		let rows_affected = match &self.backend {
			RepoBackend::Sqlite(pool) => {
				sqlx::query("DELETE FROM messages WHERE id = ? AND room_id = ? AND sender_id = ?")
					.bind(message_id.as_i64())
					.bind(room_id.as_i64())
					.bind(sender_id.as_i64())
					.execute(pool)
					.await?
					.rows_affected()
			}
			RepoBackend::Postgres(pool) => {
				sqlx::query("DELETE FROM messages WHERE id = $1 AND room_id = $2 AND sender_id = $3")
					.bind(message_id.as_i64())
					.bind(room_id.as_i64())
					.bind(sender_id.as_i64())
					.execute(pool)
					.await?
					.rows_affected()
			}
		};

		Ok(rows_affected > 0)
	}

	/// Coalescing write: at most one unread notification per `(user, room)`;
	/// the newest content replaces the older.
	pub async fn upsert_unread_notification(&self, user_id: UserId, room_id: RoomId, content: &str) -> RepoResult<()> {
		let now = Utc::now();

		match &self.backend {
			RepoBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO notifications (user_id, room_id, content, created_at, is_read) VALUES (?, ?, ?, ?, 0) \
					ON CONFLICT (user_id, room_id) WHERE is_read = 0 \
					DO UPDATE SET content = excluded.content, created_at = excluded.created_at",
				)
				.bind(user_id.as_i64())
				.bind(room_id.as_i64())
				.bind(content)
				.bind(now)
				.execute(pool)
				.await?;
			}
			RepoBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO notifications (user_id, room_id, content, created_at, is_read) VALUES ($1, $2, $3, $4, FALSE) \
					ON CONFLICT (user_id, room_id) WHERE is_read = FALSE \
					DO UPDATE SET content = excluded.content, created_at = excluded.created_at",
				)
				.bind(user_id.as_i64())
				.bind(room_id.as_i64())
				.bind(content)
				.bind(now)
				.execute(pool)
				.await?;
			}
		}

		Ok(())
	}

	pub async fn unread_notifications(&self, user_id: UserId) -> RepoResult<Vec<NotificationRow>> {
		let rows = match &self.backend {
			RepoBackend::Sqlite(pool) => {
				sqlx::query_as::<_, NotificationRow>(
					"SELECT id, user_id, room_id, content, created_at, is_read FROM notifications \
					WHERE user_id = ? AND is_read = 0 ORDER BY created_at DESC",
				)
				.bind(user_id.as_i64())
				.fetch_all(pool)
				.await?
			}
			RepoBackend::Postgres(pool) => {
				sqlx::query_as::<_, NotificationRow>(
					"SELECT id, user_id, room_id, content, created_at, is_read FROM notifications \
					WHERE user_id = $1 AND is_read = FALSE ORDER BY created_at DESC",
				)
				.bind(user_id.as_i64())
				.fetch_all(pool)
				.await?
			}
		};

		Ok(rows)
	}

	/// Idempotent read receipt.
	pub async fn create_read_receipt(&self, message_id: MessageId, user_id: UserId) -> RepoResult<()> {
		let now = Utc::now();

		match &self.backend {
			RepoBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO message_read_receipts (message_id, user_id, read_at) VALUES (?, ?, ?) \
					ON CONFLICT (message_id, user_id) DO NOTHING",
				)
				.bind(message_id.as_i64())
				.bind(user_id.as_i64())
				.bind(now)
				.execute(pool)
				.await?;
			}
			RepoBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO message_read_receipts (message_id, user_id, read_at) VALUES ($1, $2, $3) \
					ON CONFLICT (message_id, user_id) DO NOTHING",
				)
				.bind(message_id.as_i64())
				.bind(user_id.as_i64())
				.bind(now)
				.execute(pool)
				.await?;
			}
		}

		Ok(())
	}

	pub async fn set_last_read_message(&self, room_id: RoomId, user_id: UserId, message_id: MessageId) -> RepoResult<()> {
		match &self.backend {
			RepoBackend::Sqlite(pool) => {
				sqlx::query("UPDATE chat_room_participants SET last_read_message_id = ? WHERE room_id = ? AND user_id = ?")
					.bind(message_id.as_i64())
					.bind(room_id.as_i64())
					.bind(user_id.as_i64())
					.execute(pool)
					.await?;
			}
			RepoBackend::Postgres(pool) => {
				sqlx::query("UPDATE chat_room_participants SET last_read_message_id = $1 WHERE room_id = $2 AND user_id = $3")
					.bind(message_id.as_i64())
					.bind(room_id.as_i64())
					.bind(user_id.as_i64())
					.execute(pool)
					.await?;
			}
		}

		Ok(())
	}

	pub async fn create_user(&self, name: &str, avatar_url: Option<&str>) -> RepoResult<UserId> {
		let row: (i64,) = match &self.backend {
			RepoBackend::Sqlite(pool) => {
				sqlx::query_as("INSERT INTO users (name, avatar_url, auth_provider) VALUES (?, ?, 'local') RETURNING id")
					.bind(name)
					.bind(avatar_url)
					.fetch_one(pool)
					.await
					.map_err(map_insert_err)?
			}
			RepoBackend::Postgres(pool) => {
				sqlx::query_as("INSERT INTO users (name, avatar_url, auth_provider) VALUES ($1, $2, 'local') RETURNING id")
					.bind(name)
					.bind(avatar_url)
					.fetch_one(pool)
					.await
					.map_err(map_insert_err)?
			}
		};

		Ok(UserId(row.0))
	}

	/// Room creation as the REST surface performs it. A direct room holds
	/// exactly two distinct participants; a group room gets the creator as
	/// its admin.
	pub async fn create_room(
		&self,
		name: Option<&str>,
		is_group_chat: bool,
		creator: UserId,
		others: &[UserId],
	) -> RepoResult<ChatRoomRow> {
		let mut members: Vec<UserId> = Vec::with_capacity(others.len() + 1);
		members.push(creator);
		for user_id in others {
			if *user_id != creator && !members.contains(user_id) {
				members.push(*user_id);
			}
		}

		if is_group_chat {
			if members.len() < 2 {
				return Err(RepoError::InvalidParticipants);
			}
		} else if members.len() != 2 {
			return Err(RepoError::InvalidParticipants);
		}

		let now = Utc::now();

		let room = match &self.backend {
			RepoBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				let room: ChatRoomRow = sqlx::query_as(
					"INSERT INTO chat_rooms (name, is_group_chat, created_at) VALUES (?, ?, ?) \
					RETURNING id, name, is_group_chat, created_at",
				)
				.bind(name)
				.bind(is_group_chat)
				.bind(now)
				.fetch_one(&mut *tx)
				.await?;

				for user_id in &members {
					let role = if is_group_chat && *user_id == creator {
						Role::Admin
					} else {
						Role::Member
					};

					sqlx::query("INSERT INTO chat_room_participants (room_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)")
						.bind(room.id)
						.bind(user_id.as_i64())
						.bind(role.as_str())
						.bind(now)
						.execute(&mut *tx)
						.await
						.map_err(map_insert_err)?;
				}

				tx.commit().await?;
				room
			}
			RepoBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				let room: ChatRoomRow = sqlx::query_as(
					"INSERT INTO chat_rooms (name, is_group_chat, created_at) VALUES ($1, $2, $3) \
					RETURNING id, name, is_group_chat, created_at",
				)
				.bind(name)
				.bind(is_group_chat)
				.bind(now)
				.fetch_one(&mut *tx)
				.await?;

				for user_id in &members {
					let role = if is_group_chat && *user_id == creator {
						Role::Admin
					} else {
						Role::Member
					};

					sqlx::query(
						"INSERT INTO chat_room_participants (room_id, user_id, role, joined_at) VALUES ($1, $2, $3, $4)",
					)
					.bind(room.id)
					.bind(user_id.as_i64())
					.bind(role.as_str())
					.bind(now)
					.execute(&mut *tx)
					.await
					.map_err(map_insert_err)?;
				}

				tx.commit().await?;
				room
			}
		};

		Ok(room)
	}

	pub async fn add_participant(&self, room_id: RoomId, user_id: UserId, role: Role) -> RepoResult<()> {
		let now = Utc::now();

		match &self.backend {
			RepoBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO chat_room_participants (room_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)")
					.bind(room_id.as_i64())
					.bind(user_id.as_i64())
					.bind(role.as_str())
					.bind(now)
					.execute(pool)
					.await
					.map_err(map_insert_err)?;
			}
			RepoBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO chat_room_participants (room_id, user_id, role, joined_at) VALUES ($1, $2, $3, $4)")
					.bind(room_id.as_i64())
					.bind(user_id.as_i64())
					.bind(role.as_str())
					.bind(now)
					.execute(pool)
					.await
					.map_err(map_insert_err)?;
			}
		}

		Ok(())
	}
}
