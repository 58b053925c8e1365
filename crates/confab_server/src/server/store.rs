#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Bounded timeout for any single store round-trip.
pub const STORE_OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Ephemeral key builders. Every key here is TTL-bearing; entries expire
/// naturally when no live connection refreshes them.
pub mod keys {
	use confab_domain::RoomId;

	pub const GLOBAL_ONLINE_USERS: &str = "global:online_users";

	pub fn presence(room_id: RoomId) -> String {
		format!("chat:presence:{room_id}")
	}

	pub fn typing(room_id: RoomId) -> String {
		format!("chat:typing:{room_id}")
	}

	pub fn note(room_id: RoomId) -> String {
		format!("chat:note:{room_id}")
	}

	pub fn cursors(room_id: RoomId) -> String {
		format!("chat:cursors:{room_id}")
	}

	pub fn huddle(room_id: RoomId) -> String {
		format!("chat:huddle:{room_id}")
	}

	pub fn sfu_active(room_id: RoomId) -> String {
		format!("chat:huddle:{room_id}:sfu_active")
	}

	pub fn sfu_sessions(room_id: RoomId) -> String {
		format!("chat:huddle:{room_id}:sfu_sessions")
	}

	pub fn sfu_tracks(room_id: RoomId) -> String {
		format!("chat:huddle:{room_id}:sfu_tracks")
	}
}

/// Time-to-live settings for the ephemeral keys, in seconds.
#[derive(Debug, Clone)]
pub struct TtlSettings {
	pub online_secs: u64,
	pub presence_secs: u64,
	pub typing_secs: u64,
	pub note_secs: u64,
	pub cursor_secs: u64,
	pub huddle_secs: u64,
	pub sfu_secs: u64,
}

impl Default for TtlSettings {
	fn default() -> Self {
		Self {
			online_secs: 300,
			presence_secs: 300,
			typing_secs: 5,
			note_secs: 60 * 60 * 2,
			cursor_secs: 10,
			huddle_secs: 300,
			sfu_secs: 3600,
		}
	}
}

/// State-store failures. Ephemeral reads degrade to empty at the call
/// sites; writes that would lose user-visible state surface as error
/// frames.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("state store unavailable: {0}")]
	Unavailable(String),

	#[error("state store operation timed out")]
	Timeout,
}

impl From<redis::RedisError> for StoreError {
	fn from(e: redis::RedisError) -> Self {
		StoreError::Unavailable(e.to_string())
	}
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One write in an atomic [`StateStore::pipeline`] batch.
#[derive(Debug, Clone)]
pub enum StoreOp {
	Delete(String),
	HashDel(String, String),
	Expire(String, u64),
}

/// Typed operations over the shared fast store. Backed by Redis in
/// production; the in-memory backend serves tests and single-process
/// deployments.
#[derive(Clone)]
pub struct StateStore {
	backend: Arc<Backend>,
}

enum Backend {
	Redis(Mutex<redis::aio::ConnectionManager>),
	Memory(Mutex<MemoryState>),
}

async fn with_timeout<T, F>(fut: F) -> StoreResult<T>
where
	F: Future<Output = Result<T, redis::RedisError>>,
{
	match tokio::time::timeout(STORE_OP_TIMEOUT, fut).await {
		Ok(res) => res.map_err(StoreError::from),
		Err(_) => Err(StoreError::Timeout),
	}
}

impl StateStore {
	pub async fn connect_redis(url: &str) -> StoreResult<Self> {
		let client = redis::Client::open(url)?;
		let manager = redis::aio::ConnectionManager::new(client).await?;
		Ok(Self {
			backend: Arc::new(Backend::Redis(Mutex::new(manager))),
		})
	}

	pub fn in_memory() -> Self {
		Self {
			backend: Arc::new(Backend::Memory(Mutex::new(MemoryState::default()))),
		}
	}

	/// Round-trip probe for the readiness endpoint.
	pub async fn ping(&self) -> StoreResult<()> {
		match &*self.backend {
			Backend::Redis(conn) => {
				let mut conn = conn.lock().await;
				with_timeout(redis::cmd("PING").query_async::<String>(&mut *conn))
					.await
					.map(|_| ())
			}
			Backend::Memory(_) => Ok(()),
		}
	}

	/// Add `member` to a set and refresh the key TTL, atomically.
	pub async fn set_add(&self, key: &str, member: i64, ttl_secs: u64) -> StoreResult<()> {
		match &*self.backend {
			Backend::Redis(conn) => {
				let mut conn = conn.lock().await;
				with_timeout(async {
					redis::pipe()
						.atomic()
						.sadd(key, member)
						.ignore()
						.expire(key, ttl_secs as i64)
						.ignore()
						.query_async::<()>(&mut *conn)
						.await
				})
				.await
			}
			Backend::Memory(state) => {
				let mut st = state.lock().await;
				st.purge(key);
				st.sets.entry(key.to_string()).or_default().insert(member);
				st.touch(key, ttl_secs);
				Ok(())
			}
		}
	}

	pub async fn set_remove(&self, key: &str, member: i64) -> StoreResult<()> {
		match &*self.backend {
			Backend::Redis(conn) => {
				let mut conn = conn.lock().await;
				with_timeout(conn.srem(key, member)).await
			}
			Backend::Memory(state) => {
				let mut st = state.lock().await;
				st.purge(key);
				if let Some(set) = st.sets.get_mut(key) {
					set.remove(&member);
				}
				Ok(())
			}
		}
	}

	pub async fn set_members(&self, key: &str) -> StoreResult<Vec<i64>> {
		match &*self.backend {
			Backend::Redis(conn) => {
				let mut conn = conn.lock().await;
				with_timeout(conn.smembers(key)).await
			}
			Backend::Memory(state) => {
				let mut st = state.lock().await;
				st.purge(key);
				let mut members: Vec<i64> = st.sets.get(key).map(|s| s.iter().copied().collect()).unwrap_or_default();
				members.sort_unstable();
				Ok(members)
			}
		}
	}

	pub async fn set_is_member(&self, key: &str, member: i64) -> StoreResult<bool> {
		match &*self.backend {
			Backend::Redis(conn) => {
				let mut conn = conn.lock().await;
				with_timeout(conn.sismember(key, member)).await
			}
			Backend::Memory(state) => {
				let mut st = state.lock().await;
				st.purge(key);
				Ok(st.sets.get(key).is_some_and(|s| s.contains(&member)))
			}
		}
	}

	/// Write one hash field and refresh the key TTL, atomically.
	pub async fn hash_put(&self, key: &str, field: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
		match &*self.backend {
			Backend::Redis(conn) => {
				let mut conn = conn.lock().await;
				with_timeout(async {
					redis::pipe()
						.atomic()
						.hset(key, field, value)
						.ignore()
						.expire(key, ttl_secs as i64)
						.ignore()
						.query_async::<()>(&mut *conn)
						.await
				})
				.await
			}
			Backend::Memory(state) => {
				let mut st = state.lock().await;
				st.purge(key);
				st.hashes
					.entry(key.to_string())
					.or_default()
					.insert(field.to_string(), value.to_string());
				st.touch(key, ttl_secs);
				Ok(())
			}
		}
	}

	pub async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
		match &*self.backend {
			Backend::Redis(conn) => {
				let mut conn = conn.lock().await;
				with_timeout(conn.hget(key, field)).await
			}
			Backend::Memory(state) => {
				let mut st = state.lock().await;
				st.purge(key);
				Ok(st.hashes.get(key).and_then(|h| h.get(field)).cloned())
			}
		}
	}

	pub async fn hash_del(&self, key: &str, field: &str) -> StoreResult<()> {
		match &*self.backend {
			Backend::Redis(conn) => {
				let mut conn = conn.lock().await;
				with_timeout(conn.hdel(key, field)).await
			}
			Backend::Memory(state) => {
				let mut st = state.lock().await;
				st.purge(key);
				if let Some(h) = st.hashes.get_mut(key) {
					h.remove(field);
				}
				Ok(())
			}
		}
	}

	pub async fn hash_exists(&self, key: &str, field: &str) -> StoreResult<bool> {
		match &*self.backend {
			Backend::Redis(conn) => {
				let mut conn = conn.lock().await;
				with_timeout(conn.hexists(key, field)).await
			}
			Backend::Memory(state) => {
				let mut st = state.lock().await;
				st.purge(key);
				Ok(st.hashes.get(key).is_some_and(|h| h.contains_key(field)))
			}
		}
	}

	pub async fn hash_values(&self, key: &str) -> StoreResult<Vec<String>> {
		match &*self.backend {
			Backend::Redis(conn) => {
				let mut conn = conn.lock().await;
				with_timeout(conn.hvals(key)).await
			}
			Backend::Memory(state) => {
				let mut st = state.lock().await;
				st.purge(key);
				let mut entries: Vec<(String, String)> = st
					.hashes
					.get(key)
					.map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
					.unwrap_or_default();
				entries.sort();
				Ok(entries.into_iter().map(|(_, v)| v).collect())
			}
		}
	}

	pub async fn hash_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
		match &*self.backend {
			Backend::Redis(conn) => {
				let mut conn = conn.lock().await;
				with_timeout(conn.hgetall(key)).await
			}
			Backend::Memory(state) => {
				let mut st = state.lock().await;
				st.purge(key);
				Ok(st.hashes.get(key).cloned().unwrap_or_default())
			}
		}
	}

	pub async fn kv_set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
		match &*self.backend {
			Backend::Redis(conn) => {
				let mut conn = conn.lock().await;
				with_timeout(conn.set_ex(key, value, ttl_secs)).await
			}
			Backend::Memory(state) => {
				let mut st = state.lock().await;
				st.purge(key);
				st.strings.insert(key.to_string(), value.to_string());
				st.touch(key, ttl_secs);
				Ok(())
			}
		}
	}

	pub async fn kv_get(&self, key: &str) -> StoreResult<Option<String>> {
		match &*self.backend {
			Backend::Redis(conn) => {
				let mut conn = conn.lock().await;
				with_timeout(conn.get(key)).await
			}
			Backend::Memory(state) => {
				let mut st = state.lock().await;
				st.purge(key);
				Ok(st.strings.get(key).cloned())
			}
		}
	}

	pub async fn exists(&self, key: &str) -> StoreResult<bool> {
		match &*self.backend {
			Backend::Redis(conn) => {
				let mut conn = conn.lock().await;
				with_timeout(conn.exists(key)).await
			}
			Backend::Memory(state) => {
				let mut st = state.lock().await;
				st.purge(key);
				Ok(st.sets.contains_key(key) || st.hashes.contains_key(key) || st.strings.contains_key(key))
			}
		}
	}

	pub async fn delete(&self, key: &str) -> StoreResult<()> {
		match &*self.backend {
			Backend::Redis(conn) => {
				let mut conn = conn.lock().await;
				with_timeout(conn.del(key)).await
			}
			Backend::Memory(state) => {
				let mut st = state.lock().await;
				st.remove_key(key);
				Ok(())
			}
		}
	}

	/// Execute a batch of writes atomically.
	pub async fn pipeline(&self, ops: &[StoreOp]) -> StoreResult<()> {
		if ops.is_empty() {
			return Ok(());
		}

		match &*self.backend {
			Backend::Redis(conn) => {
				let mut pipe = redis::pipe();
				pipe.atomic();
				for op in ops {
					match op {
						StoreOp::Delete(key) => {
							pipe.del(key).ignore();
						}
						StoreOp::HashDel(key, field) => {
							pipe.hdel(key, field).ignore();
						}
						StoreOp::Expire(key, ttl_secs) => {
							pipe.expire(key, *ttl_secs as i64).ignore();
						}
					}
				}

				let mut conn = conn.lock().await;
				with_timeout(pipe.query_async::<()>(&mut *conn)).await
			}
			Backend::Memory(state) => {
				let mut st = state.lock().await;
				for op in ops {
					match op {
						StoreOp::Delete(key) => st.remove_key(key),
						StoreOp::HashDel(key, field) => {
							st.purge(key);
							if let Some(h) = st.hashes.get_mut(key.as_str()) {
								h.remove(field.as_str());
							}
						}
						StoreOp::Expire(key, ttl_secs) => {
							st.purge(key);
							st.touch(key, *ttl_secs);
						}
					}
				}
				Ok(())
			}
		}
	}
}

#[derive(Default)]
struct MemoryState {
	sets: HashMap<String, HashSet<i64>>,
	hashes: HashMap<String, HashMap<String, String>>,
	strings: HashMap<String, String>,
	expiries: HashMap<String, Instant>,
}

impl MemoryState {
	fn purge(&mut self, key: &str) {
		if let Some(at) = self.expiries.get(key)
			&& Instant::now() >= *at
		{
			self.remove_key(key);
		}
	}

	fn remove_key(&mut self, key: &str) {
		self.sets.remove(key);
		self.hashes.remove(key);
		self.strings.remove(key);
		self.expiries.remove(key);
	}

	fn touch(&mut self, key: &str, ttl_secs: u64) {
		self.expiries
			.insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
	}
}
