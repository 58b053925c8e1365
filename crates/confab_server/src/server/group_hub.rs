#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use confab_domain::UserId;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, warn};

use crate::server::connection::OutboundFrame;

/// Shared pub/sub channel carrying every cross-process group envelope.
/// Publish order is preserved per publisher, which keeps per-sender FIFO
/// delivery intact across processes.
const GROUPS_CHANNEL: &str = "confab:groups";

/// Configuration for `GroupHub`.
#[derive(Debug, Clone, Default)]
pub struct GroupHubConfig {
	pub debug_logs: bool,
}

/// Outbound handle registered for one connection in one group. The
/// `overflow` side-channel tells the connection to drop itself when its
/// queue saturates; blocking the fan-out path is never an option.
#[derive(Clone)]
pub struct GroupMember {
	pub conn_id: u64,
	pub user_id: UserId,
	pub tx: mpsc::Sender<OutboundFrame>,
	pub overflow: Arc<Notify>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupEnvelope {
	group: String,
	#[serde(default)]
	exclude_user_id: Option<i64>,
	payload: String,
}

/// Named-group fan-out hub. Connections join groups; `group_send`
/// delivers an envelope once to every current member, in any process when
/// the Redis publisher is configured.
#[derive(Clone)]
pub struct GroupHub {
	inner: Arc<Mutex<Inner>>,
	publisher: Arc<Publisher>,
	cfg: GroupHubConfig,
}

enum Publisher {
	Local,
	Redis(Mutex<redis::aio::ConnectionManager>),
}

#[derive(Default)]
struct Inner {
	groups: HashMap<String, Vec<GroupMember>>,
}

impl GroupHub {
	/// In-process hub; delivery stays within this process.
	pub fn local(cfg: GroupHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			publisher: Arc::new(Publisher::Local),
			cfg,
		}
	}

	/// Hub publishing through Redis pub/sub, with a background dispatcher
	/// feeding locally connected members.
	pub async fn with_redis(cfg: GroupHubConfig, url: &str) -> anyhow::Result<Self> {
		let client = redis::Client::open(url)?;
		let manager = redis::aio::ConnectionManager::new(client.clone()).await?;

		let hub = Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			publisher: Arc::new(Publisher::Redis(Mutex::new(manager))),
			cfg,
		};

		spawn_group_dispatcher(hub.clone(), client);
		Ok(hub)
	}

	/// Join a group. Re-joining replaces the previous registration for the
	/// same connection.
	pub async fn group_add(&self, group: &str, member: GroupMember) {
		let mut inner = self.inner.lock().await;
		let entry = inner.groups.entry(group.to_string()).or_default();

		prune_closed_members(entry);
		entry.retain(|m| m.conn_id != member.conn_id);
		entry.push(member);

		if self.cfg.debug_logs {
			debug!(group, members = entry.len(), "group hub: joined");
		}
	}

	/// Leave a group. Unknown group/connection pairs are a no-op.
	pub async fn group_discard(&self, group: &str, conn_id: u64) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.groups.get_mut(group) {
			entry.retain(|m| m.conn_id != conn_id && !m.tx.is_closed());
			if entry.is_empty() {
				inner.groups.remove(group);
			}
		}
	}

	/// Deliver `payload` once to every connection currently in `group`.
	pub async fn group_send(&self, group: &str, payload: &str) {
		self.group_send_excluding(group, payload, None).await;
	}

	/// Same as [`GroupHub::group_send`], skipping every connection owned by
	/// `exclude_user`.
	pub async fn group_send_excluding(&self, group: &str, payload: &str, exclude_user: Option<UserId>) {
		match &*self.publisher {
			Publisher::Local => self.dispatch_local(group, payload, exclude_user).await,
			Publisher::Redis(conn) => {
				let envelope = GroupEnvelope {
					group: group.to_string(),
					exclude_user_id: exclude_user.map(UserId::as_i64),
					payload: payload.to_string(),
				};
				let raw = serde_json::to_string(&envelope).expect("group envelope is always serializable");

				let mut conn = conn.lock().await;
				if let Err(e) = redis::cmd("PUBLISH")
					.arg(GROUPS_CHANNEL)
					.arg(raw)
					.query_async::<()>(&mut *conn)
					.await
				{
					metrics::counter!("confab_server_group_publish_errors_total").increment(1);
					warn!(group, error = %e, "group hub: publish failed");
				}
			}
		}
	}

	/// Fan a payload out to local members. The Redis dispatcher calls this
	/// for every envelope observed on the shared channel.
	pub(crate) async fn dispatch_local(&self, group: &str, payload: &str, exclude_user: Option<UserId>) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.groups.get_mut(group) else {
			return;
		};

		prune_closed_members(entry);

		let frame: Arc<str> = Arc::from(payload);
		let mut overflowed = false;

		entry.retain(|member| {
			if exclude_user.is_some_and(|u| u == member.user_id) {
				return true;
			}

			match member.tx.try_send(OutboundFrame::Text(Arc::clone(&frame))) {
				Ok(()) => true,
				Err(mpsc::error::TrySendError::Full(_)) => {
					metrics::counter!("confab_server_group_send_dropped_total").increment(1);
					member.overflow.notify_one();
					overflowed = true;
					false
				}
				Err(mpsc::error::TrySendError::Closed(_)) => false,
			}
		});

		if overflowed && self.cfg.debug_logs {
			debug!(group, "group hub: member queue saturated, connection dropped");
		}

		if entry.is_empty() {
			inner.groups.remove(group);
		}
	}

	/// Snapshot of live member counts (diagnostics and tests).
	pub async fn member_count(&self, group: &str) -> usize {
		let inner = self.inner.lock().await;
		inner
			.groups
			.get(group)
			.map(|entry| entry.iter().filter(|m| !m.tx.is_closed()).count())
			.unwrap_or(0)
	}
}

fn prune_closed_members(entry: &mut Vec<GroupMember>) {
	entry.retain(|m| !m.tx.is_closed());
}

fn spawn_group_dispatcher(hub: GroupHub, client: redis::Client) {
	tokio::spawn(async move {
		if let Err(e) = run_group_dispatcher(hub, client).await {
			warn!(error = %e, "group dispatcher stopped");
		}
	});
}

async fn run_group_dispatcher(hub: GroupHub, client: redis::Client) -> anyhow::Result<()> {
	let mut pubsub = client.get_async_pubsub().await?;
	pubsub.subscribe(GROUPS_CHANNEL).await?;

	let mut stream = pubsub.on_message();
	while let Some(msg) = stream.next().await {
		let raw: String = match msg.get_payload() {
			Ok(raw) => raw,
			Err(e) => {
				warn!(error = %e, "group dispatcher: unreadable message");
				continue;
			}
		};

		match serde_json::from_str::<GroupEnvelope>(&raw) {
			Ok(envelope) => {
				hub.dispatch_local(&envelope.group, &envelope.payload, envelope.exclude_user_id.map(UserId))
					.await;
			}
			Err(e) => warn!(error = %e, "group dispatcher: malformed envelope"),
		}
	}

	Ok(())
}
