#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Context as _;
use confab_domain::{Group, RoomId, UserId};
use confab_protocol::{
	ChatEvent, ClientEvent, ErrorCode, GlobalEvent, PresenceAction, ServerEvent, UserSnapshot, WS_ENDPOINT_PATH, decode,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::server::ServerContext;
use crate::server::group_hub::GroupMember;
use crate::server::presence;
use crate::util::time::unix_ms_now;

/// Close code for a bad or expired auth token.
pub const CLOSE_BAD_TOKEN: u16 = 4001;
/// Close code for an idle-reaped connection.
pub const CLOSE_IDLE: u16 = 4002;
/// Close code when the peer cannot keep up with its outbound queue.
pub const CLOSE_OVERLOADED: u16 = 1011;

/// Queue depth for one connection's outbound channel. A saturated queue
/// drops the connection rather than stalling fan-out.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Frame handed to the connection's writer task.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
	Text(Arc<str>),
	Close { code: u16, reason: String },
}

enum ControlSignal {
	IdleReap,
}

/// Outcome of handling one inbound frame.
#[derive(Debug)]
pub(crate) enum Flow {
	Continue,
	Close { code: u16, reason: String },
}

/// Per-connection state machine: `AwaitAuth` until a valid `auth` frame,
/// then `Ready` with two background tasks (idle reaper, presence
/// refresher) owned by the session and joined on teardown.
pub(crate) struct Session {
	pub(crate) conn_id: u64,
	pub(crate) ctx: Arc<ServerContext>,
	pub(crate) out_tx: mpsc::Sender<OutboundFrame>,
	pub(crate) overflow: Arc<Notify>,
	last_activity_ms: Arc<AtomicI64>,
	pub(crate) user: Option<UserSnapshot>,
	pub(crate) subscribed_rooms: Arc<Mutex<HashSet<RoomId>>>,
	pub(crate) active_huddle: Option<RoomId>,
	background: Vec<JoinHandle<()>>,
	ctl_tx: mpsc::Sender<ControlSignal>,
	torn_down: bool,
}

impl Session {
	fn new(
		conn_id: u64,
		ctx: Arc<ServerContext>,
		out_tx: mpsc::Sender<OutboundFrame>,
		overflow: Arc<Notify>,
		ctl_tx: mpsc::Sender<ControlSignal>,
	) -> Self {
		Self {
			conn_id,
			ctx,
			out_tx,
			overflow,
			last_activity_ms: Arc::new(AtomicI64::new(unix_ms_now())),
			user: None,
			subscribed_rooms: Arc::new(Mutex::new(HashSet::new())),
			active_huddle: None,
			background: Vec::new(),
			ctl_tx,
			torn_down: false,
		}
	}

	#[cfg(test)]
	pub(crate) fn for_tests(conn_id: u64, ctx: Arc<ServerContext>, out_tx: mpsc::Sender<OutboundFrame>) -> Self {
		// Control channel is unused; tests drive `on_text` directly.
		let (ctl_tx, _ctl_rx) = mpsc::channel(4);
		Self::new(conn_id, ctx, out_tx, Arc::new(Notify::new()), ctl_tx)
	}

	pub(crate) async fn send_event(&self, event: &ServerEvent) {
		let frame: Arc<str> = Arc::from(event.encode());
		if self.out_tx.send(OutboundFrame::Text(frame)).await.is_err() {
			debug!(conn_id = self.conn_id, "outbound channel closed, dropping frame");
		}
	}

	pub(crate) async fn send_error(&self, code: ErrorCode, message: impl Into<String>) {
		metrics::counter!("confab_server_error_frames_total").increment(1);
		self.send_event(&ServerEvent::error(code, message)).await;
	}

	pub(crate) async fn broadcast(&self, group: &str, event: &ServerEvent) {
		self.ctx.hub.group_send(group, &event.encode()).await;
	}

	pub(crate) async fn broadcast_excluding(&self, group: &str, event: &ServerEvent, exclude: Option<UserId>) {
		self.ctx.hub.group_send_excluding(group, &event.encode(), exclude).await;
	}

	pub(crate) async fn is_subscribed(&self, room_id: RoomId) -> bool {
		self.subscribed_rooms.lock().await.contains(&room_id)
	}

	fn ticket(&self, user_id: UserId) -> GroupMember {
		GroupMember {
			conn_id: self.conn_id,
			user_id,
			tx: self.out_tx.clone(),
			overflow: Arc::clone(&self.overflow),
		}
	}

	/// Handle one inbound text frame.
	pub(crate) async fn on_text(&mut self, text: &str) -> Flow {
		let decoded = decode(text);

		// `ping` is a protocol-level probe and must not reset the idle
		// clock; everything else counts as real traffic.
		if !matches!(decoded, Ok(ClientEvent::Ping { .. })) {
			self.last_activity_ms.store(unix_ms_now(), Ordering::Relaxed);
		}

		let event = match decoded {
			Ok(event) => event,
			Err(e) => {
				metrics::counter!("confab_server_decode_errors_total").increment(1);
				self.send_error(ErrorCode::InvalidEvent, e.to_string()).await;
				return Flow::Continue;
			}
		};

		if self.user.is_none() {
			return match event {
				ClientEvent::Auth { token } => self.on_auth(&token).await,
				_ => {
					self.send_error(ErrorCode::AuthRequired, "authenticate first").await;
					Flow::Continue
				}
			};
		}

		if let Some(user) = self.user.clone() {
			self.dispatch_ready(&user, event).await;
		}
		Flow::Continue
	}

	async fn on_auth(&mut self, token: &str) -> Flow {
		match self.ctx.verifier.verify(token).await {
			Ok(user) => {
				metrics::counter!("confab_server_auth_success_total").increment(1);
				info!(conn_id = self.conn_id, user_id = user.id.as_i64(), "authenticated");

				self.user = Some(user.clone());
				self.ctx.hub.group_add(&Group::user(user.id), self.ticket(user.id)).await;
				self.ctx.hub.group_add(Group::GLOBAL_PRESENCE, self.ticket(user.id)).await;

				let online_users = match presence::add_online(&self.ctx.store, &self.ctx.settings.ttls, user.id).await {
					Ok(online) => online,
					Err(e) => {
						warn!(conn_id = self.conn_id, error = %e, "global presence write failed");
						vec![user.id]
					}
				};

				self.send_event(&ServerEvent::AuthSuccess {
					user: user.clone(),
					online_users,
				})
				.await;
				self.broadcast_excluding(
					Group::GLOBAL_PRESENCE,
					&ServerEvent::UserOnline { user_id: user.id },
					Some(user.id),
				)
				.await;

				self.spawn_background_tasks(&user);
				Flow::Continue
			}
			Err(e) => {
				metrics::counter!("confab_server_auth_failures_total").increment(1);
				warn!(conn_id = self.conn_id, error = %e, "auth rejected");
				self.send_event(&ServerEvent::AuthError { message: e.to_string() }).await;
				Flow::Close {
					code: CLOSE_BAD_TOKEN,
					reason: "authentication failed".to_string(),
				}
			}
		}
	}

	async fn dispatch_ready(&mut self, user: &UserSnapshot, event: ClientEvent) {
		match event {
			ClientEvent::Auth { .. } => {
				debug!(conn_id = self.conn_id, "ignoring duplicate auth");
			}
			ClientEvent::Ping { .. } => {
				self.send_event(&ServerEvent::Pong { timestamp: unix_ms_now() }).await;
			}
			ClientEvent::PresenceHeartbeat => self.handle_heartbeat(user).await,
			ClientEvent::Global(GlobalEvent::Refresh) => {
				let online_users = presence::online_users(&self.ctx.store).await.unwrap_or_default();
				self.send_event(&ServerEvent::OnlineUsers { online_users }).await;
			}
			ClientEvent::Chat(event) => self.dispatch_chat(user, event).await,
			ClientEvent::Huddle(event) => self.dispatch_huddle(user, event).await,
		}
	}

	async fn dispatch_chat(&mut self, user: &UserSnapshot, event: ChatEvent) {
		match event {
			ChatEvent::Subscribe { room_id } => self.handle_subscribe(user, room_id).await,
			ChatEvent::Unsubscribe { room_id } => self.handle_unsubscribe(user, room_id).await,
			ChatEvent::SendMessage {
				room_id,
				content,
				client_id,
				attachment,
				attachment_type,
			} => {
				self.handle_send_message(user, room_id, &content, client_id, attachment, attachment_type)
					.await;
			}
			ChatEvent::EditMessage {
				room_id,
				message_id,
				content,
			} => self.handle_edit_message(user, room_id, message_id, &content).await,
			ChatEvent::DeleteMessage { room_id, message_id } => {
				self.handle_delete_message(user, room_id, message_id).await;
			}
			ChatEvent::Typing { room_id, is_typing } => self.handle_typing(user, room_id, is_typing).await,
			ChatEvent::CollabUpdate { room_id, content } => self.handle_collab_update(user, room_id, &content).await,
			ChatEvent::CursorUpdate { room_id, cursor } => self.handle_cursor_update(user, room_id, cursor).await,
			ChatEvent::MarkRead { room_id, message_id } => self.handle_mark_read(user, room_id, message_id).await,
		}
	}

	async fn handle_heartbeat(&self, user: &UserSnapshot) {
		let store = &self.ctx.store;
		let ttls = &self.ctx.settings.ttls;

		if let Err(e) = presence::refresh_online(store, ttls, user.id).await {
			warn!(conn_id = self.conn_id, error = %e, "heartbeat: global refresh failed");
			self.send_error(ErrorCode::StoreUnavailable, "presence refresh failed").await;
			return;
		}

		let rooms: Vec<RoomId> = { self.subscribed_rooms.lock().await.iter().copied().collect() };
		for room_id in rooms {
			if let Err(e) = presence::refresh_room_presence(store, ttls, room_id, user).await {
				warn!(conn_id = self.conn_id, room_id = room_id.as_i64(), error = %e, "heartbeat: room refresh failed");
			}
		}

		self.send_event(&ServerEvent::PresenceAck).await;
	}

	async fn handle_subscribe(&mut self, user: &UserSnapshot, room_id: RoomId) {
		match self.ctx.repo.get_room(room_id).await {
			Ok(Some(_)) => {}
			Ok(None) => {
				self.send_error(ErrorCode::RoomNotFound, format!("room {room_id} does not exist"))
					.await;
				return;
			}
			Err(e) => {
				warn!(conn_id = self.conn_id, error = %e, "room lookup failed");
				self.send_error(ErrorCode::StoreUnavailable, "room lookup failed").await;
				return;
			}
		}

		match self.ctx.repo.is_participant(room_id, user.id).await {
			Ok(true) => {}
			Ok(false) => {
				self.send_error(ErrorCode::NotParticipant, format!("not a participant of room {room_id}"))
					.await;
				return;
			}
			Err(e) => {
				warn!(conn_id = self.conn_id, error = %e, "participant lookup failed");
				self.send_error(ErrorCode::StoreUnavailable, "participant lookup failed").await;
				return;
			}
		}

		let presence_payload = match presence::mark_presence(
			&self.ctx.store,
			&self.ctx.settings.ttls,
			room_id,
			user,
			self.ctx.settings.presence_roster_cap,
		)
		.await
		{
			Ok(payload) => payload,
			Err(e) => {
				warn!(conn_id = self.conn_id, room_id = room_id.as_i64(), error = %e, "presence write failed");
				self.send_error(ErrorCode::StoreUnavailable, "presence write failed").await;
				return;
			}
		};

		let group = Group::room(room_id);
		self.ctx.hub.group_add(&group, self.ticket(user.id)).await;

		metrics::counter!("confab_server_subscribes_total").increment(1);
		self.send_event(&ServerEvent::Subscribed {
			room_id,
			presence: presence_payload,
		})
		.await;

		// Initial snapshots for whatever ephemeral state already exists.
		// Reads degrade to absent; the client simply starts from scratch.
		match presence::note_state(&self.ctx.store, room_id).await {
			Ok(Some(content)) => self.send_event(&ServerEvent::CollabState { room_id, content }).await,
			Ok(None) => {}
			Err(e) => warn!(conn_id = self.conn_id, error = %e, "note snapshot read failed"),
		}
		match presence::cursor_state(&self.ctx.store, room_id).await {
			Ok(cursors) if !cursors.is_empty() => self.send_event(&ServerEvent::CursorState { room_id, cursors }).await,
			Ok(_) => {}
			Err(e) => warn!(conn_id = self.conn_id, error = %e, "cursor snapshot read failed"),
		}
		match presence::huddle_roster(&self.ctx.store, room_id).await {
			Ok(participants) if !participants.is_empty() => {
				self.send_event(&ServerEvent::HuddleParticipants { room_id, participants }).await;
			}
			Ok(_) => {}
			Err(e) => warn!(conn_id = self.conn_id, error = %e, "huddle snapshot read failed"),
		}

		self.broadcast(
			&group,
			&ServerEvent::PresenceUpdate {
				room_id,
				action: PresenceAction::Join,
				user: user.clone(),
			},
		)
		.await;

		self.subscribed_rooms.lock().await.insert(room_id);
	}

	async fn handle_unsubscribe(&mut self, user: &UserSnapshot, room_id: RoomId) {
		let was_subscribed = { self.subscribed_rooms.lock().await.remove(&room_id) };

		if was_subscribed {
			if self.active_huddle == Some(room_id) {
				self.leave_huddle(user).await;
			}
			self.leave_room(user, room_id).await;
		}

		self.send_event(&ServerEvent::Unsubscribed { room_id }).await;
	}

	async fn handle_typing(&self, user: &UserSnapshot, room_id: RoomId, is_typing: bool) {
		if !self.is_subscribed(room_id).await {
			self.send_error(ErrorCode::NotParticipant, format!("not subscribed to room {room_id}"))
				.await;
			return;
		}

		if let Err(e) = presence::set_typing(&self.ctx.store, &self.ctx.settings.ttls, room_id, user.id, is_typing).await {
			warn!(conn_id = self.conn_id, error = %e, "typing write failed");
		}

		self.broadcast(
			&Group::room(room_id),
			&ServerEvent::TypingStatus {
				room_id,
				user_id: user.id,
				is_typing,
			},
		)
		.await;
	}

	async fn handle_collab_update(&self, user: &UserSnapshot, room_id: RoomId, content: &str) {
		if !self.is_subscribed(room_id).await {
			self.send_error(ErrorCode::NotParticipant, format!("not subscribed to room {room_id}"))
				.await;
			return;
		}

		// Unchanged content is a no-op, saving a write and a broadcast.
		match presence::note_state(&self.ctx.store, room_id).await {
			Ok(Some(current)) if current == content => return,
			Ok(_) => {}
			Err(e) => warn!(conn_id = self.conn_id, error = %e, "note read failed"),
		}

		if let Err(e) = presence::set_note(&self.ctx.store, &self.ctx.settings.ttls, room_id, content).await {
			warn!(conn_id = self.conn_id, error = %e, "note write failed");
			self.send_error(ErrorCode::StoreUnavailable, "collab note write failed").await;
			return;
		}

		self.broadcast(
			&Group::room(room_id),
			&ServerEvent::CollabUpdate {
				room_id,
				content: content.to_string(),
				user: user.clone(),
			},
		)
		.await;
	}

	async fn handle_cursor_update(&self, user: &UserSnapshot, room_id: RoomId, cursor: serde_json::Value) {
		if !self.is_subscribed(room_id).await {
			self.send_error(ErrorCode::NotParticipant, format!("not subscribed to room {room_id}"))
				.await;
			return;
		}

		if let Err(e) = presence::set_cursor(&self.ctx.store, &self.ctx.settings.ttls, room_id, user.id, &cursor).await {
			warn!(conn_id = self.conn_id, error = %e, "cursor write failed");
		}

		self.broadcast(
			&Group::room(room_id),
			&ServerEvent::CursorUpdate {
				room_id,
				cursor,
				user: user.clone(),
			},
		)
		.await;
	}

	/// Leave one room: drop presence, clear typing, leave the group, and
	/// broadcast a leave only when a presence entry was actually removed.
	async fn leave_room(&self, user: &UserSnapshot, room_id: RoomId) {
		let group = Group::room(room_id);

		let removed = match presence::remove_presence(&self.ctx.store, room_id, user.id).await {
			Ok(removed) => removed.is_some(),
			Err(e) => {
				warn!(conn_id = self.conn_id, room_id = room_id.as_i64(), error = %e, "presence removal failed");
				false
			}
		};

		if let Err(e) = presence::clear_typing(&self.ctx.store, room_id, user.id).await {
			warn!(conn_id = self.conn_id, room_id = room_id.as_i64(), error = %e, "typing cleanup failed");
		}

		self.ctx.hub.group_discard(&group, self.conn_id).await;

		if removed {
			self.broadcast(
				&group,
				&ServerEvent::PresenceUpdate {
					room_id,
					action: PresenceAction::Leave,
					user: user.clone(),
				},
			)
			.await;
		}
	}

	fn spawn_background_tasks(&mut self, user: &UserSnapshot) {
		let heartbeat = self.ctx.settings.heartbeat_interval;
		let last_activity = Arc::clone(&self.last_activity_ms);
		let ctl_tx = self.ctl_tx.clone();
		let conn_id = self.conn_id;

		let reaper = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(heartbeat);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			ticker.tick().await;

			loop {
				ticker.tick().await;
				let idle_ms = unix_ms_now().saturating_sub(last_activity.load(Ordering::Relaxed));
				if idle_ms > heartbeat.as_millis() as i64 * 3 {
					metrics::counter!("confab_server_idle_reaped_total").increment(1);
					debug!(conn_id, idle_ms, "idle connection, requesting reap");
					let _ = ctl_tx.send(ControlSignal::IdleReap).await;
					return;
				}
			}
		});

		let store = self.ctx.store.clone();
		let ttls = self.ctx.settings.ttls.clone();
		let rooms = Arc::clone(&self.subscribed_rooms);
		let refresh_every = self.ctx.settings.presence_refresh_interval;
		let user = user.clone();

		let refresher = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(refresh_every);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			ticker.tick().await;

			loop {
				ticker.tick().await;

				if let Err(e) = presence::refresh_online(&store, &ttls, user.id).await {
					warn!(conn_id, error = %e, "presence refresher: global refresh failed");
				}

				let rooms_now: Vec<RoomId> = { rooms.lock().await.iter().copied().collect() };
				for room_id in rooms_now {
					if let Err(e) = presence::refresh_room_presence(&store, &ttls, room_id, &user).await {
						warn!(conn_id, room_id = room_id.as_i64(), error = %e, "presence refresher: room refresh failed");
					}
				}
			}
		});

		self.background.push(reaper);
		self.background.push(refresher);
	}

	/// Idempotent teardown: cancel background tasks, leave every room and
	/// any huddle, drop global presence, discard groups. Steps run
	/// independently; one failure never skips the rest.
	pub(crate) async fn teardown(&mut self) {
		if self.torn_down {
			return;
		}
		self.torn_down = true;

		for handle in self.background.drain(..) {
			handle.abort();
			let _ = handle.await;
		}

		let Some(user) = self.user.clone() else {
			return;
		};

		let rooms: Vec<RoomId> = {
			let mut subscribed = self.subscribed_rooms.lock().await;
			subscribed.drain().collect()
		};
		for room_id in rooms {
			self.leave_room(&user, room_id).await;
		}

		self.leave_huddle(&user).await;

		if let Err(e) = presence::remove_online(&self.ctx.store, user.id).await {
			warn!(conn_id = self.conn_id, error = %e, "global presence removal failed");
		}

		self.broadcast_excluding(
			Group::GLOBAL_PRESENCE,
			&ServerEvent::UserOffline { user_id: user.id },
			Some(user.id),
		)
		.await;

		self.ctx.hub.group_discard(&Group::user(user.id), self.conn_id).await;
		self.ctx.hub.group_discard(Group::GLOBAL_PRESENCE, self.conn_id).await;
	}
}

/// Accept one WebSocket connection on `/ws/stream/` and run its session
/// until the peer disconnects, the reaper fires, or the outbound queue
/// saturates.
pub async fn handle_connection(conn_id: u64, stream: TcpStream, ctx: Arc<ServerContext>) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("confab_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("confab_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
		let path = req.uri().path();
		if path == WS_ENDPOINT_PATH || path == WS_ENDPOINT_PATH.trim_end_matches('/') {
			Ok(resp)
		} else {
			let mut response = ErrorResponse::new(Some("not found".to_string()));
			*response.status_mut() = StatusCode::NOT_FOUND;
			Err(response)
		}
	})
	.await
	.context("websocket handshake")?;

	let (mut sink, mut stream) = ws.split();
	let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_QUEUE_CAPACITY);

	let writer = tokio::spawn(async move {
		while let Some(frame) = out_rx.recv().await {
			match frame {
				OutboundFrame::Text(text) => {
					metrics::counter!("confab_server_frames_out_total").increment(1);
					if sink.send(Message::text(text.as_ref())).await.is_err() {
						break;
					}
				}
				OutboundFrame::Close { code, reason } => {
					let _ = sink
						.send(Message::Close(Some(CloseFrame {
							code: CloseCode::from(code),
							reason: reason.into(),
						})))
						.await;
					break;
				}
			}
		}
		let _ = sink.close().await;
	});

	let overflow = Arc::new(Notify::new());
	let (ctl_tx, mut ctl_rx) = mpsc::channel::<ControlSignal>(4);
	let mut session = Session::new(conn_id, ctx, out_tx.clone(), Arc::clone(&overflow), ctl_tx);

	session.send_event(&ServerEvent::AuthRequired).await;

	let mut close_request: Option<(u16, String)> = None;

	loop {
		tokio::select! {
			inbound = stream.next() => match inbound {
				Some(Ok(Message::Text(text))) => {
					metrics::counter!("confab_server_frames_in_total").increment(1);
					match session.on_text(text.as_str()).await {
						Flow::Continue => {}
						Flow::Close { code, reason } => {
							close_request = Some((code, reason));
							break;
						}
					}
				}
				Some(Ok(Message::Close(_))) | None => {
					debug!(conn_id, "peer closed");
					break;
				}
				Some(Ok(_)) => {}
				Some(Err(e)) => {
					debug!(conn_id, error = %e, "socket error");
					break;
				}
			},
			_ = overflow.notified() => {
				warn!(conn_id, "outbound queue saturated, dropping connection");
				close_request = Some((CLOSE_OVERLOADED, "overloaded".to_string()));
				break;
			}
			Some(signal) = ctl_rx.recv() => match signal {
				ControlSignal::IdleReap => {
					info!(conn_id, "closing idle connection");
					close_request = Some((CLOSE_IDLE, "idle timeout".to_string()));
					break;
				}
			},
		}
	}

	session.teardown().await;

	if let Some((code, reason)) = close_request {
		let _ = out_tx.send(OutboundFrame::Close { code, reason }).await;
	}

	drop(session);
	drop(out_tx);
	let _ = writer.await;

	Ok(())
}
