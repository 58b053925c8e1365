#![forbid(unsafe_code)]

use confab_domain::{Group, RoomId, UserId};
use confab_protocol::{ErrorCode, HuddleEvent, HuddleParticipant, ServerEvent, UserSnapshot};
use confab_sfu::{RemoteTrackRequest, SfuClient};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::server::connection::Session;
use crate::server::presence;
use crate::server::store::{StoreOp, keys};

/// Huddles escalate from P2P mesh to the SFU at this roster size.
pub(crate) const SFU_PARTICIPANT_THRESHOLD: usize = 3;

/// What the gateway does about the SFU after a huddle join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpgradeAction {
	/// Stay on the P2P mesh.
	Stay,
	/// First crossing of the threshold: flag the room and tell everyone.
	BroadcastUpgrade,
	/// Room is already on the SFU: only the new joiner needs to hear it.
	NotifyJoiner,
}

pub(crate) fn upgrade_action(roster_len: usize, sfu_active: bool, sfu_configured: bool) -> UpgradeAction {
	if !sfu_configured {
		return UpgradeAction::Stay;
	}
	if sfu_active {
		return UpgradeAction::NotifyJoiner;
	}
	if roster_len >= SFU_PARTICIPANT_THRESHOLD {
		UpgradeAction::BroadcastUpgrade
	} else {
		UpgradeAction::Stay
	}
}

/// Track registry entry in `chat:huddle:{room}:sfu_tracks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SfuTrackInfo {
	pub user_id: i64,
	pub track_name: String,
	pub track_id: Option<String>,
	pub session_id: String,
}

impl Session {
	pub(crate) async fn dispatch_huddle(&mut self, user: &UserSnapshot, event: HuddleEvent) {
		match event {
			HuddleEvent::Join { room_id } => self.handle_huddle_join(user, room_id).await,
			HuddleEvent::Leave => self.leave_huddle(user).await,
			HuddleEvent::Signal { target_id, payload } => self.handle_signal(user, target_id, payload).await,
			HuddleEvent::SfuPublish { track_name, sdp_offer } => {
				self.handle_sfu_publish(user, &track_name, &sdp_offer).await;
			}
			HuddleEvent::SfuSubscribe => self.handle_sfu_subscribe(user).await,
			HuddleEvent::SfuRenegotiate { sdp_answer } => self.handle_sfu_renegotiate(user, &sdp_answer).await,
		}
	}

	async fn handle_huddle_join(&mut self, user: &UserSnapshot, room_id: RoomId) {
		if !self.is_subscribed(room_id).await {
			self.send_error(ErrorCode::NotParticipant, format!("not subscribed to room {room_id}"))
				.await;
			return;
		}

		let participant = HuddleParticipant {
			id: user.id,
			name: user.name.clone(),
			avatar: user.avatar.clone(),
		};
		let raw = serde_json::to_string(&participant).expect("huddle entry is always serializable");

		if let Err(e) = self
			.ctx
			.store
			.hash_put(
				&keys::huddle(room_id),
				&user.id.to_string(),
				&raw,
				self.ctx.settings.ttls.huddle_secs,
			)
			.await
		{
			warn!(conn_id = self.conn_id, room_id = room_id.as_i64(), error = %e, "huddle join write failed");
			self.send_error(ErrorCode::StoreUnavailable, "huddle join failed").await;
			return;
		}

		self.active_huddle = Some(room_id);

		let roster = presence::huddle_roster(&self.ctx.store, room_id).await.unwrap_or_default();
		let group = Group::room(room_id);
		self.broadcast(
			&group,
			&ServerEvent::HuddleParticipants {
				room_id,
				participants: roster.clone(),
			},
		)
		.await;

		let sfu_active = self.ctx.store.exists(&keys::sfu_active(room_id)).await.unwrap_or(false);
		match upgrade_action(roster.len(), sfu_active, self.ctx.sfu.is_some()) {
			UpgradeAction::Stay => {}
			UpgradeAction::BroadcastUpgrade => {
				match self
					.ctx
					.store
					.kv_set_ex(&keys::sfu_active(room_id), "1", self.ctx.settings.ttls.sfu_secs)
					.await
				{
					Ok(()) => {
						metrics::counter!("confab_server_sfu_upgrades_total").increment(1);
						self.broadcast(&group, &ServerEvent::SfuUpgrade { room_id }).await;
					}
					Err(e) => {
						warn!(conn_id = self.conn_id, room_id = room_id.as_i64(), error = %e, "sfu flag write failed")
					}
				}
			}
			UpgradeAction::NotifyJoiner => self.send_event(&ServerEvent::SfuUpgrade { room_id }).await,
		}
	}

	/// Leave the active huddle, if any: drop the roster entry, broadcast
	/// the new roster, and release this user's SFU state. The last leaver
	/// clears every SFU key for the room.
	pub(crate) async fn leave_huddle(&mut self, user: &UserSnapshot) {
		let Some(room_id) = self.active_huddle.take() else {
			return;
		};

		if let Err(e) = self
			.ctx
			.store
			.hash_del(&keys::huddle(room_id), &user.id.to_string())
			.await
		{
			warn!(conn_id = self.conn_id, room_id = room_id.as_i64(), error = %e, "huddle leave write failed");
		}

		let roster = presence::huddle_roster(&self.ctx.store, room_id).await.unwrap_or_default();
		self.broadcast(
			&Group::room(room_id),
			&ServerEvent::HuddleParticipants {
				room_id,
				participants: roster.clone(),
			},
		)
		.await;

		self.cleanup_sfu_state(room_id, user.id, roster.is_empty()).await;
	}

	async fn cleanup_sfu_state(&self, room_id: RoomId, user_id: UserId, roster_empty: bool) {
		let sessions_key = keys::sfu_sessions(room_id);
		let tracks_key = keys::sfu_tracks(room_id);

		if roster_empty {
			let ops = [
				StoreOp::Delete(keys::sfu_active(room_id)),
				StoreOp::Delete(sessions_key),
				StoreOp::Delete(tracks_key),
			];
			if let Err(e) = self.ctx.store.pipeline(&ops).await {
				warn!(conn_id = self.conn_id, room_id = room_id.as_i64(), error = %e, "sfu room cleanup failed");
			}
			return;
		}

		let mut ops = vec![StoreOp::HashDel(sessions_key, user_id.to_string())];
		match self.ctx.store.hash_all(&tracks_key).await {
			Ok(tracks) => {
				for (field, raw) in tracks {
					if serde_json::from_str::<SfuTrackInfo>(&raw).is_ok_and(|t| t.user_id == user_id.as_i64()) {
						ops.push(StoreOp::HashDel(tracks_key.clone(), field));
					}
				}
			}
			Err(e) => warn!(conn_id = self.conn_id, room_id = room_id.as_i64(), error = %e, "sfu track listing failed"),
		}

		if let Err(e) = self.ctx.store.pipeline(&ops).await {
			warn!(conn_id = self.conn_id, room_id = room_id.as_i64(), error = %e, "sfu user cleanup failed");
		}
	}

	/// Relay an opaque signaling payload to one peer's inbox. Dropped
	/// silently when the sender is not in a huddle or the target id is
	/// not an integer.
	async fn handle_signal(&self, user: &UserSnapshot, target_id: Option<UserId>, payload: Value) {
		let Some(room_id) = self.active_huddle else {
			debug!(conn_id = self.conn_id, "signal dropped (no active huddle)");
			return;
		};
		let Some(target_id) = target_id else {
			debug!(conn_id = self.conn_id, "signal dropped (non-integer target)");
			return;
		};

		let event = ServerEvent::HuddleSignal {
			room_id,
			from: user.clone(),
			payload,
		};
		self.ctx.hub.group_send(&Group::user(target_id), &event.encode()).await;
	}

	async fn get_or_create_sfu_session(&self, sfu: &SfuClient, room_id: RoomId, user_id: UserId) -> Option<String> {
		let sessions_key = keys::sfu_sessions(room_id);
		let field = user_id.to_string();

		match self.ctx.store.hash_get(&sessions_key, &field).await {
			Ok(Some(session_id)) => return Some(session_id),
			Ok(None) => {}
			Err(e) => warn!(conn_id = self.conn_id, error = %e, "sfu session lookup failed"),
		}

		match sfu.new_session().await {
			Ok(session_id) => {
				if let Err(e) = self
					.ctx
					.store
					.hash_put(&sessions_key, &field, &session_id, self.ctx.settings.ttls.sfu_secs)
					.await
				{
					warn!(conn_id = self.conn_id, error = %e, "sfu session write failed");
				}
				if let Err(e) = self
					.ctx
					.store
					.kv_set_ex(&keys::sfu_active(room_id), "1", self.ctx.settings.ttls.sfu_secs)
					.await
				{
					warn!(conn_id = self.conn_id, error = %e, "sfu flag write failed");
				}
				Some(session_id)
			}
			Err(e) => {
				warn!(conn_id = self.conn_id, room_id = room_id.as_i64(), error = %e, "sfu session create failed");
				None
			}
		}
	}

	async fn handle_sfu_publish(&mut self, user: &UserSnapshot, track_name: &str, sdp_offer: &str) {
		let Some(room_id) = self.active_huddle else {
			self.send_error(ErrorCode::InvalidSfuPublish, "not in a huddle").await;
			return;
		};
		let Some(sfu) = self.ctx.sfu.clone() else {
			self.send_error(ErrorCode::InvalidSfuPublish, "sfu is not configured").await;
			return;
		};
		if track_name.trim().is_empty() || sdp_offer.trim().is_empty() {
			self.send_error(ErrorCode::InvalidSfuPublish, "track_name and sdp_offer are required")
				.await;
			return;
		}

		let Some(session_id) = self.get_or_create_sfu_session(&sfu, room_id, user.id).await else {
			self.send_error(ErrorCode::SfuSessionFailed, "could not create sfu session").await;
			return;
		};

		let response = match sfu.publish_tracks(&session_id, sdp_offer).await {
			Ok(response) => response,
			Err(e) => {
				warn!(conn_id = self.conn_id, room_id = room_id.as_i64(), error = %e, "sfu publish failed");
				self.send_error(ErrorCode::SfuPublishFailed, "sfu rejected the published tracks")
					.await;
				return;
			}
		};

		let Some(sdp_answer) = response.session_description.as_ref().map(|sd| sd.sdp.clone()) else {
			self.send_error(ErrorCode::SfuPublishFailed, "provider returned no answer").await;
			return;
		};

		let tracks_key = keys::sfu_tracks(room_id);
		for (index, track) in response.tracks.iter().enumerate() {
			let resolved_name = track
				.track_name
				.clone()
				.unwrap_or_else(|| format!("{}_{track_name}_{index}", user.id));
			let info = SfuTrackInfo {
				user_id: user.id.as_i64(),
				track_name: resolved_name,
				track_id: track.mid.clone(),
				session_id: session_id.clone(),
			};
			let raw = serde_json::to_string(&info).expect("track info is always serializable");
			let field = format!("{}_{track_name}_{index}", user.id);

			if let Err(e) = self
				.ctx
				.store
				.hash_put(&tracks_key, &field, &raw, self.ctx.settings.ttls.sfu_secs)
				.await
			{
				warn!(conn_id = self.conn_id, error = %e, "sfu track write failed");
			}
		}

		self.send_event(&ServerEvent::SfuPublishAnswer {
			session_id,
			track_name: track_name.to_string(),
			sdp_answer,
			tracks: serde_json::to_value(&response.tracks).unwrap_or(Value::Null),
		})
		.await;

		self.broadcast_excluding(
			&Group::room(room_id),
			&ServerEvent::SfuTrackAdded {
				room_id,
				user_id: user.id,
				user_name: user.name.clone(),
				track_name: track_name.to_string(),
			},
			Some(user.id),
		)
		.await;
	}

	async fn handle_sfu_subscribe(&mut self, user: &UserSnapshot) {
		let Some(room_id) = self.active_huddle else {
			self.send_error(ErrorCode::SfuSubscribeFailed, "not in a huddle").await;
			return;
		};
		let Some(sfu) = self.ctx.sfu.clone() else {
			self.send_error(ErrorCode::SfuSubscribeFailed, "sfu is not configured").await;
			return;
		};

		let Some(session_id) = self.get_or_create_sfu_session(&sfu, room_id, user.id).await else {
			self.send_error(ErrorCode::SfuSessionFailed, "could not create sfu session").await;
			return;
		};

		let tracks = self
			.ctx
			.store
			.hash_all(&keys::sfu_tracks(room_id))
			.await
			.unwrap_or_default();

		let mut remote_tracks = Vec::new();
		for raw in tracks.values() {
			match serde_json::from_str::<SfuTrackInfo>(raw) {
				Ok(info) if info.user_id != user.id.as_i64() => {
					remote_tracks.push(RemoteTrackRequest::new(info.session_id, info.track_name));
				}
				Ok(_) => {}
				Err(e) => warn!(conn_id = self.conn_id, error = %e, "skipping unreadable sfu track entry"),
			}
		}

		if remote_tracks.is_empty() {
			self.send_error(ErrorCode::SfuSubscribeFailed, "no remote tracks to subscribe")
				.await;
			return;
		}

		match sfu.request_remote_tracks(&session_id, &remote_tracks).await {
			Ok(response) => {
				let Some(sdp_offer) = response.session_description.map(|sd| sd.sdp) else {
					self.send_error(ErrorCode::SfuSubscribeFailed, "provider returned no offer").await;
					return;
				};

				self.send_event(&ServerEvent::SfuSubscribeOffer {
					session_id,
					sdp_offer,
					tracks: serde_json::to_value(&remote_tracks).unwrap_or(Value::Null),
					requires_renegotiation: response.requires_immediate_renegotiation,
				})
				.await;
			}
			Err(e) => {
				warn!(conn_id = self.conn_id, room_id = room_id.as_i64(), error = %e, "sfu subscribe failed");
				self.send_error(ErrorCode::SfuSubscribeFailed, "sfu rejected the subscription")
					.await;
			}
		}
	}

	async fn handle_sfu_renegotiate(&mut self, user: &UserSnapshot, sdp_answer: &str) {
		let Some(room_id) = self.active_huddle else {
			self.send_error(ErrorCode::InvalidSfuRenegotiate, "not in a huddle").await;
			return;
		};
		let Some(sfu) = self.ctx.sfu.clone() else {
			self.send_error(ErrorCode::InvalidSfuRenegotiate, "sfu is not configured").await;
			return;
		};
		if sdp_answer.trim().is_empty() {
			self.send_error(ErrorCode::InvalidSfuRenegotiate, "sdp_answer is required").await;
			return;
		}

		let session_id = match self
			.ctx
			.store
			.hash_get(&keys::sfu_sessions(room_id), &user.id.to_string())
			.await
		{
			Ok(Some(session_id)) => session_id,
			Ok(None) => {
				self.send_error(ErrorCode::NoSfuSession, "no sfu session for this user").await;
				return;
			}
			Err(e) => {
				warn!(conn_id = self.conn_id, error = %e, "sfu session lookup failed");
				self.send_error(ErrorCode::StoreUnavailable, "sfu session lookup failed").await;
				return;
			}
		};

		match sfu.renegotiate(&session_id, sdp_answer).await {
			Ok(()) => self.send_event(&ServerEvent::SfuRenegotiateComplete { success: true }).await,
			Err(e) => {
				warn!(conn_id = self.conn_id, room_id = room_id.as_i64(), error = %e, "sfu renegotiate failed");
				self.send_error(ErrorCode::SfuRenegotiateFailed, "sfu rejected the answer").await;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn upgrade_stays_without_configuration() {
		assert_eq!(upgrade_action(5, false, false), UpgradeAction::Stay);
		assert_eq!(upgrade_action(5, true, false), UpgradeAction::Stay);
	}

	#[test]
	fn upgrade_fires_once_at_threshold() {
		assert_eq!(upgrade_action(1, false, true), UpgradeAction::Stay);
		assert_eq!(upgrade_action(2, false, true), UpgradeAction::Stay);
		assert_eq!(upgrade_action(3, false, true), UpgradeAction::BroadcastUpgrade);
		assert_eq!(upgrade_action(4, false, true), UpgradeAction::BroadcastUpgrade);
	}

	#[test]
	fn later_joiners_get_a_direct_notice() {
		assert_eq!(upgrade_action(4, true, true), UpgradeAction::NotifyJoiner);
		assert_eq!(upgrade_action(1, true, true), UpgradeAction::NotifyJoiner);
	}
}
