#![forbid(unsafe_code)]

use confab_domain::{AttachmentType, Group, MessageId, RoomId};
use confab_protocol::{ErrorCode, MessagePayload, ServerEvent, UserSnapshot};
use tracing::{debug, warn};

use crate::server::connection::Session;
use crate::server::presence;
use crate::server::repo::MessageRow;

/// Longest message excerpt carried in an ephemeral notification.
const NOTIFICATION_PREVIEW_CHARS: usize = 100;

/// Serialize a stored message for broadcast, echoing the optimistic
/// `client_id` when the sender provided one.
pub(crate) fn message_payload(row: &MessageRow, sender: UserSnapshot, client_id: Option<String>) -> MessagePayload {
	MessagePayload {
		id: MessageId(row.id),
		room_id: RoomId(row.room_id),
		sender,
		content: row.content.clone(),
		attachment: row.attachment.clone(),
		attachment_type: row.attachment_type.as_deref().and_then(|t| t.parse().ok()),
		created_at: row.created_at.to_rfc3339(),
		updated_at: row.updated_at.to_rfc3339(),
		is_edited: row.is_edited(),
		client_id,
	}
}

/// Character-safe excerpt for notification payloads.
pub(crate) fn notification_preview(content: &str) -> String {
	if content.chars().count() <= NOTIFICATION_PREVIEW_CHARS {
		content.to_string()
	} else {
		content.chars().take(NOTIFICATION_PREVIEW_CHARS).collect()
	}
}

impl Session {
	pub(crate) async fn handle_send_message(
		&mut self,
		user: &UserSnapshot,
		room_id: RoomId,
		content: &str,
		client_id: Option<String>,
		attachment: Option<String>,
		attachment_type: Option<AttachmentType>,
	) {
		// Subscription doubles as the participant check and guards against
		// a spoofed room_id.
		if !self.is_subscribed(room_id).await {
			self.send_error(ErrorCode::NotParticipant, format!("not subscribed to room {room_id}"))
				.await;
			return;
		}

		let content = content.trim();
		if content.is_empty() {
			return;
		}

		let attachment_pair = attachment
			.as_deref()
			.map(|a| (a, attachment_type.unwrap_or(AttachmentType::File).as_str()));

		let row = match self.ctx.repo.create_message(room_id, user.id, content, attachment_pair).await {
			Ok(row) => row,
			Err(e) => {
				warn!(conn_id = self.conn_id, room_id = room_id.as_i64(), error = %e, "message persist failed");
				self.send_error(ErrorCode::StoreUnavailable, "message could not be stored").await;
				return;
			}
		};

		metrics::counter!("confab_server_messages_total").increment(1);

		let payload = message_payload(&row, user.clone(), client_id);
		self.broadcast(&Group::room(room_id), &ServerEvent::Message { room_id, message: payload })
			.await;

		self.notify_absent_participants(user, room_id, content, row.attachment.is_some())
			.await;
	}

	/// Fan out to participants not watching the room: a transient inbox
	/// event for those online elsewhere, a coalesced durable notification
	/// for everyone offline.
	async fn notify_absent_participants(&self, user: &UserSnapshot, room_id: RoomId, content: &str, has_attachment: bool) {
		let participants = match self.ctx.repo.list_participant_ids(room_id, Some(user.id)).await {
			Ok(participants) => participants,
			Err(e) => {
				warn!(conn_id = self.conn_id, room_id = room_id.as_i64(), error = %e, "participant listing failed");
				return;
			}
		};

		let preview = notification_preview(content);

		for participant_id in participants {
			let in_room = presence::is_user_in_room(&self.ctx.store, room_id, participant_id)
				.await
				.unwrap_or(false);
			if in_room {
				continue;
			}

			let online = presence::is_online(&self.ctx.store, participant_id).await.unwrap_or(false);

			if online {
				let event = ServerEvent::NewMessageNotification {
					chat_room_id: room_id,
					sender_id: user.id,
					sender_name: user.name.clone(),
					message_content: preview.clone(),
					has_attachment,
				};
				self.ctx.hub.group_send(&Group::user(participant_id), &event.encode()).await;
			} else if let Err(e) = self
				.ctx
				.repo
				.upsert_unread_notification(participant_id, room_id, &format!("New message from {}", user.name))
				.await
			{
				warn!(
					conn_id = self.conn_id,
					user_id = participant_id.as_i64(),
					error = %e,
					"notification upsert failed"
				);
			} else {
				metrics::counter!("confab_server_notifications_upserted_total").increment(1);
			}
		}
	}

	pub(crate) async fn handle_edit_message(
		&mut self,
		user: &UserSnapshot,
		room_id: RoomId,
		message_id: MessageId,
		content: &str,
	) {
		if !self.is_subscribed(room_id).await {
			self.send_error(ErrorCode::NotParticipant, format!("not subscribed to room {room_id}"))
				.await;
			return;
		}

		let content = content.trim();
		if content.is_empty() {
			return;
		}

		match self.ctx.repo.update_message(message_id, room_id, user.id, content).await {
			Ok(Some(row)) => {
				let payload = message_payload(&row, user.clone(), None);
				self.broadcast(
					&Group::room(room_id),
					&ServerEvent::MessageUpdated { room_id, message: payload },
				)
				.await;
			}
			Ok(None) => {
				debug!(
					conn_id = self.conn_id,
					message_id = message_id.as_i64(),
					"edit ignored (missing message or not the sender)"
				);
			}
			Err(e) => {
				warn!(conn_id = self.conn_id, message_id = message_id.as_i64(), error = %e, "message edit failed");
				self.send_error(ErrorCode::StoreUnavailable, "message could not be updated").await;
			}
		}
	}

	pub(crate) async fn handle_delete_message(&mut self, user: &UserSnapshot, room_id: RoomId, message_id: MessageId) {
		if !self.is_subscribed(room_id).await {
			self.send_error(ErrorCode::NotParticipant, format!("not subscribed to room {room_id}"))
				.await;
			return;
		}

		match self.ctx.repo.delete_message(message_id, room_id, user.id).await {
			Ok(true) => {
				self.broadcast(&Group::room(room_id), &ServerEvent::MessageDeleted { room_id, message_id })
					.await;
			}
			Ok(false) => {
				debug!(
					conn_id = self.conn_id,
					message_id = message_id.as_i64(),
					"delete ignored (missing message or not the sender)"
				);
			}
			Err(e) => {
				warn!(conn_id = self.conn_id, message_id = message_id.as_i64(), error = %e, "message delete failed");
				self.send_error(ErrorCode::StoreUnavailable, "message could not be deleted").await;
			}
		}
	}

	/// Record an idempotent read receipt and advance the reader's
	/// last-read marker. No broadcast.
	pub(crate) async fn handle_mark_read(&mut self, user: &UserSnapshot, room_id: RoomId, message_id: MessageId) {
		if !self.is_subscribed(room_id).await {
			self.send_error(ErrorCode::NotParticipant, format!("not subscribed to room {room_id}"))
				.await;
			return;
		}

		match self.ctx.repo.get_message(message_id).await {
			Ok(Some(row)) if row.room_id == room_id.as_i64() => {
				if let Err(e) = self.ctx.repo.create_read_receipt(message_id, user.id).await {
					warn!(conn_id = self.conn_id, message_id = message_id.as_i64(), error = %e, "read receipt failed");
					return;
				}
				if let Err(e) = self.ctx.repo.set_last_read_message(room_id, user.id, message_id).await {
					warn!(conn_id = self.conn_id, message_id = message_id.as_i64(), error = %e, "last-read update failed");
				}
			}
			Ok(_) => {
				debug!(
					conn_id = self.conn_id,
					message_id = message_id.as_i64(),
					"mark_read ignored (message not in room)"
				);
			}
			Err(e) => {
				warn!(conn_id = self.conn_id, message_id = message_id.as_i64(), error = %e, "mark_read lookup failed");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use chrono::{Duration, Utc};
	use confab_domain::UserId;

	use super::*;

	fn row(content: &str, edited: bool) -> MessageRow {
		let created = Utc::now();
		MessageRow {
			id: 10,
			room_id: 42,
			sender_id: 7,
			content: content.to_string(),
			attachment: None,
			attachment_type: Some("image".to_string()),
			created_at: created,
			updated_at: if edited { created + Duration::seconds(30) } else { created },
		}
	}

	fn sender() -> UserSnapshot {
		UserSnapshot {
			id: UserId(7),
			name: "ada".to_string(),
			avatar: None,
		}
	}

	#[test]
	fn preview_truncates_to_one_hundred_chars() {
		let short = "hello";
		assert_eq!(notification_preview(short), "hello");

		let long: String = "x".repeat(250);
		assert_eq!(notification_preview(&long).chars().count(), 100);

		// Multibyte content must not be split mid-character.
		let emoji: String = "🦀".repeat(120);
		let preview = notification_preview(&emoji);
		assert_eq!(preview.chars().count(), 100);
		assert!(preview.chars().all(|c| c == '🦀'));
	}

	#[test]
	fn payload_reflects_edit_state_and_echoes_client_id() {
		let fresh = message_payload(&row("hi", false), sender(), Some("opt-1".to_string()));
		assert!(!fresh.is_edited);
		assert_eq!(fresh.client_id.as_deref(), Some("opt-1"));
		assert_eq!(fresh.attachment_type, Some(confab_domain::AttachmentType::Image));

		let edited = message_payload(&row("hi", true), sender(), None);
		assert!(edited.is_edited);
		assert!(edited.client_id.is_none());
	}
}
