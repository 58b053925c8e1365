#![forbid(unsafe_code)]

use confab_domain::{AttachmentType, MessageId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Immutable per-connection user snapshot, computed once at the Ready
/// transition and embedded by value in outgoing envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSnapshot {
	pub id: UserId,
	pub name: String,
	pub avatar: Option<String>,
}

/// Stored per-room presence entry (also what `chat.subscribed` reports).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
	pub id: UserId,
	pub name: String,
	pub avatar: Option<String>,
	pub last_seen: String,
}

/// Presence roster payload. Rosters larger than the cap are truncated to
/// keep the frame small; `count` always reflects the full roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
	pub count: usize,
	pub users: Vec<PresenceEntry>,
	pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
	Join,
	Leave,
}

/// Huddle roster entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HuddleParticipant {
	pub id: UserId,
	pub name: String,
	pub avatar: Option<String>,
}

/// Serialized chat message as broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
	pub id: MessageId,
	pub room_id: RoomId,
	pub sender: UserSnapshot,
	pub content: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub attachment: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub attachment_type: Option<AttachmentType>,
	pub created_at: String,
	pub updated_at: String,
	pub is_edited: bool,
	/// Echoed back so an optimistic client copy can be reconciled.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub client_id: Option<String>,
}

/// Error-frame codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	AuthRequired,
	InvalidEvent,
	NotParticipant,
	RoomNotFound,
	StoreUnavailable,
	InvalidSfuPublish,
	InvalidSfuRenegotiate,
	SfuSessionFailed,
	SfuPublishFailed,
	SfuSubscribeFailed,
	SfuRenegotiateFailed,
	NoSfuSession,
}

/// Outbound event, serialized as one JSON text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
	#[serde(rename = "auth.required")]
	AuthRequired,
	#[serde(rename = "auth.success")]
	AuthSuccess {
		user: UserSnapshot,
		online_users: Vec<UserId>,
	},
	#[serde(rename = "auth.error")]
	AuthError { message: String },
	#[serde(rename = "pong")]
	Pong { timestamp: i64 },
	#[serde(rename = "presence.ack")]
	PresenceAck,
	#[serde(rename = "error")]
	Error { code: ErrorCode, message: String },

	#[serde(rename = "global.online_users")]
	OnlineUsers { online_users: Vec<UserId> },
	#[serde(rename = "global.user_online")]
	UserOnline { user_id: UserId },
	#[serde(rename = "global.user_offline")]
	UserOffline { user_id: UserId },
	#[serde(rename = "global.chat_room_created")]
	ChatRoomCreated { room: Value },
	#[serde(rename = "global.new_message_notification")]
	NewMessageNotification {
		chat_room_id: RoomId,
		sender_id: UserId,
		sender_name: String,
		message_content: String,
		has_attachment: bool,
	},
	#[serde(rename = "global.removed_from_room")]
	RemovedFromRoom { room_id: RoomId },
	#[serde(rename = "global.promoted_to_admin")]
	PromotedToAdmin { room_id: RoomId },

	#[serde(rename = "chat.subscribed")]
	Subscribed { room_id: RoomId, presence: PresencePayload },
	#[serde(rename = "chat.unsubscribed")]
	Unsubscribed { room_id: RoomId },
	#[serde(rename = "chat.message")]
	Message { room_id: RoomId, message: MessagePayload },
	#[serde(rename = "chat.message_updated")]
	MessageUpdated { room_id: RoomId, message: MessagePayload },
	#[serde(rename = "chat.message_deleted")]
	MessageDeleted { room_id: RoomId, message_id: MessageId },
	#[serde(rename = "chat.typing_status")]
	TypingStatus {
		room_id: RoomId,
		user_id: UserId,
		is_typing: bool,
	},
	#[serde(rename = "chat.presence_update")]
	PresenceUpdate {
		room_id: RoomId,
		action: PresenceAction,
		user: UserSnapshot,
	},
	#[serde(rename = "chat.collab_state")]
	CollabState { room_id: RoomId, content: String },
	#[serde(rename = "chat.collab_update")]
	CollabUpdate {
		room_id: RoomId,
		content: String,
		user: UserSnapshot,
	},
	#[serde(rename = "chat.cursor_state")]
	CursorState {
		room_id: RoomId,
		cursors: serde_json::Map<String, Value>,
	},
	#[serde(rename = "chat.cursor_update")]
	CursorUpdate {
		room_id: RoomId,
		cursor: Value,
		user: UserSnapshot,
	},
	#[serde(rename = "chat.huddle_participants")]
	HuddleParticipants {
		room_id: RoomId,
		participants: Vec<HuddleParticipant>,
	},
	#[serde(rename = "chat.room_updated")]
	RoomUpdated { room_id: RoomId, room: Value },

	#[serde(rename = "huddle.signal")]
	HuddleSignal {
		room_id: RoomId,
		from: UserSnapshot,
		payload: Value,
	},
	#[serde(rename = "huddle.sfu_upgrade")]
	SfuUpgrade { room_id: RoomId },
	#[serde(rename = "huddle.sfu_publish_answer")]
	SfuPublishAnswer {
		session_id: String,
		track_name: String,
		sdp_answer: String,
		tracks: Value,
	},
	#[serde(rename = "huddle.sfu_subscribe_offer")]
	SfuSubscribeOffer {
		session_id: String,
		sdp_offer: String,
		tracks: Value,
		requires_renegotiation: bool,
	},
	#[serde(rename = "huddle.sfu_renegotiate_complete")]
	SfuRenegotiateComplete { success: bool },
	#[serde(rename = "huddle.sfu_track_added")]
	SfuTrackAdded {
		room_id: RoomId,
		user_id: UserId,
		user_name: String,
		track_name: String,
	},
}

impl ServerEvent {
	/// Build an error frame.
	pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
		ServerEvent::Error {
			code,
			message: message.into(),
		}
	}

	/// Serialize to a JSON text frame.
	pub fn encode(&self) -> String {
		serde_json::to_string(self).expect("server event is always serializable")
	}
}
