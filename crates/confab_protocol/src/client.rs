#![forbid(unsafe_code)]

use confab_domain::{AttachmentType, MessageId, RoomId, UserId};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Inbound event, decoded from one JSON text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
	/// First-message authentication.
	Auth { token: String },

	/// Protocol-level liveness probe. Does not refresh presence.
	Ping { timestamp: Option<i64> },

	/// Explicit presence refresh for the global set and all subscribed rooms.
	PresenceHeartbeat,

	Global(GlobalEvent),
	Chat(ChatEvent),
	Huddle(HuddleEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GlobalEvent {
	/// Request a fresh snapshot of the global online set.
	Refresh,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
	Subscribe {
		room_id: RoomId,
	},
	Unsubscribe {
		room_id: RoomId,
	},
	SendMessage {
		room_id: RoomId,
		content: String,
		client_id: Option<String>,
		attachment: Option<String>,
		attachment_type: Option<AttachmentType>,
	},
	EditMessage {
		room_id: RoomId,
		message_id: MessageId,
		content: String,
	},
	DeleteMessage {
		room_id: RoomId,
		message_id: MessageId,
	},
	Typing {
		room_id: RoomId,
		is_typing: bool,
	},
	CollabUpdate {
		room_id: RoomId,
		content: String,
	},
	CursorUpdate {
		room_id: RoomId,
		cursor: Value,
	},
	MarkRead {
		room_id: RoomId,
		message_id: MessageId,
	},
}

#[derive(Debug, Clone, PartialEq)]
pub enum HuddleEvent {
	Join {
		room_id: RoomId,
	},
	Leave,
	/// Relay an opaque signaling payload to one peer. `target_id` is `None`
	/// when the client sent a non-integer id; the gateway drops those.
	Signal {
		target_id: Option<UserId>,
		payload: Value,
	},
	SfuPublish {
		track_name: String,
		sdp_offer: String,
	},
	SfuSubscribe,
	SfuRenegotiate {
		sdp_answer: String,
	},
}

/// Frame-level decode failures. Each maps to one `error` reply frame; the
/// connection stays open.
#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("malformed JSON: {0}")]
	BadJson(String),

	#[error("missing or non-string \"type\" field")]
	MissingType,

	#[error("unknown event type: {0}")]
	UnknownType(String),

	#[error("invalid payload for {event}: {detail}")]
	InvalidPayload { event: &'static str, detail: String },
}

/// Legacy event names still accepted from clients, rewritten to their
/// namespaced equivalents before dispatch.
const LEGACY_ALIASES: &[(&str, &str)] = &[
	("send_message", "chat.send_message"),
	("edit_message", "chat.edit_message"),
	("delete_message", "chat.delete_message"),
	("typing", "chat.typing"),
	("collab_update", "chat.collab_update"),
	("cursor_update", "chat.cursor_update"),
	("huddle_join", "huddle.join"),
	("huddle_leave", "huddle.leave"),
	("huddle_signal", "huddle.signal"),
];

/// Resolve a wire `type` string to its canonical namespaced form.
pub fn canonical_type(ty: &str) -> &str {
	for (legacy, canonical) in LEGACY_ALIASES {
		if *legacy == ty {
			return canonical;
		}
	}
	ty
}

#[derive(Debug, Deserialize)]
struct AuthPayload {
	token: String,
}

#[derive(Debug, Deserialize)]
struct PingPayload {
	#[serde(default)]
	timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RoomPayload {
	room_id: RoomId,
}

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
	room_id: RoomId,
	content: String,
	#[serde(default)]
	client_id: Option<String>,
	#[serde(default)]
	attachment: Option<String>,
	#[serde(default)]
	attachment_type: Option<AttachmentType>,
}

#[derive(Debug, Deserialize)]
struct EditMessagePayload {
	room_id: RoomId,
	message_id: MessageId,
	content: String,
}

#[derive(Debug, Deserialize)]
struct MessageRefPayload {
	room_id: RoomId,
	message_id: MessageId,
}

#[derive(Debug, Deserialize)]
struct TypingPayload {
	room_id: RoomId,
	is_typing: bool,
}

#[derive(Debug, Deserialize)]
struct CollabUpdatePayload {
	room_id: RoomId,
	content: String,
}

#[derive(Debug, Deserialize)]
struct CursorUpdatePayload {
	room_id: RoomId,
	cursor: Value,
}

#[derive(Debug, Deserialize)]
struct SignalPayload {
	#[serde(default)]
	target_id: Value,
	payload: Value,
}

#[derive(Debug, Deserialize)]
struct SfuPublishPayload {
	track_name: String,
	sdp_offer: String,
}

#[derive(Debug, Deserialize)]
struct SfuRenegotiatePayload {
	sdp_answer: String,
}

fn payload<T: DeserializeOwned>(event: &'static str, value: Value) -> Result<T, DecodeError> {
	serde_json::from_value(value).map_err(|e| DecodeError::InvalidPayload {
		event,
		detail: e.to_string(),
	})
}

/// Decode one inbound text frame into a [`ClientEvent`].
///
/// Legacy aliases are rewritten to their namespaced forms first; unknown
/// types are rejected rather than ignored.
pub fn decode(text: &str) -> Result<ClientEvent, DecodeError> {
	let value: Value = serde_json::from_str(text).map_err(|e| DecodeError::BadJson(e.to_string()))?;
	let ty = value
		.get("type")
		.and_then(Value::as_str)
		.ok_or(DecodeError::MissingType)?
		.to_string();

	let event = match canonical_type(&ty) {
		"auth" => {
			let p: AuthPayload = payload("auth", value)?;
			ClientEvent::Auth { token: p.token }
		}
		"ping" => {
			let p: PingPayload = payload("ping", value)?;
			ClientEvent::Ping { timestamp: p.timestamp }
		}
		"presence.heartbeat" => ClientEvent::PresenceHeartbeat,
		"global.refresh" => ClientEvent::Global(GlobalEvent::Refresh),
		"chat.subscribe" => {
			let p: RoomPayload = payload("chat.subscribe", value)?;
			ClientEvent::Chat(ChatEvent::Subscribe { room_id: p.room_id })
		}
		"chat.unsubscribe" => {
			let p: RoomPayload = payload("chat.unsubscribe", value)?;
			ClientEvent::Chat(ChatEvent::Unsubscribe { room_id: p.room_id })
		}
		"chat.send_message" => {
			let p: SendMessagePayload = payload("chat.send_message", value)?;
			ClientEvent::Chat(ChatEvent::SendMessage {
				room_id: p.room_id,
				content: p.content,
				client_id: p.client_id,
				attachment: p.attachment,
				attachment_type: p.attachment_type,
			})
		}
		"chat.edit_message" => {
			let p: EditMessagePayload = payload("chat.edit_message", value)?;
			ClientEvent::Chat(ChatEvent::EditMessage {
				room_id: p.room_id,
				message_id: p.message_id,
				content: p.content,
			})
		}
		"chat.delete_message" => {
			let p: MessageRefPayload = payload("chat.delete_message", value)?;
			ClientEvent::Chat(ChatEvent::DeleteMessage {
				room_id: p.room_id,
				message_id: p.message_id,
			})
		}
		"chat.typing" => {
			let p: TypingPayload = payload("chat.typing", value)?;
			ClientEvent::Chat(ChatEvent::Typing {
				room_id: p.room_id,
				is_typing: p.is_typing,
			})
		}
		"chat.collab_update" => {
			let p: CollabUpdatePayload = payload("chat.collab_update", value)?;
			ClientEvent::Chat(ChatEvent::CollabUpdate {
				room_id: p.room_id,
				content: p.content,
			})
		}
		"chat.cursor_update" => {
			let p: CursorUpdatePayload = payload("chat.cursor_update", value)?;
			ClientEvent::Chat(ChatEvent::CursorUpdate {
				room_id: p.room_id,
				cursor: p.cursor,
			})
		}
		"chat.mark_read" => {
			let p: MessageRefPayload = payload("chat.mark_read", value)?;
			ClientEvent::Chat(ChatEvent::MarkRead {
				room_id: p.room_id,
				message_id: p.message_id,
			})
		}
		"huddle.join" => {
			let p: RoomPayload = payload("huddle.join", value)?;
			ClientEvent::Huddle(HuddleEvent::Join { room_id: p.room_id })
		}
		"huddle.leave" => ClientEvent::Huddle(HuddleEvent::Leave),
		"huddle.signal" => {
			let p: SignalPayload = payload("huddle.signal", value)?;
			ClientEvent::Huddle(HuddleEvent::Signal {
				target_id: p.target_id.as_i64().map(UserId),
				payload: p.payload,
			})
		}
		"huddle.sfu_publish" => {
			let p: SfuPublishPayload = payload("huddle.sfu_publish", value)?;
			ClientEvent::Huddle(HuddleEvent::SfuPublish {
				track_name: p.track_name,
				sdp_offer: p.sdp_offer,
			})
		}
		"huddle.sfu_subscribe" => ClientEvent::Huddle(HuddleEvent::SfuSubscribe),
		"huddle.sfu_renegotiate" => {
			let p: SfuRenegotiatePayload = payload("huddle.sfu_renegotiate", value)?;
			ClientEvent::Huddle(HuddleEvent::SfuRenegotiate { sdp_answer: p.sdp_answer })
		}
		other => return Err(DecodeError::UnknownType(other.to_string())),
	};

	Ok(event)
}
