#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers and enums from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
	#[error("empty value")]
	Empty,
	#[error("unknown role: {0}")]
	UnknownRole(String),
	#[error("unknown attachment type: {0}")]
	UnknownAttachmentType(String),
}

/// Database user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
	pub const fn as_i64(self) -> i64 {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Database chat-room identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub i64);

impl RoomId {
	pub const fn as_i64(self) -> i64 {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Database message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl MessageId {
	pub const fn as_i64(self) -> i64 {
		self.0
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Participant role within a chat room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Admin,
	Member,
}

impl Role {
	/// Stable string identifier (matches the database column).
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::Admin => "admin",
			Role::Member => "member",
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Role {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"admin" => Ok(Role::Admin),
			"member" => Ok(Role::Member),
			other => Err(ParseError::UnknownRole(other.to_string())),
		}
	}
}

/// Kind of an already-uploaded message attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentType {
	Image,
	Video,
	Audio,
	File,
}

impl AttachmentType {
	pub const fn as_str(self) -> &'static str {
		match self {
			AttachmentType::Image => "image",
			AttachmentType::Video => "video",
			AttachmentType::Audio => "audio",
			AttachmentType::File => "file",
		}
	}
}

impl fmt::Display for AttachmentType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for AttachmentType {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"image" => Ok(AttachmentType::Image),
			"video" => Ok(AttachmentType::Video),
			"audio" => Ok(AttachmentType::Audio),
			"file" => Ok(AttachmentType::File),
			other => Err(ParseError::UnknownAttachmentType(other.to_string())),
		}
	}
}

/// Channel-layer group name helpers.
pub struct Group;

impl Group {
	/// Global presence broadcast group.
	pub const GLOBAL_PRESENCE: &'static str = "global_presence";

	/// Room fan-out group (e.g. `chat_42`).
	pub fn room(room_id: RoomId) -> String {
		format!("chat_{room_id}")
	}

	/// Per-user direct inbox group (e.g. `user_7`).
	pub fn user(user_id: UserId) -> String {
		format!("user_{user_id}")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn role_parse_and_display() {
		assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
		assert_eq!("Member".parse::<Role>().unwrap(), Role::Member);
		assert_eq!(Role::Admin.to_string(), "admin");
		assert!("owner".parse::<Role>().is_err());
	}

	#[test]
	fn attachment_type_parse_and_display() {
		assert_eq!("image".parse::<AttachmentType>().unwrap(), AttachmentType::Image);
		assert_eq!(AttachmentType::File.to_string(), "file");
		assert!("gif".parse::<AttachmentType>().is_err());
		assert!("  ".parse::<AttachmentType>().is_err());
	}

	#[test]
	fn ids_serialize_transparently() {
		let id = RoomId(42);
		assert_eq!(serde_json::to_string(&id).unwrap(), "42");
		let back: RoomId = serde_json::from_str("42").unwrap();
		assert_eq!(back, id);
	}

	#[test]
	fn group_names() {
		assert_eq!(Group::room(RoomId(42)), "chat_42");
		assert_eq!(Group::user(UserId(7)), "user_7");
		assert_eq!(Group::GLOBAL_PRESENCE, "global_presence");
	}
}
