#![forbid(unsafe_code)]

pub mod client;
pub mod server;

pub use client::{ChatEvent, ClientEvent, DecodeError, GlobalEvent, HuddleEvent, canonical_type, decode};
pub use server::{
	ErrorCode, HuddleParticipant, MessagePayload, PresenceAction, PresenceEntry, PresencePayload, ServerEvent,
	UserSnapshot,
};

/// WebSocket endpoint path served by the gateway.
pub const WS_ENDPOINT_PATH: &str = "/ws/stream/";

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;
}
