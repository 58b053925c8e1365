#![forbid(unsafe_code)]

//! Client for the external SFU provider (Cloudflare Calls-style session
//! API). Each huddle participant gets their own provider session: tracks
//! are published into the caller's session and pulled from other users'
//! sessions. For subscriptions the provider generates the SDP offer and
//! the client answers through the renegotiate endpoint.

use std::fmt;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Default provider API root; the app id is appended per request.
pub const DEFAULT_BASE_URL: &str = "https://rtc.live.cloudflare.com/v1/apps";

/// Default timeout for provider calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Provider credentials and tuning.
#[derive(Debug, Clone)]
pub struct SfuConfig {
	pub app_id: String,
	pub app_secret: SecretString,
	pub base_url: String,
	pub request_timeout: Duration,
}

impl SfuConfig {
	pub fn new(app_id: impl Into<String>, app_secret: SecretString) -> Self {
		Self {
			app_id: app_id.into(),
			app_secret,
			base_url: DEFAULT_BASE_URL.to_string(),
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
		}
	}
}

/// Provider call failures. API-level failures carry the response body for
/// the logs; callers translate these into wire error frames.
#[derive(Debug, Error)]
pub enum SfuError {
	#[error("sfu request failed: {0}")]
	Http(#[from] reqwest::Error),

	#[error("sfu api error: status={status} body={body}")]
	Api { status: u16, body: String },

	#[error("sfu response missing field: {0}")]
	MissingField(&'static str),
}

/// `sessionDescription` object on the provider wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
	#[serde(rename = "type")]
	pub kind: String,
	pub sdp: String,
}

impl SessionDescription {
	pub fn offer(sdp: impl Into<String>) -> Self {
		Self {
			kind: "offer".to_string(),
			sdp: sdp.into(),
		}
	}

	pub fn answer(sdp: impl Into<String>) -> Self {
		Self {
			kind: "answer".to_string(),
			sdp: sdp.into(),
		}
	}
}

/// One remote track to pull into a subscriber session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTrackRequest {
	pub location: String,
	/// The publisher's session id, not the subscriber's.
	pub session_id: String,
	pub track_name: String,
}

impl RemoteTrackRequest {
	pub fn new(publisher_session_id: impl Into<String>, track_name: impl Into<String>) -> Self {
		Self {
			location: "remote".to_string(),
			session_id: publisher_session_id.into(),
			track_name: track_name.into(),
		}
	}
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewTracksRequest {
	#[serde(skip_serializing_if = "Option::is_none")]
	auto_discover: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	session_description: Option<SessionDescription>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	tracks: Vec<RemoteTrackRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RenegotiateRequest {
	session_description: SessionDescription,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewSessionResponse {
	session_id: Option<String>,
}

/// Per-track outcome reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackResult {
	pub mid: Option<String>,
	pub track_name: Option<String>,
	pub session_id: Option<String>,
	pub error_description: Option<String>,
}

/// Response from `sessions/{sid}/tracks/new`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TracksResponse {
	pub session_description: Option<SessionDescription>,
	pub tracks: Vec<TrackResult>,
	pub requires_immediate_renegotiation: bool,
}

/// HTTP client for the provider session API.
#[derive(Debug, Clone)]
pub struct SfuClient {
	http: reqwest::Client,
	cfg: SfuConfig,
}

impl SfuClient {
	pub fn new(cfg: SfuConfig) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("confab/0.x (sfu)")
			.timeout(cfg.request_timeout)
			.build()
			.context("build reqwest client")?;

		Ok(Self { http, cfg })
	}

	fn url(&self, path: &str) -> String {
		format!("{}/{}/{}", self.cfg.base_url.trim_end_matches('/'), self.cfg.app_id, path)
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.header("Authorization", format!("Bearer {}", self.cfg.app_secret.expose()))
	}

	async fn into_checked_body(resp: reqwest::Response) -> Result<String, SfuError> {
		let status = resp.status();
		let body = resp.text().await?;
		if !status.is_success() {
			return Err(SfuError::Api {
				status: status.as_u16(),
				body,
			});
		}
		Ok(body)
	}

	/// Create a fresh provider session (`POST sessions/new`).
	pub async fn new_session(&self) -> Result<String, SfuError> {
		let resp = self.authed(self.http.post(self.url("sessions/new"))).send().await?;
		let body = Self::into_checked_body(resp).await?;

		let parsed: NewSessionResponse = serde_json::from_str(&body).map_err(|_| SfuError::MissingField("sessionId"))?;
		let session_id = parsed.session_id.ok_or(SfuError::MissingField("sessionId"))?;

		info!(session_id = %session_id, "created sfu session");
		Ok(session_id)
	}

	/// Publish local tracks (WHIP-style): the client's SDP offer goes up,
	/// the provider auto-discovers tracks and returns the answer.
	pub async fn publish_tracks(&self, session_id: &str, sdp_offer: &str) -> Result<TracksResponse, SfuError> {
		let request = NewTracksRequest {
			auto_discover: Some(true),
			session_description: Some(SessionDescription::offer(sdp_offer)),
			tracks: Vec::new(),
		};

		debug!(session_id, sdp_len = sdp_offer.len(), "publishing tracks");
		let resp = self
			.authed(self.http.post(self.url(&format!("sessions/{session_id}/tracks/new"))))
			.json(&request)
			.send()
			.await?;
		let body = Self::into_checked_body(resp).await?;

		let parsed: TracksResponse = serde_json::from_str(&body).map_err(|_| SfuError::MissingField("tracks"))?;
		Ok(parsed)
	}

	/// Pull remote tracks into a subscriber session (WHEP-style). No local
	/// SDP is sent; the provider generates the offer and the client must
	/// answer through [`SfuClient::renegotiate`].
	pub async fn request_remote_tracks(
		&self,
		session_id: &str,
		tracks: &[RemoteTrackRequest],
	) -> Result<TracksResponse, SfuError> {
		let request = NewTracksRequest {
			auto_discover: None,
			session_description: None,
			tracks: tracks.to_vec(),
		};

		debug!(session_id, requested = tracks.len(), "requesting remote tracks");
		let resp = self
			.authed(self.http.post(self.url(&format!("sessions/{session_id}/tracks/new"))))
			.json(&request)
			.send()
			.await?;
		let body = Self::into_checked_body(resp).await?;

		let parsed: TracksResponse = serde_json::from_str(&body).map_err(|_| SfuError::MissingField("tracks"))?;
		Ok(parsed)
	}

	/// Complete a provider-initiated renegotiation with the client's answer
	/// (`PUT sessions/{sid}/renegotiate`).
	pub async fn renegotiate(&self, session_id: &str, sdp_answer: &str) -> Result<(), SfuError> {
		let request = RenegotiateRequest {
			session_description: SessionDescription::answer(sdp_answer),
		};

		let resp = self
			.authed(self.http.put(self.url(&format!("sessions/{session_id}/renegotiate"))))
			.json(&request)
			.send()
			.await?;
		Self::into_checked_body(resp).await?;

		info!(session_id, "renegotiation complete");
		Ok(())
	}
}
