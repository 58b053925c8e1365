#![forbid(unsafe_code)]

use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use confab_sfu::{SecretString, SfuConfig};
use serde::Deserialize;
use tracing::info;

use crate::server::GatewaySettings;
use crate::server::store::TtlSettings;

/// Default config path: `~/.confab/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".confab").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub store: StoreSettings,
	pub persistence: PersistenceSettings,
	pub sfu: SfuSettings,
}

/// Resolve the gateway listen endpoint to a bind address. Accepts
/// `ws://host:port` or a bare `host:port`; the host may be a DNS name,
/// resolved once at startup. `wss://` is refused: TLS terminates at the
/// fronting proxy, never on the gateway socket.
pub fn parse_listen_addr(endpoint: &str) -> anyhow::Result<SocketAddr> {
	let endpoint = endpoint.trim();
	if endpoint.is_empty() {
		return Err(anyhow!("listen endpoint must be non-empty"));
	}

	if endpoint.starts_with("wss://") {
		return Err(anyhow!(
			"wss:// is not supported; terminate TLS at the fronting proxy and bind ws:// instead"
		));
	}

	let hostport = endpoint.strip_prefix("ws://").unwrap_or(endpoint);
	if hostport.contains('/') || hostport.contains('?') || hostport.contains('#') {
		return Err(anyhow!(
			"listen endpoint must not carry a path, query or fragment: {endpoint}"
		));
	}

	let mut addrs = hostport
		.to_socket_addrs()
		.with_context(|| format!("resolve listen endpoint {hostport} (expected host:port)"))?;
	addrs
		.next()
		.ok_or_else(|| anyhow!("listen endpoint {hostport} resolved to no addresses"))
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Listen endpoint (`ws://host:port` or `host:port`). The `--bind`
	/// CLI flag takes precedence.
	pub listen: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for stateless access tokens. Required.
	pub auth_hmac_secret: Option<SecretString>,
	/// Idle-reaper tick interval.
	pub heartbeat_interval: Duration,
	/// Server-driven presence refresh cadence.
	pub presence_refresh_interval: Duration,
	/// Presence payloads above this roster size are truncated.
	pub presence_roster_cap: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			listen: None,
			metrics_bind: None,
			health_bind: None,
			auth_hmac_secret: None,
			heartbeat_interval: Duration::from_secs(30),
			presence_refresh_interval: Duration::from_secs(120),
			presence_roster_cap: 50,
		}
	}
}

/// Fast-store settings. Without a Redis URL the gateway falls back to the
/// in-process store and channel layer (single-node deployments only).
#[derive(Debug, Clone, Default)]
pub struct StoreSettings {
	pub redis_url: Option<String>,
	pub ttls: TtlSettings,
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:). Defaults to a local sqlite file.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SfuSettings {
	pub app_id: Option<String>,
	pub app_secret: Option<SecretString>,
	pub base_url: Option<String>,
}

impl ServerConfig {
	pub fn gateway_settings(&self) -> GatewaySettings {
		GatewaySettings {
			heartbeat_interval: self.server.heartbeat_interval,
			presence_refresh_interval: self.server.presence_refresh_interval,
			presence_roster_cap: self.server.presence_roster_cap,
			ttls: self.store.ttls.clone(),
		}
	}

	/// Provider client config, present only when both credentials are set.
	/// Absence disables the SFU upgrade path; huddles stay P2P.
	pub fn sfu_config(&self) -> Option<SfuConfig> {
		let app_id = self.sfu.app_id.clone()?;
		let app_secret = self.sfu.app_secret.clone()?;

		let mut cfg = SfuConfig::new(app_id, app_secret);
		if let Some(base_url) = self.sfu.base_url.clone() {
			cfg.base_url = base_url;
		}
		Some(cfg)
	}

	fn from_file(file: FileConfig) -> Self {
		let ttls_file = file.store.ttls;
		let defaults = TtlSettings::default();
		let ttls = TtlSettings {
			online_secs: ttls_file.online_ttl_secs.unwrap_or(defaults.online_secs),
			presence_secs: ttls_file.presence_ttl_secs.unwrap_or(defaults.presence_secs),
			typing_secs: ttls_file.typing_ttl_secs.unwrap_or(defaults.typing_secs),
			note_secs: ttls_file.note_ttl_secs.unwrap_or(defaults.note_secs),
			cursor_secs: ttls_file.cursor_ttl_secs.unwrap_or(defaults.cursor_secs),
			huddle_secs: ttls_file.huddle_ttl_secs.unwrap_or(defaults.huddle_secs),
			sfu_secs: ttls_file.sfu_ttl_secs.unwrap_or(defaults.sfu_secs),
		};

		let server_defaults = ServerSettings::default();

		Self {
			server: ServerSettings {
				listen: file.server.listen.filter(|s| !s.trim().is_empty()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				heartbeat_interval: file
					.server
					.heartbeat_interval_secs
					.map(Duration::from_secs)
					.unwrap_or(server_defaults.heartbeat_interval),
				presence_refresh_interval: file
					.server
					.presence_refresh_interval_secs
					.map(Duration::from_secs)
					.unwrap_or(server_defaults.presence_refresh_interval),
				presence_roster_cap: file
					.server
					.presence_roster_cap
					.unwrap_or(server_defaults.presence_roster_cap),
			},
			store: StoreSettings {
				redis_url: file.store.redis_url.filter(|s| !s.trim().is_empty()),
				ttls,
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			sfu: SfuSettings {
				app_id: file.sfu.app_id.filter(|s| !s.trim().is_empty()),
				app_secret: file.sfu.app_secret.filter(|s| !s.trim().is_empty()).map(SecretString::new),
				base_url: file.sfu.base_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	store: FileStoreSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	sfu: FileSfuSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	listen: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	heartbeat_interval_secs: Option<u64>,
	presence_refresh_interval_secs: Option<u64>,
	presence_roster_cap: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStoreSettings {
	redis_url: Option<String>,

	#[serde(flatten)]
	ttls: TtlSettingsFile,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TtlSettingsFile {
	online_ttl_secs: Option<u64>,
	presence_ttl_secs: Option<u64>,
	typing_ttl_secs: Option<u64>,
	note_ttl_secs: Option<u64>,
	cursor_ttl_secs: Option<u64>,
	huddle_ttl_secs: Option<u64>,
	sfu_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSfuSettings {
	app_id: Option<String>,
	app_secret: Option<String>,
	base_url: Option<String>,
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("CONFAB_LISTEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.listen = Some(v);
			info!("server config: listen overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONFAB_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONFAB_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONFAB_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONFAB_HEARTBEAT_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.server.heartbeat_interval = Duration::from_secs(secs);
		info!(secs, "server config: heartbeat_interval overridden by env");
	}

	if let Ok(v) = std::env::var("CONFAB_PRESENCE_REFRESH_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.server.presence_refresh_interval = Duration::from_secs(secs);
		info!(secs, "server config: presence_refresh_interval overridden by env");
	}

	if let Ok(v) = std::env::var("CONFAB_REDIS_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.store.redis_url = Some(v);
			info!("store config: redis_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONFAB_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONFAB_SFU_APP_ID") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.sfu.app_id = Some(v);
			info!("sfu config: app_id overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONFAB_SFU_APP_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.sfu.app_secret = Some(SecretString::new(v));
			info!("sfu config: app_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONFAB_SFU_BASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.sfu.base_url = Some(v);
			info!("sfu config: base_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CONFAB_ONLINE_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.store.ttls.online_secs = secs;
		info!(secs, "store config: online ttl overridden by env");
	}

	if let Ok(v) = std::env::var("CONFAB_PRESENCE_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.store.ttls.presence_secs = secs;
		info!(secs, "store config: presence ttl overridden by env");
	}

	if let Ok(v) = std::env::var("CONFAB_TYPING_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.store.ttls.typing_secs = secs;
		info!(secs, "store config: typing ttl overridden by env");
	}

	if let Ok(v) = std::env::var("CONFAB_NOTE_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.store.ttls.note_secs = secs;
		info!(secs, "store config: note ttl overridden by env");
	}

	if let Ok(v) = std::env::var("CONFAB_CURSOR_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.store.ttls.cursor_secs = secs;
		info!(secs, "store config: cursor ttl overridden by env");
	}

	if let Ok(v) = std::env::var("CONFAB_HUDDLE_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.store.ttls.huddle_secs = secs;
		info!(secs, "store config: huddle ttl overridden by env");
	}

	if let Ok(v) = std::env::var("CONFAB_SFU_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.store.ttls.sfu_secs = secs;
		info!(secs, "store config: sfu ttl overridden by env");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn listen_accepts_scheme_and_bare_hostport() {
		let with_scheme = parse_listen_addr("ws://127.0.0.1:8763").unwrap();
		let bare = parse_listen_addr("127.0.0.1:8763").unwrap();
		assert_eq!(with_scheme, bare);
		assert_eq!(with_scheme.port(), 8763);
	}

	#[test]
	fn listen_accepts_bracketed_ipv6_and_dns_names() {
		let v6 = parse_listen_addr("ws://[::1]:8763").unwrap();
		assert!(v6.is_ipv6());
		assert_eq!(v6.port(), 8763);

		let resolved = parse_listen_addr("localhost:8763").unwrap();
		assert_eq!(resolved.port(), 8763);
	}

	#[test]
	fn listen_rejects_tls_scheme() {
		let err = parse_listen_addr("wss://0.0.0.0:8763").unwrap_err();
		assert!(err.to_string().contains("fronting proxy"));
	}

	#[test]
	fn listen_rejects_paths_and_empty_input() {
		assert!(parse_listen_addr("ws://127.0.0.1:8763/ws/stream/").is_err());
		assert!(parse_listen_addr("127.0.0.1:8763?x=y").is_err());
		assert!(parse_listen_addr("  ").is_err());
	}

	#[test]
	fn listen_requires_a_port() {
		assert!(parse_listen_addr("ws://127.0.0.1").is_err());
		assert!(parse_listen_addr("localhost").is_err());
	}
}
