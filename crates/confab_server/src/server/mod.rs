#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod group_hub;
pub mod health;
pub mod huddle;
pub mod messages;
pub mod presence;
pub mod repo;
pub mod store;

#[cfg(test)]
mod connection_tests;


#[cfg(test)]
mod presence_tests;


#[cfg(test)]
mod store_tests;

use std::sync::Arc;
use std::time::Duration;

use confab_sfu::SfuClient;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::auth::AuthVerifier;
use crate::server::group_hub::GroupHub;
use crate::server::repo::ChatRepo;
use crate::server::store::{StateStore, TtlSettings};

/// Per-gateway tuning shared by every connection.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
	/// Idle-reaper tick; a connection is reaped after 3 missed intervals.
	pub heartbeat_interval: Duration,
	/// Server-driven presence refresh cadence.
	pub presence_refresh_interval: Duration,
	/// Presence payloads above this roster size are truncated.
	pub presence_roster_cap: usize,
	pub ttls: TtlSettings,
}

impl Default for GatewaySettings {
	fn default() -> Self {
		Self {
			heartbeat_interval: Duration::from_secs(30),
			presence_refresh_interval: Duration::from_secs(120),
			presence_roster_cap: 50,
			ttls: TtlSettings::default(),
		}
	}
}

/// Shared services handed to every connection handler.
pub struct ServerContext {
	pub store: StateStore,
	pub repo: ChatRepo,
	pub hub: GroupHub,
	pub verifier: AuthVerifier,
	pub sfu: Option<SfuClient>,
	pub settings: GatewaySettings,
}

/// Accept loop: one task per connection.
pub async fn run(listener: TcpListener, ctx: Arc<ServerContext>) -> anyhow::Result<()> {
	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = listener.accept().await?;

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("confab_server_connections_total").increment(1);

		let ctx = Arc::clone(&ctx);
		tokio::spawn(async move {
			tracing::info!(conn_id, remote = %remote, "accepted connection");
			if let Err(e) = connection::handle_connection(conn_id, stream, ctx).await {
				warn!(conn_id, error = %e, "connection handler exited with error");
			}
		});
	}
}
