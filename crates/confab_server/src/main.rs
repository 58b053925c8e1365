#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use confab_server::config;
use confab_server::server::auth::AuthVerifier;
use confab_server::server::group_hub::{GroupHub, GroupHubConfig};
use confab_server::server::health::{HealthState, spawn_health_server};
use confab_server::server::repo::ChatRepo;
use confab_server::server::store::StateStore;
use confab_server::server::{ServerContext, run};
use confab_sfu::SfuClient;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_DATABASE_URL: &str = "sqlite:confab.db?mode=rwc";
const DEFAULT_LISTEN: &str = "ws://127.0.0.1:8763";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: confab_server [--bind ws://host:port]\n\
\n\
Options:\n\
\t--bind    Listen endpoint (default: ws://127.0.0.1:8763)\n\
\t         Format: ws://host:port or host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

/// `--bind` overrides both the config file and `CONFAB_LISTEN`.
fn parse_args() -> Option<String> {
	let mut bind_endpoint = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				bind_endpoint = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind_endpoint
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,confab_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("confab_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_arg = parse_args();

	let config_path = config::default_config_path()?;
	let server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let listen = bind_arg
		.or_else(|| server_cfg.server.listen.clone())
		.unwrap_or_else(|| DEFAULT_LISTEN.to_string());
	let bind_addr = config::parse_listen_addr(&listen).context("resolve listen endpoint")?;

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let Some(auth_secret) = server_cfg.server.auth_hmac_secret.clone() else {
		return Err(anyhow::anyhow!(
			"auth_hmac_secret is required (config [server] or CONFAB_AUTH_HMAC_SECRET)"
		));
	};

	let (store, hub) = match server_cfg.store.redis_url.as_deref() {
		Some(redis_url) => {
			let store = StateStore::connect_redis(redis_url)
				.await
				.map_err(|e| anyhow::anyhow!("connect redis: {e}"))?;
			let hub = GroupHub::with_redis(GroupHubConfig::default(), redis_url)
				.await
				.context("connect redis pub/sub")?;
			info!("state store and channel layer on redis");
			(store, hub)
		}
		None => {
			warn!("no redis_url configured; using in-process state store and channel layer (single node only)");
			(StateStore::in_memory(), GroupHub::local(GroupHubConfig::default()))
		}
	};

	let database_url = server_cfg
		.persistence
		.database_url
		.clone()
		.unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
	let repo = ChatRepo::connect(&database_url).await.context("connect database")?;
	info!("database connected and migrated");

	let health_state = HealthState::new(store.clone(), repo.clone());
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let sfu = match server_cfg.sfu_config() {
		Some(cfg) => {
			let client = SfuClient::new(cfg).context("build sfu client")?;
			info!("sfu provider configured; huddle upgrade enabled");
			Some(client)
		}
		None => {
			info!("sfu provider not configured; huddles stay P2P");
			None
		}
	};

	let ctx = Arc::new(ServerContext {
		store,
		repo,
		hub,
		verifier: AuthVerifier::new(auth_secret),
		sfu,
		settings: server_cfg.gateway_settings(),
	});

	let listener = TcpListener::bind(bind_addr).await.context("bind websocket listener")?;
	info!(bind = %bind_addr, path = confab_protocol::WS_ENDPOINT_PATH, "websocket gateway listening");

	health_state.mark_accepting();

	run(listener, ctx).await
}
