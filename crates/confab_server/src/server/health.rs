#![forbid(unsafe_code)]

//! Liveness and readiness endpoints. Liveness is unconditional;
//! readiness reflects what this gateway actually depends on: the
//! websocket accept loop being up, the state store answering, and the
//! database answering.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::repo::ChatRepo;
use crate::server::store::StateStore;

#[derive(Clone)]
pub struct HealthState {
	accepting: Arc<AtomicBool>,
	store: StateStore,
	repo: ChatRepo,
}

impl HealthState {
	pub fn new(store: StateStore, repo: ChatRepo) -> Self {
		Self {
			accepting: Arc::new(AtomicBool::new(false)),
			store,
			repo,
		}
	}

	/// Flip once the websocket listener is bound and accepting.
	pub fn mark_accepting(&self) {
		self.accepting.store(true, Ordering::Relaxed);
	}

	/// Probe every dependency a connection would hit. Returns the name of
	/// the first one that is not answering.
	async fn readiness(&self) -> Result<(), &'static str> {
		if !self.accepting.load(Ordering::Relaxed) {
			return Err("starting");
		}

		if self.store.ping().await.is_err() {
			return Err("state store");
		}

		if self.repo.ping().await.is_err() {
			return Err("database");
		}

		Ok(())
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| {
				let state = state.clone();
				async move { handle_health(req, state).await }
			});
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn plain(status: StatusCode, body: String) -> Response<Full<Bytes>> {
	let mut response = Response::new(Full::new(Bytes::from(body)));
	*response.status_mut() = status;
	response
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	metrics::counter!("confab_server_health_requests_total").increment(1);

	if req.method() != Method::GET {
		return Ok(plain(StatusCode::METHOD_NOT_ALLOWED, String::new()));
	}

	match req.uri().path() {
		"/healthz" => Ok(plain(StatusCode::OK, "ok".to_string())),
		"/readyz" => match state.readiness().await {
			Ok(()) => Ok(plain(StatusCode::OK, "ready".to_string())),
			Err(dependency) => {
				metrics::counter!("confab_server_readiness_failures_total").increment(1);
				Ok(plain(StatusCode::SERVICE_UNAVAILABLE, format!("not-ready: {dependency}")))
			}
		},
		_ => Ok(plain(StatusCode::NOT_FOUND, String::new())),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn readiness_waits_for_the_accept_loop() {
		let state = HealthState::new(
			StateStore::in_memory(),
			ChatRepo::connect("sqlite::memory:").await.expect("connect sqlite"),
		);

		assert_eq!(state.readiness().await, Err("starting"));

		state.mark_accepting();
		assert_eq!(state.readiness().await, Ok(()));
	}
}
