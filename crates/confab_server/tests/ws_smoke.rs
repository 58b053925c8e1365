#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use confab_domain::{RoomId, UserId};
use confab_server::server::auth::{AuthClaims, AuthVerifier, mint_hmac_token};
use confab_server::server::group_hub::{GroupHub, GroupHubConfig};
use confab_server::server::repo::ChatRepo;
use confab_server::server::store::StateStore;
use confab_server::server::{GatewaySettings, ServerContext, run};
use confab_sfu::SecretString;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const SECRET: &str = "smoke-secret";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_gateway(settings: GatewaySettings) -> (SocketAddr, Arc<ServerContext>) {
	let ctx = Arc::new(ServerContext {
		store: StateStore::in_memory(),
		repo: ChatRepo::connect("sqlite::memory:").await.expect("connect sqlite"),
		hub: GroupHub::local(GroupHubConfig::default()),
		verifier: AuthVerifier::new(SecretString::new(SECRET)),
		sfu: None,
		settings,
	});

	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
	let addr = listener.local_addr().expect("local addr");

	let server_ctx = Arc::clone(&ctx);
	tokio::spawn(async move {
		let _ = run(listener, server_ctx).await;
	});

	(addr, ctx)
}

fn token_for(user_id: UserId, name: &str) -> String {
	let exp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 3600;
	mint_hmac_token(
		&AuthClaims {
			sub: user_id.as_i64(),
			name: name.to_string(),
			avatar: None,
			exp,
		},
		SECRET,
	)
}

async fn connect(addr: SocketAddr) -> Socket {
	let (ws, _) = connect_async(format!("ws://{addr}/ws/stream/")).await.expect("ws connect");
	ws
}

async fn next_json(ws: &mut Socket) -> Value {
	loop {
		let frame = timeout(Duration::from_secs(2), ws.next())
			.await
			.expect("frame within timeout")
			.expect("socket open")
			.expect("socket read");
		if let Message::Text(text) = frame {
			return serde_json::from_str(text.as_str()).expect("valid frame json");
		}
	}
}

async fn send_json(ws: &mut Socket, frame: &str) {
	ws.send(Message::text(frame)).await.expect("socket send");
}

/// Connect and authenticate; drains `auth.required` and `auth.success`.
async fn authed_socket(addr: SocketAddr, user_id: UserId, name: &str) -> (Socket, Value) {
	let mut ws = connect(addr).await;

	let required = next_json(&mut ws).await;
	assert_eq!(required["type"], "auth.required");

	send_json(&mut ws, &format!(r#"{{"type":"auth","token":"{}"}}"#, token_for(user_id, name))).await;
	let success = next_json(&mut ws).await;
	assert_eq!(success["type"], "auth.success");
	assert_eq!(success["user"]["id"], user_id.as_i64());

	(ws, success)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auth_then_subscribe_roundtrip() {
	let (addr, ctx) = start_gateway(GatewaySettings::default()).await;

	let ada = ctx.repo.create_user("ada", None).await.unwrap();
	let brin = ctx.repo.create_user("brin", None).await.unwrap();
	let room = ctx.repo.create_room(None, false, ada, &[brin]).await.unwrap();
	let room_id = RoomId(room.id);

	let (mut ws, success) = authed_socket(addr, ada, "ada").await;
	assert!(
		success["online_users"]
			.as_array()
			.unwrap()
			.contains(&Value::from(ada.as_i64()))
	);

	send_json(&mut ws, &format!(r#"{{"type":"chat.subscribe","room_id":{room_id}}}"#)).await;
	let subscribed = next_json(&mut ws).await;
	assert_eq!(subscribed["type"], "chat.subscribed");
	assert_eq!(subscribed["room_id"], room_id.as_i64());
	assert_eq!(subscribed["presence"]["count"], 1);
	assert_eq!(subscribed["presence"]["truncated"], false);
	assert_eq!(subscribed["presence"]["users"][0]["id"], ada.as_i64());

	let _ = ws.close(None).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn message_fan_out_between_two_sockets() {
	let (addr, ctx) = start_gateway(GatewaySettings::default()).await;

	let ada = ctx.repo.create_user("ada", None).await.unwrap();
	let brin = ctx.repo.create_user("brin", None).await.unwrap();
	let room = ctx.repo.create_room(None, false, ada, &[brin]).await.unwrap();
	let room_id = RoomId(room.id);

	let (mut s1, _) = authed_socket(addr, ada, "ada").await;
	send_json(&mut s1, &format!(r#"{{"type":"chat.subscribe","room_id":{room_id}}}"#)).await;
	let _subscribed = next_json(&mut s1).await;
	let _own_join = next_json(&mut s1).await;

	let (mut s2, _) = authed_socket(addr, brin, "brin").await;
	send_json(&mut s2, &format!(r#"{{"type":"chat.subscribe","room_id":{room_id}}}"#)).await;
	let _subscribed = next_json(&mut s2).await;
	let _own_join = next_json(&mut s2).await;
	// s1 additionally observes brin going online and joining.
	let _brin_online = next_json(&mut s1).await;
	let _brin_join = next_json(&mut s1).await;

	send_json(&mut s1, &format!(r#"{{"type":"chat.send_message","room_id":{room_id},"content":"hi"}}"#)).await;

	for ws in [&mut s1, &mut s2] {
		let message = next_json(ws).await;
		assert_eq!(message["type"], "chat.message");
		assert_eq!(message["room_id"], room_id.as_i64());
		assert_eq!(message["message"]["content"], "hi");
		assert_eq!(message["message"]["sender"]["id"], ada.as_i64());
		assert_eq!(message["message"]["is_edited"], false);
	}

	let _ = s1.close(None).await;
	let _ = s2.close(None).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_sockets_are_reaped_even_while_pinging() {
	let settings = GatewaySettings {
		heartbeat_interval: Duration::from_millis(200),
		..GatewaySettings::default()
	};
	let (addr, ctx) = start_gateway(settings).await;

	let ada = ctx.repo.create_user("ada", None).await.unwrap();
	let brin = ctx.repo.create_user("brin", None).await.unwrap();

	let (mut observer, _) = authed_socket(addr, brin, "brin").await;
	let (mut idle, _) = authed_socket(addr, ada, "ada").await;
	// The observer connected first and sees ada come online.
	let online = next_json(&mut observer).await;
	assert_eq!(online["type"], "global.user_online");

	// Protocol pings are liveness probes; they must not reset the idle
	// clock, so the reaper still fires.
	let mut saw_pong = false;
	let mut close_code = None;
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

	while tokio::time::Instant::now() < deadline {
		let _ = idle.send(Message::text(r#"{"type":"ping"}"#)).await;

		match timeout(Duration::from_millis(150), idle.next()).await {
			Ok(Some(Ok(Message::Text(text)))) => {
				let value: Value = serde_json::from_str(text.as_str()).unwrap();
				if value["type"] == "pong" {
					saw_pong = true;
				}
			}
			Ok(Some(Ok(Message::Close(frame)))) => {
				close_code = frame.map(|f| u16::from(f.code));
				break;
			}
			Ok(Some(Ok(_))) => {}
			Ok(Some(Err(_))) | Ok(None) => break,
			Err(_) => {}
		}
	}

	assert!(saw_pong, "pings were answered before the reap");
	assert_eq!(close_code, Some(4002), "idle connection closes with 4002");

	// The rest of the gateway hears exactly one offline broadcast.
	let offline = next_json(&mut observer).await;
	assert_eq!(offline["type"], "global.user_offline");
	assert_eq!(offline["user_id"], ada.as_i64());
	assert!(
		timeout(Duration::from_millis(300), observer.next()).await.is_err(),
		"no duplicate offline broadcast"
	);

	let _ = observer.close(None).await;
}
