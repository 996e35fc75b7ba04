//! End-to-end tests against a real server on a loopback port.

use futures_util::{SinkExt, StreamExt};
use hubbub_core::Hub;
use hubbub_server::auth::sha256_hex;
use hubbub_server::{AppState, Config};
use reqwest::StatusCode;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ADMIN_PASSWORD: &str = "correct horse";

struct TestServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    http: reqwest::Client,
}

fn test_config() -> Config {
    let mut config: Config = toml::from_str("").unwrap();
    config.base_path = "/chat".to_string();
    config.banned_nicknames = vec!["admin".to_string()];
    config.metrics.enabled = false;
    config.admin.password_sha256 = Some(sha256_hex(ADMIN_PASSWORD.as_bytes()));
    config
}

async fn start(config: Config) -> TestServer {
    let (hub, _task) = Hub::spawn(config.hub_config());
    let state = Arc::new(AppState::new(config, hub));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(hubbub_server::serve(listener, Arc::clone(&state)));

    TestServer {
        addr,
        state,
        http: reqwest::Client::new(),
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Open a streaming connection that appears to come from `ip` (the
    /// server trusts `X-Real-IP` from loopback).
    async fn connect(&self, ip: &str) -> Result<Client, tungstenite::Error> {
        let mut request = format!("ws://{}/chat/ws", self.addr)
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("x-real-ip", ip.parse().unwrap());
        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(ws)
    }

    async fn wait_for_connections(&self, expected: usize) {
        for _ in 0..500 {
            if self.state.hub.connection_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} connections, hub has {}",
            expected,
            self.state.hub.connection_count()
        );
    }

    async fn post(&self, nickname: &str, content: &str) -> reqwest::Response {
        self.http
            .post(self.url("/chat/messages"))
            .form(&[("nickname", nickname), ("content", content)])
            .send()
            .await
            .unwrap()
    }

    async fn login(&self, password: &str) -> reqwest::Response {
        self.http
            .post(self.url("/admin/login"))
            .form(&[("password", password)])
            .send()
            .await
            .unwrap()
    }

    async fn delete(&self, id: i64, cookie: Option<&str>) -> reqwest::Response {
        let mut request = self.http.delete(self.url(&format!("/chat/messages/{id}")));
        if let Some(cookie) = cookie {
            request = request.header("cookie", cookie);
        }
        request.send().await.unwrap()
    }
}

/// Next event pushed to `ws`, skipping keepalives.
async fn next_event(ws: &mut Client) -> Value {
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    });
    deadline.await.expect("no event within 5s")
}

#[tokio::test]
async fn test_posted_message_reaches_connected_peers() {
    let server = start(test_config()).await;

    let mut a = server.connect("10.0.0.1").await.unwrap();
    let mut b = server.connect("10.0.0.2").await.unwrap();
    let mut gone = server.connect("10.0.0.3").await.unwrap();
    server.wait_for_connections(3).await;

    gone.close(None).await.unwrap();
    server.wait_for_connections(2).await;

    let response = server.post("alice", "hello everyone").await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let stored: Value = response.json().await.unwrap();
    assert_eq!(stored["id"], 1);
    assert_eq!(stored["nickname"], "alice");

    for ws in [&mut a, &mut b] {
        let event = next_event(ws).await;
        assert_eq!(event["type"], "new_message");
        assert_eq!(event["data"]["id"], 1);
        assert_eq!(event["data"]["content"], "hello everyone");
        assert!(event["data"]["formattedTime"].is_string());
    }
}

#[tokio::test]
async fn test_oversized_nickname_still_broadcast() {
    let server = start(test_config()).await;
    let mut peer = server.connect("10.0.3.1").await.unwrap();
    server.wait_for_connections(1).await;

    let response = server.post(&"n".repeat(70_000), "hi").await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let stored: Value = response.json().await.unwrap();
    let nickname = stored["nickname"].as_str().unwrap().to_string();
    assert_eq!(nickname.chars().count(), 64);

    let event = next_event(&mut peer).await;
    assert_eq!(event["type"], "new_message");
    assert_eq!(event["data"]["id"], stored["id"]);
    assert_eq!(event["data"]["nickname"], nickname.as_str());
}

#[tokio::test]
async fn test_delete_requires_admin_session() {
    let server = start(test_config()).await;
    let mut peer = server.connect("10.0.1.1").await.unwrap();
    server.wait_for_connections(1).await;

    let stored: Value = server.post("bob", "delete me").await.json().await.unwrap();
    let id = stored["id"].as_i64().unwrap();
    assert_eq!(next_event(&mut peer).await["type"], "new_message");

    assert_eq!(server.delete(id, None).await.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        server.delete(id, Some("admin_session=forged")).await.status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(server.login("wrong").await.status(), StatusCode::UNAUTHORIZED);

    let login = server.login(ADMIN_PASSWORD).await;
    assert_eq!(login.status(), StatusCode::OK);
    let set_cookie = login.headers()["set-cookie"].to_str().unwrap().to_string();
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("Max-Age=36000"));
    let cookie = set_cookie.split(';').next().unwrap();

    assert_eq!(server.delete(id, Some(cookie)).await.status(), StatusCode::OK);
    let event = next_event(&mut peer).await;
    assert_eq!(event["type"], "delete_message");
    assert_eq!(event["data"], id);

    assert_eq!(server.delete(id, Some(cookie)).await.status(), StatusCode::NOT_FOUND);
    let missing = server
        .http
        .get(server.url(&format!("/chat/message/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_seventh_connection_from_one_address_rejected() {
    let server = start(test_config()).await;

    let mut held = Vec::new();
    for _ in 0..6 {
        held.push(server.connect("192.0.2.7").await.unwrap());
    }

    match server.connect("192.0.2.7").await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 429);
        }
        other => panic!("expected 429, got {:?}", other.map(|_| ())),
    }

    // Another address is unaffected.
    let _other = server.connect("192.0.2.8").await.unwrap();
    server.wait_for_connections(7).await;

    // Closing one frees a slot once the server tears it down.
    let mut first = held.remove(0);
    first.close(None).await.unwrap();
    for _ in 0..500 {
        if server.state.admission.active("192.0.2.7") < 6 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(server.connect("192.0.2.7").await.is_ok());
}

#[tokio::test]
async fn test_flooding_peer_is_disconnected() {
    let server = start(test_config()).await;
    let mut ws = server.connect("10.0.2.1").await.unwrap();
    server.wait_for_connections(1).await;

    for i in 0..6 {
        // The server may already be closing by the last send.
        let _ = ws.send(Message::Text(format!("spam {i}"))).await;
    }

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "server kept the flooding connection open");

    server.wait_for_connections(0).await;
}

#[tokio::test]
async fn test_message_routes() {
    let server = start(test_config()).await;

    let empty = server.post("carol", "").await;
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    let body: Value = empty.json().await.unwrap();
    assert!(body["error"].is_string());

    assert_eq!(
        server.post("superadmin", "hi").await.status(),
        StatusCode::FORBIDDEN
    );

    let anonymous: Value = server.post("", "first").await.json().await.unwrap();
    assert_eq!(anonymous["nickname"], "anonymous");

    let json = server
        .http
        .post(server.url("/chat/messages"))
        .json(&serde_json::json!({ "nickname": "dave", "content": "x".repeat(5000) }))
        .send()
        .await
        .unwrap();
    assert_eq!(json.status(), StatusCode::CREATED);
    let stored: Value = json.json().await.unwrap();
    assert_eq!(stored["content"].as_str().unwrap().chars().count(), 4000);

    let all: Vec<Value> = server
        .http
        .get(server.url("/chat/messages"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<_> = all.iter().map(|m| m["id"].as_i64().unwrap()).collect();
    assert_eq!(ids, vec![1, 2]);

    let one: Value = server
        .http
        .get(server.url("/chat/message/2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(one["nickname"], "dave");

    let health: Value = server
        .http
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 0);
}
