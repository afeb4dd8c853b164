/// Messenger HTTP API over a real socket
mod common;

use common::{branch_service, user, ROSTER_TOKEN};
use staffchat_core::messenger_api;
use staffchat_core::ConversationId;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

async fn start_api() -> SocketAddr {
    let service = branch_service().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(messenger_api::serve(listener, service));
    addr
}

/// Send one request as `who` (a b1 user) and return (status code, body)
async fn request(addr: SocketAddr, method: &str, path: &str, who: Option<&str>, body: &str) -> (u16, String) {
    let headers = who
        .map(|user_id| format!("X-User-Id: {}\r\nX-Branch-Id: b1\r\n", user_id))
        .unwrap_or_default();
    raw_request(addr, method, path, &headers, body).await
}

/// Send one request with pre-rendered extra header lines
async fn raw_request(addr: SocketAddr, method: &str, path: &str, headers: &str, body: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut head = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n",
        method,
        path,
        body.len()
    );
    head.push_str(headers);
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(body.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let text = String::from_utf8_lossy(&raw).to_string();
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = text.split("\r\n\r\n").nth(1).unwrap_or("").to_string();
    (status, body)
}

#[tokio::test]
async fn test_send_and_read_over_http() {
    let addr = start_api().await;
    let conv = ConversationId::new(&user("u1").user_id, &user("u2").user_id);
    let path = format!("/api/conversations/{}/messages", conv);

    let (status, body) = request(addr, "POST", &path, Some("u1"), r#"{"text":"Order ready"}"#).await;
    assert_eq!(status, 200, "{}", body);
    let sent: serde_json::Value = serde_json::from_str(&body).unwrap();
    let id = sent["message"]["id"].as_str().unwrap().to_string();

    let (status, body) = request(addr, "GET", &path, Some("u2"), "").await;
    assert_eq!(status, 200);
    let view: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(view["unread_count"], 1);

    let (status, _) = request(addr, "POST", &format!("/api/messages/{}/read", id), Some("u2"), "").await;
    assert_eq!(status, 200);

    let (_, body) = request(addr, "GET", &path, Some("u2"), "").await;
    let view: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(view["unread_count"], 0);
    assert_eq!(view["messages"][0]["delivery_state"], "read");
}

#[tokio::test]
async fn test_error_statuses() {
    let addr = start_api().await;
    let conv = ConversationId::new(&user("u1").user_id, &user("u2").user_id);
    let path = format!("/api/conversations/{}/messages", conv);

    let (status, _) = request(addr, "GET", "/api/conversations", None, "").await;
    assert_eq!(status, 403);

    let (status, _) = request(addr, "POST", &path, Some("u1"), r#"{"text":"  "}"#).await;
    assert_eq!(status, 400);

    let (status, _) = request(addr, "GET", &path, Some("u3"), "").await;
    assert_eq!(status, 403);

    let (status, _) = request(addr, "POST", "/api/messages/m-missing/read", Some("u1"), "").await;
    assert_eq!(status, 404);

    let (status, _) = request(addr, "GET", "/api/nowhere", Some("u1"), "").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_roster_refresh_over_http() {
    let addr = start_api().await;
    let roster = r#"[{"user_id":"u1","name":"Ann"},{"user_id":"u5","name":"Eve"}]"#;
    let token = format!("X-Roster-Token: {}\r\n", ROSTER_TOKEN);
    let (status, body) = raw_request(addr, "PUT", "/api/roster/b1", &token, roster).await;
    assert_eq!(status, 200, "{}", body);

    let (status, body) = request(addr, "GET", "/api/conversations", Some("u1"), "").await;
    assert_eq!(status, 200);
    let list: serde_json::Value = serde_json::from_str(&body).unwrap();
    let conversations = list["conversations"].as_array().unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0]["other_participant"]["name"], "Eve");
}

#[tokio::test]
async fn test_roster_write_requires_token() {
    let addr = start_api().await;
    let roster = r#"[{"user_id":"u1","name":"Ann"},{"user_id":"u7","name":"Mallory"}]"#;

    let (status, _) = request(addr, "PUT", "/api/roster/b1", None, roster).await;
    assert_eq!(status, 403);
    let (status, _) = request(addr, "PUT", "/api/roster/b1", Some("u1"), roster).await;
    assert_eq!(status, 403);
    let (status, _) = raw_request(addr, "PUT", "/api/roster/b1", "X-Roster-Token: guess\r\n", roster).await;
    assert_eq!(status, 403);

    // Roster untouched: u1 still sees Bo and Cy, not Mallory
    let (_, body) = request(addr, "GET", "/api/conversations", Some("u1"), "").await;
    let list: serde_json::Value = serde_json::from_str(&body).unwrap();
    let names: Vec<_> = list["conversations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["other_participant"]["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["Bo", "Cy"]);
}

#[tokio::test]
async fn test_oversized_typing_ttl_rejected() {
    let addr = start_api().await;
    let conv = ConversationId::new(&user("u1").user_id, &user("u2").user_id);
    let path = format!("/api/conversations/{}/typing", conv);

    let body = format!(r#"{{"typing":true,"ttl_ms":{}}}"#, i64::MAX);
    let (status, _) = request(addr, "POST", &path, Some("u1"), &body).await;
    assert_eq!(status, 400);

    let (status, _) = request(addr, "POST", &path, Some("u1"), r#"{"typing":true,"ttl_ms":500}"#).await;
    assert_eq!(status, 200);
}
