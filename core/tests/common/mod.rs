#![allow(dead_code)]
/// Shared fixtures for integration tests
use staffchat_core::chat_types::{BranchId, RosterEntry};
use staffchat_core::{ChatService, Config, Identity, UserId};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

pub fn entry(id: &str, name: &str) -> RosterEntry {
    RosterEntry {
        user_id: UserId::from(id),
        name: name.to_string(),
        email: format!("{}@branch.test", id),
        role: "staff".to_string(),
        avatar_url: None,
    }
}

pub const ROSTER_TOKEN: &str = "roster-secret";

pub fn fast_config() -> Config {
    Config {
        heartbeat_interval: Duration::from_millis(20),
        presence_grace: Duration::from_millis(80),
        typing_ttl: Duration::from_millis(200),
        max_typing_ttl: Duration::from_secs(5),
        roster_token: Some(ROSTER_TOKEN.to_string()),
        ..Default::default()
    }
}

/// Service with branch b1 = {u1 Ann, u2 Bo, u3 Cy} and branch b2 = {u9 Zed}
pub async fn branch_service() -> ChatService {
    let service = ChatService::new(fast_config()).unwrap();
    service
        .roster()
        .replace_branch(
            &BranchId::from("b1"),
            vec![entry("u1", "Ann"), entry("u2", "Bo"), entry("u3", "Cy")],
        )
        .await
        .unwrap();
    service
        .roster()
        .replace_branch(&BranchId::from("b2"), vec![entry("u9", "Zed")])
        .await
        .unwrap();
    service
}

pub fn user(id: &str) -> Identity {
    let branch = if id == "u9" { "b2" } else { "b1" };
    Identity::new(id, branch)
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}
