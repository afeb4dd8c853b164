/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_PORT: u16 = 17082;

/// Chat service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address of the messenger HTTP API
    pub api_addr: SocketAddr,

    /// Directory for the sled database (temporary database when unset)
    pub data_dir: Option<PathBuf>,

    /// Expected interval between client heartbeats
    pub heartbeat_interval: Duration,

    /// How long an online record survives without a heartbeat
    pub presence_grace: Duration,

    /// Default lifetime of a typing signal
    pub typing_ttl: Duration,

    /// Longest lifetime a client may request for a typing signal
    pub max_typing_ttl: Duration,

    /// Maximum message length in characters
    pub max_message_len: usize,

    /// Capacity of each broadcast topic
    pub event_buffer: usize,

    /// Attempts made to register a disconnect hook before giving up
    pub hook_retry_attempts: u32,

    /// First backoff delay between hook registration attempts
    pub hook_retry_base: Duration,

    /// Shared secret the roster service presents in `X-Roster-Token`.
    /// Roster writes over HTTP are refused while unset.
    pub roster_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_API_PORT)),
            data_dir: None,
            heartbeat_interval: Duration::from_secs(5),
            presence_grace: Duration::from_secs(15),
            typing_ttl: Duration::from_millis(2000),
            max_typing_ttl: Duration::from_secs(30),
            max_message_len: 4000,
            event_buffer: 256,
            hook_retry_attempts: 5,
            hook_retry_base: Duration::from_millis(50),
            roster_token: None,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(ChatError::Config(format!(
                "Usage: {} <port> [--data-dir <path>] [--typing-ttl-ms <n>] [--grace-ms <n>] [--heartbeat-ms <n>] [--roster-token <secret>]",
                args.first().map(String::as_str).unwrap_or("staffchat")
            )));
        }

        let port = args[1]
            .parse::<u16>()
            .map_err(|_| ChatError::Config("Port must be a valid number (0-65535)".to_string()))?;

        let mut config = Config {
            api_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            ..Default::default()
        };

        let mut i = 2;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = args.get(i + 1).ok_or_else(|| {
                ChatError::Config(format!("{} requires an argument", flag))
            })?;
            match flag {
                "--data-dir" => config.data_dir = Some(PathBuf::from(value)),
                "--typing-ttl-ms" => config.typing_ttl = parse_millis(flag, value)?,
                "--grace-ms" => config.presence_grace = parse_millis(flag, value)?,
                "--heartbeat-ms" => config.heartbeat_interval = parse_millis(flag, value)?,
                "--roster-token" => config.roster_token = Some(value.clone()),
                other => {
                    return Err(ChatError::Config(format!("Unknown flag: {}", other)));
                }
            }
            i += 2;
        }

        // Env overrides (nice for scripts)
        if let Ok(dir) = std::env::var("STAFFCHAT_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(ms) = env_millis("STAFFCHAT_TYPING_TTL_MS") {
            config.typing_ttl = ms;
        }
        if let Some(ms) = env_millis("STAFFCHAT_PRESENCE_GRACE_MS") {
            config.presence_grace = ms;
        }
        if let Ok(token) = std::env::var("STAFFCHAT_ROSTER_TOKEN") {
            config.roster_token = Some(token);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the liveness and typing timers cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() || self.typing_ttl.is_zero() {
            return Err(ChatError::Config(
                "heartbeat interval and typing ttl must be non-zero".to_string(),
            ));
        }
        if self.typing_ttl > self.max_typing_ttl {
            return Err(ChatError::Config(
                "default typing ttl exceeds the typing ttl limit".to_string(),
            ));
        }
        if self.roster_token.as_deref().map_or(false, |t| t.trim().is_empty()) {
            return Err(ChatError::Config("roster token must not be blank".to_string()));
        }
        if self.presence_grace < self.heartbeat_interval {
            return Err(ChatError::Config(
                "presence grace must cover at least one heartbeat interval".to_string(),
            ));
        }
        if self.event_buffer == 0 || self.max_message_len == 0 {
            return Err(ChatError::Config(
                "event buffer and message length limit must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_millis(flag: &str, value: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ChatError::Config(format!("{} must be a number of milliseconds", flag)))
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_args_flags() {
        let config = Config::from_args(&args(&[
            "staffchat",
            "18000",
            "--typing-ttl-ms",
            "1500",
            "--heartbeat-ms",
            "1000",
            "--grace-ms",
            "3000",
        ]))
        .unwrap();

        assert_eq!(config.api_addr.port(), 18000);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1000));
        assert_eq!(config.presence_grace, Duration::from_millis(3000));
    }

    #[test]
    fn test_from_args_rejects_missing_port() {
        assert!(matches!(
            Config::from_args(&args(&["staffchat"])),
            Err(ChatError::Config(_))
        ));
        assert!(Config::from_args(&args(&["staffchat", "notaport"])).is_err());
    }

    #[test]
    fn test_validate_grace_shorter_than_heartbeat() {
        let config = Config {
            heartbeat_interval: Duration::from_secs(10),
            presence_grace: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_typing_ttl_limit() {
        let config = Config {
            typing_ttl: Duration::from_secs(60),
            max_typing_ttl: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ChatError::Config(_))));
    }

    #[test]
    fn test_roster_token_flag() {
        let config =
            Config::from_args(&args(&["staffchat", "18000", "--roster-token", "s3cret"])).unwrap();
        assert_eq!(config.roster_token.as_deref(), Some("s3cret"));
        assert!(Config::default().roster_token.is_none());
    }
}
