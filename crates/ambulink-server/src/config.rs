//! Bridge configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the bridge can start with zero
//! configuration against a local broker.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use ambulink_net::{BrokerConfig, LastWillMessage, QoS};
use ambulink_shared::constants::{
    DEFAULT_BROKER_PORT, DEFAULT_HTTP_PORT, DEFAULT_KEEP_ALIVE_SECS,
    DEFAULT_RECONNECT_MAX_BACKOFF_MS, DEFAULT_RETRY_INTERVAL_MS, MAX_CLIENT_ID_LEN,
};
use ambulink_shared::{topics, ClientStatus};

/// Bridge configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Env: `BROKER_HOST`, default `127.0.0.1`
    pub broker_host: String,

    /// Env: `BROKER_PORT`, default `1883`
    pub broker_port: u16,

    /// Broker account of the bridge itself; must be a superuser.
    /// Env: `BROKER_USERNAME`, default `ambulink`
    pub broker_username: String,

    /// Env: `BROKER_PASSWORD`, default empty
    pub broker_password: String,

    /// Env: `BROKER_CLIENT_ID`, default `ambulink-bridge-{uuid}`
    pub broker_client_id: String,

    /// Env: `BROKER_KEEP_ALIVE_SECS`, default `30`
    pub keep_alive: Duration,

    /// Env: `RECONNECT_MAX_BACKOFF_MS`, default `30000`
    pub max_backoff: Duration,

    /// Env: `RETRY_INTERVAL_MS`, default `5000`
    pub retry_interval: Duration,

    /// Env: `DATABASE_PATH`, default `./ambulink.db`
    pub database_path: PathBuf,

    /// Socket address of the HTTP surface (ACL hook, session upsert, admin).
    /// Env: `HTTP_ADDR`, default `0.0.0.0:8000`
    pub http_addr: SocketAddr,

    /// Bearer token for `/admin/*` and `/api/*`. Unset disables both.
    /// Env: `ADMIN_TOKEN`
    pub admin_token: Option<String>,

    /// Publish retained state for every resource at startup.
    /// Env: `SEED_ON_START` (true/false), default `true`
    pub seed_on_start: bool,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("broker_host", &self.broker_host)
            .field("broker_port", &self.broker_port)
            .field("broker_username", &self.broker_username)
            .field("broker_client_id", &self.broker_client_id)
            .field("keep_alive", &self.keep_alive)
            .field("max_backoff", &self.max_backoff)
            .field("retry_interval", &self.retry_interval)
            .field("database_path", &self.database_path)
            .field("http_addr", &self.http_addr)
            .field("admin_enabled", &self.admin_token.is_some())
            .field("seed_on_start", &self.seed_on_start)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: DEFAULT_BROKER_PORT,
            broker_username: "ambulink".to_string(),
            broker_password: String::new(),
            broker_client_id: format!("ambulink-bridge-{}", uuid::Uuid::new_v4().simple()),
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            max_backoff: Duration::from_millis(DEFAULT_RECONNECT_MAX_BACKOFF_MS),
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            database_path: PathBuf::from("./ambulink.db"),
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            admin_token: None,
            seed_on_start: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("BROKER_HOST") {
            config.broker_host = host;
        }

        if let Some(port) = parse_var::<u16>("BROKER_PORT") {
            config.broker_port = port;
        }

        if let Ok(username) = std::env::var("BROKER_USERNAME") {
            config.broker_username = username;
        }

        if let Ok(password) = std::env::var("BROKER_PASSWORD") {
            config.broker_password = password;
        }

        if let Ok(client_id) = std::env::var("BROKER_CLIENT_ID") {
            if client_id.is_empty() || client_id.len() > MAX_CLIENT_ID_LEN {
                tracing::warn!(value = %client_id, "Invalid BROKER_CLIENT_ID, using default");
            } else {
                config.broker_client_id = client_id;
            }
        }

        if let Some(secs) = parse_var::<u64>("BROKER_KEEP_ALIVE_SECS") {
            config.keep_alive = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_var::<u64>("RECONNECT_MAX_BACKOFF_MS") {
            config.max_backoff = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_var::<u64>("RETRY_INTERVAL_MS") {
            config.retry_interval = Duration::from_millis(ms.max(1));
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(addr) = parse_var::<SocketAddr>("HTTP_ADDR") {
            config.http_addr = addr;
        }

        if let Ok(token) = std::env::var("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Ok(val) = std::env::var("SEED_ON_START") {
            config.seed_on_start = val != "false" && val != "0";
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// Broker settings for the bridge's own connection, with a last will
    /// on its presence topic.
    pub fn broker(&self) -> BrokerConfig {
        let mut broker = BrokerConfig::new(
            &self.broker_host,
            self.broker_port,
            &self.broker_client_id,
        );
        broker.username = Some(self.broker_username.clone());
        broker.password = Some(self.broker_password.clone());
        broker.keep_alive = self.keep_alive;
        broker.max_backoff = self.max_backoff;
        broker.retry_interval = self.retry_interval;
        broker.last_will = Some(LastWillMessage {
            topic: topics::client_status(&self.broker_username, &self.broker_client_id),
            payload: ClientStatus::Disconnected.as_str().to_string(),
            qos: QoS::ExactlyOnce,
            retain: false,
        });
        broker
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8000).into());
        assert_eq!(config.broker_port, 1883);
        assert!(config.broker_client_id.starts_with("ambulink-bridge-"));
        assert!(config.admin_token.is_none());
        assert!(config.seed_on_start);
    }

    #[test]
    fn test_broker_last_will_targets_presence_topic() {
        let mut config = ServerConfig::default();
        config.broker_client_id = "bridge-1".into();

        let broker = config.broker();
        let will = broker.last_will.unwrap();
        assert_eq!(will.topic, "user/ambulink/client/bridge-1/status");
        assert_eq!(will.payload, "disconnected");
        assert_eq!(will.qos, QoS::ExactlyOnce);
        assert!(!will.retain);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let mut config = ServerConfig::default();
        config.broker_password = "hunter2".into();
        config.admin_token = Some("s3cret".into());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("s3cret"));
    }
}
