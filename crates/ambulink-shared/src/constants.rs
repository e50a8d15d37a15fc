/// Application name
pub const APP_NAME: &str = "Ambulink";

/// Broker-wide control topic (no per-user addressing)
pub const CONTROL_TOPIC: &str = "message";

/// Control payload that invalidates every permission cache
pub const CACHE_CLEAR: &str = "cache_clear";

/// Maximum length of a broker client id in bytes
pub const MAX_CLIENT_ID_LEN: usize = 254;

/// Default MQTT broker port
pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// Default HTTP port for the ACL hook and admin API
pub const DEFAULT_HTTP_PORT: u16 = 8000;

/// Default keep-alive negotiated with the broker
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;

/// Interval of the retry timer that flushes buffered publishes
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 5_000;

/// Reconnect backoff bounds
pub const RECONNECT_MIN_BACKOFF_MS: u64 = 100;
pub const DEFAULT_RECONNECT_MAX_BACKOFF_MS: u64 = 30_000;

/// Capacity of the broker request and inbound channels
pub const CHANNEL_CAPACITY: usize = 256;

/// Mean Earth radius in meters (spherical model)
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
