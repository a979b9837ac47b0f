pub mod bucket;
pub mod dataset;
pub mod error;
pub mod experiment;
pub mod feed;
pub mod metrics;

/// Default control-plane HTTP port
pub const DEFAULT_ADMIN_PORT: u16 = 3000;

/// Default aggregation window width
pub const DEFAULT_WINDOW_MS: u64 = 1000;

/// Default snapshot publish and status poll periods
pub const DEFAULT_PUBLISH_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_STATUS_INTERVAL_MS: u64 = 1000;

/// Path of the change subscription WebSocket
pub const FEED_PATH: &str = "/ws/feed";

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
