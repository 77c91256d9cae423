use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for a [`crate::KartonServer`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KartonServerConfig {
    /// Timeout for calls from the server into client procedures
    pub call_timeout_ms: u64,
    /// How many state patches a session may fall behind before it is resynced
    pub patch_buffer: usize,
    /// Websocket route used by the axum router
    pub route: String,
}

impl Default for KartonServerConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            patch_buffer: 1024,
            route: "/karton".to_string(),
        }
    }
}

impl KartonServerConfig {
    /// Set the default call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the patch broadcast buffer
    pub fn with_patch_buffer(mut self, patch_buffer: usize) -> Self {
        self.patch_buffer = patch_buffer;
        self
    }

    /// Set the websocket route
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    /// Default call timeout as a `Duration`
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Settings for a [`crate::KartonClient`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KartonClientConfig {
    /// Timeout for calls from the client into server procedures
    pub call_timeout_ms: u64,
    /// Fixed delay between a disconnect and the next connection attempt
    pub reconnect_interval_ms: u64,
}

impl Default for KartonClientConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            reconnect_interval_ms: 2_000,
        }
    }
}

impl KartonClientConfig {
    /// Set the default call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the delay between connection attempts
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Default call timeout as a `Duration`
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Delay between connection attempts as a `Duration`
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let server = KartonServerConfig::default();
        assert_eq!(server.call_timeout(), Duration::from_secs(30));
        assert_eq!(server.route, "/karton");

        let client = KartonClientConfig::default();
        assert_eq!(client.reconnect_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let client: KartonClientConfig =
            serde_json::from_str(r#"{"reconnect_interval_ms": 250}"#).unwrap();
        assert_eq!(client.reconnect_interval(), Duration::from_millis(250));
        assert_eq!(client.call_timeout_ms, 30_000);

        let server = KartonServerConfig::default()
            .with_route("/ws")
            .with_patch_buffer(8);
        let json = serde_json::to_string(&server).unwrap();
        let back: KartonServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, server);
    }
}
