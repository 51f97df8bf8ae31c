//! Configuration for the client session and the authority server.
//!
//! Plain structs with defaults; the server binary overlays environment
//! variables via [`ServerConfig::from_env`].

use std::time::Duration;

/// Client-side session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle time after the last local edit before `user-stopped-typing`.
    pub typing_idle_timeout: Duration,
    /// How long a remote "is typing" flag lives without a refresh.
    pub remote_typing_ttl: Duration,
    /// Remote cursors with no update for this long are dropped.
    pub cursor_stale_timeout: Duration,
    /// Minimum interval between local cursor broadcasts (selection changes
    /// are never throttled).
    pub cursor_broadcast_interval: Duration,
    /// Period of the driver's housekeeping tick.
    pub tick_interval: Duration,
    /// Capacity of the command and event channels.
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            typing_idle_timeout: Duration::from_millis(1000),
            remote_typing_ttl: Duration::from_secs(3),
            cursor_stale_timeout: Duration::from_secs(30),
            cursor_broadcast_interval: Duration::from_millis(33), // 30fps
            tick_interval: Duration::from_millis(100),
            channel_capacity: 256,
        }
    }
}

/// Authority server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per document room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Operations kept per document for transforming late arrivals.
    pub max_history: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            max_history: 10_000,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `ORBIT_BIND_ADDR`, `ORBIT_MAX_PEERS`,
    /// `ORBIT_BROADCAST_CAPACITY` and `ORBIT_MAX_HISTORY`.
    ///
    /// Unparseable numeric values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("ORBIT_BIND_ADDR") {
            config.bind_addr = addr;
        }
        overlay_usize(&lookup, "ORBIT_MAX_PEERS", &mut config.max_peers_per_room);
        overlay_usize(&lookup, "ORBIT_BROADCAST_CAPACITY", &mut config.broadcast_capacity);
        overlay_usize(&lookup, "ORBIT_MAX_HISTORY", &mut config.max_history);
        config
    }
}

fn overlay_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut usize) {
    if let Some(raw) = lookup(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(e) => log::warn!("Ignoring {key}={raw:?}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.typing_idle_timeout, Duration::from_millis(1000));
        assert_eq!(config.cursor_broadcast_interval, Duration::from_millis(33));
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.max_history, 10_000);
    }

    #[test]
    fn test_server_config_overlay() {
        let vars: HashMap<&str, &str> = [
            ("ORBIT_BIND_ADDR", "0.0.0.0:7000"),
            ("ORBIT_MAX_HISTORY", "64"),
            ("ORBIT_BROADCAST_CAPACITY", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.max_history, 64);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.max_peers_per_room, 100);
    }
}
