// ABOUTME: Keepalive for long-running links: periodic ALIVE frames and idle-peer disconnect
// ABOUTME: Driven by the engine's last-seen timestamp, which every peer ALIVE frame refreshes

use crate::engine::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// Configuration for link keepalive.
///
/// While enabled, an `ALIVE` frame goes out every `interval` and the peer is
/// considered dead once nothing has refreshed the engine's last-seen
/// timestamp for `idle_timeout`.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Interval between outgoing ALIVE frames (default: 30 seconds)
    pub interval: Duration,

    /// Idle window after which the connection is closed (default: 2 minutes).
    /// Should be a comfortable multiple of the peer's send interval.
    pub idle_timeout: Duration,

    /// Whether keepalive is enabled (default: true)
    pub enabled: bool,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            enabled: true,
        }
    }
}

impl KeepaliveConfig {
    /// Create a keepalive configuration with a custom send interval
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    /// Set the idle window after which the connection is closed
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Create a disabled keepalive configuration
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Spawns the keepalive task for a connection. Returns `None` when the
/// configuration is disabled. The task ends itself after closing an idle
/// connection; abort the handle to stop it earlier.
pub fn spawn_keepalive(engine: Arc<Engine>, config: KeepaliveConfig) -> Option<JoinHandle<()>> {
    if !config.enabled {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        // The first tick fires immediately; skip it so an idle check never
        // precedes the first ALIVE.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let idle = engine.idle_for();
            if idle > config.idle_timeout {
                warn!(?idle, "peer idle past timeout, closing connection");
                engine.close();
                break;
            }
            engine.send_alive();
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = KeepaliveConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert!(config.enabled);
    }

    #[test]
    fn builder_setters() {
        let config = KeepaliveConfig::new(Duration::from_secs(5))
            .with_idle_timeout(Duration::from_secs(20));
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(20));
    }

    #[test]
    fn disabled_config_spawns_nothing() {
        let config = KeepaliveConfig::disabled();
        assert!(!config.enabled);
    }
}
