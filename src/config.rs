//! Runtime configuration.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::path::PathBuf;
use std::time::Duration;

/// Router and runtime configuration.
///
/// The defaults match the layout of the device nodes on the target and the
/// timings the modem side expects.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Directory holding router device nodes when there is no oncrpc
    /// subdirectory.
    /// Default: `/dev`
    pub dev_root: PathBuf,
    /// Preferred directory for router device nodes, used when it exists.
    /// Default: `/dev/oncrpc`
    pub oncrpc_dir: PathBuf,
    /// Endpoint name of the router itself, opened for server ports and for
    /// the shared router descriptor.
    /// Default: `00000000:0`
    pub router_name: String,
    /// How long to wait for a device node to appear.  `None` waits forever,
    /// zero does not wait.
    /// Default: 15 seconds
    pub server_wait: Option<Duration>,
    /// Interval between checks for a device node.
    /// Default: 500ms
    pub poll_interval: Duration,
    /// Maximum time the server dispatch thread waits before re-checking
    /// whether it should keep running.
    /// Default: 1 second
    pub svc_poll_period: Duration,
    /// Hold-off after a failed read before a port is polled again.  Doubles
    /// on each failure in a row, up to 32 times this value.
    /// Default: 100ms
    pub read_retry_delay: Duration,
    /// Log every message in and out at trace level.
    /// Default: false
    pub dump_packets: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dev_root: PathBuf::from("/dev"),
            oncrpc_dir: PathBuf::from("/dev/oncrpc"),
            router_name: "00000000:0".to_string(),
            server_wait: Some(Duration::from_secs(15)),
            poll_interval: Duration::from_millis(500),
            svc_poll_period: Duration::from_secs(1),
            read_retry_delay: Duration::from_millis(100),
            dump_packets: false,
        }
    }
}

impl RouterConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dev_root(mut self, dev_root: impl Into<PathBuf>) -> Self {
        self.dev_root = dev_root.into();
        self
    }

    pub fn with_oncrpc_dir(mut self, oncrpc_dir: impl Into<PathBuf>) -> Self {
        self.oncrpc_dir = oncrpc_dir.into();
        self
    }

    pub fn with_router_name(mut self, router_name: impl Into<String>) -> Self {
        self.router_name = router_name.into();
        self
    }

    /// Set how long to wait for device nodes.  `None` waits forever.
    pub fn with_server_wait(mut self, server_wait: Option<Duration>) -> Self {
        self.server_wait = server_wait;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the dispatch thread's poll period.
    pub fn with_svc_poll_period(mut self, svc_poll_period: Duration) -> Self {
        self.svc_poll_period = svc_poll_period;
        self
    }

    pub fn with_read_retry_delay(mut self, read_retry_delay: Duration) -> Self {
        self.read_retry_delay = read_retry_delay;
        self
    }

    /// Enable or disable packet dumps.
    pub fn with_dump_packets(mut self, dump_packets: bool) -> Self {
        self.dump_packets = dump_packets;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RouterConfig::new();
        assert_eq!(config.dev_root, PathBuf::from("/dev"));
        assert_eq!(config.oncrpc_dir, PathBuf::from("/dev/oncrpc"));
        assert_eq!(config.router_name, "00000000:0");
        assert_eq!(config.server_wait, Some(Duration::from_secs(15)));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.svc_poll_period, Duration::from_secs(1));
        assert_eq!(config.read_retry_delay, Duration::from_millis(100));
        assert!(!config.dump_packets);
    }

    #[test]
    fn builder_overrides() {
        let config = RouterConfig::new()
            .with_dev_root("/tmp/dev")
            .with_oncrpc_dir("/tmp/dev/oncrpc")
            .with_router_name("router")
            .with_server_wait(None)
            .with_poll_interval(Duration::from_millis(10))
            .with_svc_poll_period(Duration::from_millis(50))
            .with_read_retry_delay(Duration::from_millis(5))
            .with_dump_packets(true);
        assert_eq!(config.dev_root, PathBuf::from("/tmp/dev"));
        assert_eq!(config.oncrpc_dir, PathBuf::from("/tmp/dev/oncrpc"));
        assert_eq!(config.router_name, "router");
        assert_eq!(config.server_wait, None);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.svc_poll_period, Duration::from_millis(50));
        assert_eq!(config.read_retry_delay, Duration::from_millis(5));
        assert!(config.dump_packets);
    }
}
