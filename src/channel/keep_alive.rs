use std::time::Duration;

/// Keep-alive settings for the connections of a channel
///
/// Only transports that keep long lived connections look at these settings.
/// The in-memory transport ignores them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// How long an idle connection is kept in the pool. `None` keeps it forever.
    pub idle_timeout: Option<Duration>,
    /// Interval between keep-alive pings
    pub ping_delay: Duration,
    /// How long to wait for a ping to be acknowledged before the connection is closed
    pub ping_timeout: Duration,
    /// Allow more than one connection per host
    pub multiple_connections: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            ping_delay: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(30),
            multiple_connections: true,
        }
    }
}

impl KeepAliveConfig {
    /// Set the idle timeout
    pub fn idle_timeout(mut self, value: Option<Duration>) -> Self {
        self.idle_timeout = value;
        self
    }

    /// Set the ping delay
    pub fn ping_delay(mut self, value: Duration) -> Self {
        self.ping_delay = value;
        self
    }

    /// Set the ping timeout
    pub fn ping_timeout(mut self, value: Duration) -> Self {
        self.ping_timeout = value;
        self
    }

    /// Allow or forbid multiple connections per host
    pub fn multiple_connections(mut self, value: bool) -> Self {
        self.multiple_connections = value;
        self
    }
}
