//! Network Configuration
//!
//! Ports, broadcast target and protocol timings for one node.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Configuration for the peer network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// UDP port used for Find/PeerDied broadcasts (default: 1337)
    pub broadcast_port: u16,

    /// Destination address for discovery broadcasts (default: 255.255.255.255)
    pub broadcast_addr: IpAddr,

    /// First TCP port tried for the link listener (default: 1338)
    pub listen_base_port: u16,

    /// How long `find_peer` waits for an inbound connection (default: 200ms)
    pub find_timeout: Duration,

    /// Bound on opening an outbound TCP connection (default: 1s)
    pub connect_timeout: Duration,

    /// Bound on reading the remote listen port during a handshake (default: 200ms)
    pub handshake_timeout: Duration,

    /// Bound on observing our own Find echo (default: 2s)
    pub own_address_timeout: Duration,

    /// Delay collecting PeerDied announcements before electing a master (default: 200ms)
    pub repair_settle: Duration,

    /// How long the repair master accepts reattaching peers (default: 1s)
    pub repair_window: Duration,

    /// Largest accepted frame payload in bytes (default: 16 MiB)
    pub max_frame_len: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            broadcast_port: 1337,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            listen_base_port: 1338,
            find_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_millis(200),
            own_address_timeout: Duration::from_secs(2),
            repair_settle: Duration::from_millis(200),
            repair_window: Duration::from_millis(1000),
            max_frame_len: 16 * 1024 * 1024,
        }
    }
}

impl NetworkConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broadcast port.
    pub fn broadcast_port(mut self, port: u16) -> Self {
        self.broadcast_port = port;
        self
    }

    /// Set the broadcast destination address.
    pub fn broadcast_addr(mut self, addr: IpAddr) -> Self {
        self.broadcast_addr = addr;
        self
    }

    /// Set the first port tried by the listener.
    pub fn listen_base_port(mut self, port: u16) -> Self {
        self.listen_base_port = port;
        self
    }

    /// Set the discovery wait.
    pub fn find_timeout(mut self, timeout: Duration) -> Self {
        self.find_timeout = timeout;
        self
    }

    /// Set the outbound connect bound.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the handshake bound.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the own-address bound.
    pub fn own_address_timeout(mut self, timeout: Duration) -> Self {
        self.own_address_timeout = timeout;
        self
    }

    /// Set the repair settle delay and reattachment window.
    pub fn repair_timings(mut self, settle: Duration, window: Duration) -> Self {
        self.repair_settle = settle;
        self.repair_window = window;
        self
    }

    /// Set the largest frame payload sent or accepted.
    pub fn max_frame_len(mut self, len: u32) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broadcast_port == 0 {
            return Err(ConfigError::InvalidBroadcastPort);
        }
        if self.listen_base_port == 0 {
            return Err(ConfigError::InvalidListenPort);
        }
        if self.find_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.repair_window.is_zero() {
            return Err(ConfigError::ZeroRepairWindow);
        }
        if self.max_frame_len == 0 {
            return Err(ConfigError::ZeroFrameLimit);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("broadcast_port must be non-zero")]
    InvalidBroadcastPort,
    #[error("listen_base_port must be non-zero")]
    InvalidListenPort,
    #[error("find and handshake timeouts must be non-zero")]
    ZeroTimeout,
    #[error("repair_window must be non-zero")]
    ZeroRepairWindow,
    #[error("max_frame_len must be non-zero")]
    ZeroFrameLimit,
}
