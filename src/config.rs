//! Gateway configuration.
//!
//! [`GatewayConfig::default`] is built entirely from the constants below; the
//! binary overrides individual fields from its command line.

use std::net::SocketAddr;
use std::time::Duration;

use crate::identity::NodeId;
use crate::messages::{PROTOCOL_SUPPORTED, PROTOCOL_VERSION, ProtocolVersions};

// ============================================================================
// Timeouts
// ============================================================================

/// Idle limit on a single framed read or write.
pub const DEFAULT_TCP_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Read limit when waiting for a provider's full offer list.
pub const DEFAULT_LONG_TCP_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an inbound connection may sit between requests before it is closed.
pub const DEFAULT_IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(180);

/// Limit on establishing an outbound TCP connection.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// Background Tasks
// ============================================================================

/// Period of the closest-gateways refresh.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Deadline given to peers when probing them, in seconds from now.
pub const DEFAULT_PING_TTL_SECS: i64 = 10;

/// Period of the registrar re-sync.
pub const DEFAULT_REGISTRAR_SYNC_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// Size Limits
// ============================================================================

/// Maximum pooled outbound connections.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Largest accepted frame (length prefix excluded).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound on `num_dht` in client DHT discovery.
pub const DEFAULT_MAX_DHT_FANOUT: usize = 16;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9012";

/// Administration listener. Loopback only unless overridden.
pub const DEFAULT_ADMIN_BIND_ADDR: &str = "127.0.0.1:9013";

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// This gateway's id on the keyspace.
    pub gateway_id: NodeId,
    /// Client and peer-gateway listener.
    pub bind_addr: SocketAddr,
    /// Listener for key installation, enrollment and reputation admin.
    pub admin_bind_addr: SocketAddr,

    pub tcp_inactivity_timeout: Duration,
    pub long_tcp_inactivity_timeout: Duration,
    pub idle_connection_timeout: Duration,
    pub dial_timeout: Duration,

    pub refresh_interval: Duration,
    pub ping_ttl_secs: i64,
    /// `None` disables the periodic registrar re-sync.
    pub registrar_sync_interval: Option<Duration>,

    pub protocol: ProtocolVersions,

    pub pool_capacity: usize,
    pub max_frame_size: usize,
    pub max_dht_fanout: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_id: NodeId::from_bytes([0u8; 32]),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9012)),
            admin_bind_addr: SocketAddr::from(([127, 0, 0, 1], 9013)),

            tcp_inactivity_timeout: DEFAULT_TCP_INACTIVITY_TIMEOUT,
            long_tcp_inactivity_timeout: DEFAULT_LONG_TCP_INACTIVITY_TIMEOUT,
            idle_connection_timeout: DEFAULT_IDLE_CONNECTION_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,

            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            ping_ttl_secs: DEFAULT_PING_TTL_SECS,
            registrar_sync_interval: Some(DEFAULT_REGISTRAR_SYNC_INTERVAL),

            protocol: ProtocolVersions::new(PROTOCOL_VERSION, PROTOCOL_SUPPORTED.to_vec()),

            pool_capacity: DEFAULT_POOL_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_dht_fanout: DEFAULT_MAX_DHT_FANOUT,
        }
    }
}

impl GatewayConfig {
    pub fn with_gateway_id(mut self, gateway_id: NodeId) -> Self {
        self.gateway_id = gateway_id;
        self
    }

    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_admin_bind_addr(mut self, admin_bind_addr: SocketAddr) -> Self {
        self.admin_bind_addr = admin_bind_addr;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bind_matches_constant() {
        let config = GatewayConfig::default();
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR.parse().unwrap());
        assert_eq!(config.admin_bind_addr, DEFAULT_ADMIN_BIND_ADDR.parse().unwrap());
        assert!(config.admin_bind_addr.ip().is_loopback());
        assert!(config.long_tcp_inactivity_timeout > config.tcp_inactivity_timeout);
        assert!(config.protocol.speaks(PROTOCOL_VERSION));
    }
}
