//! Driver configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::pool::{ConnectParams, PoolOptions};

/// Default port the server listens on.
pub const DEFAULT_PORT: u16 = 3322;

/// Default interval between session heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Default grace period for draining the connection pool on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Default cap on pooled connections per server address.
pub const DEFAULT_MAX_CONNECTIONS_PER_SERVER: usize = 4;

/// Default cadence of the idle-connection sweeper.
pub const DEFAULT_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Default idle time after which a pooled connection is torn down.
pub const DEFAULT_TERMINATE_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Configuration options for the driver.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server host name or address.
    pub address: String,
    /// Server port.
    pub port: u16,
    /// Negotiate TLS on new transports; handed to the connection factory
    /// through [`ConnectParams`].
    pub use_tls: bool,
    /// SEC1-encoded secp256r1 public key the server signs states with.
    /// When set, every published state must carry a valid signature.
    pub server_signing_key: Option<Vec<u8>>,
    /// Directory for persisted trusted states and deployment info.
    /// `None` keeps both in memory only.
    pub state_dir: Option<PathBuf>,
    /// Fail operations when the server UUID diverges from the one first
    /// seen for this deployment.
    pub check_deployment: bool,
    /// Interval between keepalive heartbeats while a session is open.
    pub heartbeat_interval: Duration,
    /// Deadline applied to every RPC; `None` disables.
    pub call_timeout: Option<Duration>,
    /// Grace period for draining pooled connections on shutdown.
    pub shutdown_grace: Duration,
    /// Maximum concurrently held connections per server address.
    pub max_connections_per_server: usize,
    /// Cadence of the pool's idle sweeper.
    pub idle_check_interval: Duration,
    /// Idle time after which a pooled connection is closed.
    pub terminate_idle_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            use_tls: false,
            server_signing_key: None,
            state_dir: None,
            check_deployment: true,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            call_timeout: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            max_connections_per_server: DEFAULT_MAX_CONNECTIONS_PER_SERVER,
            idle_check_interval: DEFAULT_IDLE_CHECK_INTERVAL,
            terminate_idle_timeout: DEFAULT_TERMINATE_IDLE_TIMEOUT,
        }
    }
}

impl ClientOptions {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ..Default::default()
        }
    }

    /// `host:port` string used as the pool key and deployment identity.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Dial parameters passed to the connection factory.
    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams::new(self.server_addr(), self.use_tls)
    }

    /// Pool tuning derived from the pool-related fields.
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_connections_per_server: self.max_connections_per_server,
            idle_check_interval: self.idle_check_interval,
            terminate_idle_timeout: self.terminate_idle_timeout,
            shutdown_grace: self.shutdown_grace,
        }
    }
}
