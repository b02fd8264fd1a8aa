//! Run configuration.
//!
//! Only the proxy's `host` and `port` are runtime inputs. Pool sizing, batch
//! size and the target namespace are constants; [`Config`] carries them so
//! tests can shrink a run without touching the binaries.
use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

use thiserror::Error;

use crate::protocol::Framing;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 2000;

pub const MIN_CONNECTIONS: usize = 5;
pub const MAX_CONNECTIONS: usize = 200;
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(600);
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of operations in every batch.
pub const BATCH_TOTAL: usize = 200;
/// Upper bound on documents returned by multi-document retrieves.
pub const RESULT_LIMIT: i64 = 10;

pub const DATABASE: &str = "itest";
pub const COLLECTION: &str = "test";
pub const APPLICATION: &str = "surge";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("{host}:{port} did not resolve to any address")]
    NoAddress { host: String, port: u16 },
}

/// Sizing of the [`ConnectionPool`](crate::pool::ConnectionPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections dialed eagerly when the pool opens.
    pub min_connections: usize,
    /// Hard cap on live connections to the target.
    pub max_connections: usize,
    /// Idle connections older than this are closed instead of reused.
    pub idle_timeout: Duration,
    /// How long `acquire` waits for capacity. `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: MIN_CONNECTIONS,
            max_connections: MAX_CONNECTIONS,
            idle_timeout: IDLE_TIMEOUT,
            acquire_timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub dial_timeout: Duration,
    pub pool: PoolConfig,
    pub framing: Framing,
    pub total: usize,
    /// Worker threads used to run a batch. Equal to `total` unless narrowed.
    pub concurrency: usize,
    pub limit: i64,
    pub database: String,
    pub collection: String,
    pub application: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            dial_timeout: DIAL_TIMEOUT,
            pool: PoolConfig::default(),
            framing: Framing::default(),
            total: BATCH_TOTAL,
            concurrency: BATCH_TOTAL,
            limit: RESULT_LIMIT,
            database: DATABASE.to_string(),
            collection: COLLECTION.to_string(),
            application: APPLICATION.to_string(),
        }
    }
}

impl Config {
    pub fn with_target(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Resolve `host:port` to the first socket address it names.
    pub fn address(&self) -> Result<SocketAddr, ConfigError> {
        let mut addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|source| ConfigError::Resolve {
                host: self.host.clone(),
                port: self.port,
                source,
            })?;

        addrs.next().ok_or_else(|| ConfigError::NoAddress {
            host: self.host.clone(),
            port: self.port,
        })
    }
}
