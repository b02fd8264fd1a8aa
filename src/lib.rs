pub mod client;
pub mod config;
pub mod orchestrator;
pub mod pool;
pub mod protocol;
pub mod stub;
pub mod thread;

pub use client::{Client, ClientError};
pub use config::{Config, PoolConfig};
pub use orchestrator::{BatchReport, IdentifierSet, Orchestrator, RunSummary};
pub use pool::{ConnectionPool, Connector, PoolError, TcpConnector};
pub use protocol::{Action, Envelope, OperationResult};
