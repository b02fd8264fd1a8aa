//! Bounded pool of reusable connections to the proxy.
//!
//! The pool is opened once per process and shared by reference. Callers get a
//! [`PooledConnection`] guard from [`ConnectionPool::acquire`]; dropping the
//! guard hands the connection back, so every acquired connection is released
//! exactly once no matter how the caller exits.
//!
//! When all `max_connections` are checked out, `acquire` blocks until one is
//! released. With an `acquire_timeout` configured it gives up after that long
//! with [`PoolError::Exhausted`].
use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    ops::{Deref, DerefMut},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::{Config, ConfigError, PoolConfig};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool is shut down")]
    Closed,
    #[error("connection pool needs room for at least one connection")]
    NoCapacity,
    #[error("connection pool exhausted: all {max} connections busy for {waited:?}")]
    Exhausted { max: usize, waited: Duration },
    #[error("failed to dial proxy: {0}")]
    Dial(#[from] io::Error),
}

/// Dials new connections to the pool's fixed target.
pub trait Connector: Send + Sync {
    type Stream: Read + Write + Send;

    fn connect(&self) -> io::Result<Self::Stream>;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(config.address()?, config.dial_timeout))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&self.addr, self.timeout)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently open, idle or checked out.
    pub live: usize,
    pub idle: usize,
    /// Highest `live` seen since the pool opened.
    pub peak: usize,
}

struct Idle<S> {
    stream: S,
    since: Instant,
}

struct State<S> {
    idle: Vec<Idle<S>>,
    live: usize,
    peak: usize,
    closed: bool,
}

pub struct ConnectionPool<C: Connector> {
    connector: C,
    config: PoolConfig,
    state: Mutex<State<C::Stream>>,
    available: Condvar,
}

impl<C: Connector> ConnectionPool<C> {
    /// Open the pool and eagerly dial `min_connections`.
    pub fn open(config: PoolConfig, connector: C) -> Result<Self, PoolError> {
        if config.max_connections == 0 {
            return Err(PoolError::NoCapacity);
        }

        let eager = config.min_connections.min(config.max_connections);
        let mut idle = Vec::with_capacity(config.max_connections);
        for _ in 0..eager {
            idle.push(Idle {
                stream: connector.connect()?,
                since: Instant::now(),
            });
        }

        info!(
            "connection pool open with {eager} connections (max {}, idle timeout {:?})",
            config.max_connections, config.idle_timeout
        );

        Ok(Self {
            connector,
            state: Mutex::new(State {
                live: idle.len(),
                peak: idle.len(),
                idle,
                closed: false,
            }),
            config,
            available: Condvar::new(),
        })
    }

    pub fn acquire(&self) -> Result<PooledConnection<'_, C>, PoolError> {
        let started = Instant::now();
        let mut state = self.lock();

        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }

            let stale = self.take_stale(&mut state);
            if let Some(idle) = state.idle.pop() {
                drop(state);
                drop(stale);
                return Ok(PooledConnection::new(self, idle.stream));
            }

            if state.live < self.config.max_connections {
                state.live += 1;
                state.peak = state.peak.max(state.live);
                drop(state);
                drop(stale);
                return self.dial();
            }

            drop(stale);
            state = match self.config.acquire_timeout {
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(timeout) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        warn!("no connection became available within {timeout:?}");
                        return Err(PoolError::Exhausted {
                            max: self.config.max_connections,
                            waited,
                        });
                    }
                    self.available
                        .wait_timeout(state, timeout - waited)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Close idle connections that outlived the idle timeout.
    pub fn evict_idle(&self) -> usize {
        let stale = {
            let mut state = self.lock();
            self.take_stale(&mut state)
        };
        stale.len()
    }

    /// Close every idle connection and refuse further acquisitions.
    ///
    /// Connections still checked out are closed as their guards drop. Returns
    /// `false` if the pool was already shut down.
    pub fn shutdown(&self) -> bool {
        let idle = {
            let mut state = self.lock();
            if state.closed {
                debug!("connection pool already shut down");
                return false;
            }
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.live -= idle.len();
            idle
        };
        self.available.notify_all();

        info!("connection pool shut down, closed {} idle connections", idle.len());
        true
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            live: state.live,
            idle: state.idle.len(),
            peak: state.peak,
        }
    }

    fn dial(&self) -> Result<PooledConnection<'_, C>, PoolError> {
        match self.connector.connect() {
            Ok(stream) => {
                debug!("dialed new proxy connection");
                Ok(PooledConnection::new(self, stream))
            }
            Err(e) => {
                self.lock().live -= 1;
                self.available.notify_one();
                warn!("failed to dial proxy: {e}");
                Err(PoolError::Dial(e))
            }
        }
    }

    fn take_stale(&self, state: &mut State<C::Stream>) -> Vec<Idle<C::Stream>> {
        let timeout = self.config.idle_timeout;
        let (stale, fresh) = std::mem::take(&mut state.idle)
            .into_iter()
            .partition::<Vec<_>, _>(|idle| idle.since.elapsed() > timeout);

        state.idle = fresh;
        state.live -= stale.len();
        if !stale.is_empty() {
            debug!("evicted {} idle connections", stale.len());
        }
        stale
    }

    fn release(&self, stream: C::Stream, reusable: bool) {
        let mut state = self.lock();
        if state.closed || !reusable {
            state.live -= 1;
            drop(state);
            drop(stream);
        } else {
            state.idle.push(Idle {
                stream,
                since: Instant::now(),
            });
            drop(state);
        }
        self.available.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, State<C::Stream>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A checked-out connection. Returned to its pool on drop.
pub struct PooledConnection<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    stream: Option<C::Stream>,
    reusable: bool,
}

impl<'a, C: Connector> PooledConnection<'a, C> {
    fn new(pool: &'a ConnectionPool<C>, stream: C::Stream) -> Self {
        Self {
            pool,
            stream: Some(stream),
            reusable: true,
        }
    }

    /// Close the connection on release instead of returning it to the idle set.
    pub fn discard(&mut self) {
        self.reusable = false;
    }
}

impl<C: Connector> Deref for PooledConnection<'_, C> {
    type Target = C::Stream;

    fn deref(&self) -> &Self::Target {
        self.stream.as_ref().expect("stream present until drop")
    }
}

impl<C: Connector> DerefMut for PooledConnection<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.stream.as_mut().expect("stream present until drop")
    }
}

impl<C: Connector> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.pool.release(stream, self.reusable);
        }
    }
}
