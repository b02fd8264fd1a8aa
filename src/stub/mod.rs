//! In-memory stand-in for the document-store proxy.
//!
//! Speaks the same wire protocol as the real service: one BSON request
//! document in, one BSON response document out, repeated on a connection
//! until the client hangs up. Documents live in a [`MemoryStore`] and vanish
//! with the process. Used by the test suite and by the `surge_stub` binary to
//! run the load client locally.
mod store;

use std::{
    io::{self, ErrorKind},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use bson::Document;
use log::{debug, info, warn};

pub use store::MemoryStore;

use crate::{
    protocol::{Framing, ProtocolTransport},
    thread::WorkerPool,
};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct StubProxy {
    listener: TcpListener,
    store: Arc<MemoryStore>,
    workers: WorkerPool,
    running: Arc<AtomicBool>,
}

/// Ends a [`StubProxy`]'s accept loop from another thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            // wake the blocking accept
            let _ = TcpStream::connect(self.addr);
        }
    }
}

impl StubProxy {
    /// Bind `address`; each accepted connection occupies one of `workers` threads.
    pub fn bind(address: SocketAddr, workers: usize) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(address)?,
            store: Arc::new(MemoryStore::new()),
            workers: WorkerPool::new("stub", workers)?,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.store)
    }

    pub fn stop_handle(&self) -> io::Result<StopHandle> {
        Ok(StopHandle {
            addr: self.local_addr()?,
            running: Arc::clone(&self.running),
        })
    }

    pub fn listen(self) -> io::Result<()> {
        info!("stub proxy listening at {}", self.local_addr()?);

        for stream in self.listener.incoming() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let store = Arc::clone(&self.store);
                    let running = Arc::clone(&self.running);
                    let scheduled = self.workers.execute(move || {
                        if let Err(e) = handle_connection(stream, &store, &running) {
                            warn!("connection closed with error: {e}");
                        }
                    });
                    if let Err(e) = scheduled {
                        warn!("dropping connection: {e}");
                    }
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }

        info!("stub proxy stopped");
        Ok(())
    }

    /// Run [`listen`](Self::listen) on a background thread.
    pub fn spawn(self) -> io::Result<(StopHandle, JoinHandle<io::Result<()>>)> {
        let stop = self.stop_handle()?;
        let handle = thread::Builder::new()
            .name("stub-accept".to_string())
            .spawn(move || self.listen())?;
        Ok((stop, handle))
    }
}

fn handle_connection(
    stream: TcpStream,
    store: &MemoryStore,
    running: &AtomicBool,
) -> io::Result<()> {
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    let mut transport = ProtocolTransport::new(stream, Framing::DocumentLength);

    loop {
        let payload = match transport.read_payload() {
            Ok(payload) if payload.is_empty() => {
                debug!("{peer} hung up");
                return Ok(());
            }
            Ok(payload) => payload,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if running.load(Ordering::SeqCst) {
                    continue;
                }
                return Ok(());
            }
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                respond(&mut transport, &store::error_response("Payload not BSON"))?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let response = match Document::from_reader(payload.as_slice()) {
            Ok(request) => store.process(&request),
            Err(e) => {
                debug!("invalid bson from {peer}: {e}");
                store::error_response("Payload not BSON")
            }
        };
        respond(&mut transport, &response)?;
    }
}

fn respond(transport: &mut ProtocolTransport<TcpStream>, response: &Document) -> io::Result<()> {
    let bytes = bson::to_vec(response).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    transport.write_all(&bytes)
}
