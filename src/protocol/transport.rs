use std::io::{self, ErrorKind, Read, Write};

use log::trace;

/// Size of each read issued against the stream.
pub const CHUNK_SIZE: usize = 8192;

/// Largest response accepted under [`Framing::DocumentLength`].
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

const MIN_DOCUMENT_SIZE: usize = 5;

/// How the end of a response is detected. The protocol carries no explicit
/// delimiter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Read until the BSON document's own little-endian length header is satisfied.
    #[default]
    DocumentLength,
    /// Stop at the first read shorter than [`CHUNK_SIZE`] or at end of stream.
    ///
    /// A response whose length is an exact multiple of [`CHUNK_SIZE`] leaves the
    /// reader waiting on a live connection for bytes that never come.
    ShortRead,
}

/// Request/response exchanges over a stream.
///
/// Bytes read past the end of one document are kept for the next
/// [`read_payload`](Self::read_payload). So is a partial document when a read
/// fails, which lets a caller with a read timeout retry without losing data.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    framing: Framing,
    pending: Vec<u8>,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T, framing: Framing) -> Self {
        Self {
            stream,
            framing,
            pending: Vec::new(),
        }
    }

    /// Issue a single write and report how much of `payload` was accepted.
    pub fn write_payload(&mut self, payload: &[u8]) -> io::Result<usize> {
        let written = loop {
            match self.stream.write(payload) {
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                res => break res?,
            }
        };
        self.stream.flush()?;
        Ok(written)
    }

    pub fn write_all(&mut self, payload: &[u8]) -> io::Result<()> {
        self.stream.write_all(payload)?;
        self.stream.flush()
    }

    /// Read one response. An empty buffer means the peer closed before sending anything.
    pub fn read_payload(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = [0u8; CHUNK_SIZE];

        loop {
            if self.framing == Framing::DocumentLength {
                if let Some(expected) = declared_length(&self.pending)? {
                    if self.pending.len() >= expected {
                        let rest = self.pending.split_off(expected);
                        return Ok(std::mem::replace(&mut self.pending, rest));
                    }
                }
            }

            let n = match self.stream.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.pending.extend_from_slice(&buf[..n]);
            trace!("read {n} bytes, {} pending", self.pending.len());

            match self.framing {
                Framing::ShortRead => {
                    if n < CHUNK_SIZE {
                        return Ok(std::mem::take(&mut self.pending));
                    }
                }
                Framing::DocumentLength => {
                    if n == 0 {
                        if self.pending.is_empty() {
                            return Ok(Vec::new());
                        }
                        return Err(io::Error::new(
                            ErrorKind::UnexpectedEof,
                            format!("stream closed after {} bytes", self.pending.len()),
                        ));
                    }
                }
            }
        }
    }

    /// Bytes received but not yet returned by [`read_payload`](Self::read_payload).
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Whether `data` is exactly one document, as its length header declares.
pub fn is_whole_document(data: &[u8]) -> bool {
    matches!(declared_length(data), Ok(Some(len)) if len == data.len())
}

fn declared_length(data: &[u8]) -> io::Result<Option<usize>> {
    let Some(header) = data.get(..4) else {
        return Ok(None);
    };
    let len = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);

    match usize::try_from(len) {
        Ok(len) if (MIN_DOCUMENT_SIZE..=MAX_DOCUMENT_SIZE).contains(&len) => Ok(Some(len)),
        _ => Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("invalid document length {len}"),
        )),
    }
}
