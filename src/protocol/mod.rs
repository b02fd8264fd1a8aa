//! Wire protocol spoken with the document-store proxy.
//!
//! Every exchange is one request document followed by one response document
//! on a reused TCP connection. Both directions are BSON.
//!
//! # Overview
//!
//! A request is an [`Envelope`]: the [`Action`] to perform, the target
//! `database` and `collection`, the `document` the action applies to (fields
//! to insert, a query filter, or an update spec), and optional `options` and
//! `metadata` which are left off the wire entirely when empty. The proxy
//! answers with a document that decodes into an [`OperationResult`]; a
//! non-empty `error` field there is a failure reported by the remote side,
//! as opposed to a failure to exchange bytes at all.
//!
//! # Framing
//!
//! Messages carry no delimiter of their own. A BSON document does however
//! begin with its total length as a little-endian `i32`, and the proxy uses
//! that to find the end of a request. [`ProtocolTransport`] does the same for
//! responses under [`Framing::DocumentLength`]. [`Framing::ShortRead`] keeps
//! the older heuristic of stopping at the first read shorter than the buffer.
//!
//! # Key Components
//!
//! - [`Envelope`]: request sent for a single operation.
//! - [`OperationResult`]: decoded response plus local failure details.
//! - [`Codec`]: envelope/bytes conversion, implemented by [`BsonCodec`].
//! - [`ProtocolTransport`]: writes a payload and reads one framed response
//!   over any `Read + Write` stream.
mod codec;
mod request;
mod response;
mod transport;

pub use codec::{BsonCodec, Codec, CodecError};
pub use request::{Action, Envelope};
pub use response::{Failure, OperationResult};
pub use transport::{CHUNK_SIZE, Framing, MAX_DOCUMENT_SIZE, ProtocolTransport, is_whole_document};
