//! Protocol client: one logical operation per call, end to end.
use std::{io, sync::Arc};

use bson::{Bson, Document};
use log::{error, warn};
use thiserror::Error;

use crate::{
    config::Config,
    pool::{ConnectionPool, Connector, PoolError},
    protocol::{
        Action, BsonCodec, Codec, CodecError, Envelope, Framing, OperationResult,
        ProtocolTransport, is_whole_document,
    },
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] CodecError),

    #[error("failed to acquire connection: {0}")]
    Connect(#[from] PoolError),

    #[error("failed to send payload: {0}")]
    Write(#[source] io::Error),

    #[error("short write: sent {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("failed to read response: {0}")]
    Read(#[source] io::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[source] CodecError),

    /// The proxy answered a count with an error instead of a number.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("no identifier recorded for slot {0}")]
    MissingIdentifier(usize),

    #[error("task for slot {0} ended without reporting a result")]
    Abandoned(usize),
}

pub struct Client<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    codec: Box<dyn Codec>,
    framing: Framing,
    application: String,
}

impl<C: Connector> Client<C> {
    pub fn new(pool: Arc<ConnectionPool<C>>, config: &Config) -> Self {
        Self {
            pool,
            codec: Box::new(BsonCodec),
            framing: config.framing,
            application: config.application.clone(),
        }
    }

    pub fn with_codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Box::new(codec);
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    pub fn create(&self, envelope: Envelope) -> Result<OperationResult, ClientError> {
        self.execute(self.stamp(envelope, Action::Create))
    }

    pub fn update(&self, envelope: Envelope) -> Result<OperationResult, ClientError> {
        self.execute(self.stamp(envelope, Action::Update))
    }

    pub fn query(
        &self,
        database: &str,
        collection: &str,
        filter: Document,
    ) -> Result<OperationResult, ClientError> {
        self.query_with_options(database, collection, filter, None)
    }

    pub fn query_with_options(
        &self,
        database: &str,
        collection: &str,
        filter: Document,
        options: Option<Document>,
    ) -> Result<OperationResult, ClientError> {
        let envelope =
            Envelope::new(Action::Retrieve, database, collection, filter).with_options(options);
        self.execute(self.stamp(envelope, Action::Retrieve))
    }

    pub fn delete(
        &self,
        database: &str,
        collection: &str,
        filter: Document,
    ) -> Result<OperationResult, ClientError> {
        self.delete_with_options(database, collection, filter, None)
    }

    pub fn delete_with_options(
        &self,
        database: &str,
        collection: &str,
        filter: Document,
        options: Option<Document>,
    ) -> Result<OperationResult, ClientError> {
        let envelope =
            Envelope::new(Action::Delete, database, collection, filter).with_options(options);
        self.execute(self.stamp(envelope, Action::Delete))
    }

    pub fn count(
        &self,
        database: &str,
        collection: &str,
        filter: Document,
    ) -> Result<i64, ClientError> {
        self.count_with_options(database, collection, filter, None)
    }

    /// Number of documents matching `filter`.
    ///
    /// A response without a `count` field counts as zero, as does one whose
    /// `count` is not a 32 or 64-bit integer. A response carrying only an
    /// `error` is [`ClientError::Remote`].
    pub fn count_with_options(
        &self,
        database: &str,
        collection: &str,
        filter: Document,
        options: Option<Document>,
    ) -> Result<i64, ClientError> {
        let envelope =
            Envelope::new(Action::Count, database, collection, filter).with_options(options);
        let envelope = self.stamp(envelope, Action::Count);

        let bytes = self.send(&envelope)?;
        let response = self.decode(Action::Count, &bytes)?;

        Ok(match response.get("count") {
            None => match response.get_str("error") {
                Ok(message) if !message.is_empty() => {
                    error!("count: remote error: {message}");
                    return Err(ClientError::Remote(message.to_string()));
                }
                _ => 0,
            },
            Some(Bson::Int32(n)) => i64::from(*n),
            Some(Bson::Int64(n)) => *n,
            Some(other) => {
                warn!("count: unsupported count type {other:?}");
                0
            }
        })
    }

    /// Encode `envelope`, write it on a pooled connection and read back the raw response.
    ///
    /// A short write is logged and the response is read anyway. The connection
    /// is closed rather than reused once the exchange has gone wrong, including
    /// when the bytes read are not exactly one document.
    pub fn send(&self, envelope: &Envelope) -> Result<Vec<u8>, ClientError> {
        let op = envelope.action.as_str();

        let payload = self.codec.encode(envelope).map_err(|e| {
            error!("{op}: failed to encode envelope {envelope:?}: {e}");
            ClientError::Encode(e)
        })?;

        let mut conn = self.pool.acquire().map_err(|e| {
            error!("{op}: failed to acquire connection: {e}");
            ClientError::Connect(e)
        })?;

        let mut short = false;
        let mut leftover = 0;
        let outcome = {
            let mut transport = ProtocolTransport::new(&mut *conn, self.framing);
            match transport.write_payload(&payload) {
                Err(e) => Err(ClientError::Write(e)),
                Ok(written) => {
                    if written < payload.len() {
                        short = true;
                        let err = ClientError::ShortWrite {
                            written,
                            expected: payload.len(),
                        };
                        warn!("{op}: {err}; reading response anyway");
                    }
                    let read = transport.read_payload().map_err(ClientError::Read);
                    leftover = transport.pending();
                    read
                }
            }
        };

        match &outcome {
            Ok(bytes) if !short && leftover == 0 && is_whole_document(bytes) => {}
            Ok(bytes) => {
                if !short && !bytes.is_empty() {
                    warn!(
                        "{op}: response framing lost ({} bytes read, {leftover} left over); closing connection",
                        bytes.len()
                    );
                }
                conn.discard();
            }
            Err(e) => {
                error!("{op}: {e}");
                conn.discard();
            }
        }
        outcome
    }

    fn execute(&self, envelope: Envelope) -> Result<OperationResult, ClientError> {
        let bytes = self.send(&envelope)?;
        let response = self.decode(envelope.action, &bytes)?;

        bson::from_document(response).map_err(|e| {
            error!("{}: unexpected response shape: {e}", envelope.action.as_str());
            ClientError::Decode(CodecError::Deserialize(e))
        })
    }

    fn decode(&self, action: Action, bytes: &[u8]) -> Result<Document, ClientError> {
        self.codec.decode(bytes).map_err(|e| {
            error!(
                "{}: failed to decode {} byte response: {e}",
                action.as_str(),
                bytes.len()
            );
            ClientError::Decode(e)
        })
    }

    fn stamp(&self, mut envelope: Envelope, action: Action) -> Envelope {
        envelope.action = action;
        envelope.application = self.application.clone();
        envelope
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io::{Read, Write},
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use bson::{doc, oid::ObjectId};

    use super::*;
    use crate::{config::PoolConfig, protocol::Failure};

    type Responder = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

    /// Answers each write with whatever the responder makes of the bytes it
    /// accepted. Replies queue up like a socket's receive buffer and are served
    /// at most `step` bytes per read.
    struct ScriptedStream {
        respond: Responder,
        accept: usize,
        step: usize,
        input: VecDeque<u8>,
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let len = buf.len().min(self.step);
            self.input.read(&mut buf[..len])
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.accept);
            self.input.extend((self.respond)(&buf[..n]));
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct ScriptedConnector {
        respond: Responder,
        accept: usize,
        step: usize,
        refuse: bool,
        dials: AtomicUsize,
    }

    impl Connector for ScriptedConnector {
        type Stream = ScriptedStream;

        fn connect(&self) -> io::Result<ScriptedStream> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            Ok(ScriptedStream {
                respond: Arc::clone(&self.respond),
                accept: self.accept,
                step: self.step,
                input: VecDeque::new(),
            })
        }
    }

    fn connector(respond: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static) -> ScriptedConnector {
        ScriptedConnector {
            respond: Arc::new(respond),
            accept: usize::MAX,
            step: usize::MAX,
            refuse: false,
            dials: AtomicUsize::new(0),
        }
    }

    fn client(connector: ScriptedConnector) -> Client<ScriptedConnector> {
        let config = PoolConfig {
            min_connections: 0,
            max_connections: 4,
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::open(config, connector).unwrap();
        Client::new(Arc::new(pool), &Config::default())
    }

    /// Client whose proxy answers every request with `response`, recording what it was sent.
    fn replying(response: Document) -> (Client<ScriptedConnector>, Arc<Mutex<Vec<Document>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&sent);
        let client = client(connector(move |bytes| {
            log.lock().unwrap().push(Document::from_reader(bytes).unwrap());
            bson::to_vec(&response).unwrap()
        }));
        (client, sent)
    }

    #[test]
    fn client_create_stamps_envelope() {
        let id = ObjectId::new();
        let (client, sent) = replying(doc! { "_id": ObjectId::new(), "entity": id });

        let envelope = Envelope::new(Action::Retrieve, "itest", "test", doc! { "_id": id });
        let result = client.create(envelope).unwrap();
        assert!(result.is_success());

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].get_str("action").unwrap(), "create");
        assert_eq!(sent[0].get_str("application").unwrap(), "surge");
        assert_eq!(sent[0].get_document("document").unwrap(), &doc! { "_id": id });
    }

    #[test]
    fn client_query_without_options_omits_field() {
        let (client, sent) = replying(doc! { "results": [] });

        client.query("itest", "test", doc! {}).unwrap();
        client
            .delete_with_options("itest", "test", doc! {}, Some(doc! {}))
            .unwrap();
        client
            .query_with_options("itest", "test", doc! {}, Some(doc! { "limit": 2_i64 }))
            .unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].get_str("action").unwrap(), "retrieve");
        assert!(!sent[0].contains_key("options"));
        assert_eq!(sent[1].get_str("action").unwrap(), "delete");
        assert!(!sent[1].contains_key("options"));
        assert_eq!(sent[2].get_document("options").unwrap(), &doc! { "limit": 2_i64 });
    }

    #[test]
    fn client_reuses_connection() {
        let (client, _) = replying(doc! {});

        for _ in 0..3 {
            client.query("itest", "test", doc! {}).unwrap();
        }
        assert_eq!(client.pool().stats().peak, 1);
    }

    #[test]
    fn client_count_representations() {
        let cases = vec![
            (doc! { "count": 7_i32 }, 7),
            (doc! { "count": 9_i64 }, 9),
            (doc! {}, 0),
            (doc! { "count": 3.5 }, 0),
            (doc! { "error": "" }, 0),
        ];

        for (response, expected) in cases {
            let (client, sent) = replying(response);
            assert_eq!(client.count("itest", "test", doc! {}).unwrap(), expected);
            assert_eq!(sent.lock().unwrap()[0].get_str("action").unwrap(), "count");
        }
    }

    #[test]
    fn client_count_remote_error() {
        let (client, _) = replying(doc! { "error": "Not found" });

        let err = client.count("itest", "test", doc! {}).unwrap_err();
        assert!(matches!(err, ClientError::Remote(ref m) if m == "Not found"));
    }

    #[test]
    fn client_count_connect_failure() {
        let mut connector = connector(|_| Vec::new());
        connector.refuse = true;
        let client = client(connector);

        let err = client.count("itest", "test", doc! {}).unwrap_err();
        assert!(matches!(err, ClientError::Connect(PoolError::Dial(_))));
    }

    #[test]
    fn client_encode_failure_sends_nothing() {
        struct Broken;

        impl Codec for Broken {
            fn encode(&self, _: &Envelope) -> Result<Vec<u8>, CodecError> {
                Err(CodecError::MissingField("document"))
            }

            fn decode(&self, bytes: &[u8]) -> Result<Document, CodecError> {
                BsonCodec.decode(bytes)
            }
        }

        let client = client(connector(|_| Vec::new())).with_codec(Broken);
        let err = client.query("itest", "test", doc! {}).unwrap_err();

        assert!(matches!(err, ClientError::Encode(_)));
        assert_eq!(client.pool().stats().peak, 0);
    }

    #[test]
    fn client_decode_failure() {
        let client = client(connector(|_| vec![5, 0, 0, 0, 1]));

        let err = client.query("itest", "test", doc! {}).unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)));
    }

    #[test]
    fn client_closed_connection_is_discarded() {
        let client = client(connector(|_| Vec::new()));

        let err = client.query("itest", "test", doc! {}).unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)));
        assert_eq!(client.pool().stats().live, 0);
    }

    #[test]
    fn client_read_failure() {
        let client = client(connector(|_| vec![1, 0, 0, 0]));

        let err = client.query("itest", "test", doc! {}).unwrap_err();
        assert!(matches!(err, ClientError::Read(_)));
        assert_eq!(client.pool().stats().live, 0);
    }

    #[test]
    fn client_short_write_still_reads() {
        let mut connector = connector(|bytes| {
            assert_eq!(bytes.len(), 10);
            bson::to_vec(&doc! { "results": [] }).unwrap()
        });
        connector.accept = 10;
        let client = client(connector);

        let result = client.query("itest", "test", doc! {}).unwrap();
        assert!(result.is_success());
        assert_eq!(client.pool().stats().live, 0);
    }

    #[test]
    fn client_drops_connection_after_fragmented_short_read() {
        let replies = AtomicUsize::new(0);
        let mut connector = connector(move |_| {
            let reply = if replies.fetch_add(1, Ordering::SeqCst) == 0 {
                doc! { "results": [{ "pad": "x".repeat(300) }] }
            } else {
                doc! { "results": [] }
            };
            bson::to_vec(&reply).unwrap()
        });
        connector.step = 100;

        let config = Config {
            framing: Framing::ShortRead,
            ..Config::default()
        };
        let pool = PoolConfig {
            min_connections: 0,
            max_connections: 1,
            ..PoolConfig::default()
        };
        let pool = Arc::new(ConnectionPool::open(pool, connector).unwrap());
        let client = Client::new(Arc::clone(&pool), &config);

        let err = client.query("itest", "test", doc! {}).unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)));
        assert_eq!(pool.stats().live, 0);

        // a fresh connection, not the rest of the first reply
        let result = client.query("itest", "test", doc! {}).unwrap();
        assert!(result.is_success());
        assert!(result.results.is_empty());
    }

    #[test]
    fn client_remote_error_is_a_result() {
        let (client, _) = replying(doc! { "error": "Missing mandatory field(s)." });

        let result = client.update(Envelope::new(Action::Update, "itest", "test", doc! {}));
        let result = result.unwrap();
        assert!(matches!(
            result.failure(),
            Some(Failure::Remote("Missing mandatory field(s)."))
        ));
    }
}
