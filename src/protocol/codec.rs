use bson::Document;
use thiserror::Error;

use super::Envelope;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] bson::ser::Error),
    #[error("failed to deserialize response: {0}")]
    Deserialize(#[from] bson::de::Error),
    #[error("envelope is missing mandatory field '{0}'")]
    MissingField(&'static str),
}

/// Turns envelopes into wire bytes and wire bytes into documents.
pub trait Codec: Send + Sync {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Document, CodecError>;
}

/// The proxy's native encoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct BsonCodec;

impl Codec for BsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        if let Some(field) = envelope.missing_field() {
            return Err(CodecError::MissingField(field));
        }
        Ok(bson::to_vec(envelope)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Document, CodecError> {
        Ok(Document::from_reader(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;
    use crate::protocol::Action;

    #[test]
    fn bson_codec_rejects_blank_application() {
        let envelope = Envelope::new(Action::Create, "itest", "test", doc! {});
        let err = BsonCodec.encode(&envelope).unwrap_err();

        assert!(matches!(err, CodecError::MissingField("application")));
    }

    #[test]
    fn bson_codec_prefixes_length() {
        let mut envelope = Envelope::new(Action::Count, "itest", "test", doc! {});
        envelope.application = "surge".to_string();

        let bytes = BsonCodec.encode(&envelope).unwrap();
        let declared = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(declared as usize, bytes.len());

        let decoded = BsonCodec.decode(&bytes).unwrap();
        assert_eq!(decoded.get_str("application").unwrap(), "surge");
    }

    #[test]
    fn bson_codec_rejects_garbage() {
        let err = BsonCodec.decode(b"not bson at all").unwrap_err();
        assert!(matches!(err, CodecError::Deserialize(_)));
    }
}
