use std::fmt;

use bson::{Document, oid::ObjectId};
use serde::Deserialize;

use crate::client::ClientError;

/// Outcome of one operation.
///
/// `error`, `result` and `results` come from the proxy's response. The
/// `identifier` and `transport_error` fields never travel on the wire.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct OperationResult {
    #[serde(skip)]
    pub identifier: Option<ObjectId>,
    pub error: String,
    pub result: Option<Document>,
    pub results: Vec<Document>,
    #[serde(skip)]
    pub transport_error: Option<ClientError>,
}

/// Why an operation did not succeed.
#[derive(Debug)]
pub enum Failure<'a> {
    /// No usable response was decoded.
    Transport(&'a ClientError),
    /// The proxy answered with a non-empty `error` field.
    Remote(&'a str),
}

impl fmt::Display for Failure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Transport(err) => write!(f, "{err}"),
            Failure::Remote(err) => write!(f, "remote error: {err}"),
        }
    }
}

impl OperationResult {
    pub fn from_error(err: ClientError) -> Self {
        Self {
            transport_error: Some(err),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure().is_none()
    }

    pub fn failure(&self) -> Option<Failure<'_>> {
        match &self.transport_error {
            Some(err) => Some(Failure::Transport(err)),
            None if !self.error.is_empty() => Some(Failure::Remote(&self.error)),
            None => None,
        }
    }
}
