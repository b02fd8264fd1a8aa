use bson::Document;
use serde::Serialize;

/// Remote operation requested by an [`Envelope`].
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Retrieve,
    Update,
    Delete,
    Count,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Retrieve => "retrieve",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Count => "count",
        }
    }
}

/// Command sent to the proxy. One envelope per operation.
///
/// `options`, `metadata` and `correlationId` never reach the wire when empty.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub action: Action,
    pub database: String,
    pub collection: String,
    pub document: Document,
    #[serde(skip_serializing_if = "is_absent")]
    pub options: Option<Document>,
    #[serde(skip_serializing_if = "is_absent")]
    pub metadata: Option<Document>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub application: String,
    pub skip_version: bool,
}

fn is_absent(doc: &Option<Document>) -> bool {
    doc.as_ref().is_none_or(Document::is_empty)
}

impl Envelope {
    pub fn new(
        action: Action,
        database: impl Into<String>,
        collection: impl Into<String>,
        document: Document,
    ) -> Self {
        Self {
            action,
            database: database.into(),
            collection: collection.into(),
            document,
            options: None,
            metadata: None,
            correlation_id: None,
            application: String::new(),
            skip_version: false,
        }
    }

    pub fn with_options(mut self, options: Option<Document>) -> Self {
        self.options = options.filter(|o| !o.is_empty());
        self
    }

    pub fn with_metadata(mut self, metadata: Option<Document>) -> Self {
        self.metadata = metadata.filter(|m| !m.is_empty());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn skip_version(mut self, skip: bool) -> Self {
        self.skip_version = skip;
        self
    }

    /// Name of the first mandatory field left blank, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.database.is_empty() {
            Some("database")
        } else if self.collection.is_empty() {
            Some("collection")
        } else if self.application.is_empty() {
            Some("application")
        } else {
            None
        }
    }
}
