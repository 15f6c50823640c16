use eln_types::DocumentType;

/// Errors from storage backend operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object does not exist.
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// No bucket is configured for the requested document type.
    #[error("no bucket configured for document type '{0}'")]
    BucketNotConfigured(DocumentType),

    /// The key is empty, absolute, or escapes its bucket.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// I/O error from the filesystem backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The object store answered with an unexpected status.
    #[error("object store returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The request never completed (connection, TLS, timeout).
    #[error("transport error: {0}")]
    Transport(String),

    /// A listing response could not be parsed.
    #[error("malformed listing response: {0}")]
    Xml(String),

    /// Invalid or incomplete storage configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A blocking task panicked or was cancelled.
    #[error("blocking worker failed: {0}")]
    Pool(String),
}

impl StoreError {
    pub fn not_found(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Returns `true` if this error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
