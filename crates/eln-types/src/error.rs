use thiserror::Error;

/// Errors produced while minting or parsing record identities.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Status outside the `draft` / `final` pair.
    #[error("invalid status: {0}")]
    InvalidStatus(String),

    /// Unknown document type discriminator.
    #[error("unsupported document type: {0}")]
    InvalidDocumentType(String),

    /// The existence predicate reported a collision on every attempt.
    #[error("unable to generate unique {context} after {attempts} attempts")]
    CollisionExhausted { attempts: u32, context: String },

    /// A stored filename does not follow the identity grammar.
    #[error("malformed filename {name}: {reason}")]
    MalformedFilename { name: String, reason: String },
}

/// Result alias for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;
