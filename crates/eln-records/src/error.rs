use std::fmt;

use eln_store::StoreError;
use eln_types::IdentityError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::upload::UploadError;

/// Machine-readable reason an attach request was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentCode {
    SopNotFound,
    ElnNotFound,
    ElnCorrupted,
    FieldNotFound,
    FilesNotFound,
    ValidationFailed,
}

impl AttachmentCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SopNotFound => "sop_not_found",
            Self::ElnNotFound => "eln_not_found",
            Self::ElnCorrupted => "eln_corrupted",
            Self::FieldNotFound => "field_not_found",
            Self::FilesNotFound => "files_not_found",
            Self::ValidationFailed => "validation_failed",
        }
    }

    /// HTTP status a routes layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::SopNotFound | Self::ElnNotFound | Self::FilesNotFound => 404,
            Self::FieldNotFound => 400,
            Self::ElnCorrupted | Self::ValidationFailed => 500,
        }
    }

    /// User-facing description of the failed precondition.
    pub fn message(&self) -> &'static str {
        match self {
            Self::SopNotFound => "The SOP for this record could not be found",
            Self::ElnNotFound => "The record to attach files to could not be found",
            Self::ElnCorrupted => "The record exists but could not be read",
            Self::FieldNotFound => "The target field does not exist on this record",
            Self::FilesNotFound => "Some uploaded files could not be found; they may have expired",
            Self::ValidationFailed => "Attachment validation failed unexpectedly",
        }
    }
}

impl fmt::Display for AttachmentCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the document store and the attachment workflow.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists, cannot overwrite: {key}")]
    ImmutableViolation { key: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unable to generate unique {context} after {attempts} attempts")]
    CollisionExhausted { attempts: u32, context: String },

    #[error("storage error: {0}")]
    Backend(#[from] StoreError),

    #[error("attachment refused ({code})")]
    Attachment {
        code: AttachmentCode,
        details: Map<String, Value>,
    },

    #[error("upload rejected: {0}")]
    Upload(#[from] UploadError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<IdentityError> for RecordError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::CollisionExhausted { attempts, context } => {
                Self::CollisionExhausted { attempts, context }
            }
            other => Self::Validation(other.to_string()),
        }
    }
}

impl RecordError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Backend(err) => err.is_not_found(),
            _ => false,
        }
    }

    /// Text suitable for showing to the person who made the request.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound(_) => "record not found".to_string(),
            Self::ImmutableViolation { .. } => "already exists, cannot overwrite".to_string(),
            Self::Backend(err) if err.is_not_found() => "record not found".to_string(),
            Self::Attachment { code, details } => {
                let ids = implicated_ids(details);
                if ids.is_empty() {
                    code.message().to_string()
                } else {
                    format!("{}: {}", code.message(), ids.join(", "))
                }
            }
            Self::Upload(err) => err.message.clone(),
            other => other.to_string(),
        }
    }
}

fn implicated_ids(details: &Map<String, Value>) -> Vec<String> {
    ["missing_files", "ambiguous_files"]
        .iter()
        .filter_map(|key| details.get(*key).and_then(Value::as_array))
        .flatten()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

pub type RecordResult<T> = Result<T, RecordError>;
