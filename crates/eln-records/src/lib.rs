//! Drafts, immutable final records, and SOP definitions on top of a
//! storage [`Backend`](eln_store::Backend).
//!
//! This crate provides:
//! - `DocumentStore` for saving, fetching, listing, querying and sweeping records
//! - JSON envelope assembly for drafts and finals, with form-data checksums
//! - `Metadata` projections used by listings
//! - `AttachmentWorkflow` for moving uploaded files onto a final record
//! - Upload screening for temporary files

pub mod attach;
pub mod caller;
pub mod envelope;
pub mod error;
pub mod metadata;
pub mod store;
pub mod upload;

#[cfg(test)]
mod testing;

pub use attach::{AttachOutcome, AttachedFile, AttachmentWorkflow, ValidationReport};
pub use caller::CallerIdentity;
pub use envelope::{checksum, format_timestamp};
pub use error::{AttachmentCode, RecordError, RecordResult};
pub use metadata::{DraftFields, FinalFields, Metadata, MetadataKind, MetadataType};
pub use store::{
    attachments_prefix, document_key, DocumentStore, ListFilter, SaveExtras, SaveRequest,
    StoredUpload,
};
pub use upload::{validate_batch, validate_file, ScreenedFile, UploadCode, UploadError};
