//! Foundation types for ELN document storage.
//!
//! Every record persisted by the storage core is identified by its filename.
//! This crate owns that identity: how it is minted, how it is parsed back into
//! components, and how user-supplied values are normalized so the filename
//! stays sortable and auditable.
//!
//! # Key Types
//!
//! - [`IdentityGenerator`] -- mints `{status}-{user}-{vars..}-{ts}-{shortid}.json`
//! - [`ParsedFilename`] -- the components recovered from a stored filename
//! - [`DocumentType`] -- storage location discriminator (`drafts`, `submissions`, `sops`)
//! - [`Status`] -- `draft` or `final`
//! - [`ShortIdSource`] / [`Clock`] -- injectable entropy and time sources
//!
//! # Design Rules
//!
//! 1. Identity is derived, never assigned by the caller.
//! 2. Every filename component is free of the `-` delimiter after normalization.
//! 3. Collision retries are bounded; exhaustion is fatal and never retried.
//! 4. Field ids embedded in filenames are escaped reversibly.

pub mod document;
pub mod error;
pub mod escape;
pub mod fields;
pub mod identity;
pub mod names;

pub use document::{DocumentType, Status};
pub use error::{IdentityError, IdentityResult};
pub use escape::{escape_field_id, temp_file_key, unescape_field_id};
pub use fields::{extract_filename_variables, FilenameComponents};
pub use identity::{
    Clock, FixedClock, GeneratedName, IdentityGenerator, RandomShortIds, ScriptedShortIds,
    ShortIdSource, SystemClock, DEFAULT_MAX_ATTEMPTS,
};
pub use names::{compose_filename, normalize, parse_filename, ParsedFilename, EMPTY_COMPONENT};
