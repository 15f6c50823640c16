//! Storage backends for ELN documents.
//!
//! A backend is a key/value object store partitioned into one bucket per
//! [`DocumentType`](eln_types::DocumentType). The document layer above never
//! sees bucket names, paths, or HTTP; it only sees the [`Backend`] trait.
//!
//! # Backends
//!
//! - [`LocalBackend`] -- buckets are directories under a root on local disk
//! - [`ObjectStoreBackend`] -- buckets are named containers behind an [`ObjectClient`]:
//!   - [`InMemoryObjectClient`] for tests and embedding
//!   - [`S3Client`] for S3-compatible services (SigV4-signed HTTP)
//!
//! # Design Rules
//!
//! 1. Missing objects surface as [`StoreError::NotFound`] regardless of backend.
//! 2. An unmapped bucket is a configuration error, never silently defaulted.
//! 3. Blocking filesystem calls run on the bounded [`BlockingPool`].
//! 4. Keys are relative and may not escape their bucket.
//! 5. Backends never interpret payloads.

pub mod config;
pub mod error;
pub mod factory;
pub mod local;
pub mod memory;
pub mod object;
pub mod pool;
pub mod s3;
pub mod sigv4;
pub mod traits;

pub use config::{BackendKind, BucketMap, S3Config, StorageConfig};
pub use error::{StoreError, StoreResult};
pub use factory::open_backend;
pub use local::{find_project_root, resolve_local_root, LocalBackend};
pub use memory::InMemoryObjectClient;
pub use object::{ListPage, ObjectClient, ObjectStoreBackend};
pub use pool::BlockingPool;
pub use s3::S3Client;
pub use traits::{Attributes, Backend, ObjectEntry};
