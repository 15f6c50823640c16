use std::sync::Arc;

use tracing::info;

use crate::config::{BackendKind, StorageConfig};
use crate::error::{StoreError, StoreResult};
use crate::local::LocalBackend;
use crate::object::ObjectStoreBackend;
use crate::s3::S3Client;
use crate::traits::Backend;

/// Open the backend selected by `config`.
pub fn open_backend(config: &StorageConfig) -> StoreResult<Arc<dyn Backend>> {
    config.validate()?;
    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Local => Arc::new(LocalBackend::from_config(config)?),
        BackendKind::ObjectStore => {
            let s3 = config
                .s3
                .as_ref()
                .ok_or_else(|| StoreError::Config("missing [s3] section".into()))?;
            Arc::new(ObjectStoreBackend::new(
                S3Client::new(s3)?,
                config.buckets.clone(),
            ))
        }
    };
    info!(backend = backend.name(), "storage backend ready");
    Ok(backend)
}
