use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{StoreError, StoreResult};

/// Bounded pool for blocking backend calls.
///
/// Jobs run on tokio's blocking threads, but at most `size` of them at once,
/// so a burst of requests queues here instead of exhausting the runtime's
/// blocking thread budget. Clones share the same permits.
#[derive(Clone, Debug)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl BlockingPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` on a blocking thread once a permit is available.
    ///
    /// The permit is released when the job returns, even if the awaiting
    /// future has been dropped.
    pub async fn run<F, T>(&self, job: F) -> StoreResult<T>
    where
        F: FnOnce() -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| StoreError::Pool(e.to_string()))?
    }
}

impl Default for BlockingPool {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_BLOCKING_WORKERS)
    }
}
