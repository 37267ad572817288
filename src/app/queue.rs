use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config;

/// Bounded pool for independent runs (separate books). Submissions past the
/// worker count wait in FIFO order.
#[derive(Debug, Clone)]
pub struct JobPool {
    semaphore: Arc<Semaphore>,
    workers: usize,
}

impl JobPool {
    pub fn new(max_concurrency: usize) -> Self {
        let workers = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    /// Sized from `AUTOBOOK_MAX_CONCURRENCY`.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::new(config::pool_size_from_env()?))
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Waits for a free worker, then spawns `fut` holding it until the job ends.
    ///
    /// The permit is taken before spawning, so jobs start in submission order.
    pub async fn submit<F, T>(&self, fut: F) -> anyhow::Result<JoinHandle<anyhow::Result<T>>>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .context("job pool is closed")?;
        Ok(tokio::spawn(async move {
            let _permit = permit;
            fut.await
        }))
    }
}
