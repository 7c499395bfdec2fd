//! Per-backend request gating
//!
//! Wraps a connector so that at most `max_concurrent` calls are in flight at
//! once and consecutive calls start at least `min_interval` apart.

use super::{Connector, TaskFilter};
use crate::model::{NativeId, SourceSystem, Task, TaskFields, TaskPatch};
use crate::{Result, TaskSyncError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// Connector decorator enforcing a concurrency cap and a fixed-delay gate
pub struct Throttled {
    inner: Arc<dyn Connector>,
    permits: Semaphore,
    min_interval: Duration,
    next_start: Mutex<Instant>,
}

impl Throttled {
    pub fn new(inner: Arc<dyn Connector>, max_concurrent: usize, min_interval: Duration) -> Self {
        Self {
            inner,
            permits: Semaphore::new(max_concurrent.max(1)),
            min_interval,
            next_start: Mutex::new(Instant::now()),
        }
    }

    /// No spacing and a generous cap; for in-memory backends
    pub fn unthrottled(inner: Arc<dyn Connector>) -> Self {
        Self::new(inner, Semaphore::MAX_PERMITS, Duration::ZERO)
    }

    pub fn inner(&self) -> &Arc<dyn Connector> {
        &self.inner
    }

    async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| TaskSyncError::Other(format!("throttle closed: {}", e)))?;

        if !self.min_interval.is_zero() {
            let start_at = {
                let mut next = self.next_start.lock().await;
                let now = Instant::now();
                let slot = (*next).max(now);
                *next = slot + self.min_interval;
                slot
            };
            trace!(system = %self.inner.system(), "Waiting for request slot");
            sleep_until(start_at).await;
        }

        Ok(permit)
    }
}

#[async_trait]
impl Connector for Throttled {
    fn system(&self) -> SourceSystem {
        self.inner.system()
    }

    async fn fetch_all(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let _permit = self.acquire().await?;
        self.inner.fetch_all(filter).await
    }

    async fn fetch_one(&self, id: &NativeId) -> Result<Option<Task>> {
        let _permit = self.acquire().await?;
        self.inner.fetch_one(id).await
    }

    async fn create(&self, fields: &TaskFields) -> Result<Task> {
        let _permit = self.acquire().await?;
        self.inner.create(fields).await
    }

    async fn update(&self, id: &NativeId, patch: &TaskPatch) -> Result<Task> {
        let _permit = self.acquire().await?;
        self.inner.update(id, patch).await
    }

    async fn delete(&self, id: &NativeId) -> Result<()> {
        let _permit = self.acquire().await?;
        self.inner.delete(id).await
    }
}
