use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tokio::sync::{Notify, Semaphore};
use tracing::{error, warn};

use crate::error::SyncResult;

struct Inner {
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Runs submission pipelines in the background, at most `concurrency` at a
/// time. Each task is its own failure domain: errors and panics are logged
/// and never reach the caller.
#[derive(Clone)]
pub struct BackgroundExecutor {
    inner: Arc<Inner>,
}

impl BackgroundExecutor {
    pub fn new(concurrency: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(concurrency.max(1))),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn spawn<F>(&self, request_id: String, task: F)
    where
        F: Future<Output = SyncResult<()>> + Send + 'static,
    {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let permit = inner.permits.clone().acquire_owned().await;
            match tokio::spawn(task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(%request_id, error = %err, "background processing failed");
                }
                Err(join_err) if join_err.is_panic() => {
                    error!(%request_id, error = %join_err, "background processing panicked");
                }
                Err(join_err) => {
                    warn!(%request_id, error = %join_err, "background processing cancelled");
                }
            }
            drop(permit);

            if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
        });
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Resolves once no task is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}
