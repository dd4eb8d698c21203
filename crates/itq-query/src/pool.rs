//! Fixed-size pool of fetch workers draining one shared intake.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_channel::{Receiver, Sender};
use itq_core::IssuesFeed;
use itq_storage::FetchError;
use tokio::sync::{oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{FetchExecutor, QuerySpec};

pub type PageResult = Result<IssuesFeed, FetchError>;

struct Task {
    spec: QuerySpec,
    reply: oneshot::Sender<PageResult>,
    // Held until the fetch finishes.
    _slot: OwnedSemaphorePermit,
}

/// Resolves to the result of one submitted page.
///
/// Resolves to [`FetchError::PoolClosed`] if the pool shut its intake before
/// the task reached a worker.
#[must_use = "a submitted page is fetched regardless; await it to see the result"]
pub struct PendingPage {
    rx: oneshot::Receiver<PageResult>,
}

impl Future for PendingPage {
    type Output = PageResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(FetchError::PoolClosed)))
    }
}

/// `size` long-lived workers, each running one fetch at a time.
///
/// A task enters the intake only once it holds one of `size` worker slots,
/// so nothing waits in the intake while every worker is busy. The wait for
/// a slot happens on a spawned hand-off task, never in [`WorkerPool::submit`].
/// Must be created inside a tokio runtime.
pub struct WorkerPool {
    intake: Sender<Task>,
    slots: Arc<Semaphore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    executor: Arc<FetchExecutor>,
    size: usize,
}

impl WorkerPool {
    /// A `size` of zero is raised to one.
    pub fn new(size: usize, executor: FetchExecutor) -> Self {
        let size = size.max(1);
        let executor = Arc::new(executor);
        let (intake, tasks) = async_channel::bounded(1);

        let workers = (0..size)
            .map(|id| tokio::spawn(run_worker(id, tasks.clone(), Arc::clone(&executor))))
            .collect();
        debug!(size, "worker pool started");

        Self {
            intake,
            slots: Arc::new(Semaphore::new(size)),
            workers: Mutex::new(workers),
            executor,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn executor(&self) -> &FetchExecutor {
        &self.executor
    }

    /// Queue one page fetch. Returns immediately.
    pub fn submit(&self, spec: QuerySpec) -> PendingPage {
        let (reply, rx) = oneshot::channel();
        let intake = self.intake.clone();
        let slots = Arc::clone(&self.slots);
        tokio::spawn(async move {
            // On a closed pool the reply sender is dropped here.
            let Ok(slot) = slots.acquire_owned().await else {
                debug!("pool closed while waiting for a worker");
                return;
            };
            let task = Task {
                spec,
                reply,
                _slot: slot,
            };
            if intake.send(task).await.is_err() {
                debug!("intake closed before hand-off");
            }
        });
        PendingPage { rx }
    }

    pub async fn fetch_page(&self, spec: &QuerySpec) -> PageResult {
        self.submit(spec.clone()).await
    }

    /// Stop accepting tasks. In-flight tasks still complete; tasks still
    /// waiting for a worker resolve to [`FetchError::PoolClosed`].
    pub fn close(&self) {
        self.slots.close();
        if self.intake.close() {
            debug!("worker pool intake closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.intake.is_closed()
    }

    /// Close the intake and wait for every worker to exit.
    pub async fn shutdown(&self) {
        self.close();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "worker task ended abnormally");
            }
        }
    }
}

async fn run_worker(id: usize, tasks: Receiver<Task>, executor: Arc<FetchExecutor>) {
    while let Ok(Task { spec, reply, _slot }) = tasks.recv().await {
        let url = spec.to_url();
        debug!(worker = id, url = %url, "fetching page");

        let result = executor.fetch_page(&spec).await;
        if let Err(err) = &result {
            warn!(worker = id, url = %url, error = %err, "page fetch failed");
        }
        if reply.send(result).is_err() {
            debug!(worker = id, url = %url, "page result dropped by caller");
        }
    }
    debug!(worker = id, "worker exiting");
}
