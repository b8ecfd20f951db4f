//! Asynchronous utilities for use with Tokio.

use std::{
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::task::JoinHandle;

use crate::prelude::*;

/// A type alias for a boxed future. This is used to make it easier to work with
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A handle for one or more background workers. This can be awaited
/// to wait for all workers to complete normally.
pub struct JoinWorker {
    /// The task handle.
    future: BoxedFuture<Result<()>>,
}

impl JoinWorker {
    /// Create a new worker handle from a [`JoinHandle`].
    pub fn from_handle(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            future: Box::pin(async move { handle.await.context("could not join task")? }),
        }
    }

    /// Wait for the worker to complete.
    pub async fn join(self) -> Result<()> {
        self.future.await
    }
}

/// Run `work` over `items` with at most `workers` tasks at once.
///
/// Workers take the next item from a shared counter. After the first error,
/// workers stop picking up new items, and that error is returned once every
/// worker has drained. On success, returns the number of items processed.
pub async fn run_bounded<T, F, Fut>(workers: usize, items: Vec<T>, work: F) -> Result<usize>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let items = Arc::new(items);
    let next = Arc::new(Mutex::new(0usize));
    let failed = Arc::new(AtomicBool::new(false));
    let processed = Arc::new(Mutex::new(0usize));

    let worker_count = workers.clamp(1, items.len().max(1));
    let mut handles = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
        let items = items.clone();
        let next = next.clone();
        let failed = failed.clone();
        let processed = processed.clone();
        let work = work.clone();
        let handle = tokio::spawn(async move {
            loop {
                if failed.load(Ordering::SeqCst) {
                    trace!(worker_id, "Stopping after another worker failed");
                    return Ok(());
                }
                let index = {
                    let mut next = next.lock().expect("lock poisoned");
                    let index = *next;
                    *next += 1;
                    index
                };
                let Some(item) = items.get(index).cloned() else {
                    return Ok(());
                };
                if let Err(err) = work(item).await {
                    failed.store(true, Ordering::SeqCst);
                    return Err(err);
                }
                *processed.lock().expect("lock poisoned") += 1;
            }
        });
        handles.push(JoinWorker::from_handle(handle));
    }

    let mut first_error = None;
    for handle in handles {
        if let Err(err) = handle.join().await {
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(*processed.lock().expect("lock poisoned")),
    }
}
