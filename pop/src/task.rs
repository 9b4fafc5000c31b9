//! This module provides the background pool running admitted transfers.

use std::num::NonZeroU8;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{self, Future, FutureExt};
use tokio::sync::{mpsc, Mutex};

type Task = future::BoxFuture<'static, ()>;

/// A fixed-size pool of background workers processing fire-and-forget tasks.
///
/// The pool is sized after the transfer concurrency budget: as long as no more than `size` tasks are pushed at once, every task gets
/// a worker of its own and starts right away. Any excess task waits in the channel for the next worker to become idle.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use pop::task::Pool;
/// let pool = Pool::new(2.try_into().unwrap());
///
/// for level in 0..4 {
///     pool.spawn(async move { println!("Fetching refinement level #{level}...") });
/// }
///
/// pool.close().await;
/// # })
/// ```
#[derive(Debug)]
pub struct Pool {
    /// The pool of workers.
    workers: Vec<Worker>,
    /// The sending part of a channel to push tasks to the workers.
    sender: mpsc::UnboundedSender<Task>,
}

impl Pool {
    /// Start a pool with `size` workers.
    ///
    /// # Panics
    /// This method panics when called outside of a tokio runtime.
    pub fn new(size: NonZeroU8) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        let receiver = Arc::new(Mutex::new(receiver));

        static WORKER_ID: AtomicUsize = AtomicUsize::new(0);
        let size = size.get().into();
        let id = WORKER_ID.fetch_add(size, Ordering::Relaxed);

        let workers = (0..size).map(|i| Worker::new(id.wrapping_add(i), Arc::clone(&receiver))).collect();

        Self { workers, sender }
    }

    /// Number of workers in the pool.
    #[inline]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Push a task to the pool and forget it.
    #[inline]
    pub fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
        if self.sender.send(future.boxed()).is_err() {
            tracing::warn!("All pool workers are gone, dropping task.");
        }
    }

    /// Close the pool, waiting for all pending tasks to complete.
    pub async fn close(self) {
        drop(self.sender);

        future::join_all(self.workers.into_iter().inspect(|worker| {
            tracing::debug!("Stopping pool worker {}...", worker.id);
        }))
        .await;
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: tokio::task::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>) -> Worker {
        tracing::trace!("Starting pool worker {id}...");

        Worker {
            id,
            handle: tokio::spawn(async move {
                loop {
                    // release the lock before running the task so that idle workers keep receiving
                    let message = receiver.lock().await.recv().await;

                    match message {
                        Some(task) => task.await,
                        None => {
                            tracing::trace!("All tasks exhausted, shutting down pool worker {id}.");
                            break;
                        }
                    }
                }
            }),
        }
    }
}

impl Future for Worker {
    type Output = Result<(), tokio::task::JoinError>;

    #[inline]
    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        self.handle.poll_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_pool_runs_every_task() {
        let pool = Pool::new(3.try_into().unwrap());
        assert_eq!(pool.size(), 3);

        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let done = Arc::clone(&done);
            pool.spawn(async move {
                tokio::task::yield_now().await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.close().await;

        assert_eq!(done.load(Ordering::SeqCst), 10);
    }
}
