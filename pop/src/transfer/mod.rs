//! This module provides the admission-controlled, prioritized transfer scheduler.

use std::num::NonZeroU8;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::fetch::{self, Fetcher};
use crate::task::Pool;

mod queue;
pub use queue::*;

const DEFAULT_MAX_CONCURRENT: NonZeroU8 = match NonZeroU8::new(6) {
    Some(n) => n,
    None => unreachable!(),
};

/// Transfer scheduler configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Maximum number of transfers in flight at once.
    pub max_concurrent: NonZeroU8,
    /// Whether completed transfers are delivered in non-decreasing priority order.
    pub strict_order: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            strict_order: false,
        }
    }
}

impl TransferConfig {
    #[inline]
    pub fn with_max_concurrent(self, max_concurrent: NonZeroU8) -> Self {
        Self { max_concurrent, ..self }
    }

    #[inline]
    pub fn with_strict_order(self, strict_order: bool) -> Self {
        Self { strict_order, ..self }
    }
}

/// A snapshot of the scheduler bookkeeping.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    pub active: usize,
    pub max_concurrent: usize,
    pub unsent: usize,
    pub in_flight: usize,
    /// Completed requests held back by strict order.
    pub stalled: usize,
    /// URLs whose last transfer failed and that were not requested again.
    pub failed: usize,
}

enum Command {
    Fetch { url: String, priority: u32, listener: Listener },
    Completed { url: String, result: Result<Bytes, fetch::Error> },
    StrictOrder(bool),
    Stats(oneshot::Sender<TransferStats>),
    State(String, oneshot::Sender<Option<TransferState>>),
}

/// Handle on the process-wide transfer scheduler.
///
/// The scheduler owns a bounded pool of concurrent transfers organized in priority buckets, lower numeric priorities first. Duplicate
/// requests for a URL still pending share a single transfer. When strict order is enabled, a completed transfer is only delivered once
/// every transfer of a higher priority has been delivered.
///
/// Handles are cheap to clone and never block: every request is forwarded to a background task owning the scheduler state, which also
/// invokes the listeners, one at a time.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use pop::fetch::HttpFetcher;
/// # use pop::transfer::{TransferConfig, TransferScheduler};
/// let scheduler = TransferScheduler::new(HttpFetcher::new(), TransferConfig::default().with_strict_order(true));
///
/// scheduler.fetch("http://localhost/bunny/level0.bin", 0, |bytes| println!("{} bytes", bytes.len()));
/// # })
/// ```
#[derive(Debug, Clone)]
pub struct TransferScheduler {
    commands: mpsc::UnboundedSender<Command>,
}

impl TransferScheduler {
    /// Start a scheduler issuing transfers through `fetcher`.
    ///
    /// # Panics
    /// This method panics when called outside of a tokio runtime.
    pub fn new(fetcher: impl Fetcher, config: TransferConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        let driver = Driver {
            queue: TransferQueue::new(&config),
            fetcher: Arc::new(fetcher),
            commands: sender.downgrade(),
        };

        tokio::spawn(driver.run(receiver, Pool::new(config.max_concurrent)));

        Self { commands: sender }
    }

    /// Request `url` at `priority`, calling `on_complete` with the fetched buffer once delivered.
    ///
    /// `on_complete` is never called if the transfer fails.
    pub fn fetch(&self, url: impl Into<String>, priority: u32, on_complete: impl FnOnce(Bytes) + Send + 'static) {
        self.send(Command::Fetch {
            url: url.into(),
            priority,
            listener: Box::new(on_complete),
        });
    }

    /// Switch strict delivery order on or off.
    pub fn set_strict_order(&self, strict_order: bool) {
        self.send(Command::StrictOrder(strict_order));
    }

    pub async fn stats(&self) -> TransferStats {
        let (reply, stats) = oneshot::channel();
        self.send(Command::Stats(reply));
        stats.await.unwrap_or_default()
    }

    /// Current state of the request tracked for `url`, if any, or `Failed` if its last transfer failed.
    pub async fn state(&self, url: impl Into<String>) -> Option<TransferState> {
        let (reply, state) = oneshot::channel();
        self.send(Command::State(url.into(), reply));
        state.await.ok().flatten()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::error!("Transfer scheduler is gone, dropping command.");
        }
    }
}

/// The task owning the scheduler state.
struct Driver {
    queue: TransferQueue,
    fetcher: Arc<dyn Fetcher>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl Driver {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command>, pool: Pool) {
        tracing::debug!("Transfer scheduler started with {} slot(s).", pool.size());

        while let Some(command) = receiver.recv().await {
            match command {
                Command::Fetch { url, priority, listener } => {
                    self.queue.request(url, priority, listener);
                }
                Command::Completed { url, result } => {
                    for delivery in self.queue.complete(&url, result) {
                        delivery.deliver();
                    }
                }
                Command::StrictOrder(strict_order) => {
                    for delivery in self.queue.set_strict_order(strict_order) {
                        delivery.deliver();
                    }
                }
                Command::Stats(reply) => {
                    let _ = reply.send(self.queue.stats());
                }
                Command::State(url, reply) => {
                    let _ = reply.send(self.queue.state(&url));
                }
            }

            for url in self.queue.admit_all() {
                self.issue(&pool, url);
            }
        }

        tracing::debug!("Transfer scheduler stopped.");

        pool.close().await;
    }

    fn issue(&self, pool: &Pool, url: String) {
        let Some(commands) = self.commands.upgrade() else {
            tracing::warn!("Transfer scheduler is shutting down, not issuing `{url}`.");
            return;
        };

        tracing::debug!("Issuing transfer of `{url}`");

        let transfer = self.fetcher.fetch(&url);

        pool.spawn(async move {
            let result = transfer.await;
            let _ = commands.send(Command::Completed { url, result });
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fetch::testing::ManualFetcher;

    fn recorder() -> (mpsc::UnboundedSender<&'static str>, mpsc::UnboundedReceiver<&'static str>) {
        mpsc::unbounded_channel()
    }

    async fn next(receiver: &mut mpsc::UnboundedReceiver<&'static str>) -> &'static str {
        tokio::time::timeout(Duration::from_secs(5), receiver.recv()).await.unwrap().unwrap()
    }

    async fn wait_state(scheduler: &TransferScheduler, url: &str, state: TransferState) {
        while scheduler.state(url).await != Some(state) {
            tokio::task::yield_now().await;
        }
    }

    fn fetch_into(scheduler: &TransferScheduler, url: &'static str, priority: u32, sender: &mpsc::UnboundedSender<&'static str>) {
        let sender = sender.clone();
        scheduler.fetch(url, priority, move |_| {
            let _ = sender.send(url);
        });
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_unordered_delivery_follows_completion_order() {
        let fetcher = ManualFetcher::default();
        let scheduler = TransferScheduler::new(fetcher.clone(), TransferConfig::default().with_max_concurrent(2.try_into().unwrap()));
        let (sender, mut delivered) = recorder();

        fetch_into(&scheduler, "p2", 2, &sender);
        fetch_into(&scheduler, "p0", 0, &sender);
        fetch_into(&scheduler, "p1", 1, &sender);

        assert!(scheduler.stats().await.active <= 2);

        // "p2" is admitted before the others are even queued, "p0" takes the second slot
        fetcher.succeed("p0", b"0").await;
        assert_eq!(next(&mut delivered).await, "p0");
        fetcher.succeed("p1", b"1").await;
        assert_eq!(next(&mut delivered).await, "p1");
        fetcher.succeed("p2", b"2").await;
        assert_eq!(next(&mut delivered).await, "p2");

        assert!(fetcher.peak() <= 2);
        assert_eq!(scheduler.stats().await.active, 0);
    }

    #[tokio::test]
    async fn test_strict_order_delivery() {
        let fetcher = ManualFetcher::default();
        let scheduler = TransferScheduler::new(fetcher.clone(), TransferConfig::default().with_strict_order(true));
        let (sender, mut delivered) = recorder();

        fetch_into(&scheduler, "p2", 2, &sender);
        fetch_into(&scheduler, "p0", 0, &sender);
        fetch_into(&scheduler, "p1", 1, &sender);

        fetcher.succeed("p2", b"2").await;
        wait_state(&scheduler, "p2", TransferState::Done).await;
        assert!(delivered.try_recv().is_err());

        fetcher.succeed("p0", b"0").await;
        assert_eq!(next(&mut delivered).await, "p0");
        assert!(delivered.try_recv().is_err());

        fetcher.succeed("p1", b"1").await;
        assert_eq!(next(&mut delivered).await, "p1");
        assert_eq!(next(&mut delivered).await, "p2");
    }

    #[tokio::test]
    async fn test_duplicate_url_single_transfer() {
        let fetcher = ManualFetcher::default();
        let scheduler = TransferScheduler::new(fetcher.clone(), TransferConfig::default());
        let (sender, mut delivered) = mpsc::unbounded_channel();

        for _ in 0..2 {
            let sender = sender.clone();
            scheduler.fetch("shared", 0, move |bytes| {
                let _ = sender.send(bytes);
            });
        }

        fetcher.succeed("shared", b"\x01\x02\x03").await;

        let first = tokio::time::timeout(Duration::from_secs(5), delivered.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), delivered.recv()).await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(first.as_ref(), [1, 2, 3]);
        assert_eq!(fetcher.calls(), ["shared"]);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_failed_transfer_is_never_delivered() {
        let fetcher = ManualFetcher::default();
        let scheduler = TransferScheduler::new(fetcher.clone(), TransferConfig::default());
        let (sender, mut delivered) = recorder();

        fetch_into(&scheduler, "broken", 0, &sender);
        fetch_into(&scheduler, "fine", 1, &sender);

        fetcher.fail("broken").await;
        fetcher.succeed("fine", b"").await;

        assert_eq!(next(&mut delivered).await, "fine");
        assert_eq!(scheduler.state("broken").await, Some(TransferState::Failed));
        assert!(delivered.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_budget_holds_under_load() {
        let fetcher = ManualFetcher::default();
        let scheduler = TransferScheduler::new(fetcher.clone(), TransferConfig::default().with_max_concurrent(3.try_into().unwrap()));
        let (sender, mut delivered) = mpsc::unbounded_channel();

        let urls: Vec<String> = (0..12).map(|i| format!("level{i}")).collect();

        for (priority, url) in urls.iter().enumerate() {
            let sender = sender.clone();
            scheduler.fetch(url.clone(), priority as u32, move |_| {
                let _ = sender.send(());
            });
        }

        for url in &urls {
            assert!(scheduler.stats().await.active <= 3);
            fetcher.succeed(url, b"").await;
        }

        for _ in &urls {
            tokio::time::timeout(Duration::from_secs(5), delivered.recv()).await.unwrap().unwrap();
        }

        assert!(fetcher.peak() <= 3);
        assert_eq!(fetcher.calls(), urls);
    }
}
