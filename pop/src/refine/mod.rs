//! This module provides the refinement coordinator, decoding attribute streams level after level.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::decode::{self, DecodeWorker, ThreadBody, WorkerMode, WorkerRequest, WorkerResponse};
use crate::transfer::TransferScheduler;

mod buffer;
pub use buffer::*;

mod job;
pub use job::*;

mod streams;
pub use streams::*;

/// An attribute stream id.
pub type AttributeId = u32;

#[derive(Debug, Error)]
pub enum Error {
    #[error("attribute {0} has no registered result buffer")]
    UnregisteredAttribute(AttributeId),
    #[error("attribute {0} already has a registered result buffer")]
    AlreadyRegistered(AttributeId),
    #[error("invalid layout: {0}")]
    InvalidLayout(&'static str),
    #[error("attribute {0} has no job waiting for `{1}`")]
    UnknownJob(AttributeId, String),
    #[error("attribute {0} has no job processing")]
    NotProcessing(AttributeId),
}

type CapabilityWarning = Arc<dyn Fn(&str) + Send + Sync>;

/// Refinement coordinator configuration.
#[derive(Clone, Default)]
pub struct CoordinatorConfig {
    pub worker: WorkerMode,
    capability_warning: Option<CapabilityWarning>,
}

impl CoordinatorConfig {
    #[inline]
    pub fn with_worker(self, worker: WorkerMode) -> Self {
        Self { worker, ..self }
    }

    /// Call `warning` once if the platform lacks a capability and the coordinator has to degrade.
    #[inline]
    pub fn with_capability_warning(self, warning: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            capability_warning: Some(Arc::new(warning)),
            ..self
        }
    }
}

impl std::fmt::Debug for CoordinatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorConfig")
            .field("worker", &self.worker)
            .field("capability_warning", &self.capability_warning.is_some())
            .finish()
    }
}

enum Command {
    Register { attribute_id: AttributeId, buffer: ResultBuffer },
    Submit { attribute_id: AttributeId, priority: u32, job: RefinementJob },
    DataArrived { attribute_id: AttributeId, url: String, data: Bytes },
    Continue { attribute_id: AttributeId },
    JobStates(AttributeId, oneshot::Sender<Option<Vec<JobStatus>>>),
}

/// Handle on the refinement coordinator.
///
/// The coordinator owns, per attribute stream, the list of refinement jobs and the shared result buffer. It fetches each job's data
/// through the [`TransferScheduler`], then decodes levels on the decode worker in submission order, never more than one at a time
/// per attribute, calling each job's callback with a view over the updated result buffer.
///
/// Handles are cheap to clone and never block. Failures (unknown attributes, invalid layouts, duplicate messages) are logged and
/// absorbed: a stream whose data never arrives just stays at the last level it reached.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use pop::fetch::HttpFetcher;
/// # use pop::refine::{CoordinatorConfig, ElementWidth, Layout, RefinementCoordinator, ResultBuffer};
/// # use pop::transfer::{TransferConfig, TransferScheduler};
/// let scheduler = TransferScheduler::new(HttpFetcher::new(), TransferConfig::default());
/// let coordinator = RefinementCoordinator::new(scheduler, CoordinatorConfig::default());
///
/// coordinator.register_result_buffer(0, ResultBuffer::zeroed(ElementWidth::U16, 3 * 1024));
///
/// for level in 0..8 {
///     let url = format!("http://localhost/bunny/position{level}.bin");
///     coordinator.submit_job(0, level, url, level, Layout::single(3, 3, 2), move |_, positions| {
///         println!("level {level}: {} coordinates", positions.len());
///     });
/// }
/// # })
/// ```
#[derive(Debug, Clone)]
pub struct RefinementCoordinator {
    commands: mpsc::UnboundedSender<Command>,
}

impl RefinementCoordinator {
    /// Start a coordinator fetching job data through `scheduler`.
    ///
    /// # Panics
    /// This method panics when called outside of a tokio runtime.
    pub fn new(scheduler: TransferScheduler, config: CoordinatorConfig) -> Self {
        Self::start(scheduler, config, decode::spawn_thread)
    }

    pub(crate) fn start(
        scheduler: TransferScheduler,
        config: CoordinatorConfig,
        spawner: impl FnOnce(String, ThreadBody) -> std::io::Result<()>,
    ) -> Self {
        let (sender, commands) = mpsc::unbounded_channel();
        let (worker_sender, responses) = mpsc::unbounded_channel();

        let warning = config.capability_warning.clone();
        let worker = DecodeWorker::spawn_with(
            config.worker,
            worker_sender,
            |reason| {
                if let Some(warning) = warning {
                    warning(reason);
                }
            },
            spawner,
        );

        let driver = Driver {
            streams: AttributeStreams::new(),
            scheduler,
            worker,
            commands: sender.downgrade(),
        };

        tokio::spawn(driver.run(commands, responses));

        Self { commands: sender }
    }

    /// Bind the shared destination buffer of `attribute_id`, before submitting any of its jobs.
    pub fn register_result_buffer(&self, attribute_id: AttributeId, buffer: ResultBuffer) {
        self.send(Command::Register { attribute_id, buffer });
    }

    /// Append a refinement job to `attribute_id` and request its data at `priority`.
    ///
    /// Jobs of an attribute are decoded in submission order, so levels must be submitted in ascending order. `on_finished` is called once
    /// the level has been merged.
    pub fn submit_job(
        &self,
        attribute_id: AttributeId,
        priority: u32,
        url: impl Into<String>,
        level: u32,
        layout: Layout,
        on_finished: impl FnOnce(AttributeId, TypedView<'_>) + Send + 'static,
    ) {
        self.send(Command::Submit {
            attribute_id,
            priority,
            job: RefinementJob::new(url, level, layout, on_finished),
        });
    }

    /// Nudge dispatching for `attribute_id`.
    pub fn continue_processing(&self, attribute_id: AttributeId) {
        self.send(Command::Continue { attribute_id });
    }

    /// Status of every job still tracked for `attribute_id`, or `None` for an unregistered attribute.
    pub async fn job_states(&self, attribute_id: AttributeId) -> Option<Vec<JobStatus>> {
        let (reply, states) = oneshot::channel();
        self.send(Command::JobStates(attribute_id, reply));
        states.await.ok().flatten()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::error!("Refinement coordinator is gone, dropping command.");
        }
    }
}

/// The task owning the attribute streams.
struct Driver {
    streams: AttributeStreams,
    scheduler: TransferScheduler,
    worker: DecodeWorker,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, mut responses: mpsc::UnboundedReceiver<WorkerResponse>) {
        tracing::debug!("Refinement coordinator started ({:?} decode worker).", self.worker.mode());

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(response) = responses.recv() => self.on_response(response),
            }
        }

        tracing::debug!("Refinement coordinator stopped.");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Register { attribute_id, buffer } => {
                if let Err(err) = self.streams.register_result_buffer(attribute_id, buffer) {
                    tracing::error!("Cannot register result buffer: {err}");
                }
            }
            Command::Submit { attribute_id, priority, job } => self.submit_job(attribute_id, priority, job),
            Command::DataArrived { attribute_id, url, data } => {
                match self.streams.on_data_arrived(attribute_id, &url, data) {
                    Ok(()) => self.try_dispatch(attribute_id),
                    Err(err) => tracing::warn!("Dropping fetched data: {err}"),
                }
            }
            Command::Continue { attribute_id } => {
                if let Some(request) = self.streams.continue_processing(attribute_id) {
                    self.worker.post(WorkerRequest::Process(request));
                }
            }
            Command::JobStates(attribute_id, reply) => {
                let _ = reply.send(self.streams.job_states(attribute_id));
            }
        }
    }

    fn on_response(&mut self, response: WorkerResponse) {
        match response {
            WorkerResponse::Finished { attribute_id, result } => match self.streams.on_job_finished(attribute_id, result) {
                Ok(()) => self.try_dispatch(attribute_id),
                Err(err) => tracing::warn!("Dropping decode worker response: {err}"),
            },
            WorkerResponse::Log { text } => tracing::debug!("Decode worker: {text}"),
        }
    }

    fn submit_job(&mut self, attribute_id: AttributeId, priority: u32, job: RefinementJob) {
        let url = job.url().to_owned();

        if let Err(err) = self.streams.submit_job(attribute_id, job) {
            tracing::error!("Rejecting job `{url}`: {err}");
            return;
        }

        let Some(commands) = self.commands.upgrade() else {
            return;
        };

        self.scheduler.fetch(url.clone(), priority, move |data| {
            let _ = commands.send(Command::DataArrived { attribute_id, url, data });
        });
    }

    fn try_dispatch(&mut self, attribute_id: AttributeId) {
        if let Some(request) = self.streams.try_dispatch(attribute_id) {
            self.worker.post(WorkerRequest::Process(request));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::fetch::testing::ManualFetcher;
    use crate::transfer::TransferConfig;

    type Finished = (AttributeId, u32, Vec<u32>);

    fn setup(worker: WorkerMode) -> (ManualFetcher, RefinementCoordinator) {
        let fetcher = ManualFetcher::default();
        let scheduler = TransferScheduler::new(fetcher.clone(), TransferConfig::default());
        let coordinator = RefinementCoordinator::new(scheduler, CoordinatorConfig::default().with_worker(worker));

        (fetcher, coordinator)
    }

    fn submit(
        coordinator: &RefinementCoordinator,
        sender: &mpsc::UnboundedSender<Finished>,
        attribute_id: AttributeId,
        url: &str,
        level: u32,
        layout: Layout,
    ) {
        let sender = sender.clone();
        coordinator.submit_job(attribute_id, level, url, level, layout, move |attribute_id, view| {
            let _ = sender.send((attribute_id, level, view.to_vec()));
        });
    }

    async fn next(receiver: &mut mpsc::UnboundedReceiver<Finished>) -> Finished {
        tokio::time::timeout(Duration::from_secs(5), receiver.recv()).await.unwrap().unwrap()
    }

    async fn states(coordinator: &RefinementCoordinator, attribute_id: AttributeId) -> Vec<JobState> {
        coordinator
            .job_states(attribute_id)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|status| status.state)
            .collect()
    }

    async fn wait_states(coordinator: &RefinementCoordinator, attribute_id: AttributeId, expected: &[JobState]) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while states(coordinator, attribute_id).await != expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_levels_decode_in_submission_order() {
        let (fetcher, coordinator) = setup(WorkerMode::Thread);
        let (sender, mut finished) = mpsc::unbounded_channel();

        coordinator.register_result_buffer(7, ResultBuffer::zeroed(ElementWidth::U16, 2));
        submit(&coordinator, &sender, 7, "level0.bin", 0, Layout::single(1, 1, 8));
        submit(&coordinator, &sender, 7, "level1.bin", 1, Layout::single(1, 1, 8));

        fetcher.succeed("level1.bin", &[0x34, 0xcd]).await;
        wait_states(&coordinator, 7, &[JobState::WaitingForData, JobState::DataAvailable]).await;
        assert!(finished.try_recv().is_err());

        fetcher.succeed("level0.bin", &[0x12, 0xab]).await;

        assert_eq!(next(&mut finished).await, (7, 0, vec![0x1200, 0xab00]));
        assert_eq!(next(&mut finished).await, (7, 1, vec![0x1234, 0xabcd]));

        wait_states(&coordinator, 7, &[]).await;
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_failed_transfer_only_stalls_its_stream() {
        let (fetcher, coordinator) = setup(WorkerMode::Thread);
        let (sender, mut finished) = mpsc::unbounded_channel();

        coordinator.register_result_buffer(1, ResultBuffer::zeroed(ElementWidth::U8, 1));
        coordinator.register_result_buffer(2, ResultBuffer::zeroed(ElementWidth::U8, 1));

        submit(&coordinator, &sender, 1, "broken.bin", 0, Layout::single(1, 1, 4));
        submit(&coordinator, &sender, 2, "fine0.bin", 0, Layout::single(1, 1, 4));
        submit(&coordinator, &sender, 2, "fine1.bin", 1, Layout::single(1, 1, 4));

        fetcher.fail("broken.bin").await;
        fetcher.succeed("fine0.bin", &[0xa0]).await;
        fetcher.succeed("fine1.bin", &[0x50]).await;

        assert_eq!(next(&mut finished).await, (2, 0, vec![0xa0]));
        assert_eq!(next(&mut finished).await, (2, 1, vec![0xa5]));

        coordinator.continue_processing(1);
        assert_eq!(states(&coordinator, 1).await, [JobState::WaitingForData]);
        assert!(finished.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shared_url_across_attributes() {
        let (fetcher, coordinator) = setup(WorkerMode::Inline);
        let (sender, mut finished) = mpsc::unbounded_channel();

        coordinator.register_result_buffer(1, ResultBuffer::zeroed(ElementWidth::U8, 1));
        coordinator.register_result_buffer(2, ResultBuffer::zeroed(ElementWidth::U16, 1));

        submit(&coordinator, &sender, 1, "shared.bin", 0, Layout::single(1, 1, 8));
        submit(&coordinator, &sender, 2, "shared.bin", 0, Layout::single(1, 1, 8));

        fetcher.succeed("shared.bin", &[0x7f]).await;

        let mut results = vec![next(&mut finished).await, next(&mut finished).await];
        results.sort();

        assert_eq!(results, [(1, 0, vec![0x7f]), (2, 0, vec![0x7f00])]);
        assert_eq!(fetcher.calls(), ["shared.bin"]);
    }

    #[tokio::test]
    async fn test_invalid_submissions_are_rejected() {
        let (fetcher, coordinator) = setup(WorkerMode::Inline);
        let (sender, _finished) = mpsc::unbounded_channel();

        submit(&coordinator, &sender, 9, "orphan.bin", 0, Layout::single(1, 1, 8));
        coordinator.register_result_buffer(3, ResultBuffer::zeroed(ElementWidth::U8, 1));
        coordinator.register_result_buffer(3, ResultBuffer::zeroed(ElementWidth::U8, 1));
        submit(&coordinator, &sender, 3, "invalid.bin", 0, Layout::single(1, 2, 8));

        let overflowing = Layout {
            write_offsets: vec![usize::MAX],
            ..Layout::single(1, 1, 8)
        };
        submit(&coordinator, &sender, 3, "overflow.bin", 0, overflowing);

        assert_eq!(coordinator.job_states(9).await, None);
        assert_eq!(coordinator.job_states(3).await, Some(vec![]));
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_threads_degrade_with_one_warning() {
        let fetcher = ManualFetcher::default();
        let scheduler = TransferScheduler::new(fetcher.clone(), TransferConfig::default());

        let warnings = Arc::new(AtomicUsize::new(0));
        let config = CoordinatorConfig::default().with_capability_warning({
            let warnings = Arc::clone(&warnings);
            move |_| {
                warnings.fetch_add(1, Ordering::SeqCst);
            }
        });

        let coordinator = RefinementCoordinator::start(scheduler, config, |_, _| {
            Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
        });
        let (sender, mut finished) = mpsc::unbounded_channel();

        coordinator.register_result_buffer(4, ResultBuffer::zeroed(ElementWidth::U8, 1));
        submit(&coordinator, &sender, 4, "level0.bin", 0, Layout::single(1, 1, 4));
        submit(&coordinator, &sender, 4, "level1.bin", 1, Layout::single(1, 1, 4));

        fetcher.succeed("level0.bin", &[0xc0]).await;
        fetcher.succeed("level1.bin", &[0x30]).await;

        assert_eq!(next(&mut finished).await, (4, 0, vec![0xc0]));
        assert_eq!(next(&mut finished).await, (4, 1, vec![0xc3]));
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_normal_synthesis_end_to_end() {
        let (fetcher, coordinator) = setup(WorkerMode::Thread);
        let (sender, mut finished) = mpsc::unbounded_channel();

        let layout = Layout {
            stride: 6,
            component_counts: vec![3, 3],
            bits_per_level: vec![2, 0],
            read_offsets: vec![0, 0],
            write_offsets: vec![0, 3],
        };

        coordinator.register_result_buffer(0, ResultBuffer::zeroed(ElementWidth::U16, 3 * 6));
        submit(&coordinator, &sender, 0, "triangle0.bin", 0, layout);

        fetcher.succeed("triangle0.bin", &[0b00_00_00_00, 0b11_00_00_00, 0b00_11_00_00]).await;

        let (_, _, values) = next(&mut finished).await;

        for vertex in values.chunks_exact(6) {
            assert!(vertex[3].abs_diff(0x8000) <= 1);
            assert!(vertex[4].abs_diff(0x8000) <= 1);
            assert_eq!(vertex[5], 0xffff);
        }
    }
}
