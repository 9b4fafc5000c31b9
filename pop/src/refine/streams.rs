use std::collections::HashMap;

use bytes::Bytes;

use super::*;
use crate::decode::ProcessRequest;

/// The jobs and shared result buffer of one attribute.
#[derive(Debug)]
struct AttributeStream {
    /// Jobs in submission order, ie. ascending level.
    jobs: Vec<RefinementJob>,
    /// `None` while the buffer is away on the decode worker.
    result: Option<ResultBuffer>,
}

impl AttributeStream {
    fn processing(&self) -> Option<usize> {
        self.jobs.iter().position(|job| job.state == JobState::Processing)
    }
}

/// Per-attribute refinement job lists and result buffers.
///
/// This is the synchronous bookkeeping behind [`RefinementCoordinator`]. It guarantees that at most one job per attribute is
/// [`JobState::Processing`] at any time: dispatching moves the attribute's result buffer out into the [`ProcessRequest`], and nothing
/// else is dispatched for that attribute until the buffer is handed back through [`AttributeStreams::on_job_finished()`].
#[derive(Debug, Default)]
pub struct AttributeStreams {
    streams: HashMap<AttributeId, AttributeStream>,
}

impl AttributeStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the shared destination buffer of `attribute_id`.
    pub fn register_result_buffer(&mut self, attribute_id: AttributeId, buffer: ResultBuffer) -> Result<(), Error> {
        if self.streams.contains_key(&attribute_id) {
            return Err(Error::AlreadyRegistered(attribute_id));
        }

        tracing::debug!(
            "Registered result buffer of attribute {attribute_id}: {} x {:?}",
            buffer.len(),
            buffer.width()
        );

        self.streams.insert(
            attribute_id,
            AttributeStream {
                jobs: vec![],
                result: Some(buffer),
            },
        );

        Ok(())
    }

    /// Append `job` to the job list of `attribute_id`.
    ///
    /// Jobs must be submitted in ascending level order: that order is the decode order.
    pub fn submit_job(&mut self, attribute_id: AttributeId, job: RefinementJob) -> Result<(), Error> {
        job.layout.validate()?;

        let stream = self
            .streams
            .get_mut(&attribute_id)
            .ok_or(Error::UnregisteredAttribute(attribute_id))?;

        if stream.jobs.last().is_some_and(|last| last.level > job.level) {
            tracing::warn!(
                "Job `{}` of attribute {attribute_id} submitted out of level order ({})",
                job.url,
                job.level
            );
        }

        debug_assert_eq!(job.state, JobState::WaitingForData);

        stream.jobs.push(job);

        Ok(())
    }

    /// Store the fetched `data` into the job of `attribute_id` waiting for `url`.
    pub fn on_data_arrived(&mut self, attribute_id: AttributeId, url: &str, data: Bytes) -> Result<(), Error> {
        let job = self
            .streams
            .get_mut(&attribute_id)
            .and_then(|stream| {
                stream
                    .jobs
                    .iter_mut()
                    .find(|job| job.url == url && job.state == JobState::WaitingForData)
            })
            .ok_or_else(|| Error::UnknownJob(attribute_id, url.to_owned()))?;

        job.input = Some(data);
        job.advance(JobState::DataAvailable);

        Ok(())
    }

    /// Pick the next job of `attribute_id` to decode, if any.
    ///
    /// Nothing is dispatched while a job of the attribute is processing. Otherwise the earliest submitted job still tracked is moved to
    /// processing if its data is available, and both its input and the attribute's result buffer move into the returned request.
    pub fn try_dispatch(&mut self, attribute_id: AttributeId) -> Option<ProcessRequest> {
        let stream = self.streams.get_mut(&attribute_id)?;

        if stream.processing().is_some() {
            return None;
        }

        // only the earliest unfinished job may go, so that levels are never merged out of order
        let job = stream.jobs.first_mut().filter(|job| job.state == JobState::DataAvailable)?;

        let Some(result) = stream.result.take() else {
            tracing::error!("Result buffer of attribute {attribute_id} is missing while no job is processing");
            return None;
        };

        job.advance(JobState::Processing);

        tracing::debug!("Dispatching level {} of attribute {attribute_id}", job.level);

        Some(ProcessRequest {
            attribute_id,
            level: job.level,
            layout: job.layout.clone(),
            input: job.input.take().unwrap_or_default(),
            result,
        })
    }

    /// Take back the result buffer of `attribute_id` and complete its processing job.
    ///
    /// The job's callback is invoked with a view over the updated buffer, then the job is forgotten.
    pub fn on_job_finished(&mut self, attribute_id: AttributeId, result: ResultBuffer) -> Result<(), Error> {
        let stream = self
            .streams
            .get_mut(&attribute_id)
            .ok_or(Error::UnregisteredAttribute(attribute_id))?;

        let index = stream.processing().ok_or(Error::NotProcessing(attribute_id))?;

        debug_assert!(stream.result.is_none());

        let mut job = stream.jobs.remove(index);
        job.advance(JobState::Finished);

        let result = stream.result.insert(result);

        tracing::debug!("Finished level {} of attribute {attribute_id}", job.level);

        if let Some(on_finished) = job.on_finished.take() {
            on_finished(attribute_id, result.view());
        }

        Ok(())
    }

    /// Retry dispatching for `attribute_id`.
    #[inline]
    pub fn continue_processing(&mut self, attribute_id: AttributeId) -> Option<ProcessRequest> {
        self.try_dispatch(attribute_id)
    }

    /// Status of every job still tracked for `attribute_id`.
    pub fn job_states(&self, attribute_id: AttributeId) -> Option<Vec<JobStatus>> {
        self.streams
            .get(&attribute_id)
            .map(|stream| stream.jobs.iter().map(RefinementJob::status).collect())
    }
}
