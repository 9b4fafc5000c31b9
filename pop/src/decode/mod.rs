//! This module provides the isolated decode worker.
//!
//! The worker owns nothing between two messages: every `Process` request moves an input buffer and an attribute's result buffer in,
//! and exactly one `Finished` response moves the merged result buffer back out.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::refine::{AttributeId, Layout, ResultBuffer};

pub mod codec;

/// Everything needed to merge one refinement level.
#[derive(Debug)]
pub struct ProcessRequest {
    pub attribute_id: AttributeId,
    pub level: u32,
    pub layout: Layout,
    pub input: Bytes,
    pub result: ResultBuffer,
}

/// Messages accepted by a decode worker.
#[derive(Debug)]
pub enum WorkerRequest {
    Process(ProcessRequest),
}

/// Messages emitted by a decode worker.
#[derive(Debug)]
pub enum WorkerResponse {
    /// The result buffer of `attribute_id`, with the requested level merged in.
    Finished { attribute_id: AttributeId, result: ResultBuffer },
    /// Informational diagnostic.
    Log { text: String },
}

/// How decoding is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerMode {
    /// On a dedicated OS thread.
    #[default]
    Thread,
    /// On the caller's task.
    Inline,
}

/// Body of a decode thread.
pub(crate) type ThreadBody = Box<dyn FnOnce() + Send + 'static>;

/// Start `body` on a named OS thread.
pub(crate) fn spawn_thread(name: String, body: ThreadBody) -> io::Result<()> {
    std::thread::Builder::new().name(name).spawn(body).map(drop)
}

/// Handle on a decode worker.
///
/// Responses are posted to the channel given at spawn time, whatever the mode: callers observe the same asynchronous protocol when
/// decoding runs inline.
#[derive(Debug)]
pub struct DecodeWorker {
    requests: Option<mpsc::UnboundedSender<WorkerRequest>>,
    responses: mpsc::UnboundedSender<WorkerResponse>,
}

impl DecodeWorker {
    /// Spawn a worker in `mode`.
    ///
    /// When no thread can be spawned, the worker degrades to inline decoding and `on_fallback` is called with the reason.
    pub fn spawn(mode: WorkerMode, responses: mpsc::UnboundedSender<WorkerResponse>, on_fallback: impl FnOnce(&str)) -> Self {
        Self::spawn_with(mode, responses, on_fallback, spawn_thread)
    }

    pub(crate) fn spawn_with(
        mode: WorkerMode,
        responses: mpsc::UnboundedSender<WorkerResponse>,
        on_fallback: impl FnOnce(&str),
        spawner: impl FnOnce(String, ThreadBody) -> io::Result<()>,
    ) -> Self {
        if mode == WorkerMode::Inline {
            return Self::inline(responses);
        }

        static WORKER_ID: AtomicUsize = AtomicUsize::new(0);
        let id = WORKER_ID.fetch_add(1, Ordering::Relaxed);

        let (sender, receiver) = mpsc::unbounded_channel();
        let thread_responses = responses.clone();

        let spawned = spawner(format!("pop-decode-{id}"), Box::new(move || run(id, receiver, thread_responses)));

        match spawned {
            // the thread exits on its own once every request sender is gone
            Ok(()) => Self {
                requests: Some(sender),
                responses,
            },
            Err(err) => {
                let reason = format!("cannot spawn decode thread, decoding inline: {err}");
                tracing::warn!("{reason}");
                on_fallback(&reason);

                Self::inline(responses)
            }
        }
    }

    /// A worker decoding on the caller's task.
    pub fn inline(responses: mpsc::UnboundedSender<WorkerResponse>) -> Self {
        Self { requests: None, responses }
    }

    #[inline]
    pub fn mode(&self) -> WorkerMode {
        match self.requests {
            Some(_) => WorkerMode::Thread,
            None => WorkerMode::Inline,
        }
    }

    /// Hand `request` over to the worker.
    pub fn post(&self, request: WorkerRequest) {
        let request = match self.requests {
            Some(ref requests) => match requests.send(request) {
                Ok(()) => return,
                Err(mpsc::error::SendError(request)) => {
                    tracing::warn!("Decode thread is gone, decoding inline.");
                    request
                }
            },
            None => request,
        };

        for response in handle(request) {
            let _ = self.responses.send(response);
        }
    }
}

fn run(id: usize, mut requests: mpsc::UnboundedReceiver<WorkerRequest>, responses: mpsc::UnboundedSender<WorkerResponse>) {
    tracing::debug!("Decode worker {id} started.");

    while let Some(request) = requests.blocking_recv() {
        for response in handle(request) {
            if responses.send(response).is_err() {
                tracing::debug!("Decode worker {id} has no listener left.");
                return;
            }
        }
    }

    tracing::debug!("Decode worker {id} stopped.");
}

/// Process one request, always ending with the `Finished` response handing the result buffer back.
fn handle(request: WorkerRequest) -> Vec<WorkerResponse> {
    match request {
        WorkerRequest::Process(ProcessRequest {
            attribute_id,
            level,
            layout,
            input,
            mut result,
        }) => {
            let codec = codec::Codec::select(&layout);

            let log = match codec::decode(level, &layout, &input, &mut result) {
                Ok(vertices) => format!("attribute {attribute_id}: merged level {level} into {vertices} vertices ({codec:?})"),
                Err(err) => format!("attribute {attribute_id}: level {level} skipped: {err}"),
            };

            vec![WorkerResponse::Log { text: log }, WorkerResponse::Finished { attribute_id, result }]
        }
    }
}
