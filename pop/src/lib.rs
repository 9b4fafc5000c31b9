//! A progressive geometry streaming and decoding crate.
//!
//! Progressive (POP) geometry ships quantized vertex attributes as successive refinement levels: level 0 carries the most significant
//! bits of every component, each further level the next slice of less significant bits. This crate provides features dedicated to:
//! - scheduling and rate-limiting fragment transfers, with priorities and optional strict delivery order ([`transfer`]),
//! - fetching fragments over HTTP or from a local directory ([`fetch`]),
//! - coordinating refinement jobs per attribute stream, decoding at most one level at a time per stream ([`refine`]),
//! - merging levels into growing result buffers on an isolated decode worker ([`decode`]).
//!
//! Both the [`TransferScheduler`](transfer::TransferScheduler) and the [`RefinementCoordinator`](refine::RefinementCoordinator) are
//! cheap handles on a background task exclusively owning their state, which makes their state machines single-threaded and their
//! methods non-blocking. The result buffer of an attribute is a plain owned value moved to the decode worker and back: it is never
//! reachable from both sides at once, so that no lock protects it.
//!
//! Here is the path followed by a single refinement level:
//!
//! ```text
//!     submit_job ─> TransferScheduler::fetch ─> [priority buckets] ─> admitted (≤ max_concurrent) ─> Fetcher
//!                                                                                                      │
//!     on_finished <─ on_job_finished <─ DecodeWorker <─ try_dispatch <─ on_data_arrived <─ delivered <─┘
//! ```
//!
//! As a **strong hypothesis**, there is neither timeout, retry nor cancellation: a level whose transfer fails is never decoded, and its
//! stream keeps showing the last level it reached.

pub mod decode;
pub mod fetch;
pub mod refine;
pub mod task;
pub mod transfer;
