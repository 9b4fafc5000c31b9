use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::Bytes;

use super::*;

/// A completion callback registered on a transfer.
pub type Listener = Box<dyn FnOnce(Bytes) + Send>;

/// Transfer request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransferState {
    /// Waiting for a free concurrency slot.
    Unsent,
    /// Admitted, the underlying fetch is running.
    InFlight,
    /// Completed but held back until every higher priority request has been delivered.
    Done,
    /// Completed with an error, listeners are dropped without being invoked.
    ///
    /// Failed requests leave their bucket at once: this state is only reported for a URL whose last transfer failed, until it is
    /// requested again.
    Failed,
}

impl TransferState {
    /// Whether the request still has network work ahead of it.
    #[inline]
    pub fn is_outstanding(self) -> bool {
        matches!(self, TransferState::Unsent | TransferState::InFlight)
    }
}

/// One fetch of a unique URL, shared by every caller that requested it before it was delivered.
struct TransferRequest {
    url: String,
    state: TransferState,
    listeners: Vec<Listener>,
    payload: Option<Bytes>,
}

impl std::fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRequest")
            .field("url", &self.url)
            .field("state", &self.state)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

/// A completed transfer ready to be handed to its listeners.
pub struct Delivery {
    pub url: String,
    pub priority: u32,
    payload: Bytes,
    listeners: Vec<Listener>,
}

impl Delivery {
    /// Invoke every listener, in registration order, with the same shared buffer.
    pub fn deliver(self) {
        tracing::trace!("Delivering `{}` to {} listener(s)", self.url, self.listeners.len());

        for listener in self.listeners {
            listener(self.payload.clone());
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("url", &self.url)
            .field("priority", &self.priority)
            .field("len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Admission-controlled priority buckets of transfer requests.
///
/// This is the synchronous bookkeeping behind [`TransferScheduler`]: it decides which URL to issue next and which completed transfers
/// may be delivered, but never performs any I/O itself. Lower numeric priorities are serviced and, in strict order mode, delivered first.
#[derive(Debug)]
pub struct TransferQueue {
    /// Requests by priority, in request order within a bucket.
    buckets: BTreeMap<u32, Vec<TransferRequest>>,
    /// The bucket of every tracked URL, so that duplicate requests share a single transfer.
    index: HashMap<String, u32>,
    /// URLs whose last transfer failed.
    failed: HashSet<String>,
    max_concurrent: usize,
    active: usize,
    strict_order: bool,
}

impl TransferQueue {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            buckets: BTreeMap::new(),
            index: HashMap::new(),
            failed: HashSet::new(),
            max_concurrent: config.max_concurrent.get().into(),
            active: 0,
            strict_order: config.strict_order,
        }
    }

    /// Register interest in `url`.
    ///
    /// Returns `true` when a new request has been created, or `false` when `listener` joined a request already tracked for `url`.
    /// Admission is left to [`TransferQueue::try_admit_next()`].
    pub fn request(&mut self, url: String, priority: u32, listener: Listener) -> bool {
        if let Some(&bucket) = self.index.get(&url) {
            if let Some(request) = self.find_mut(bucket, &url) {
                tracing::trace!("Joining pending transfer of `{url}` ({:?})", request.state);

                request.listeners.push(listener);
                return false;
            }
        }

        tracing::trace!("Queueing transfer of `{url}` at priority {priority}");

        self.failed.remove(&url);

        self.index.insert(url.clone(), priority);
        self.buckets.entry(priority).or_default().push(TransferRequest {
            url,
            state: TransferState::Unsent,
            listeners: vec![listener],
            payload: None,
        });

        true
    }

    /// Admit the first unsent request, scanning buckets from the highest priority, if a concurrency slot is free.
    ///
    /// Returns the URL whose fetch must be issued.
    pub fn try_admit_next(&mut self) -> Option<String> {
        if self.active >= self.max_concurrent {
            return None;
        }

        let request = self
            .buckets
            .values_mut()
            .flat_map(|bucket| bucket.iter_mut())
            .find(|request| request.state == TransferState::Unsent)?;

        request.state = TransferState::InFlight;
        self.active += 1;

        debug_assert!(self.active <= self.max_concurrent);

        Some(request.url.clone())
    }

    /// Admit as many requests as the concurrency budget allows.
    pub fn admit_all(&mut self) -> Vec<String> {
        std::iter::from_fn(|| self.try_admit_next()).collect()
    }

    /// Record the network completion of `url`.
    ///
    /// Returns the deliveries that became possible, in delivery order. A failed transfer is dropped from the bookkeeping, only its URL
    /// is remembered as failed, and its listeners are never invoked.
    pub fn complete(&mut self, url: &str, result: Result<Bytes, crate::fetch::Error>) -> Vec<Delivery> {
        let Some(&priority) = self.index.get(url) else {
            tracing::warn!("Dropping completion of untracked transfer `{url}`");
            return vec![];
        };

        let in_flight = self
            .find_mut(priority, url)
            .is_some_and(|request| request.state == TransferState::InFlight);

        if !in_flight {
            tracing::warn!("Dropping completion of transfer `{url}` which is not in flight");
            return vec![];
        }

        self.active -= 1;

        let mut deliveries = vec![];

        match result {
            Ok(payload) => {
                if let Some(request) = self.find_mut(priority, url) {
                    request.state = TransferState::Done;
                    request.payload = Some(payload);
                }

                if !self.strict_order || !self.is_outstanding_below(priority) {
                    deliveries.extend(self.take(priority, url));
                } else {
                    tracing::debug!("Stalling delivery of `{url}` behind higher priority transfers");
                }
            }
            Err(err) => {
                tracing::warn!("Transfer of `{url}` failed: {err}");

                if let Some(request) = self.remove(priority, url) {
                    debug_assert_eq!(request.state, TransferState::InFlight);
                    self.failed.insert(request.url);
                }
            }
        }

        deliveries.extend(self.flush_stalled());
        deliveries
    }

    /// Release stalled requests whose higher priority predecessors have all been delivered.
    ///
    /// Buckets are scanned from the highest priority: the completed requests of each bucket are released until a bucket still
    /// holding unsent or in-flight work is met.
    pub fn flush_stalled(&mut self) -> Vec<Delivery> {
        let mut deliveries = vec![];

        let priorities: Vec<u32> = self.buckets.keys().copied().collect();

        for priority in priorities {
            let Some(bucket) = self.buckets.get_mut(&priority) else {
                continue;
            };

            let outstanding = bucket.iter().any(|request| request.state.is_outstanding());

            let (done, rest): (Vec<_>, Vec<_>) = std::mem::take(bucket)
                .into_iter()
                .partition(|request| request.state == TransferState::Done);
            *bucket = rest;

            for request in done {
                self.index.remove(&request.url);
                deliveries.push(Self::delivery(priority, request));
            }

            if self.buckets.get(&priority).is_some_and(Vec::is_empty) {
                self.buckets.remove(&priority);
            }

            if outstanding && self.strict_order {
                break;
            }
        }

        deliveries
    }

    /// Switch strict delivery order on or off, returning the deliveries released by switching it off.
    pub fn set_strict_order(&mut self, strict_order: bool) -> Vec<Delivery> {
        self.strict_order = strict_order;
        self.flush_stalled()
    }

    /// Current state of the request tracked for `url`, or [`TransferState::Failed`] if its last transfer failed.
    pub fn state(&self, url: &str) -> Option<TransferState> {
        if self.failed.contains(url) {
            return Some(TransferState::Failed);
        }

        let priority = self.index.get(url)?;
        self.buckets
            .get(priority)?
            .iter()
            .find(|request| request.url == url)
            .map(|request| request.state)
    }

    pub fn stats(&self) -> TransferStats {
        let mut stats = TransferStats {
            active: self.active,
            max_concurrent: self.max_concurrent,
            failed: self.failed.len(),
            ..Default::default()
        };

        for request in self.buckets.values().flatten() {
            match request.state {
                TransferState::Unsent => stats.unsent += 1,
                TransferState::InFlight => stats.in_flight += 1,
                TransferState::Done => stats.stalled += 1,
                TransferState::Failed => stats.failed += 1,
            }
        }

        stats
    }

    fn is_outstanding_below(&self, priority: u32) -> bool {
        self.buckets
            .range(..priority)
            .flat_map(|(_, bucket)| bucket)
            .any(|request| request.state.is_outstanding())
    }

    fn find_mut(&mut self, priority: u32, url: &str) -> Option<&mut TransferRequest> {
        self.buckets.get_mut(&priority)?.iter_mut().find(|request| request.url == url)
    }

    fn remove(&mut self, priority: u32, url: &str) -> Option<TransferRequest> {
        let bucket = self.buckets.get_mut(&priority)?;
        let position = bucket.iter().position(|request| request.url == url)?;
        let request = bucket.remove(position);

        if bucket.is_empty() {
            self.buckets.remove(&priority);
        }

        self.index.remove(url);

        Some(request)
    }

    fn take(&mut self, priority: u32, url: &str) -> Option<Delivery> {
        self.remove(priority, url).map(|request| Self::delivery(priority, request))
    }

    fn delivery(priority: u32, request: TransferRequest) -> Delivery {
        Delivery {
            url: request.url,
            priority,
            payload: request.payload.unwrap_or_default(),
            listeners: request.listeners,
        }
    }
}
