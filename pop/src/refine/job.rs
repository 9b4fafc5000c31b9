use bytes::Bytes;

use super::*;

/// Bit layout of one refinement level, describing how its bits merge into the result buffer.
///
/// Entry `i` of every list describes one attribute packed in the level's vertex records:
/// - `component_counts[i]` components of `bits_per_level[i]` bits each,
/// - starting `read_offsets[i]` bits into each input record (records are read MSB-first),
/// - written `write_offsets[i]` elements into each `stride`-element output vertex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub stride: usize,
    pub component_counts: Vec<usize>,
    pub bits_per_level: Vec<u32>,
    pub read_offsets: Vec<usize>,
    pub write_offsets: Vec<usize>,
}

impl Layout {
    /// A layout made of a single attribute.
    pub fn single(stride: usize, components: usize, bits_per_level: u32) -> Self {
        Self {
            stride,
            component_counts: vec![components],
            bits_per_level: vec![bits_per_level],
            read_offsets: vec![0],
            write_offsets: vec![0],
        }
    }

    /// Number of attributes packed in a record.
    #[inline]
    pub fn attributes(&self) -> usize {
        self.component_counts.len()
    }

    /// Size in bits of one input vertex record, saturating at `usize::MAX`.
    pub fn record_bits(&self) -> usize {
        self.checked_record_bits().unwrap_or(usize::MAX)
    }

    fn checked_record_bits(&self) -> Option<usize> {
        self.component_counts
            .iter()
            .zip(&self.bits_per_level)
            .try_fold(0usize, |total, (&count, &bits)| total.checked_add(count.checked_mul(bits as usize)?))
    }

    pub fn validate(&self) -> Result<(), Error> {
        let n = self.attributes();

        if [self.bits_per_level.len(), self.read_offsets.len(), self.write_offsets.len()]
            .iter()
            .any(|&len| len != n)
        {
            return Err(Error::InvalidLayout("attribute lists have different lengths"));
        }
        if self.stride == 0 {
            return Err(Error::InvalidLayout("zero stride"));
        }
        if self.bits_per_level.iter().any(|&bits| bits > 32) {
            return Err(Error::InvalidLayout("more than 32 bits per component"));
        }

        let record_bits = self
            .checked_record_bits()
            .ok_or(Error::InvalidLayout("vertex record size overflows"))?;

        for i in 0..n {
            let (count, bits) = (self.component_counts[i], self.bits_per_level[i] as usize);

            let read_end = count
                .checked_mul(bits)
                .and_then(|len| len.checked_add(self.read_offsets[i]))
                .ok_or(Error::InvalidLayout("read range overflows"))?;
            if bits > 0 && read_end > record_bits {
                return Err(Error::InvalidLayout("read range exceeds the vertex record"));
            }

            let write_end = self.write_offsets[i]
                .checked_add(count)
                .ok_or(Error::InvalidLayout("write range overflows"))?;
            if write_end > self.stride {
                return Err(Error::InvalidLayout("write range exceeds the stride"));
            }
        }

        Ok(())
    }
}

/// Refinement job state.
///
/// States only ever move forward, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobState {
    WaitingForData,
    DataAvailable,
    Processing,
    Finished,
}

/// Callback invoked once a job's level has been merged, with a view over the whole result buffer.
pub type OnFinished = Box<dyn FnOnce(AttributeId, TypedView<'_>) + Send>;

/// One decode step of an attribute stream.
pub struct RefinementJob {
    pub(crate) level: u32,
    pub(crate) url: String,
    pub(crate) layout: Layout,
    pub(crate) state: JobState,
    pub(crate) input: Option<Bytes>,
    pub(crate) on_finished: Option<OnFinished>,
}

impl RefinementJob {
    pub fn new(url: impl Into<String>, level: u32, layout: Layout, on_finished: impl FnOnce(AttributeId, TypedView<'_>) + Send + 'static) -> Self {
        Self {
            level,
            url: url.into(),
            layout,
            state: JobState::WaitingForData,
            input: None,
            on_finished: Some(Box::new(on_finished)),
        }
    }

    #[inline]
    pub fn level(&self) -> u32 {
        self.level
    }

    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[inline]
    pub fn state(&self) -> JobState {
        self.state
    }

    pub(crate) fn advance(&mut self, next: JobState) {
        debug_assert!(
            next as u8 == self.state as u8 + 1,
            "invalid job transition {:?} -> {next:?}",
            self.state
        );

        tracing::trace!("Job `{}` (level {}): {:?} -> {next:?}", self.url, self.level, self.state);

        self.state = next;
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            level: self.level,
            url: self.url.clone(),
            state: self.state,
        }
    }
}

impl std::fmt::Debug for RefinementJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefinementJob")
            .field("level", &self.level)
            .field("url", &self.url)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Observable status of a tracked job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub level: u32,
    pub url: String,
    pub state: JobState,
}
