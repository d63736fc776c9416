//! Sample stores filled by input devices.
//!
//! [`TraceHandle`] is the per-channel, continuously appended record of one input
//! signal. The input pump appends to it while the caller reads it concurrently.
//! [`SampleBatch`] is the unit delivered to optional channel subscribers.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Default)]
struct TraceInner {
    samples: RwLock<Vec<f32>>,
    signal_index: AtomicI64,
}

/// Shared, growable sample record of one input channel.
///
/// Cloning the handle shares the underlying storage.
#[derive(Debug, Clone)]
pub struct TraceHandle {
    inner: Arc<TraceInner>,
}

impl Default for TraceHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceHandle {
    /// Empty trace without a signal start index.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TraceInner {
                samples: RwLock::new(Vec::new()),
                signal_index: AtomicI64::new(-1),
            }),
        }
    }

    /// Number of samples recorded so far.
    pub fn len(&self) -> usize {
        self.inner.samples.read().len()
    }

    /// No sample recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all samples recorded so far.
    pub fn samples(&self) -> Vec<f32> {
        self.inner.samples.read().clone()
    }

    /// Runs `f` on the recorded samples without copying them.
    pub fn with_samples<R>(&self, f: impl FnOnce(&[f32]) -> R) -> R {
        f(&self.inner.samples.read())
    }

    /// Sample at `index`, if recorded.
    pub fn get(&self, index: usize) -> Option<f32> {
        self.inner.samples.read().get(index).copied()
    }

    /// Index of the sample at which the last output started, `None` if no output
    /// was started against this trace.
    pub fn signal_index(&self) -> Option<u64> {
        u64::try_from(self.inner.signal_index.load(Ordering::Acquire)).ok()
    }

    /// Whether two handles share the same storage.
    pub fn ptr_eq(&self, other: &TraceHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn extend(&self, samples: &[f32]) {
        self.inner.samples.write().extend_from_slice(samples);
    }

    pub(crate) fn set_signal_index(&self, index: u64) {
        let index = i64::try_from(index).unwrap_or(i64::MAX);
        self.inner.signal_index.store(index, Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        self.inner.samples.write().clear();
        self.inner.signal_index.store(-1, Ordering::Release);
    }
}

/// A block of demultiplexed input samples.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    /// Interleaved samples in physical units, ordered by channel
    pub data: Vec<f32>,
    /// Channel numbers in interleave order
    pub channels: Vec<u32>,
    /// Index of the first scan in this batch
    pub first_scan: u64,
    /// Sequence number of this batch
    pub sequence: u64,
    /// Host time at which the batch was read
    pub timestamp: Instant,
}

impl SampleBatch {
    /// Number of complete scans in this batch.
    pub fn n_scans(&self) -> usize {
        if self.channels.is_empty() {
            0
        } else {
            self.data.len() / self.channels.len()
        }
    }

    /// Samples of one channel, by position in `channels`.
    pub fn channel_data(&self, position: usize) -> Vec<f32> {
        let n = self.channels.len();
        if position >= n {
            return Vec::new();
        }
        self.data.iter().skip(position).step_by(n).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_handle_shares_storage() {
        let trace = TraceHandle::new();
        let reader = trace.clone();
        trace.extend(&[1.0, 2.0, 3.0]);

        assert_eq!(reader.len(), 3);
        assert_eq!(reader.get(1), Some(2.0));
        assert!(reader.ptr_eq(&trace));
        assert_eq!(reader.with_samples(|s| s.iter().sum::<f32>()), 6.0);
    }

    #[test]
    fn test_signal_index_defaults_to_none() {
        let trace = TraceHandle::new();
        assert_eq!(trace.signal_index(), None);
        trace.set_signal_index(42);
        assert_eq!(trace.signal_index(), Some(42));
        trace.clear();
        assert_eq!(trace.signal_index(), None);
        assert!(trace.is_empty());
    }

    #[test]
    fn test_batch_channel_data() {
        let batch = SampleBatch {
            data: vec![0.0, 10.0, 1.0, 11.0, 2.0, 12.0],
            channels: vec![0, 3],
            first_scan: 0,
            sequence: 0,
            timestamp: Instant::now(),
        };
        assert_eq!(batch.n_scans(), 3);
        assert_eq!(batch.channel_data(0), vec![0.0, 1.0, 2.0]);
        assert_eq!(batch.channel_data(1), vec![10.0, 11.0, 12.0]);
        assert!(batch.channel_data(2).is_empty());
    }
}
