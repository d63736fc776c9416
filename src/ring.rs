//! Single-producer/single-consumer ring buffer of raw sample codes.
//!
//! The ring sits between a device's pump thread and its hardware side. For
//! output the pump writes and the hardware reads, for input the hardware writes
//! and the pump reads. The halves are separate types, so each side can be moved
//! to a different thread without any locking.
//!
//! Writes never overwrite unread samples: a write that does not fit is reported
//! as [`RingLapped`], which the owning device turns into an overflow or underrun.

use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Raw sample code as moved by the hardware.
pub type RawSample = u16;

/// A write would have lapped the read position.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("ring buffer full: accepted {accepted} of {requested} samples")]
pub struct RingLapped {
    /// Samples offered
    pub requested: usize,
    /// Samples stored before the ring filled
    pub accepted: usize,
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    read: AtomicU64,
}

/// Creates a ring holding `capacity` raw samples and returns its two halves.
pub fn ring_buffer(capacity: usize) -> (RingWriter, RingReader) {
    let (producer, consumer) = HeapRb::<RawSample>::new(capacity.max(1)).split();
    let counters = Arc::new(Counters::default());
    (
        RingWriter {
            inner: producer,
            counters: Arc::clone(&counters),
        },
        RingReader {
            inner: consumer,
            counters,
        },
    )
}

/// Producer half.
pub struct RingWriter {
    inner: HeapProducer<RawSample>,
    counters: Arc<Counters>,
}

impl RingWriter {
    /// Writes all of `samples` or reports how many fitted.
    ///
    /// Samples that fitted are kept even on error.
    pub fn push(&mut self, samples: &[RawSample]) -> Result<(), RingLapped> {
        let accepted = self.push_partial(samples);
        if accepted < samples.len() {
            Err(RingLapped {
                requested: samples.len(),
                accepted,
            })
        } else {
            Ok(())
        }
    }

    /// Writes as many samples as fit and returns that count.
    pub fn push_partial(&mut self, samples: &[RawSample]) -> usize {
        let accepted = self.inner.push_slice(samples);
        self.counters
            .written
            .fetch_add(accepted as u64, Ordering::Release);
        accepted
    }

    /// Free space in samples.
    pub fn free(&self) -> usize {
        self.inner.free_len()
    }

    /// Samples waiting to be read.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Nothing waiting to be read.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Ring size in samples.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Total samples written since creation.
    pub fn total_written(&self) -> u64 {
        self.counters.written.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RingWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingWriter")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("written", &self.total_written())
            .finish()
    }
}

/// Consumer half.
pub struct RingReader {
    inner: HeapConsumer<RawSample>,
    counters: Arc<Counters>,
}

impl RingReader {
    /// Moves up to `out.len()` samples into `out` and returns the count.
    pub fn pop_into(&mut self, out: &mut [RawSample]) -> usize {
        let n = self.inner.pop_slice(out);
        self.counters.read.fetch_add(n as u64, Ordering::Release);
        n
    }

    /// Samples available for reading.
    pub fn available(&self) -> usize {
        self.inner.len()
    }

    /// Nothing waiting to be read.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Ring size in samples.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Total samples read since creation.
    pub fn total_read(&self) -> u64 {
        self.counters.read.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RingReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingReader")
            .field("available", &self.available())
            .field("capacity", &self.capacity())
            .field("read", &self.total_read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_exact() {
        let (mut writer, mut reader) = ring_buffer(64);
        let mut received = Vec::new();
        let mut out = [0u16; 24];

        for block in 0..20u16 {
            let data: Vec<u16> = (0..16).map(|i| block * 16 + i).collect();
            writer.push(&data).unwrap();
            let n = reader.pop_into(&mut out);
            received.extend_from_slice(&out[..n]);
        }
        while !reader.is_empty() {
            let n = reader.pop_into(&mut out);
            received.extend_from_slice(&out[..n]);
        }

        let expected: Vec<u16> = (0..320).collect();
        assert_eq!(received, expected);
        assert_eq!(writer.total_written(), 320);
        assert_eq!(reader.total_read(), 320);
    }

    #[test]
    fn test_lap_is_reported() {
        let (mut writer, mut reader) = ring_buffer(8);
        writer.push(&[1, 2, 3, 4, 5, 6]).unwrap();
        let err = writer.push(&[7, 8, 9, 10]).unwrap_err();
        assert_eq!(
            err,
            RingLapped {
                requested: 4,
                accepted: 2
            }
        );

        // Unread samples were not overwritten.
        let mut out = [0u16; 8];
        assert_eq!(reader.pop_into(&mut out), 8);
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_threaded_round_trip() {
        let (mut writer, mut reader) = ring_buffer(128);
        let total = 10_000u32;

        let producer = std::thread::spawn(move || {
            let mut next = 0u32;
            while next < total {
                let end = (next + 50).min(total);
                let block: Vec<u16> = (next..end).map(|v| (v % 65_536) as u16).collect();
                let written = writer.push_partial(&block);
                next += written as u32;
                if written == 0 {
                    std::thread::yield_now();
                }
            }
        });

        let mut received = Vec::with_capacity(total as usize);
        let mut out = [0u16; 64];
        while received.len() < total as usize {
            let n = reader.pop_into(&mut out);
            received.extend_from_slice(&out[..n]);
            if n == 0 {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();

        for (i, v) in received.iter().enumerate() {
            assert_eq!(*v, (i % 65_536) as u16);
        }
    }
}
