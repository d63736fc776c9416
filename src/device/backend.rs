//! The seam between [`AnalogDevice`](super::AnalogDevice) and a concrete board.
//!
//! A backend only knows how to claim the hardware, arm a scan and move raw
//! samples between the ring buffer and the board. Validation, gain selection,
//! conversion, status bookkeeping and threading live in the device and are
//! shared by every backend.

use super::capabilities::Capabilities;
use crate::error::{ErrorFlags, Result};
use crate::ring::{RingReader, RingWriter};
use crate::signal::{Direction, Reference, SignalList};
use std::time::Duration;

/// Per-channel part of an armed scan, in multiplex order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPlan {
    /// Hardware channel number
    pub channel: u32,
    /// Reference mode
    pub reference: Reference,
    /// Index into the range table
    pub range_index: usize,
}

/// Everything a backend needs to arm its hardware command.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    /// Stream direction
    pub direction: Direction,
    /// Channels in the order their samples are interleaved
    pub channels: Vec<ChannelPlan>,
    /// Scan rate in Hz
    pub rate: f64,
    /// Total scans of a finite run, `None` for continuous runs
    pub scans: Option<usize>,
    /// Scans moved per block transfer
    pub block_scans: usize,
    /// Ring capacity in scans
    pub ring_scans: usize,
}

impl ScanPlan {
    /// Channels per scan.
    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    /// Total raw samples of a finite run.
    pub fn total_samples(&self) -> Option<usize> {
        self.scans.map(|s| s * self.n_channels())
    }

    /// Raw samples per block transfer.
    pub fn block_samples(&self) -> usize {
        self.block_scans * self.n_channels()
    }

    /// Ring capacity in raw samples.
    pub fn ring_samples(&self) -> usize {
        self.ring_scans * self.n_channels()
    }

    /// Wall-clock duration of `scans` scans.
    pub fn duration_of(&self, scans: usize) -> Duration {
        if self.rate <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(scans as f64 / self.rate)
    }
}

/// The hardware side of the ring buffer handed to a backend at start.
#[derive(Debug)]
pub enum RingEnd {
    /// Output: the hardware drains the ring
    Output(RingReader),
    /// Input: the hardware fills the ring
    Input(RingWriter),
}

/// A concrete board in one direction.
pub trait Backend: Send {
    /// Driver type name, as used in configuration.
    fn driver_type(&self) -> &'static str;

    /// Stream direction, fixed for the life of the backend.
    fn direction(&self) -> Direction;

    /// Claims the hardware at `path` and reports its capabilities.
    fn open(&mut self, path: &str) -> Result<Capabilities>;

    /// Releases the hardware. Closing a closed backend does nothing.
    fn close(&mut self);

    /// Whether `open` succeeded and `close` has not been called since.
    fn is_open(&self) -> bool;

    /// Extra, board-specific validation of a signal list.
    ///
    /// Returns flags to set on every descriptor. Must not touch hardware state.
    fn check(&self, _sigs: &SignalList) -> ErrorFlags {
        ErrorFlags::empty()
    }

    /// Programs the hardware command for `plan` without starting it.
    fn arm(&mut self, plan: &ScanPlan) -> Result<()>;

    /// Starts the armed command and takes the hardware end of the ring.
    fn start(&mut self, ring: RingEnd) -> Result<()>;

    /// Lets the hardware side make progress.
    ///
    /// Output backends drain the ring into the hardware FIFO, input backends
    /// move converted samples into the ring. Waits at most `timeout` for
    /// progress and returns the number of raw samples moved; `Ok(0)` while the
    /// board is still running means nothing was ready yet.
    fn transfer(&mut self, timeout: Duration) -> Result<usize>;

    /// Whether the hardware scan is still active.
    fn is_running(&self) -> bool;

    /// Scans converted by the hardware since start.
    fn position(&self) -> u64;

    /// Cancels the running command. The ring end is kept until `reset`.
    fn stop(&mut self) -> Result<()>;

    /// Cancels any command and forgets the armed plan and the ring end.
    fn reset(&mut self) -> Result<()>;

    /// Index of the input device, among `inputs` (device paths), whose start
    /// trigger this board is wired to.
    fn sync_candidate(&self, _inputs: &[&str]) -> Option<usize> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_sizes() {
        let plan = ScanPlan {
            direction: Direction::Output,
            channels: vec![
                ChannelPlan {
                    channel: 0,
                    reference: Reference::Ground,
                    range_index: 0,
                },
                ChannelPlan {
                    channel: 2,
                    reference: Reference::Ground,
                    range_index: 1,
                },
            ],
            rate: 1000.0,
            scans: Some(500),
            block_scans: 100,
            ring_scans: 200,
        };
        assert_eq!(plan.total_samples(), Some(1000));
        assert_eq!(plan.block_samples(), 200);
        assert_eq!(plan.ring_samples(), 400);
        assert_eq!(plan.duration_of(500), Duration::from_millis(500));
    }
}
