//! Simulated DAQ boards.
//!
//! [`SimOutput`] and [`SimInput`] implement [`Backend`](crate::device::Backend)
//! without hardware. They run in one of two modes:
//!
//! - **Instant**: the board moves whatever it is offered, immediately. Runs are
//!   deterministic and finish as fast as the pump allows; used by unit tests.
//! - **Realistic**: the board clock runs in wall time at the scan rate. Output
//!   plays from a FIFO of `fifo_size` samples that empties when the host does
//!   not refill it in time; input produces scans into the ring and overflows
//!   when the host does not drain it.
//!
//! [`SimFaults`] injects host stalls and transport failures.

mod faults;
mod input;
mod output;

pub use faults::{FaultKind, SimFaults};
pub use input::SimInput;
pub use output::SimOutput;

use crate::device::{Capabilities, Range};
use crate::signal::Reference;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Timing behavior of a simulated board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimMode {
    /// No delays, deterministic
    #[default]
    Instant,
    /// Board clock tied to wall time
    Realistic,
}

/// Signal produced by a simulated input board.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SimWaveform {
    /// Raw code equal to the scan number, wrapping at the code range
    #[default]
    Ramp,
    /// Sine at `frequency` Hz with `amplitude` as a fraction of the range
    Sine {
        /// Frequency in Hz
        frequency: f64,
        /// Fraction of the range, `0.0..=1.0`
        amplitude: f64,
    },
    /// Uniform noise over the whole range
    Noise,
}

/// Configuration of a simulated board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Timing behavior
    pub mode: SimMode,
    /// Number of channels
    pub channels: u32,
    /// Converter resolution
    pub bits: u32,
    /// Maximum scan rate in Hz
    pub max_rate: f64,
    /// Minimum scan rate in Hz
    pub min_rate: f64,
    /// Bipolar range amplitudes in volts, index order
    pub ranges: Vec<f64>,
    /// Supported reference modes
    pub references: Vec<Reference>,
    /// Hardware FIFO size in samples
    pub fifo_size: usize,
    /// Signal of input boards
    pub waveform: SimWaveform,
    /// Seed for the noise waveform
    pub seed: Option<u64>,
    /// Injected faults
    pub faults: SimFaults,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            mode: SimMode::Instant,
            channels: 4,
            bits: 16,
            max_rate: 100_000.0,
            min_rate: 1.0,
            ranges: vec![10.0, 5.0, 1.0],
            references: vec![Reference::Ground, Reference::Common, Reference::Differential],
            fifo_size: 2048,
            waveform: SimWaveform::Ramp,
            seed: None,
            faults: SimFaults::default(),
        }
    }
}

impl SimConfig {
    /// Timing behavior.
    pub fn with_mode(mut self, mode: SimMode) -> Self {
        self.mode = mode;
        self
    }

    /// Number of channels.
    pub fn with_channels(mut self, channels: u32) -> Self {
        self.channels = channels;
        self
    }

    /// Maximum scan rate in Hz.
    pub fn with_max_rate(mut self, max_rate: f64) -> Self {
        self.max_rate = max_rate;
        self
    }

    /// FIFO size in samples.
    pub fn with_fifo_size(mut self, samples: usize) -> Self {
        self.fifo_size = samples;
        self
    }

    /// Input signal.
    pub fn with_waveform(mut self, waveform: SimWaveform) -> Self {
        self.waveform = waveform;
        self
    }

    /// Seed for the noise waveform.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Injected faults.
    pub fn with_faults(mut self, faults: SimFaults) -> Self {
        self.faults = faults;
        self
    }

    /// Capabilities reported by [`open`](crate::device::Backend::open).
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            channels: self.channels,
            bits: self.bits,
            max_rate: self.max_rate,
            min_rate: self.min_rate,
            ranges: self
                .ranges
                .iter()
                .enumerate()
                .map(|(i, &amplitude)| Range::bipolar(i, amplitude))
                .collect(),
            references: self.references.clone(),
            fifo_size: self.fifo_size,
        }
    }

    fn rng(&self) -> ChaCha8Rng {
        match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        }
    }
}

/// Wall-time board clock.
#[derive(Debug, Default, Clone, Copy)]
struct SimClock {
    started: Option<Instant>,
    stopped: Option<Instant>,
}

impl SimClock {
    fn start(&mut self) {
        self.started = Some(Instant::now());
        self.stopped = None;
    }

    fn stop(&mut self) {
        if self.started.is_some() && self.stopped.is_none() {
            self.stopped = Some(Instant::now());
        }
    }

    fn is_ticking(&self) -> bool {
        self.started.is_some() && self.stopped.is_none()
    }

    fn elapsed(&self) -> Duration {
        match (self.started, self.stopped) {
            (Some(start), Some(stop)) => stop.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Scans converted so far at `rate`, capped at `total`.
    fn scans_due(&self, rate: f64, total: Option<usize>) -> u64 {
        let due = (self.elapsed().as_secs_f64() * rate).floor() as u64;
        match total {
            Some(total) => due.min(total as u64),
            None => due,
        }
    }
}

/// Whether two device paths end in the same character.
fn paths_pair(own: &str, other: &str) -> bool {
    match (own.chars().last(), other.chars().last()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn candidate(own: &str, inputs: &[&str]) -> Option<usize> {
    inputs.iter().position(|path| paths_pair(own, path))
}
