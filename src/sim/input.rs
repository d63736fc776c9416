//! Simulated analog input board.

use super::faults::FaultState;
use super::{candidate, SimClock, SimConfig, SimMode, SimWaveform};
use crate::device::{Backend, Capabilities, RingEnd, ScanPlan};
use crate::error::{DeviceError, Result};
use crate::ring::{RawSample, RingWriter};
use crate::signal::Direction;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::f64::consts::TAU;
use std::time::Duration;
use tracing::{debug, warn};

/// Input board producing a [`SimWaveform`] on every channel.
///
/// Finite runs stop after exactly the planned number of scans.
#[derive(Debug)]
pub struct SimInput {
    config: SimConfig,
    caps: Capabilities,
    path: String,
    open: bool,
    plan: Option<ScanPlan>,
    ring: Option<RingWriter>,
    clock: SimClock,
    /// Scans pushed into the ring
    produced: u64,
    faults: FaultState,
    rng: ChaCha8Rng,
    scratch: Vec<RawSample>,
}

impl SimInput {
    /// Closed input board built from `config`.
    pub fn new(config: SimConfig) -> Self {
        Self {
            caps: config.capabilities(),
            rng: config.rng(),
            config,
            path: String::new(),
            open: false,
            plan: None,
            ring: None,
            clock: SimClock::default(),
            produced: 0,
            faults: FaultState::default(),
            scratch: Vec::new(),
        }
    }

    /// Board configuration.
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Scans the board has converted so far.
    fn converted(&self) -> u64 {
        let Some(plan) = self.plan.as_ref() else {
            return 0;
        };
        match self.config.mode {
            SimMode::Instant => self.produced,
            SimMode::Realistic => self.clock.scans_due(plan.rate, plan.scans),
        }
    }

    fn remaining(&self) -> u64 {
        match self.plan.as_ref().and_then(|p| p.scans) {
            Some(total) => (total as u64).saturating_sub(self.produced),
            None => u64::MAX,
        }
    }

    fn sample(&mut self, plan: &ScanPlan, channel: usize, scan: u64) -> RawSample {
        let max_data = self.caps.max_data();
        let range = plan
            .channels
            .get(channel)
            .and_then(|c| self.caps.range(c.range_index))
            .copied();
        match (self.config.waveform, range) {
            (SimWaveform::Ramp, _) | (_, None) => (scan % (u64::from(max_data) + 1)) as RawSample,
            (SimWaveform::Sine { frequency, amplitude }, Some(range)) => {
                let t = scan as f64 / plan.rate;
                let volts = amplitude * range.max * (TAU * frequency * t).sin();
                self.caps.volts_to_raw(&range, volts)
            }
            (SimWaveform::Noise, Some(_)) => self.rng.gen_range(0..=max_data),
        }
    }

    fn produce(&mut self, scans: u64) -> Result<usize> {
        let Some(plan) = self.plan.clone() else {
            return Ok(0);
        };
        let n_channels = plan.n_channels();
        self.scratch.clear();
        for scan in self.produced..self.produced + scans {
            for channel in 0..n_channels {
                let value = self.sample(&plan, channel, scan);
                self.scratch.push(value);
            }
        }

        let Some(ring) = self.ring.as_mut() else {
            return Ok(0);
        };
        if let Err(lapped) = ring.push(&self.scratch) {
            warn!(path = %self.path, error = %lapped, "Simulated input ring full");
            self.clock.stop();
            return Err(DeviceError::Overflow {
                device: self.path.clone(),
            });
        }
        self.produced += scans;
        Ok(self.scratch.len())
    }

    fn not_open(&self) -> DeviceError {
        DeviceError::NotOpen {
            device: self.path.clone(),
        }
    }
}

impl Backend for SimInput {
    fn driver_type(&self) -> &'static str {
        "sim_input"
    }

    fn direction(&self) -> Direction {
        Direction::Input
    }

    fn open(&mut self, path: &str) -> Result<Capabilities> {
        if self.config.faults.fail_open {
            return Err(DeviceError::NoDevice {
                device: path.to_string(),
                message: "simulated board not present".to_string(),
            });
        }
        self.path = path.to_string();
        self.open = true;
        debug!(path, mode = ?self.config.mode, waveform = ?self.config.waveform, "Simulated input opened");
        Ok(self.caps.clone())
    }

    fn close(&mut self) {
        self.open = false;
        self.plan = None;
        self.ring = None;
        self.clock = SimClock::default();
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn arm(&mut self, plan: &ScanPlan) -> Result<()> {
        if !self.open {
            return Err(self.not_open());
        }
        if plan.direction != Direction::Input {
            return Err(DeviceError::NotSupported {
                device: self.path.clone(),
                message: "output plan on an input board".to_string(),
            });
        }
        self.plan = Some(plan.clone());
        self.ring = None;
        self.clock = SimClock::default();
        self.produced = 0;
        self.faults.reset();
        Ok(())
    }

    fn start(&mut self, ring: RingEnd) -> Result<()> {
        if self.plan.is_none() {
            return Err(DeviceError::InvalidConfiguration {
                device: self.path.clone(),
                failed: 0,
                message: "start before arm".to_string(),
            });
        }
        let RingEnd::Input(writer) = ring else {
            return Err(DeviceError::NotSupported {
                device: self.path.clone(),
                message: "input board needs the writing ring end".to_string(),
            });
        };
        self.ring = Some(writer);
        self.produced = 0;
        self.faults.reset();
        self.clock.start();
        Ok(())
    }

    fn transfer(&mut self, timeout: Duration) -> Result<usize> {
        if !self.clock.is_ticking() {
            return Ok(0);
        }
        self.faults.before_transfer(&self.config.faults, &self.path)?;

        let n_channels = self.plan.as_ref().map_or(1, ScanPlan::n_channels).max(1);
        let scans = match self.config.mode {
            SimMode::Instant => {
                let free = self.ring.as_ref().map_or(0, |r| r.free()) / n_channels;
                (free as u64).min(self.remaining())
            }
            SimMode::Realistic => {
                let mut due = self.converted().saturating_sub(self.produced);
                if due == 0 && !timeout.is_zero() && self.remaining() > 0 {
                    let rate = self.plan.as_ref().map_or(1.0, |p| p.rate);
                    let next_scan = Duration::from_secs_f64(1.0 / rate.max(f64::MIN_POSITIVE));
                    std::thread::sleep(next_scan.min(timeout));
                    due = self.converted().saturating_sub(self.produced);
                }
                due
            }
        };
        if scans == 0 {
            return Ok(0);
        }
        self.produce(scans)
    }

    fn is_running(&self) -> bool {
        self.clock.is_ticking() && self.remaining() > 0
    }

    fn position(&self) -> u64 {
        self.converted()
    }

    fn stop(&mut self) -> Result<()> {
        self.clock.stop();
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.plan = None;
        self.ring = None;
        self.clock = SimClock::default();
        self.produced = 0;
        self.faults.reset();
        Ok(())
    }

    fn sync_candidate(&self, inputs: &[&str]) -> Option<usize> {
        candidate(&self.path, inputs)
    }
}
