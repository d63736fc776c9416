//! Simulated analog output board.

use super::faults::FaultState;
use super::{candidate, SimClock, SimConfig, SimMode};
use crate::device::{Backend, Capabilities, RingEnd, ScanPlan};
use crate::error::{DeviceError, Result};
use crate::ring::{RawSample, RingReader};
use crate::signal::Direction;
use std::time::Duration;
use tracing::{debug, warn};

/// Output board playing samples from a FIFO.
///
/// In [`SimMode::Realistic`] the FIFO holds `fifo_size` samples and drains at
/// the scan rate; a run whose FIFO empties before the end of data fails with
/// [`DeviceError::Underrun`].
#[derive(Debug)]
pub struct SimOutput {
    config: SimConfig,
    path: String,
    open: bool,
    plan: Option<ScanPlan>,
    ring: Option<RingReader>,
    clock: SimClock,
    /// Samples moved from the ring into the FIFO
    delivered: u64,
    faults: FaultState,
    scratch: Vec<RawSample>,
}

impl SimOutput {
    /// Closed output board built from `config`.
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            path: String::new(),
            open: false,
            plan: None,
            ring: None,
            clock: SimClock::default(),
            delivered: 0,
            faults: FaultState::default(),
            scratch: Vec::new(),
        }
    }

    /// Board configuration.
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Samples delivered to the FIFO since start.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    fn total_samples(&self) -> Option<u64> {
        self.plan
            .as_ref()
            .and_then(ScanPlan::total_samples)
            .map(|n| n as u64)
    }

    /// Samples the board has converted so far.
    fn consumed(&self) -> u64 {
        let Some(plan) = self.plan.as_ref() else {
            return 0;
        };
        match self.config.mode {
            SimMode::Instant => self.delivered,
            SimMode::Realistic => {
                self.clock.scans_due(plan.rate, plan.scans) * plan.n_channels() as u64
            }
        }
    }

    fn fifo_space(&self) -> usize {
        match self.config.mode {
            SimMode::Instant => usize::MAX,
            SimMode::Realistic => {
                let level = self.delivered.saturating_sub(self.consumed()) as usize;
                self.config.fifo_size.saturating_sub(level)
            }
        }
    }

    fn not_open(&self) -> DeviceError {
        DeviceError::NotOpen {
            device: self.path.clone(),
        }
    }
}

impl Backend for SimOutput {
    fn driver_type(&self) -> &'static str {
        "sim_output"
    }

    fn direction(&self) -> Direction {
        Direction::Output
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
        debug!(path, mode = ?self.config.mode, "Simulated output opened");
        Ok(self.config.capabilities())
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
        if plan.direction != Direction::Output {
            return Err(DeviceError::NotSupported {
                device: self.path.clone(),
                message: "input plan on an output board".to_string(),
            });
        }
        self.plan = Some(plan.clone());
        self.ring = None;
        self.clock = SimClock::default();
        self.delivered = 0;
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
        let RingEnd::Output(reader) = ring else {
            return Err(DeviceError::NotSupported {
                device: self.path.clone(),
                message: "output board needs the reading ring end".to_string(),
            });
        };
        self.ring = Some(reader);
        self.delivered = 0;
        self.faults.reset();
        self.clock.start();
        Ok(())
    }

    fn transfer(&mut self, _timeout: Duration) -> Result<usize> {
        if !self.clock.is_ticking() {
            return Ok(0);
        }
        self.faults.before_transfer(&self.config.faults, &self.path)?;

        let total = self.total_samples();
        let consumed = self.consumed();
        let ended = total.is_some_and(|t| self.delivered >= t);
        if !ended && consumed > self.delivered {
            warn!(
                path = %self.path,
                consumed,
                delivered = self.delivered,
                "Simulated output FIFO ran dry"
            );
            self.clock.stop();
            return Err(DeviceError::Underrun {
                device: self.path.clone(),
            });
        }

        let space = self.fifo_space();
        let Some(ring) = self.ring.as_mut() else {
            return Ok(0);
        };
        let n = space.min(ring.available());
        if n == 0 {
            return Ok(0);
        }
        self.scratch.resize(n, 0);
        let moved = ring.pop_into(&mut self.scratch[..n]);
        self.delivered += moved as u64;
        Ok(moved)
    }

    fn is_running(&self) -> bool {
        if !self.clock.is_ticking() {
            return false;
        }
        match self.total_samples() {
            Some(total) => self.consumed() < total,
            None => true,
        }
    }

    fn position(&self) -> u64 {
        let channels = self.plan.as_ref().map_or(1, ScanPlan::n_channels).max(1) as u64;
        self.consumed() / channels
    }

    fn stop(&mut self) -> Result<()> {
        self.clock.stop();
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.plan = None;
        self.ring = None;
        self.clock = SimClock::default();
        self.delivered = 0;
        self.faults.reset();
        Ok(())
    }

    fn sync_candidate(&self, inputs: &[&str]) -> Option<usize> {
        candidate(&self.path, inputs)
    }
}
