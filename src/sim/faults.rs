//! Fault injection for simulated boards.

use crate::error::{DeviceError, Result};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Runtime error raised by an injected transfer failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// [`DeviceError::Busy`]
    Busy,
    /// [`DeviceError::NoDevice`]
    NoDevice,
    /// [`DeviceError::WriteError`]
    #[default]
    WriteError,
    /// [`DeviceError::ReadError`]
    ReadError,
    /// [`DeviceError::Unknown`]
    Unknown,
}

impl FaultKind {
    /// Error of this kind raised by `device`.
    pub fn to_error(self, device: &str, message: impl Into<String>) -> DeviceError {
        let device = device.to_string();
        let message = message.into();
        match self {
            FaultKind::Busy => DeviceError::Busy { device },
            FaultKind::NoDevice => DeviceError::NoDevice { device, message },
            FaultKind::WriteError => DeviceError::WriteError { device, message },
            FaultKind::ReadError => DeviceError::ReadError { device, message },
            FaultKind::Unknown => DeviceError::Unknown { device, message },
        }
    }
}

/// Faults to inject, counted in transfers since start.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimFaults {
    /// Fail `open` with [`DeviceError::NoDevice`]
    pub fail_open: bool,
    /// Block the host for `stall_for` on the transfer after this many
    pub stall_after: Option<u64>,
    /// Length of the stall
    #[serde(with = "humantime_serde")]
    pub stall_for: Duration,
    /// Fail every transfer after this many
    pub fail_after: Option<u64>,
    /// Error raised by failing transfers
    pub fail_kind: FaultKind,
}

impl SimFaults {
    /// No faults.
    pub fn none() -> Self {
        Self::default()
    }

    /// Board that cannot be opened.
    pub fn fail_open() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    /// One host stall of `duration` on transfer `after`.
    pub fn stall(after: u64, duration: Duration) -> Self {
        Self {
            stall_after: Some(after),
            stall_for: duration,
            ..Self::default()
        }
    }

    /// Transfers fail with `kind` once `after` have succeeded.
    pub fn fail_after(after: u64, kind: FaultKind) -> Self {
        Self {
            fail_after: Some(after),
            fail_kind: kind,
            ..Self::default()
        }
    }

    /// Whether no fault is configured.
    pub fn is_empty(&self) -> bool {
        !self.fail_open && self.stall_after.is_none() && self.fail_after.is_none()
    }
}

/// Per-run fault bookkeeping.
#[derive(Debug, Default)]
pub(super) struct FaultState {
    transfers: u64,
    stalled: bool,
}

impl FaultState {
    pub(super) fn reset(&mut self) {
        *self = Self::default();
    }

    /// Counts one transfer and applies the faults due for it.
    pub(super) fn before_transfer(&mut self, faults: &SimFaults, device: &str) -> Result<()> {
        let done = self.transfers;
        self.transfers += 1;

        if let Some(after) = faults.fail_after {
            if done >= after {
                return Err(faults
                    .fail_kind
                    .to_error(device, format!("injected failure after {} transfers", after)));
            }
        }

        if faults.stall_after == Some(done) && !self.stalled {
            self.stalled = true;
            warn!(device, stall_ms = faults.stall_for.as_millis() as u64, "Injected host stall");
            thread::sleep(faults.stall_for);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Instant;

    #[test]
    fn test_fail_after_n() {
        let faults = SimFaults::fail_after(2, FaultKind::NoDevice);
        let mut state = FaultState::default();
        assert!(state.before_transfer(&faults, "sim").is_ok());
        assert!(state.before_transfer(&faults, "sim").is_ok());
        let err = state.before_transfer(&faults, "sim").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoDevice);
        assert!(err.is_session_fatal());

        state.reset();
        assert!(state.before_transfer(&faults, "sim").is_ok());
    }

    #[test]
    fn test_stall_happens_once() {
        let faults = SimFaults::stall(1, Duration::from_millis(30));
        let mut state = FaultState::default();
        state.before_transfer(&faults, "sim").unwrap();

        let t = Instant::now();
        state.before_transfer(&faults, "sim").unwrap();
        assert!(t.elapsed() >= Duration::from_millis(30));

        let t = Instant::now();
        state.before_transfer(&faults, "sim").unwrap();
        assert!(t.elapsed() < Duration::from_millis(30));
    }

    #[test]
    fn test_fault_kind_mapping() {
        assert_eq!(FaultKind::Busy.to_error("d", "x").kind(), ErrorKind::Busy);
        assert_eq!(FaultKind::ReadError.to_error("d", "x").kind(), ErrorKind::ReadError);
        assert!(SimFaults::none().is_empty());
        assert!(!SimFaults::fail_open().is_empty());
    }
}
