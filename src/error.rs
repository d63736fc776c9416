//! Error taxonomy for the streaming engine.
//!
//! Two layers of error reporting exist side by side:
//!
//! - [`ErrorFlags`] / [`ErrorRecord`]: the per-descriptor accumulator. Validation in
//!   `test`/`prepare` sets flags on every offending [`SignalDescriptor`], and runtime
//!   failures tag every descriptor still active in a trial.
//! - [`DeviceError`]: the typed error returned by device operations. Every variant
//!   carries the identifier of the device that produced it and maps onto a stable
//!   negative code and onto the descriptor flag set.
//!
//! [`SignalDescriptor`]: crate::signal::SignalDescriptor

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

bitflags! {
    /// Error flags accumulated on a signal descriptor.
    ///
    /// Bit positions are stable and shared with consumers that persist them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ErrorFlags: u64 {
        /// No device
        const NO_DEVICE = 1 << 0;
        /// Device not open
        const DEVICE_NOT_OPEN = 1 << 1;
        /// Multiple devices
        const MULTIPLE_DEVICES = 1 << 2;
        /// Invalid start source
        const INVALID_START_SOURCE = 1 << 3;
        /// Multiple start sources
        const MULTIPLE_START_SOURCES = 1 << 4;
        /// Invalid delay
        const INVALID_DELAY = 1 << 5;
        /// Multiple delays
        const MULTIPLE_DELAYS = 1 << 6;
        /// Multiple priorities
        const MULTIPLE_PRIORITIES = 1 << 7;
        /// Invalid sampling rate
        const INVALID_SAMPLE_RATE = 1 << 8;
        /// Multiple sampling rates
        const MULTIPLE_SAMPLE_RATES = 1 << 9;
        /// Invalid continuous mode
        const INVALID_CONTINUOUS = 1 << 10;
        /// Multiple continuous modes
        const MULTIPLE_CONTINUOUS = 1 << 11;
        /// Multiple restart requests
        const MULTIPLE_RESTART = 1 << 12;
        /// No data
        const NO_DATA = 1 << 13;
        /// Multiple buffer sizes
        const MULTIPLE_BUFFERSIZES = 1 << 14;
        /// Invalid trace
        const INVALID_TRACE = 1 << 19;
        /// Invalid channel
        const INVALID_CHANNEL = 1 << 20;
        /// Multiple channels
        const MULTIPLE_CHANNELS = 1 << 21;
        /// Invalid reference
        const INVALID_REFERENCE = 1 << 22;
        /// Multiple references
        const MULTIPLE_REFERENCES = 1 << 23;
        /// Invalid gain
        const INVALID_GAIN = 1 << 28;
        /// Multiple gains
        const MULTIPLE_GAINS = 1 << 29;
        /// Underflow
        const UNDERFLOW = 1 << 30;
        /// Overflow
        const OVERFLOW = 1 << 31;
        /// Calibration failed
        const CALIBRATION_FAILED = 1 << 32;
        /// Invalid channel type
        const INVALID_CHANNEL_TYPE = 1 << 33;
        /// Invalid channel sequence
        const INVALID_CHANNEL_SEQUENCE = 1 << 34;
        /// Device busy
        const BUSY = 1 << 35;
        /// Device error
        const DEVICE_ERROR = 1 << 36;
        /// Overflow/underrun
        const OVERFLOW_UNDERRUN = 1 << 37;
        /// Unknown
        const UNKNOWN = 1 << 38;
    }
}

const FLAG_TEXT: &[(ErrorFlags, &str)] = &[
    (ErrorFlags::NO_DEVICE, "no device"),
    (ErrorFlags::DEVICE_NOT_OPEN, "device not open"),
    (ErrorFlags::MULTIPLE_DEVICES, "multiple devices"),
    (ErrorFlags::INVALID_START_SOURCE, "invalid start source"),
    (ErrorFlags::MULTIPLE_START_SOURCES, "multiple start sources"),
    (ErrorFlags::INVALID_DELAY, "invalid delay"),
    (ErrorFlags::MULTIPLE_DELAYS, "multiple delays"),
    (ErrorFlags::MULTIPLE_PRIORITIES, "multiple priorities"),
    (ErrorFlags::INVALID_SAMPLE_RATE, "invalid sampling rate"),
    (ErrorFlags::MULTIPLE_SAMPLE_RATES, "multiple sampling rates"),
    (ErrorFlags::INVALID_CONTINUOUS, "invalid continuous mode"),
    (ErrorFlags::MULTIPLE_CONTINUOUS, "multiple continuous modes"),
    (ErrorFlags::MULTIPLE_RESTART, "multiple restart requests"),
    (ErrorFlags::NO_DATA, "no data"),
    (ErrorFlags::MULTIPLE_BUFFERSIZES, "multiple buffer sizes"),
    (ErrorFlags::INVALID_TRACE, "invalid trace"),
    (ErrorFlags::INVALID_CHANNEL, "invalid channel"),
    (ErrorFlags::MULTIPLE_CHANNELS, "multiple channels"),
    (ErrorFlags::INVALID_REFERENCE, "invalid reference"),
    (ErrorFlags::MULTIPLE_REFERENCES, "multiple references"),
    (ErrorFlags::INVALID_GAIN, "invalid gain"),
    (ErrorFlags::MULTIPLE_GAINS, "multiple gains"),
    (ErrorFlags::UNDERFLOW, "underflow"),
    (ErrorFlags::OVERFLOW, "overflow"),
    (ErrorFlags::CALIBRATION_FAILED, "calibration failed"),
    (ErrorFlags::INVALID_CHANNEL_TYPE, "invalid channel type"),
    (ErrorFlags::INVALID_CHANNEL_SEQUENCE, "invalid channel sequence"),
    (ErrorFlags::BUSY, "device busy"),
    (ErrorFlags::DEVICE_ERROR, "device error"),
    (ErrorFlags::OVERFLOW_UNDERRUN, "overflow/underrun"),
    (ErrorFlags::UNKNOWN, "unknown"),
];

impl ErrorFlags {
    /// Human-readable text of a single flag.
    ///
    /// Returns `None` for combinations of several flags or for the empty set.
    pub fn text(self) -> Option<&'static str> {
        FLAG_TEXT
            .iter()
            .find(|(flag, _)| *flag == self)
            .map(|(_, text)| *text)
    }

    /// Joins the texts of all set flags with `", "`.
    pub fn describe(self) -> String {
        self.iter()
            .filter_map(ErrorFlags::text)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Error accumulator attached to a signal descriptor.
///
/// Written by the engine during one trial and read by the caller afterwards.
/// Only the caller clears it, before the next `test`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorRecord {
    flags: ErrorFlags,
    text: String,
}

impl ErrorRecord {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently set flags.
    pub fn flags(&self) -> ErrorFlags {
        self.flags
    }

    /// Free-form error text without the flag descriptions.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Sets `flags` in addition to those already set.
    pub fn add_flag(&mut self, flags: ErrorFlags) {
        self.flags |= flags;
    }

    /// Clears `flags`.
    pub fn del_flag(&mut self, flags: ErrorFlags) {
        self.flags.remove(flags);
    }

    /// Appends free text, separated from earlier text by `", "`.
    pub fn add_text(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        if text.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push_str(", ");
        }
        self.text.push_str(text);
    }

    /// Records a backend error state: `1` is an overflow/underrun, anything else
    /// non-zero is unknown.
    pub fn add_device_error(&mut self, code: i32) {
        match code {
            0 => {}
            1 => self.add_flag(ErrorFlags::OVERFLOW_UNDERRUN),
            _ => self.add_flag(ErrorFlags::UNKNOWN),
        }
    }

    /// Merges another record into this one.
    pub fn merge(&mut self, other: &ErrorRecord) {
        self.flags |= other.flags;
        self.add_text(&other.text);
    }

    /// Removes all flags and text.
    pub fn clear(&mut self) {
        self.flags = ErrorFlags::empty();
        self.text.clear();
    }

    /// Whether any flag is set or any text was recorded.
    pub fn failed(&self) -> bool {
        !self.flags.is_empty() || !self.text.is_empty()
    }

    /// Opposite of [`failed`](Self::failed).
    pub fn success(&self) -> bool {
        !self.failed()
    }

    /// Flag descriptions followed by the free text.
    pub fn error_text(&self) -> String {
        let mut out = self.flags.describe();
        if !self.text.is_empty() {
            if !out.is_empty() {
                out.push_str(", ");
            }
            out.push_str(&self.text);
        }
        out
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.error_text())
    }
}

/// Classification of device failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Device not opened
    NotOpen,
    /// Device missing or unusable
    InvalidDevice,
    /// Channel outside the board
    InvalidChannel,
    /// No range fits the requested span
    InvalidGain,
    /// Unsupported reference mode
    InvalidReference,
    /// Rate outside the board limits
    InvalidSampleRate,
    /// Negative or inconsistent delay
    InvalidDelay,
    /// Signal list rejected
    InvalidConfiguration,
    /// Input drained too slowly
    Overflow,
    /// Output refilled too slowly
    Underrun,
    /// Device in use
    Busy,
    /// Hardware vanished
    NoDevice,
    /// Output transfer failed
    WriteError,
    /// Input transfer failed
    ReadError,
    /// Operation not available on this board
    NotSupported,
    /// Anything else
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotOpen => "not open",
            Self::InvalidDevice => "invalid device",
            Self::InvalidChannel => "invalid channel",
            Self::InvalidGain => "invalid gain",
            Self::InvalidReference => "invalid reference",
            Self::InvalidSampleRate => "invalid sample rate",
            Self::InvalidDelay => "invalid delay",
            Self::InvalidConfiguration => "invalid configuration",
            Self::Overflow => "overflow",
            Self::Underrun => "underrun",
            Self::Busy => "busy",
            Self::NoDevice => "no device",
            Self::WriteError => "write error",
            Self::ReadError => "read error",
            Self::NotSupported => "not supported",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Errors returned by device operations.
///
/// `device` names the device (or backend path) that raised the error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Operation requires an open device
    #[error("Device '{device}' is not open")]
    NotOpen {
        /// Device ident
        device: String,
    },

    /// Hardware could not be claimed or the device index is invalid
    #[error("Invalid device '{device}': {message}")]
    InvalidDevice {
        /// Device ident
        device: String,
        /// Why the device is unusable
        message: String,
    },

    /// Channel number past the last channel
    #[error("Invalid channel {channel} on '{device}': device has {max} channels")]
    InvalidChannel {
        /// Device ident
        device: String,
        /// Requested channel
        channel: u32,
        /// Channel count of the board
        max: u32,
    },

    /// No range contains the requested span
    #[error("No range on '{device}' covers [{min}, {max}] V")]
    InvalidGain {
        /// Device ident
        device: String,
        /// Requested minimum in volts
        min: f64,
        /// Requested maximum in volts
        max: f64,
    },

    /// Reference mode the board lacks
    #[error("Reference mode {reference} not supported by '{device}'")]
    InvalidReference {
        /// Device ident
        device: String,
        /// Requested reference mode
        reference: String,
    },

    /// Sample rate outside the board limits
    #[error("Invalid sample rate {rate} Hz on '{device}' (allowed {min}..={max} Hz)")]
    InvalidSampleRate {
        /// Device ident
        device: String,
        /// Requested rate
        rate: f64,
        /// Lowest supported rate
        min: f64,
        /// Highest supported rate
        max: f64,
    },

    /// Negative delay
    #[error("Invalid delay {delay} s on '{device}'")]
    InvalidDelay {
        /// Device ident
        device: String,
        /// Requested delay in seconds
        delay: f64,
    },

    /// Validation of a signal list failed; details are on the descriptors
    #[error("{failed} signal(s) rejected by '{device}': {message}")]
    InvalidConfiguration {
        /// Device ident
        device: String,
        /// Descriptors in error
        failed: usize,
        /// Joined error texts
        message: String,
    },

    /// Input hardware produced data faster than it was drained
    #[error("Buffer overflow on '{device}': data acquisition too slow")]
    Overflow {
        /// Device ident
        device: String,
    },

    /// Output hardware ran out of data
    #[error("Buffer underrun on '{device}': data output too slow")]
    Underrun {
        /// Device ident
        device: String,
    },

    /// Transport claimed elsewhere or stalled
    #[error("Device '{device}' is busy")]
    Busy {
        /// Device ident
        device: String,
    },

    /// Hardware vanished
    #[error("Device '{device}' is gone: {message}")]
    NoDevice {
        /// Device ident
        device: String,
        /// Backend detail
        message: String,
    },

    /// Output transfer failed
    #[error("Write error on '{device}': {message}")]
    WriteError {
        /// Device ident
        device: String,
        /// Backend detail
        message: String,
    },

    /// Input transfer failed
    #[error("Read error on '{device}': {message}")]
    ReadError {
        /// Device ident
        device: String,
        /// Backend detail
        message: String,
    },

    /// Operation not available on this board
    #[error("Operation not supported by '{device}': {message}")]
    NotSupported {
        /// Device ident
        device: String,
        /// What was attempted
        message: String,
    },

    /// Anything else
    #[error("Unknown error on '{device}': {message}")]
    Unknown {
        /// Device ident
        device: String,
        /// Backend detail
        message: String,
    },
}

impl DeviceError {
    /// Kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotOpen { .. } => ErrorKind::NotOpen,
            Self::InvalidDevice { .. } => ErrorKind::InvalidDevice,
            Self::InvalidChannel { .. } => ErrorKind::InvalidChannel,
            Self::InvalidGain { .. } => ErrorKind::InvalidGain,
            Self::InvalidReference { .. } => ErrorKind::InvalidReference,
            Self::InvalidSampleRate { .. } => ErrorKind::InvalidSampleRate,
            Self::InvalidDelay { .. } => ErrorKind::InvalidDelay,
            Self::InvalidConfiguration { .. } => ErrorKind::InvalidConfiguration,
            Self::Overflow { .. } => ErrorKind::Overflow,
            Self::Underrun { .. } => ErrorKind::Underrun,
            Self::Busy { .. } => ErrorKind::Busy,
            Self::NoDevice { .. } => ErrorKind::NoDevice,
            Self::WriteError { .. } => ErrorKind::WriteError,
            Self::ReadError { .. } => ErrorKind::ReadError,
            Self::NotSupported { .. } => ErrorKind::NotSupported,
            Self::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// Identifier of the device that raised the error.
    pub fn device(&self) -> &str {
        match self {
            Self::NotOpen { device }
            | Self::InvalidDevice { device, .. }
            | Self::InvalidChannel { device, .. }
            | Self::InvalidGain { device, .. }
            | Self::InvalidReference { device, .. }
            | Self::InvalidSampleRate { device, .. }
            | Self::InvalidDelay { device, .. }
            | Self::InvalidConfiguration { device, .. }
            | Self::Overflow { device }
            | Self::Underrun { device }
            | Self::Busy { device }
            | Self::NoDevice { device, .. }
            | Self::WriteError { device, .. }
            | Self::ReadError { device, .. }
            | Self::NotSupported { device, .. }
            | Self::Unknown { device, .. } => device,
        }
    }

    /// Stable negative return code.
    pub fn code(&self) -> i32 {
        match self.kind() {
            ErrorKind::NotOpen => -1,
            ErrorKind::InvalidDevice => -2,
            ErrorKind::ReadError => -3,
            ErrorKind::WriteError => -4,
            ErrorKind::InvalidChannel
            | ErrorKind::InvalidGain
            | ErrorKind::InvalidReference
            | ErrorKind::InvalidSampleRate
            | ErrorKind::InvalidDelay
            | ErrorKind::InvalidConfiguration => -5,
            ErrorKind::NotSupported => -6,
            ErrorKind::Overflow => -7,
            ErrorKind::Underrun => -8,
            ErrorKind::Busy => -9,
            ErrorKind::NoDevice => -10,
            ErrorKind::Unknown => -11,
        }
    }

    /// Descriptor flags corresponding to this error.
    pub fn flags(&self) -> ErrorFlags {
        match self.kind() {
            ErrorKind::NotOpen => ErrorFlags::DEVICE_NOT_OPEN,
            ErrorKind::InvalidDevice => ErrorFlags::NO_DEVICE,
            ErrorKind::InvalidChannel => ErrorFlags::INVALID_CHANNEL,
            ErrorKind::InvalidGain => ErrorFlags::INVALID_GAIN,
            ErrorKind::InvalidReference => ErrorFlags::INVALID_REFERENCE,
            ErrorKind::InvalidSampleRate => ErrorFlags::INVALID_SAMPLE_RATE,
            ErrorKind::InvalidDelay => ErrorFlags::INVALID_DELAY,
            ErrorKind::InvalidConfiguration => ErrorFlags::empty(),
            ErrorKind::Overflow | ErrorKind::Underrun => ErrorFlags::OVERFLOW_UNDERRUN,
            ErrorKind::Busy => ErrorFlags::BUSY,
            ErrorKind::NoDevice => ErrorFlags::NO_DEVICE,
            ErrorKind::WriteError | ErrorKind::ReadError => ErrorFlags::DEVICE_ERROR,
            ErrorKind::NotSupported | ErrorKind::Unknown => ErrorFlags::UNKNOWN,
        }
    }

    /// Whether the error can only occur while streaming.
    pub fn is_runtime(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Overflow
                | ErrorKind::Underrun
                | ErrorKind::Busy
                | ErrorKind::NoDevice
                | ErrorKind::WriteError
                | ErrorKind::ReadError
                | ErrorKind::Unknown
        )
    }

    /// Whether the session (not only the trial) must be abandoned.
    pub fn is_session_fatal(&self) -> bool {
        self.kind() == ErrorKind::NoDevice
    }

    /// Whether the error is an overflow or an underrun.
    pub fn is_overflow_underrun(&self) -> bool {
        matches!(self.kind(), ErrorKind::Overflow | ErrorKind::Underrun)
    }
}

/// Device status as seen by callers. The discriminants are a stable contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum Status {
    /// Not running, or the run completed
    #[default]
    Idle = 0,
    /// Transferring data
    Running = 1,
    /// Stopped by an overflow or underrun
    Underrun = 2,
    /// Stopped by any other error
    UnknownError = 3,
}

impl Status {
    /// Stable integer code of the status.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Status values that only `reset()` clears.
    pub fn is_sticky(self) -> bool {
        matches!(self, Status::Underrun | Status::UnknownError)
    }

    /// Status a runtime error leaves behind.
    pub fn from_error(err: &DeviceError) -> Self {
        if err.is_overflow_underrun() {
            Status::Underrun
        } else {
            Status::UnknownError
        }
    }
}

impl TryFrom<i32> for Status {
    type Error = i32;

    fn try_from(code: i32) -> std::result::Result<Self, Self::Error> {
        match code {
            0 => Ok(Status::Idle),
            1 => Ok(Status::Running),
            2 => Ok(Status::Underrun),
            3 => Ok(Status::UnknownError),
            other => Err(other),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Idle => "idle",
            Status::Running => "running",
            Status::Underrun => "underrun",
            Status::UnknownError => "unknown error",
        };
        f.write_str(label)
    }
}
