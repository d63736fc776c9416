//! Signal descriptors and signal lists.
//!
//! A [`SignalDescriptor`] configures one logical channel of input or output and
//! carries its error accumulator. A [`SignalList`] groups descriptors that are
//! driven or read together by one device.
//!
//! # Example
//!
//! ```
//! use daq_stream::signal::{SignalDescriptor, SignalList};
//!
//! let mut sigs = SignalList::output();
//! sigs.push(
//!     SignalDescriptor::new(0)
//!         .with_sample_rate(1000.0)
//!         .with_data(vec![0.0; 500]),
//! );
//! assert_eq!(sigs.scans(), Some(500));
//! ```

use crate::error::{ErrorFlags, ErrorRecord};
use crate::sample::TraceHandle;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Analog reference mode of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reference {
    /// Measured against a paired channel
    Differential,
    /// Measured against a common sense line
    Common,
    /// Measured against ground
    #[default]
    Ground,
    /// Board-specific mode
    Other,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Reference::Differential => "differential",
            Reference::Common => "common",
            Reference::Ground => "ground",
            Reference::Other => "other",
        };
        f.write_str(label)
    }
}

/// Transfer direction of a device or signal list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Analog input, hardware to host
    Input,
    /// Analog output, host to hardware
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// Where a signal list takes its sample rate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateSource {
    /// The rate requested on the descriptors
    #[default]
    Own,
    /// The rate of the input device with this index in the orchestrator
    Inherit { master: usize },
}

/// Buffering parameters of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTiming {
    /// Amount of signal held in the software ring buffer
    #[serde(with = "humantime_serde")]
    pub buffer_time: Duration,
    /// Interval between two block transfers of the pump
    #[serde(with = "humantime_serde")]
    pub update_time: Duration,
}

impl Default for StreamTiming {
    fn default() -> Self {
        Self {
            buffer_time: Duration::from_secs(1),
            update_time: Duration::from_millis(100),
        }
    }
}

impl StreamTiming {
    /// Timing with the given buffer length and update interval.
    pub fn new(buffer_time: Duration, update_time: Duration) -> Self {
        Self {
            buffer_time,
            update_time,
        }
    }

    /// Ring capacity in scans at `rate`: at least two update intervals.
    pub fn ring_scans(&self, rate: f64) -> usize {
        let buffer = self.buffer_time.max(self.update_time * 2).as_secs_f64();
        ((buffer * rate).ceil() as usize).max(2)
    }

    /// Scans moved per block transfer at `rate`.
    pub fn block_scans(&self, rate: f64) -> usize {
        ((self.update_time.as_secs_f64() * rate).ceil() as usize).max(1)
    }
}

/// Shared error accumulator of a descriptor.
///
/// Devices keep a weak reference for the duration of a trial so that runtime
/// failures can be reported on descriptors they do not own.
#[derive(Debug, Default)]
struct ErrorSlot(Arc<Mutex<ErrorRecord>>);

impl Clone for ErrorSlot {
    fn clone(&self) -> Self {
        ErrorSlot(Arc::new(Mutex::new(self.0.lock().clone())))
    }
}

/// Weak reference to the error accumulator of a descriptor.
#[derive(Debug, Clone)]
pub struct ErrorTag(Weak<Mutex<ErrorRecord>>);

impl ErrorTag {
    /// Adds flags and text; returns `false` if the descriptor is gone.
    pub fn tag(&self, flags: ErrorFlags, text: &str) -> bool {
        match self.0.upgrade() {
            Some(slot) => {
                let mut record = slot.lock();
                record.add_flag(flags);
                record.add_text(text);
                true
            }
            None => false,
        }
    }
}

/// Configuration and status of one logical channel.
#[derive(Debug, Clone)]
pub struct SignalDescriptor {
    ident: String,
    channel: u32,
    reference: Reference,
    sample_rate: f64,
    requested_min: Option<f64>,
    requested_max: Option<f64>,
    delay: f64,
    scale: f64,
    offset: f64,
    unit: String,
    data: Vec<f32>,
    trace: TraceHandle,
    errors: ErrorSlot,
    gain_index: Option<usize>,
    actual_min: f64,
    actual_max: f64,
}

impl SignalDescriptor {
    /// Descriptor of `channel` at 1 kHz, ground-referenced, in volts.
    pub fn new(channel: u32) -> Self {
        Self {
            ident: format!("ch{}", channel),
            channel,
            reference: Reference::default(),
            sample_rate: 1000.0,
            requested_min: None,
            requested_max: None,
            delay: 0.0,
            scale: 1.0,
            offset: 0.0,
            unit: "V".to_string(),
            data: Vec::new(),
            trace: TraceHandle::new(),
            errors: ErrorSlot::default(),
            gain_index: None,
            actual_min: 0.0,
            actual_max: 0.0,
        }
    }

    /// Name used in error texts, `ch<N>` by default.
    pub fn with_ident(mut self, ident: impl Into<String>) -> Self {
        self.ident = ident.into();
        self
    }

    /// Reference mode of the channel.
    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.reference = reference;
        self
    }

    /// Sample rate in Hz.
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Requested voltage range.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.requested_min = Some(min);
        self.requested_max = Some(max);
        self
    }

    /// Delay in seconds between the start of the stream and the first real sample.
    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    /// Volts per physical unit and offset in volts.
    pub fn with_scale(mut self, scale: f64, offset: f64, unit: impl Into<String>) -> Self {
        self.scale = scale;
        self.offset = offset;
        self.unit = unit.into();
        self
    }

    /// Output samples in physical units.
    pub fn with_data(mut self, data: Vec<f32>) -> Self {
        self.data = data;
        self
    }

    /// Input trace to append to instead of a fresh one.
    pub fn with_trace(mut self, trace: TraceHandle) -> Self {
        self.trace = trace;
        self
    }

    /// Name used in error texts.
    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// Hardware channel number.
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Reference mode.
    pub fn reference(&self) -> Reference {
        self.reference
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Requested lower voltage limit.
    pub fn requested_min(&self) -> Option<f64> {
        self.requested_min
    }

    /// Requested upper voltage limit.
    pub fn requested_max(&self) -> Option<f64> {
        self.requested_max
    }

    /// Output delay in seconds.
    pub fn delay(&self) -> f64 {
        self.delay
    }

    /// Delay expressed in whole scans.
    pub fn delay_scans(&self) -> usize {
        if self.delay <= 0.0 {
            0
        } else {
            (self.delay * self.sample_rate).round() as usize
        }
    }

    /// Volts per physical unit.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Offset in volts.
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Physical unit label.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Output samples in physical units.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Trace receiving the input samples.
    pub fn trace(&self) -> &TraceHandle {
        &self.trace
    }

    /// Range index selected during prepare.
    pub fn gain_index(&self) -> Option<usize> {
        self.gain_index
    }

    /// Lower voltage limit selected during prepare.
    pub fn actual_min(&self) -> f64 {
        self.actual_min
    }

    /// Upper voltage limit selected during prepare.
    pub fn actual_max(&self) -> f64 {
        self.actual_max
    }

    /// Converts a physical value to volts.
    pub fn to_volts(&self, value: f64) -> f64 {
        value * self.scale + self.offset
    }

    /// Converts volts to a physical value.
    pub fn from_volts(&self, volts: f64) -> f64 {
        if self.scale == 0.0 {
            0.0
        } else {
            (volts - self.offset) / self.scale
        }
    }

    /// Minimum and maximum of the output data in volts.
    pub fn data_range(&self) -> Option<(f64, f64)> {
        let (min, max) = self
            .data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if min > max {
            return None;
        }
        let a = self.to_volts(f64::from(min));
        let b = self.to_volts(f64::from(max));
        Some((a.min(b), a.max(b)))
    }

    /// Snapshot of the error accumulator.
    pub fn errors(&self) -> ErrorRecord {
        self.errors.0.lock().clone()
    }

    /// Whether any error flag is set.
    pub fn failed(&self) -> bool {
        self.errors.0.lock().failed()
    }

    /// No error flag set.
    pub fn success(&self) -> bool {
        !self.failed()
    }

    /// Accumulated error texts.
    pub fn error_text(&self) -> String {
        self.errors.0.lock().error_text()
    }

    /// Sets `flags`.
    pub fn add_error(&self, flags: ErrorFlags) {
        self.errors.0.lock().add_flag(flags);
    }

    /// Appends a line to the error text.
    pub fn add_error_text(&self, text: impl AsRef<str>) {
        self.errors.0.lock().add_text(text);
    }

    /// Clears flags and text.
    pub fn clear_errors(&self) {
        self.errors.0.lock().clear();
    }

    /// Weak handle used by devices to report runtime errors.
    pub fn error_tag(&self) -> ErrorTag {
        ErrorTag(Arc::downgrade(&self.errors.0))
    }

    pub(crate) fn set_channel(&mut self, channel: u32) {
        self.channel = channel;
    }

    pub(crate) fn set_sample_rate(&mut self, rate: f64) {
        self.sample_rate = rate;
    }

    pub(crate) fn set_gain(&mut self, index: Option<usize>, min: f64, max: f64) {
        self.gain_index = index;
        self.actual_min = min;
        self.actual_max = max;
    }
}

/// Descriptors that share one direction and, for output, one timeline.
#[derive(Debug, Clone)]
pub struct SignalList {
    direction: Direction,
    signals: Vec<SignalDescriptor>,
    continuous: bool,
    duration: Option<f64>,
    timing: StreamTiming,
    priority: bool,
    rate_source: RateSource,
}

impl SignalList {
    /// Empty finite list with default timing.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            signals: Vec::new(),
            continuous: false,
            duration: None,
            timing: StreamTiming::default(),
            priority: false,
            rate_source: RateSource::Own,
        }
    }

    /// Empty input list.
    pub fn input() -> Self {
        Self::new(Direction::Input)
    }

    /// Empty output list.
    pub fn output() -> Self {
        Self::new(Direction::Output)
    }

    /// Infinite acquisition or output, stopped only on request.
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Duration in seconds of a finite input acquisition.
    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    /// Buffer and update timing of the stream.
    pub fn with_timing(mut self, timing: StreamTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Running devices are reset instead of reporting busy.
    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    /// Where the sample rate comes from.
    pub fn with_rate_source(mut self, source: RateSource) -> Self {
        self.rate_source = source;
        self
    }

    /// Appends a descriptor.
    pub fn with_signal(mut self, signal: SignalDescriptor) -> Self {
        self.signals.push(signal);
        self
    }

    /// Appends a descriptor.
    pub fn push(&mut self, signal: SignalDescriptor) {
        self.signals.push(signal);
    }

    /// Direction of every descriptor.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether the run lasts until stopped.
    pub fn continuous(&self) -> bool {
        self.continuous
    }

    /// Duration in seconds of a finite input run.
    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    /// Buffer and update timing.
    pub fn timing(&self) -> StreamTiming {
        self.timing
    }

    /// Replaces the timing.
    pub fn set_timing(&mut self, timing: StreamTiming) {
        self.timing = timing;
    }

    /// Whether prepare may reset a running device.
    pub fn priority(&self) -> bool {
        self.priority
    }

    /// Where the sample rate comes from.
    pub fn rate_source(&self) -> RateSource {
        self.rate_source
    }

    /// Replaces the rate source.
    pub fn set_rate_source(&mut self, source: RateSource) {
        self.rate_source = source;
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// No descriptor.
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Descriptor at `index`.
    pub fn get(&self, index: usize) -> Option<&SignalDescriptor> {
        self.signals.get(index)
    }

    /// Descriptors in channel order.
    pub fn iter(&self) -> std::slice::Iter<'_, SignalDescriptor> {
        self.signals.iter()
    }

    /// Mutable descriptors in channel order.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, SignalDescriptor> {
        self.signals.iter_mut()
    }

    /// Sample rate of the first descriptor.
    pub fn sample_rate(&self) -> Option<f64> {
        self.signals.first().map(SignalDescriptor::sample_rate)
    }

    /// Forces every descriptor onto `rate`.
    pub fn set_sample_rate(&mut self, rate: f64) {
        for sig in &mut self.signals {
            sig.set_sample_rate(rate);
        }
    }

    /// Scans per channel of a finite run, `None` for continuous runs.
    ///
    /// Output runs are as long as the longest data plus its delay, input runs
    /// last `duration` seconds.
    pub fn scans(&self) -> Option<usize> {
        if self.continuous {
            return None;
        }
        match self.direction {
            Direction::Output => self
                .signals
                .iter()
                .map(|s| s.delay_scans() + s.data().len())
                .max(),
            Direction::Input => {
                let rate = self.sample_rate()?;
                self.duration.map(|d| (d * rate).round().max(0.0) as usize)
            }
        }
    }

    /// Adds flags to every descriptor.
    pub fn add_error(&self, flags: ErrorFlags) {
        for sig in &self.signals {
            sig.add_error(flags);
        }
    }

    /// Appends `text` to every descriptor.
    pub fn add_error_text(&self, text: impl AsRef<str>) {
        let text = text.as_ref();
        for sig in &self.signals {
            sig.add_error_text(text);
        }
    }

    /// Clears the errors of every descriptor.
    pub fn clear_errors(&self) {
        for sig in &self.signals {
            sig.clear_errors();
        }
    }

    /// Whether any descriptor carries an error.
    pub fn failed(&self) -> bool {
        self.signals.iter().any(SignalDescriptor::failed)
    }

    /// No error flag set.
    pub fn success(&self) -> bool {
        !self.failed()
    }

    /// Number of descriptors carrying an error.
    pub fn failed_count(&self) -> usize {
        self.signals.iter().filter(|s| s.failed()).count()
    }

    /// Error texts of all failing descriptors, prefixed by their identifier.
    pub fn error_text(&self) -> String {
        self.signals
            .iter()
            .filter(|s| s.failed())
            .map(|s| format!("{}: {}", s.ident(), s.error_text()))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Weak error handles of all descriptors.
    pub fn error_tags(&self) -> Vec<ErrorTag> {
        self.signals.iter().map(SignalDescriptor::error_tag).collect()
    }

    pub(crate) fn signals_mut(&mut self) -> &mut [SignalDescriptor] {
        &mut self.signals
    }
}

impl<'a> IntoIterator for &'a SignalList {
    type Item = &'a SignalDescriptor;
    type IntoIter = std::slice::Iter<'a, SignalDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.signals.iter()
    }
}

/// Receives notifications when the engine changes a descriptor's configuration.
pub trait ConfigObserver: Send + Sync {
    /// Called after prepare fills in gain and range, and when a rate is inherited.
    fn on_config_changed(&self, descriptor: &SignalDescriptor);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_builder() {
        let sig = SignalDescriptor::new(3)
            .with_reference(Reference::Differential)
            .with_sample_rate(20_000.0)
            .with_range(-1.0, 1.0)
            .with_delay(0.01)
            .with_scale(0.1, 0.0, "mV");

        assert_eq!(sig.channel(), 3);
        assert_eq!(sig.ident(), "ch3");
        assert_eq!(sig.reference(), Reference::Differential);
        assert_eq!(sig.requested_max(), Some(1.0));
        assert_eq!(sig.delay_scans(), 200);
        assert!((sig.to_volts(10.0) - 1.0).abs() < 1e-12);
        assert!((sig.from_volts(1.0) - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_clone_does_not_share_errors() {
        let sig = SignalDescriptor::new(0);
        let copy = sig.clone();
        sig.add_error(ErrorFlags::INVALID_GAIN);
        assert!(sig.failed());
        assert!(copy.success());
    }

    #[test]
    fn test_error_tag_reaches_descriptor() {
        let sigs = SignalList::output().with_signal(SignalDescriptor::new(0));
        let tags = sigs.error_tags();
        assert!(tags[0].tag(ErrorFlags::OVERFLOW_UNDERRUN, "ao - buffer-underrun"));
        assert_eq!(sigs.failed_count(), 1);
        assert!(sigs.error_text().contains("overflow/underrun"));

        drop(sigs);
        assert!(!tags[0].tag(ErrorFlags::UNKNOWN, ""));
    }

    #[test]
    fn test_scans_per_direction() {
        let out = SignalList::output()
            .with_signal(SignalDescriptor::new(0).with_data(vec![0.0; 100]))
            .with_signal(
                SignalDescriptor::new(1)
                    .with_data(vec![0.0; 80])
                    .with_delay(0.05),
            );
        assert_eq!(out.scans(), Some(130));

        let input = SignalList::input()
            .with_duration(0.5)
            .with_signal(SignalDescriptor::new(0).with_sample_rate(1000.0));
        assert_eq!(input.scans(), Some(500));

        let continuous = input.clone().with_continuous(true);
        assert_eq!(continuous.scans(), None);
    }

    #[test]
    fn test_data_range_in_volts() {
        let sig = SignalDescriptor::new(0)
            .with_scale(2.0, 1.0, "nA")
            .with_data(vec![-1.0, 0.5, 2.0]);
        assert_eq!(sig.data_range(), Some((-1.0, 5.0)));
        assert_eq!(SignalDescriptor::new(0).data_range(), None);
    }

    #[test]
    fn test_timing_ring_and_block() {
        let timing = StreamTiming::new(Duration::from_millis(100), Duration::from_millis(100));
        assert_eq!(timing.block_scans(1000.0), 100);
        assert_eq!(timing.ring_scans(1000.0), 200);
    }
}
