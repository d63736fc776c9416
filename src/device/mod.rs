//! Analog devices and their lifecycle.
//!
//! [`AnalogDevice`] wraps a boxed [`Backend`] and implements everything that is
//! common to all boards: validation, gain selection, conversion, the ring
//! buffer, status bookkeeping and the buffer pump.
//!
//! # Lifecycle
//!
//! ```text
//! Closed ──open──▶ Open ──prepare──▶ Prepared ──start──▶ Running
//!                   ▲                                      │
//!                   └──────────── stop / reset ◀───────────┘
//! ```
//!
//! While `Running`, [`AnalogDevice::status`] reports [`Status::Running`] until
//! the run completes ([`Status::Idle`]) or fails ([`Status::Underrun`],
//! [`Status::UnknownError`]). Failure states are sticky until
//! [`AnalogDevice::reset`]. `stop` keeps the prepared buffers, `reset` clears
//! them.
//!
//! # Example
//!
//! ```
//! use daq_stream::device::AnalogDevice;
//! use daq_stream::pump::Completion;
//! use daq_stream::signal::{SignalDescriptor, SignalList};
//! use daq_stream::sim::{SimConfig, SimOutput};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = Arc::new(AnalogDevice::new("ao-0", Box::new(SimOutput::new(SimConfig::default()))));
//! device.open("sim/ao0")?;
//!
//! let mut sigs = SignalList::output()
//!     .with_signal(SignalDescriptor::new(0).with_sample_rate(1000.0).with_data(vec![0.5; 100]));
//! assert_eq!(device.test(&mut sigs), 0);
//! device.prepare(&mut sigs)?;
//!
//! let done = Completion::new();
//! device.start(Some(&done))?;
//! device.stop()?;
//! device.reset()?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod capabilities;
mod convert;
mod validate;

pub use backend::{Backend, ChannelPlan, RingEnd, ScanPlan};
pub use capabilities::{Capabilities, Range};
pub use convert::{demultiplex, multiplex, ChannelScaling};

use crate::error::{DeviceError, ErrorFlags, Result, Status};
use crate::pump::{BlockTransfer, BufferPump, Completion};
use crate::ring::{ring_buffer, RawSample, RingReader, RingWriter};
use crate::sample::{SampleBatch, TraceHandle};
use crate::signal::{ConfigObserver, Direction, ErrorTag, SignalDescriptor, SignalList};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use validate::DeviceView;

/// Coarse lifecycle position of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// No hardware claimed
    Closed,
    /// Hardware claimed, nothing armed
    Open,
    /// Signal list accepted and scan armed
    Prepared,
    /// Streaming
    Running,
}

/// What a successful start requires from the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The whole run fits in the hardware buffer; no pump is needed
    Complete,
    /// Blocks must keep flowing, by the pump or by explicit transfers
    Streaming,
}

impl StartOutcome {
    /// `0` for [`Complete`](Self::Complete), `1` for [`Streaming`](Self::Streaming).
    pub fn code(self) -> i32 {
        match self {
            StartOutcome::Complete => 0,
            StartOutcome::Streaming => 1,
        }
    }
}

struct Prepared {
    plan: ScanPlan,
    scalings: Vec<ChannelScaling>,
    /// Multiplexed output data
    raw: Arc<[RawSample]>,
    /// Input traces in multiplex order
    traces: Vec<TraceHandle>,
    tags: Vec<ErrorTag>,
    continuous: bool,
    update_time: Duration,
    settings: String,
}

enum Side {
    Output {
        writer: RingWriter,
        data: Arc<[RawSample]>,
        cursor: usize,
    },
    Input {
        reader: RingReader,
        delivered: u64,
        scratch: Vec<RawSample>,
    },
}

struct Core {
    backend: Box<dyn Backend>,
    lifecycle: Lifecycle,
    caps: Option<Capabilities>,
    path: String,
    prepared: Option<Prepared>,
    side: Option<Side>,
}

impl Core {
    /// Whether the current run has transferred everything it will transfer.
    fn run_complete(&self) -> bool {
        match (&self.side, &self.prepared) {
            (Some(Side::Output { writer, data, cursor }), Some(p)) => {
                !p.continuous
                    && *cursor >= data.len()
                    && writer.is_empty()
                    && !self.backend.is_running()
            }
            (Some(Side::Input { delivered, .. }), Some(p)) => p
                .plan
                .scans
                .is_some_and(|total| *delivered >= total as u64),
            _ => true,
        }
    }
}

#[derive(Debug)]
struct StatusGuard {
    status: Status,
    error: Option<DeviceError>,
    index: i64,
}

impl Default for StatusGuard {
    fn default() -> Self {
        Self {
            status: Status::Idle,
            error: None,
            index: -1,
        }
    }
}

/// One board in one direction.
pub struct AnalogDevice {
    ident: String,
    direction: Direction,
    driver_type: &'static str,
    core: Mutex<Core>,
    guard: Mutex<StatusGuard>,
    interrupt: AtomicBool,
    pump: Mutex<Option<BufferPump>>,
    observers: RwLock<Vec<Arc<dyn ConfigObserver>>>,
    subscribers: Mutex<Vec<mpsc::Sender<SampleBatch>>>,
    sequence: AtomicU64,
    dropped_batches: AtomicU64,
}

impl AnalogDevice {
    /// Closed device driving `backend`.
    pub fn new(ident: impl Into<String>, backend: Box<dyn Backend>) -> Self {
        Self {
            ident: ident.into(),
            direction: backend.direction(),
            driver_type: backend.driver_type(),
            core: Mutex::new(Core {
                backend,
                lifecycle: Lifecycle::Closed,
                caps: None,
                path: String::new(),
                prepared: None,
                side: None,
            }),
            guard: Mutex::new(StatusGuard::default()),
            interrupt: AtomicBool::new(false),
            pump: Mutex::new(None),
            observers: RwLock::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            dropped_batches: AtomicU64::new(0),
        }
    }

    /// Configured ident, used in logs and error texts.
    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// Stream direction of the backend.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Driver type of the backend.
    pub fn driver_type(&self) -> &'static str {
        self.driver_type
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Claims the hardware at `path`.
    pub fn open(&self, path: &str) -> Result<()> {
        let mut core = self.core.lock();
        if core.lifecycle != Lifecycle::Closed {
            debug!(device = %self.ident, path, "Device already open");
            return Ok(());
        }

        let caps = core.backend.open(path)?;
        if let Err(message) = caps.validate() {
            core.backend.close();
            return Err(DeviceError::InvalidDevice {
                device: self.ident.clone(),
                message,
            });
        }

        info!(
            device = %self.ident,
            path,
            driver = self.driver_type,
            channels = caps.channels,
            bits = caps.bits,
            max_rate = caps.max_rate,
            "Opened device"
        );
        core.caps = Some(caps);
        core.path = path.to_string();
        core.lifecycle = Lifecycle::Open;
        drop(core);

        *self.guard.lock() = StatusGuard::default();
        Ok(())
    }

    /// Stops any run and releases the hardware.
    pub fn close(&self) {
        if let Err(err) = self.stop() {
            warn!(device = %self.ident, error = %err, "Stop before close failed");
        }
        let mut core = self.core.lock();
        if core.lifecycle == Lifecycle::Closed {
            return;
        }
        core.backend.close();
        core.caps = None;
        core.prepared = None;
        core.side = None;
        core.lifecycle = Lifecycle::Closed;
        info!(device = %self.ident, "Closed device");
    }

    /// Whether the hardware is claimed.
    pub fn is_open(&self) -> bool {
        self.core.lock().lifecycle != Lifecycle::Closed
    }

    /// Current lifecycle position.
    pub fn lifecycle(&self) -> Lifecycle {
        self.core.lock().lifecycle
    }

    /// Path given to the last `open`.
    pub fn path(&self) -> String {
        self.core.lock().path.clone()
    }

    /// Capabilities reported by the open board.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.core.lock().caps.clone()
    }

    /// Number of channels, `0` while closed.
    pub fn channels(&self) -> u32 {
        self.core.lock().caps.as_ref().map_or(0, |c| c.channels)
    }

    /// Converter resolution, `0` while closed.
    pub fn bits(&self) -> u32 {
        self.core.lock().caps.as_ref().map_or(0, |c| c.bits)
    }

    /// Maximum sample rate per channel, `0.0` while closed.
    pub fn max_rate(&self) -> f64 {
        self.core.lock().caps.as_ref().map_or(0.0, |c| c.max_rate)
    }

    /// Summary of the hardware capabilities.
    pub fn info(&self) -> String {
        match self.core.lock().caps.as_ref() {
            Some(caps) => format!(
                "channels: {};bits: {};max sampling rate: {} kHz",
                caps.channels,
                caps.bits,
                caps.max_rate * 0.001
            ),
            None => String::new(),
        }
    }

    /// Summary of the prepared run, empty if nothing is prepared.
    pub fn settings(&self) -> String {
        self.core
            .lock()
            .prepared
            .as_ref()
            .map(|p| p.settings.clone())
            .unwrap_or_default()
    }

    // =========================================================================
    // Trial
    // =========================================================================

    /// Validates `sigs` without touching hardware state.
    ///
    /// Clears and then sets error flags on every descriptor and returns the
    /// number of descriptors in error.
    pub fn test(&self, sigs: &mut SignalList) -> usize {
        if sigs.direction() != self.direction {
            sigs.clear_errors();
            sigs.add_error(ErrorFlags::INVALID_CHANNEL_TYPE);
            return sigs.len().max(1);
        }

        let running = self.status() == Status::Running;
        let core = self.core.lock();
        let view = DeviceView {
            caps: core.caps.as_ref(),
            running,
        };
        let mut failed = validate::check_list(view, sigs);
        if core.caps.is_some() {
            let extra = core.backend.check(sigs);
            if !extra.is_empty() {
                sigs.add_error(extra);
                failed = sigs.failed_count();
            }
        }

        if failed > 0 {
            debug!(device = %self.ident, failed, errors = %sigs.error_text(), "Signal list rejected");
        }
        failed
    }

    /// Validates `sigs`, selects gains and arms the hardware.
    ///
    /// On success every descriptor carries its gain index and actual range.
    /// A running device is reset first if the list has priority, otherwise the
    /// request fails with [`DeviceError::Busy`].
    pub fn prepare(&self, sigs: &mut SignalList) -> Result<()> {
        if !self.is_open() {
            sigs.add_error(ErrorFlags::DEVICE_NOT_OPEN);
            return Err(DeviceError::NotOpen {
                device: self.ident.clone(),
            });
        }

        let status = self.status();
        if status == Status::Running {
            if sigs.priority() {
                warn!(device = %self.ident, "Resetting running device for priority request");
                self.reset()?;
            } else {
                sigs.add_error(ErrorFlags::BUSY);
                return Err(DeviceError::Busy {
                    device: self.ident.clone(),
                });
            }
        } else if status.is_sticky() {
            let message = format!("status {} persists until reset", status);
            sigs.add_error_text(&message);
            return Err(DeviceError::InvalidConfiguration {
                device: self.ident.clone(),
                failed: sigs.len(),
                message,
            });
        }

        let failed = self.test(sigs);
        if failed > 0 {
            return Err(DeviceError::InvalidConfiguration {
                device: self.ident.clone(),
                failed,
                message: sigs.error_text(),
            });
        }

        let mut core = self.core.lock();
        let caps = core.caps.clone().ok_or_else(|| DeviceError::NotOpen {
            device: self.ident.clone(),
        })?;

        for sig in sigs.signals_mut() {
            match validate::select_range(&caps, self.direction, sig).copied() {
                Some(range) => sig.set_gain(Some(range.index), range.min, range.max),
                None => {
                    let (min, max) = caps.widest_range().map_or((0.0, 0.0), |r| (r.min, r.max));
                    sig.set_gain(None, min, max);
                    sig.add_error(ErrorFlags::INVALID_GAIN);
                    return Err(DeviceError::InvalidGain {
                        device: self.ident.clone(),
                        min,
                        max,
                    });
                }
            }
        }

        let mut ordered: Vec<&SignalDescriptor> = sigs.iter().collect();
        ordered.sort_by_key(|s| s.channel());

        let mut channels = Vec::with_capacity(ordered.len());
        let mut scalings = Vec::with_capacity(ordered.len());
        for sig in &ordered {
            let range_index = sig.gain_index().unwrap_or_default();
            let range = caps.range(range_index).copied().ok_or_else(|| {
                DeviceError::InvalidGain {
                    device: self.ident.clone(),
                    min: sig.actual_min(),
                    max: sig.actual_max(),
                }
            })?;
            channels.push(ChannelPlan {
                channel: sig.channel(),
                reference: sig.reference(),
                range_index,
            });
            scalings.push(ChannelScaling::new(&caps, sig, range));
        }

        let rate = sigs.sample_rate().unwrap_or(caps.min_rate);
        let timing = sigs.timing();
        let plan = ScanPlan {
            direction: self.direction,
            channels,
            rate,
            scans: sigs.scans(),
            block_scans: timing.block_scans(rate),
            ring_scans: timing.ring_scans(rate),
        };

        let raw: Arc<[RawSample]> = match self.direction {
            Direction::Output => {
                let scans = ordered
                    .iter()
                    .map(|s| s.delay_scans() + s.data().len())
                    .max()
                    .unwrap_or(0);
                multiplex(&ordered, &scalings, scans).into()
            }
            Direction::Input => Arc::from(Vec::new()),
        };
        let traces: Vec<TraceHandle> = match self.direction {
            Direction::Input => ordered.iter().map(|s| s.trace().clone()).collect(),
            Direction::Output => Vec::new(),
        };
        for trace in &traces {
            trace.clear();
        }

        core.backend.arm(&plan)?;

        let settings = format_settings(sigs, &plan);
        info!(
            device = %self.ident,
            channels = plan.n_channels(),
            rate = plan.rate,
            scans = ?plan.scans,
            ring_samples = plan.ring_samples(),
            "Prepared device"
        );

        core.prepared = Some(Prepared {
            plan,
            scalings,
            raw,
            traces,
            tags: sigs.error_tags(),
            continuous: sigs.continuous(),
            update_time: timing.update_time,
            settings,
        });
        core.side = None;
        core.lifecycle = Lifecycle::Prepared;
        drop(core);

        *self.guard.lock() = StatusGuard::default();
        for sig in sigs.iter() {
            self.notify_observers(sig);
        }
        Ok(())
    }

    /// Starts the prepared run.
    ///
    /// With a `completion` a buffer pump keeps the run going and releases one
    /// permit when it ends. Without one the caller drives the run through
    /// [`write_data`](Self::write_data) / [`read_data`](Self::read_data).
    pub fn start(self: &Arc<Self>, completion: Option<&Completion>) -> Result<StartOutcome> {
        let mut core = self.core.lock();
        match core.lifecycle {
            Lifecycle::Prepared => {}
            Lifecycle::Closed => {
                return Err(DeviceError::NotOpen {
                    device: self.ident.clone(),
                })
            }
            Lifecycle::Running => {
                return Err(DeviceError::Busy {
                    device: self.ident.clone(),
                })
            }
            Lifecycle::Open => {
                return Err(DeviceError::InvalidConfiguration {
                    device: self.ident.clone(),
                    failed: 0,
                    message: "start without prepare".to_string(),
                })
            }
        }

        let Some(update_time) = core.prepared.as_ref().map(|p| p.update_time) else {
            return Err(DeviceError::InvalidConfiguration {
                device: self.ident.clone(),
                failed: 0,
                message: "start without prepare".to_string(),
            });
        };
        self.interrupt.store(false, Ordering::SeqCst);

        let (side, complete) = match self.launch_backend(&mut core) {
            Ok(launched) => launched,
            Err(err) => {
                // The board may already be converting; stop it and make the
                // failure sticky like any streaming error.
                self.fail(&mut core, &err);
                core.side = None;
                core.lifecycle = Lifecycle::Open;
                return Err(err);
            }
        };

        core.side = Some(side);
        core.lifecycle = Lifecycle::Running;
        drop(core);

        {
            let mut guard = self.guard.lock();
            guard.status = Status::Running;
            guard.error = None;
        }

        if complete {
            info!(device = %self.ident, "Started device; run fits the hardware buffer");
            return Ok(StartOutcome::Complete);
        }

        if let Some(done) = completion {
            let pump = BufferPump::spawn(Arc::clone(self), update_time, done.clone()).map_err(
                |e| DeviceError::Unknown {
                    device: self.ident.clone(),
                    message: format!("failed to spawn buffer pump: {}", e),
                },
            )?;
            *self.pump.lock() = Some(pump);
        }

        info!(
            device = %self.ident,
            pumped = completion.is_some(),
            update_ms = update_time.as_millis() as u64,
            "Started device"
        );
        Ok(StartOutcome::Streaming)
    }

    /// Moves one block of output data towards the hardware.
    ///
    /// Returns the number of samples moved, `0` if nothing could be moved.
    pub fn write_data(&self) -> Result<usize> {
        if self.direction != Direction::Output {
            return Err(self.wrong_direction("write_data"));
        }
        self.transfer_block()
    }

    /// Moves one block of acquired data from the hardware to the traces.
    ///
    /// Returns the number of samples moved, `0` if no data was ready yet.
    pub fn read_data(&self) -> Result<usize> {
        if self.direction != Direction::Input {
            return Err(self.wrong_direction("read_data"));
        }
        self.transfer_block()
    }

    /// Whether the current run has transferred everything.
    pub fn no_more_data(&self) -> bool {
        self.core.lock().run_complete()
    }

    /// Current status; a completed run turns `Running` into `Idle`.
    ///
    /// Never waits for a block transfer in flight: while the pump holds the
    /// hardware the run is still `Running`.
    pub fn status(&self) -> Status {
        {
            let guard = self.guard.lock();
            if guard.status != Status::Running {
                return guard.status;
            }
        }
        let Some(core) = self.core.try_lock() else {
            return Status::Running;
        };
        let complete = core.lifecycle != Lifecycle::Running || core.run_complete();
        drop(core);

        let mut guard = self.guard.lock();
        if complete && guard.status == Status::Running {
            guard.status = Status::Idle;
            debug!(device = %self.ident, "Run complete");
        }
        guard.status
    }

    /// Error recorded by the last failed run.
    pub fn error(&self) -> Option<DeviceError> {
        self.guard.lock().error.clone()
    }

    /// Message of [`error`](Self::error), empty when none.
    pub fn error_text(&self) -> String {
        self.guard
            .lock()
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    /// Asks a running pump to stop at its next check.
    pub fn request_stop(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
        if let Some(pump) = self.pump.lock().as_ref() {
            pump.wake();
        }
    }

    /// Stops the run and keeps the prepared buffers.
    pub fn stop(&self) -> Result<()> {
        self.request_stop();
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.join();
        }

        let mut core = self.core.lock();
        if core.lifecycle != Lifecycle::Running {
            return Ok(());
        }
        let result = core.backend.stop();
        core.lifecycle = Lifecycle::Open;
        drop(core);

        let mut guard = self.guard.lock();
        if guard.status == Status::Running {
            guard.status = Status::Idle;
        }
        drop(guard);

        info!(device = %self.ident, "Stopped device");
        result
    }

    /// Stops the run and clears buffers, status and errors.
    pub fn reset(&self) -> Result<()> {
        let stopped = self.stop();

        let mut core = self.core.lock();
        if core.lifecycle == Lifecycle::Closed {
            return stopped;
        }
        let result = core.backend.reset();
        core.prepared = None;
        core.side = None;
        core.lifecycle = Lifecycle::Open;
        drop(core);

        *self.guard.lock() = StatusGuard::default();
        self.interrupt.store(false, Ordering::SeqCst);
        debug!(device = %self.ident, "Reset device");
        stopped.and(result)
    }

    /// Waits until the pump thread, if any, has exited.
    pub fn join_pump(&self) {
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.join();
        }
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Scans converted by the hardware since start.
    pub fn position(&self) -> u64 {
        self.core.lock().backend.position()
    }

    /// Input sample index at which the last output started, `-1` if unknown.
    pub fn index(&self) -> i64 {
        self.guard.lock().index
    }

    pub(crate) fn set_index(&self, index: i64) {
        self.guard.lock().index = index;
    }

    /// Marks `index` as signal start on every input trace of the current run.
    pub(crate) fn mark_signal_start(&self, index: u64) {
        let core = self.core.lock();
        if let Some(prepared) = core.prepared.as_ref() {
            for trace in &prepared.traces {
                trace.set_signal_index(index);
            }
        }
    }

    /// Index, among `inputs` (device paths), of the input this board follows.
    pub fn sync_candidate(&self, inputs: &[&str]) -> Option<usize> {
        self.core.lock().backend.sync_candidate(inputs)
    }

    /// Sample rate of the prepared run.
    pub fn prepared_rate(&self) -> Option<f64> {
        self.core.lock().prepared.as_ref().map(|p| p.plan.rate)
    }

    // =========================================================================
    // Consumers
    // =========================================================================

    /// Receives every block read by this input device.
    ///
    /// Batches are dropped, not queued, when the receiver lags `capacity`
    /// batches behind.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<SampleBatch> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.lock().push(tx);
        rx
    }

    /// Batches dropped because a subscriber was full.
    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches.load(Ordering::Relaxed)
    }

    /// Registers `observer` for descriptor changes.
    pub fn add_observer(&self, observer: Arc<dyn ConfigObserver>) {
        self.observers.write().push(observer);
    }

    /// Tells every observer that `sig` changed.
    pub fn notify_observers(&self, sig: &SignalDescriptor) {
        for observer in self.observers.read().iter() {
            observer.on_config_changed(sig);
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn wrong_direction(&self, operation: &str) -> DeviceError {
        DeviceError::NotSupported {
            device: self.ident.clone(),
            message: format!("{} on an {} device", operation, self.direction),
        }
    }

    fn fail(&self, core: &mut Core, err: &DeviceError) {
        {
            let mut guard = self.guard.lock();
            guard.status = Status::from_error(err);
            guard.error = Some(err.clone());
        }
        let text = format!("{} - {}", self.ident, err);
        if let Some(prepared) = core.prepared.as_ref() {
            for tag in &prepared.tags {
                tag.tag(err.flags(), &text);
            }
        }
        if let Err(stop_err) = core.backend.stop() {
            warn!(device = %self.ident, error = %stop_err, "Stop after failure failed");
        }
        error!(device = %self.ident, error = %err, kind = %err.kind(), "Streaming failed");
    }

    /// Hands the ring to the backend and, for output, primes the hardware.
    ///
    /// Returns the transfer side and whether the whole run already fits.
    fn launch_backend(&self, core: &mut Core) -> Result<(Side, bool)> {
        let Core {
            backend, prepared, ..
        } = core;
        let prepared = prepared.as_ref().ok_or_else(|| DeviceError::InvalidConfiguration {
            device: self.ident.clone(),
            failed: 0,
            message: "start without prepare".to_string(),
        })?;
        let (writer, reader) = ring_buffer(prepared.plan.ring_samples());

        match self.direction {
            Direction::Output => {
                let data = Arc::clone(&prepared.raw);
                let mut writer = writer;
                let mut cursor = 0;
                fill_output(&mut writer, &data, &mut cursor, prepared.continuous);
                backend.start(RingEnd::Output(reader))?;
                backend.transfer(Duration::ZERO)?;
                let complete = !prepared.continuous && cursor >= data.len() && writer.is_empty();
                Ok((
                    Side::Output {
                        writer,
                        data,
                        cursor,
                    },
                    complete,
                ))
            }
            Direction::Input => {
                backend.start(RingEnd::Input(writer))?;
                Ok((
                    Side::Input {
                        reader,
                        delivered: 0,
                        scratch: Vec::new(),
                    },
                    false,
                ))
            }
        }
    }

    fn write_block(&self, core: &mut Core, timeout: Duration) -> Result<usize> {
        let Core {
            backend,
            side,
            prepared,
            ..
        } = core;
        let (Some(Side::Output { writer, data, cursor }), Some(prepared)) = (side, prepared) else {
            return Ok(0);
        };
        let pushed = fill_output(writer, data, cursor, prepared.continuous);
        backend.transfer(timeout)?;
        Ok(pushed)
    }

    fn read_block(&self, core: &mut Core, timeout: Duration) -> Result<usize> {
        let Core {
            backend,
            side,
            prepared,
            ..
        } = core;
        let (
            Some(Side::Input {
                reader,
                delivered,
                scratch,
            }),
            Some(prepared),
        ) = (side, prepared)
        else {
            return Ok(0);
        };

        backend.transfer(timeout)?;

        let n_channels = prepared.scalings.len().max(1);
        let mut scans = reader.available() / n_channels;
        if let Some(total) = prepared.plan.scans {
            scans = scans.min((total as u64).saturating_sub(*delivered) as usize);
        }
        if scans == 0 {
            return Ok(0);
        }

        scratch.resize(scans * n_channels, 0);
        let n = reader.pop_into(scratch);
        let per_channel = demultiplex(&scratch[..n], &prepared.scalings);
        for (trace, samples) in prepared.traces.iter().zip(&per_channel) {
            trace.extend(samples);
        }

        let first_scan = *delivered;
        *delivered += (n / n_channels) as u64;
        self.publish(&per_channel, &prepared.plan, first_scan);
        Ok(n)
    }

    fn publish(&self, per_channel: &[Vec<f32>], plan: &ScanPlan, first_scan: u64) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        let scans = per_channel.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(scans * per_channel.len());
        for scan in 0..scans {
            data.extend(per_channel.iter().map(|c| c[scan]));
        }
        let batch = SampleBatch {
            data,
            channels: plan.channels.iter().map(|c| c.channel).collect(),
            first_scan,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: Instant::now(),
        };
        subscribers.retain(|tx| match tx.try_send(batch.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_batches.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

impl BlockTransfer for AnalogDevice {
    fn ident(&self) -> &str {
        &self.ident
    }

    /// Holds the hardware lock for the whole transfer: up to half an update
    /// interval of backend wait, plus any host stall the backend suffers.
    /// `status` does not wait for it; `stop`, `position` and `prepare` do.
    fn transfer_block(&self) -> Result<usize> {
        if self.interrupted() {
            return Ok(0);
        }
        let mut core = self.core.lock();
        if core.lifecycle != Lifecycle::Running {
            return Ok(0);
        }
        let timeout = core
            .prepared
            .as_ref()
            .map_or(Duration::ZERO, |p| (p.update_time / 2).max(Duration::from_millis(1)));

        let result = match self.direction {
            Direction::Output => self.write_block(&mut core, timeout),
            Direction::Input => self.read_block(&mut core, timeout),
        };
        if let Err(err) = &result {
            self.fail(&mut core, err);
        }
        result
    }

    fn no_more_data(&self) -> bool {
        AnalogDevice::no_more_data(self)
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for AnalogDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalogDevice")
            .field("ident", &self.ident)
            .field("direction", &self.direction)
            .field("driver_type", &self.driver_type)
            .finish()
    }
}

impl Drop for AnalogDevice {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        if core.lifecycle != Lifecycle::Closed {
            if core.lifecycle == Lifecycle::Running {
                if let Err(err) = core.backend.stop() {
                    error!(device = %self.ident, error = %err, "Failed to stop device on drop");
                }
            }
            core.backend.close();
        }
    }
}

/// Tops the ring up from `data`, wrapping around for continuous output.
fn fill_output(
    writer: &mut RingWriter,
    data: &[RawSample],
    cursor: &mut usize,
    continuous: bool,
) -> usize {
    let mut pushed = 0;
    while writer.free() > 0 {
        if *cursor >= data.len() {
            if continuous && !data.is_empty() {
                *cursor = 0;
            } else {
                break;
            }
        }
        let end = (*cursor + writer.free()).min(data.len());
        let n = writer.push_partial(&data[*cursor..end]);
        if n == 0 {
            break;
        }
        *cursor += n;
        pushed += n;
    }
    pushed
}

fn format_settings(sigs: &SignalList, plan: &ScanPlan) -> String {
    let channels = plan
        .channels
        .iter()
        .map(|c| c.channel.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let delay_ms = sigs.get(0).map_or(0.0, |s| s.delay() * 1000.0);
    format!(
        "channels: {};continuous: {};delay: {}ms;sampling rate: {}kHz",
        channels,
        if sigs.continuous() { "yes" } else { "no" },
        delay_ms,
        plan.rate * 0.001
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sim::{FaultKind, SimConfig, SimFaults, SimInput, SimMode, SimOutput};
    use std::sync::atomic::AtomicUsize;

    fn output_device() -> Arc<AnalogDevice> {
        let device = Arc::new(AnalogDevice::new(
            "ao-test",
            Box::new(SimOutput::new(SimConfig::default())),
        ));
        device.open("sim/ao0").unwrap();
        device
    }

    fn input_device() -> Arc<AnalogDevice> {
        let device = Arc::new(AnalogDevice::new(
            "ai-test",
            Box::new(SimInput::new(SimConfig::default())),
        ));
        device.open("sim/ai0").unwrap();
        device
    }

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i % 100) as f32 * 0.01).collect()
    }

    #[test]
    fn test_lifecycle_transitions() {
        let device = output_device();
        assert_eq!(device.lifecycle(), Lifecycle::Open);

        let mut sigs = SignalList::output()
            .with_signal(SignalDescriptor::new(0).with_sample_rate(1000.0).with_data(ramp(50)));
        device.prepare(&mut sigs).unwrap();
        assert_eq!(device.lifecycle(), Lifecycle::Prepared);
        assert!(sigs.get(0).unwrap().gain_index().is_some());
        assert!(device.settings().contains("sampling rate: 1kHz"));

        let outcome = device.start(None).unwrap();
        assert_eq!(outcome, StartOutcome::Complete);
        assert_eq!(device.lifecycle(), Lifecycle::Running);

        device.stop().unwrap();
        assert_eq!(device.lifecycle(), Lifecycle::Open);
        assert!(!device.settings().is_empty());

        device.reset().unwrap();
        assert!(device.settings().is_empty());
        device.close();
        assert_eq!(device.lifecycle(), Lifecycle::Closed);
    }

    #[test]
    fn test_start_requires_prepare() {
        let device = output_device();
        let err = device.start(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_prepare_rejects_invalid_list() {
        let device = output_device();
        let mut sigs = SignalList::output().with_signal(
            SignalDescriptor::new(99)
                .with_sample_rate(1000.0)
                .with_data(vec![0.0]),
        );
        let err = device.prepare(&mut sigs).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidConfiguration { failed: 1, .. }));
        assert_eq!(device.lifecycle(), Lifecycle::Open);
    }

    #[test]
    fn test_wrong_direction() {
        let device = output_device();
        let mut sigs = SignalList::input()
            .with_continuous(true)
            .with_signal(SignalDescriptor::new(0));
        assert_eq!(device.test(&mut sigs), 1);
        assert!(sigs
            .get(0)
            .unwrap()
            .errors()
            .flags()
            .contains(ErrorFlags::INVALID_CHANNEL_TYPE));
        assert_eq!(device.read_data().unwrap_err().kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn test_manual_output_streaming() {
        let device = Arc::new(AnalogDevice::new(
            "ao-small",
            Box::new(SimOutput::new(SimConfig::default().with_fifo_size(64))),
        ));
        device.open("sim/ao0").unwrap();

        let mut sigs = SignalList::output()
            .with_signal(SignalDescriptor::new(0).with_sample_rate(1000.0).with_data(ramp(1000)))
            .with_timing(crate::signal::StreamTiming::new(
                Duration::from_millis(100),
                Duration::from_millis(50),
            ));
        device.prepare(&mut sigs).unwrap();
        assert_eq!(device.start(None).unwrap(), StartOutcome::Streaming);

        let mut rounds = 0;
        while !device.no_more_data() {
            device.write_data().unwrap();
            rounds += 1;
            assert!(rounds < 10_000, "output never drained");
        }
        assert_eq!(device.status(), Status::Idle);
        assert_eq!(device.position(), 1000);
    }

    #[test]
    fn test_manual_input_exact_count() {
        let device = input_device();
        let mut sigs = SignalList::input()
            .with_duration(0.25)
            .with_signal(SignalDescriptor::new(0).with_sample_rate(1000.0))
            .with_signal(SignalDescriptor::new(1).with_sample_rate(1000.0));
        device.prepare(&mut sigs).unwrap();
        device.start(None).unwrap();

        let mut rounds = 0;
        while !device.no_more_data() {
            device.read_data().unwrap();
            rounds += 1;
            assert!(rounds < 10_000, "input never completed");
        }
        assert_eq!(sigs.get(0).unwrap().trace().len(), 250);
        assert_eq!(sigs.get(1).unwrap().trace().len(), 250);
        assert_eq!(device.status(), Status::Idle);
    }

    #[test]
    fn test_subscribers_receive_batches() {
        let device = input_device();
        let mut rx = device.subscribe(64);
        let mut sigs = SignalList::input()
            .with_duration(0.1)
            .with_signal(SignalDescriptor::new(2).with_sample_rate(1000.0));
        device.prepare(&mut sigs).unwrap();
        device.start(None).unwrap();
        while !device.no_more_data() {
            device.read_data().unwrap();
        }

        let mut scans = 0;
        let mut next_scan = 0;
        while let Ok(batch) = rx.try_recv() {
            assert_eq!(batch.channels, vec![2]);
            assert_eq!(batch.first_scan, next_scan);
            next_scan += batch.n_scans() as u64;
            scans += batch.n_scans();
        }
        assert_eq!(scans, 100);
        assert_eq!(device.dropped_batches(), 0);
    }

    #[test]
    fn test_observers_notified_on_prepare() {
        struct Count(AtomicUsize);
        impl ConfigObserver for Count {
            fn on_config_changed(&self, descriptor: &SignalDescriptor) {
                assert!(descriptor.gain_index().is_some());
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let device = output_device();
        let observer = Arc::new(Count(AtomicUsize::new(0)));
        device.add_observer(observer.clone());

        let mut sigs = SignalList::output()
            .with_signal(SignalDescriptor::new(0).with_data(vec![0.1]))
            .with_signal(SignalDescriptor::new(1).with_data(vec![0.2]));
        device.prepare(&mut sigs).unwrap();
        assert_eq!(observer.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_info_string() {
        let device = output_device();
        let info = device.info();
        assert!(info.starts_with("channels: 4;bits: 16;"));
        assert!(info.contains("max sampling rate:"));
    }

    #[test]
    fn test_failed_first_transfer_stops_board() {
        let device = Arc::new(AnalogDevice::new(
            "ao-fault",
            Box::new(SimOutput::new(
                SimConfig::default()
                    .with_mode(SimMode::Realistic)
                    .with_faults(SimFaults::fail_after(0, FaultKind::WriteError)),
            )),
        ));
        device.open("sim/ao0").unwrap();
        let mut sigs = SignalList::output()
            .with_signal(SignalDescriptor::new(0).with_sample_rate(1000.0).with_data(ramp(500)));
        device.prepare(&mut sigs).unwrap();

        let done = Completion::new();
        let err = device.start(Some(&done)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteError);
        assert_eq!(device.status(), Status::UnknownError);
        assert_eq!(device.lifecycle(), Lifecycle::Open);
        assert_eq!(device.error(), Some(err));
        assert!(sigs.get(0).unwrap().errors().flags().contains(ErrorFlags::DEVICE_ERROR));
        assert!(sigs.get(0).unwrap().error_text().contains("ao-fault - "));
        assert_eq!(done.available(), 0);

        let position = device.position();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(device.position(), position, "board kept converting");

        device.stop().unwrap();
        assert_eq!(device.status(), Status::UnknownError);
        device.reset().unwrap();
        assert_eq!(device.status(), Status::Idle);
        device.prepare(&mut sigs).unwrap();
        assert_eq!(device.lifecycle(), Lifecycle::Prepared);
    }

    #[test]
    fn test_prepare_on_running_device_needs_priority() {
        let device = input_device();
        let mut running = SignalList::input()
            .with_continuous(true)
            .with_signal(SignalDescriptor::new(0).with_sample_rate(1000.0));
        device.prepare(&mut running).unwrap();
        device.start(None).unwrap();
        assert_eq!(device.status(), Status::Running);

        let mut plain = SignalList::input()
            .with_duration(0.1)
            .with_signal(SignalDescriptor::new(1).with_sample_rate(1000.0));
        let err = device.prepare(&mut plain).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(plain.get(0).unwrap().errors().flags().contains(ErrorFlags::BUSY));
        assert_eq!(device.lifecycle(), Lifecycle::Running);

        let mut urgent = SignalList::input()
            .with_duration(0.1)
            .with_priority(true)
            .with_signal(SignalDescriptor::new(1).with_sample_rate(1000.0));
        device.prepare(&mut urgent).unwrap();
        assert!(urgent.success());
        assert_eq!(device.lifecycle(), Lifecycle::Prepared);
        assert_eq!(device.status(), Status::Idle);
    }

    #[test]
    fn test_realistic_input_continuous_until_stopped() {
        let device = Arc::new(AnalogDevice::new(
            "ai-rt",
            Box::new(SimInput::new(SimConfig::default().with_mode(SimMode::Realistic))),
        ));
        device.open("sim/ai0").unwrap();
        let mut sigs = SignalList::input()
            .with_continuous(true)
            .with_timing(crate::signal::StreamTiming::new(
                Duration::from_millis(100),
                Duration::from_millis(10),
            ))
            .with_signal(SignalDescriptor::new(0).with_sample_rate(1000.0));
        device.prepare(&mut sigs).unwrap();

        let done = Completion::new();
        device.start(Some(&done)).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(device.status(), Status::Running);
        device.stop().unwrap();

        let reports = done.acquire(1, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(reports[0].exit, crate::pump::PumpExit::Interrupted);
        assert!(sigs.get(0).unwrap().trace().len() > 20);
        assert_eq!(device.status(), Status::Idle);
    }
}
