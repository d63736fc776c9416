//! Trial orchestration across input and output devices.
//!
//! [`Acquire`] sequences `open → test → prepare → start → wait → stop/reset`
//! over every device taking part in a trial:
//!
//! 1. [`start_read`](Acquire::start_read) prepares and starts the input devices.
//! 2. [`start_write`](Acquire::start_write) negotiates the start order of all
//!    devices, applies inherited sample rates, prepares every output and then
//!    issues the start commands in order. Right before an output starts, the
//!    position of its reference input is recorded as the *signal start index*,
//!    both on the output device and on every trace of that input.
//! 3. [`wait`](Acquire::wait) blocks until every finite run has completed, a
//!    run fails, or a stop is requested.
//!
//! Signal lists are matched to devices by position: `lists[i]` belongs to the
//! `i`-th input (or output) added. Devices without a list sit the trial out.
//!
//! Device indices in [`SyncRequest`]s are inputs first (`0..n_inputs`), then
//! outputs.

use crate::config::{AcquireConfig, DeviceConfig};
use crate::device::{AnalogDevice, StartOutcome};
use crate::error::{DeviceError, ErrorFlags, Status};
use crate::pump::{Completion, PumpExit, PumpReport};
use crate::registry::DeviceRegistry;
use crate::signal::{Direction, RateSource, SignalList, StreamTiming};
use crate::sync::{negotiate, SyncError, SyncMode, SyncPlan, SyncRequest};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Orchestration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcquireError {
    /// A device operation failed
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Start order could not be negotiated
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// A device refused its signal list
    #[error("{failed} signal(s) rejected by '{device}': {message}")]
    Rejected {
        /// Device ident
        device: String,
        /// Descriptors in error
        failed: usize,
        /// Joined error texts
        message: String,
    },

    /// A declared start source is not among the inputs
    #[error("Start source '{source_ident}' of '{device}' is not an input of this trial")]
    UnknownStartSource {
        /// Output device ident
        device: String,
        /// Declared start source
        source_ident: String,
    },

    /// An output depends on a master that has not been started
    #[error("Start source of '{device}' is not running")]
    MasterNotRunning {
        /// Output device ident
        device: String,
    },

    /// A run ended with an error
    #[error("Streaming on '{device}' failed: {error}")]
    Failed {
        /// Device ident
        device: String,
        /// Error that stopped the run
        error: DeviceError,
    },

    /// A run was stopped on request
    #[error("Trial interrupted on '{device}'")]
    Interrupted {
        /// Device ident
        device: String,
    },

    /// `wait` ran out of time
    #[error("Trial did not complete within {0:?}")]
    Timeout(Duration),

    /// A board vanished; `open` must succeed before the next trial
    #[error("Session is unusable: {0}")]
    Fatal(DeviceError),
}

/// Start coupling declared for an output device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputSync {
    /// Ident of the input device whose start trigger starts this output
    pub start_source: Option<String>,
    /// Run at the start source's sample rate
    pub inherit_rate: bool,
    /// Ask the backend for a start source when none is named
    pub auto_discover: bool,
}

impl OutputSync {
    /// Free-running output.
    pub fn none() -> Self {
        Self::default()
    }

    /// Output started by the trigger of input `input`.
    pub fn triggered_by(input: impl Into<String>, inherit_rate: bool) -> Self {
        Self {
            start_source: Some(input.into()),
            inherit_rate,
            auto_discover: false,
        }
    }

    /// Output whose start source the backend proposes.
    pub fn discover(inherit_rate: bool) -> Self {
        Self {
            start_source: None,
            inherit_rate,
            auto_discover: true,
        }
    }

    /// Declaration from a device's `start_source` and `inherit_rate` keys.
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            start_source: config.start_source.clone(),
            inherit_rate: config.inherit_rate,
            auto_discover: false,
        }
    }
}

struct Slot {
    device: Arc<AnalogDevice>,
    path: String,
}

struct OutputSlot {
    slot: Slot,
    sync: OutputSync,
}

/// Cloneable handle that interrupts a running trial from another thread.
#[derive(Clone)]
pub struct StopHandle {
    devices: Vec<Arc<AnalogDevice>>,
}

impl StopHandle {
    /// Asks every device of the trial to stop.
    pub fn request_stop(&self) {
        for device in &self.devices {
            device.request_stop();
        }
    }
}

#[derive(Default)]
struct TrialState {
    /// Pumped finite runs that have not reported yet
    waiting: HashSet<String>,
    /// Devices started without a pump
    unpumped: Vec<Arc<AnalogDevice>>,
    signal_index: Option<u64>,
    mode: Option<SyncMode>,
}

/// Orchestrator of one trial at a time.
pub struct Acquire {
    inputs: Vec<Slot>,
    outputs: Vec<OutputSlot>,
    completion: Completion,
    timing: StreamTiming,
    state: Mutex<TrialState>,
    fatal: Mutex<Option<DeviceError>>,
}

impl Default for Acquire {
    fn default() -> Self {
        Self::new(StreamTiming::default())
    }
}

impl Acquire {
    /// Empty orchestrator using `timing` for every list.
    pub fn new(timing: StreamTiming) -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            completion: Completion::new(),
            timing,
            state: Mutex::new(TrialState::default()),
            fatal: Mutex::new(None),
        }
    }

    /// Takes every device of `registry`, with the sync declarations of its
    /// configuration.
    pub fn from_registry(registry: &DeviceRegistry, config: &AcquireConfig) -> Self {
        let mut acquire = Self::new(config.timing());
        for device in registry.inputs() {
            acquire.add_input(device);
        }
        for device in registry.outputs() {
            let sync = registry
                .config(device.ident())
                .map(OutputSync::from_config)
                .unwrap_or_default();
            acquire.add_output(device, sync);
        }
        acquire
    }

    /// Adds an input device and returns its index among the inputs.
    pub fn add_input(&mut self, device: Arc<AnalogDevice>) -> usize {
        let path = device.path();
        self.inputs.push(Slot { device, path });
        self.inputs.len() - 1
    }

    /// Adds an output device and returns its index among the outputs.
    pub fn add_output(&mut self, device: Arc<AnalogDevice>, sync: OutputSync) -> usize {
        let path = device.path();
        self.outputs.push(OutputSlot {
            slot: Slot { device, path },
            sync,
        });
        self.outputs.len() - 1
    }

    /// Timing applied to every list.
    pub fn timing(&self) -> StreamTiming {
        self.timing
    }

    /// Timing applied to every signal list started through this orchestrator.
    pub fn set_timing(&mut self, timing: StreamTiming) {
        self.timing = timing;
    }

    /// `index`-th input device.
    pub fn input(&self, index: usize) -> Option<&Arc<AnalogDevice>> {
        self.inputs.get(index).map(|s| &s.device)
    }

    /// `index`-th output device.
    pub fn output(&self, index: usize) -> Option<&Arc<AnalogDevice>> {
        self.outputs.get(index).map(|s| &s.slot.device)
    }

    /// Handle for stopping the trial from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            devices: self.devices().cloned().collect(),
        }
    }

    fn devices(&self) -> impl Iterator<Item = &Arc<AnalogDevice>> {
        self.inputs
            .iter()
            .map(|s| &s.device)
            .chain(self.outputs.iter().map(|s| &s.slot.device))
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Reopens closed devices; a vanished board makes the session fatal.
    pub fn open(&self) -> Result<(), AcquireError> {
        let slots = self
            .inputs
            .iter()
            .chain(self.outputs.iter().map(|s| &s.slot));
        for slot in slots {
            if slot.device.is_open() {
                continue;
            }
            if let Err(err) = slot.device.open(&slot.path) {
                if err.is_session_fatal() {
                    error!(device = %slot.device.ident(), error = %err, "Device lost");
                    *self.fatal.lock() = Some(err.clone());
                    return Err(AcquireError::Fatal(err));
                }
                return Err(err.into());
            }
        }
        *self.fatal.lock() = None;
        Ok(())
    }

    /// Whether a session-fatal error has been seen since the last successful `open`.
    pub fn is_fatal(&self) -> bool {
        self.fatal.lock().is_some()
    }

    /// The session-fatal error, if any.
    pub fn fatal_error(&self) -> Option<DeviceError> {
        self.fatal.lock().clone()
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Validates input lists; returns the number of descriptors in error.
    pub fn test_read(&self, lists: &mut [SignalList]) -> usize {
        test_lists(self.inputs.iter(), lists, self.timing)
    }

    /// Validates output lists; returns the number of descriptors in error.
    ///
    /// Lists that inherit their rate are checked at the master's current rate.
    pub fn test_write(&self, lists: &mut [SignalList]) -> usize {
        for (slot, list) in self.outputs.iter().zip(lists.iter_mut()) {
            let master = self.output_master(slot, list);
            if let Some(rate) = master.and_then(|m| self.inputs.get(m)).and_then(|s| s.device.prepared_rate()) {
                if slot.sync.inherit_rate || matches!(list.rate_source(), RateSource::Inherit { .. }) {
                    list.set_sample_rate(rate);
                }
            }
        }
        test_lists(self.outputs.iter().map(|s| &s.slot), lists, self.timing)
    }

    // =========================================================================
    // Trial
    // =========================================================================

    /// Prepares and starts every input device that has a list.
    pub fn start_read(&self, lists: &mut [SignalList]) -> Result<(), AcquireError> {
        self.check_fatal()?;
        let used: Vec<usize> = (0..self.inputs.len().min(lists.len())).collect();
        for &i in &used {
            let list = &mut lists[i];
            list.set_timing(self.timing);
            self.prepare(&self.inputs[i].device, list)?;
        }
        for &i in &used {
            let device = &self.inputs[i].device;
            let continuous = lists[i].continuous();
            self.launch(device, continuous)?;
        }
        info!(inputs = used.len(), "Started acquisition");
        Ok(())
    }

    /// Negotiates, prepares and starts every output device that has a list.
    pub fn start_write(&self, lists: &mut [SignalList]) -> Result<(), AcquireError> {
        self.check_fatal()?;
        let n_inputs = self.inputs.len();
        let used = self.outputs.len().min(lists.len());

        let mut requests: Vec<SyncRequest> = (0..n_inputs)
            .map(|i| SyncRequest::new(i, Direction::Input))
            .collect();
        for (j, slot) in self.outputs.iter().take(used).enumerate() {
            let list = &lists[j];
            let mut request = SyncRequest::new(n_inputs + j, Direction::Output);
            request.start_source = self.output_master(slot, list);
            request.inherit_rate =
                slot.sync.inherit_rate || matches!(list.rate_source(), RateSource::Inherit { .. });
            if slot.sync.start_source.is_some() && request.start_source.is_none() {
                return Err(AcquireError::UnknownStartSource {
                    device: slot.slot.device.ident().to_string(),
                    source_ident: slot.sync.start_source.clone().unwrap_or_default(),
                });
            }
            requests.push(request);
        }

        let plan = negotiate(&requests)?;
        debug!(mode = %plan.mode(), order = ?plan.pairs(), "Start plan");

        // Prepare in start order so inherited rates are known.
        for slot in plan.order() {
            let Some(j) = slot.device_index.checked_sub(n_inputs) else {
                continue;
            };
            let device = &self.outputs[j].slot.device;
            let list = &mut lists[j];
            list.set_timing(self.timing);
            if slot.use_master_rate {
                self.inherit_rate(&plan, n_inputs + j, device, list)?;
            }
            self.prepare(device, list)?;
        }

        for slot in plan.order() {
            let Some(j) = slot.device_index.checked_sub(n_inputs) else {
                continue;
            };
            let device = &self.outputs[j].slot.device;
            let reference = self.reference_input(&plan, n_inputs + j);
            if let Some(input) = reference {
                if self.inputs[input].device.status() != Status::Running
                    && plan.master_of(n_inputs + j).is_some()
                {
                    return Err(AcquireError::MasterNotRunning {
                        device: device.ident().to_string(),
                    });
                }
            }

            let index = reference.map(|i| self.inputs[i].device.position());
            let continuous = lists[j].continuous();
            self.launch(device, continuous)?;

            if let (Some(input), Some(index)) = (reference, index) {
                device.set_index(index as i64);
                self.inputs[input].device.mark_signal_start(index);
                self.state.lock().signal_index = Some(index);
                debug!(
                    device = %device.ident(),
                    input = %self.inputs[input].device.ident(),
                    index,
                    "Recorded signal start"
                );
            }
        }

        self.state.lock().mode = Some(plan.mode());
        info!(outputs = used, mode = %plan.mode(), "Started output");
        Ok(())
    }

    /// Blocks until every finite run is complete, a run fails or is stopped,
    /// or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<Vec<PumpReport>, AcquireError> {
        let deadline = Instant::now() + timeout;
        let mut reports = Vec::new();

        loop {
            if self.state.lock().waiting.is_empty() {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(batch) = self.completion.acquire(1, Some(remaining)) else {
                warn!(timeout_ms = timeout.as_millis() as u64, "Trial wait timed out");
                return Err(AcquireError::Timeout(timeout));
            };
            for report in batch {
                let awaited = self.state.lock().waiting.remove(&report.device);
                if !awaited && report.exit == PumpExit::Interrupted {
                    continue;
                }
                self.check_report(&report)?;
                reports.push(report);
            }
        }

        let unpumped = self.state.lock().unpumped.clone();
        let poll = (self.timing.update_time / 4).max(Duration::from_millis(1));
        for device in unpumped {
            loop {
                self.check_late_reports(&mut reports)?;
                match device.status() {
                    Status::Running => {}
                    Status::Idle => break,
                    _ => {
                        let error = device.error().unwrap_or_else(|| DeviceError::Unknown {
                            device: device.ident().to_string(),
                            message: device.error_text(),
                        });
                        return Err(AcquireError::Failed {
                            device: device.ident().to_string(),
                            error,
                        });
                    }
                }
                if Instant::now() >= deadline {
                    return Err(AcquireError::Timeout(timeout));
                }
                thread::sleep(poll);
            }
        }

        self.check_late_reports(&mut reports)?;
        Ok(reports)
    }

    /// Collects reports of pumps that were not awaited, failing on any error.
    ///
    /// Interrupted reports of continuous runs are dropped.
    fn check_late_reports(&self, reports: &mut Vec<PumpReport>) -> Result<(), AcquireError> {
        while let Some(batch) = self.completion.try_acquire(1) {
            for report in batch {
                if report.exit == PumpExit::Interrupted {
                    continue;
                }
                self.check_report(&report)?;
                reports.push(report);
            }
        }
        Ok(())
    }

    /// Interrupts every running device; pumps exit within one update interval.
    pub fn request_stop(&self) {
        for device in self.devices() {
            device.request_stop();
        }
    }

    /// Stops every device, keeping prepared buffers.
    pub fn stop(&self) -> Result<(), AcquireError> {
        self.request_stop();
        let mut first = None;
        for device in self.devices() {
            if let Err(err) = device.stop() {
                warn!(device = %device.ident(), error = %err, "Stop failed");
                first.get_or_insert(err);
            }
        }
        // Every pump has been joined, so all of its reports are in.
        self.completion.drain();
        let mut state = self.state.lock();
        state.waiting.clear();
        state.unpumped.clear();
        drop(state);
        first.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Stops and resets every device, ready for a fresh trial.
    pub fn reset(&self) -> Result<(), AcquireError> {
        let stopped = self.stop();
        let mut first = None;
        for device in self.devices() {
            if let Err(err) = device.reset() {
                first.get_or_insert(err);
            }
        }
        *self.state.lock() = TrialState::default();
        stopped?;
        first.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Running while any device runs, else the first sticky failure, else Idle.
    pub fn status(&self) -> Status {
        let statuses: Vec<Status> = self.devices().map(|d| d.status()).collect();
        if statuses.contains(&Status::Running) {
            Status::Running
        } else {
            statuses
                .into_iter()
                .find(|s| s.is_sticky())
                .unwrap_or(Status::Idle)
        }
    }

    /// `(ident, status)` of every device.
    pub fn statuses(&self) -> Vec<(String, Status)> {
        self.devices()
            .map(|d| (d.ident().to_string(), d.status()))
            .collect()
    }

    /// Input sample index at which the last output started.
    pub fn signal_index(&self) -> Option<u64> {
        self.state.lock().signal_index
    }

    /// Coupling of the last started output trial.
    pub fn sync_mode(&self) -> Option<SyncMode> {
        self.state.lock().mode
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn check_fatal(&self) -> Result<(), AcquireError> {
        match self.fatal.lock().as_ref() {
            Some(err) => Err(AcquireError::Fatal(err.clone())),
            None => Ok(()),
        }
    }

    fn prepare(&self, device: &AnalogDevice, list: &mut SignalList) -> Result<(), AcquireError> {
        match device.prepare(list) {
            Ok(()) => Ok(()),
            Err(DeviceError::InvalidConfiguration {
                device,
                failed,
                message,
            }) => Err(AcquireError::Rejected {
                device,
                failed,
                message,
            }),
            Err(err) => Err(self.record(err)),
        }
    }

    fn launch(&self, device: &Arc<AnalogDevice>, continuous: bool) -> Result<(), AcquireError> {
        let outcome = device
            .start(Some(&self.completion))
            .map_err(|err| self.record(err))?;
        let mut state = self.state.lock();
        match outcome {
            StartOutcome::Complete => state.unpumped.push(Arc::clone(device)),
            StartOutcome::Streaming if !continuous => {
                state.waiting.insert(device.ident().to_string());
            }
            StartOutcome::Streaming => {}
        }
        Ok(())
    }

    fn record(&self, err: DeviceError) -> AcquireError {
        if err.is_session_fatal() {
            *self.fatal.lock() = Some(err.clone());
            return AcquireError::Fatal(err);
        }
        err.into()
    }

    fn check_report(&self, report: &PumpReport) -> Result<(), AcquireError> {
        match &report.exit {
            PumpExit::Finished => Ok(()),
            PumpExit::Interrupted => Err(AcquireError::Interrupted {
                device: report.device.clone(),
            }),
            PumpExit::Failed(err) => {
                if err.is_session_fatal() {
                    *self.fatal.lock() = Some(err.clone());
                }
                Err(AcquireError::Failed {
                    device: report.device.clone(),
                    error: err.clone(),
                })
            }
        }
    }

    /// Input index an output is triggered by, if any.
    fn output_master(&self, slot: &OutputSlot, list: &SignalList) -> Option<usize> {
        if let Some(ident) = &slot.sync.start_source {
            return self.inputs.iter().position(|s| s.device.ident() == ident);
        }
        if let RateSource::Inherit { master } = list.rate_source() {
            return Some(master);
        }
        if slot.sync.auto_discover {
            let paths: Vec<&str> = self.inputs.iter().map(|s| s.path.as_str()).collect();
            return slot.slot.device.sync_candidate(&paths);
        }
        None
    }

    /// Input whose stream the start of `device_index` is indexed against.
    fn reference_input(&self, plan: &SyncPlan, device_index: usize) -> Option<usize> {
        let n_inputs = self.inputs.len();
        let mut current = device_index;
        while let Some(master) = plan.master_of(current) {
            if master < n_inputs {
                return Some(master);
            }
            current = master;
        }
        self.inputs
            .iter()
            .position(|s| s.device.status() == Status::Running)
    }

    fn inherit_rate(
        &self,
        plan: &SyncPlan,
        device_index: usize,
        device: &AnalogDevice,
        list: &mut SignalList,
    ) -> Result<(), AcquireError> {
        let n_inputs = self.inputs.len();
        let master = plan.master_of(device_index);
        let rate = master.and_then(|m| {
            if m < n_inputs {
                self.inputs[m].device.prepared_rate()
            } else {
                self.outputs.get(m - n_inputs).and_then(|s| s.slot.device.prepared_rate())
            }
        });
        let (Some(master), Some(rate)) = (master, rate) else {
            return Err(AcquireError::MasterNotRunning {
                device: device.ident().to_string(),
            });
        };

        list.set_sample_rate(rate);
        if master < n_inputs {
            list.set_rate_source(RateSource::Inherit { master });
        }
        for sig in list.iter() {
            device.notify_observers(sig);
        }
        debug!(device = %device.ident(), rate, master, "Inherited sample rate");
        Ok(())
    }
}

fn test_lists<'a>(
    slots: impl Iterator<Item = &'a Slot>,
    lists: &mut [SignalList],
    timing: StreamTiming,
) -> usize {
    let mut failed = 0;
    let mut slots = slots;
    for list in lists.iter_mut() {
        list.set_timing(timing);
        match slots.next() {
            Some(slot) => failed += slot.device.test(list),
            None => {
                list.clear_errors();
                list.add_error(ErrorFlags::NO_DEVICE);
                failed += list.len().max(1);
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalDescriptor;
    use crate::sim::{SimConfig, SimInput, SimOutput};

    fn sim_device(ident: &str, path: &str, direction: Direction) -> Arc<AnalogDevice> {
        let backend: Box<dyn crate::device::Backend> = match direction {
            Direction::Input => Box::new(SimInput::new(SimConfig::default())),
            Direction::Output => Box::new(SimOutput::new(SimConfig::default())),
        };
        let device = Arc::new(AnalogDevice::new(ident, backend));
        device.open(path).unwrap();
        device
    }

    fn timing() -> StreamTiming {
        StreamTiming::new(Duration::from_millis(200), Duration::from_millis(10))
    }

    #[test]
    fn test_finite_input_trial() {
        let mut acquire = Acquire::new(timing());
        acquire.add_input(sim_device("ai", "sim/ai0", Direction::Input));

        let mut lists = vec![SignalList::input()
            .with_duration(0.1)
            .with_signal(SignalDescriptor::new(0).with_sample_rate(1000.0))];
        assert_eq!(acquire.test_read(&mut lists), 0);
        acquire.start_read(&mut lists).unwrap();

        let reports = acquire.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(lists[0].get(0).unwrap().trace().len(), 100);
        assert_eq!(acquire.status(), Status::Idle);
        acquire.reset().unwrap();
    }

    #[test]
    fn test_missing_device_flags_list() {
        let acquire = Acquire::new(timing());
        let mut lists = vec![SignalList::output().with_signal(SignalDescriptor::new(0))];
        assert_eq!(acquire.test_write(&mut lists), 1);
        assert!(lists[0]
            .get(0)
            .unwrap()
            .errors()
            .flags()
            .contains(ErrorFlags::NO_DEVICE));
    }

    #[test]
    fn test_rejected_list_is_reported() {
        let mut acquire = Acquire::new(timing());
        acquire.add_output(sim_device("ao", "sim/ao0", Direction::Output), OutputSync::none());
        let mut lists = vec![SignalList::output().with_signal(SignalDescriptor::new(9).with_data(vec![0.0]))];
        assert!(matches!(
            acquire.start_write(&mut lists),
            Err(AcquireError::Rejected { failed: 1, .. })
        ));
    }

    #[test]
    fn test_unknown_start_source() {
        let mut acquire = Acquire::new(timing());
        acquire.add_output(
            sim_device("ao", "sim/ao0", Direction::Output),
            OutputSync::triggered_by("nowhere", false),
        );
        let mut lists = vec![SignalList::output().with_signal(SignalDescriptor::new(0).with_data(vec![0.0]))];
        assert!(matches!(
            acquire.start_write(&mut lists),
            Err(AcquireError::UnknownStartSource { .. })
        ));
    }

    #[test]
    fn test_discovered_master_and_rate_inheritance() {
        let mut acquire = Acquire::new(timing());
        acquire.add_input(sim_device("ai0", "sim/ai0", Direction::Input));
        acquire.add_input(sim_device("ai1", "sim/ai1", Direction::Input));
        acquire.add_output(sim_device("ao", "sim/ao1", Direction::Output), OutputSync::discover(true));

        let mut inputs = vec![
            SignalList::input()
                .with_continuous(true)
                .with_signal(SignalDescriptor::new(0).with_sample_rate(1000.0)),
            SignalList::input()
                .with_continuous(true)
                .with_signal(SignalDescriptor::new(0).with_sample_rate(2000.0)),
        ];
        acquire.start_read(&mut inputs).unwrap();

        let mut outputs = vec![SignalList::output()
            .with_signal(SignalDescriptor::new(0).with_sample_rate(500.0).with_data(vec![0.1; 50]))];
        acquire.start_write(&mut outputs).unwrap();

        assert_eq!(outputs[0].sample_rate(), Some(2000.0));
        assert_eq!(outputs[0].rate_source(), RateSource::Inherit { master: 1 });
        assert_eq!(acquire.sync_mode(), Some(SyncMode::AiSync));
        assert!(acquire.signal_index().is_some());
        assert_eq!(
            inputs[1].get(0).unwrap().trace().signal_index(),
            acquire.signal_index()
        );
        assert_eq!(inputs[0].get(0).unwrap().trace().signal_index(), None);

        acquire.stop().unwrap();
        acquire.reset().unwrap();
        assert_eq!(acquire.signal_index(), None);
    }

    #[test]
    fn test_fatal_open_failure() {
        let device = Arc::new(AnalogDevice::new(
            "ai",
            Box::new(SimInput::new(
                SimConfig::default().with_faults(crate::sim::SimFaults::fail_open()),
            )),
        ));
        let mut acquire = Acquire::new(timing());
        acquire.add_input(device);
        assert!(matches!(acquire.open(), Err(AcquireError::Fatal(_))));
        assert!(acquire.is_fatal());

        let mut lists = vec![SignalList::input().with_continuous(true).with_signal(SignalDescriptor::new(0))];
        assert!(matches!(acquire.start_read(&mut lists), Err(AcquireError::Fatal(_))));
    }
}
