//! # DAQ Stream Core Library
//!
//! Real-time analog input/output streaming for data acquisition boards, with
//! start synchronization across several boards.
//!
//! ## Crate Structure
//!
//! - **`device`**: `AnalogDevice`, the per-board state machine
//!   (`open → test → prepare → start → stop/reset`) on top of a [`device::Backend`].
//! - **`pump`**: the per-device streaming thread and the `Completion` semaphore
//!   it releases when a run ends.
//! - **`ring`**: the single-producer/single-consumer sample ring between a
//!   device and its hardware.
//! - **`signal`**: signal descriptors and signal lists, the unit of a trial request.
//! - **`sample`**: trace buffers and the sample batches published to subscribers.
//! - **`sync`**: start-order negotiation between devices that trigger each other.
//! - **`acquire`**: the `Acquire` orchestrator running a trial over many devices.
//! - **`sim`**: simulated input and output boards with fault injection.
//! - **`registry`**: explicit registry of backend factories and open devices.
//! - **`config`**: layered TOML/environment configuration (`figment`).
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: `DeviceError`, error flags and device status.
//!
//! ## Example
//!
//! ```rust
//! use daq_stream::acquire::Acquire;
//! use daq_stream::device::AnalogDevice;
//! use daq_stream::signal::{SignalDescriptor, SignalList, StreamTiming};
//! use daq_stream::sim::{SimConfig, SimInput};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let ai = Arc::new(AnalogDevice::new("ai", Box::new(SimInput::new(SimConfig::default()))));
//! ai.open("sim/ai0").unwrap();
//!
//! let mut acquire = Acquire::new(StreamTiming::new(
//!     Duration::from_millis(200),
//!     Duration::from_millis(10),
//! ));
//! acquire.add_input(ai);
//!
//! let mut lists = vec![SignalList::input()
//!     .with_duration(0.05)
//!     .with_signal(SignalDescriptor::new(0).with_sample_rate(1000.0))];
//! acquire.start_read(&mut lists).unwrap();
//! acquire.wait(Duration::from_secs(5)).unwrap();
//!
//! assert_eq!(lists[0].get(0).unwrap().trace().len(), 50);
//! ```

pub mod acquire;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod pump;
pub mod registry;
pub mod ring;
pub mod sample;
pub mod signal;
pub mod sim;
pub mod sync;

pub use acquire::{Acquire, AcquireError, OutputSync, StopHandle};
pub use device::{AnalogDevice, Lifecycle, StartOutcome};
pub use error::{DeviceError, ErrorFlags, ErrorKind, Status};
pub use signal::{Direction, RateSource, Reference, SignalDescriptor, SignalList, StreamTiming};
pub use sync::{negotiate, SyncError, SyncMode, SyncPlan, SyncRequest};
