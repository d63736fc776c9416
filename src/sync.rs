//! Start ordering and rate inheritance across devices.
//!
//! Every device taking part in a trial files a [`SyncRequest`]. A request may
//! name a *start source*: the device whose start trigger this board's start
//! line is wired to. The negotiator turns the requests into a [`SyncPlan`]:
//!
//! - one [`TriggerBinding`] per declared start source,
//! - a start order in which every master precedes all of its dependents,
//! - per device, whether it must run at its master's sample rate.
//!
//! # Architecture
//!
//! Requests form a directed graph `dependent → master` with at most one edge
//! per dependent. The start order is a topological order of that graph that
//! keeps the request order wherever the graph leaves freedom, so a trial
//! without bindings starts its devices in the order they were added.
//!
//! Rejected configurations:
//! - a start source that is not part of the trial,
//! - a device naming itself as start source,
//! - cycles,
//! - dependents of one master that disagree on rate inheritance.
//!
//! # Example
//!
//! ```rust
//! use daq_stream::signal::Direction;
//! use daq_stream::sync::{negotiate, SyncMode, SyncRequest};
//!
//! let plan = negotiate(&[
//!     SyncRequest::new(1, Direction::Output).with_start_source(0).with_inherit_rate(true),
//!     SyncRequest::new(0, Direction::Input),
//! ])
//! .unwrap();
//!
//! assert_eq!(plan.mode(), SyncMode::AiSync);
//! assert_eq!(plan.pairs(), vec![(0, false), (1, true)]);
//! ```

use crate::signal::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Errors rejected at negotiation time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A device index appears twice
    #[error("device {device} is listed more than once")]
    DuplicateDevice {
        /// Device index
        device: usize,
    },

    /// A start source is not among the requests
    #[error("device {dependent} names unknown start source {master}")]
    UnknownMaster {
        /// Declaring device
        dependent: usize,
        /// Missing start source
        master: usize,
    },

    /// A device triggers itself
    #[error("device {device} names itself as start source")]
    SelfDependency {
        /// Device index
        device: usize,
    },

    /// Rate inheritance without a start source
    #[error("device {device} inherits a sample rate but has no start source")]
    NoMaster {
        /// Device index
        device: usize,
    },

    /// Start sources form a cycle
    #[error("start sources form a cycle through devices {devices:?}")]
    Cycle {
        /// Devices on the cycle
        devices: Vec<usize>,
    },

    /// Dependents of one master mix shared and own rates
    #[error("dependents of device {master} disagree on rate inheritance: {sharing:?} share, {own:?} keep their own rate")]
    ConflictingRateInheritance {
        /// Common start source
        master: usize,
        /// Dependents inheriting the master's rate
        sharing: Vec<usize>,
        /// Dependents keeping their own rate
        own: Vec<usize>,
    },
}

/// How the devices of a trial are coupled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// A single device, nothing to coordinate
    NoSync,
    /// Several devices started back to back without trigger wiring
    StartSync,
    /// Dependents start on their master's trigger at their own rate
    TriggerSync,
    /// Dependents start on their master's trigger and share its clock rate
    AiSync,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncMode::NoSync => "no sync",
            SyncMode::StartSync => "start sync",
            SyncMode::TriggerSync => "trigger sync",
            SyncMode::AiSync => "ai sync",
        };
        f.write_str(label)
    }
}

/// Synchronization needs of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// Index of the device in the caller's device table
    pub device_index: usize,
    /// Stream direction of the device
    pub direction: Direction,
    /// Device whose start trigger starts this one
    pub start_source: Option<usize>,
    /// Whether to run at the start source's sample rate
    pub inherit_rate: bool,
}

impl SyncRequest {
    /// Free-running request.
    pub fn new(device_index: usize, direction: Direction) -> Self {
        Self {
            device_index,
            direction,
            start_source: None,
            inherit_rate: false,
        }
    }

    /// Starts from the trigger of device `master`.
    pub fn with_start_source(mut self, master: usize) -> Self {
        self.start_source = Some(master);
        self
    }

    /// Runs at the start source's rate.
    pub fn with_inherit_rate(mut self, inherit: bool) -> Self {
        self.inherit_rate = inherit;
        self
    }
}

/// A dependent device started by its master's trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerBinding {
    /// Device started by the trigger
    pub dependent: usize,
    /// Device owning the trigger
    pub master: usize,
    /// Dependent runs at the master's rate
    pub share_rate: bool,
}

/// One entry of the start order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartSlot {
    /// Index into the caller's device table
    pub device_index: usize,
    /// Sample rate comes from the start source
    pub use_master_rate: bool,
}

/// Result of [`negotiate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    mode: SyncMode,
    order: Vec<StartSlot>,
    bindings: Vec<TriggerBinding>,
}

impl SyncPlan {
    /// Synchronization mode of the trial.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Devices in the order their start commands must be issued.
    pub fn order(&self) -> &[StartSlot] {
        &self.order
    }

    /// Master/dependent pairs, ordered as negotiated.
    pub fn bindings(&self) -> &[TriggerBinding] {
        &self.bindings
    }

    /// `(device_index, use_master_rate)` in start order.
    pub fn pairs(&self) -> Vec<(usize, bool)> {
        self.order
            .iter()
            .map(|slot| (slot.device_index, slot.use_master_rate))
            .collect()
    }

    /// Start source bound to `dependent`.
    pub fn master_of(&self, dependent: usize) -> Option<usize> {
        self.bindings
            .iter()
            .find(|b| b.dependent == dependent)
            .map(|b| b.master)
    }

    /// Devices started by the trigger of `master`.
    pub fn dependents_of(&self, master: usize) -> Vec<usize> {
        self.bindings
            .iter()
            .filter(|b| b.master == master)
            .map(|b| b.dependent)
            .collect()
    }

    /// Position of `device` in the start order.
    pub fn position(&self, device: usize) -> Option<usize> {
        self.order.iter().position(|slot| slot.device_index == device)
    }
}

/// Computes bindings and start order for `requests`.
pub fn negotiate(requests: &[SyncRequest]) -> Result<SyncPlan, SyncError> {
    let mut rank = HashMap::with_capacity(requests.len());
    for (i, request) in requests.iter().enumerate() {
        if rank.insert(request.device_index, i).is_some() {
            return Err(SyncError::DuplicateDevice {
                device: request.device_index,
            });
        }
    }

    let mut bindings = Vec::new();
    for request in requests {
        match request.start_source {
            Some(master) if master == request.device_index => {
                return Err(SyncError::SelfDependency {
                    device: master,
                })
            }
            Some(master) if !rank.contains_key(&master) => {
                return Err(SyncError::UnknownMaster {
                    dependent: request.device_index,
                    master,
                })
            }
            Some(master) => bindings.push(TriggerBinding {
                dependent: request.device_index,
                master,
                share_rate: request.inherit_rate,
            }),
            None if request.inherit_rate => {
                return Err(SyncError::NoMaster {
                    device: request.device_index,
                })
            }
            None => {}
        }
    }

    check_rate_agreement(&bindings)?;
    let order = start_order(requests, &rank, &bindings)?;

    let mode = if requests.len() <= 1 {
        SyncMode::NoSync
    } else if bindings.is_empty() {
        SyncMode::StartSync
    } else if bindings.iter().any(|b| b.share_rate) {
        SyncMode::AiSync
    } else {
        SyncMode::TriggerSync
    };

    debug!(
        devices = requests.len(),
        bindings = bindings.len(),
        mode = %mode,
        "Negotiated start order"
    );
    Ok(SyncPlan {
        mode,
        order,
        bindings,
    })
}

fn check_rate_agreement(bindings: &[TriggerBinding]) -> Result<(), SyncError> {
    let mut by_master: HashMap<usize, (Vec<usize>, Vec<usize>)> = HashMap::new();
    for binding in bindings {
        let (sharing, own) = by_master.entry(binding.master).or_default();
        if binding.share_rate {
            sharing.push(binding.dependent);
        } else {
            own.push(binding.dependent);
        }
    }

    let mut masters: Vec<_> = by_master.into_iter().collect();
    masters.sort_by_key(|(master, _)| *master);
    for (master, (sharing, own)) in masters {
        if !sharing.is_empty() && !own.is_empty() {
            return Err(SyncError::ConflictingRateInheritance {
                master,
                sharing,
                own,
            });
        }
    }
    Ok(())
}

/// Kahn's algorithm, always taking the ready device that was requested first.
fn start_order(
    requests: &[SyncRequest],
    rank: &HashMap<usize, usize>,
    bindings: &[TriggerBinding],
) -> Result<Vec<StartSlot>, SyncError> {
    let mut pending: Vec<usize> = vec![0; requests.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); requests.len()];
    let mut shares = vec![false; requests.len()];
    for binding in bindings {
        let (Some(&d), Some(&m)) = (rank.get(&binding.dependent), rank.get(&binding.master)) else {
            continue;
        };
        pending[d] += 1;
        dependents[m].push(d);
        shares[d] = binding.share_rate;
    }

    let mut ready: BTreeSet<usize> = (0..requests.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(requests.len());
    while let Some(next) = ready.pop_first() {
        order.push(StartSlot {
            device_index: requests[next].device_index,
            use_master_rate: shares[next],
        });
        for &d in &dependents[next] {
            pending[d] -= 1;
            if pending[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() < requests.len() {
        let devices = (0..requests.len())
            .filter(|&i| pending[i] > 0)
            .map(|i| requests[i].device_index)
            .collect();
        return Err(SyncError::Cycle { devices });
    }
    Ok(order)
}
