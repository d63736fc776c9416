//! Signal list validation against device capabilities.
//!
//! Validation clears every descriptor's accumulator, then sets one flag per
//! problem found. Invalid channels and rates are clamped into the valid range
//! after flagging, so a caller that ignores the flags still holds a list that
//! names existing hardware.

use super::capabilities::{Capabilities, Range};
use crate::error::ErrorFlags;
use crate::signal::{Direction, SignalDescriptor, SignalList};
use std::collections::HashSet;

/// Device state relevant to validation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeviceView<'a> {
    pub caps: Option<&'a Capabilities>,
    pub running: bool,
}

/// Validates `sigs` and returns the number of descriptors in error.
///
/// An empty list counts as one failure.
pub(crate) fn check_list(view: DeviceView<'_>, sigs: &mut SignalList) -> usize {
    sigs.clear_errors();

    if sigs.is_empty() {
        return 1;
    }

    let caps = match view.caps {
        Some(caps) => caps,
        None => {
            sigs.add_error(ErrorFlags::DEVICE_NOT_OPEN);
            return sigs.failed_count();
        }
    };

    if view.running && !sigs.priority() {
        sigs.add_error(ErrorFlags::BUSY);
    }

    let direction = sigs.direction();
    let finite_input = direction == Direction::Input && !sigs.continuous();
    if finite_input && sigs.duration().map_or(true, |d| !(d > 0.0)) {
        sigs.add_error(ErrorFlags::INVALID_CONTINUOUS);
    }

    let first_rate = sigs.get(0).map(SignalDescriptor::sample_rate);
    let first_delay = sigs.get(0).map(SignalDescriptor::delay);
    let mut seen = HashSet::new();

    for sig in sigs.signals_mut() {
        let mut flags = ErrorFlags::empty();

        if direction == Direction::Output && sig.data().is_empty() {
            flags |= ErrorFlags::NO_DATA;
        }

        if sig.channel() >= caps.channels {
            flags |= ErrorFlags::INVALID_CHANNEL;
            sig.set_channel(caps.channels - 1);
        } else if !seen.insert(sig.channel()) {
            flags |= ErrorFlags::MULTIPLE_CHANNELS;
        }

        let rate = sig.sample_rate();
        if !caps.rate_in_bounds(rate) {
            flags |= ErrorFlags::INVALID_SAMPLE_RATE;
            let clamped = if rate.is_finite() {
                rate.clamp(caps.min_rate, caps.max_rate)
            } else {
                caps.max_rate
            };
            sig.set_sample_rate(clamped);
        } else if first_rate.is_some_and(|r| r != rate) {
            flags |= ErrorFlags::MULTIPLE_SAMPLE_RATES;
        }

        if sig.delay() < 0.0 || !sig.delay().is_finite() {
            flags |= ErrorFlags::INVALID_DELAY;
        } else if first_delay.is_some_and(|d| d != sig.delay()) {
            flags |= ErrorFlags::MULTIPLE_DELAYS;
        }

        if !caps.supports_reference(sig.reference()) {
            flags |= ErrorFlags::INVALID_REFERENCE;
        }

        flags |= check_gain(caps, direction, sig);

        if !flags.is_empty() {
            sig.add_error(flags);
        }
    }

    sigs.failed_count()
}

/// Range wanted by a descriptor: requested limits, else the output data range.
pub(crate) fn wanted_range(direction: Direction, sig: &SignalDescriptor) -> Option<(f64, f64)> {
    let auto = match direction {
        Direction::Output => sig.data_range(),
        Direction::Input => None,
    };
    match (sig.requested_min(), sig.requested_max(), auto) {
        (Some(min), Some(max), _) => Some((min, max)),
        (Some(min), None, Some((_, hi))) => Some((min, hi)),
        (None, Some(max), Some((lo, _))) => Some((lo, max)),
        (None, None, auto) => auto,
        (Some(min), None, None) => Some((min, min)),
        (None, Some(max), None) => Some((max, max)),
    }
}

/// Range selected for a descriptor, or `None` if no range fits.
pub(crate) fn select_range<'c>(
    caps: &'c Capabilities,
    direction: Direction,
    sig: &SignalDescriptor,
) -> Option<&'c Range> {
    match wanted_range(direction, sig) {
        Some((min, max)) => caps.range_for(min, max),
        None => caps.widest_range(),
    }
}

fn check_gain(caps: &Capabilities, direction: Direction, sig: &SignalDescriptor) -> ErrorFlags {
    let range = match select_range(caps, direction, sig) {
        Some(range) => *range,
        None => return ErrorFlags::INVALID_GAIN,
    };
    if direction == Direction::Input {
        return ErrorFlags::empty();
    }
    match sig.data_range() {
        Some((lo, _)) if lo < range.min - 1e-9 => ErrorFlags::UNDERFLOW,
        Some((_, hi)) if hi > range.max + 1e-9 => ErrorFlags::OVERFLOW,
        _ => ErrorFlags::empty(),
    }
}
