//! Conversion between physical values and interleaved raw codes.

use super::capabilities::{Capabilities, Range};
use crate::ring::RawSample;
use crate::signal::SignalDescriptor;

/// Scaling of one channel, fixed at prepare time.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelScaling {
    /// Hardware channel number
    pub channel: u32,
    /// Range the channel is armed with
    pub range: Range,
    /// Volts per physical unit
    pub scale: f64,
    /// Offset in volts
    pub offset: f64,
    max_data: u16,
}

impl ChannelScaling {
    /// Scaling of `sig` on `range`, at the resolution of `caps`.
    pub fn new(caps: &Capabilities, sig: &SignalDescriptor, range: Range) -> Self {
        Self {
            channel: sig.channel(),
            range,
            scale: sig.scale(),
            offset: sig.offset(),
            max_data: caps.max_data(),
        }
    }

    /// Physical value to raw code, clamped to the code range.
    pub fn encode(&self, value: f64) -> RawSample {
        let volts = value * self.scale + self.offset;
        let max_data = f64::from(self.max_data);
        let fraction = (volts - self.range.min) / self.range.span();
        (fraction * max_data).round().clamp(0.0, max_data) as RawSample
    }

    /// Raw code to physical value.
    pub fn decode(&self, raw: RawSample) -> f32 {
        let volts =
            self.range.min + f64::from(raw) / f64::from(self.max_data) * self.range.span();
        if self.scale == 0.0 {
            0.0
        } else {
            ((volts - self.offset) / self.scale) as f32
        }
    }

    /// Raw code of zero volts.
    pub fn zero(&self) -> RawSample {
        if self.scale == 0.0 {
            return self.encode(0.0);
        }
        self.encode(-self.offset / self.scale)
    }
}

/// Interleaves the data of `sigs` (already in multiplex order) into raw codes.
///
/// Each signal is shifted by its delay and padded with zero volts up to `scans`.
pub fn multiplex(
    sigs: &[&SignalDescriptor],
    scalings: &[ChannelScaling],
    scans: usize,
) -> Vec<RawSample> {
    let mut out = Vec::with_capacity(scans * sigs.len());
    let delays: Vec<usize> = sigs.iter().map(|s| s.delay_scans()).collect();
    for scan in 0..scans {
        for ((sig, scaling), &delay) in sigs.iter().zip(scalings).zip(&delays) {
            let raw = scan
                .checked_sub(delay)
                .and_then(|i| sig.data().get(i))
                .map_or_else(|| scaling.zero(), |&v| scaling.encode(f64::from(v)));
            out.push(raw);
        }
    }
    out
}

/// Splits interleaved raw codes into per-channel physical values.
///
/// `raw` must hold whole scans.
pub fn demultiplex(raw: &[RawSample], scalings: &[ChannelScaling]) -> Vec<Vec<f32>> {
    let n = scalings.len();
    if n == 0 {
        return Vec::new();
    }
    let scans = raw.len() / n;
    let mut out: Vec<Vec<f32>> = (0..n).map(|_| Vec::with_capacity(scans)).collect();
    for scan in raw.chunks_exact(n) {
        for ((value, scaling), channel) in scan.iter().zip(scalings).zip(out.iter_mut()) {
            channel.push(scaling.decode(*value));
        }
    }
    out
}
