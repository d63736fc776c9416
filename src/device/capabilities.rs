//! Hardware capability metadata.

use crate::signal::Reference;
use serde::{Deserialize, Serialize};

/// One entry of a device's range table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    /// Range index (gain index) on the device
    pub index: usize,
    /// Lower voltage limit
    pub min: f64,
    /// Upper voltage limit
    pub max: f64,
}

impl Range {
    /// Range `[min, max]` at table position `index`.
    pub fn new(index: usize, min: f64, max: f64) -> Self {
        Self { index, min, max }
    }

    /// Symmetric range `[-amplitude, amplitude]`.
    pub fn bipolar(index: usize, amplitude: f64) -> Self {
        Self::new(index, -amplitude, amplitude)
    }

    /// Width in volts.
    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    /// Whether the range straddles zero.
    pub fn is_bipolar(&self) -> bool {
        self.min < 0.0 && self.max > 0.0
    }

    /// Whether `[min, max]` lies inside this range.
    pub fn contains(&self, min: f64, max: f64) -> bool {
        min >= self.min && max <= self.max
    }

    /// Label such as `±10V` or `0V to 5V`.
    pub fn description(&self) -> String {
        if self.is_bipolar() && (self.min + self.max).abs() < f64::EPSILON {
            format!("±{}V", self.max)
        } else {
            format!("{}V to {}V", self.min, self.max)
        }
    }
}

/// What a board can do in one direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Number of channels
    pub channels: u32,
    /// Converter resolution in bits (at most 16)
    pub bits: u32,
    /// Maximum sample rate per channel in Hz
    pub max_rate: f64,
    /// Minimum sample rate per channel in Hz
    pub min_rate: f64,
    /// Range table
    pub ranges: Vec<Range>,
    /// Supported reference modes
    pub references: Vec<Reference>,
    /// Size of the hardware FIFO in samples
    pub fifo_size: usize,
}

impl Capabilities {
    /// Largest raw code.
    pub fn max_data(&self) -> u16 {
        let bits = self.bits.clamp(1, 16);
        ((1u32 << bits) - 1) as u16
    }

    /// Range with table index `index`.
    pub fn range(&self, index: usize) -> Option<&Range> {
        self.ranges.iter().find(|r| r.index == index)
    }

    /// Smallest range containing `[min, max]`.
    pub fn range_for(&self, min: f64, max: f64) -> Option<&Range> {
        if min > max {
            return None;
        }
        self.ranges
            .iter()
            .filter(|r| r.contains(min, max))
            .min_by(|a, b| a.span().total_cmp(&b.span()))
    }

    /// Range with the largest span.
    pub fn widest_range(&self) -> Option<&Range> {
        self.ranges
            .iter()
            .max_by(|a, b| a.span().total_cmp(&b.span()))
    }

    /// Whether the board offers `reference`.
    pub fn supports_reference(&self, reference: Reference) -> bool {
        self.references.contains(&reference)
    }

    /// Whether `rate` is accepted as a per-channel sample rate.
    pub fn rate_in_bounds(&self, rate: f64) -> bool {
        rate.is_finite() && rate >= self.min_rate && rate <= self.max_rate
    }

    /// Checks the metadata reported by a backend.
    pub fn validate(&self) -> Result<(), String> {
        if self.channels == 0 {
            return Err("device reports no channels".to_string());
        }
        if self.bits == 0 || self.bits > 16 {
            return Err(format!("unsupported resolution of {} bits", self.bits));
        }
        if !(self.max_rate > 0.0 && self.min_rate > 0.0 && self.min_rate <= self.max_rate) {
            return Err(format!(
                "invalid rate bounds {}..={} Hz",
                self.min_rate, self.max_rate
            ));
        }
        if self.ranges.is_empty() {
            return Err("device reports no ranges".to_string());
        }
        if let Some(r) = self.ranges.iter().find(|r| r.span() <= 0.0) {
            return Err(format!("range {} is empty", r.index));
        }
        if self.references.is_empty() {
            return Err("device reports no reference modes".to_string());
        }
        Ok(())
    }

    /// Converts volts to a raw code in `range`, clamped to `[0, max_data]`.
    pub fn volts_to_raw(&self, range: &Range, volts: f64) -> u16 {
        let max_data = f64::from(self.max_data());
        let fraction = (volts - range.min) / range.span();
        (fraction * max_data).round().clamp(0.0, max_data) as u16
    }

    /// Converts a raw code in `range` to volts.
    pub fn raw_to_volts(&self, range: &Range, raw: u16) -> f64 {
        range.min + f64::from(raw) / f64::from(self.max_data()) * range.span()
    }
}
