//! Bounded summary of a Trend metric.
//!
//! Values are quantized to thousandths (microseconds for millisecond durations)
//! and recorded into an HDR histogram. Percentiles carry a relative error of at
//! most `10^-digits` (0.1% at the default three significant digits) plus the
//! 0.001 quantization step. Count, sum, min and max are exact; the sum is kept
//! in integer units so it does not depend on the order records arrive in.

use hdrhistogram::Histogram;

/// Quantization factor applied before recording into the histogram.
const SCALE: f64 = 1000.0;

#[derive(Debug, Clone)]
pub struct TrendSummary {
    histogram: Histogram<u64>,
    count: u64,
    sum_units: u128,
    min: f64,
    max: f64,
}

impl TrendSummary {
    /// `digits` is the histogram precision, 1 to 5 significant digits.
    pub fn new(digits: u8) -> Result<Self, String> {
        let histogram = Histogram::<u64>::new(digits).map_err(|e| format!("{:?}", e))?;
        Ok(Self {
            histogram,
            count: 0,
            sum_units: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        })
    }

    /// Record one non-negative, finite value.
    pub fn record(&mut self, value: f64) -> Result<(), String> {
        let units = (value * SCALE).round() as u64;
        self.histogram
            .record(units)
            .map_err(|e| format!("{:?}", e))?;
        self.count += 1;
        self.sum_units += units as u128;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        Ok(())
    }

    pub fn merge(&mut self, other: &TrendSummary) -> Result<(), String> {
        self.histogram
            .add(&other.histogram)
            .map_err(|e| format!("{:?}", e))?;
        self.count += other.count;
        self.sum_units += other.sum_units;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum_units as f64 / SCALE
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum() / self.count as f64
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.max
        }
    }

    /// Value at percentile `p` (0-100), clamped into the observed `[min, max]` range.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let q = (p / 100.0).clamp(0.0, 1.0);
        let raw = self.histogram.value_at_quantile(q) as f64 / SCALE;
        raw.clamp(self.min, self.max)
    }

    pub fn median(&self) -> f64 {
        self.percentile(50.0)
    }
}
