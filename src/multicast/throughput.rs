// src/multicast/throughput.rs

use chrono::{DateTime, Utc};

/// Transfer rate between the two most recent byte-count samples.
#[derive(Debug, Clone, Default)]
pub struct ThroughputMeter {
    last: Option<(DateTime<Utc>, u64)>,
}

impl ThroughputMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cumulative byte count and return bytes per second since the
    /// previous sample.
    ///
    /// Returns `None` for the first sample, for samples that do not move the
    /// clock forward, and when the count went backwards (the window restarts
    /// from the new sample).
    pub fn record(&mut self, total: u64, at: DateTime<Utc>) -> Option<f64> {
        let previous = self.last.replace((at, total));
        let (prev_at, prev_total) = previous?;

        if total < prev_total {
            return None;
        }
        let elapsed = at.signed_duration_since(prev_at);
        let secs = elapsed.num_milliseconds() as f64 / 1000.0;
        if secs <= 0.0 {
            // Keep the older sample as the window start.
            self.last = Some((prev_at, prev_total));
            return None;
        }
        Some((total - prev_total) as f64 / secs)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn rate_uses_the_last_two_samples() {
        let t0 = Utc::now();
        let mut meter = ThroughputMeter::new();
        assert_eq!(meter.record(0, t0), None);
        assert_eq!(meter.record(1_000, t0 + TimeDelta::seconds(2)), Some(500.0));
        assert_eq!(meter.record(4_000, t0 + TimeDelta::seconds(3)), Some(3_000.0));
    }

    #[test]
    fn same_instant_samples_do_not_divide_by_zero() {
        let t0 = Utc::now();
        let mut meter = ThroughputMeter::new();
        meter.record(0, t0);
        assert_eq!(meter.record(100, t0), None);
        assert_eq!(meter.record(300, t0 + TimeDelta::seconds(1)), Some(300.0));
    }

    #[test]
    fn counter_reset_restarts_the_window() {
        let t0 = Utc::now();
        let mut meter = ThroughputMeter::new();
        meter.record(5_000, t0);
        assert_eq!(meter.record(10, t0 + TimeDelta::seconds(1)), None);
        assert_eq!(meter.record(110, t0 + TimeDelta::seconds(2)), Some(100.0));
    }
}
