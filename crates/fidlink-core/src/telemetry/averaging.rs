//! Moving averages over raw ppm and the hardware averaging control loop

use std::collections::VecDeque;

use super::Range;

/// Round for display: 0 decimals at or above 100, 1 decimal below
pub fn round_ppm(value: f64) -> f64 {
    if value.abs() >= 100.0 {
        value.round()
    } else {
        (value * 10.0).round() / 10.0
    }
}

/// Bounded FIFO of values
#[derive(Debug, Clone)]
pub struct MovingWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl MovingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// The most recent `n` values, oldest first
    pub fn recent(&self, n: usize) -> impl Iterator<Item = f64> + '_ {
        let skip = self.values.len().saturating_sub(n);
        self.values.iter().skip(skip).copied()
    }

    /// Mean of the most recent `n` values (fewer if the window is short)
    pub fn mean_of_last(&self, n: usize) -> Option<f64> {
        let count = n.min(self.values.len());
        if count == 0 {
            return None;
        }
        Some(self.recent(n).sum::<f64>() / count as f64)
    }

    pub fn mean(&self) -> Option<f64> {
        self.mean_of_last(self.values.len())
    }
}

/// Output of one [`Averager::push`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Averages {
    pub short: f64,
    pub long: f64,
    pub composite: f64,
    pub stable: bool,
}

/// Short/long moving averages with a stability gate
#[derive(Debug, Clone)]
pub struct Averager {
    ring: MovingWindow,
    long_window: usize,
    short_window: usize,
    band_pct: f64,
}

impl Averager {
    pub fn new(capacity: usize, long_window: usize, short_window: usize, band_pct: f64) -> Self {
        Self {
            ring: MovingWindow::new(capacity),
            long_window,
            short_window,
            band_pct,
        }
    }

    pub fn window(&self) -> &MovingWindow {
        &self.ring
    }

    /// Every sample of the short window lies within the band around `long`
    fn short_window_stable(&self, long: f64) -> bool {
        let tolerance = long.abs() * self.band_pct / 100.0;
        self.ring
            .recent(self.short_window)
            .all(|v| (v - long).abs() <= tolerance)
    }

    pub fn push(&mut self, raw_ppm: f64, range: Range) -> Averages {
        self.ring.push(raw_ppm);
        let long = self.ring.mean_of_last(self.long_window).unwrap_or(raw_ppm);
        let short = self.ring.mean_of_last(self.short_window).unwrap_or(raw_ppm);
        let stable = self.short_window_stable(long);

        let composite = match (stable, range) {
            (true, Range::Max) => long,
            (true, Range::Low) => short,
            (false, _) => raw_ppm,
        };

        Averages {
            short: round_ppm(short),
            long: round_ppm(long),
            composite: round_ppm(composite),
            stable,
        }
    }
}

/// Picks the hardware averaging depth from the FID current
#[derive(Debug, Clone)]
pub struct DepthPolicy {
    threshold_pico_amps: f64,
    fast_depth: u8,
    slow_depth: u8,
    pending: Option<u8>,
}

impl DepthPolicy {
    pub fn new(threshold_pico_amps: f64, fast_depth: u8, slow_depth: u8) -> Self {
        Self {
            threshold_pico_amps,
            fast_depth,
            slow_depth,
            pending: None,
        }
    }

    pub fn desired(&self, pico_amps: f64) -> u8 {
        if pico_amps >= self.threshold_pico_amps {
            self.fast_depth
        } else {
            self.slow_depth
        }
    }

    /// Depth to push to the device, if it differs from what the device
    /// reports and has not already been requested
    pub fn evaluate(&mut self, pico_amps: f64, reported_depth: u8) -> Option<u8> {
        let desired = self.desired(pico_amps);
        if desired == reported_depth {
            self.pending = None;
            return None;
        }
        if self.pending == Some(desired) {
            return None;
        }
        self.pending = Some(desired);
        Some(desired)
    }

    /// Forget an outstanding request so the next sample retries it
    pub fn request_failed(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_average_of_step() {
        let mut window = MovingWindow::new(50);
        for v in [10.0, 10.0, 10.0, 10.0, 10.0, 100.0] {
            window.push(v);
        }
        assert_eq!(round_ppm(window.mean_of_last(5).unwrap()), 28.0);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = MovingWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            window.push(v);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.recent(10).collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
        assert_eq!(window.mean(), Some(3.0));
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_ppm(123.46), 123.0);
        assert_eq!(round_ppm(12.46), 12.5);
        assert_eq!(round_ppm(99.94), 99.9);
    }

    #[test]
    fn test_stable_low_range_reports_short_average() {
        let mut avg = Averager::new(50, 25, 5, 10.0);
        let mut last = None;
        for v in [50.0, 51.0, 49.0, 50.0, 52.0, 48.0] {
            last = Some(avg.push(v, Range::Low));
        }
        let a = last.unwrap();
        assert!(a.stable);
        assert_eq!(a.composite, a.short);
    }

    #[test]
    fn test_stable_max_range_reports_long_average() {
        let mut avg = Averager::new(50, 25, 5, 10.0);
        let mut last = None;
        for v in [1000.0, 1010.0, 990.0, 1005.0, 995.0, 1000.0] {
            last = Some(avg.push(v, Range::Max));
        }
        let a = last.unwrap();
        assert!(a.stable);
        assert_eq!(a.composite, a.long);
    }

    #[test]
    fn test_unstable_reports_raw() {
        let mut avg = Averager::new(50, 25, 5, 10.0);
        for _ in 0..5 {
            avg.push(10.0, Range::Low);
        }
        let a = avg.push(100.0, Range::Low);
        assert!(!a.stable);
        assert_eq!(a.composite, 100.0);
        assert_eq!(a.short, 28.0);
    }

    #[test]
    fn test_depth_policy_only_pushes_changes() {
        let mut policy = DepthPolicy::new(100.0, 10, 50);
        assert_eq!(policy.evaluate(20.0, 50), None);
        assert_eq!(policy.evaluate(150.0, 50), Some(10));
        assert_eq!(policy.evaluate(160.0, 50), None);
        assert_eq!(policy.evaluate(170.0, 10), None);
        assert_eq!(policy.evaluate(40.0, 10), Some(50));
    }
}
