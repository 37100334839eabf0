//! Flame state debounce

use super::RawSample;

/// Reports the flame state, flipping only after `required` consecutive
/// samples disagree with it. The first sample seeds the state directly.
#[derive(Debug, Clone)]
pub struct IgnitionDebouncer {
    threshold_c: f64,
    required: u32,
    state: Option<bool>,
    disagreeing: u32,
}

impl IgnitionDebouncer {
    pub fn new(threshold_c: f64, required: u32) -> Self {
        Self {
            threshold_c,
            required: required.max(1),
            state: None,
            disagreeing: 0,
        }
    }

    /// Undebounced flame state of one sample
    pub fn raw_state(&self, sample: &RawSample) -> bool {
        sample.thermocouple_c > self.threshold_c && sample.primary_solenoid && sample.primary_pump
    }

    /// Reported state, if any sample has been seen
    pub fn state(&self) -> Option<bool> {
        self.state
    }

    /// Feed a sample. Returns the reported state and whether it just flipped.
    pub fn update(&mut self, sample: &RawSample) -> (bool, bool) {
        let raw = self.raw_state(sample);
        let Some(current) = self.state else {
            self.state = Some(raw);
            return (raw, false);
        };

        if raw == current {
            self.disagreeing = 0;
            return (current, false);
        }

        self.disagreeing += 1;
        if self.disagreeing >= self.required {
            self.disagreeing = 0;
            self.state = Some(raw);
            (raw, true)
        } else {
            (current, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(lit: bool) -> RawSample {
        RawSample {
            thermocouple_c: if lit { 120.0 } else { 25.0 },
            primary_solenoid: true,
            primary_pump: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_sample_seeds_state() {
        let mut d = IgnitionDebouncer::new(75.0, 3);
        assert_eq!(d.update(&sample(true)), (true, false));
        assert_eq!(d.state(), Some(true));
    }

    #[test]
    fn test_two_do_not_flip_three_do() {
        let mut d = IgnitionDebouncer::new(75.0, 3);
        d.update(&sample(false));
        assert_eq!(d.update(&sample(true)), (false, false));
        assert_eq!(d.update(&sample(true)), (false, false));
        assert_eq!(d.update(&sample(true)), (true, true));
    }

    #[test]
    fn test_interrupted_run_restarts_count() {
        let mut d = IgnitionDebouncer::new(75.0, 3);
        d.update(&sample(false));
        d.update(&sample(true));
        d.update(&sample(true));
        d.update(&sample(false));
        assert_eq!(d.update(&sample(true)), (false, false));
    }

    #[test]
    fn test_needs_solenoid_and_pump() {
        let d = IgnitionDebouncer::new(75.0, 3);
        let mut s = sample(true);
        s.primary_pump = false;
        assert!(!d.raw_state(&s));
    }
}
