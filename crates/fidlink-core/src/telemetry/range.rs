//! Range switching with hysteresis

use super::Range;

/// Decides when the front end should change gain range.
///
/// A single sample past a threshold triggers a switch; the gap between the
/// two thresholds keeps the range from chattering.
#[derive(Debug, Clone)]
pub struct RangeController {
    up_pico_amps: f64,
    down_pico_amps: f64,
}

impl RangeController {
    pub fn new(up_pico_amps: f64, down_pico_amps: f64) -> Self {
        Self {
            up_pico_amps,
            down_pico_amps,
        }
    }

    /// New range to switch to, if any
    pub fn evaluate(&self, current: Range, pico_amps: f64) -> Option<Range> {
        match current {
            Range::Low if pico_amps >= self.up_pico_amps => Some(Range::Max),
            Range::Max if pico_amps <= self.down_pico_amps => Some(Range::Low),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hysteresis() {
        let c = RangeController::new(6500.0, 6000.0);
        assert_eq!(c.evaluate(Range::Low, 6499.9), None);
        assert_eq!(c.evaluate(Range::Low, 6500.0), Some(Range::Max));
        assert_eq!(c.evaluate(Range::Max, 6200.0), None);
        assert_eq!(c.evaluate(Range::Max, 6000.0), Some(Range::Low));
        assert_eq!(c.evaluate(Range::Low, 6200.0), None);
    }
}
