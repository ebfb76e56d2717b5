//! Learning-rate schedules as per-epoch multiplicative factors.

use std::f32::consts::PI;

use crate::api::config::LrSchedule;

impl LrSchedule {
    /// Factor applied to the base learning rate during epoch `epoch` (0-based).
    pub fn factor(&self, epoch: usize) -> f32 {
        match *self {
            LrSchedule::Constant => 1.0,
            LrSchedule::Step { every, gamma } => gamma.powi((epoch / every.max(1)) as i32),
            LrSchedule::Exponential { gamma } => gamma.powi(epoch.min(i32::MAX as usize) as i32),
            LrSchedule::Cosine { total_epochs, min_factor } => {
                let total = total_epochs.max(1);
                let progress = epoch.min(total) as f32 / total as f32;
                min_factor + (1.0 - min_factor) * 0.5 * (1.0 + (PI * progress).cos())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_schedule() {
        let s = LrSchedule::Step { every: 2, gamma: 0.5 };
        assert_eq!(s.factor(0), 1.0);
        assert_eq!(s.factor(1), 1.0);
        assert_eq!(s.factor(2), 0.5);
        assert_eq!(s.factor(5), 0.25);
    }

    #[test]
    fn test_cosine_endpoints() {
        let s = LrSchedule::Cosine { total_epochs: 10, min_factor: 0.1 };
        assert!((s.factor(0) - 1.0).abs() < 1e-6);
        assert!((s.factor(10) - 0.1).abs() < 1e-6);
        assert!((s.factor(50) - 0.1).abs() < 1e-6);
        assert!((s.factor(5) - 0.55).abs() < 1e-6);
    }

    #[test]
    fn test_exponential() {
        let s = LrSchedule::Exponential { gamma: 0.9 };
        assert!((s.factor(2) - 0.81).abs() < 1e-6);
    }
}
