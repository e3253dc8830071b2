use super::errors::{PoolError, Result};
use std::time::Duration;


/// Политика автомасштабирования по глубине очереди
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalePolicy {
    pub interval: Duration,
    /// Растём, когда в очереди больше задач
    pub high_water: usize,
    /// Сжимаемся, когда в очереди меньше задач
    pub low_water: usize,
    pub step: usize,
}

impl Default for ScalePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            high_water: 16,
            low_water: 1,
            step: 1,
        }
    }
}

impl ScalePolicy {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(PoolError::config("autoscale interval must be greater than zero"));
        }
        if self.step == 0 {
            return Err(PoolError::config("autoscale step must be at least 1"));
        }
        if self.low_water > self.high_water {
            return Err(PoolError::config(format!(
                "low_water ({}) must not exceed high_water ({})",
                self.low_water, self.high_water
            )));
        }
        Ok(())
    }

    /// Новое число воркеров или `None`, если менять ничего не нужно.
    /// Результат всегда в пределах `[min, max]`.
    pub fn decide(&self, queued: usize, current: usize, min: usize, max: usize) -> Option<usize> {
        if queued > self.high_water && current < max {
            Some(current.saturating_add(self.step).min(max))
        } else if queued < self.low_water && current > min {
            Some(current.saturating_sub(self.step).max(min))
        } else {
            None
        }
    }
}
