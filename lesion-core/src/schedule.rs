use burn::prelude::*;
use tracing::warn;

/// Number of full batches in an epoch; leftover samples are dropped.
pub fn steps_per_epoch(samples: usize, batch_size: usize) -> usize {
    samples.checked_div(batch_size).unwrap_or(0)
}

/// Scales the learning rate down when a monitored loss stops improving.
#[derive(Config, Debug)]
pub struct PlateauConfig {
    #[config(default = 0.2)]
    factor: f64,
    /// Epochs without improvement before the rate is reduced
    #[config(default = 3)]
    patience: usize,
    #[config(default = 1.0e-5)]
    min_lr: f64,
    /// Smallest decrease that counts as an improvement
    #[config(default = 1.0e-4)]
    min_delta: f64,
}

impl PlateauConfig {
    pub fn init(&self, initial_lr: f64) -> PlateauScheduler {
        PlateauScheduler {
            config: self.clone(),
            lr: initial_lr,
            best: f64::INFINITY,
            wait: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    config: PlateauConfig,
    lr: f64,
    best: f64,
    wait: usize,
}

impl PlateauScheduler {
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Records the loss of a finished epoch, returning the rate for the next one.
    pub fn step(&mut self, loss: f64) -> f64 {
        if loss < self.best - self.config.min_delta {
            self.best = loss;
            self.wait = 0;
            return self.lr;
        }
        self.wait += 1;
        if self.wait >= self.config.patience {
            if self.lr > self.config.min_lr {
                let lr = (self.lr * self.config.factor).max(self.config.min_lr);
                warn!("Reducing learning rate from {:e} to {:e}", self.lr, lr);
                self.lr = lr;
            }
            self.wait = 0;
        }
        self.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_drop_the_remainder() {
        let steps = [100, 103, 8].map(|samples| steps_per_epoch(samples, 8));
        assert_eq!(steps, [12, 12, 1]);
        assert_eq!(steps_per_epoch(7, 8), 0);
        assert_eq!(steps_per_epoch(7, 0), 0);
    }

    #[test]
    fn reduces_after_three_stale_epochs() {
        let mut scheduler = PlateauConfig::new().init(1.0e-4);
        assert_eq!(scheduler.step(1.0), 1.0e-4);
        assert_eq!(scheduler.step(1.0), 1.0e-4);
        assert_eq!(scheduler.step(1.2), 1.0e-4);
        let lr = scheduler.step(1.0);
        assert!((lr - 2.0e-5).abs() < 1e-12);
        assert_eq!(scheduler.lr(), lr);
    }

    #[test]
    fn improvement_resets_patience() {
        let mut scheduler = PlateauConfig::new().init(1.0e-4);
        for loss in [1.0, 1.0, 1.0, 0.5, 0.5, 0.5] {
            scheduler.step(loss);
        }
        assert_eq!(scheduler.lr(), 1.0e-4);
        // a gain smaller than min_delta is not an improvement
        scheduler.step(0.49999);
        assert!((scheduler.lr() - 2.0e-5).abs() < 1e-12);
    }

    #[test]
    fn never_below_min_lr() {
        let mut scheduler = PlateauConfig::new().init(1.0e-4);
        for _ in 0..30 {
            scheduler.step(1.0);
            assert!(scheduler.lr() >= 1.0e-5);
        }
        assert_eq!(scheduler.lr(), 1.0e-5);
    }
}
