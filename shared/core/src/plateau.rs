use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PlateauConfig {
    /// Starting value of the controlled quantity (learning rate).
    pub initial_lr: f64,
    /// Multiplier applied on decay. Must be in (0, 1).
    pub factor: f64,
    /// Number of stagnant evaluations tolerated before a decay.
    pub patience: u32,
    /// Minimum decrease of the tracked metric that counts as improvement.
    /// An exactly-equal metric is stagnation.
    pub threshold: f64,
    /// Once the control value drops below this, the run is over.
    pub floor: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            initial_lr: 1e-3,
            factor: 0.5,
            patience: 10,
            threshold: 1e-4,
            floor: 1e-5,
        }
    }
}

impl PlateauConfig {
    pub fn validate(&self) -> Result<(), PlateauConfigError> {
        if !(self.initial_lr.is_finite() && self.initial_lr > 0.0) {
            return Err(PlateauConfigError::InitialLr(self.initial_lr));
        }
        if !(self.factor > 0.0 && self.factor < 1.0) {
            return Err(PlateauConfigError::Factor(self.factor));
        }
        if !(self.threshold.is_finite() && self.threshold >= 0.0) {
            return Err(PlateauConfigError::Threshold(self.threshold));
        }
        if !(self.floor.is_finite() && self.floor > 0.0) {
            return Err(PlateauConfigError::Floor(self.floor));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum PlateauConfigError {
    #[error("initial-lr must be a positive finite number, got {0}")]
    InitialLr(f64),

    #[error("factor must be in (0, 1), got {0}")]
    Factor(f64),

    #[error("threshold must be a non-negative finite number, got {0}")]
    Threshold(f64),

    #[error("floor must be a positive finite number, got {0}")]
    Floor(f64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlateauState {
    /// Tracking the metric, no pending decay.
    Watching,
    /// A decay was just applied; reverts to `Watching` on the next improvement.
    Decaying,
    /// The control value fell below the floor. Terminal.
    Terminated,
}

/// Reduce-on-plateau controller for a scalar learning-rate-like value.
///
/// One `observe` call per evaluation cycle. Improvement means the tracked
/// metric decreased by more than `threshold` below the best value seen;
/// after `patience + 1` consecutive stagnant observations the control value
/// is multiplied by `factor`. Crossing `floor` is the only path into
/// `Terminated`, and `Terminated` is absorbing.
#[derive(Debug)]
pub struct PlateauScheduler {
    config: PlateauConfig,
    lr: f64,
    best: Option<f64>,
    stale_evals: u32,
    state: PlateauState,
}

impl PlateauScheduler {
    pub fn new(config: PlateauConfig) -> Result<Self, PlateauConfigError> {
        config.validate()?;
        Ok(Self {
            lr: config.initial_lr,
            config,
            best: None,
            stale_evals: 0,
            state: PlateauState::Watching,
        })
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn state(&self) -> PlateauState {
        self.state
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn is_terminated(&self) -> bool {
        self.state == PlateauState::Terminated
    }

    /// Feeds one evaluation of the tracked metric and returns the new state.
    pub fn observe(&mut self, metric: f64) -> PlateauState {
        if self.state == PlateauState::Terminated {
            return self.state;
        }

        let improved = match self.best {
            None => true,
            Some(best) => best - metric > self.config.threshold,
        };

        if improved {
            self.best = Some(metric);
            self.stale_evals = 0;
            self.state = PlateauState::Watching;
        } else {
            self.stale_evals += 1;
            if self.stale_evals > self.config.patience {
                self.lr *= self.config.factor;
                self.stale_evals = 0;
                self.state = if self.lr < self.config.floor {
                    PlateauState::Terminated
                } else {
                    PlateauState::Decaying
                };
            }
        }

        self.state
    }
}
