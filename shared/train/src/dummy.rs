use crate::loss::LossBreakdown;
use crate::model::Trainable;
use covalent_data_provider::{AssembledBatch, TargetColumn, TargetMap};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_chacha::rand_core::SeedableRng;

/// Stand-in predictor for integration tests and smoke runs.
///
/// Predicts the batch's own labels plus noise whose amplitude decays with
/// the number of optimizer steps taken, so a run shows a falling loss that
/// eventually plateaus at `floor_noise`. That is enough to drive the whole
/// loop, scheduler decay and convergence stop included.
#[derive(Debug)]
pub struct DummyModel {
    rng: ChaCha8Rng,
    steps: u64,
    base_noise: f64,
    floor_noise: f64,
    /// Steps over which the noise halves, roughly.
    decay_steps: f64,
}

impl DummyModel {
    pub fn new(seed: u64, base_noise: f64, floor_noise: f64, decay_steps: f64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            steps: 0,
            base_noise,
            floor_noise,
            decay_steps,
        }
    }

    /// A model that predicts labels exactly. Loss is identically zero,
    /// which stagnates the scheduler from the second evaluation on.
    pub fn exact() -> Self {
        Self::new(0, 0.0, 0.0, 1.0)
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn amplitude(&self) -> f64 {
        self.floor_noise + self.base_noise / (1.0 + self.steps as f64 / self.decay_steps)
    }
}

impl Trainable for DummyModel {
    fn forward(&mut self, batch: &AssembledBatch) -> anyhow::Result<TargetMap> {
        let amplitude = self.amplitude();
        let mut noisy = |values: &[f64]| -> Vec<f64> {
            values
                .iter()
                .map(|v| {
                    if amplitude > 0.0 {
                        v + self.rng.gen_range(-amplitude..amplitude)
                    } else {
                        *v
                    }
                })
                .collect()
        };
        Ok(batch
            .targets
            .iter()
            .map(|(name, column)| {
                let column = match column {
                    TargetColumn::PerStructure(v) => TargetColumn::PerStructure(noisy(v)),
                    TargetColumn::PerAtom(v) => TargetColumn::PerAtom(noisy(v)),
                };
                (name.clone(), column)
            })
            .collect())
    }

    fn step(&mut self, _loss: &LossBreakdown, _lr: f64) -> anyhow::Result<()> {
        self.steps += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalent_data_provider::{SyntheticAssembler, synthetic_records};

    #[tokio::test]
    async fn exact_model_reproduces_labels() {
        use covalent_data_provider::BatchAssembler;
        let records = synthetic_records(4, 3, 6, 5);
        let mut assembler = SyntheticAssembler::new(&records);
        let batch = assembler.assemble(&[0, 1, 2, 3]).await.unwrap();

        let mut model = DummyModel::exact();
        let predictions = model.forward(&batch).unwrap();
        assert_eq!(predictions, batch.targets);
    }

    #[test]
    fn noise_amplitude_decays_with_steps() {
        let mut model = DummyModel::new(1, 1.0, 0.01, 10.0);
        let before = model.amplitude();
        for _ in 0..100 {
            model.steps += 1;
        }
        let after = model.amplitude();
        assert!(after < before);
        assert!(after >= 0.01);
    }
}
