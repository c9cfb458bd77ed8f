use crate::driver::EpochSummary;
use crate::loss::LossBreakdown;
use covalent_data_provider::{AssembledBatch, TargetMap};

/// The predictor and its optimizer, behind one boundary. The driver never
/// sees parameters or gradients; it hands a batch in, receives prediction
/// columns back, and asks for an update at the scheduler's current control
/// value. Implementations run on a blocking thread, so they may do heavy
/// compute inline.
pub trait Trainable: Send + 'static {
    /// Forward pass: one prediction column per target the loss references.
    fn forward(&mut self, batch: &AssembledBatch) -> anyhow::Result<TargetMap>;

    /// Backward pass + optimizer step for the most recent forward.
    fn step(&mut self, loss: &LossBreakdown, lr: f64) -> anyhow::Result<()>;
}

/// Invoked after the post-validation barrier, once all ranks agree on the
/// epoch's outcome. Cadence and persistence format belong to the
/// implementation.
pub trait CheckpointHook: Send {
    fn after_validation(&mut self, summary: &EpochSummary) -> anyhow::Result<()>;
}
