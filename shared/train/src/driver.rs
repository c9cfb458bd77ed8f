use crate::config::{ConfigError, RunConfig};
use crate::fetch::DataFetcher;
use crate::loss::{LocalReducer, LossAggregator, LossBreakdown, LossError, LossPartials, MetricReducer};
use crate::model::{CheckpointHook, Trainable};
use covalent_core::{Barrier, BarrierError, NoopBarrier, PlateauScheduler, PlateauState, Shuffle};
use covalent_data_provider::{AssembledBatch, BatchAssembler, BatchSampler, SamplerError, SizeIndex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to plan epoch {epoch}: {source}")]
    Plan {
        epoch: u32,
        #[source]
        source: SamplerError,
    },

    #[error("epoch {epoch} batch {batch}: assembly failed: {source}")]
    Assembly {
        epoch: u32,
        batch: usize,
        source: anyhow::Error,
    },

    #[error("epoch {epoch} batch {batch}: {source}")]
    Loss {
        epoch: u32,
        batch: usize,
        #[source]
        source: LossError,
    },

    #[error("epoch {epoch} batch {batch}: model failed: {source}")]
    Model {
        epoch: u32,
        batch: usize,
        source: anyhow::Error,
    },

    #[error("epoch {epoch} batch {batch}: non-finite training loss ({value})")]
    NonFiniteLoss {
        epoch: u32,
        batch: usize,
        value: f64,
    },

    #[error("training thread crashed")]
    TrainCrashed,

    #[error("model instance lost; a previous step must have failed")]
    ModelUnavailable,

    #[error("post-validation barrier failed: {0}")]
    Barrier(#[from] BarrierError),

    #[error("metric reduction failed: {0}")]
    Reduce(anyhow::Error),

    #[error("checkpoint hook failed: {0}")]
    Checkpoint(anyhow::Error),
}

enum StepFailure {
    Model(anyhow::Error),
    Loss(LossError),
}

impl StepFailure {
    fn into_train_error(self, epoch: u32, batch: usize) -> TrainError {
        match self {
            StepFailure::Model(source) => TrainError::Model {
                epoch,
                batch,
                source,
            },
            StepFailure::Loss(source) => TrainError::Loss {
                epoch,
                batch,
                source,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every configured epoch ran.
    CompletedEpochs,
    /// The scheduler's control value crossed its floor: normal termination
    /// on convergence stagnation, not an error.
    Converged,
    /// External cancellation, honored at a batch boundary.
    Cancelled,
}

/// Per-epoch digest for the observability collaborator.
#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: u32,
    pub num_batches: usize,
    /// Mean weighted training loss over the epoch's batches.
    pub train_loss: f64,
    /// Unweighted normalized per-term means.
    pub train_terms: BTreeMap<String, f64>,
    pub val_loss: Option<f64>,
    pub val_terms: BTreeMap<String, f64>,
    pub lr: f64,
    pub scheduler_state: PlateauState,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub epochs_run: u32,
    pub summaries: Vec<EpochSummary>,
}

struct TrainEpochStats {
    partials: LossPartials,
    mean_loss: f64,
    num_batches: usize,
}

/// Orchestrates the whole run: plans epochs, drains the prefetch queue,
/// drives the model on a blocking thread, validates, feeds the plateau
/// scheduler, and decides termination. Owns the scheduler state
/// exclusively.
pub struct TrainLoopDriver<M: Trainable> {
    epochs: u32,
    eval_every: u32,
    shuffle: bool,
    base_shuffle: Shuffle,
    train_sampler: BatchSampler,
    val_sampler: BatchSampler,
    train_index: SizeIndex,
    val_index: SizeIndex,
    fetcher: DataFetcher,
    aggregator: Arc<LossAggregator>,
    scheduler: PlateauScheduler,
    // moved into spawn_blocking for each step and put back afterwards
    model: Option<M>,
    barrier: Arc<dyn Barrier>,
    reducer: Arc<dyn MetricReducer>,
    checkpoint: Option<Box<dyn CheckpointHook>>,
    cancel: CancellationToken,
}

impl<M: Trainable> TrainLoopDriver<M> {
    pub fn new(
        config: &RunConfig,
        train_index: SizeIndex,
        val_index: SizeIndex,
        assembler: Box<dyn BatchAssembler>,
        model: M,
        cancel: CancellationToken,
    ) -> Result<Self, TrainError> {
        config.validate()?;
        Ok(Self {
            epochs: config.epochs,
            eval_every: config.eval_every,
            shuffle: config.data.shuffle,
            base_shuffle: Shuffle::seeded_from_u64(config.seed),
            train_sampler: BatchSampler::new(config.data.train_sampler())
                .map_err(ConfigError::from)?,
            val_sampler: BatchSampler::new(config.data.val_sampler())
                .map_err(ConfigError::from)?,
            train_index,
            val_index,
            fetcher: DataFetcher::new(assembler, config.data.prefetch_depth),
            aggregator: Arc::new(LossAggregator::new(config.build_loss_terms()?)),
            scheduler: PlateauScheduler::new(config.scheduler).map_err(ConfigError::from)?,
            model: Some(model),
            barrier: Arc::new(NoopBarrier),
            reducer: Arc::new(LocalReducer),
            checkpoint: None,
            cancel,
        })
    }

    pub fn with_barrier(mut self, barrier: Arc<dyn Barrier>) -> Self {
        self.barrier = barrier;
        self
    }

    pub fn with_reducer(mut self, reducer: Arc<dyn MetricReducer>) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn with_checkpoint_hook(mut self, hook: Box<dyn CheckpointHook>) -> Self {
        self.checkpoint = Some(hook);
        self
    }

    pub async fn run(mut self) -> Result<(RunReport, M), TrainError> {
        let mut summaries = Vec::new();
        let mut outcome = RunOutcome::CompletedEpochs;
        let mut epochs_run = 0;

        for epoch in 0..self.epochs {
            if self.cancel.is_cancelled() {
                info!(epoch, "cancelled before epoch start");
                outcome = RunOutcome::Cancelled;
                break;
            }
            let epoch_start = Instant::now();

            let Some(stats) = self.train_epoch(epoch).await? else {
                outcome = RunOutcome::Cancelled;
                break;
            };
            epochs_run = epoch + 1;

            let evaluate = (epoch + 1) % self.eval_every == 0;
            let (val_loss, val_terms) = if evaluate {
                let Some(mut partials) = self.validation_epoch(epoch).await? else {
                    outcome = RunOutcome::Cancelled;
                    break;
                };
                // partial sums first, divide after: ranks see different
                // numbers of validation structures
                self.reducer
                    .all_reduce(&mut partials)
                    .map_err(TrainError::Reduce)?;
                let total = partials.total();
                self.scheduler.observe(total);
                (Some(total), partials.term_means())
            } else {
                (None, BTreeMap::new())
            };

            let summary = EpochSummary {
                epoch,
                num_batches: stats.num_batches,
                train_loss: stats.mean_loss,
                train_terms: stats.partials.term_means(),
                val_loss,
                val_terms,
                lr: self.scheduler.lr(),
                scheduler_state: self.scheduler.state(),
                duration: epoch_start.elapsed(),
            };
            info!(
                epoch,
                num_batches = summary.num_batches,
                train_loss = summary.train_loss,
                val_loss = ?summary.val_loss,
                lr = summary.lr,
                scheduler = ?summary.scheduler_state,
                duration = ?summary.duration,
                "epoch finished"
            );

            if evaluate {
                // all ranks agree on this epoch's validation before
                // anything is allowed to checkpoint
                self.barrier.wait()?;
                if let Some(hook) = &mut self.checkpoint {
                    hook.after_validation(&summary).map_err(TrainError::Checkpoint)?;
                }
            }
            summaries.push(summary);

            if self.scheduler.is_terminated() {
                info!(epoch, lr = self.scheduler.lr(), "learning rate crossed the floor, stopping");
                outcome = RunOutcome::Converged;
                break;
            }
        }

        let Some(model) = self.model.take() else {
            return Err(TrainError::ModelUnavailable);
        };
        Ok((
            RunReport {
                outcome,
                epochs_run,
                summaries,
            },
            model,
        ))
    }

    /// One full-coverage training pass. Returns `None` when cancellation
    /// arrived at a batch boundary; the partial epoch is discarded.
    async fn train_epoch(&mut self, epoch: u32) -> Result<Option<TrainEpochStats>, TrainError> {
        let shuffle = if self.shuffle {
            self.base_shuffle.derive(u64::from(epoch))
        } else {
            Shuffle::DontShuffle
        };
        let plan = self
            .train_sampler
            .plan(&self.train_index, shuffle)
            .map_err(|source| TrainError::Plan { epoch, source })?;
        let mut stream = self.fetcher.fetch_epoch(plan);

        let mut partials = LossPartials::default();
        let mut loss_sum = 0.0;
        let mut batch_index = 0usize;

        while let Some(result) = stream.next_batch.recv().await {
            if self.cancel.is_cancelled() {
                info!(
                    epoch,
                    batch = batch_index,
                    "cancelled at batch boundary, discarding partial epoch"
                );
                return Ok(None);
            }
            let batch = result.map_err(|source| TrainError::Assembly {
                epoch,
                batch: batch_index,
                source,
            })?;
            let breakdown = self.train_step(epoch, batch_index, batch).await?;
            if !breakdown.total.is_finite() {
                return Err(TrainError::NonFiniteLoss {
                    epoch,
                    batch: batch_index,
                    value: breakdown.total,
                });
            }
            debug!(epoch, batch = batch_index, loss = breakdown.total, "trained batch");
            loss_sum += breakdown.total;
            partials.accumulate(&breakdown);
            batch_index += 1;
        }

        Ok(Some(TrainEpochStats {
            partials,
            mean_loss: loss_sum / batch_index.max(1) as f64,
            num_batches: batch_index,
        }))
    }

    async fn train_step(
        &mut self,
        epoch: u32,
        batch_index: usize,
        batch: AssembledBatch,
    ) -> Result<LossBreakdown, TrainError> {
        let Some(mut model) = self.model.take() else {
            return Err(TrainError::ModelUnavailable);
        };
        let aggregator = self.aggregator.clone();
        let lr = self.scheduler.lr();

        let (model, result) = spawn_blocking(move || {
            let result = (|| {
                let predictions = model.forward(&batch).map_err(StepFailure::Model)?;
                let breakdown = aggregator
                    .evaluate(&batch, &predictions)
                    .map_err(StepFailure::Loss)?;
                model.step(&breakdown, lr).map_err(StepFailure::Model)?;
                Ok(breakdown)
            })();
            (model, result)
        })
        .await
        .map_err(|_| TrainError::TrainCrashed)?;

        self.model = Some(model);
        result.map_err(|failure| failure.into_train_error(epoch, batch_index))
    }

    /// Full-coverage, unshuffled validation pass accumulating per-term
    /// pre-reduction partials. Returns `None` on cancellation.
    async fn validation_epoch(&mut self, epoch: u32) -> Result<Option<LossPartials>, TrainError> {
        let plan = self
            .val_sampler
            .plan(&self.val_index, Shuffle::DontShuffle)
            .map_err(|source| TrainError::Plan { epoch, source })?;
        let mut stream = self.fetcher.fetch_epoch(plan);

        let mut partials = LossPartials::default();
        let mut batch_index = 0usize;
        while let Some(result) = stream.next_batch.recv().await {
            if self.cancel.is_cancelled() {
                info!(epoch, "cancelled during validation");
                return Ok(None);
            }
            let batch = result.map_err(|source| TrainError::Assembly {
                epoch,
                batch: batch_index,
                source,
            })?;

            let Some(mut model) = self.model.take() else {
                return Err(TrainError::ModelUnavailable);
            };
            let aggregator = self.aggregator.clone();
            let (model, result) = spawn_blocking(move || {
                let result = (|| {
                    let predictions = model.forward(&batch).map_err(StepFailure::Model)?;
                    aggregator
                        .evaluate(&batch, &predictions)
                        .map_err(StepFailure::Loss)
                })();
                (model, result)
            })
            .await
            .map_err(|_| TrainError::TrainCrashed)?;
            self.model = Some(model);

            let breakdown = result.map_err(|failure| failure.into_train_error(epoch, batch_index))?;
            partials.accumulate(&breakdown);
            batch_index += 1;
        }

        Ok(Some(partials))
    }
}
