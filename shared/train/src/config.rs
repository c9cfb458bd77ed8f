use crate::loss::{ComponentError, LossTerm, Normalization, component_from_name};
use covalent_core::{PlateauConfig, PlateauConfigError};
use covalent_data_provider::{BatchMode, FULL_COVERAGE, RecordId, SamplerConfig, SamplerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("epochs must be at least 1")]
    ZeroEpochs,

    #[error("eval-every must be at least 1")]
    ZeroEvalEvery,

    #[error("val-fraction must be in [0, 1), got {0}")]
    ValFraction(f64),

    #[error("prefetch-depth must be at least 1")]
    ZeroPrefetchDepth,

    #[error("no loss components configured")]
    NoLossComponents,

    #[error("loss component '{name}' has non-positive weight {weight}")]
    NonPositiveWeight { name: String, weight: f64 },

    #[error("loss component '{name}': {source}")]
    Component {
        name: String,
        #[source]
        source: ComponentError,
    },

    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error(transparent)]
    Scheduler(#[from] PlateauConfigError),
}

/// Batch construction and sharding options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DataConfig {
    pub batch_mode: BatchMode,
    /// Molecule count (`molecules` mode) or atom budget (`atoms` mode).
    pub batch_size: usize,
    /// Validation batch size; defaults to twice the train batch size, since
    /// evaluation has no optimizer state to hold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val_batch_size: Option<usize>,
    pub shuffle: bool,
    pub batches_per_epoch: i64,
    /// Give every rank the full dataset instead of a shard. Worth it for
    /// small datasets; gradient averaging reconciles the differing batch
    /// composition.
    pub ddp_load_full_dataset: bool,
    /// Held-out fraction of the training source used for validation when no
    /// separate validation source is configured.
    pub val_fraction: f64,
    /// Validation records come from a distinct source rather than a
    /// held-out split.
    pub separate_val: bool,
    /// Record ids excluded from training and validation entirely.
    pub skip_ids: Vec<RecordId>,
    /// Assembled batches buffered ahead of the training step.
    pub prefetch_depth: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            batch_mode: BatchMode::default(),
            batch_size: 32,
            val_batch_size: None,
            shuffle: true,
            batches_per_epoch: FULL_COVERAGE,
            ddp_load_full_dataset: false,
            val_fraction: 0.1,
            separate_val: false,
            skip_ids: Vec::new(),
            prefetch_depth: 4,
        }
    }
}

impl DataConfig {
    pub fn train_sampler(&self) -> SamplerConfig {
        SamplerConfig {
            batch_mode: self.batch_mode,
            batch_size: self.batch_size,
            batches_per_epoch: self.batches_per_epoch,
        }
    }

    /// Validation always runs full coverage so the metric is comparable
    /// across epochs.
    pub fn val_sampler(&self) -> SamplerConfig {
        SamplerConfig {
            batch_mode: self.batch_mode,
            batch_size: self.val_batch_size.unwrap_or(self.batch_size * 2),
            batches_per_epoch: FULL_COVERAGE,
        }
    }
}

/// One configured loss term.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ComponentConfig {
    pub weight: f64,
    /// Registry tag of the component function.
    #[serde(rename = "fn")]
    pub function: String,
    pub kwargs: serde_json::Value,
    pub normalization: Normalization,
    /// Target key in the batch; defaults to the component's own name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            weight: 1.0,
            function: "mse".to_string(),
            kwargs: serde_json::Value::Null,
            normalization: Normalization::default(),
            target: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LossConfig {
    pub components: BTreeMap<String, ComponentConfig>,
}

/// The whole run, built once at startup and passed around immutably; each
/// component receives only the slice it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RunConfig {
    pub epochs: u32,
    /// Run validation (and feed the scheduler) every N epochs.
    pub eval_every: u32,
    pub seed: u64,
    pub data: DataConfig,
    pub loss: LossConfig,
    pub scheduler: PlateauConfig,
    /// Optional per-element baseline energy table (JSON).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sae_path: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            eval_every: 1,
            seed: 0,
            data: DataConfig::default(),
            loss: LossConfig::default(),
            scheduler: PlateauConfig::default(),
            sae_path: None,
        }
    }
}

impl RunConfig {
    /// Eager startup validation: anything wrong here aborts before the
    /// first epoch is planned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.epochs == 0 {
            return Err(ConfigError::ZeroEpochs);
        }
        if self.eval_every == 0 {
            return Err(ConfigError::ZeroEvalEvery);
        }
        if !(0.0..1.0).contains(&self.data.val_fraction) {
            return Err(ConfigError::ValFraction(self.data.val_fraction));
        }
        if self.data.prefetch_depth == 0 {
            return Err(ConfigError::ZeroPrefetchDepth);
        }
        self.data.train_sampler().validate()?;
        self.data.val_sampler().validate()?;
        self.scheduler.validate()?;
        self.build_loss_terms().map(drop)
    }

    /// Resolves every configured component through the registry.
    pub fn build_loss_terms(&self) -> Result<Vec<LossTerm>, ConfigError> {
        if self.loss.components.is_empty() {
            return Err(ConfigError::NoLossComponents);
        }
        let mut terms = Vec::with_capacity(self.loss.components.len());
        for (name, component) in &self.loss.components {
            if !(component.weight.is_finite() && component.weight > 0.0) {
                return Err(ConfigError::NonPositiveWeight {
                    name: name.clone(),
                    weight: component.weight,
                });
            }
            let function = component_from_name(&component.function, &component.kwargs)
                .map_err(|source| ConfigError::Component {
                    name: name.clone(),
                    source,
                })?;
            terms.push(LossTerm {
                name: name.clone(),
                target: component.target.clone().unwrap_or_else(|| name.clone()),
                weight: component.weight,
                normalization: component.normalization,
                component: function,
            });
        }
        Ok(terms)
    }
}
