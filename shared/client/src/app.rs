use crate::cli::TrainArgs;
use anyhow::{Context, Result};
use covalent_core::Shuffle;
use covalent_data_provider::{
    Record, RecordId, SaeTable, SizeIndex, SyntheticAssembler, filter_skipped, shard,
    synthetic_records,
};
use covalent_train::{
    ComponentConfig, DataConfig, DummyModel, LossConfig, Normalization, RunConfig, RunOutcome,
    TrainLoopDriver,
};
use std::collections::{BTreeMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn run_training(args: TrainArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read run config {}", args.config.display()))?;
    let config: RunConfig = toml::from_str(&text)
        .with_context(|| format!("failed to parse run config {}", args.config.display()))?;
    config.validate()?;

    let (train_records, val_records) = build_records(&config, &args);
    info!(
        train = train_records.len(),
        val = val_records.len(),
        separate_val = config.data.separate_val,
        "dataset ready"
    );

    let all: Vec<Record> = train_records.iter().chain(&val_records).copied().collect();
    let mut assembler = SyntheticAssembler::new(&all);
    if let Some(path) = &config.sae_path {
        assembler = assembler.with_sae(SaeTable::from_file(path)?);
    }

    let pre_shuffle = Shuffle::seeded_from_u64(config.seed);
    let sharded = args.world_size > 1 && !config.data.ddp_load_full_dataset;
    let mut train_index = SizeIndex::build(&train_records)?;
    let mut val_index = SizeIndex::build(&val_records)?;
    if sharded {
        train_index = shard(&train_index, args.world_size, args.rank, pre_shuffle)?;
        val_index = shard(&val_index, args.world_size, args.rank, pre_shuffle)?;
    }
    info!(
        rank = args.rank,
        world_size = args.world_size,
        sharded,
        buckets = train_index.num_buckets(),
        records = train_index.num_records(),
        "train shard ready"
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping at the next batch boundary");
                cancel.cancel();
            }
        }
    });

    let model = DummyModel::new(config.seed, 0.5, 0.01, 64.0);
    let driver = TrainLoopDriver::new(
        &config,
        train_index,
        val_index,
        Box::new(assembler),
        model,
        cancel,
    )?;
    let (report, model) = driver.run().await?;

    info!(
        outcome = ?report.outcome,
        epochs = report.epochs_run,
        steps = model.steps(),
        "training run finished"
    );
    if let Some(last) = report.summaries.last() {
        info!(
            train_loss = last.train_loss,
            val_loss = ?last.val_loss,
            lr = last.lr,
            "final epoch"
        );
    }
    if report.outcome == RunOutcome::Cancelled {
        warn!("run was cancelled; the partial epoch was discarded");
    }
    Ok(())
}

/// Resolves the two record sequences that cross into the training core:
/// either a held-out tail of the training source, or a distinct second
/// source when `separate-val` is set.
fn build_records(config: &RunConfig, args: &TrainArgs) -> (Vec<Record>, Vec<Record>) {
    let records = synthetic_records(
        args.num_records,
        args.min_atoms,
        args.max_atoms,
        config.seed,
    );
    let skip: HashSet<RecordId> = config.data.skip_ids.iter().copied().collect();
    if !skip.is_empty() {
        info!(skipped = skip.len(), "excluding configured record ids");
    }
    let records = filter_skipped(records, &skip);

    if config.data.separate_val {
        let mut val = synthetic_records(
            (args.num_records / 8).max(1),
            args.min_atoms,
            args.max_atoms,
            config.seed.wrapping_add(1),
        );
        for record in &mut val {
            record.id += args.num_records as u64;
        }
        (records, filter_skipped(val, &skip))
    } else {
        // held-out tail; at least one record on each side
        let val_count = ((records.len() as f64) * config.data.val_fraction).round() as usize;
        let val_count = val_count.clamp(1, records.len().saturating_sub(1).max(1));
        let split = records.len() - val_count;
        (records[..split].to_vec(), records[split..].to_vec())
    }
}

/// Starting-point configuration emitted by `print-config`.
pub fn example_config() -> RunConfig {
    let component = |function: &str, weight: f64, normalization: Normalization| ComponentConfig {
        weight,
        function: function.to_string(),
        kwargs: serde_json::json!({}),
        normalization,
        target: None,
    };
    RunConfig {
        epochs: 50,
        data: DataConfig {
            batch_size: 64,
            ..Default::default()
        },
        loss: LossConfig {
            components: BTreeMap::from([
                (
                    "energy".to_string(),
                    component("mse", 1.0, Normalization::PerStructure),
                ),
                (
                    "forces".to_string(),
                    ComponentConfig {
                        kwargs: serde_json::json!({ "delta": 1.0 }),
                        ..component("huber", 0.1, Normalization::PerAtom)
                    },
                ),
                (
                    "charges".to_string(),
                    component("mse", 0.05, Normalization::PerAtom),
                ),
            ]),
        },
        ..Default::default()
    }
}
