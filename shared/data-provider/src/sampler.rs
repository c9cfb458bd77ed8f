use crate::record::{Record, RecordId};
use crate::size_index::SizeIndex;
use covalent_core::{Shuffle, deterministic_shuffle};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Sentinel for "consume every record exactly once per epoch".
pub const FULL_COVERAGE: i64 = -1;

// Salt namespaces for deriving sub-seeds from the epoch seed. Bucket keys
// occupy the low 32 bits, so these can't collide with them.
const ORDER_SALT: u64 = 1 << 33;
const WRAP_SALT: u64 = 1 << 34;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchMode {
    /// Fixed molecule count per batch; batches are atom-count homogeneous.
    #[default]
    Molecules,
    /// Greedy packing under a total atom budget per batch.
    Atoms,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SamplerConfig {
    pub batch_mode: BatchMode,
    /// Molecule count (`molecules` mode) or atom budget (`atoms` mode).
    pub batch_size: usize,
    /// `-1` for full coverage; `> 0` truncates or cycles the epoch to
    /// exactly that many batches.
    pub batches_per_epoch: i64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            batch_mode: BatchMode::Molecules,
            batch_size: 32,
            batches_per_epoch: FULL_COVERAGE,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), SamplerError> {
        if self.batch_size == 0 {
            return Err(SamplerError::ZeroBatchSize);
        }
        if self.batches_per_epoch != FULL_COVERAGE && self.batches_per_epoch <= 0 {
            return Err(SamplerError::InvalidBatchesPerEpoch(self.batches_per_epoch));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("batch size must be at least 1")]
    ZeroBatchSize,

    #[error("batches-per-epoch must be -1 (full coverage) or positive, got {0}")]
    InvalidBatchesPerEpoch(i64),

    #[error("batch plan came out empty")]
    EmptyPlan,
}

/// One epoch's worth of batches, in the order they should be consumed.
/// Built per epoch and discarded afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    batches: Vec<Vec<RecordId>>,
}

impl BatchPlan {
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn batches(&self) -> &[Vec<RecordId>] {
        &self.batches
    }

    pub fn into_batches(self) -> Vec<Vec<RecordId>> {
        self.batches
    }

    pub fn iter(&self) -> impl Iterator<Item = &[RecordId]> {
        self.batches.iter().map(Vec::as_slice)
    }
}

/// Plans batches over a (possibly sharded) size index.
///
/// `plan` keeps no cursor between calls, so one sampler instance can serve
/// interleaved train and validation epochs without interference.
#[derive(Debug, Clone)]
pub struct BatchSampler {
    config: SamplerConfig,
}

impl BatchSampler {
    pub fn new(config: SamplerConfig) -> Result<Self, SamplerError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Builds one epoch's plan. Pass `Shuffle::Seeded` with a per-epoch
    /// derived seed for training, `DontShuffle` for validation.
    pub fn plan(&self, index: &SizeIndex, shuffle: Shuffle) -> Result<BatchPlan, SamplerError> {
        let mut batches = self.single_pass(index, shuffle);
        if batches.is_empty() {
            return Err(SamplerError::EmptyPlan);
        }

        if self.config.batches_per_epoch != FULL_COVERAGE {
            let want = self.config.batches_per_epoch as usize;
            // cycle with a freshly reshuffled pass per wraparound (with
            // shuffling disabled the wrapped pass repeats, by construction)
            let mut wrap: u64 = 0;
            while batches.len() < want {
                wrap += 1;
                batches.extend(self.single_pass(index, shuffle.derive(WRAP_SALT | wrap)));
            }
            batches.truncate(want);
        }

        debug!(
            num_batches = batches.len(),
            num_records = index.num_records(),
            mode = ?self.config.batch_mode,
            "planned epoch"
        );
        Ok(BatchPlan { batches })
    }

    fn single_pass(&self, index: &SizeIndex, shuffle: Shuffle) -> Vec<Vec<RecordId>> {
        match self.config.batch_mode {
            BatchMode::Molecules => self.molecule_batches(index, shuffle),
            BatchMode::Atoms => self.atom_batches(index, shuffle),
        }
    }

    /// Slices every bucket into `batch_size` chunks. The partial tail chunk
    /// of a bucket is kept as a short batch: dropping it would silently
    /// break full coverage. Batch order (not composition) is then shuffled.
    fn molecule_batches(&self, index: &SizeIndex, shuffle: Shuffle) -> Vec<Vec<RecordId>> {
        let mut batches: Vec<Vec<RecordId>> = Vec::new();
        for (key, records) in index.buckets() {
            let mut ids: Vec<RecordId> = records.iter().map(|r| r.id).collect();
            deterministic_shuffle(&mut ids, shuffle.derive(key as u64));
            for chunk in ids.chunks(self.config.batch_size) {
                batches.push(chunk.to_vec());
            }
        }
        deterministic_shuffle(&mut batches, shuffle.derive(ORDER_SALT));
        batches
    }

    /// Globally shuffles all records, then packs greedily: a batch closes
    /// as soon as the next record would push its atom total past the
    /// budget. A single record heavier than the budget becomes a singleton
    /// batch rather than being dropped.
    fn atom_batches(&self, index: &SizeIndex, shuffle: Shuffle) -> Vec<Vec<RecordId>> {
        let mut records: Vec<Record> = index.records().collect();
        deterministic_shuffle(&mut records, shuffle);

        let budget = self.config.batch_size as u64;
        let mut batches: Vec<Vec<RecordId>> = Vec::new();
        let mut current: Vec<RecordId> = Vec::new();
        let mut atoms: u64 = 0;
        for record in records {
            let n = record.num_atoms as u64;
            if !current.is_empty() && atoms + n > budget {
                batches.push(std::mem::take(&mut current));
                atoms = 0;
            }
            current.push(record.id);
            atoms += n;
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn index(atom_counts: &[u32]) -> SizeIndex {
        let records: Vec<Record> = atom_counts
            .iter()
            .enumerate()
            .map(|(i, &n)| Record::new(i as RecordId, n, i as u64))
            .collect();
        SizeIndex::build(&records).unwrap()
    }

    fn sampler(mode: BatchMode, batch_size: usize, batches_per_epoch: i64) -> BatchSampler {
        BatchSampler::new(SamplerConfig {
            batch_mode: mode,
            batch_size,
            batches_per_epoch,
        })
        .unwrap()
    }

    #[test]
    fn config_validation() {
        assert!(matches!(
            BatchSampler::new(SamplerConfig {
                batch_size: 0,
                ..Default::default()
            }),
            Err(SamplerError::ZeroBatchSize)
        ));
        assert!(matches!(
            BatchSampler::new(SamplerConfig {
                batches_per_epoch: 0,
                ..Default::default()
            }),
            Err(SamplerError::InvalidBatchesPerEpoch(0))
        ));
        assert!(matches!(
            BatchSampler::new(SamplerConfig {
                batches_per_epoch: -2,
                ..Default::default()
            }),
            Err(SamplerError::InvalidBatchesPerEpoch(-2))
        ));
    }

    #[test]
    fn worked_example_without_shuffle() {
        // atom counts [3,3,3,5,5,7,7,7,7,7], batch_size 2:
        // bucket 3 -> [2,1], bucket 5 -> [2], bucket 7 -> [2,2,1]
        let index = index(&[3, 3, 3, 5, 5, 7, 7, 7, 7, 7]);
        let plan = sampler(BatchMode::Molecules, 2, FULL_COVERAGE)
            .plan(&index, Shuffle::DontShuffle)
            .unwrap();

        assert_eq!(plan.len(), 6);
        let sizes: Vec<usize> = plan.iter().map(<[RecordId]>::len).collect();
        assert_eq!(sizes, vec![2, 1, 2, 2, 2, 1]);

        let mut covered: Vec<RecordId> = plan.iter().flatten().copied().collect();
        covered.sort_unstable();
        assert_eq!(covered, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn molecule_batches_are_atom_count_homogeneous() {
        let index = index(&[3, 3, 3, 5, 5, 7, 7, 7, 7, 7, 9, 9, 9]);
        let by_id: BTreeMap<RecordId, u32> =
            index.records().map(|r| (r.id, r.num_atoms)).collect();
        let plan = sampler(BatchMode::Molecules, 4, FULL_COVERAGE)
            .plan(&index, Shuffle::seeded_from_u64(7))
            .unwrap();
        for batch in plan.iter() {
            let counts: Vec<u32> = batch.iter().map(|id| by_id[id]).collect();
            assert!(counts.windows(2).all(|w| w[0] == w[1]), "mixed {counts:?}");
        }
    }

    #[test]
    fn full_coverage_emits_every_id_exactly_once() {
        for mode in [BatchMode::Molecules, BatchMode::Atoms] {
            let index = index(&[3, 3, 3, 5, 5, 7, 7, 7, 7, 7, 11, 11]);
            let plan = sampler(mode, 8, FULL_COVERAGE)
                .plan(&index, Shuffle::seeded_from_u64(3))
                .unwrap();
            let mut covered: Vec<RecordId> = plan.iter().flatten().copied().collect();
            covered.sort_unstable();
            assert_eq!(covered, (0..12).collect::<Vec<_>>(), "mode {mode:?}");
        }
    }

    #[test]
    fn atom_batches_respect_the_budget() {
        let index = index(&[3, 4, 5, 6, 7, 8, 9, 3, 4, 5]);
        let by_id: BTreeMap<RecordId, u32> =
            index.records().map(|r| (r.id, r.num_atoms)).collect();
        let plan = sampler(BatchMode::Atoms, 12, FULL_COVERAGE)
            .plan(&index, Shuffle::seeded_from_u64(11))
            .unwrap();

        let totals: Vec<u64> = plan
            .iter()
            .map(|batch| batch.iter().map(|id| u64::from(by_id[id])).sum())
            .collect();
        for &t in &totals {
            assert!(t <= 12, "batch exceeded budget: {t}");
        }
        // greedy closure: merging any two adjacent batches would overflow
        for pair in totals.windows(2) {
            assert!(pair[0] + pair[1] > 12, "batches underfilled: {totals:?}");
        }
    }

    #[test]
    fn record_heavier_than_budget_forms_singleton_batch() {
        let index = index(&[30, 3, 3]);
        let plan = sampler(BatchMode::Atoms, 10, FULL_COVERAGE)
            .plan(&index, Shuffle::DontShuffle)
            .unwrap();
        let mut covered: Vec<RecordId> = plan.iter().flatten().copied().collect();
        covered.sort_unstable();
        assert_eq!(covered, vec![0, 1, 2]);
        assert!(plan.iter().any(|b| b.len() == 1 && b[0] == 0));
    }

    #[test]
    fn same_seed_produces_identical_plans() {
        let index = index(&[3, 3, 3, 3, 5, 5, 5, 5, 7, 7, 7, 7, 9, 9, 9, 9]);
        for mode in [BatchMode::Molecules, BatchMode::Atoms] {
            let s = sampler(mode, 3, FULL_COVERAGE);
            let a = s.plan(&index, Shuffle::seeded_from_u64(99)).unwrap();
            let b = s.plan(&index, Shuffle::seeded_from_u64(99)).unwrap();
            assert_eq!(a, b);
            let c = s.plan(&index, Shuffle::seeded_from_u64(100)).unwrap();
            assert_ne!(a, c, "different seeds should reorder (mode {mode:?})");
        }
    }

    #[test]
    fn shuffle_randomizes_order_not_composition() {
        let index = index(&[3, 3, 3, 3, 5, 5, 5, 5]);
        let s = sampler(BatchMode::Molecules, 2, FULL_COVERAGE);
        let plain = s.plan(&index, Shuffle::DontShuffle).unwrap();
        let shuffled = s.plan(&index, Shuffle::seeded_from_u64(5)).unwrap();
        assert_eq!(plain.len(), shuffled.len());
        let ids = |p: &BatchPlan| {
            let mut v: Vec<RecordId> = p.iter().flatten().copied().collect();
            v.sort_unstable();
            v
        };
        assert_eq!(ids(&plain), ids(&shuffled));
    }

    #[test]
    fn batches_per_epoch_truncates() {
        let index = index(&[3; 20]);
        let plan = sampler(BatchMode::Molecules, 2, 4)
            .plan(&index, Shuffle::seeded_from_u64(1))
            .unwrap();
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn batches_per_epoch_cycles_with_fresh_reshuffle() {
        let index = index(&[3, 3, 3, 3]);
        // one pass is 2 batches; ask for 7 => 3 full passes + truncation
        let plan = sampler(BatchMode::Molecules, 2, 7)
            .plan(&index, Shuffle::seeded_from_u64(21))
            .unwrap();
        assert_eq!(plan.len(), 7);

        // every wrapped pass still covers all ids before re-drawing
        let first_pass: Vec<RecordId> = plan.batches()[0..2].iter().flatten().copied().collect();
        let second_pass: Vec<RecordId> = plan.batches()[2..4].iter().flatten().copied().collect();
        let sorted = |mut v: Vec<RecordId>| {
            v.sort_unstable();
            v
        };
        assert_eq!(sorted(first_pass), vec![0, 1, 2, 3]);
        assert_eq!(sorted(second_pass), vec![0, 1, 2, 3]);
    }

    #[test]
    fn empty_shard_yields_empty_plan_error() {
        let index = index(&[3, 3]);
        let empty = crate::shard::shard(&index, 3, 2, Shuffle::DontShuffle).unwrap();
        assert!(matches!(
            sampler(BatchMode::Molecules, 2, FULL_COVERAGE).plan(&empty, Shuffle::DontShuffle),
            Err(SamplerError::EmptyPlan)
        ));
    }
}
