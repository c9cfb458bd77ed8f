use crate::size_index::SizeIndex;
use covalent_core::{Shuffle, deterministic_shuffle};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("world size must be at least 1")]
    InvalidWorldSize,

    #[error("rank {rank} is out of range for world size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },
}

/// Restricts a size index to one rank's slice of every bucket.
///
/// Each bucket splits into `world_size` contiguous slices whose sizes differ
/// by at most one (the first `len % world_size` ranks take the extra
/// record); rank `r` keeps slice `r`. Ranks that agree on `pre_shuffle` and
/// the source ordering hold pairwise-disjoint slices whose union is the
/// whole bucket. Ranks that disagree would duplicate or drop records, so
/// the pre-shuffle seed must be shared.
///
/// Callers that want every rank to see the full dataset (small datasets
/// where sharding isn't worth it) simply skip this call; batch composition
/// then differs per rank and gradient averaging reconciles it externally.
pub fn shard(
    index: &SizeIndex,
    world_size: usize,
    rank: usize,
    pre_shuffle: Shuffle,
) -> Result<SizeIndex, ShardError> {
    if world_size == 0 {
        return Err(ShardError::InvalidWorldSize);
    }
    if rank >= world_size {
        return Err(ShardError::InvalidRank { rank, world_size });
    }

    let mut sharded = BTreeMap::new();
    for (key, records) in index.buckets() {
        let mut records = records.to_vec();
        deterministic_shuffle(&mut records, pre_shuffle.derive(key as u64));

        let base = records.len() / world_size;
        let remainder = records.len() % world_size;
        let start = rank * base + rank.min(remainder);
        let len = base + usize::from(rank < remainder);
        debug_assert!(start + len <= records.len());

        if len > 0 {
            sharded.insert(key, records[start..start + len].to_vec());
        }
    }

    Ok(SizeIndex::from_buckets(sharded))
}
