use crate::record::{Record, RecordId};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SizeIndexError {
    #[error("cannot build a size index over an empty dataset")]
    EmptyDataset,
}

/// Records grouped by atom count (or a caller-supplied key).
///
/// Buckets partition the record set: every record lands in exactly one
/// bucket, and within a bucket the source insertion order is preserved, so
/// any downstream seeded shuffle is reproducible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeIndex {
    buckets: BTreeMap<u32, Vec<Record>>,
    num_records: usize,
}

impl SizeIndex {
    /// Groups by atom count in a single pass.
    pub fn build(records: &[Record]) -> Result<Self, SizeIndexError> {
        Self::build_with_key(records, |r| r.num_atoms)
    }

    pub fn build_with_key(
        records: &[Record],
        key: impl Fn(&Record) -> u32,
    ) -> Result<Self, SizeIndexError> {
        if records.is_empty() {
            return Err(SizeIndexError::EmptyDataset);
        }
        let mut buckets: BTreeMap<u32, Vec<Record>> = BTreeMap::new();
        for record in records {
            buckets.entry(key(record)).or_default().push(*record);
        }
        Ok(Self {
            buckets,
            num_records: records.len(),
        })
    }

    pub(crate) fn from_buckets(buckets: BTreeMap<u32, Vec<Record>>) -> Self {
        let num_records = buckets.values().map(Vec::len).sum();
        Self {
            buckets,
            num_records,
        }
    }

    pub fn buckets(&self) -> impl Iterator<Item = (u32, &[Record])> {
        self.buckets.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    pub fn bucket_sizes(&self) -> BTreeMap<u32, usize> {
        self.buckets.iter().map(|(k, v)| (*k, v.len())).collect()
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn num_records(&self) -> usize {
        self.num_records
    }

    pub fn is_empty(&self) -> bool {
        self.num_records == 0
    }

    /// All record ids, in bucket order.
    pub fn ids(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.buckets.values().flatten().map(|r| r.id)
    }

    /// All records, in bucket order.
    pub fn records(&self) -> impl Iterator<Item = Record> + '_ {
        self.buckets.values().flatten().copied()
    }
}
