use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SaeError {
    #[error("no baseline energy for element {0}")]
    UnknownElement(u8),
}

/// Per-element baseline energies, produced by an external linear-regression
/// fit over the training set. Subtracting the summed offsets centers the
/// energy target so the model only learns the residual.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SaeTable {
    offsets: BTreeMap<u8, f64>,
}

impl SaeTable {
    pub fn new(offsets: BTreeMap<u8, f64>) -> Self {
        Self { offsets }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read SAE table {}", path.display()))?;
        let table: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse SAE table {}", path.display()))?;
        info!(
            elements = table.offsets.len(),
            path = %path.display(),
            "loaded SAE baseline table"
        );
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Summed baseline for one structure's composition. Every element must
    /// have a fitted offset; a miss means the table and dataset disagree.
    pub fn offset_for(&self, atomic_numbers: &[u8]) -> Result<f64, SaeError> {
        atomic_numbers
            .iter()
            .map(|z| {
                self.offsets
                    .get(z)
                    .copied()
                    .ok_or(SaeError::UnknownElement(*z))
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SaeTable {
        SaeTable::new(BTreeMap::from([(1, -0.5), (6, -37.8), (8, -75.0)]))
    }

    #[test]
    fn sums_offsets_per_composition() {
        // water: two hydrogens and one oxygen
        let offset = table().offset_for(&[1, 1, 8]).unwrap();
        assert!((offset - (-76.0)).abs() < 1e-12);
    }

    #[test]
    fn unknown_element_is_an_error() {
        assert!(matches!(
            table().offset_for(&[1, 79]),
            Err(SaeError::UnknownElement(79))
        ));
    }

    #[test]
    fn json_round_trip() {
        let text = serde_json::to_string(&table()).unwrap();
        let parsed: SaeTable = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.len(), 3);
        assert!((parsed.offset_for(&[6]).unwrap() - (-37.8)).abs() < 1e-12);
    }
}
