use crate::record::RecordId;
use anyhow::Result;
use std::collections::BTreeMap;
use thiserror::Error;

/// One named target (or prediction) column of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetColumn {
    /// One value per structure (e.g. total energy).
    PerStructure(Vec<f64>),
    /// Values per atom, flattened over the whole batch; a fixed number of
    /// components per atom (1 for charges, 3 for forces).
    PerAtom(Vec<f64>),
}

impl TargetColumn {
    pub fn values(&self) -> &[f64] {
        match self {
            TargetColumn::PerStructure(v) | TargetColumn::PerAtom(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }
}

pub type TargetMap = BTreeMap<String, TargetColumn>;

#[derive(Debug, Error)]
pub enum BatchContractError {
    #[error("batch has no structures")]
    Empty,

    #[error("expected {expected} {field} values, got {got}")]
    FieldLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error(
        "target '{name}' has {got} values, not a whole number of components for {total_atoms} atoms"
    )]
    RaggedPerAtomTarget {
        name: String,
        got: usize,
        total_atoms: u64,
    },

    #[error("target '{name}' has {got} values for {structures} structures")]
    PerStructureTargetLength {
        name: String,
        got: usize,
        structures: usize,
    },
}

/// Structure-of-arrays tensor batch handed to the model. Coordinates and
/// atomic numbers are concatenated over structures in `ids` order;
/// `atom_counts` delimits the per-structure segments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledBatch {
    pub ids: Vec<RecordId>,
    pub atom_counts: Vec<u32>,
    /// Flattened xyz coordinates, `3 * total_atoms` values.
    pub coords: Vec<f64>,
    pub atomic_numbers: Vec<u8>,
    pub total_charges: Vec<f64>,
    pub targets: TargetMap,
}

impl AssembledBatch {
    pub fn num_structures(&self) -> usize {
        self.ids.len()
    }

    pub fn total_atoms(&self) -> u64 {
        self.atom_counts.iter().map(|&n| u64::from(n)).sum()
    }

    /// Shape check for the assembler contract. A violation is a
    /// configuration or data mismatch, fatal for the batch; it is never
    /// skipped or retried.
    pub fn check_shapes(&self) -> Result<(), BatchContractError> {
        let structures = self.num_structures();
        if structures == 0 {
            return Err(BatchContractError::Empty);
        }
        let total_atoms = self.total_atoms();

        let expect = |field, expected: usize, got: usize| {
            if expected == got {
                Ok(())
            } else {
                Err(BatchContractError::FieldLength {
                    field,
                    expected,
                    got,
                })
            }
        };
        expect("atom-count", structures, self.atom_counts.len())?;
        expect("coordinate", 3 * total_atoms as usize, self.coords.len())?;
        expect(
            "atomic-number",
            total_atoms as usize,
            self.atomic_numbers.len(),
        )?;
        expect("total-charge", structures, self.total_charges.len())?;

        for (name, column) in &self.targets {
            match column {
                TargetColumn::PerStructure(v) => {
                    if v.len() != structures {
                        return Err(BatchContractError::PerStructureTargetLength {
                            name: name.clone(),
                            got: v.len(),
                            structures,
                        });
                    }
                }
                TargetColumn::PerAtom(v) => {
                    if total_atoms == 0 || v.len() as u64 % total_atoms != 0 {
                        return Err(BatchContractError::RaggedPerAtomTarget {
                            name: name.clone(),
                            got: v.len(),
                            total_atoms,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Turns an index batch into a tensor batch. Implementations own payload
/// decoding and file access; the training core never looks inside payloads.
#[async_trait::async_trait]
pub trait BatchAssembler: Send {
    async fn assemble(&mut self, ids: &[RecordId]) -> Result<AssembledBatch>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> AssembledBatch {
        AssembledBatch {
            ids: vec![10, 11],
            atom_counts: vec![2, 3],
            coords: vec![0.0; 15],
            atomic_numbers: vec![1, 8, 1, 1, 6],
            total_charges: vec![0.0, -1.0],
            targets: TargetMap::from([
                ("energy".to_string(), TargetColumn::PerStructure(vec![
                    -1.5, -2.5,
                ])),
                ("forces".to_string(), TargetColumn::PerAtom(vec![0.0; 15])),
            ]),
        }
    }

    #[test]
    fn well_formed_batch_passes() {
        batch().check_shapes().unwrap();
    }

    #[test]
    fn wrong_coordinate_count_is_rejected() {
        let mut b = batch();
        b.coords.pop();
        assert!(matches!(
            b.check_shapes(),
            Err(BatchContractError::FieldLength {
                field: "coordinate",
                ..
            })
        ));
    }

    #[test]
    fn ragged_per_atom_target_is_rejected() {
        let mut b = batch();
        b.targets.insert(
            "charges".to_string(),
            TargetColumn::PerAtom(vec![0.0; 7]),
        );
        assert!(matches!(
            b.check_shapes(),
            Err(BatchContractError::RaggedPerAtomTarget { .. })
        ));
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(matches!(
            AssembledBatch::default().check_shapes(),
            Err(BatchContractError::Empty)
        ));
    }
}
