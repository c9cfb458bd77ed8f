use std::collections::HashSet;

pub type RecordId = u64;

/// One molecule of the source dataset. `payload` is an opaque handle that
/// only the batch assembler interprets (a file/row pointer, usually);
/// nothing downstream of dataset construction mutates a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub id: RecordId,
    pub num_atoms: u32,
    pub payload: u64,
}

impl Record {
    pub fn new(id: RecordId, num_atoms: u32, payload: u64) -> Self {
        Self {
            id,
            num_atoms,
            payload,
        }
    }
}

/// Drops records whose ids appear in `skip`, preserving order. Applied once,
/// before the size index is built.
pub fn filter_skipped(records: Vec<Record>, skip: &HashSet<RecordId>) -> Vec<Record> {
    if skip.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|r| !skip.contains(&r.id))
        .collect()
}
