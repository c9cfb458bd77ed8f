mod barrier;
mod plateau;
mod shuffle;

pub use barrier::{Barrier, BarrierError, NoopBarrier};
pub use plateau::{PlateauConfig, PlateauConfigError, PlateauScheduler, PlateauState};
pub use shuffle::{Shuffle, deterministic_shuffle};
