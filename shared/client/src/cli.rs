use crate::logging::LogOutput;
use clap::Args;
use std::path::PathBuf;
use tracing::Level;

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Path to the run configuration (TOML).
    #[clap(long, env, default_value = "run.toml")]
    pub config: PathBuf,

    /// This process's rank within the distributed group.
    #[clap(long, env, default_value_t = 0)]
    pub rank: usize,

    /// Total number of distributed ranks.
    #[clap(long, env, default_value_t = 1)]
    pub world_size: usize,

    /// Log output format.
    /// console: human-readable logs.
    /// json: one JSON object per line.
    #[clap(long, env, default_value_t = LogOutput::Console, value_enum, ignore_case = true)]
    pub logs: LogOutput,

    /// Default log level when RUST_LOG is not set.
    #[clap(long, env, default_value_t = Level::INFO)]
    pub log_level: Level,

    /// Number of synthesized molecules in the demo dataset.
    #[clap(long, env, default_value_t = 512)]
    pub num_records: usize,

    /// Smallest synthesized molecule, in atoms.
    #[clap(long, env, default_value_t = 3)]
    pub min_atoms: u32,

    /// Largest synthesized molecule, in atoms.
    #[clap(long, env, default_value_t = 48)]
    pub max_atoms: u32,
}
