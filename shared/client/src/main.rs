use anyhow::Result;
use clap::{Parser, Subcommand};

mod app;
mod cli;
mod logging;

use cli::TrainArgs;

#[derive(Parser, Debug)]
#[command(
    name = "covalent-client",
    about = "Trains a per-atom molecular property predictor."
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs training as described by a TOML run configuration.
    Train {
        #[clap(flatten)]
        args: TrainArgs,
    },
    /// Prints an example run configuration to start from.
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Commands::Train { args } => {
            logging::init_logging(args.logs, args.log_level);
            app::run_training(args).await
        }
        Commands::PrintConfig => {
            print!("{}", toml::to_string_pretty(&app::example_config())?);
            Ok(())
        }
    }
}
