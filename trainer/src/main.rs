mod commands;

use clap::{Parser, Subcommand};
use commands::build_dataset::{build_dataset, BuildDatasetCommand};
use commands::export::{export_checkpoint, ExportCommand};
use commands::info::{info, InfoCommand};
use commands::train::{train, TrainCommand};
use std::error::Error;

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reads games, labels sampled positions and writes the dataset cache
    BuildDataset(BuildDatasetCommand),
    /// Trains a network, checkpointing every epoch (and exports it when a version is given)
    Train(TrainCommand),
    /// Exports a checkpoint as an inference graph with its metadata
    Export(ExportCommand),
    /// Prints features of a position, an exported model or a dataset cache
    Info(InfoCommand),
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Cli::parse();

    match args.command {
        Commands::BuildDataset(cmd) => build_dataset(cmd),
        Commands::Train(cmd) => train(cmd),
        Commands::Export(cmd) => export_checkpoint(cmd),
        Commands::Info(cmd) => info(cmd),
    }
}
