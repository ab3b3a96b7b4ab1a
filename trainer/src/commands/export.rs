use crate::commands::args::MetadataArgs;
use clap::Args;
use std::error::Error;
use std::path::PathBuf;
use trainer::export::export;
use trainer::export::metadata::Metrics;
use trainer::train::checkpoint::Checkpoint;

#[derive(Args)]
pub struct ExportCommand {
    /// Checkpoint to export (e.g. checkpoints/best.ckpt)
    #[arg(long, value_name = "checkpoint")]
    checkpoint: PathBuf,

    #[clap(flatten)]
    metadata: MetadataArgs,
}

pub fn export_checkpoint(cmd: ExportCommand) -> Result<(), Box<dyn Error>> {
    let version = cmd
        .metadata
        .version
        .clone()
        .ok_or_else(|| trainer::Error::Configuration("--version is required".to_string()))?;

    // the architecture comes from the checkpoint itself
    let checkpoint = Checkpoint::load(&cmd.checkpoint)?;
    let network = &checkpoint.network;

    let mut metadata = cmd.metadata.metadata(&version, network.architecture());
    metadata.record_run(&checkpoint.run, checkpoint.epoch + 1);
    metadata.metrics = Metrics {
        training_loss: checkpoint.train_loss as f64,
        validation_loss: checkpoint.validation_loss as f64,
        ..Default::default()
    };

    let exported = export(network, &metadata, &cmd.metadata.models_dir)?;

    println!("Checkpoint: {} (epoch {})", cmd.checkpoint.display(), checkpoint.epoch);
    println!("Architecture: {}", network.architecture());
    println!("Parameters: {}", network.num_parameters());
    println!(
        "Dataset: {} ({} positions, {} labels)",
        checkpoint.run.provenance.source,
        checkpoint.run.dataset_size,
        checkpoint.run.provenance.label_policy
    );
    println!("Graph: {}", exported.graph_file.display());
    println!("Metadata: {}", exported.metadata_file.display());

    Ok(())
}
