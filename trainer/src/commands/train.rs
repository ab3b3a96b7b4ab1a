use crate::commands::args::{check_seed, ArchitectureArgs, DatasetArgs, MetadataArgs};
use clap::Args;
use log::info;
use std::error::Error;
use std::path::PathBuf;
use trainer::dataset::load_or_build;
use trainer::export::export;
use trainer::export::metadata::Metrics;
use trainer::train::checkpoint::Checkpoint;
use trainer::train::{TrainConfig, Trainer};

#[derive(Args)]
pub struct TrainCommand {
    #[clap(flatten)]
    dataset: DatasetArgs,

    #[clap(flatten)]
    architecture: ArchitectureArgs,

    /// Total number of training epochs
    #[arg(long, value_name = "epochs", default_value = "10")]
    epochs: u32,

    #[arg(long, value_name = "size", default_value = "128")]
    batch_size: usize,

    /// Initial learning rate
    #[arg(long, value_name = "lr", default_value = "0.001")]
    lr: f32,

    /// Fraction of the dataset held out for validation
    #[arg(long, value_name = "fraction", default_value = "0.1")]
    validation_fraction: f64,

    /// Seeds the split, the initialization and the shuffles
    #[arg(long, value_name = "seed", default_value = "42")]
    seed: u64,

    /// Learning rate multiplier on plateau
    #[arg(long, value_name = "factor", default_value = "0.5")]
    lr_factor: f32,

    /// Epochs without improvement tolerated before reducing the learning rate
    #[arg(long, value_name = "epochs", default_value = "3")]
    lr_patience: u32,

    #[arg(long, value_name = "dir", default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    /// Continue from a checkpoint file
    #[arg(long, value_name = "checkpoint")]
    resume: Option<PathBuf>,

    /// Batches prepared ahead of training
    #[arg(long, value_name = "batches", default_value = "4")]
    prefetch: usize,

    /// Export the final model when a version is given
    #[clap(flatten)]
    metadata: MetadataArgs,
}

pub fn train(cmd: TrainCommand) -> Result<(), Box<dyn Error>> {
    let architecture = cmd.architecture.architecture()?;
    let config = TrainConfig {
        architecture: architecture.clone(),
        epochs: cmd.epochs,
        batch_size: cmd.batch_size,
        learning_rate: cmd.lr,
        validation_fraction: cmd.validation_fraction,
        seed: check_seed(cmd.seed)?,
        lr_factor: cmd.lr_factor,
        lr_patience: cmd.lr_patience,
        checkpoint_dir: cmd.checkpoint_dir.clone(),
        prefetch: cmd.prefetch,
    };
    config.validate()?;

    let params = cmd.dataset.params()?;
    let engine = cmd.dataset.engine.config()?;
    let corpus = load_or_build(
        &cmd.dataset.cache,
        cmd.dataset.source.as_deref(),
        &params,
        engine.as_ref(),
    )?;
    info!("dataset: {} positions", corpus.len());

    let mut trainer = match &cmd.resume {
        Some(path) => Trainer::resume(config, &corpus, Checkpoint::load(path)?)?,
        None => Trainer::new(config, &corpus)?,
    };

    let reports = trainer.run()?;
    for report in &reports {
        println!(
            "Epoch {:>3}  train {:.6}  val {:.6}  lr {:.2e}{}",
            report.epoch + 1,
            report.train_loss,
            report.validation_loss,
            report.learning_rate,
            if report.new_best { "  *" } else { "" }
        );
    }
    println!("Best validation loss: {:.6}", trainer.best_validation_loss());

    if let Some(version) = &cmd.metadata.version {
        let network = trainer.network();
        let mut metadata = cmd.metadata.metadata(version, network.architecture());
        metadata.record_run(trainer.run_info(), cmd.epochs);
        metadata.metrics = Metrics {
            training_loss: trainer.last_train_loss().unwrap_or(f32::NAN) as f64,
            validation_loss: trainer.best_validation_loss() as f64,
            ..Default::default()
        };

        let exported = export(network, &metadata, &cmd.metadata.models_dir)?;
        println!("Model saved to: {}", exported.dir.display());
    }

    Ok(())
}
