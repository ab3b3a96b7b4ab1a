use crate::commands::args::DatasetArgs;
use clap::Args;
use std::error::Error;
use trainer::dataset::{build_from_source, save_cache};

#[derive(Args)]
pub struct BuildDatasetCommand {
    #[clap(flatten)]
    dataset: DatasetArgs,
}

pub fn build_dataset(cmd: BuildDatasetCommand) -> Result<(), Box<dyn Error>> {
    let params = cmd.dataset.params()?;
    let engine = cmd.dataset.engine.config()?;
    let source = cmd
        .dataset
        .source
        .as_deref()
        .ok_or_else(|| trainer::Error::Configuration("--source is required".to_string()))?;

    println!("Input: {}", source);
    println!("Output: {}", cmd.dataset.cache.display());

    let corpus = build_from_source(source, &params, engine.as_ref())?;

    if let Some(parent) = cmd.dataset.cache.parent() {
        std::fs::create_dir_all(parent)?;
    }
    save_cache(&corpus, &cmd.dataset.cache)?;

    println!(
        "Done. {} positions from {} games ({} skipped)",
        corpus.len(),
        corpus.provenance.games_read,
        corpus.provenance.games_skipped
    );

    Ok(())
}
