use clap::Args;
use nn::feature_set::basic::Basic;
use nn::graph::{Dim, InferenceGraph, TensorInfo};
use shakmaty::{fen::Fen, CastlingMode, Chess, Position};
use std::error::Error;
use std::path::PathBuf;
use trainer::dataset::load_cached;
use trainer::export::metadata::ModelMetadata;
use trainer::export::{GRAPH_FILE, METADATA_FILE};

#[derive(Args)]
pub struct InfoCommand {
    /// If provided, it will print the active features of the given FEN
    #[arg(long, value_name = "fen")]
    fen: Option<String>,

    /// If provided, it will print the metadata and the inputs/outputs of an exported model
    /// directory. Combined with --fen, the position is also evaluated
    #[arg(long, value_name = "model")]
    model: Option<PathBuf>,

    /// If provided, it will print a summary of a dataset cache
    #[arg(long, value_name = "cache")]
    cache: Option<PathBuf>,
}

fn shape(info: &TensorInfo) -> String {
    let dims: Vec<String> = info
        .shape
        .iter()
        .map(|d| match d {
            Dim::Fixed(n) => n.to_string(),
            Dim::Symbolic(name) => name.clone(),
        })
        .collect();
    format!("{} [{}]", info.name, dims.join(", "))
}

pub fn info(cmd: InfoCommand) -> Result<(), Box<dyn Error>> {
    let position: Option<Chess> = match &cmd.fen {
        Some(fen) => Some(Fen::from_ascii(fen.as_bytes())?.into_position(CastlingMode::Standard)?),
        None => None,
    };

    if let Some(position) = &position {
        let features = Basic::encode(position);

        // print active features
        for x in features.active() {
            print!("{} ", x);
        }
        println!();
        println!("{} active, {:?} to move", features.count_active(), position.turn());
    }

    if let Some(dir) = &cmd.model {
        let metadata = ModelMetadata::load(&dir.join(METADATA_FILE))?;
        let graph = InferenceGraph::load(&dir.join(GRAPH_FILE))?;

        println!("Version: {}", metadata.version);
        println!("Name: {}", metadata.name);
        println!(
            "Architecture: {} ({} parameters)",
            metadata.architecture.kind, metadata.architecture.parameters
        );
        println!(
            "Dataset: {} ({} positions, {} labels)",
            metadata.dataset.source, metadata.dataset.size, metadata.dataset.label_policy
        );
        println!("Validation loss: {:.6}", metadata.metrics.validation_loss);
        for input in &graph.inputs {
            println!("Input: {}", shape(input));
        }
        for output in &graph.outputs {
            println!("Output: {}", shape(output));
        }

        if let Some(position) = &position {
            let outputs = graph.run(&Basic::encode(position).to_dense())?;
            if let Some(value) = outputs.get(nn::graph::VALUE_OUTPUT) {
                println!("Value: {:.4}", value[0]);
            }
        }
    }

    if let Some(path) = &cmd.cache {
        let corpus = load_cached(path)?;
        let provenance = &corpus.provenance;
        let total: f64 = corpus.examples.iter().map(|e| e.label as f64).sum();
        let mean = total / corpus.len().max(1) as f64;

        println!("Positions: {}", corpus.len());
        println!("Source: {}", provenance.source);
        println!("Created: {}", provenance.created);
        println!("Label policy: {}", provenance.label_policy);
        println!(
            "Games: {} read, {} skipped",
            provenance.games_read, provenance.games_skipped
        );
        println!("Mean label: {:.4}", mean);
    }

    Ok(())
}
