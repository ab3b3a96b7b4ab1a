pub mod metadata;

use crate::atomic::write_atomically;
use crate::error::{Error, Result};
use log::info;
use metadata::{ArchitectureInfo, ModelMetadata};
use nn::graph::InferenceGraph;
use nn::model::Network;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

pub const GRAPH_FILE: &str = "model.graph.json";
pub const METADATA_FILE: &str = "metadata.toml";

/// Files written by an export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedModel {
    pub dir: PathBuf,
    pub graph_file: PathBuf,
    pub metadata_file: PathBuf,
}

fn check_version(version: &str) -> Result<()> {
    let mut components = Path::new(version).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(Error::Configuration(format!(
            "model version '{}' must be a plain directory name",
            version
        ))),
    }
}

/// Writes the inference graph and the metadata record into `models_dir/<version>/`.
/// The architecture section of the metadata is always derived from the network
pub fn export(
    network: &Network,
    metadata: &ModelMetadata,
    models_dir: &Path,
) -> Result<ExportedModel> {
    check_version(&metadata.version)?;

    let dir = models_dir.join(&metadata.version);
    fs::create_dir_all(&dir)?;

    let mut metadata = metadata.clone();
    metadata.architecture =
        ArchitectureInfo::describe(network.architecture(), network.num_parameters());

    let graph = InferenceGraph::from_network(network);
    let graph_file = dir.join(GRAPH_FILE);
    write_atomically(&graph_file, |writer| {
        serde_json::to_writer(&mut *writer, &graph).map_err(io::Error::from)?;
        writer.flush()
    })?;

    let metadata_file = dir.join(METADATA_FILE);
    let text = metadata.to_toml()?;
    write_atomically(&metadata_file, |writer| writer.write_all(text.as_bytes()))?;

    info!(
        "exported {} network ({} parameters) to {}",
        network.architecture(),
        network.num_parameters(),
        dir.display()
    );

    Ok(ExportedModel {
        dir,
        graph_file,
        metadata_file,
    })
}
