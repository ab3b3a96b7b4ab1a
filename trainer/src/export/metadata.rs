use crate::dataset::Provenance;
use crate::train::RunInfo;
use nn::feature_set::NUM_FEATURES;
use nn::model::Architecture;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Record stored next to an exported model.
///
/// Readers ignore fields they do not know and default the ones that are
/// missing, so records written by older or newer versions still load.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ModelMetadata {
    pub version: String,
    pub name: String,
    pub description: String,
    pub architecture: ArchitectureInfo,
    pub training: TrainingInfo,
    pub dataset: DatasetInfo,
    pub metrics: Metrics,
    pub notes: Notes,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ArchitectureInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub input_features: usize,
    pub hidden_layers: Vec<usize>,
    pub output_type: String,
    pub activation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub residual_blocks: Option<usize>,
    pub parameters: usize,
}

impl ArchitectureInfo {
    pub fn describe(architecture: &Architecture, parameters: usize) -> Self {
        let (filters, residual_blocks) = match architecture {
            Architecture::Plain { .. } => (None, None),
            Architecture::Convolutional { filters, blocks }
            | Architecture::PolicyValue { filters, blocks } => {
                (Some(*filters), Some(*blocks))
            }
        };

        Self {
            kind: architecture.kind().to_string(),
            input_features: NUM_FEATURES,
            hidden_layers: architecture.hidden_layers(),
            output_type: if architecture.has_policy() {
                "policy_value".to_string()
            } else {
                "value".to_string()
            },
            activation: "relu".to_string(),
            filters,
            residual_blocks,
            parameters,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct TrainingInfo {
    pub parent_version: String,
    pub created: String,
    pub epochs: u32,
    pub batch_size: usize,
    /// Initial learning rate
    pub learning_rate: f64,
    pub validation_fraction: f64,
    pub seed: u64,
    pub optimizer: String,
}

/// Where the training positions came from
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct DatasetInfo {
    pub source: String,
    pub created: String,
    pub size: usize,
    pub label_policy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_depth: Option<u32>,
    pub max_games: u64,
    pub positions_per_game: usize,
    pub seed: u64,
    pub games_read: u64,
    pub games_skipped: u64,
}

impl DatasetInfo {
    pub fn describe(provenance: &Provenance, size: usize) -> Self {
        Self {
            source: provenance.source.clone(),
            created: provenance.created.clone(),
            size,
            label_policy: provenance.label_policy.to_string(),
            engine_depth: provenance.engine_depth,
            max_games: provenance.max_games,
            positions_per_game: provenance.positions_per_game,
            seed: provenance.seed,
            games_read: provenance.games_read,
            games_skipped: provenance.games_skipped,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Metrics {
    pub training_loss: f64,
    pub validation_loss: f64,
    pub test_accuracy: f64,
    pub elo_estimate: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Notes {
    pub changelog: String,
    pub known_issues: String,
    pub next_steps: String,
}

impl ModelMetadata {
    pub fn to_toml(&self) -> io::Result<String> {
        toml::to_string_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn from_toml(text: &str) -> io::Result<Self> {
        toml::from_str(text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    /// Fills the training configuration and the dataset section from a run that lasted `epochs`
    pub fn record_run(&mut self, run: &RunInfo, epochs: u32) {
        self.training.epochs = epochs;
        self.training.batch_size = run.batch_size;
        self.training.learning_rate = run.learning_rate as f64;
        self.training.validation_fraction = run.validation_fraction;
        self.training.seed = run.seed;
        self.dataset = DatasetInfo::describe(&run.provenance, run.dataset_size);
    }
}
