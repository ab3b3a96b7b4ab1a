use clap::{Args, ValueEnum};
use nn::model::Architecture;
use std::path::PathBuf;
use trainer::dataset::{BuildParams, LabelPolicy};
use trainer::export::metadata::{ModelMetadata, Notes};
use trainer::uci_engine::EngineConfig;
use trainer::{Error, Result};

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum PolicyArg {
    /// Scores from the analysis engine
    Engine,
    /// Results of the games
    Outcome,
}

#[derive(Args, Clone, Debug)]
pub struct EngineArgs {
    /// UCI engine executable (e.g. Stockfish), required by the engine label policy
    #[arg(long, value_name = "path", env = "STOCKFISH_PATH")]
    pub engine: Option<PathBuf>,

    /// Search depth per position
    #[arg(long, value_name = "depth", default_value = "8")]
    pub depth: u32,

    /// Engine threads
    #[arg(long, value_name = "threads", default_value = "4")]
    pub threads: u32,

    /// Engine hash size in MB
    #[arg(long, value_name = "mb", default_value = "256")]
    pub hash: u32,
}

impl EngineArgs {
    pub fn config(&self) -> Result<Option<EngineConfig>> {
        if self.depth == 0 || self.threads == 0 || self.hash == 0 {
            return Err(Error::Configuration(
                "engine depth, threads and hash must be positive".to_string(),
            ));
        }

        Ok(self.engine.as_ref().map(|path| EngineConfig {
            path: path.clone(),
            depth: self.depth,
            threads: self.threads,
            hash_mb: self.hash,
        }))
    }
}

#[derive(Args, Clone, Debug)]
pub struct DatasetArgs {
    /// Path or URL of a .pgn or .pgn.zst file to read games from
    #[arg(long, value_name = "source")]
    pub source: Option<String>,

    /// Dataset cache file
    #[arg(long, value_name = "cache", default_value = "data/positions.cache")]
    pub cache: PathBuf,

    /// Maximum number of games to read
    #[arg(long, value_name = "games", default_value = "10000")]
    pub max_games: u64,

    /// Maximum number of positions sampled from each game
    #[arg(long, value_name = "positions", default_value = "10")]
    pub positions_per_game: usize,

    /// Where the labels come from
    #[arg(long, value_enum, default_value = "engine")]
    pub label_policy: PolicyArg,

    /// Seed of the position sampling
    #[arg(long, value_name = "seed", default_value = "42")]
    pub sample_seed: u64,

    #[clap(flatten)]
    pub engine: EngineArgs,
}

impl DatasetArgs {
    pub fn params(&self) -> Result<BuildParams> {
        let params = BuildParams {
            max_games: self.max_games,
            positions_per_game: self.positions_per_game,
            label_policy: match self.label_policy {
                PolicyArg::Engine => LabelPolicy::Engine,
                PolicyArg::Outcome => LabelPolicy::Outcome,
            },
            seed: check_seed(self.sample_seed)?,
        };
        params.validate()?;

        if params.label_policy == LabelPolicy::Engine
            && self.source.is_some()
            && self.engine.engine.is_none()
        {
            return Err(Error::Configuration(
                "the engine label policy needs --engine (or STOCKFISH_PATH)".to_string(),
            ));
        }

        Ok(params)
    }
}

/// Seeds are recorded in TOML, which only holds signed 64-bit integers
pub fn check_seed(seed: u64) -> Result<u64> {
    if seed > i64::MAX as u64 {
        return Err(Error::Configuration(format!("seed {} is too large", seed)));
    }
    Ok(seed)
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ArchitectureKind {
    /// Fully connected layers over the 768 features
    Plain,
    /// Residual convolutional network with a value head
    Conv,
    /// Residual convolutional network with policy and value heads
    PolicyValue,
}

#[derive(Args, Clone, Debug)]
pub struct ArchitectureArgs {
    #[arg(long, value_enum, default_value = "plain")]
    pub architecture: ArchitectureKind,

    /// Hidden layer sizes of the plain network
    #[arg(long, value_name = "sizes", value_delimiter = ',', default_value = "256,128,64")]
    pub hidden: Vec<usize>,

    /// Filters of the convolutional trunk
    #[arg(long, value_name = "filters", default_value = "64")]
    pub filters: usize,

    /// Residual blocks of the convolutional trunk
    #[arg(long, value_name = "blocks", default_value = "4")]
    pub blocks: usize,
}

impl ArchitectureArgs {
    pub fn architecture(&self) -> Result<Architecture> {
        let architecture = match self.architecture {
            ArchitectureKind::Plain => Architecture::Plain {
                hidden_layers: self.hidden.clone(),
            },
            ArchitectureKind::Conv => Architecture::Convolutional {
                filters: self.filters,
                blocks: self.blocks,
            },
            ArchitectureKind::PolicyValue => Architecture::PolicyValue {
                filters: self.filters,
                blocks: self.blocks,
            },
        };
        architecture
            .validate()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        Ok(architecture)
    }
}

#[derive(Args, Clone, Debug)]
pub struct MetadataArgs {
    /// Directory holding one subdirectory per model version
    #[arg(long, value_name = "dir", default_value = "models")]
    pub models_dir: PathBuf,

    /// Version name of the exported model (e.g. v002)
    #[arg(long, value_name = "version")]
    pub version: Option<String>,

    /// Human readable model name
    #[arg(long, value_name = "name")]
    pub name: Option<String>,

    #[arg(
        long,
        value_name = "text",
        default_value = "Trained value network for chess position evaluation"
    )]
    pub description: String,

    /// Version this model was derived from
    #[arg(long, value_name = "version", default_value = "")]
    pub parent_version: String,

    #[arg(long, value_name = "text", default_value = "")]
    pub changelog: String,
}

impl MetadataArgs {
    /// Metadata with everything known before training filled in
    pub fn metadata(&self, version: &str, architecture: &Architecture) -> ModelMetadata {
        let mut metadata = ModelMetadata {
            version: version.to_string(),
            name: self
                .name
                .clone()
                .unwrap_or_else(|| format!("{} network", architecture.kind())),
            description: self.description.clone(),
            notes: Notes {
                changelog: self.changelog.clone(),
                ..Default::default()
            },
            ..Default::default()
        };
        metadata.training.parent_version = self.parent_version.clone();
        metadata.training.created = chrono::Utc::now().to_rfc3339();
        metadata.training.optimizer = "adam".to_string();
        metadata
    }
}
