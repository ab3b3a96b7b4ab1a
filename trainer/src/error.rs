use nn::graph::GraphError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the training pipeline
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("analysis engine: {0}")]
    ExternalEngine(String),

    #[error("no training examples extracted ({games_read} games read, {games_skipped} skipped)")]
    DataExhausted { games_read: u64, games_skipped: u64 },

    #[error("dataset cache: {0}")]
    CacheFormat(String),

    #[error("checkpoint {}: {source}", path.display())]
    CheckpointIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
