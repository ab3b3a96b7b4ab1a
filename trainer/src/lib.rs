pub mod atomic;
pub mod dataset;
pub mod error;
pub mod export;
pub mod game_visitor;
pub mod split;
pub mod train;
pub mod uci_engine;

pub use error::{Error, Result};
