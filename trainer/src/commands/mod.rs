pub mod args;
pub mod build_dataset;
pub mod export;
pub mod info;
pub mod train;
