pub mod feature_set;
pub mod graph;
pub mod label;
pub mod model;
pub mod optimizer;
