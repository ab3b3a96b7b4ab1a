pub mod layers;
pub mod network;

pub use network::{Network, Output};

use crate::feature_set::{NUM_FEATURES, NUM_PLANES};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Number of move logits of the policy head
pub const POLICY_SIZE: usize = 1858;

/// Channels of the policy head's 1x1 convolution
pub const POLICY_CHANNELS: usize = 2;

/// Hidden width of the convolutional value head
pub const VALUE_HIDDEN: usize = 128;

/// Shape of a network, resolved once from configuration and stored
/// alongside the parameters (checkpoints, exported metadata)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Architecture {
    /// 768 -> hidden layers (ReLU) -> 1 (tanh)
    Plain { hidden_layers: Vec<usize> },

    /// 12x8x8 -> conv 3x3 -> residual blocks -> value head
    Convolutional { filters: usize, blocks: usize },

    /// Convolutional trunk with a value head and a policy head
    PolicyValue { filters: usize, blocks: usize },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ArchitectureError {
    #[error("hidden layer {0} has zero units")]
    EmptyHiddenLayer(usize),
    #[error("a convolutional network needs at least one filter")]
    NoFilters,
}

impl Default for Architecture {
    fn default() -> Self {
        Architecture::Plain {
            hidden_layers: vec![256, 128, 64],
        }
    }
}

impl Architecture {
    pub fn validate(&self) -> Result<(), ArchitectureError> {
        match self {
            Architecture::Plain { hidden_layers } => {
                match hidden_layers.iter().position(|&units| units == 0) {
                    Some(i) => Err(ArchitectureError::EmptyHiddenLayer(i)),
                    None => Ok(()),
                }
            }
            Architecture::Convolutional { filters, .. }
            | Architecture::PolicyValue { filters, .. } => {
                if *filters == 0 {
                    Err(ArchitectureError::NoFilters)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Name used in the `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            Architecture::Plain { .. } => "plain",
            Architecture::Convolutional { .. } => "convolutional",
            Architecture::PolicyValue { .. } => "policy_value",
        }
    }

    pub fn has_policy(&self) -> bool {
        matches!(self, Architecture::PolicyValue { .. })
    }

    /// Name of the graph input
    pub fn input_name(&self) -> &'static str {
        match self {
            Architecture::Plain { .. } => "features",
            _ => "board",
        }
    }

    /// Per-example input shape (without the batch dimension)
    pub fn input_shape(&self) -> Vec<usize> {
        match self {
            Architecture::Plain { .. } => vec![NUM_FEATURES],
            _ => vec![NUM_PLANES, 8, 8],
        }
    }

    /// Widths of the fully connected hidden layers
    pub fn hidden_layers(&self) -> Vec<usize> {
        match self {
            Architecture::Plain { hidden_layers } => hidden_layers.clone(),
            _ => vec![VALUE_HIDDEN],
        }
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Architecture::Plain { hidden_layers } => write!(f, "plain {:?}", hidden_layers),
            Architecture::Convolutional { filters, blocks } => {
                write!(f, "convolutional {}x{}", filters, blocks)
            }
            Architecture::PolicyValue { filters, blocks } => {
                write!(f, "policy-value {}x{}", filters, blocks)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_tagged() {
        let arch = Architecture::Convolutional { filters: 64, blocks: 4 };
        let json = serde_json::to_string(&arch).unwrap();
        assert_eq!(json, r#"{"type":"convolutional","filters":64,"blocks":4}"#);

        let back: Architecture = serde_json::from_str(&json).unwrap();
        assert_eq!(back, arch);

        let plain: Architecture =
            serde_json::from_str(r#"{"type":"plain","hidden_layers":[32]}"#).unwrap();
        assert_eq!(plain, Architecture::Plain { hidden_layers: vec![32] });
    }

    #[test]
    fn test_validate() {
        assert!(Architecture::default().validate().is_ok());
        assert_eq!(
            Architecture::Plain { hidden_layers: vec![8, 0] }.validate(),
            Err(ArchitectureError::EmptyHiddenLayer(1))
        );
        assert_eq!(
            Architecture::PolicyValue { filters: 0, blocks: 1 }.validate(),
            Err(ArchitectureError::NoFilters)
        );
    }
}
