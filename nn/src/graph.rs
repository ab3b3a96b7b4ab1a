//! Portable inference graph.
//!
//! A network is exported as a flat list of named tensors and operators,
//! serialized as JSON. Inputs and outputs carry a symbolic batch dimension,
//! so a consumer can feed any number of positions at once.
//! [`InferenceGraph::run`] is the reference consumer: it evaluates the graph
//! with the same kernels the trainable network uses.

use crate::model::layers::{
    conv_forward, dense_forward, log_softmax_in_place, relu_in_place, Conv, Layer, BOARD_SIZE,
};
use crate::model::{Architecture, Network, POLICY_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

pub const GRAPH_FORMAT_VERSION: u32 = 1;

/// Name of the symbolic batch dimension
pub const BATCH_DIM: &str = "batch_size";

pub const VALUE_OUTPUT: &str = "value";
pub const POLICY_OUTPUT: &str = "policy";

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("malformed graph: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported graph format version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown tensor '{0}'")]
    UnknownTensor(String),
    #[error("tensor '{tensor}' has {found} elements, expected {expected}")]
    ShapeMismatch {
        tensor: String,
        expected: usize,
        found: usize,
    },
    #[error("graph expects a single input, got {0}")]
    InputCount(usize),
}

/// A tensor dimension, either fixed or named (bound at run time)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum Dim {
    Fixed(usize),
    Symbolic(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub shape: Vec<Dim>,
}

impl TensorInfo {
    fn batched(name: &str, dims: &[usize]) -> Self {
        let mut shape = vec![Dim::Symbolic(BATCH_DIM.to_string())];
        shape.extend(dims.iter().map(|&d| Dim::Fixed(d)));

        Self {
            name: name.to_string(),
            shape,
        }
    }

    /// Number of elements per batch entry (product of the fixed dimensions)
    pub fn row_len(&self) -> usize {
        self.shape
            .iter()
            .map(|d| match d {
                Dim::Fixed(n) => *n,
                Dim::Symbolic(_) => 1,
            })
            .product()
    }
}

/// Constant tensor (weights and biases)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Initializer {
    pub name: String,
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Node {
    /// `output = weight · input + bias`, weight is `[outputs, inputs]`
    Gemm {
        input: String,
        weight: String,
        bias: String,
        output: String,
    },
    /// Same-padded convolution over 8x8 planes, weight is `[out, in, kernel, kernel]`
    Conv {
        input: String,
        weight: String,
        bias: String,
        output: String,
    },
    Add {
        inputs: [String; 2],
        output: String,
    },
    Flatten {
        input: String,
        output: String,
    },
    Relu {
        input: String,
        output: String,
    },
    Tanh {
        input: String,
        output: String,
    },
    LogSoftmax {
        input: String,
        output: String,
    },
}

impl Node {
    fn output(&self) -> &str {
        match self {
            Node::Gemm { output, .. }
            | Node::Conv { output, .. }
            | Node::Add { output, .. }
            | Node::Flatten { output, .. }
            | Node::Relu { output, .. }
            | Node::Tanh { output, .. }
            | Node::LogSoftmax { output, .. } => output,
        }
    }

    fn output_mut(&mut self) -> &mut String {
        match self {
            Node::Gemm { output, .. }
            | Node::Conv { output, .. }
            | Node::Add { output, .. }
            | Node::Flatten { output, .. }
            | Node::Relu { output, .. }
            | Node::Tanh { output, .. }
            | Node::LogSoftmax { output, .. } => output,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InferenceGraph {
    pub format_version: u32,
    pub producer: String,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
    pub initializers: Vec<Initializer>,
    pub nodes: Vec<Node>,
}

/// Accumulates nodes while walking the layers of a network
struct Builder {
    initializers: Vec<Initializer>,
    nodes: Vec<Node>,
    next_tensor: usize,
}

impl Builder {
    fn tensor(&mut self) -> String {
        self.next_tensor += 1;
        format!("t{}", self.next_tensor)
    }

    fn constant(&mut self, name: String, dims: Vec<usize>, data: &[f32]) -> String {
        self.initializers.push(Initializer {
            name: name.clone(),
            dims,
            data: data.to_vec(),
        });
        name
    }

    fn push(&mut self, make: impl FnOnce(String) -> Node) -> String {
        let output = self.tensor();
        self.nodes.push(make(output.clone()));
        output
    }

    fn layers(
        &mut self,
        prefix: &str,
        layers: &[Layer],
        mut x: String,
        mut spatial: bool,
    ) -> String {
        for (i, layer) in layers.iter().enumerate() {
            let name = format!("{}.{}", prefix, i);

            x = match layer {
                Layer::Dense(dense) => {
                    if spatial {
                        let input = x.clone();
                        x = self.push(|output| Node::Flatten { input, output });
                        spatial = false;
                    }
                    let weight = self.constant(
                        format!("{}.weight", name),
                        vec![dense.outputs, dense.inputs],
                        &dense.weight.value,
                    );
                    let bias = self.constant(
                        format!("{}.bias", name),
                        vec![dense.outputs],
                        &dense.bias.value,
                    );
                    self.push(|output| Node::Gemm {
                        input: x,
                        weight,
                        bias,
                        output,
                    })
                }
                Layer::Conv(conv) => {
                    spatial = true;
                    self.conv(&name, conv, x)
                }
                Layer::Residual(block) => {
                    let hidden = self.conv(&format!("{}.conv1", name), &block.conv1, x.clone());
                    let hidden = self.push(|output| Node::Relu { input: hidden, output });
                    let hidden = self.conv(&format!("{}.conv2", name), &block.conv2, hidden);
                    let sum = self.push(|output| Node::Add {
                        inputs: [hidden, x],
                        output,
                    });
                    self.push(|output| Node::Relu { input: sum, output })
                }
                Layer::Relu(_) => self.push(|output| Node::Relu { input: x, output }),
                Layer::Tanh(_) => self.push(|output| Node::Tanh { input: x, output }),
                Layer::LogSoftmax(_) => self.push(|output| Node::LogSoftmax { input: x, output }),
            };
        }
        x
    }

    fn conv(&mut self, name: &str, conv: &Conv, input: String) -> String {
        let weight = self.constant(
            format!("{}.weight", name),
            vec![conv.out_channels, conv.in_channels, conv.kernel, conv.kernel],
            &conv.weight.value,
        );
        let bias = self.constant(
            format!("{}.bias", name),
            vec![conv.out_channels],
            &conv.bias.value,
        );
        self.push(|output| Node::Conv {
            input,
            weight,
            bias,
            output,
        })
    }

    /// Renames the tensor produced by the last node
    fn rename_last(&mut self, name: &str) {
        if let Some(node) = self.nodes.last_mut() {
            *node.output_mut() = name.to_string();
        }
    }
}

impl InferenceGraph {
    /// Converts a network into a graph computing the same outputs
    pub fn from_network(network: &Network) -> Self {
        let architecture = network.architecture();
        let input_name = architecture.input_name();
        let spatial = !matches!(architecture, Architecture::Plain { .. });

        let mut builder = Builder {
            initializers: vec![],
            nodes: vec![],
            next_tensor: 0,
        };

        let body = builder.layers("trunk", &network.trunk, input_name.to_string(), spatial);

        // the policy head goes first so the value head can take the last node's name
        let mut outputs = vec![];
        if let Some(head) = &network.policy_head {
            builder.layers("policy_head", head, body.clone(), spatial);
            builder.rename_last(POLICY_OUTPUT);
            outputs.push(TensorInfo::batched(POLICY_OUTPUT, &[POLICY_SIZE]));
        }

        builder.layers("value_head", &network.value_head, body, spatial);
        builder.rename_last(VALUE_OUTPUT);
        outputs.push(TensorInfo::batched(VALUE_OUTPUT, &[1]));

        InferenceGraph {
            format_version: GRAPH_FORMAT_VERSION,
            producer: format!("nn {}", env!("CARGO_PKG_VERSION")),
            inputs: vec![TensorInfo::batched(input_name, &architecture.input_shape())],
            outputs,
            initializers: builder.initializers,
            nodes: builder.nodes,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), GraphError> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, GraphError> {
        let graph: InferenceGraph = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        graph.validate()?;
        Ok(graph)
    }

    /// Checks version, initializer sizes and that every tensor is defined before use
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.format_version != GRAPH_FORMAT_VERSION {
            return Err(GraphError::UnsupportedVersion(self.format_version));
        }
        if self.inputs.len() != 1 {
            return Err(GraphError::InputCount(self.inputs.len()));
        }

        let mut defined: Vec<&str> = self.inputs.iter().map(|t| t.name.as_str()).collect();
        for init in &self.initializers {
            let expected: usize = init.dims.iter().product();
            if expected != init.data.len() {
                return Err(mismatch(&init.name, expected, init.data.len()));
            }
            defined.push(&init.name);
        }

        for node in &self.nodes {
            let inputs: Vec<&String> = match node {
                Node::Gemm { input, weight, bias, .. } | Node::Conv { input, weight, bias, .. } => {
                    vec![input, weight, bias]
                }
                Node::Add { inputs, .. } => inputs.iter().collect(),
                Node::Flatten { input, .. }
                | Node::Relu { input, .. }
                | Node::Tanh { input, .. }
                | Node::LogSoftmax { input, .. } => vec![input],
            };
            for name in inputs {
                if !defined.contains(&name.as_str()) {
                    return Err(GraphError::UnknownTensor(name.clone()));
                }
            }
            defined.push(node.output());
        }

        for output in &self.outputs {
            if !defined.contains(&output.name.as_str()) {
                return Err(GraphError::UnknownTensor(output.name.clone()));
            }
        }

        Ok(())
    }

    /// Evaluates a batch. `input` holds the rows of the single graph input back to back;
    /// the result maps every declared output to its rows, also back to back
    pub fn run(&self, input: &[f32]) -> Result<BTreeMap<String, Vec<f32>>, GraphError> {
        let input_info = match self.inputs.as_slice() {
            [info] => info,
            other => return Err(GraphError::InputCount(other.len())),
        };

        let row_len = input_info.row_len();
        if row_len == 0 || input.len() % row_len != 0 {
            return Err(mismatch(&input_info.name, row_len, input.len()));
        }

        let constants: HashMap<&str, &Initializer> =
            self.initializers.iter().map(|init| (init.name.as_str(), init)).collect();

        let mut results: BTreeMap<String, Vec<f32>> =
            self.outputs.iter().map(|o| (o.name.clone(), vec![])).collect();

        for row in input.chunks(row_len) {
            let mut tensors: HashMap<&str, Vec<f32>> = HashMap::new();
            tensors.insert(&input_info.name, row.to_vec());

            for node in &self.nodes {
                let value = self.eval_node(node, &tensors, &constants)?;
                tensors.insert(node.output(), value);
            }

            for output in &self.outputs {
                let value = tensors
                    .get(output.name.as_str())
                    .ok_or_else(|| GraphError::UnknownTensor(output.name.clone()))?;
                if let Some(rows) = results.get_mut(&output.name) {
                    rows.extend_from_slice(value);
                }
            }
        }

        Ok(results)
    }

    fn eval_node(
        &self,
        node: &Node,
        tensors: &HashMap<&str, Vec<f32>>,
        constants: &HashMap<&str, &Initializer>,
    ) -> Result<Vec<f32>, GraphError> {
        Ok(match node {
            Node::Gemm {
                input, weight, bias, ..
            } => {
                let x = lookup(tensors, input)?;
                let (w, b) = (constant(constants, weight)?, constant(constants, bias)?);
                let [outputs, inputs] = w.dims[..] else {
                    return Err(mismatch(weight, 2, w.dims.len()));
                };
                expect_len(input, inputs, x.len())?;
                expect_len(bias, outputs, b.data.len())?;

                let mut y = vec![0.0; outputs];
                dense_forward(inputs, &w.data, &b.data, x, &mut y);
                y
            }
            Node::Conv {
                input, weight, bias, ..
            } => {
                let x = lookup(tensors, input)?;
                let (w, b) = (constant(constants, weight)?, constant(constants, bias)?);
                let [out_channels, in_channels, kernel, _] = w.dims[..] else {
                    return Err(mismatch(weight, 4, w.dims.len()));
                };
                let area = BOARD_SIZE * BOARD_SIZE;
                expect_len(input, in_channels * area, x.len())?;
                expect_len(bias, out_channels, b.data.len())?;

                let mut y = vec![0.0; out_channels * area];
                conv_forward(in_channels, out_channels, kernel, &w.data, &b.data, x, &mut y);
                y
            }
            Node::Add { inputs: [a, b], .. } => {
                let (x, y) = (lookup(tensors, a)?, lookup(tensors, b)?);
                expect_len(b, x.len(), y.len())?;
                x.iter().zip(y).map(|(p, q)| p + q).collect()
            }
            Node::Flatten { input, .. } => lookup(tensors, input)?.to_vec(),
            Node::Relu { input, .. } => {
                let mut y = lookup(tensors, input)?.to_vec();
                relu_in_place(&mut y);
                y
            }
            Node::Tanh { input, .. } => lookup(tensors, input)?.iter().map(|v| v.tanh()).collect(),
            Node::LogSoftmax { input, .. } => {
                let mut y = lookup(tensors, input)?.to_vec();
                log_softmax_in_place(&mut y);
                y
            }
        })
    }
}

fn lookup<'a>(tensors: &'a HashMap<&str, Vec<f32>>, name: &str) -> Result<&'a [f32], GraphError> {
    tensors
        .get(name)
        .map(|t| t.as_slice())
        .ok_or_else(|| GraphError::UnknownTensor(name.to_string()))
}

fn constant<'a>(
    constants: &HashMap<&str, &'a Initializer>,
    name: &str,
) -> Result<&'a Initializer, GraphError> {
    constants
        .get(name)
        .copied()
        .ok_or_else(|| GraphError::UnknownTensor(name.to_string()))
}

fn mismatch(name: &str, expected: usize, found: usize) -> GraphError {
    GraphError::ShapeMismatch {
        tensor: name.to_string(),
        expected,
        found,
    }
}

fn expect_len(name: &str, expected: usize, found: usize) -> Result<(), GraphError> {
    if expected == found {
        Ok(())
    } else {
        Err(mismatch(name, expected, found))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_set::basic::Basic;
    use crate::model::Architecture;
    use shakmaty::{fen::Fen, CastlingMode, Chess};

    fn inputs() -> Vec<Vec<f32>> {
        let fens = [
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1",
            "r1bqkb1r/pppp1ppp/2n2n2/4p3/2B1P3/5N2/PPPP1PPP/RNBQK2R b KQkq - 4 4",
            "8/8/1q4b1/8/8/4k3/K7/8 b - - 19 68",
        ];
        fens.iter()
            .map(|fen| {
                let fen: Fen = fen.parse().unwrap();
                let pos: Chess = fen.into_position(CastlingMode::Standard).unwrap();
                Basic::encode(&pos).to_dense()
            })
            .collect()
    }

    #[test]
    fn test_plain_io() {
        let net = Network::new(Architecture::Plain { hidden_layers: vec![8, 4] }, 0).unwrap();
        let graph = InferenceGraph::from_network(&net);

        assert_eq!(graph.inputs.len(), 1);
        assert_eq!(graph.inputs[0].name, "features");
        assert_eq!(
            graph.inputs[0].shape,
            vec![Dim::Symbolic("batch_size".to_string()), Dim::Fixed(768)]
        );
        assert_eq!(graph.outputs.len(), 1);
        assert_eq!(graph.outputs[0].name, "value");
        graph.validate().unwrap();
    }

    #[test]
    fn test_run_matches_network() {
        let architectures = [
            Architecture::Plain { hidden_layers: vec![8, 4] },
            Architecture::Convolutional { filters: 3, blocks: 2 },
            Architecture::PolicyValue { filters: 2, blocks: 1 },
        ];

        let rows = inputs();
        let batch: Vec<f32> = rows.concat();

        for arch in architectures {
            let net = Network::new(arch.clone(), 9).unwrap();
            let graph = InferenceGraph::from_network(&net);
            graph.validate().unwrap();

            let results = graph.run(&batch).unwrap();
            let values = &results["value"];
            assert_eq!(values.len(), rows.len());

            for (i, row) in rows.iter().enumerate() {
                let out = net.infer(row);
                assert_eq!(values[i], out.value);

                if let Some(policy) = out.policy {
                    let rows_policy = &results["policy"];
                    assert_eq!(
                        &rows_policy[i * policy.len()..(i + 1) * policy.len()],
                        policy.as_slice()
                    );
                }
            }

            if arch.has_policy() {
                assert_eq!(graph.inputs[0].name, "board");
                assert_eq!(graph.outputs.len(), 2);
            }
        }
    }

    #[test]
    fn test_save_load() {
        let net = Network::new(Architecture::Convolutional { filters: 2, blocks: 1 }, 1).unwrap();
        let graph = InferenceGraph::from_network(&net);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.graph.json");

        graph.save(&path).unwrap();
        let loaded = InferenceGraph::load(&path).unwrap();
        assert_eq!(loaded, graph);
    }

    #[test]
    fn test_rejects_bad_input() {
        let net = Network::new(Architecture::Plain { hidden_layers: vec![4] }, 0).unwrap();
        let graph = InferenceGraph::from_network(&net);

        assert!(matches!(graph.run(&[0.0; 10]), Err(GraphError::ShapeMismatch { .. })));

        let mut broken = graph.clone();
        broken.initializers.pop();
        assert!(matches!(broken.validate(), Err(GraphError::UnknownTensor(_))));
    }
}
