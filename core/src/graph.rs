//! Portable model graph and its interchange parser.
//!
//! Graphs are stored as YAML or JSON documents:
//!
//! ```yaml
//! name: tiny-detector
//! inputs:
//!   - name: input
//!     shape: [-1, 3, 640, 640]
//! outputs: [output]
//! nodes:
//!   - op: global_average_pool
//!     input: input
//!     output: pooled
//!   - op: flatten
//!     input: pooled
//!     output: features
//!   - op: gemm
//!     input: features
//!     output: output
//!     weight: { shape: [84, 3], fill: 0.01 }
//! ```
//!
//! Nodes are listed in execution order. A `-1` on the first input axis is the
//! deferred batch dimension.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::backend::{DataType, Dim};
use crate::error::{ForgeError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelGraph {
    #[serde(default = "default_graph_name")]
    pub name: String,
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<String>,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValueInfo {
    pub name: String,
    pub shape: Vec<Dim>,
    #[serde(default)]
    pub dtype: DataType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Identity,
    Relu,
    Sigmoid,
    Scale,
    GlobalAveragePool,
    Flatten,
    Gemm,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Identity => "identity",
            Self::Relu => "relu",
            Self::Sigmoid => "sigmoid",
            Self::Scale => "scale",
            Self::GlobalAveragePool => "global_average_pool",
            Self::Flatten => "flatten",
            Self::Gemm => "gemm",
        };
        f.write_str(s)
    }
}

/// One operator application. Attributes not used by `op` must be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Node {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub op: OpKind,
    pub input: String,
    pub output: String,
    /// `gemm`: weight matrix of shape `[out_features, in_features]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<Initializer>,
    /// `gemm`: bias vector of shape `[out_features]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias: Option<Initializer>,
    /// `scale`: multiplier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mul: Option<f32>,
    /// `scale`: offset added after multiplying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add: Option<f32>,
}

impl Node {
    pub fn new(op: OpKind, input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: None,
            op,
            input: input.into(),
            output: output.into(),
            weight: None,
            bias: None,
            mul: None,
            add: None,
        }
    }

    /// Name used in diagnostics: the explicit name or `op->output`.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}->{}", self.op, self.output),
        }
    }
}

/// Constant tensor data, either listed inline or filled with one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Initializer {
    pub shape: Vec<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<f32>,
}

impl Initializer {
    pub fn from_data(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            shape,
            data,
            fill: None,
        }
    }

    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        Self {
            shape,
            data: Vec::new(),
            fill: Some(value),
        }
    }

    /// Number of values. Saturates at `usize::MAX`.
    pub fn len(&self) -> usize {
        self.checked_len().unwrap_or(usize::MAX)
    }

    fn checked_len(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expand into a dense buffer.
    pub fn materialize(&self) -> Result<Vec<f32>> {
        let len = self.checked_len().ok_or_else(|| {
            ForgeError::graph_invalid(format!("initializer of shape {:?} is too large", self.shape))
        })?;
        match (self.fill, self.data.is_empty()) {
            (Some(value), true) => Ok(vec![value; len]),
            (None, false) if self.data.len() == len => Ok(self.data.clone()),
            (None, false) => Err(ForgeError::graph_invalid(format!(
                "initializer of shape {:?} has {} values, expected {}",
                self.shape,
                self.data.len(),
                len
            ))),
            (Some(_), false) => Err(ForgeError::graph_invalid(
                "initializer sets both 'data' and 'fill'",
            )),
            (None, true) if len == 0 => Ok(Vec::new()),
            (None, true) => Err(ForgeError::graph_invalid(
                "initializer has neither 'data' nor 'fill'",
            )),
        }
    }
}

fn default_graph_name() -> String {
    "graph".to_string()
}

impl ModelGraph {
    /// Parse a graph file. `.json` files are read as JSON, anything else as YAML.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ForgeError::FileNotFound(path.to_path_buf()));
        }
        let bytes = std::fs::read(path)?;
        let content = String::from_utf8(bytes).map_err(|e| {
            ForgeError::graph_invalid(format!("{}: not a text graph file: {}", path.display(), e))
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let graph = if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        };
        graph.map_err(|e| match e {
            ForgeError::GraphInvalid(msg) => {
                ForgeError::graph_invalid(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let graph: ModelGraph =
            serde_yaml::from_str(yaml).map_err(|e| ForgeError::graph_invalid(e.to_string()))?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let graph: ModelGraph =
            serde_json::from_str(json).map_err(|e| ForgeError::graph_invalid(e.to_string()))?;
        graph.validate()?;
        Ok(graph)
    }

    /// Structural checks: every tensor is defined once before it is used and
    /// every declared output is produced by a node.
    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(ForgeError::graph_invalid("graph declares no inputs"));
        }
        if self.outputs.is_empty() {
            return Err(ForgeError::graph_invalid("graph declares no outputs"));
        }

        let mut defined: HashSet<&str> = HashSet::new();
        for input in &self.inputs {
            if !defined.insert(input.name.as_str()) {
                return Err(ForgeError::graph_invalid(format!(
                    "input '{}' is declared twice",
                    input.name
                )));
            }
            if input.shape.iter().any(|d| *d == Dim::Fixed(0)) {
                return Err(ForgeError::graph_invalid(format!(
                    "input '{}' has a zero-sized dimension",
                    input.name
                )));
            }
        }

        let mut produced: HashSet<&str> = HashSet::new();
        for node in &self.nodes {
            if !defined.contains(node.input.as_str()) {
                return Err(ForgeError::graph_invalid(format!(
                    "node '{}' reads undefined tensor '{}'",
                    node.label(),
                    node.input
                )));
            }
            if !defined.insert(node.output.as_str()) {
                return Err(ForgeError::graph_invalid(format!(
                    "tensor '{}' is defined more than once",
                    node.output
                )));
            }
            produced.insert(node.output.as_str());
        }

        let mut seen_outputs: HashSet<&str> = HashSet::new();
        for output in &self.outputs {
            if !produced.contains(output.as_str()) {
                return Err(ForgeError::graph_invalid(format!(
                    "output '{}' is not produced by any node",
                    output
                )));
            }
            if !seen_outputs.insert(output.as_str()) {
                return Err(ForgeError::graph_invalid(format!(
                    "output '{}' is declared twice",
                    output
                )));
            }
        }

        Ok(())
    }
}
