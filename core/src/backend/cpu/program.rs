//! Lowering of model graphs into executable programs, and their interpreter.

use ndarray::{ArrayD, ArrayView1, ArrayView2, Axis, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::memory::CpuMemory;
use crate::backend::{
    checked_byte_len, format_shape, Bindings, DataType, Dim, TensorDescriptor, TensorRole,
};
use crate::compiler::{CompileConfig, Precision};
use crate::diagnostics::{DiagnosticsSink, Severity};
use crate::error::{ForgeError, Result};
use crate::graph::{ModelGraph, Node, OpKind, ValueInfo};

/// A lowered plan: a flat list of kernels over numbered values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Program {
    pub name: String,
    pub tensors: Vec<TensorDescriptor>,
    pub values: Vec<ValueSlot>,
    pub steps: Vec<Step>,
    /// Scratch memory an execution context reserves up front.
    pub workspace_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ValueSlot {
    pub name: String,
    pub shape: Vec<Dim>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Step {
    pub kernel: Kernel,
    pub input: usize,
    pub output: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Kernel {
    Identity,
    Relu,
    Sigmoid,
    Scale {
        mul: f32,
        add: f32,
    },
    GlobalAveragePool,
    Flatten,
    Gemm {
        out_features: usize,
        in_features: usize,
        weight: Vec<f32>,
        bias: Vec<f32>,
    },
}

/// Lower `graph` under `config`.
pub(crate) fn lower(
    graph: &ModelGraph,
    config: &CompileConfig,
    sink: &dyn DiagnosticsSink,
) -> Result<Program> {
    graph.validate()?;

    if config.precision == Precision::Fp16 {
        sink.log(
            Severity::Warning,
            "fp16 precision is not supported by the cpu-reference backend; building an fp32 plan",
        );
    }

    let mut values: Vec<ValueSlot> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for input in &graph.inputs {
        if input.dtype != DataType::F32 {
            return Err(ForgeError::graph_invalid(format!(
                "input '{}' has dtype {:?}; only f32 tensors are supported",
                input.name, input.dtype
            )));
        }
        let shape = constrain_batch(input, config.batch_size)?;
        index.insert(input.name.as_str(), values.len());
        values.push(ValueSlot {
            name: input.name.clone(),
            shape,
        });
    }

    let mut steps = Vec::with_capacity(graph.nodes.len());
    for node in &graph.nodes {
        let input = *index.get(node.input.as_str()).ok_or_else(|| {
            ForgeError::graph_invalid(format!("undefined tensor '{}'", node.input))
        })?;
        let (kernel, shape) = lower_node(node, &values[input].shape)?;
        sink.log(
            Severity::Verbose,
            &format!(
                "{}: [{}] -> [{}]",
                node.label(),
                format_shape(&values[input].shape),
                format_shape(&shape)
            ),
        );
        let output = values.len();
        index.insert(node.output.as_str(), output);
        values.push(ValueSlot {
            name: node.output.clone(),
            shape,
        });
        steps.push(Step {
            kernel,
            input,
            output,
        });
    }

    let mut tensors = Vec::with_capacity(graph.inputs.len() + graph.outputs.len());
    for input in &graph.inputs {
        tensors.push(TensorDescriptor {
            name: input.name.clone(),
            role: TensorRole::Input,
            shape: values[index[input.name.as_str()]].shape.clone(),
            dtype: DataType::F32,
        });
    }
    for output in &graph.outputs {
        tensors.push(TensorDescriptor {
            name: output.clone(),
            role: TensorRole::Output,
            shape: values[index[output.as_str()]].shape.clone(),
            dtype: DataType::F32,
        });
    }

    for value in &values {
        if estimate_bytes(&value.shape).is_none() {
            return Err(ForgeError::graph_invalid(format!(
                "tensor '{}' of shape [{}] is too large to address",
                value.name,
                format_shape(&value.shape)
            )));
        }
    }
    let workspace_bytes = values
        .iter()
        .filter(|v| !tensors.iter().any(|t| t.name == v.name))
        .filter_map(|v| estimate_bytes(&v.shape))
        .max()
        .unwrap_or(0);
    if workspace_bytes > config.workspace_bytes {
        return Err(ForgeError::ResourceExhausted {
            required: workspace_bytes,
            budget: config.workspace_bytes,
        });
    }

    sink.log(
        Severity::Info,
        &format!(
            "lowered '{}': {} steps, {} bytes of workspace",
            graph.name,
            steps.len(),
            workspace_bytes
        ),
    );

    Ok(Program {
        name: graph.name.clone(),
        tensors,
        values,
        steps,
        workspace_bytes,
    })
}

fn constrain_batch(input: &ValueInfo, batch: Option<usize>) -> Result<Vec<Dim>> {
    let mut shape = input.shape.clone();
    match (shape.first().copied(), batch) {
        (None, _) => Err(ForgeError::graph_invalid(format!(
            "input '{}' has no batch axis",
            input.name
        ))),
        (Some(Dim::Dynamic), Some(b)) => {
            shape[0] = Dim::Fixed(b);
            Ok(shape)
        }
        (Some(Dim::Fixed(n)), Some(b)) if n != b => Err(ForgeError::graph_invalid(format!(
            "input '{}' has batch {} but batch {} was requested",
            input.name, n, b
        ))),
        _ => Ok(shape),
    }
}

/// Bytes of one value at its plan batch (a deferred batch counts as 1).
/// `None` if the size overflows.
fn estimate_bytes(shape: &[Dim]) -> Option<usize> {
    checked_byte_len(shape.iter().map(|d| d.fixed().unwrap_or(1)), DataType::F32)
}

fn fixed_tail(node: &Node, shape: &[Dim]) -> Result<Vec<usize>> {
    shape
        .iter()
        .skip(1)
        .map(|d| {
            d.fixed().ok_or_else(|| {
                ForgeError::graph_invalid(format!(
                    "{} needs fixed non-batch dimensions, got [{}]",
                    node.label(),
                    format_shape(shape)
                ))
            })
        })
        .collect()
}

fn lower_node(node: &Node, input: &[Dim]) -> Result<(Kernel, Vec<Dim>)> {
    match node.op {
        OpKind::Identity => Ok((Kernel::Identity, input.to_vec())),
        OpKind::Relu => Ok((Kernel::Relu, input.to_vec())),
        OpKind::Sigmoid => Ok((Kernel::Sigmoid, input.to_vec())),
        OpKind::Scale => {
            if node.mul.is_none() && node.add.is_none() {
                return Err(ForgeError::graph_invalid(format!(
                    "{} sets neither 'mul' nor 'add'",
                    node.label()
                )));
            }
            let kernel = Kernel::Scale {
                mul: node.mul.unwrap_or(1.0),
                add: node.add.unwrap_or(0.0),
            };
            Ok((kernel, input.to_vec()))
        }
        OpKind::GlobalAveragePool => {
            if input.len() < 3 {
                return Err(ForgeError::graph_invalid(format!(
                    "{} expects a [N, C, spatial...] input, got [{}]",
                    node.label(),
                    format_shape(input)
                )));
            }
            let mut shape = vec![Dim::Fixed(1); input.len()];
            shape[0] = input[0];
            shape[1] = input[1];
            Ok((Kernel::GlobalAveragePool, shape))
        }
        OpKind::Flatten => {
            if input.len() < 2 {
                return Err(ForgeError::graph_invalid(format!(
                    "{} expects at least two dimensions, got [{}]",
                    node.label(),
                    format_shape(input)
                )));
            }
            let features = fixed_tail(node, input)?
                .into_iter()
                .try_fold(1usize, |acc, d| acc.checked_mul(d))
                .ok_or_else(|| {
                    ForgeError::graph_invalid(format!(
                        "{} flattens [{}] into more features than fit in usize",
                        node.label(),
                        format_shape(input)
                    ))
                })?;
            Ok((Kernel::Flatten, vec![input[0], Dim::Fixed(features)]))
        }
        OpKind::Gemm => {
            if input.len() != 2 {
                return Err(ForgeError::graph_invalid(format!(
                    "{} expects a [N, K] input, got [{}]",
                    node.label(),
                    format_shape(input)
                )));
            }
            let in_features = fixed_tail(node, input)?[0];
            let weight = node.weight.as_ref().ok_or_else(|| {
                ForgeError::graph_invalid(format!("{} has no weight", node.label()))
            })?;
            let [out_features, k] = weight.shape[..] else {
                return Err(ForgeError::graph_invalid(format!(
                    "{} weight must be [out_features, in_features], got {:?}",
                    node.label(),
                    weight.shape
                )));
            };
            if k != in_features {
                return Err(ForgeError::graph_invalid(format!(
                    "{} weight expects {} input features, input has {}",
                    node.label(),
                    k,
                    in_features
                )));
            }
            let bias = match &node.bias {
                Some(bias) if bias.shape != [out_features] => {
                    return Err(ForgeError::graph_invalid(format!(
                        "{} bias must be [{}], got {:?}",
                        node.label(),
                        out_features,
                        bias.shape
                    )));
                }
                Some(bias) => bias.materialize()?,
                None => Vec::new(),
            };
            let kernel = Kernel::Gemm {
                out_features,
                in_features,
                weight: weight.materialize()?,
                bias,
            };
            Ok((kernel, vec![input[0], Dim::Fixed(out_features)]))
        }
    }
}

fn shape_error(what: &str, e: ndarray::ShapeError) -> ForgeError {
    ForgeError::execution(format!("{}: {}", what, e))
}

impl Kernel {
    fn apply(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self {
            Self::Identity => Ok(x.clone()),
            Self::Relu => Ok(x.mapv(|v| v.max(0.0))),
            Self::Sigmoid => Ok(x.mapv(|v| 1.0 / (1.0 + (-v).exp()))),
            Self::Scale { mul, add } => {
                let (mul, add) = (*mul, *add);
                Ok(x.mapv(|v| v * mul + add))
            }
            Self::GlobalAveragePool => {
                let shape = x.shape();
                let (n, c) = (shape[0], shape[1]);
                let spatial: usize = shape[2..].iter().product();
                let mut out_shape = vec![1; shape.len()];
                out_shape[0] = n;
                out_shape[1] = c;
                let grouped = x
                    .to_shape((n, c, spatial))
                    .map_err(|e| shape_error("global_average_pool", e))?;
                let pooled = grouped.mean_axis(Axis(2)).ok_or_else(|| {
                    ForgeError::execution("global_average_pool over an empty spatial extent")
                })?;
                ArrayD::from_shape_vec(IxDyn(&out_shape), pooled.iter().copied().collect())
                    .map_err(|e| shape_error("global_average_pool", e))
            }
            Self::Flatten => {
                let n = x.shape()[0];
                let features: usize = x.shape()[1..].iter().product();
                ArrayD::from_shape_vec(IxDyn(&[n, features]), x.iter().copied().collect())
                    .map_err(|e| shape_error("flatten", e))
            }
            Self::Gemm {
                out_features,
                in_features,
                weight,
                bias,
            } => {
                let n = x.shape()[0];
                let x = x
                    .to_shape((n, *in_features))
                    .map_err(|e| shape_error("gemm input", e))?;
                let w = ArrayView2::from_shape((*out_features, *in_features), weight.as_slice())
                    .map_err(|e| shape_error("gemm weight", e))?;
                let mut y = x.dot(&w.t());
                if !bias.is_empty() {
                    y += &ArrayView1::from(bias.as_slice());
                }
                Ok(y.into_dyn())
            }
        }
    }
}

impl Program {
    fn value_index(&self, name: &str) -> Result<usize> {
        self.values
            .iter()
            .position(|v| v.name == name)
            .ok_or_else(|| ForgeError::execution(format!("plan has no value named '{}'", name)))
    }

    /// Run the program against device buffers in `memory`.
    pub(crate) fn execute(&self, memory: &CpuMemory, bindings: &Bindings) -> Result<()> {
        let batch = bindings.validate(&self.tensors)?;
        let mut env: Vec<Option<ArrayD<f32>>> = vec![None; self.values.len()];

        for desc in self.tensors.iter().filter(|t| t.is_input()) {
            let binding = bindings
                .get(&desc.name)
                .ok_or_else(|| ForgeError::TensorNotFound(desc.name.clone()))?;
            let shape = concrete(desc, batch)?;
            let data = memory.read_f32(binding.ptr)?;
            let array = ArrayD::from_shape_vec(IxDyn(&shape), data)
                .map_err(|e| shape_error(&desc.name, e))?;
            env[self.value_index(&desc.name)?] = Some(array);
        }

        for step in &self.steps {
            let x = env[step.input].as_ref().ok_or_else(|| {
                ForgeError::execution(format!(
                    "value '{}' read before it was computed",
                    self.values[step.input].name
                ))
            })?;
            let y = step.kernel.apply(x)?;
            env[step.output] = Some(y);
        }

        for desc in self.tensors.iter().filter(|t| !t.is_input()) {
            let binding = bindings
                .get(&desc.name)
                .ok_or_else(|| ForgeError::TensorNotFound(desc.name.clone()))?;
            let y = env[self.value_index(&desc.name)?]
                .as_ref()
                .ok_or_else(|| {
                    ForgeError::execution(format!("output '{}' was not computed", desc.name))
                })?;
            let expected = concrete(desc, batch)?;
            if y.shape() != expected.as_slice() {
                return Err(ForgeError::execution(format!(
                    "output '{}' has shape {:?}, plan declares {:?}",
                    desc.name,
                    y.shape(),
                    expected
                )));
            }
            let values: Vec<f32> = y.iter().copied().collect();
            memory.write_f32(binding.ptr, &values)?;
        }

        Ok(())
    }
}

fn concrete(desc: &TensorDescriptor, batch: usize) -> Result<Vec<usize>> {
    desc.concrete_shape(batch)
        .ok_or_else(|| ForgeError::ShapeUnderspecified {
            name: desc.name.clone(),
            shape: format_shape(&desc.shape),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::TracingSink;
    use crate::graph::Initializer;
    use ndarray::array;

    fn classifier(in_shape: Vec<Dim>) -> ModelGraph {
        let mut gemm = Node::new(OpKind::Gemm, "features", "output");
        gemm.weight = Some(Initializer::from_data(
            vec![2, 3],
            vec![1.0, 0.0, 0.0, 0.0, 1.0, 1.0],
        ));
        gemm.bias = Some(Initializer::from_data(vec![2], vec![0.5, -0.5]));
        ModelGraph {
            name: "classifier".into(),
            inputs: vec![ValueInfo {
                name: "input".into(),
                shape: in_shape,
                dtype: DataType::F32,
            }],
            outputs: vec!["output".into()],
            nodes: vec![
                Node::new(OpKind::GlobalAveragePool, "input", "pooled"),
                Node::new(OpKind::Flatten, "pooled", "features"),
                gemm,
            ],
        }
    }

    fn nchw(n: Dim, c: usize, h: usize, w: usize) -> Vec<Dim> {
        vec![n, Dim::Fixed(c), Dim::Fixed(h), Dim::Fixed(w)]
    }

    #[test]
    fn test_lower_infers_shapes() {
        let graph = classifier(nchw(Dim::Dynamic, 3, 8, 8));
        let program = lower(&graph, &CompileConfig::default(), &TracingSink::default()).unwrap();
        assert_eq!(program.tensors.len(), 2);
        assert_eq!(program.tensors[0].shape, nchw(Dim::Dynamic, 3, 8, 8));
        assert_eq!(program.tensors[1].shape, vec![Dim::Dynamic, Dim::Fixed(2)]);
        assert_eq!(program.steps.len(), 3);
        // pooled [1,3,1,1] and features [1,3] are the intermediates
        assert_eq!(program.workspace_bytes, 12);
    }

    #[test]
    fn test_batch_constraint() {
        let graph = classifier(nchw(Dim::Dynamic, 3, 8, 8));
        let config = CompileConfig {
            batch_size: Some(4),
            ..CompileConfig::default()
        };
        let program = lower(&graph, &config, &TracingSink::default()).unwrap();
        assert_eq!(program.tensors[0].shape[0], Dim::Fixed(4));
        assert_eq!(program.tensors[1].shape[0], Dim::Fixed(4));

        let fixed = classifier(nchw(Dim::Fixed(2), 3, 8, 8));
        assert!(matches!(
            lower(&fixed, &config, &TracingSink::default()),
            Err(ForgeError::GraphInvalid(_))
        ));
    }

    #[test]
    fn test_workspace_budget() {
        let mut graph = classifier(nchw(Dim::Fixed(4), 3, 64, 64));
        graph.nodes.insert(0, Node::new(OpKind::Relu, "input", "activated"));
        graph.nodes[1].input = "activated".into();
        let config = CompileConfig {
            workspace_bytes: 1024,
            ..CompileConfig::default()
        };
        let err = lower(&graph, &config, &TracingSink::default()).unwrap_err();
        assert!(matches!(
            err,
            ForgeError::ResourceExhausted {
                required: 196_608,
                budget: 1024
            }
        ));
    }

    #[test]
    fn test_oversized_shapes_are_invalid() {
        let graph = ModelGraph {
            name: "huge".into(),
            inputs: vec![ValueInfo {
                name: "input".into(),
                shape: nchw(Dim::Fixed(1), 1 << 32, 1 << 32, 4),
                dtype: DataType::F32,
            }],
            outputs: vec!["output".into()],
            nodes: vec![
                Node::new(OpKind::Relu, "input", "hidden"),
                Node::new(OpKind::Sigmoid, "hidden", "output"),
            ],
        };
        let err = lower(&graph, &CompileConfig::default(), &TracingSink::default()).unwrap_err();
        assert!(matches!(err, ForgeError::GraphInvalid(_)));
        assert!(err.to_string().contains("too large"));

        // flatten features overflow even when every axis fits
        let mut flat = graph.clone();
        flat.inputs[0].shape = nchw(Dim::Dynamic, 1 << 22, 1 << 22, 1 << 22);
        flat.nodes = vec![Node::new(OpKind::Flatten, "input", "output")];
        let err = lower(&flat, &CompileConfig::default(), &TracingSink::default()).unwrap_err();
        assert!(matches!(err, ForgeError::GraphInvalid(_)));
    }

    #[test]
    fn test_gemm_weight_mismatch() {
        let mut graph = classifier(nchw(Dim::Dynamic, 4, 8, 8));
        graph.nodes[2].bias = None;
        let err = lower(&graph, &CompileConfig::default(), &TracingSink::default()).unwrap_err();
        assert!(err.to_string().contains("expects 3 input features"));
    }

    #[test]
    fn test_kernels() {
        let x = array![[-1.0f32, 2.0], [0.5, -3.0]].into_dyn();
        assert_eq!(
            Kernel::Relu.apply(&x).unwrap(),
            array![[0.0f32, 2.0], [0.5, 0.0]].into_dyn()
        );
        assert_eq!(
            Kernel::Scale { mul: 2.0, add: 1.0 }.apply(&x).unwrap(),
            array![[-1.0f32, 5.0], [2.0, -5.0]].into_dyn()
        );

        let planes = ArrayD::from_shape_vec(
            IxDyn(&[1, 2, 2, 2]),
            vec![1.0, 2.0, 3.0, 4.0, 10.0, 10.0, 10.0, 10.0],
        )
        .unwrap();
        let pooled = Kernel::GlobalAveragePool.apply(&planes).unwrap();
        assert_eq!(pooled.shape(), &[1, 2, 1, 1]);
        assert_eq!(pooled.iter().copied().collect::<Vec<_>>(), vec![2.5, 10.0]);

        let gemm = Kernel::Gemm {
            out_features: 2,
            in_features: 2,
            weight: vec![1.0, 1.0, 0.0, 2.0],
            bias: vec![0.0, 1.0],
        };
        let y = gemm.apply(&x).unwrap();
        assert_eq!(y, array![[1.0f32, 5.0], [-2.5, -5.0]].into_dyn());
    }
}
