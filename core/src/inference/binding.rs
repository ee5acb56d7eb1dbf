//! Resolving named plan tensors to buffer slots.

use tracing::debug;

use super::loader::CompiledPlan;
use crate::backend::{format_shape, Dim, TensorDescriptor, TensorRole};
use crate::error::{ForgeError, Result};

/// Names of the tensors the pipeline feeds and reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorNames {
    pub input: String,
    pub output: String,
}

impl TensorNames {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }
}

impl Default for TensorNames {
    fn default() -> Self {
        Self::new("input", "output")
    }
}

/// Outcome of resolving a plan's tensors for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBinding {
    /// Slot of the input tensor in plan order.
    pub input_index: usize,
    /// Slot of the output tensor in plan order.
    pub output_index: usize,
    pub batch_size: usize,
    /// Concrete shape of every plan tensor, in plan order.
    pub shapes: Vec<Vec<usize>>,
}

impl ResolvedBinding {
    pub fn input_shape(&self) -> &[usize] {
        &self.shapes[self.input_index]
    }

    pub fn output_shape(&self) -> &[usize] {
        &self.shapes[self.output_index]
    }
}

fn underspecified(desc: &TensorDescriptor) -> ForgeError {
    ForgeError::ShapeUnderspecified {
        name: desc.name.clone(),
        shape: format_shape(&desc.shape),
    }
}

fn find(tensors: &[TensorDescriptor], name: &str, role: TensorRole) -> Result<usize> {
    match tensors.iter().position(|t| t.name == name) {
        Some(index) if tensors[index].role == role => Ok(index),
        Some(index) => Err(ForgeError::TensorNotFound(format!(
            "'{}' is declared as an {} tensor, expected {}",
            name, tensors[index].role, role
        ))),
        None => Err(ForgeError::TensorNotFound(format!(
            "'{}' (plan declares: {})",
            name,
            tensors
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Resolve `names` against the plan's declared tensors.
///
/// Lookup is by name only. A deferred batch axis takes `batch_hint`; a plan
/// with a fixed batch keeps its own.
///
/// # Errors
///
/// [`ForgeError::TensorNotFound`] if a name is missing and
/// [`ForgeError::ShapeUnderspecified`] if any dimension other than a deferred
/// batch remains open, or the batch is deferred and no hint was given.
pub fn resolve(
    plan: &CompiledPlan,
    names: &TensorNames,
    batch_hint: Option<usize>,
) -> Result<ResolvedBinding> {
    let tensors = plan.tensors();
    let input_index = find(tensors, &names.input, TensorRole::Input)?;
    let output_index = find(tensors, &names.output, TensorRole::Output)?;

    let input = &tensors[input_index];
    if input.shape.is_empty() || input.shape.iter().skip(1).any(Dim::is_dynamic) {
        return Err(underspecified(input));
    }

    let batch_size = match input.shape[0] {
        Dim::Fixed(n) => {
            if let Some(hint) = batch_hint.filter(|&h| h != n) {
                debug!("Plan batch is fixed at {}, ignoring requested batch {}", n, hint);
            }
            n
        }
        Dim::Dynamic => batch_hint
            .filter(|&b| b > 0)
            .ok_or_else(|| underspecified(input))?,
    };

    let shapes = tensors
        .iter()
        .map(|t| t.concrete_shape(batch_size).ok_or_else(|| underspecified(t)))
        .collect::<Result<Vec<_>>>()?;

    Ok(ResolvedBinding {
        input_index,
        output_index,
        batch_size,
        shapes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::compiler::{CompileConfig, PlanCompiler};
    use crate::diagnostics::TracingSink;
    use crate::graph::{ModelGraph, Node, OpKind, ValueInfo};

    fn plan(shape: Vec<Dim>) -> CompiledPlan {
        let graph = ModelGraph {
            name: "relu".into(),
            inputs: vec![ValueInfo {
                name: "images".into(),
                shape,
                dtype: Default::default(),
            }],
            outputs: vec!["scores".into()],
            nodes: vec![Node::new(OpKind::Relu, "images", "scores")],
        };
        let backend = CpuBackend::with_capacity(1 << 20);
        let sink = TracingSink::default();
        let bytes = PlanCompiler::new(&backend, &sink)
            .compile(&graph, &CompileConfig::default())
            .unwrap();
        CompiledPlan::load(&backend, &bytes, &sink).unwrap()
    }

    #[test]
    fn test_resolve_by_name() {
        let plan = plan(vec![Dim::Fixed(2), Dim::Fixed(3)]);
        let binding = resolve(&plan, &TensorNames::new("images", "scores"), None).unwrap();
        assert_eq!(binding.input_index, 0);
        assert_eq!(binding.output_index, 1);
        assert_eq!(binding.batch_size, 2);
        assert_eq!(binding.input_shape(), &[2, 3]);
        assert_eq!(binding.output_shape(), &[2, 3]);
    }

    #[test]
    fn test_missing_name() {
        let plan = plan(vec![Dim::Fixed(2), Dim::Fixed(3)]);
        let err = resolve(&plan, &TensorNames::default(), None).unwrap_err();
        assert!(matches!(err, ForgeError::TensorNotFound(_)));

        // an output name does not satisfy the input lookup
        let err = resolve(&plan, &TensorNames::new("scores", "scores"), None).unwrap_err();
        assert!(matches!(err, ForgeError::TensorNotFound(_)));
    }

    #[test]
    fn test_deferred_batch() {
        let plan = plan(vec![Dim::Dynamic, Dim::Fixed(3)]);
        let names = TensorNames::new("images", "scores");
        let binding = resolve(&plan, &names, Some(5)).unwrap();
        assert_eq!(binding.batch_size, 5);
        assert_eq!(binding.shapes, vec![vec![5, 3], vec![5, 3]]);

        assert!(matches!(
            resolve(&plan, &names, None),
            Err(ForgeError::ShapeUnderspecified { .. })
        ));
    }

    #[test]
    fn test_open_feature_dimension() {
        let plan = plan(vec![Dim::Fixed(1), Dim::Dynamic]);
        let err = resolve(&plan, &TensorNames::new("images", "scores"), Some(1)).unwrap_err();
        assert!(matches!(err, ForgeError::ShapeUnderspecified { .. }));
    }
}
