use anyhow::{Context, Result};
use approx::assert_abs_diff_eq;
use image::{Rgb, RgbImage};
use planforge::backend::{Backend, Bindings, CpuBackend, DeviceAllocator};
use planforge::diagnostics::{DiagnosticsSink, Severity, TracingSink};
use planforge::inference::{CompiledPlan, InferenceSession, SessionState, TensorNames};
use planforge::{store, CompileConfig, ForgeError, ModelGraph, PlanCompiler, Precision};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Pool each channel, then project the three channel means onto 84 scores.
fn detector_head_yaml(height: usize, width: usize) -> String {
    format!(
        r#"
name: detector-head
inputs:
  - name: input
    shape: [-1, 3, {height}, {width}]
outputs: [output]
nodes:
  - op: global_average_pool
    input: input
    output: pooled
  - op: flatten
    input: pooled
    output: features
  - op: gemm
    input: features
    output: logits
    weight: {{shape: [84, 3], fill: 0.5}}
    bias: {{shape: [84], fill: 0.1}}
  - op: sigmoid
    input: logits
    output: output
"#
    )
}

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<(Severity, String)>>,
}

impl RecordingSink {
    fn messages(&self) -> Vec<(Severity, String)> {
        self.messages.lock().unwrap().clone()
    }
}

impl DiagnosticsSink for RecordingSink {
    fn log(&self, severity: Severity, message: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((severity, message.to_string()));
    }
}

fn solid_image(dir: &Path, name: &str, rgb: [u8; 3]) -> Result<PathBuf> {
    let path = dir.join(name);
    RgbImage::from_pixel(8, 8, Rgb(rgb)).save(&path)?;
    Ok(path)
}

fn compile(backend: &CpuBackend, yaml: &str, config: &CompileConfig) -> Result<Vec<u8>> {
    let graph = ModelGraph::from_yaml_str(yaml)?;
    let bytes = PlanCompiler::new(backend, &TracingSink::default()).compile(&graph, config)?;
    Ok(bytes)
}

#[test]
fn identical_images_give_identical_rows() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let graph_path = dir.path().join("best.graph.yaml");
    std::fs::write(&graph_path, detector_head_yaml(640, 640))?;
    let plan_path = dir.path().join("best.plan");

    let backend = Arc::new(CpuBackend::new());
    let sink = Arc::new(TracingSink::default());

    let graph = ModelGraph::from_path(&graph_path)?;
    let bytes = PlanCompiler::new(backend.as_ref(), sink.as_ref())
        .compile(&graph, &CompileConfig::default())?;
    assert!(!bytes.is_empty());
    store::write_plan(&plan_path, &bytes)?;

    let bytes = store::read_plan(&plan_path)?;
    let mut session = InferenceSession::open(
        backend.clone(),
        sink,
        &bytes,
        &TensorNames::default(),
        Some(4),
    )?;
    let binding = session.binding().context("session is not bound")?;
    assert_eq!(binding.input_shape(), &[4, 3, 640, 640]);
    assert_eq!(binding.output_shape(), &[4, 84]);

    let image = solid_image(dir.path(), "frame.png", [255, 128, 0])?;
    let images = vec![image; 4];
    let mut batch = session.input_batch()?;
    batch.fill_all(&images, true)?;

    let result = session.run(&batch)?;
    let output = &result.output;
    assert_eq!(output.name, "output");
    assert_eq!(output.shape(), &[4, 84]);

    let logit = 0.5 * (255.0 + 128.0 + 0.0) / 255.0 + 0.1;
    let expected = 1.0 / (1.0 + (-logit as f32).exp());
    let first = output.sample(0).context("missing row 0")?;
    for value in first.iter() {
        assert_abs_diff_eq!(*value, expected, epsilon = 1e-4);
    }
    for row in 1..4 {
        let sample = output.sample(row).context("missing row")?;
        assert_eq!(sample, first);
    }

    // a second run on the same session reuses the buffers
    let again = session.run(&batch)?;
    assert_eq!(again.output.data, result.output.data);
    assert_eq!(session.state(), SessionState::Ready);

    session.teardown();
    assert_eq!(backend.memory().allocated(), 0);
    assert_eq!(backend.memory().block_count(), 0);
    Ok(())
}

#[test]
fn fixed_batch_plan_describes_its_tensors() -> Result<()> {
    let backend = CpuBackend::with_capacity(1 << 24);
    let config = CompileConfig {
        batch_size: Some(2),
        ..CompileConfig::default()
    };
    let bytes = compile(&backend, &detector_head_yaml(16, 16), &config)?;

    let plan = CompiledPlan::load(&backend, &bytes, &TracingSink::default())?;
    assert_eq!(
        plan.describe(),
        vec![
            "Input tensor: input, shape: 2 3 16 16".to_string(),
            "Output tensor: output, shape: 2 84".to_string(),
        ]
    );
    // describing twice yields the same order
    assert_eq!(plan.describe(), plan.describe());
    assert_eq!(plan.size_bytes(), bytes.len());
    Ok(())
}

#[test]
fn deferred_batch_plan_keeps_dynamic_axis() -> Result<()> {
    let backend = CpuBackend::with_capacity(1 << 24);
    let bytes = compile(&backend, &detector_head_yaml(16, 16), &CompileConfig::default())?;
    let plan = CompiledPlan::load(&backend, &bytes, &TracingSink::default())?;
    assert_eq!(plan.describe()[0], "Input tensor: input, shape: -1 3 16 16");

    let (index, input) = plan.tensor("input").context("input not declared")?;
    assert_eq!(index, 0);
    assert!(input.has_deferred_batch());
    Ok(())
}

#[test]
fn truncated_plans_are_rejected() -> Result<()> {
    let backend = CpuBackend::with_capacity(1 << 24);
    let sink = TracingSink::default();
    let bytes = compile(&backend, &detector_head_yaml(16, 16), &CompileConfig::default())?;

    let err = CompiledPlan::load(&backend, &[], &sink).unwrap_err();
    assert!(matches!(err, ForgeError::Truncated(_)));

    let err = CompiledPlan::load(&backend, &bytes[..bytes.len() / 2], &sink).unwrap_err();
    assert!(matches!(err, ForgeError::Truncated(_)));

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("empty.plan");
    store::write_plan(&path, &[])?;
    let err = CompiledPlan::load_file(&backend, &path, &sink).unwrap_err();
    assert!(matches!(err, ForgeError::Truncated(_)));
    Ok(())
}

#[test]
fn tampered_version_is_incompatible() -> Result<()> {
    let backend = CpuBackend::with_capacity(1 << 24);
    let mut bytes = compile(&backend, &detector_head_yaml(16, 16), &CompileConfig::default())?;
    bytes[4] = bytes[4].wrapping_add(1);

    let sink = RecordingSink::default();
    let err = CompiledPlan::load(&backend, &bytes, &sink).unwrap_err();
    assert!(matches!(err, ForgeError::IncompatiblePlan(_)));
    assert!(sink
        .messages()
        .iter()
        .any(|(severity, _)| *severity == Severity::Error));
    Ok(())
}

#[test]
fn absent_tensor_name_is_not_found() -> Result<()> {
    let backend = Arc::new(CpuBackend::with_capacity(1 << 24));
    let bytes = compile(&backend, &detector_head_yaml(16, 16), &CompileConfig::default())?;

    let mut session = InferenceSession::new(backend.clone(), Arc::new(TracingSink::default()));
    session.load_plan(&bytes)?;
    let err = session
        .bind(&TensorNames::new("images", "output"), Some(1))
        .unwrap_err();
    assert!(matches!(err, ForgeError::TensorNotFound(_)));
    assert_eq!(err.exit_code(), 5);
    assert_eq!(session.state(), SessionState::PlanLoaded);
    assert_eq!(backend.memory().allocated(), 0);
    Ok(())
}

#[test]
fn fp16_request_warns_and_builds_fp32() -> Result<()> {
    let backend = CpuBackend::with_capacity(1 << 24);
    let sink = RecordingSink::default();
    let graph = ModelGraph::from_yaml_str(&detector_head_yaml(16, 16))?;
    let config = CompileConfig {
        precision: Precision::Fp16,
        ..CompileConfig::default()
    };
    let bytes = PlanCompiler::new(&backend, &sink).compile(&graph, &config)?;
    assert!(!bytes.is_empty());

    let messages = sink.messages();
    assert!(messages
        .iter()
        .any(|(severity, message)| *severity == Severity::Warning && message.contains("fp16")));
    assert!(messages
        .iter()
        .all(|(severity, _)| *severity != Severity::Error));
    Ok(())
}

#[test]
fn small_workspace_is_exhausted() -> Result<()> {
    let backend = CpuBackend::with_capacity(1 << 24);
    let yaml = r#"
inputs:
  - name: input
    shape: [-1, 3, 64, 64]
outputs: [output]
nodes:
  - {op: relu, input: input, output: hidden}
  - {op: sigmoid, input: hidden, output: output}
"#;
    let config = CompileConfig {
        workspace_bytes: 1024,
        batch_size: Some(4),
        ..CompileConfig::default()
    };
    let err = compile(&backend, yaml, &config)
        .unwrap_err()
        .downcast::<ForgeError>()?;
    assert!(matches!(
        err,
        ForgeError::ResourceExhausted {
            required: 196_608,
            budget: 1024
        }
    ));
    Ok(())
}

#[test]
fn context_creation_failure_releases_buffers() -> Result<()> {
    let yaml = r#"
inputs:
  - name: input
    shape: [1, 1, 4, 4]
outputs: [output]
nodes:
  - {op: relu, input: input, output: hidden}
  - {op: relu, input: hidden, output: output}
"#;
    // 128 bytes of buffers fit, the 64-byte workspace does not
    let backend = Arc::new(CpuBackend::with_capacity(150));
    let bytes = compile(&backend, yaml, &CompileConfig::default())?;

    let mut session = InferenceSession::new(backend.clone(), Arc::new(TracingSink::default()));
    session.load_plan(&bytes)?;
    session.bind(&TensorNames::default(), None)?;
    assert_eq!(backend.memory().allocated(), 128);

    let err = session.prepare().unwrap_err();
    assert!(matches!(err, ForgeError::ContextCreationFailed(_)));
    assert_eq!(err.exit_code(), 8);
    assert_eq!(session.state(), SessionState::BuffersAllocated);

    drop(session);
    assert_eq!(backend.memory().allocated(), 0);
    Ok(())
}

#[test]
fn mismatched_bindings_do_not_execute() -> Result<()> {
    let backend = CpuBackend::with_capacity(1 << 24);
    let sink = TracingSink::default();
    let bytes = compile(&backend, &detector_head_yaml(16, 16), &CompileConfig::default())?;

    let engine = backend.deserialize(&bytes, &sink)?;
    let mut context = engine.create_context()?;
    let err = context.execute(&Bindings::new(Vec::new())).unwrap_err();
    assert!(matches!(err, ForgeError::BindingMismatch(_)));
    Ok(())
}

#[test]
fn partial_batch_is_a_caller_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let backend = Arc::new(CpuBackend::with_capacity(1 << 24));
    let bytes = compile(&backend, &detector_head_yaml(16, 16), &CompileConfig::default())?;
    let mut session = InferenceSession::open(
        backend.clone(),
        Arc::new(TracingSink::default()),
        &bytes,
        &TensorNames::default(),
        Some(3),
    )?;

    let image = solid_image(dir.path(), "frame.png", [10, 20, 30])?;
    let mut batch = session.input_batch()?;
    batch.fill(0, &image)?;
    batch.fill(2, &image)?;

    let err = session.run(&batch).unwrap_err();
    assert!(matches!(
        err,
        ForgeError::IncompleteBatch {
            expected: 3,
            got: 2
        }
    ));
    assert_eq!(err.exit_code(), 7);

    batch.fill(1, &image)?;
    let result = session.run(&batch)?;
    assert_eq!(result.output.shape(), &[3, 84]);
    Ok(())
}

#[test]
fn oversized_dimensions_fail_to_compile() -> Result<()> {
    let backend = CpuBackend::with_capacity(1 << 24);
    let yaml = r#"
inputs:
  - name: input
    shape: [1, 4294967296, 4294967296, 4]
outputs: [output]
nodes:
  - {op: relu, input: input, output: hidden}
  - {op: sigmoid, input: hidden, output: output}
"#;
    let err = compile(&backend, yaml, &CompileConfig::default())
        .unwrap_err()
        .downcast::<ForgeError>()?;
    assert!(matches!(err, ForgeError::GraphInvalid(_)));
    assert_eq!(err.exit_code(), 3);
    Ok(())
}
