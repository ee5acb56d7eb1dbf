//! planforge: compile model graphs into execution plans and run them.
//!
//! The pipeline has two halves. Compilation lowers a [`ModelGraph`] into
//! serialized plan bytes on a compute [`Backend`](backend::Backend); the bytes
//! are stored as an opaque artifact. Inference loads the bytes on the same
//! backend, binds the plan's named tensors to device buffers, fills a batch of
//! images in planar channel-major layout and executes the plan.
//!
//! Backends report build and runtime messages through an injected
//! [`DiagnosticsSink`](diagnostics::DiagnosticsSink). The bundled
//! [`CpuBackend`](backend::CpuBackend) implements the full backend interface
//! in pure Rust.
//!
//! # Example
//!
//! ```no_run
//! use planforge::backend::CpuBackend;
//! use planforge::diagnostics::TracingSink;
//! use planforge::inference::{InferenceSession, TensorNames};
//! use planforge::{CompileConfig, ModelGraph, PlanCompiler};
//! use std::sync::Arc;
//!
//! # fn main() -> planforge::Result<()> {
//! let backend = Arc::new(CpuBackend::new());
//! let sink = Arc::new(TracingSink::default());
//!
//! // Compile once and keep the plan
//! let graph = ModelGraph::from_path("best.graph.yaml")?;
//! let bytes = PlanCompiler::new(backend.as_ref(), sink.as_ref())
//!     .compile(&graph, &CompileConfig::default())?;
//! planforge::store::write_plan("best.plan", &bytes)?;
//!
//! // Run a batch of two images
//! let bytes = planforge::store::read_plan("best.plan")?;
//! let mut session =
//!     InferenceSession::open(backend, sink, &bytes, &TensorNames::default(), Some(2))?;
//! let mut batch = session.input_batch()?;
//! batch.fill_all(&["a.jpg", "b.jpg"], true)?;
//! let result = session.run(&batch)?;
//! println!("{:?} in {:.2}ms", result.output.shape(), result.latency_ms);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cli;
pub mod compiler;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod graph;
pub mod inference;
pub mod store;

// Re-export commonly used types
pub use backend::Device;
pub use compiler::{CompileConfig, PlanCompiler, Precision};
pub use error::{ForgeError, Result, Stage};
pub use graph::ModelGraph;
pub use inference::{InferenceResult, InferenceSession, TensorData};
