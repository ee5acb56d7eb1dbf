//! Plan compilation: model graph in, serialized execution plan out.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tracing::info;

use crate::backend::Backend;
use crate::diagnostics::{DiagnosticsSink, Severity};
use crate::error::{ForgeError, Result};
use crate::graph::ModelGraph;

/// Default working-memory budget for plan building (1 MiB).
pub const DEFAULT_WORKSPACE_BYTES: usize = 1 << 20;

/// Arithmetic precision requested from the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
}

impl FromStr for Precision {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fp32" | "f32" => Ok(Self::Fp32),
            "fp16" | "f16" => Ok(Self::Fp16),
            other => Err(ForgeError::config(format!("Invalid precision: {}", other))),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fp32 => write!(f, "fp32"),
            Self::Fp16 => write!(f, "fp16"),
        }
    }
}

/// Build settings for one compilation.
///
/// Also the `compile` section of the YAML configuration; missing fields take
/// their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    /// Working-memory budget in bytes.
    pub workspace_bytes: usize,
    pub precision: Precision,
    /// Fixes a deferred batch dimension when set.
    pub batch_size: Option<usize>,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            workspace_bytes: DEFAULT_WORKSPACE_BYTES,
            precision: Precision::default(),
            batch_size: None,
        }
    }
}

/// Turns model graphs into serialized plans using one backend.
pub struct PlanCompiler<'a> {
    backend: &'a dyn Backend,
    sink: &'a dyn DiagnosticsSink,
}

impl<'a> PlanCompiler<'a> {
    pub fn new(backend: &'a dyn Backend, sink: &'a dyn DiagnosticsSink) -> Self {
        Self { backend, sink }
    }

    /// Compile `graph` into plan bytes.
    ///
    /// The graph is only borrowed. On success the returned bytes are never
    /// empty; on failure nothing is returned.
    ///
    /// # Errors
    ///
    /// [`ForgeError::GraphInvalid`] if the graph cannot be lowered and
    /// [`ForgeError::ResourceExhausted`] if the workspace budget is too small.
    pub fn compile(&self, graph: &ModelGraph, config: &CompileConfig) -> Result<Vec<u8>> {
        if config.batch_size == Some(0) {
            return Err(ForgeError::config("batch size must be at least 1"));
        }

        info!(
            "Compiling '{}' for {} ({} backend, {}, workspace {} bytes)",
            graph.name,
            self.backend.device(),
            self.backend.name(),
            config.precision,
            config.workspace_bytes
        );
        let start = Instant::now();

        let bytes = self
            .backend
            .build_serialized(graph, config, self.sink)
            .inspect_err(|e| self.sink.log(Severity::Error, &e.to_string()))?;

        if bytes.is_empty() {
            return Err(ForgeError::graph_invalid(format!(
                "{} backend produced an empty plan",
                self.backend.name()
            )));
        }

        info!(
            "Built plan: {} bytes in {:.2}ms",
            bytes.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(bytes)
    }
}
