//! Error types for planforge.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for planforge operations.
pub type Result<T> = std::result::Result<T, ForgeError>;

/// Pipeline stage an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Compile,
    Load,
    Binding,
    Allocation,
    Preprocess,
    Context,
    Execution,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Compile => "compile",
            Self::Load => "load",
            Self::Binding => "binding",
            Self::Allocation => "allocation",
            Self::Preprocess => "preprocess",
            Self::Context => "context",
            Self::Execution => "execution",
        }
    }

    /// Process exit code reported when a run fails in this stage.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config => 2,
            Self::Compile => 3,
            Self::Load => 4,
            Self::Binding => 5,
            Self::Allocation => 6,
            Self::Preprocess => 7,
            Self::Context => 8,
            Self::Execution => 9,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while compiling, loading or executing a plan.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// The model graph could not be parsed or lowered.
    #[error("Invalid model graph: {0}")]
    GraphInvalid(String),

    /// The workspace budget is too small to build a plan.
    #[error("Workspace exhausted: plan needs {required} bytes, budget is {budget} bytes")]
    ResourceExhausted { required: usize, budget: usize },

    /// The plan bytes are empty or shorter than their header claims.
    #[error("Truncated plan: {0}")]
    Truncated(String),

    /// The backend rejected the plan (format, version or device mismatch).
    #[error("Incompatible plan: {0}")]
    IncompatiblePlan(String),

    /// A required tensor name is not declared by the plan.
    #[error("Tensor not found in plan: {0}")]
    TensorNotFound(String),

    /// A tensor shape still has unresolved dimensions.
    #[error("Shape underspecified for tensor '{name}': [{shape}]")]
    ShapeUnderspecified { name: String, shape: String },

    /// The device allocator could not satisfy a request.
    #[error("Out of device memory: requested {requested} bytes, {available} available")]
    OutOfDeviceMemory { requested: usize, available: usize },

    /// An input image could not be read or decoded.
    #[error("Failed to decode image {}: {reason}", .path.display())]
    DecodeFailed { path: PathBuf, reason: String },

    /// Bound buffers do not match the plan's tensor table.
    #[error("Binding mismatch: {0}")]
    BindingMismatch(String),

    /// The plan could not produce an execution context.
    #[error("Execution context creation failed: {0}")]
    ContextCreationFailed(String),

    /// An operation was attempted in the wrong session state.
    #[error("Session not ready: {0}")]
    NotReady(String),

    /// A host batch was not fully populated.
    #[error("Incomplete batch: expected {expected} images, got {got}")]
    IncompleteBatch { expected: usize, got: usize },

    /// The backend failed while executing a plan.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File not found.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

impl ForgeError {
    pub fn graph_invalid(msg: impl Into<String>) -> Self {
        Self::GraphInvalid(msg.into())
    }

    pub fn truncated(msg: impl Into<String>) -> Self {
        Self::Truncated(msg.into())
    }

    pub fn incompatible(msg: impl Into<String>) -> Self {
        Self::IncompatiblePlan(msg.into())
    }

    pub fn binding_mismatch(msg: impl Into<String>) -> Self {
        Self::BindingMismatch(msg.into())
    }

    pub fn context_creation(msg: impl Into<String>) -> Self {
        Self::ContextCreationFailed(msg.into())
    }

    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The pipeline stage this error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            Self::GraphInvalid(_) | Self::ResourceExhausted { .. } => Stage::Compile,
            Self::Truncated(_) | Self::IncompatiblePlan(_) => Stage::Load,
            Self::TensorNotFound(_)
            | Self::ShapeUnderspecified { .. }
            | Self::BindingMismatch(_) => Stage::Binding,
            Self::OutOfDeviceMemory { .. } => Stage::Allocation,
            Self::DecodeFailed { .. } | Self::IncompleteBatch { .. } => Stage::Preprocess,
            Self::ContextCreationFailed(_) => Stage::Context,
            Self::NotReady(_) | Self::Execution(_) => Stage::Execution,
            Self::Config(_)
            | Self::Yaml(_)
            | Self::Json(_)
            | Self::Io(_)
            | Self::FileNotFound(_) => Stage::Config,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.stage().exit_code()
    }
}
