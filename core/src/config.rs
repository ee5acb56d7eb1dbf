//! Configuration types for planforge.

use serde::Deserialize;
use std::path::PathBuf;

use crate::backend::Device;
use crate::compiler::CompileConfig;
use crate::diagnostics::Severity;
use crate::inference::{ChannelOrder, TensorNames};

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Model and plan locations.
    #[serde(default)]
    pub model: ModelConfig,

    /// Plan build settings.
    #[serde(default)]
    pub compile: CompileConfig,

    /// Inference configuration.
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Backend diagnostics.
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

/// Model configuration.
#[derive(Debug, Deserialize)]
pub struct ModelConfig {
    /// Model graph to compile.
    #[serde(default = "default_graph_path")]
    pub graph_path: PathBuf,

    /// Where the compiled plan is written and read.
    #[serde(default = "default_plan_path")]
    pub plan_path: PathBuf,

    /// Device to build for and run on.
    #[serde(default = "default_device")]
    pub device: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            graph_path: default_graph_path(),
            plan_path: default_plan_path(),
            device: default_device(),
        }
    }
}

impl ModelConfig {
    pub fn device(&self) -> crate::error::Result<Device> {
        self.device.parse()
    }
}

/// Inference configuration.
#[derive(Debug, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_input_name")]
    pub input_name: String,

    #[serde(default = "default_output_name")]
    pub output_name: String,

    /// One image per batch slot, in slot order.
    #[serde(default)]
    pub images: Vec<PathBuf>,

    #[serde(default)]
    pub channel_order: ChannelOrder,

    /// Decode images on the rayon pool.
    #[serde(default = "default_parallel_preprocess")]
    pub parallel_preprocess: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            input_name: default_input_name(),
            output_name: default_output_name(),
            images: Vec::new(),
            channel_order: ChannelOrder::default(),
            parallel_preprocess: default_parallel_preprocess(),
        }
    }
}

impl InferenceConfig {
    pub fn tensor_names(&self) -> TensorNames {
        TensorNames::new(&self.input_name, &self.output_name)
    }
}

/// Diagnostics configuration.
#[derive(Debug, Deserialize)]
pub struct DiagnosticsConfig {
    /// Least severe backend message that is printed.
    #[serde(default = "default_severity")]
    pub severity: Severity,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            severity: default_severity(),
        }
    }
}

fn default_graph_path() -> PathBuf {
    PathBuf::from("best.graph.yaml")
}

fn default_plan_path() -> PathBuf {
    PathBuf::from("best.plan")
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_input_name() -> String {
    "input".to_string()
}

fn default_output_name() -> String {
    "output".to_string()
}

fn default_parallel_preprocess() -> bool {
    true
}

fn default_severity() -> Severity {
    Severity::Warning
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> crate::error::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }
}
