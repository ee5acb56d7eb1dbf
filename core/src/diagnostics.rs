//! Severity-tagged diagnostics emitted by compute backends.
//!
//! Backends report build and runtime messages through a [`DiagnosticsSink`]
//! handed to them by the caller. The default sink forwards to `tracing` and
//! drops anything less severe than a warning.

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error, info, warn};

use crate::error::ForgeError;

/// Message severity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[serde(alias = "internal")]
    InternalError,
    Error,
    #[serde(alias = "warn")]
    Warning,
    Info,
    #[serde(alias = "debug")]
    Verbose,
}

impl Severity {
    /// Whether `self` is at least as severe as `threshold`.
    pub fn is_at_least(self, threshold: Severity) -> bool {
        self <= threshold
    }
}

impl FromStr for Severity {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "internal_error" | "internal" => Ok(Self::InternalError),
            "error" => Ok(Self::Error),
            "warning" | "warn" => Ok(Self::Warning),
            "info" => Ok(Self::Info),
            "verbose" | "debug" => Ok(Self::Verbose),
            other => Err(ForgeError::config(format!("Invalid severity: {}", other))),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InternalError => "internal_error",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Verbose => "verbose",
        };
        f.write_str(s)
    }
}

/// Receiver for backend diagnostics.
///
/// Implementations are shared across compiler, loader and execution stages,
/// so they must tolerate calls from several threads. Each call carries one
/// complete message.
pub trait DiagnosticsSink: Send + Sync {
    fn log(&self, severity: Severity, message: &str);
}

/// Sink that emits one `tracing` event per accepted message.
#[derive(Debug, Clone, Copy)]
pub struct TracingSink {
    threshold: Severity,
}

impl TracingSink {
    pub fn new(threshold: Severity) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> Severity {
        self.threshold
    }

    pub fn accepts(&self, severity: Severity) -> bool {
        severity.is_at_least(self.threshold)
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new(Severity::Warning)
    }
}

impl DiagnosticsSink for TracingSink {
    fn log(&self, severity: Severity, message: &str) {
        if !self.accepts(severity) {
            return;
        }
        // Keep a message on a single output line.
        let line = message.trim_end().replace('\n', " ");
        match severity {
            Severity::InternalError | Severity::Error => error!(severity = %severity, "{}", line),
            Severity::Warning => warn!("{}", line),
            Severity::Info => info!("{}", line),
            Severity::Verbose => debug!("{}", line),
        }
    }
}
