// src/infra/errors.rs — Error types for the Perceptr agent

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PerceptrError {
    // Fatal to the instance: invalid project id or a failed construction step.
    #[error("Initialization failed: {message}")]
    Initialization { message: String },

    // A sub-component could not start; the component is skipped if non-critical.
    #[error("Recording component '{component}' failed: {message}")]
    Recording { component: String, message: String },

    // Network or server error during a batch send; recovered by backoff.
    #[error("Upload failed: {message}")]
    Upload { message: String, retriable: bool },

    #[error("Memory limit exceeded: {used_bytes} bytes used, limit {limit_bytes}")]
    MemoryLimit { used_bytes: u64, limit_bytes: u64 },

    // Terminal flush failed; the buffer is persisted for the next load.
    #[error("Export failed: {message}")]
    Export { message: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PerceptrError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, PerceptrError::Upload { retriable: true, .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PerceptrError::Initialization { .. } => ErrorKind::Initialization,
            PerceptrError::Recording { .. } => ErrorKind::Recording,
            PerceptrError::Upload { .. } => ErrorKind::Upload,
            PerceptrError::MemoryLimit { .. } => ErrorKind::MemoryLimit,
            PerceptrError::Export { .. } => ErrorKind::Export,
            _ => ErrorKind::Internal,
        }
    }
}

/// Coarse error classification carried on the observable error channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Initialization,
    Recording,
    Upload,
    MemoryLimit,
    Export,
    Internal,
}

/// Cloneable error record broadcast to `Orchestrator::subscribe_errors`
/// subscribers. Derived from a `PerceptrError` at the point it is surfaced.
#[derive(Debug, Clone)]
pub struct AgentError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PerceptrError> for AgentError {
    fn from(err: &PerceptrError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
