use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum VmError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// The operation was refused because the entity is in the wrong state.
    /// Nothing was sent to VBoxManage.
    #[error("{name}: {message}")]
    Precondition { name: String, message: String },

    #[error("VirtualBox operation failed: {command}: {message}")]
    #[diagnostic(help("run the command by hand with VBoxManage to see the full output"))]
    Tool { command: String, message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("document store error: {message}")]
    Store { message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("failed to render output: {message}")]
    Output { message: String },
}

impl VmError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        VmError::Validation {
            message: message.into(),
        }
    }

    pub(crate) fn precondition(name: &str, message: impl Into<String>) -> Self {
        VmError::Precondition {
            name: name.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn not_found(kind: &'static str, name: &str) -> Self {
        VmError::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    /// True for refusals that never reached the external tool.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            VmError::Precondition { .. } | VmError::Validation { .. } | VmError::NotFound { .. }
        )
    }
}

/// Outcome of a step whose failure is logged but never propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestEffort {
    Done,
    Skipped { reason: String },
}

impl BestEffort {
    pub fn from_result<T, E: std::fmt::Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(_) => BestEffort::Done,
            Err(e) => BestEffort::Skipped {
                reason: e.to_string(),
            },
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, BestEffort::Done)
    }
}
