use std::path::PathBuf;

use thiserror::Error;

use super::diagnostics::{Diagnostic, join_diagnostics};

/// Failure of the compile backend for one unit.
///
/// Cloneable so one failed build can be handed to every caller waiting on it.
#[derive(Debug, Clone, Error)]
#[error("failed to compile {unit}:\n{}", join_diagnostics(.diagnostics))]
pub struct CompileError {
    pub unit: String,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileError {
    pub fn new(unit: impl Into<String>, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            unit: unit.into(),
            diagnostics,
        }
    }

    pub fn single(unit: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(unit, vec![Diagnostic::error(message)])
    }
}

/// Errors surfaced by the lookup core. None of them are cached.
#[derive(Debug, Clone, Error)]
pub enum KilnError {
    #[error("invalid source path `{path}`: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("source not found: {}", .path.display())]
    NotFound { path: PathBuf },
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("type `{type_name}` not found in {unit}")]
    TypeNotFound { type_name: String, unit: String },
    #[error("failed to instantiate `{type_name}`: {reason}")]
    Instantiation { type_name: String, reason: String },
}

impl KilnError {
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn type_not_found(type_name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self::TypeNotFound {
            type_name: type_name.into(),
            unit: unit.into(),
        }
    }

    pub fn instantiation(type_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Instantiation {
            type_name: type_name.into(),
            reason: reason.into(),
        }
    }

    /// Stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            KilnError::InvalidPath { .. } => "invalid_path",
            KilnError::NotFound { .. } => "not_found",
            KilnError::Compile(_) => "compile",
            KilnError::TypeNotFound { .. } => "type_not_found",
            KilnError::Instantiation { .. } => "instantiation",
        }
    }
}
