//! Compiler Error System
//!
//! Every failure carries a stable error code. Codegen codes (E3xx) are
//! user-facing diagnostics about the input program; E9xx codes cover I/O,
//! malformed input and internal compiler errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::ast::Span;

/// Error codes for compilation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Codegen errors (E300-E399)
    E300, // Variable without a value type
    E301, // Unsupported construct
    E302, // Invalid control flow
    E303, // Unknown function

    // Environment errors (E900-E999)
    E900, // Internal compiler error
    E901, // I/O failure
    E902, // Malformed input
}

impl ErrorCode {
    /// Get the code string (e.g., "E301")
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCode::E300 => "E300",
            ErrorCode::E301 => "E301",
            ErrorCode::E302 => "E302",
            ErrorCode::E303 => "E303",
            ErrorCode::E900 => "E900",
            ErrorCode::E901 => "E901",
            ErrorCode::E902 => "E902",
        }
    }

    /// Get a brief description of the error category
    pub fn category(&self) -> &'static str {
        match self {
            ErrorCode::E300 | ErrorCode::E301 | ErrorCode::E302 | ErrorCode::E303 => {
                "codegen error"
            }
            ErrorCode::E900 => "internal compiler error",
            ErrorCode::E901 => "io error",
            ErrorCode::E902 => "input error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Compilation error types
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("variable has a void type and cannot hold a value: {name}")]
    VoidVariable { name: String, span: Span },

    #[error("unsupported construct in native backend: {construct}")]
    Unsupported { construct: String, span: Span },

    #[error("invalid control flow: {message}")]
    InvalidControlFlow { message: String, span: Span },

    #[error("unknown function: {name}")]
    UnknownFunction { name: String, span: Span },

    #[error("internal compiler error: {message}")]
    Internal { message: String },

    #[error("could not write '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed program: {message}")]
    InvalidInput { message: String },
}

impl CompileError {
    pub fn internal(message: impl Into<String>) -> Self {
        CompileError::Internal {
            message: message.into(),
        }
    }

    pub fn unsupported(construct: impl Into<String>, span: Span) -> Self {
        CompileError::Unsupported {
            construct: construct.into(),
            span,
        }
    }

    pub fn control_flow(message: impl Into<String>, span: Span) -> Self {
        CompileError::InvalidControlFlow {
            message: message.into(),
            span,
        }
    }

    /// Error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            CompileError::VoidVariable { .. } => ErrorCode::E300,
            CompileError::Unsupported { .. } => ErrorCode::E301,
            CompileError::InvalidControlFlow { .. } => ErrorCode::E302,
            CompileError::UnknownFunction { .. } => ErrorCode::E303,
            CompileError::Internal { .. } => ErrorCode::E900,
            CompileError::Io { .. } => ErrorCode::E901,
            CompileError::InvalidInput { .. } => ErrorCode::E902,
        }
    }

    /// Source location of the offending node, when known
    pub fn span(&self) -> Option<Span> {
        match self {
            CompileError::VoidVariable { span, .. }
            | CompileError::Unsupported { span, .. }
            | CompileError::InvalidControlFlow { span, .. }
            | CompileError::UnknownFunction { span, .. } => Some(*span).filter(|s| s.line > 0),
            _ => None,
        }
    }

    /// Whether the error is a bug in the compiler rather than in the input
    pub fn is_internal(&self) -> bool {
        matches!(self, CompileError::Internal { .. })
    }

    /// Render as `error[E301]: message` with an optional location line
    pub fn report(&self) -> String {
        let mut output = format!("error[{}]: {}", self.code(), self);
        if let Some(span) = self.span() {
            output.push_str(&format!("\n  --> {}:{}", span.line, span.column));
        }
        output
    }
}

/// Result type for compiler operations
pub type Result<T> = std::result::Result<T, CompileError>;
