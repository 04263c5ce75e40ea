//! Script error types.

/// A syntax error with the 1-based position where it was detected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("SyntaxError: {message} (line {line}, column {column})")]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

/// Abnormal termination of script evaluation.
///
/// `Cancelled` is raised at a statement checkpoint after a stop request
/// and must be swallowed exactly once by whoever owns the context.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Fault {
    #[error("execution cancelled")]
    Cancelled,

    #[error("{0}")]
    Error(String),

    #[error("Uncaught {0}")]
    Thrown(String),
}

impl Fault {
    pub fn error(message: impl Into<String>) -> Self {
        Fault::Error(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Fault::Cancelled)
    }
}
