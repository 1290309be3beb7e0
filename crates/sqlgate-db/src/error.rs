//! Error taxonomy shared by the engine components.

use thiserror::Error;

/// Failures produced while splitting and rewriting a script body.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("unterminated {quote} quote starting at byte {offset}")]
    UnterminatedQuote { quote: char, offset: usize },
    #[error("unterminated block comment starting at byte {offset}")]
    UnterminatedComment { offset: usize },
    #[error("no statement found")]
    Empty,
}

/// Errors returned by the engine. Each variant belongs to exactly one of the
/// categories the HTTP layer renders (not found, unauthorized, bad request,
/// internal).
#[derive(Debug, Error)]
pub enum GateError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Denied(String),
    #[error("Parameter {0} not provided.")]
    MissingParameter(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("script {script} failed to compile: {source}")]
    Compile {
        script: String,
        #[source]
        source: CompileError,
    },
    #[error("{0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Config(String),
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Coarse classification used at the response boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    BadRequest,
    Internal,
}

impl GateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GateError::NotFound(_) => ErrorKind::NotFound,
            GateError::Denied(_) => ErrorKind::Unauthorized,
            GateError::MissingParameter(_) | GateError::BadRequest(_) => ErrorKind::BadRequest,
            GateError::Compile { .. }
            | GateError::Database(_)
            | GateError::Config(_)
            | GateError::Io { .. } => ErrorKind::Internal,
        }
    }

    pub(crate) fn denied(message: impl Into<String>) -> Self {
        GateError::Denied(message.into())
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        GateError::BadRequest(message.into())
    }
}

pub type GateResult<T> = std::result::Result<T, GateError>;
