//! Error types for lap-oxide
//!
//! Every failure in the pipeline (fetch, decode, parse, worker fault,
//! cancellation, storage) ends up as a `PipelineError`, so a task handle
//! always settles with something the caller can classify.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Network failure or non-success HTTP status
    #[error("Fetch failed{}: {message}", status_suffix(.status))]
    Fetch {
        status: Option<u16>,
        message: String,
    },

    /// Corrupt or truncated compressed payload, or undecodable text
    #[error("Decode failed: {0}")]
    Decode(String),

    /// Payload decoded but did not yield usable telemetry
    #[error("Parse failed: {0}")]
    Parse(String),

    /// Worker thread died while running a task
    #[error("Worker fault: {0}")]
    WorkerFault(String),

    /// Task was cancelled before it produced an outcome
    #[error("Task cancelled")]
    Cancelled,

    /// Task was still queued when the queue was cleared
    #[error("Task queue cleared")]
    QueueCleared,

    /// The pool has been terminated
    #[error("Worker pool terminated")]
    PoolTerminated,

    /// A load for the same lap is already running
    #[error("Lap {0} is already loading")]
    AlreadyLoading(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O error
    #[error("Failed to access file: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Coarse classification that survives the worker message boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Transport,
    Decode,
    Parse,
    WorkerFault,
    Cancelled,
    QueueCleared,
    Terminated,
    Duplicate,
    Storage,
    Config,
}

/// Serializable form of a task failure, as carried by worker messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Fetch { .. } => ErrorKind::Transport,
            PipelineError::Decode(_) => ErrorKind::Decode,
            PipelineError::Parse(_) | PipelineError::Json(_) => ErrorKind::Parse,
            PipelineError::WorkerFault(_) => ErrorKind::WorkerFault,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::QueueCleared => ErrorKind::QueueCleared,
            PipelineError::PoolTerminated => ErrorKind::Terminated,
            PipelineError::AlreadyLoading(_) => ErrorKind::Duplicate,
            PipelineError::Storage(_) | PipelineError::Io(_) => ErrorKind::Storage,
            PipelineError::Config(_) => ErrorKind::Config,
        }
    }

    /// Transport failures are retryable unless the server gave a definitive 4xx
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Fetch { status, .. } => !matches!(status, Some(400..=499)),
            _ => false,
        }
    }

    /// Flatten into the message-safe form sent by workers
    pub fn to_failure(&self) -> TaskFailure {
        let status = match self {
            PipelineError::Fetch { status, .. } => *status,
            _ => None,
        };
        let message = match self {
            PipelineError::Fetch { message, .. } => message.clone(),
            PipelineError::Decode(m)
            | PipelineError::Parse(m)
            | PipelineError::WorkerFault(m)
            | PipelineError::Storage(m)
            | PipelineError::Config(m)
            | PipelineError::AlreadyLoading(m) => m.clone(),
            other => other.to_string(),
        };
        TaskFailure {
            kind: self.kind(),
            status,
            message,
        }
    }

    /// Rebuild a typed error from a worker failure message
    pub fn from_failure(failure: TaskFailure) -> Self {
        let TaskFailure {
            kind,
            status,
            message,
        } = failure;
        match kind {
            ErrorKind::Transport => PipelineError::Fetch { status, message },
            ErrorKind::Decode => PipelineError::Decode(message),
            ErrorKind::Parse => PipelineError::Parse(message),
            ErrorKind::WorkerFault => PipelineError::WorkerFault(message),
            ErrorKind::Cancelled => PipelineError::Cancelled,
            ErrorKind::QueueCleared => PipelineError::QueueCleared,
            ErrorKind::Terminated => PipelineError::PoolTerminated,
            ErrorKind::Duplicate => PipelineError::AlreadyLoading(message),
            ErrorKind::Storage => PipelineError::Storage(message),
            ErrorKind::Config => PipelineError::Config(message),
        }
    }

    /// Get a user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Fetch {
                status: Some(code), ..
            } => format!("Could not download lap data (HTTP {})", code),
            PipelineError::Fetch { message, .. } => {
                format!("Could not download lap data: {}", message)
            }
            PipelineError::Decode(msg) => format!("Lap data is corrupt: {}", msg),
            PipelineError::Parse(msg) => format!("Lap data could not be read: {}", msg),
            PipelineError::WorkerFault(msg) => format!("Processing crashed: {}", msg),
            PipelineError::Cancelled => "Loading was cancelled".to_string(),
            PipelineError::QueueCleared => "Loading was cancelled".to_string(),
            PipelineError::PoolTerminated => "Processing has shut down".to_string(),
            PipelineError::AlreadyLoading(key) => format!("Lap {} is already loading", key),
            PipelineError::Storage(msg) => format!("Cache error: {}", msg),
            PipelineError::Config(msg) => format!("Config error: {}", msg),
            PipelineError::Io(e) => format!("File error: {}", e),
            PipelineError::Json(e) => format!("JSON error: {}", e),
        }
    }

    /// Short title for the error, shown before `user_message`
    pub fn title(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Transport => "Network Error",
            ErrorKind::Decode => "Corrupt Data",
            ErrorKind::Parse => "Parse Error",
            ErrorKind::WorkerFault => "Worker Crashed",
            ErrorKind::Cancelled | ErrorKind::QueueCleared => "Cancelled",
            ErrorKind::Terminated => "Shut Down",
            ErrorKind::Duplicate => "Already Loading",
            ErrorKind::Storage => "Cache Error",
            ErrorKind::Config => "Configuration Error",
        }
    }
}
