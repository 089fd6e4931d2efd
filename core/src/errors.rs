use rust_decimal::Decimal;
use thiserror::Error;

use crate::message::MessageType;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Data source error")]
    Source(#[from] SourceError),

    #[error("Batch processing error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("State backend error: {0}")]
    State(#[from] StateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether this error must take down the current processing attempt and
    /// hand control to the restart supervisor.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Source(SourceError::Transient { .. }) => false,
            PipelineError::Checkpoint(e) => !e.is_recoverable(),
            _ => true,
        }
    }
}

/// A message failed the intake gate and never enters the window assigner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntakeError {
    #[error("message payload is empty")]
    EmptyPayload,

    #[error("missing or empty required header: {0}")]
    MissingHeader(&'static str),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to connect or communicate with the source")]
    Connection {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("A transient error occurred, the operation can be retried")]
    Transient {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Unrecoverable error from the source")]
    Unrecoverable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {source}: {error}")]
    LoadFailed {
        source: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// A single record could not be decoded into an order. The record is dropped
/// and counted, the rest of the batch is unaffected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed order payload: {reason}")]
    Malformed { reason: String },

    #[error("order payload is missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("order amount is not a valid decimal: {raw}")]
    InvalidAmount { raw: String },

    #[error("message type {0} does not carry an order payload")]
    UnsupportedMessageType(MessageType),
}

/// A decoded record violated a business rule. Same drop-and-count policy as
/// [`DecodeError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("order id is empty")]
    EmptyOrderId,

    #[error("company id is empty")]
    EmptyCompanyId,

    #[error("company id must be exactly {expected} characters, got {actual}")]
    CompanyIdLength { expected: usize, actual: usize },

    #[error("customer name is empty")]
    EmptyCustomerName,

    #[error("total amount is missing")]
    MissingAmount,

    #[error("total amount {0} is negative")]
    NegativeAmount(Decimal),

    #[error("order status is empty")]
    EmptyStatus,
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("batch write failed: {reason}")]
    Write { reason: String },

    #[error("sink storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Raised when a whole fired window cannot be processed. Persistence failures
/// are never retried per message, they abort the attempt.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("batch persistence failed for window {key} [{window_start}, {window_end}): {source}")]
    Persistence {
        key: String,
        window_start: i64,
        window_end: i64,
        #[source]
        source: SinkError,
    },
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint epoch {epoch} timed out after {timeout_ms}ms")]
    Timeout { epoch: u64, timeout_ms: u64 },

    #[error("checkpoint epoch {epoch} failed: {reason}")]
    Failed { epoch: u64, reason: String },

    #[error("checkpoint storage error: {0}")]
    Store(#[from] std::io::Error),

    #[error("checkpoint serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{failures} consecutive checkpoint failures exceeded the limit of {limit}")]
    TooManyFailures { failures: u32, limit: u32 },
}

impl CheckpointError {
    /// Timeouts and ordinary write failures are skippable until the
    /// consecutive-failure limit is reached.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CheckpointError::TooManyFailures { .. })
    }
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("state backend storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("state serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state backend mutex poisoned")]
    Poisoned,
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("pipeline failed permanently after {attempts} restart attempts: {last_error}")]
    RestartsExhausted { attempts: u32, last_error: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
