//! Error types for the daemon.
//!
//! Each enum matches one propagation policy: admission errors end at the listener
//! and become the `reason` of a rejection, driver errors travel to the caller as a
//! failure result, delivery errors are logged and dropped, and daemon errors stop
//! startup.
use std::path::PathBuf;
use std::time::Duration;

/// Why an inbound request was refused. The `Display` text is sent back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("missing id")]
    MissingId,

    #[error("invalid id '{0}': expected a UUID")]
    InvalidId(String),

    #[error("duplicate id {0}: a task with this id is already in flight")]
    DuplicateId(uuid::Uuid),

    #[error("text must not be empty")]
    EmptyText,

    #[error("callback must not be empty")]
    MissingCallback,

    #[error("unknown priority '{0}': expected one of LOW, NORMAL, HIGH, CRITICAL")]
    InvalidPriority(String),

    #[error("max_tokens must be a positive integer, got {0}")]
    InvalidMaxTokens(i64),

    #[error("request exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("timed out reading request after {0:?}")]
    ReadTimeout(Duration),

    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("daemon is shutting down")]
    ShuttingDown,
}

/// Failures raised by a driver or by the worker thread that runs it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("failed to load model {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("generation failed: {0}")]
    Generate(String),

    #[error("ranking failed: {0}")]
    Rank(String),

    #[error("model instance {0} is no longer running")]
    WorkerGone(u32),
}

/// Failures while pushing a result to a caller's callback destination.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write result to {addr}: {source}")]
    Write {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("delivery to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("failed to encode result: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// Fatal conditions that keep the daemon from starting.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("no models loaded: at least one model must load successfully")]
    NoModelsLoaded,

    #[error("unknown driver '{name}' (available: {available})")]
    UnknownDriver { name: String, available: String },

    #[error("failed to bind socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start model worker {id}: {source}")]
    Worker {
        id: u32,
        #[source]
        source: std::io::Error,
    },
}
