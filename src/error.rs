//! Error types for netrecon.

use thiserror::Error;

use crate::proto::Protocol;

/// Errors that can occur while opening a live capture.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("Failed to create capture channel: {0}")]
    ChannelCreation(String),

    #[error("Insufficient permissions for packet capture (try running as root)")]
    InsufficientPermissions,
}

/// Errors reported by a packet source on a single read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The read may succeed if retried.
    #[error("transient read error: {0}")]
    Transient(String),

    /// The source is unusable; the channel closes.
    #[error("source failed: {0}")]
    Fatal(String),
}

/// Errors starting an input channel.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("failed to spawn reader for {source_name}: {reason}")]
    Spawn { source_name: String, reason: String },
}

/// Errors that can occur while decoding a protocol layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid length field: {field} = {value}")]
    InvalidLength { field: &'static str, value: usize },

    #[error("Missing {0} layer below")]
    MissingLayer(&'static str),

    #[error("Invalid packet: {0}")]
    Invalid(String),

    #[error("Event construction failed: {0}")]
    Event(#[from] EventError),
}

/// Conntrack table errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConntrackError {
    /// Resource exhaustion: the table refuses new flows.
    #[error("{protocol} conntrack table full ({limit} entries)")]
    TableFull { protocol: Protocol, limit: usize },
}

/// Event definition and construction errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Event definition '{0}' already registered")]
    DuplicateDefinition(String),

    #[error("Event '{event}' has no field '{field}'")]
    UnknownField { event: String, field: String },

    #[error("Field '{field}' of event '{event}' expects {expected}, got {actual}")]
    TypeMismatch {
        event: String,
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Event '{0}' is already closed")]
    Closed(String),
}

/// A failure returned by one subscriber callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("payload store: {0}")]
    Payload(#[from] PayloadError),

    #[error("event: {0}")]
    Event(#[from] EventError),

    #[error("{0}")]
    Failed(String),
}

/// One listener failure collected during dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFailure {
    pub listener: String,
    pub error: ListenerError,
}

/// Report of an emit where at least one subscriber failed.
///
/// Dispatch still reached every subscriber; `delivered` counts the
/// callbacks that returned successfully.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("event '{event}': {delivered} listeners succeeded, {} failed", .failures.len())]
pub struct EmitError {
    pub event: String,
    pub delivered: usize,
    pub failures: Vec<ListenerFailure>,
}

/// Analyzer setup errors.
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("Analyzer {analyzer} needs event '{event}' which is not registered")]
    MissingEvent {
        analyzer: &'static str,
        event: &'static str,
    },

    #[error(transparent)]
    Event(#[from] EventError),
}

/// Payload store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload store full: {requested} bytes requested, {available} available")]
    CapacityExceeded { requested: u64, available: u64 },

    #[error("payload {0} not found")]
    NotFound(u64),
}

/// Content decoding errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("Unknown content decoder: {0}")]
    UnknownDecoder(String),

    #[error("Invalid {decoder} input at offset {offset}")]
    InvalidInput { decoder: &'static str, offset: usize },
}

/// Parameter registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Parameter '{0}' not found")]
    NotFound(String),

    #[error("Parameter '{0}' already registered")]
    Duplicate(String),

    #[error("Parameter '{0}' is immutable")]
    Immutable(String),

    #[error("Parameter '{0}' cannot be changed while running")]
    Locked(String),

    #[error("Invalid value '{value}' for parameter '{name}': {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Engine construction and runtime errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Performance counters: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Protocol {0} registered twice")]
    DuplicateProtocol(Protocol),

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("Engine is already running")]
    AlreadyRunning,
}
