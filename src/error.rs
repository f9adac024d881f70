use thiserror::Error;

/// Errors that can occur while running the aggregation pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A custom error with a free-form message.
    #[error("Custom error: {0}")]
    Custom(String),

    /// An I/O error from the standard library.
    #[error("Std Io error: {0}")]
    StdIo(#[from] std::io::Error),

    /// Invalid configuration detected at startup.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A gRPC transport-level failure.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// A gRPC call completed with a non-OK status.
    #[error("Rpc status: {0}")]
    Rpc(#[from] tonic::Status),

    /// A protobuf payload failed to decode.
    #[error("Wire decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A sketch-level failure (incompatible merge, bad parameter).
    #[error("Sketch error: {0}")]
    Sketch(#[from] SketchError),
}

impl From<String> for PipelineError {
    fn from(value: String) -> Self {
        Self::Custom(value)
    }
}

impl From<&str> for PipelineError {
    fn from(value: &str) -> Self {
        Self::Custom(value.to_string())
    }
}

/// Errors raised by sketch constructors and merge operations.
///
/// `Incompatible` is the fatal bug class of the pipeline: two sketches of
/// the same family must always be merge-compatible, so observing it means
/// a corrupted wire payload or a broken invariant upstream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SketchError {
    /// Combining two sketches that are not shape-compatible.
    #[error("incompatible sketches: {0}")]
    Incompatible(&'static str),

    /// A constructor or record call received an invalid argument.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
}

/// Errors produced while parsing ingest frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The frame was empty after trimming.
    #[error("empty frame")]
    EmptyFrame,

    /// The metric name portion was empty.
    #[error("missing metric name")]
    MissingName,

    /// No value field present.
    #[error("missing value")]
    MissingValue,

    /// No type field present.
    #[error("missing metric type")]
    MissingType,

    /// The type field did not map to a known metric family.
    #[error("unknown metric type: {0}")]
    UnknownType(String),

    /// The value field was not numeric for a numeric family.
    #[error("invalid numeric value: {0}")]
    InvalidValue(String),

    /// The sample rate was not a float in (0, 1].
    #[error("invalid sample rate: {0}")]
    InvalidRate(String),

    /// An unrecognized trailing field followed the type.
    #[error("unexpected trailing field: {0}")]
    TrailingField(String),

    /// A binary frame could not be decoded into samples.
    #[error("undecodable frame: {0}")]
    Frame(String),
}

impl ParseError {
    /// Whether this error is the unknown-metric-type disposition, which is
    /// counted separately from generic malformed frames.
    #[must_use]
    pub const fn is_unknown_type(&self) -> bool {
        matches!(self, Self::UnknownType(_))
    }
}

/// Invalid configuration; the process refuses to start on any of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors surfaced by sink implementations.
#[derive(Error, Debug)]
pub enum SinkError {
    /// An I/O failure while emitting.
    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),

    /// A sink-specific failure with a free-form message.
    #[error("{0}")]
    Other(String),
}

impl From<String> for SinkError {
    fn from(value: String) -> Self {
        Self::Other(value)
    }
}
