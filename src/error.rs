//! Error types for stagepipe.
//!
//! Every failure inside a pipeline is fatal to that pipeline instance: the stage
//! that hits it aborts its downstream and the error surfaces to whoever drives the
//! source. All operations return [`Result<T>`], an alias for
//! `Result<T, PipelineError>`.

use std::time::Duration;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error kinds raised by stages and by the pipeline driver.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A line, JSON document or header field could not be parsed.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// A container header failed checksum validation.
    #[error("header checksum mismatch: stored {expected:?}, computed {computed:o}")]
    ChecksumMismatch {
        /// The checksum field as stored in the header (octal text, possibly garbage).
        expected: String,
        /// The checksum computed over the header bytes.
        computed: u64,
    },

    /// The input ended in the middle of a record, header or entry body.
    #[error("truncated input: {0}")]
    TruncatedInput(String),

    /// The cipher could not be configured, or its finalization step failed.
    #[error("cipher failure: {0}")]
    CipherFailure(String),

    /// A record arrived before the record it depends on.
    #[error("out of order data: {0}")]
    OutOfOrderData(String),

    /// The sink stayed paused for longer than the configured timeout.
    #[error("downstream did not resume within {0:?}")]
    DownstreamBackpressureTimeout(Duration),

    /// None of the accepted content encodings is supported.
    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    /// An item was pushed after the stage finished or aborted.
    #[error("push after stage was closed")]
    Closed,

    /// The pipeline was torn down by an upstream failure.
    #[error("pipeline aborted: {0}")]
    Aborted(String),

    /// I/O error from a source or sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Builds the error a downstream stage records when it is aborted by `cause`.
    pub fn aborted_by(cause: &PipelineError) -> Self {
        PipelineError::Aborted(cause.to_string())
    }
}
