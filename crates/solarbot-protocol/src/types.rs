//! Common error types used throughout the protocol

use thiserror::Error;

/// Frame codec errors
///
/// All of these are non-fatal at runtime: the caller logs the error and
/// drops the offending frame.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("bad frame header: {0:#04X}")]
    BadHeader(u8),

    #[error("bad frame tail: {0:#04X}")]
    BadTail(u8),

    #[error("length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("checksum mismatch: expected {expected:#04X}, got {actual:#04X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

/// Errors parsing the JSON envelope carried on the broker
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope missing required field: {0}")]
    MissingField(&'static str),

    #[error("topic {topic:?} does not contain devEui {dev_eui:?}")]
    TopicMismatch { topic: String, dev_eui: String },

    #[error("bad base64 data field: {0}")]
    Base64(#[from] crate::encoding::EncodingError),
}
