//! Error types shared by both role engines.

use s4pp_proto::ParseError;
use thiserror::Error;

/// Framing violation detected while slicing the byte stream into lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramerError {
    #[error("carriage return in line")]
    CarriageReturn,
    #[error("line exceeds maximum length")]
    LineTooLong,
}

/// Fatal session failure. Once a session method returns one of these the
/// session is closed; any bytes already queued for output (e.g. a trailing
/// `REJ`) should still be written to the transport before it is torn down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("framing error: {0}")]
    Framing(#[from] FramerError),
    #[error("malformed line: {0}")]
    Malformed(#[from] ParseError),
    #[error("no common hash algorithm with peer")]
    NoCommonHash,
    #[error("authentication failed")]
    AuthFailed,
    #[error("challenge token is not valid hex of 1-127 bytes")]
    BadToken,
    #[error("command not valid in the current session state")]
    UnexpectedCommand,
    #[error("peer rejected the session: {0}")]
    PeerReject(String),
    #[error("session already closed")]
    Closed,
}

/// Reasons a sequence (but not the session) is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("sequence id {0} is not greater than the last committed id")]
    NonMonotonicSeqId(u64),
    #[error("time divisor must be non-zero")]
    ZeroTimeDivisor,
    #[error("unit divisor must be non-zero")]
    ZeroUnitDivisor,
    #[error("unknown data format {0}")]
    UnknownDataFormat(u32),
    #[error("sample references undefined dictionary index {0}")]
    UnknownDictIndex(u32),
    #[error("wrong field count for the sequence data format")]
    BadFieldCount,
    #[error("negative span rejected")]
    NegativeSpan,
    #[error("sample count exceeds the per-sequence limit of {0}")]
    TooManySamples(u32),
    #[error("sink error: {0}")]
    Sink(String),
}
