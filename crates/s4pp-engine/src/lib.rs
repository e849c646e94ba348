//! s4pp-engine: the S4PP protocol engine for both peer roles.
//!
//! Sans-I/O: sessions consume transport bytes via `receive` and queue
//! outbound bytes for the caller to drain with `take_output`. The transport,
//! persistence, credential lookup, randomness and wall clock are injected
//! through the traits below, so the engine runs unchanged over TCP, UDP or a
//! test harness.
//!
//! # Modules
//! - [`framer`] -- LF line slicing, CR rejection
//! - [`hide`] -- the optional client->server block-cipher layer
//! - [`crypto`] -- negotiated hash/HMAC/cipher capability tables
//! - [`sequence`] -- dictionary, delta-time decoding, streaming sequence HMAC
//! - [`server`] -- the collector-side role engine
//! - [`client`] -- the device-side role engine

pub mod client;
pub mod crypto;
pub mod error;
pub mod framer;
pub mod hide;
pub mod sequence;
pub mod server;

use thiserror::Error;

pub use client::{ClientConfig, ClientError, ClientEvent, ClientSession};
pub use error::{FramerError, SequenceError, SessionError};
pub use sequence::{DataFormat, DictEntry, Sample};
pub use server::{ServerConfig, ServerSession};

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Read-only shared-key lookup. Key bytes are handed to the session for the
/// duration of HMAC/cipher work and must never be logged.
pub trait KeyStore {
    fn lookup(&self, keyid: &str) -> Option<Vec<u8>>;
}

/// Failure reported by a [`SampleSink`] operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Destination for decoded samples. `commit` makes a sequence's samples
/// durable atomically; `abort` discards everything since `begin`.
pub trait SampleSink {
    fn begin(&mut self, seqid: u64) -> Result<(), SinkError>;
    fn emit(&mut self, sample: &Sample) -> Result<(), SinkError>;
    fn commit(&mut self, seqid: u64) -> Result<(), SinkError>;
    fn abort(&mut self, seqid: u64);
}

/// Random token source. Returns `raw_len` random bytes hex-encoded
/// (lowercase, `2 * raw_len` characters). Servers use it for the challenge
/// token, clients for the HIDE salt line.
pub trait Entropy {
    fn token(&mut self, raw_len: usize) -> String;
}

/// Wall clock for the time notification. Returns whole seconds and the
/// millisecond remainder.
pub trait Clock {
    fn now_utc(&self) -> (u64, u32);
}
