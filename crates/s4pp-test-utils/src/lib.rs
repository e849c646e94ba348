//! In-memory collaborator implementations for driving protocol sessions in
//! tests: a static key store, a recording sample sink with controllable
//! failures, a scripted entropy source and a fixed clock.

use std::collections::HashMap;

use s4pp_engine::{Clock, Entropy, KeyStore, Sample, SampleSink, SinkError};

// ---------------------------------------------------------------------------
// Key store
// ---------------------------------------------------------------------------

/// A key store backed by a map.
#[derive(Debug, Default, Clone)]
pub struct MemoryKeyStore {
    keys: HashMap<String, Vec<u8>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, keyid: &str, key: &[u8]) -> Self {
        self.keys.insert(keyid.to_owned(), key.to_vec());
        self
    }
}

impl KeyStore for MemoryKeyStore {
    fn lookup(&self, keyid: &str) -> Option<Vec<u8>> {
        self.keys.get(keyid).cloned()
    }
}

// ---------------------------------------------------------------------------
// Sample sink
// ---------------------------------------------------------------------------

/// Everything a [`RecordingSink`] observed, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Begin(u64),
    Emit(Sample),
    Commit(u64),
    Abort(u64),
}

/// A sink that records every call and can be told to fail commits.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub calls: Vec<SinkCall>,
    pub fail_commit: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples emitted for `seqid` that were followed by its commit.
    pub fn committed_samples(&self, seqid: u64) -> Vec<Sample> {
        if !self.calls.contains(&SinkCall::Commit(seqid)) {
            return Vec::new();
        }
        self.calls
            .iter()
            .filter_map(|call| match call {
                SinkCall::Emit(sample) if sample.seqid == seqid => Some(sample.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn committed_seqids(&self) -> Vec<u64> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                SinkCall::Commit(seqid) => Some(*seqid),
                _ => None,
            })
            .collect()
    }

    pub fn aborted_seqids(&self) -> Vec<u64> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                SinkCall::Abort(seqid) => Some(*seqid),
                _ => None,
            })
            .collect()
    }
}

impl SampleSink for RecordingSink {
    fn begin(&mut self, seqid: u64) -> Result<(), SinkError> {
        self.calls.push(SinkCall::Begin(seqid));
        Ok(())
    }

    fn emit(&mut self, sample: &Sample) -> Result<(), SinkError> {
        self.calls.push(SinkCall::Emit(sample.clone()));
        Ok(())
    }

    fn commit(&mut self, seqid: u64) -> Result<(), SinkError> {
        self.calls.push(SinkCall::Commit(seqid));
        if self.fail_commit {
            return Err(SinkError("simulated commit failure".to_owned()));
        }
        Ok(())
    }

    fn abort(&mut self, seqid: u64) {
        self.calls.push(SinkCall::Abort(seqid));
    }
}

// ---------------------------------------------------------------------------
// Entropy and clock
// ---------------------------------------------------------------------------

/// Replays scripted hex tokens; cycles when exhausted so HIDE salt requests
/// after the challenge token still get an answer.
#[derive(Debug, Clone)]
pub struct ScriptedEntropy {
    tokens: Vec<String>,
    next: usize,
}

impl ScriptedEntropy {
    pub fn new(tokens: &[&str]) -> Self {
        ScriptedEntropy {
            tokens: tokens.iter().map(|t| (*t).to_owned()).collect(),
            next: 0,
        }
    }
}

impl Entropy for ScriptedEntropy {
    fn token(&mut self, raw_len: usize) -> String {
        let token = self.tokens[self.next % self.tokens.len()].clone();
        self.next += 1;
        assert_eq!(
            token.len(),
            raw_len * 2,
            "scripted token length does not match the requested length"
        );
        token
    }
}

/// A clock frozen at a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    pub utc_sec: u64,
    pub utc_ms: u32,
}

impl Clock for FixedClock {
    fn now_utc(&self) -> (u64, u32) {
        (self.utc_sec, self.utc_ms)
    }
}
