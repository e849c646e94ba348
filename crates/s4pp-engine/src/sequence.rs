//! Per-sequence state: dictionary, running timestamp, sample decoding and
//! the streaming HMAC over the sequence's wire bytes.

use std::collections::HashMap;

use s4pp_proto::DataLine;

use crate::crypto::{HashAlg, MacState};
use crate::error::SequenceError;

// ---------------------------------------------------------------------------
// Data formats
// ---------------------------------------------------------------------------

/// The two officially defined sample line formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    /// Format 0: `idx,delta_t,value` -- a single value, no span.
    Plain,
    /// Format 1: `idx,delta_t,span,value1[,value2...]`.
    Spanned,
}

impl DataFormat {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(DataFormat::Plain),
            1 => Some(DataFormat::Spanned),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            DataFormat::Plain => 0,
            DataFormat::Spanned => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Dictionary
// ---------------------------------------------------------------------------

/// Sensor metadata for one dictionary index. Scope is a single sequence;
/// redefining an index replaces the prior entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictEntry {
    /// Unit label; may be empty.
    pub unit: String,
    /// Non-zero fixed-point divisor for the sample values.
    pub unit_divisor: i64,
    /// Sensor name; never empty.
    pub name: String,
}

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

/// A decoded sample as handed to the sink.
///
/// The effective time is `time_num / time_div`, carried as a scaled integer
/// pair so the client's fixed-point choice survives; the sink decides
/// whether to divide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub seqid: u64,
    pub idx: u32,
    pub name: String,
    pub unit: String,
    pub unit_divisor: i64,
    pub time_num: i64,
    pub time_div: i64,
    /// Zero under format 0.
    pub span: i64,
    /// Raw ASCII values (`NaN`, `+Inf`, `-Inf` are legal).
    pub values: Vec<String>,
}

// ---------------------------------------------------------------------------
// Streaming HMAC tap
// ---------------------------------------------------------------------------

/// Accumulates the HMAC over a sequence's wire bytes.
///
/// Seeded with the raw challenge token before the first byte; fed each body
/// line verbatim plus its LF, from the `SEQ` line up to but excluding the
/// `SIG` line. Callers must classify a line as not-`SIG` before feeding it.
pub struct SeqMac {
    mac: MacState,
}

impl SeqMac {
    pub fn seeded(alg: HashAlg, key: &[u8], token_raw: &[u8]) -> Self {
        let mut mac = MacState::new(alg, key);
        mac.update(token_raw);
        SeqMac { mac }
    }

    pub fn feed_line(&mut self, line: &[u8]) {
        self.mac.update(line);
        self.mac.update(b"\n");
    }

    pub fn finish(self) -> Vec<u8> {
        self.mac.finalize()
    }
}

// ---------------------------------------------------------------------------
// Sequence
// ---------------------------------------------------------------------------

/// An in-flight transactional batch on the receiving side.
pub struct Sequence {
    pub seqid: u64,
    time_divisor: i64,
    data_format: DataFormat,
    running: i64,
    dict: HashMap<u32, DictEntry>,
    mac: Option<SeqMac>,
    sample_count: u32,
    max_samples: u32,
    reject_negative_span: bool,
}

impl Sequence {
    pub fn new(
        seqid: u64,
        basetime: i64,
        time_divisor: i64,
        data_format: DataFormat,
        mac: SeqMac,
        max_samples: u32,
        reject_negative_span: bool,
    ) -> Self {
        Sequence {
            seqid,
            time_divisor,
            data_format,
            running: basetime,
            dict: HashMap::new(),
            mac: Some(mac),
            sample_count: 0,
            max_samples,
            reject_negative_span,
        }
    }

    /// Feeds one body line (verbatim, without its LF) to the sequence HMAC.
    pub fn feed_line(&mut self, line: &[u8]) {
        if let Some(mac) = &mut self.mac {
            mac.feed_line(line);
        }
    }

    pub fn define(&mut self, idx: u32, entry: DictEntry) -> Result<(), SequenceError> {
        if entry.unit_divisor == 0 {
            return Err(SequenceError::ZeroUnitDivisor);
        }
        self.dict.insert(idx, entry);
        Ok(())
    }

    /// Decodes a data line into a [`Sample`], advancing the running
    /// timestamp first so consecutive deltas accumulate.
    pub fn ingest(&mut self, data: &DataLine) -> Result<Sample, SequenceError> {
        if self.sample_count >= self.max_samples {
            return Err(SequenceError::TooManySamples(self.max_samples));
        }
        let entry = self
            .dict
            .get(&data.idx)
            .ok_or(SequenceError::UnknownDictIndex(data.idx))?;

        let (span, values) = match self.data_format {
            DataFormat::Plain => {
                if data.fields.len() != 1 {
                    return Err(SequenceError::BadFieldCount);
                }
                (0, data.fields.clone())
            }
            DataFormat::Spanned => {
                if data.fields.len() < 2 {
                    return Err(SequenceError::BadFieldCount);
                }
                let span: i64 = data.fields[0]
                    .parse()
                    .map_err(|_| SequenceError::BadFieldCount)?;
                if span < 0 && self.reject_negative_span {
                    return Err(SequenceError::NegativeSpan);
                }
                (span, data.fields[1..].to_vec())
            }
        };

        self.running += data.delta_t;
        self.sample_count += 1;
        Ok(Sample {
            seqid: self.seqid,
            idx: data.idx,
            name: entry.name.clone(),
            unit: entry.unit.clone(),
            unit_divisor: entry.unit_divisor,
            time_num: self.running,
            time_div: self.time_divisor,
            span,
            values,
        })
    }

    /// Finalises the sequence HMAC. The `SIG` line must not have been fed.
    pub fn finish_mac(&mut self) -> Vec<u8> {
        match self.mac.take() {
            Some(mac) => mac.finish(),
            None => Vec::new(),
        }
    }
}
