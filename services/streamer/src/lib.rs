//! streamer: uploads a file of sensor samples to a collector.
//!
//! # Sample file format
//!
//! Plain text, one record per line. `#` starts a comment. Dictionary
//! entries are declared with a `dict,` prefix, data rows are bare:
//!
//! ```text
//! # idx,unit,unit_divisor,name
//! dict,0,C,100,temperature
//! # idx,delta_t,value (format 0) or idx,delta_t,span,value... (format 1)
//! 0,0,2561
//! 0,60,2548
//! ```
//!
//! The whole file uploads as one signed sequence.

use std::time::Duration;

use s4pp_engine::crypto::HideAlg;
use s4pp_engine::{ClientConfig, ClientError, ClientEvent, ClientSession, Entropy, SessionError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Parameters for one upload run.
#[derive(Clone)]
pub struct StreamerConfig {
    /// Collector address, e.g. `192.168.0.40:4404`.
    pub collector: String,
    pub keyid: String,
    pub secret: Vec<u8>,
    /// Activate the confidentiality layer before uploading.
    pub hide: bool,
    /// Sequence base time (typically seconds since the epoch).
    pub basetime: i64,
    pub time_divisor: i64,
    pub data_format: u32,
    /// Give up if the collector stays silent this long.
    pub response_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Sample file
// ---------------------------------------------------------------------------

/// One dictionary declaration from the sample file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictRow {
    pub idx: u32,
    pub unit: String,
    pub unit_divisor: i64,
    pub name: String,
}

/// One data row from the sample file; fields past `delta_t` stay raw, their
/// interpretation depends on the configured data format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub idx: u32,
    pub delta_t: i64,
    pub fields: Vec<String>,
}

/// A parsed sample file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleFile {
    pub dict: Vec<DictRow>,
    pub rows: Vec<DataRow>,
}

impl SampleFile {
    /// Parses the sample file format described in the crate docs.
    pub fn parse(text: &str) -> Result<Self, FileError> {
        let mut file = SampleFile::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("dict,") {
                file.dict.push(Self::parse_dict(rest, lineno + 1)?);
            } else {
                file.rows.push(Self::parse_row(line, lineno + 1)?);
            }
        }
        if file.rows.is_empty() {
            return Err(FileError::Empty);
        }
        Ok(file)
    }

    fn parse_dict(rest: &str, lineno: usize) -> Result<DictRow, FileError> {
        let fields: Vec<&str> = rest.split(',').collect();
        if fields.len() != 4 {
            return Err(FileError::Syntax(lineno, "dict needs idx,unit,divisor,name"));
        }
        Ok(DictRow {
            idx: fields[0]
                .parse()
                .map_err(|_| FileError::Syntax(lineno, "bad dict idx"))?,
            unit: fields[1].to_owned(),
            unit_divisor: fields[2]
                .parse()
                .map_err(|_| FileError::Syntax(lineno, "bad unit divisor"))?,
            name: fields[3].to_owned(),
        })
    }

    fn parse_row(line: &str, lineno: usize) -> Result<DataRow, FileError> {
        let mut fields = line.split(',');
        let idx = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or(FileError::Syntax(lineno, "bad sample idx"))?;
        let delta_t = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or(FileError::Syntax(lineno, "bad delta_t"))?;
        let fields: Vec<String> = fields.map(str::to_owned).collect();
        if fields.is_empty() {
            return Err(FileError::Syntax(lineno, "sample needs a value"));
        }
        Ok(DataRow {
            idx,
            delta_t,
            fields,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileError {
    #[error("sample file has no data rows")]
    Empty,
    #[error("line {0}: {1}")]
    Syntax(usize, &'static str),
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

/// Hex tokens from the operating-system RNG, for the HIDE salt line.
#[derive(Debug, Default)]
pub struct OsEntropy;

impl Entropy for OsEntropy {
    fn token(&mut self, raw_len: usize) -> String {
        use rand::Rng;

        let bytes: Vec<u8> = rand::thread_rng()
            .sample_iter(&rand::distributions::Standard)
            .take(raw_len)
            .collect();
        hex::encode(bytes)
    }
}

/// Outcome of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub seqid: u64,
    /// False when the collector answered `NOK` (valid data, storage failed).
    pub committed: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("transport: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Session(#[from] SessionError),
    #[error("usage: {0}")]
    Client(#[from] ClientError),
    #[error("collector rejected the upload: {0}")]
    Rejected(String),
    #[error("collector closed the connection before responding")]
    Disconnected,
    #[error("no response within the timeout")]
    TimedOut,
}

/// Connects, authenticates and uploads the sample file as one sequence.
pub async fn upload(
    cfg: &StreamerConfig,
    samples: &SampleFile,
) -> Result<UploadOutcome, UploadError> {
    let mut socket = TcpStream::connect(&cfg.collector).await?;
    info!(collector = %cfg.collector, "connected");

    let mut client_cfg = ClientConfig::new(cfg.keyid.clone(), cfg.secret.clone());
    client_cfg.send_hello = true;
    let mut client = ClientSession::new(client_cfg);

    // Greeting and token arrive first; everything after that is pipelined.
    let mut buf = [0u8; 4096];
    while !client.is_ready() {
        socket.write_all(&client.take_output()).await?;
        let n = read_some(&mut socket, &mut buf, cfg.response_timeout).await?;
        client.receive(&buf[..n])?;
    }
    debug!("authenticated, composing sequence");

    if cfg.hide {
        client.activate_hide(HideAlg::Aes128Cbc, &mut OsEntropy)?;
    }

    let seqid = client.begin_sequence(cfg.basetime, cfg.time_divisor, cfg.data_format)?;
    for entry in &samples.dict {
        client.put_dict_entry(entry.idx, &entry.unit, entry.unit_divisor, &entry.name)?;
    }
    for row in &samples.rows {
        let fields: Vec<&str> = row.fields.iter().map(String::as_str).collect();
        match cfg.data_format {
            0 => client.push_sample(row.idx, row.delta_t, fields[0])?,
            _ => {
                let span: i64 = fields[0].parse().map_err(|_| {
                    UploadError::Client(ClientError::WrongValueCount)
                })?;
                client.push_sample_spanned(row.idx, row.delta_t, span, &fields[1..])?;
            }
        }
    }
    client.finish_sequence()?;
    info!(seqid, rows = samples.rows.len(), "sequence signed, uploading");

    loop {
        socket.write_all(&client.take_output()).await?;
        for event in client.take_events() {
            match event {
                ClientEvent::Committed(id) if id == seqid => {
                    return Ok(UploadOutcome {
                        seqid,
                        committed: true,
                    });
                }
                ClientEvent::CommitFailed(id) if id == seqid => {
                    return Ok(UploadOutcome {
                        seqid,
                        committed: false,
                    });
                }
                ClientEvent::Rejected(reason) => return Err(UploadError::Rejected(reason)),
                ClientEvent::Notification(n) => {
                    info!(code = n.code(), "collector notification: NTFY:{n}");
                }
                other => debug!(?other, "ignoring response for another sequence"),
            }
        }
        let n = read_some(&mut socket, &mut buf, cfg.response_timeout).await?;
        client.receive(&buf[..n])?;
    }
}

async fn read_some(
    socket: &mut TcpStream,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize, UploadError> {
    let n = tokio::time::timeout(timeout, socket.read(buf))
        .await
        .map_err(|_| UploadError::TimedOut)??;
    if n == 0 {
        warn!("collector closed the connection");
        return Err(UploadError::Disconnected);
    }
    Ok(n)
}
