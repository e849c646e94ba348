//! The device-side (client) role engine.
//!
//! After the server's greeting and token have been consumed the client is
//! fully pipelined: sequences are composed and signed locally without
//! waiting for any server confirmation. Server responses surface as
//! [`ClientEvent`]s; unknown notification codes are dropped without trace.

use s4pp_proto::{ClientHello, Command, DataLine, Notification, ServerHello, Version, is_hello};
use thiserror::Error;

use crate::crypto::{HashAlg, HideAlg, derive_session_key, hmac_once};
use crate::error::SessionError;
use crate::framer::LineFramer;
use crate::hide::HideEncrypt;
use crate::sequence::{DataFormat, SeqMac};
use crate::Entropy;

// ---------------------------------------------------------------------------
// Configuration, events, errors
// ---------------------------------------------------------------------------

/// Client credentials and negotiation preferences.
#[derive(Clone)]
pub struct ClientConfig {
    pub keyid: String,
    /// Shared key material; any length (HMAC takes it as-is, ciphers are
    /// keyed from a truncated/padded copy).
    pub key: Vec<u8>,
    /// Hash algorithms this client can compute, in preference order.
    pub hash_algos: Vec<HashAlg>,
    /// Ciphers this client can offer for HIDE.
    pub hide_algos: Vec<HideAlg>,
    /// Emit the optional client hello on construction.
    pub send_hello: bool,
    /// Optional cap on inbound line length.
    pub max_line_len: Option<usize>,
}

impl std::fmt::Debug for ClientConfig {
    // Key material stays out of logs and error reports.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("keyid", &self.keyid)
            .field("hash_algos", &self.hash_algos)
            .field("hide_algos", &self.hide_algos)
            .field("send_hello", &self.send_hello)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    pub fn new(keyid: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        ClientConfig {
            keyid: keyid.into(),
            key: key.into(),
            hash_algos: vec![HashAlg::Sha256],
            hide_algos: vec![HideAlg::Aes128Cbc],
            send_hello: false,
            max_line_len: Some(8192),
        }
    }
}

/// A server reaction delivered out of [`ClientSession::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// `OK:<seqid>` -- the sequence is durable at the collector.
    Committed(u64),
    /// `NOK:<seqid>` -- valid signature, but the collector failed to persist.
    CommitFailed(u64),
    /// `REJ:<reason>` -- the session is closed.
    Rejected(String),
    /// A recognised notification.
    Notification(Notification),
}

/// Local misuse of the client API; nothing has been emitted when these are
/// returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("authentication handshake not complete")]
    NotReady,
    #[error("a sequence is already open")]
    SequenceOpen,
    #[error("no sequence is open")]
    NoSequence,
    #[error("unknown data format {0}")]
    UnknownDataFormat(u32),
    #[error("divisor must be non-zero")]
    ZeroDivisor,
    #[error("name must not be empty")]
    EmptyName,
    #[error("field must not contain a comma")]
    CommaInField,
    #[error("value must not be empty")]
    EmptyValue,
    #[error("dictionary index {0} not defined in this sequence")]
    UnknownDictIndex(u32),
    #[error("wrong value count for the sequence data format")]
    WrongValueCount,
    #[error("server limit of {0} samples per sequence reached")]
    TooManySamples(u32),
    #[error("server does not offer cipher {0}")]
    HideUnavailable(String),
    #[error("hiding already activated")]
    HideActive,
    #[error("session closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    AwaitHello,
    AwaitToken,
    /// AUTH emitted; sequences may be pipelined.
    Ready,
    Closed,
}

/// Client-side record of the open sequence.
struct OpenSequence {
    seqid: u64,
    data_format: DataFormat,
    mac: SeqMac,
    defined: Vec<u32>,
    sample_count: u32,
}

pub struct ClientSession {
    cfg: ClientConfig,
    state: ClientState,
    framer: LineFramer,
    out: Vec<u8>,
    events: Vec<ClientEvent>,
    hash_alg: Option<HashAlg>,
    server_max_samples: u32,
    server_hide_algos: Vec<String>,
    token_raw: Vec<u8>,
    next_seqid: u64,
    seq: Option<OpenSequence>,
    hide_tx: Option<HideEncrypt>,
    hide_used: bool,
}

impl ClientSession {
    pub fn new(cfg: ClientConfig) -> Self {
        let hello = cfg.send_hello.then(|| ClientHello {
            version: Version::V1_2,
            hash_algos: cfg.hash_algos.iter().map(|a| a.name().to_owned()).collect(),
            hide_algos: cfg.hide_algos.iter().map(|a| a.name().to_owned()).collect(),
        });
        let max_line_len = cfg.max_line_len;
        let mut session = ClientSession {
            cfg,
            state: ClientState::AwaitHello,
            framer: LineFramer::new(max_line_len),
            out: Vec::new(),
            events: Vec::new(),
            hash_alg: None,
            server_max_samples: u32::MAX,
            server_hide_algos: Vec::new(),
            token_raw: Vec::new(),
            next_seqid: 0,
            seq: None,
            hide_tx: None,
            hide_used: false,
        };
        if let Some(hello) = hello {
            session.push_line(hello.to_string().as_bytes());
        }
        session
    }

    /// Feeds server bytes. On `Err` the session is closed.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        if self.state == ClientState::Closed {
            return Err(SessionError::Closed);
        }
        self.framer.push(bytes);
        loop {
            if self.state == ClientState::Closed {
                return Ok(());
            }
            let line = match self.framer.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.close();
                    return Err(e.into());
                }
            };
            self.handle_line(&line)?;
        }
    }

    /// Drains queued outbound bytes. Under HIDE a short cipher tail is held
    /// back while a sequence is open so that padding never lands inside a
    /// signed byte range.
    pub fn take_output(&mut self) -> Vec<u8> {
        if self.seq.is_none() {
            if let Some(hide) = self.hide_tx.as_mut() {
                hide.flush(&mut self.out);
            }
        }
        std::mem::take(&mut self.out)
    }

    /// Server reactions observed since the last call.
    pub fn take_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn is_closed(&self) -> bool {
        self.state == ClientState::Closed
    }

    /// Whether AUTH has been emitted and sequences may be started.
    pub fn is_ready(&self) -> bool {
        self.state == ClientState::Ready
    }

    /// The per-sequence sample limit announced by the server.
    pub fn server_max_samples(&self) -> u32 {
        self.server_max_samples
    }

    // -- sequence construction ---------------------------------------------

    /// Opens a sequence and emits its `SEQ` line. Sequence ids are allocated
    /// locally, starting at 0.
    pub fn begin_sequence(
        &mut self,
        basetime: i64,
        time_divisor: i64,
        data_format: u32,
    ) -> Result<u64, ClientError> {
        self.ensure_ready()?;
        if self.seq.is_some() {
            return Err(ClientError::SequenceOpen);
        }
        if time_divisor == 0 {
            return Err(ClientError::ZeroDivisor);
        }
        let format = DataFormat::from_code(data_format)
            .ok_or(ClientError::UnknownDataFormat(data_format))?;
        let seqid = self.next_seqid;
        self.next_seqid += 1;

        let line = Command::Seq {
            seqid,
            basetime,
            time_divisor,
            data_format,
        }
        .to_string();
        // Ready implies a negotiated hash algorithm.
        let alg = self.hash_alg.ok_or(ClientError::NotReady)?;
        let mut mac = SeqMac::seeded(alg, &self.cfg.key, &self.token_raw);
        mac.feed_line(line.as_bytes());
        self.push_line(line.as_bytes());
        self.seq = Some(OpenSequence {
            seqid,
            data_format: format,
            mac,
            defined: Vec::new(),
            sample_count: 0,
        });
        Ok(seqid)
    }

    /// Adds or replaces a dictionary entry in the open sequence.
    pub fn put_dict_entry(
        &mut self,
        idx: u32,
        unit: &str,
        unit_divisor: i64,
        name: &str,
    ) -> Result<(), ClientError> {
        if unit_divisor == 0 {
            return Err(ClientError::ZeroDivisor);
        }
        if name.is_empty() {
            return Err(ClientError::EmptyName);
        }
        if name.contains(',') || unit.contains(',') {
            return Err(ClientError::CommaInField);
        }
        let seq = self.seq.as_mut().ok_or(ClientError::NoSequence)?;
        let line = Command::Dict {
            idx,
            unit: unit.to_owned(),
            unit_divisor,
            name: name.to_owned(),
        }
        .to_string();
        seq.mac.feed_line(line.as_bytes());
        if !seq.defined.contains(&idx) {
            seq.defined.push(idx);
        }
        self.push_line(line.as_bytes());
        Ok(())
    }

    /// Emits a format-0 sample line.
    pub fn push_sample(&mut self, idx: u32, delta_t: i64, value: &str) -> Result<(), ClientError> {
        self.push_data(idx, delta_t, DataFormat::Plain, &[value])
    }

    /// Emits a format-1 sample line with a span and one or more values.
    pub fn push_sample_spanned(
        &mut self,
        idx: u32,
        delta_t: i64,
        span: i64,
        values: &[&str],
    ) -> Result<(), ClientError> {
        if values.is_empty() {
            return Err(ClientError::WrongValueCount);
        }
        let span = span.to_string();
        let mut fields = Vec::with_capacity(values.len() + 1);
        fields.push(span.as_str());
        fields.extend_from_slice(values);
        self.push_data(idx, delta_t, DataFormat::Spanned, &fields)
    }

    fn push_data(
        &mut self,
        idx: u32,
        delta_t: i64,
        format: DataFormat,
        fields: &[&str],
    ) -> Result<(), ClientError> {
        for field in fields {
            if field.is_empty() {
                return Err(ClientError::EmptyValue);
            }
            if field.contains(',') || field.contains('\n') {
                return Err(ClientError::CommaInField);
            }
        }
        let limit = self.server_max_samples;
        let seq = self.seq.as_mut().ok_or(ClientError::NoSequence)?;
        if seq.data_format != format {
            return Err(ClientError::WrongValueCount);
        }
        if !seq.defined.contains(&idx) {
            return Err(ClientError::UnknownDictIndex(idx));
        }
        if seq.sample_count >= limit {
            return Err(ClientError::TooManySamples(limit));
        }
        let line = DataLine {
            idx,
            delta_t,
            fields: fields.iter().map(|s| (*s).to_owned()).collect(),
        }
        .to_string();
        seq.mac.feed_line(line.as_bytes());
        seq.sample_count += 1;
        self.push_line(line.as_bytes());
        Ok(())
    }

    /// Signs and closes the open sequence, emitting its `SIG` line.
    pub fn finish_sequence(&mut self) -> Result<u64, ClientError> {
        let seq = self.seq.take().ok_or(ClientError::NoSequence)?;
        let digest = seq.mac.finish();
        let line = Command::Sig {
            mac_hex: hex::encode(digest),
        }
        .to_string();
        self.push_line(line.as_bytes());
        Ok(seq.seqid)
    }

    // -- hiding -------------------------------------------------------------

    /// Activates the confidentiality layer: emits `HIDE:` in the clear,
    /// derives the session key, then emits one encrypted salt line.
    pub fn activate_hide(
        &mut self,
        alg: HideAlg,
        entropy: &mut dyn Entropy,
    ) -> Result<(), ClientError> {
        self.ensure_ready()?;
        if self.seq.is_some() {
            return Err(ClientError::SequenceOpen);
        }
        if self.hide_used {
            return Err(ClientError::HideActive);
        }
        if !self.server_hide_algos.iter().any(|name| name == alg.name()) {
            return Err(ClientError::HideUnavailable(alg.name().to_owned()));
        }
        let line = Command::Hide {
            algo: alg.name().to_owned(),
            block_size: None,
        }
        .to_string();
        self.push_line(line.as_bytes());

        let session_key = derive_session_key(alg, &self.cfg.key, &self.token_raw);
        self.hide_tx = Some(HideEncrypt::new(alg, &session_key));
        self.hide_used = true;

        // The first hidden line is salt the server discards unparsed.
        let salt = entropy.token(alg.block_size());
        self.push_line(salt.as_bytes());
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    fn ensure_ready(&self) -> Result<(), ClientError> {
        match self.state {
            ClientState::Ready => Ok(()),
            ClientState::Closed => Err(ClientError::Closed),
            _ => Err(ClientError::NotReady),
        }
    }

    fn handle_line(&mut self, line: &[u8]) -> Result<(), SessionError> {
        if line.is_empty() {
            return Ok(());
        }
        let Ok(text) = std::str::from_utf8(line) else {
            self.close();
            return Err(SessionError::Malformed(s4pp_proto::ParseError::InvalidUtf8));
        };

        if is_hello(text) {
            return self.handle_hello(text);
        }

        let cmd = match Command::parse(text) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.close();
                return Err(SessionError::Malformed(e));
            }
        };
        match cmd {
            Command::Tok { token_hex } => self.handle_token(token_hex),
            Command::Ok { seqid } => {
                self.events.push(ClientEvent::Committed(seqid));
                Ok(())
            }
            Command::Nok { seqid } => {
                self.events.push(ClientEvent::CommitFailed(seqid));
                Ok(())
            }
            Command::Rej { reason } => {
                // Any reject ends the session for this client.
                self.events.push(ClientEvent::Rejected(reason));
                self.close();
                Ok(())
            }
            Command::Ntfy(notification) => {
                match notification {
                    // Unknown codes vanish without any state change.
                    Notification::Other { .. } => {}
                    known => self.events.push(ClientEvent::Notification(known)),
                }
                Ok(())
            }
            _ => {
                self.close();
                Err(SessionError::UnexpectedCommand)
            }
        }
    }

    fn handle_hello(&mut self, text: &str) -> Result<(), SessionError> {
        if self.state != ClientState::AwaitHello {
            self.close();
            return Err(SessionError::UnexpectedCommand);
        }
        let hello = match ServerHello::parse(text) {
            Ok(hello) => hello,
            Err(e) => {
                self.close();
                return Err(SessionError::Malformed(e));
            }
        };
        let alg = self
            .cfg
            .hash_algos
            .iter()
            .copied()
            .find(|a| hello.hash_algos.iter().any(|name| name == a.name()));
        let Some(alg) = alg else {
            // No shared hash: terminate without further exchange.
            self.close();
            return Err(SessionError::NoCommonHash);
        };
        self.hash_alg = Some(alg);
        self.server_max_samples = hello.max_samples;
        self.server_hide_algos = hello.hide_algos;
        self.state = ClientState::AwaitToken;
        Ok(())
    }

    fn handle_token(&mut self, token_hex: String) -> Result<(), SessionError> {
        if self.state != ClientState::AwaitToken {
            self.close();
            return Err(SessionError::UnexpectedCommand);
        }
        let token_raw = match hex::decode(&token_hex) {
            Ok(raw) if !raw.is_empty() && raw.len() <= 127 => raw,
            _ => {
                self.close();
                return Err(SessionError::BadToken);
            }
        };
        // The AUTH proof covers the token exactly as transmitted.
        let alg = self.hash_alg.ok_or(SessionError::UnexpectedCommand)?;
        let proof = hmac_once(
            alg,
            &self.cfg.key,
            &[self.cfg.keyid.as_bytes(), token_hex.as_bytes()],
        );
        let line = Command::Auth {
            algo: alg.name().to_owned(),
            keyid: self.cfg.keyid.clone(),
            mac_hex: hex::encode(proof),
        }
        .to_string();
        self.token_raw = token_raw;
        self.push_line(line.as_bytes());
        self.state = ClientState::Ready;
        Ok(())
    }

    fn close(&mut self) {
        self.seq = None;
        self.hide_tx = None;
        self.state = ClientState::Closed;
    }

    fn push_line(&mut self, line: &[u8]) {
        match self.hide_tx.as_mut() {
            Some(hide) => {
                hide.feed(line, &mut self.out);
                hide.feed(b"\n", &mut self.out);
            }
            None => {
                self.out.extend_from_slice(line);
                self.out.push(b'\n');
            }
        }
    }
}
