//! The collector-side (server) role engine.
//!
//! Drives one session over an already-established transport: emits the
//! greeting and challenge on construction, then consumes bytes and reacts.
//! Sequence-level failures reject the sequence and keep the session alive;
//! framing, negotiation and authentication failures close it. Callers must
//! drain [`ServerSession::take_output`] even after a fatal error so the
//! trailing `REJ` reaches the peer.

use s4pp_proto::{ClientHello, Command, Notification, ParseError, ServerHello, Version, is_hello};

use crate::crypto::{HashAlg, HideAlg, derive_session_key, digest_eq, hmac_once};
use crate::error::SessionError;
use crate::framer::LineFramer;
use crate::hide::HideDecrypt;
use crate::sequence::{DataFormat, DictEntry, SeqMac, Sequence};
use crate::{Entropy, KeyStore, SampleSink};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-session server parameters, fixed at construction.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Supported hash algorithms in preference order. Must not be empty.
    pub hash_algos: Vec<HashAlg>,
    /// Ciphers offered for HIDE; empty disables hiding (`-` in the hello).
    pub hide_algos: Vec<HideAlg>,
    /// Advertised and enforced per-sequence sample limit.
    pub max_samples: u32,
    /// Raw length of the challenge token (1–127 bytes).
    pub token_bytes: usize,
    /// Reject format-1 samples with a negative span.
    pub reject_negative_span: bool,
    /// Optional line-length cap; overruns close the session.
    pub max_line_len: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            hash_algos: vec![HashAlg::Sha256],
            hide_algos: vec![HideAlg::Aes128Cbc],
            max_samples: 2000,
            token_bytes: 16,
            reject_negative_span: false,
            max_line_len: Some(8192),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    /// Greeting sent; the client may open with a hello or go straight to AUTH.
    AwaitHelloOrAuth,
    /// Client hello consumed; only AUTH is acceptable.
    AwaitAuth,
    /// Authenticated, between sequences.
    Authenticated,
    /// Inside a `SEQ`...`SIG` bracket.
    InSequence,
    Closed,
}

/// Payload class for a sequence-level reject.
#[derive(Debug, Clone, Copy)]
enum SeqReject {
    /// `REJ:<seqid>` -- the offending sequence id.
    BySeqId,
    /// `REJ:hide` -- HIDE misuse inside a sequence.
    Hide,
}

pub struct ServerSession<K: KeyStore, S: SampleSink> {
    cfg: ServerConfig,
    keys: K,
    sink: S,
    state: ServerState,
    framer: LineFramer,
    /// Transport bytes not yet routed to the framer; once HIDE is active
    /// these are ciphertext awaiting whole-block decryption.
    inbuf: Vec<u8>,
    out: Vec<u8>,
    token_hex: String,
    token_raw: Vec<u8>,
    hash_alg: Option<HashAlg>,
    keyid: Option<String>,
    key: Option<Vec<u8>>,
    last_committed: Option<u64>,
    seq: Option<Sequence>,
    hide_rx: Option<HideDecrypt>,
    hide_used: bool,
    discard_salt: bool,
}

impl<K: KeyStore, S: SampleSink> ServerSession<K, S> {
    /// Creates a session and queues the greeting and `TOK` challenge.
    pub fn new(
        cfg: ServerConfig,
        keys: K,
        sink: S,
        entropy: &mut dyn Entropy,
    ) -> Result<Self, SessionError> {
        let token_hex = entropy.token(cfg.token_bytes);
        let token_raw = hex::decode(&token_hex).map_err(|_| SessionError::BadToken)?;
        if token_raw.is_empty() || token_raw.len() > 127 {
            return Err(SessionError::BadToken);
        }

        let hello = ServerHello {
            version: Version::V1_2,
            hash_algos: cfg.hash_algos.iter().map(|a| a.name().to_owned()).collect(),
            max_samples: cfg.max_samples,
            hide_algos: cfg.hide_algos.iter().map(|a| a.name().to_owned()).collect(),
        };

        let max_line_len = cfg.max_line_len;
        let mut session = ServerSession {
            cfg,
            keys,
            sink,
            state: ServerState::AwaitHelloOrAuth,
            framer: LineFramer::new(max_line_len),
            inbuf: Vec::new(),
            out: Vec::new(),
            token_hex,
            token_raw,
            hash_alg: None,
            keyid: None,
            key: None,
            last_committed: None,
            seq: None,
            hide_rx: None,
            hide_used: false,
            discard_salt: false,
        };
        session.push_line(&hello.to_string());
        let tok = Command::Tok {
            token_hex: session.token_hex.clone(),
        };
        session.push_line(&tok.to_string());
        Ok(session)
    }

    /// Feeds transport bytes. On `Err` the session is closed; drain
    /// [`Self::take_output`] and tear down the transport.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        if self.state == ServerState::Closed {
            return Err(SessionError::Closed);
        }
        self.inbuf.extend_from_slice(bytes);
        self.pump()
    }

    /// Drains queued outbound bytes.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    /// Queues a one-way notification line. Dropped silently once closed;
    /// callers own any bounding of notification volume.
    pub fn notify(&mut self, notification: &Notification) {
        if self.state != ServerState::Closed {
            let cmd = Command::Ntfy(notification.clone());
            self.push_line(&cmd.to_string());
        }
    }

    /// Idle-abort hook: aborts any in-flight sequence and closes without
    /// emitting anything.
    pub fn idle_abort(&mut self) {
        self.close();
    }

    pub fn is_closed(&self) -> bool {
        self.state == ServerState::Closed
    }

    /// The key id that authenticated this session, once AUTH has succeeded.
    pub fn authenticated_keyid(&self) -> Option<&str> {
        self.keyid.as_deref()
    }

    /// The id of the most recently committed sequence.
    pub fn last_committed(&self) -> Option<u64> {
        self.last_committed
    }

    /// Access to the injected sample sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    // -- internals ----------------------------------------------------------

    fn pump(&mut self) -> Result<(), SessionError> {
        loop {
            if !self.inbuf.is_empty() {
                let raw = std::mem::take(&mut self.inbuf);
                match self.hide_rx.as_mut() {
                    Some(hide) => {
                        let mut plain = Vec::new();
                        hide.feed(&raw, &mut plain);
                        self.framer.push(&plain);
                    }
                    None => self.framer.push(&raw),
                }
            }

            let mut hide_armed = false;
            loop {
                if self.state == ServerState::Closed {
                    return Ok(());
                }
                let line = match self.framer.next_line() {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        self.push_rej("malformed");
                        self.close();
                        return Err(e.into());
                    }
                };
                if self.handle_line(&line)? {
                    hide_armed = true;
                    break;
                }
            }

            if !hide_armed {
                return Ok(());
            }
            // Everything still buffered past the HIDE line is ciphertext;
            // hand it back for decryption on the next pass.
            let mut residue = self.framer.take_buffered();
            residue.extend_from_slice(&self.inbuf);
            self.inbuf = residue;
        }
    }

    /// Handles one complete line. Returns `true` when the line armed HIDE
    /// (the caller must re-route buffered bytes through the decryptor).
    fn handle_line(&mut self, line: &[u8]) -> Result<bool, SessionError> {
        if self.discard_salt {
            // The first decrypted line after HIDE is opaque salt.
            self.discard_salt = false;
            return Ok(false);
        }
        if line.is_empty() {
            // Blank no-op, typically HIDE block padding.
            return Ok(false);
        }
        let Ok(text) = std::str::from_utf8(line) else {
            return Err(self.fail_malformed(ParseError::InvalidUtf8));
        };

        if is_hello(text) {
            return self.handle_hello(text).map(|()| false);
        }

        let cmd = match Command::parse(text) {
            Ok(cmd) => cmd,
            Err(e) => return Err(self.fail_malformed(e)),
        };

        if self.state == ServerState::InSequence {
            if let Command::Rej { reason } = cmd {
                self.close();
                return Err(SessionError::PeerReject(reason));
            }
            self.handle_in_sequence(line, cmd);
            return Ok(false);
        }

        match cmd {
            Command::Auth {
                algo,
                keyid,
                mac_hex,
            } => self.handle_auth(&algo, keyid, &mac_hex).map(|()| false),
            Command::Seq {
                seqid,
                basetime,
                time_divisor,
                data_format,
            } if self.state == ServerState::Authenticated => {
                self.handle_seq(line, seqid, basetime, time_divisor, data_format);
                Ok(false)
            }
            Command::Hide { algo, block_size } if self.state == ServerState::Authenticated => {
                Ok(self.handle_hide(&algo, block_size))
            }
            Command::Rej { reason } => {
                self.close();
                Err(SessionError::PeerReject(reason))
            }
            _ => {
                if self.state == ServerState::Authenticated {
                    // Out-of-place but parseable; the session survives.
                    self.push_rej("unexpected");
                    Ok(false)
                } else {
                    // Anything but hello/AUTH before authentication is fatal.
                    self.push_rej("unexpected");
                    self.close();
                    Err(SessionError::UnexpectedCommand)
                }
            }
        }
    }

    fn handle_hello(&mut self, text: &str) -> Result<(), SessionError> {
        if self.state != ServerState::AwaitHelloOrAuth {
            self.push_rej("unexpected");
            self.close();
            return Err(SessionError::UnexpectedCommand);
        }
        let hello = match ClientHello::parse(text) {
            Ok(hello) => hello,
            Err(e) => return Err(self.fail_malformed(e)),
        };
        let common = self
            .cfg
            .hash_algos
            .iter()
            .any(|a| hello.hash_algos.iter().any(|name| name == a.name()));
        if !common {
            // No shared hash: terminate without further exchange.
            self.close();
            return Err(SessionError::NoCommonHash);
        }
        self.state = ServerState::AwaitAuth;
        Ok(())
    }

    fn handle_auth(
        &mut self,
        algo: &str,
        keyid: String,
        mac_hex: &str,
    ) -> Result<(), SessionError> {
        if !matches!(
            self.state,
            ServerState::AwaitHelloOrAuth | ServerState::AwaitAuth
        ) {
            self.push_rej("unexpected");
            return Ok(());
        }
        let alg = HashAlg::from_name(algo).filter(|a| self.cfg.hash_algos.contains(a));
        let (Some(alg), Some(key)) = (alg, self.keys.lookup(&keyid)) else {
            return Err(self.fail_auth());
        };
        let Ok(given) = hex::decode(mac_hex) else {
            return Err(self.fail_auth());
        };
        // The proof covers the key id and the token exactly as transmitted.
        let expected = hmac_once(alg, &key, &[keyid.as_bytes(), self.token_hex.as_bytes()]);
        if !digest_eq(&expected, &given) {
            return Err(self.fail_auth());
        }
        // Success is silent.
        self.hash_alg = Some(alg);
        self.keyid = Some(keyid);
        self.key = Some(key);
        self.state = ServerState::Authenticated;
        Ok(())
    }

    fn handle_seq(
        &mut self,
        line: &[u8],
        seqid: u64,
        basetime: i64,
        time_divisor: i64,
        data_format: u32,
    ) {
        if self.last_committed.is_some_and(|last| seqid <= last) || time_divisor == 0 {
            self.push_rej(&seqid.to_string());
            return;
        }
        let Some(format) = DataFormat::from_code(data_format) else {
            self.push_rej(&seqid.to_string());
            return;
        };
        let (Some(alg), Some(key)) = (self.hash_alg, self.key.as_deref()) else {
            // Unreachable outside the authenticated state.
            self.push_rej("unexpected");
            return;
        };
        if self.sink.begin(seqid).is_err() {
            self.push_rej(&seqid.to_string());
            return;
        }
        let mac = SeqMac::seeded(alg, key, &self.token_raw);
        let mut seq = Sequence::new(
            seqid,
            basetime,
            time_divisor,
            format,
            mac,
            self.cfg.max_samples,
            self.cfg.reject_negative_span,
        );
        seq.feed_line(line);
        self.seq = Some(seq);
        self.state = ServerState::InSequence;
    }

    fn handle_in_sequence(&mut self, line: &[u8], cmd: Command) {
        if let Command::Sig { mac_hex } = cmd {
            // The SIG line is never fed to the HMAC.
            self.handle_sig(&mac_hex);
            return;
        }

        let Some(seq) = self.seq.as_mut() else {
            self.push_rej("unexpected");
            return;
        };
        seq.feed_line(line);

        let failure = match cmd {
            Command::Dict {
                idx,
                unit,
                unit_divisor,
                name,
            } => {
                let entry = DictEntry {
                    unit,
                    unit_divisor,
                    name,
                };
                seq.define(idx, entry).err().map(|_| SeqReject::BySeqId)
            }
            Command::Data(data) => match seq.ingest(&data) {
                Ok(sample) => self.sink.emit(&sample).err().map(|_| SeqReject::BySeqId),
                Err(_) => Some(SeqReject::BySeqId),
            },
            // Hiding may not start inside a sequence.
            Command::Hide { .. } => Some(SeqReject::Hide),
            _ => Some(SeqReject::BySeqId),
        };

        if let Some(reject) = failure {
            self.abort_sequence(reject);
        }
    }

    fn handle_sig(&mut self, mac_hex: &str) {
        let Some(mut seq) = self.seq.take() else {
            self.push_rej("unexpected");
            return;
        };
        self.state = ServerState::Authenticated;
        let seqid = seq.seqid;
        let computed = seq.finish_mac();
        let verified = hex::decode(mac_hex).is_ok_and(|given| digest_eq(&computed, &given));
        if !verified {
            self.sink.abort(seqid);
            self.push_rej("bad signature");
            return;
        }
        match self.sink.commit(seqid) {
            Ok(()) => {
                self.last_committed = Some(seqid);
                self.push_line(&Command::Ok { seqid }.to_string());
            }
            Err(_) => {
                self.push_line(&Command::Nok { seqid }.to_string());
            }
        }
    }

    /// Returns `true` when HIDE was armed and buffered bytes must be
    /// re-routed through the decryptor.
    fn handle_hide(&mut self, algo: &str, block_size: Option<usize>) -> bool {
        if self.hide_used {
            self.push_rej("hide");
            return false;
        }
        let alg = HideAlg::from_name(algo).filter(|a| self.cfg.hide_algos.contains(a));
        let Some(alg) = alg else {
            self.push_rej("hide");
            return false;
        };
        if block_size.is_some_and(|size| size != alg.block_size()) {
            self.push_rej("hide");
            return false;
        }
        let Some(key) = self.key.as_deref() else {
            self.push_rej("hide");
            return false;
        };
        let session_key = derive_session_key(alg, key, &self.token_raw);
        self.hide_rx = Some(HideDecrypt::new(alg, &session_key));
        self.hide_used = true;
        self.discard_salt = true;
        true
    }

    fn abort_sequence(&mut self, reject: SeqReject) {
        if let Some(seq) = self.seq.take() {
            let seqid = seq.seqid;
            self.sink.abort(seqid);
            self.state = ServerState::Authenticated;
            match reject {
                SeqReject::BySeqId => self.push_rej(&seqid.to_string()),
                SeqReject::Hide => self.push_rej("hide"),
            }
        }
    }

    fn fail_malformed(&mut self, e: ParseError) -> SessionError {
        self.push_rej("malformed");
        self.close();
        SessionError::Malformed(e)
    }

    fn fail_auth(&mut self) -> SessionError {
        self.push_rej("auth");
        self.close();
        SessionError::AuthFailed
    }

    fn close(&mut self) {
        if let Some(seq) = self.seq.take() {
            self.sink.abort(seq.seqid);
        }
        self.hide_rx = None;
        self.state = ServerState::Closed;
    }

    fn push_rej(&mut self, reason: &str) {
        let cmd = Command::Rej {
            reason: reason.to_owned(),
        };
        self.push_line(&cmd.to_string());
    }

    fn push_line(&mut self, line: &str) {
        self.out.extend_from_slice(line.as_bytes());
        self.out.push(b'\n');
    }
}
