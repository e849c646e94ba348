//! s4pp-proto: S4PP wire grammar and line types.
//!
//! Every S4PP line is either a space-separated hello (`S4PP/1.2 ...`), a
//! `TAG:payload` command, or a bare data line beginning with a dictionary
//! index. This crate parses and formats all three; it performs no I/O and no
//! cryptography. Session semantics (state, HMAC coverage, dictionary scope)
//! live in the engine crate.
//!
//! # Framing
//!
//! Lines are LF-terminated on the wire; the terminating LF is *not* part of
//! the strings handled here. CR is never legal and is rejected by the framer
//! before parsing. All parsed text must be valid UTF-8.

use std::fmt;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Grammar-level parse failure for a single line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error("unrecognised command")]
    UnknownCommand,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("surplus field after {0}")]
    SurplusField(&'static str),
    #[error("invalid integer in {0}")]
    InvalidInt(&'static str),
    #[error("sensor name must not be empty")]
    EmptyName,
    #[error("malformed hello line")]
    MalformedHello,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(String),
}

// ---------------------------------------------------------------------------
// Protocol version
// ---------------------------------------------------------------------------

/// Negotiable protocol versions. 1.2 adds the hide-algorithm list to both
/// hello forms; 1.0 and 1.1 hellos omit it and are still parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    V1_0,
    V1_1,
    V1_2,
}

impl Version {
    /// Whether this version carries a hide-algorithm list in hello lines.
    pub fn has_hide_list(self) -> bool {
        self >= Version::V1_2
    }

    fn from_hello_token(token: &str) -> Result<Self, ParseError> {
        let version = token
            .strip_prefix("S4PP/")
            .ok_or(ParseError::MalformedHello)?;
        match version {
            "1.0" => Ok(Version::V1_0),
            "1.1" => Ok(Version::V1_1),
            "1.2" => Ok(Version::V1_2),
            other => Err(ParseError::UnsupportedVersion(other.to_owned())),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::V1_0 => write!(f, "1.0"),
            Version::V1_1 => write!(f, "1.1"),
            Version::V1_2 => write!(f, "1.2"),
        }
    }
}

// ---------------------------------------------------------------------------
// Hello lines
// ---------------------------------------------------------------------------

/// Formats an algorithm list for a hello line: comma-separated, or a single
/// `-` when the list is empty (only ever legal for hide lists).
fn fmt_algo_list(f: &mut fmt::Formatter<'_>, algos: &[String]) -> fmt::Result {
    if algos.is_empty() {
        return write!(f, "-");
    }
    for (i, algo) in algos.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        write!(f, "{algo}")?;
    }
    Ok(())
}

fn parse_algo_list(field: &str) -> Vec<String> {
    if field == "-" {
        return Vec::new();
    }
    field.split(',').map(str::to_owned).collect()
}

/// Server greeting: `S4PP/1.2 <hash-algos> <max-samples> <hide-algos-or-dash>`.
///
/// 1.0/1.1 servers send three fields (no hide list); both forms parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub version: Version,
    pub hash_algos: Vec<String>,
    pub max_samples: u32,
    pub hide_algos: Vec<String>,
}

impl ServerHello {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut fields = line.split(' ');
        let version = Version::from_hello_token(fields.next().ok_or(ParseError::MalformedHello)?)?;
        let hash_algos = parse_algo_list(fields.next().ok_or(ParseError::MalformedHello)?);
        let max_samples = fields
            .next()
            .ok_or(ParseError::MalformedHello)?
            .parse()
            .map_err(|_| ParseError::InvalidInt("max-samples"))?;
        let hide_algos = if version.has_hide_list() {
            parse_algo_list(fields.next().ok_or(ParseError::MalformedHello)?)
        } else {
            Vec::new()
        };
        if fields.next().is_some() {
            return Err(ParseError::MalformedHello);
        }
        Ok(ServerHello {
            version,
            hash_algos,
            max_samples,
            hide_algos,
        })
    }
}

impl fmt::Display for ServerHello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S4PP/{} ", self.version)?;
        fmt_algo_list(f, &self.hash_algos)?;
        write!(f, " {}", self.max_samples)?;
        if self.version.has_hide_list() {
            write!(f, " ")?;
            fmt_algo_list(f, &self.hide_algos)?;
        }
        Ok(())
    }
}

/// Optional client greeting: `S4PP/1.2 <hash-algos> <hide-algos-or-dash>`.
///
/// There is no max-samples field; 1.0/1.1 clients omit the hide list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub version: Version,
    pub hash_algos: Vec<String>,
    pub hide_algos: Vec<String>,
}

impl ClientHello {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut fields = line.split(' ');
        let version = Version::from_hello_token(fields.next().ok_or(ParseError::MalformedHello)?)?;
        let hash_algos = parse_algo_list(fields.next().ok_or(ParseError::MalformedHello)?);
        let hide_algos = if version.has_hide_list() {
            parse_algo_list(fields.next().ok_or(ParseError::MalformedHello)?)
        } else {
            Vec::new()
        };
        if fields.next().is_some() {
            return Err(ParseError::MalformedHello);
        }
        Ok(ClientHello {
            version,
            hash_algos,
            hide_algos,
        })
    }
}

impl fmt::Display for ClientHello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S4PP/{} ", self.version)?;
        fmt_algo_list(f, &self.hash_algos)?;
        if self.version.has_hide_list() {
            write!(f, " ")?;
            fmt_algo_list(f, &self.hide_algos)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Data lines
// ---------------------------------------------------------------------------

/// A bare sample line: `idx,delta_t,<format-specific fields>`.
///
/// The field tail is format-dependent (the data format is declared by the
/// enclosing `SEQ` line, which this crate does not track), so everything past
/// `delta_t` is kept verbatim for the engine to interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLine {
    pub idx: u32,
    pub delta_t: i64,
    pub fields: Vec<String>,
}

impl DataLine {
    fn parse(line: &str) -> Result<Self, ParseError> {
        let mut fields = line.split(',');
        let idx = fields
            .next()
            .ok_or(ParseError::MissingField("idx"))?
            .parse()
            .map_err(|_| ParseError::InvalidInt("idx"))?;
        let delta_t = fields
            .next()
            .ok_or(ParseError::MissingField("delta_t"))?
            .parse()
            .map_err(|_| ParseError::InvalidInt("delta_t"))?;
        let fields: Vec<String> = fields.map(str::to_owned).collect();
        if fields.is_empty() {
            return Err(ParseError::MissingField("value"));
        }
        Ok(DataLine {
            idx,
            delta_t,
            fields,
        })
    }
}

impl fmt::Display for DataLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.idx, self.delta_t)?;
        for field in &self.fields {
            write!(f, ",{field}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Server-originated one-way advisory. Codes 0-2 are allocated, 3-99
/// reserved, >=100 vendor. Receivers must drop codes they do not recognise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// `NTFY:0,<utc_sec>,<utc_ms>` -- time service. On receipt the seconds
    /// field may instead carry a decimal fraction (`NTFY:0,123.45`); the
    /// comma form is the only one emitted.
    Time { utc_sec: u64, utc_ms: u32 },
    /// `NTFY:1,<version>[,<url>]` -- firmware advisory.
    Firmware { version: String, url: Option<String> },
    /// `NTFY:2,<setflags>,<clearflags>` -- flag bitfields, lowercase hex
    /// without zero padding, at most 128 bits each.
    Flags { set: u128, clear: u128 },
    /// Any reserved or vendor code, kept opaque.
    Other { code: u32, args: String },
}

impl Notification {
    pub fn code(&self) -> u32 {
        match self {
            Notification::Time { .. } => 0,
            Notification::Firmware { .. } => 1,
            Notification::Flags { .. } => 2,
            Notification::Other { code, .. } => *code,
        }
    }

    fn parse(payload: &str) -> Result<Self, ParseError> {
        let (code, args) = match payload.split_once(',') {
            Some((code, args)) => (code, args),
            None => (payload, ""),
        };
        let code: u32 = code.parse().map_err(|_| ParseError::InvalidInt("code"))?;
        match code {
            0 => Self::parse_time(args),
            1 => Self::parse_firmware(args),
            2 => Self::parse_flags(args),
            code => Ok(Notification::Other {
                code,
                args: args.to_owned(),
            }),
        }
    }

    fn parse_time(args: &str) -> Result<Self, ParseError> {
        if let Some((sec, ms)) = args.split_once(',') {
            let utc_sec = sec.parse().map_err(|_| ParseError::InvalidInt("utc_sec"))?;
            let utc_ms = ms.parse().map_err(|_| ParseError::InvalidInt("utc_ms"))?;
            return Ok(Notification::Time { utc_sec, utc_ms });
        }
        // Fraction form: seconds with an optional decimal part in place of
        // the millisecond field.
        let (sec, frac) = match args.split_once('.') {
            Some((sec, frac)) => (sec, frac),
            None => (args, ""),
        };
        let utc_sec = sec.parse().map_err(|_| ParseError::InvalidInt("utc_sec"))?;
        let utc_ms = if frac.is_empty() {
            0
        } else {
            if !frac.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::InvalidInt("utc_sec"));
            }
            // Scale the fraction to milliseconds, truncating extra digits.
            let mut ms = 0u32;
            for digit in frac.bytes().chain([b'0', b'0']).take(3) {
                ms = ms * 10 + u32::from(digit - b'0');
            }
            ms
        };
        Ok(Notification::Time { utc_sec, utc_ms })
    }

    fn parse_firmware(args: &str) -> Result<Self, ParseError> {
        if args.is_empty() {
            return Err(ParseError::MissingField("version"));
        }
        let (version, url) = match args.split_once(',') {
            Some((version, url)) => (version, Some(url.to_owned())),
            None => (args, None),
        };
        Ok(Notification::Firmware {
            version: version.to_owned(),
            url,
        })
    }

    fn parse_flags(args: &str) -> Result<Self, ParseError> {
        let (set, clear) = args
            .split_once(',')
            .ok_or(ParseError::MissingField("clearflags"))?;
        let set = u128::from_str_radix(set, 16).map_err(|_| ParseError::InvalidInt("setflags"))?;
        let clear =
            u128::from_str_radix(clear, 16).map_err(|_| ParseError::InvalidInt("clearflags"))?;
        Ok(Notification::Flags { set, clear })
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Time { utc_sec, utc_ms } => write!(f, "0,{utc_sec},{utc_ms}"),
            Notification::Firmware { version, url } => {
                write!(f, "1,{version}")?;
                if let Some(url) = url {
                    write!(f, ",{url}")?;
                }
                Ok(())
            }
            Notification::Flags { set, clear } => write!(f, "2,{set:x},{clear:x}"),
            Notification::Other { code, args } => {
                write!(f, "{code}")?;
                if !args.is_empty() {
                    write!(f, ",{args}")?;
                }
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Any `TAG:payload` command or bare data line.
///
/// The hex fields (`TOK`, `AUTH`, `SIG`) stay as transmitted: the AUTH proof
/// covers the token in its ASCII form, so the engine needs the verbatim text
/// as well as the decoded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `TOK:<hex>` -- server challenge token.
    Tok { token_hex: String },
    /// `AUTH:<algo>,<keyid>,<hmac-hex>`.
    Auth {
        algo: String,
        keyid: String,
        mac_hex: String,
    },
    /// `SEQ:<seqid>,<basetime>,<time_divisor>,<data_format>`.
    Seq {
        seqid: u64,
        basetime: i64,
        time_divisor: i64,
        data_format: u32,
    },
    /// `DICT:<idx>,<unit>,<unit_divisor>,<name>`. The unit may be empty, the
    /// name may not; neither may contain a comma.
    Dict {
        idx: u32,
        unit: String,
        unit_divisor: i64,
        name: String,
    },
    /// A bare sample line.
    Data(DataLine),
    /// `SIG:<hmac-hex>` -- sequence signature.
    Sig { mac_hex: String },
    /// `HIDE:<algo>[,<blocksize>]`.
    Hide {
        algo: String,
        block_size: Option<usize>,
    },
    /// `REJ:<reason>`.
    Rej { reason: String },
    /// `OK:<seqid>`.
    Ok { seqid: u64 },
    /// `NOK:<seqid>`.
    Nok { seqid: u64 },
    /// `NTFY:<code>[,<args>]`.
    Ntfy(Notification),
}

impl Command {
    /// Parses a single line (without its LF). Hello lines are not commands;
    /// dispatch on [`is_hello`] first.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        if let Some((tag, payload)) = line.split_once(':') {
            match tag {
                "TOK" => {
                    if payload.is_empty() {
                        return Err(ParseError::MissingField("token"));
                    }
                    return Ok(Command::Tok {
                        token_hex: payload.to_owned(),
                    });
                }
                "AUTH" => return Self::parse_auth(payload),
                "SEQ" => return Self::parse_seq(payload),
                "DICT" => return Self::parse_dict(payload),
                "SIG" => {
                    return Ok(Command::Sig {
                        mac_hex: payload.to_owned(),
                    });
                }
                "HIDE" => return Self::parse_hide(payload),
                "REJ" => {
                    return Ok(Command::Rej {
                        reason: payload.to_owned(),
                    });
                }
                "OK" => {
                    return Ok(Command::Ok {
                        seqid: payload.parse().map_err(|_| ParseError::InvalidInt("seqid"))?,
                    });
                }
                "NOK" => {
                    return Ok(Command::Nok {
                        seqid: payload.parse().map_err(|_| ParseError::InvalidInt("seqid"))?,
                    });
                }
                "NTFY" => return Ok(Command::Ntfy(Notification::parse(payload)?)),
                _ => {}
            }
        }
        if line.bytes().next().is_some_and(|b| b.is_ascii_digit()) {
            return Ok(Command::Data(DataLine::parse(line)?));
        }
        Err(ParseError::UnknownCommand)
    }

    fn parse_auth(payload: &str) -> Result<Self, ParseError> {
        let mut fields = payload.split(',');
        let algo = fields.next().ok_or(ParseError::MissingField("algo"))?;
        let keyid = fields.next().ok_or(ParseError::MissingField("keyid"))?;
        let mac_hex = fields.next().ok_or(ParseError::MissingField("hmac"))?;
        if fields.next().is_some() {
            return Err(ParseError::SurplusField("hmac"));
        }
        Ok(Command::Auth {
            algo: algo.to_owned(),
            keyid: keyid.to_owned(),
            mac_hex: mac_hex.to_owned(),
        })
    }

    fn parse_seq(payload: &str) -> Result<Self, ParseError> {
        let mut fields = payload.split(',');
        let seqid = fields
            .next()
            .ok_or(ParseError::MissingField("seqid"))?
            .parse()
            .map_err(|_| ParseError::InvalidInt("seqid"))?;
        let basetime = fields
            .next()
            .ok_or(ParseError::MissingField("basetime"))?
            .parse()
            .map_err(|_| ParseError::InvalidInt("basetime"))?;
        let time_divisor = fields
            .next()
            .ok_or(ParseError::MissingField("time_divisor"))?
            .parse()
            .map_err(|_| ParseError::InvalidInt("time_divisor"))?;
        let data_format = fields
            .next()
            .ok_or(ParseError::MissingField("data_format"))?
            .parse()
            .map_err(|_| ParseError::InvalidInt("data_format"))?;
        if fields.next().is_some() {
            return Err(ParseError::SurplusField("data_format"));
        }
        Ok(Command::Seq {
            seqid,
            basetime,
            time_divisor,
            data_format,
        })
    }

    fn parse_dict(payload: &str) -> Result<Self, ParseError> {
        let mut fields = payload.split(',');
        let idx = fields
            .next()
            .ok_or(ParseError::MissingField("idx"))?
            .parse()
            .map_err(|_| ParseError::InvalidInt("idx"))?;
        let unit = fields.next().ok_or(ParseError::MissingField("unit"))?;
        let unit_divisor = fields
            .next()
            .ok_or(ParseError::MissingField("unit_divisor"))?
            .parse()
            .map_err(|_| ParseError::InvalidInt("unit_divisor"))?;
        let name = fields.next().ok_or(ParseError::MissingField("name"))?;
        if fields.next().is_some() {
            return Err(ParseError::SurplusField("name"));
        }
        if name.is_empty() {
            return Err(ParseError::EmptyName);
        }
        Ok(Command::Dict {
            idx,
            unit: unit.to_owned(),
            unit_divisor,
            name: name.to_owned(),
        })
    }

    fn parse_hide(payload: &str) -> Result<Self, ParseError> {
        let (algo, block_size) = match payload.split_once(',') {
            Some((algo, size)) => (
                algo,
                Some(
                    size.parse()
                        .map_err(|_| ParseError::InvalidInt("blocksize"))?,
                ),
            ),
            None => (payload, None),
        };
        if algo.is_empty() {
            return Err(ParseError::MissingField("algo"));
        }
        Ok(Command::Hide {
            algo: algo.to_owned(),
            block_size,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Tok { token_hex } => write!(f, "TOK:{token_hex}"),
            Command::Auth {
                algo,
                keyid,
                mac_hex,
            } => write!(f, "AUTH:{algo},{keyid},{mac_hex}"),
            Command::Seq {
                seqid,
                basetime,
                time_divisor,
                data_format,
            } => write!(f, "SEQ:{seqid},{basetime},{time_divisor},{data_format}"),
            Command::Dict {
                idx,
                unit,
                unit_divisor,
                name,
            } => write!(f, "DICT:{idx},{unit},{unit_divisor},{name}"),
            Command::Data(data) => write!(f, "{data}"),
            Command::Sig { mac_hex } => write!(f, "SIG:{mac_hex}"),
            Command::Hide { algo, block_size } => {
                write!(f, "HIDE:{algo}")?;
                if let Some(size) = block_size {
                    write!(f, ",{size}")?;
                }
                Ok(())
            }
            Command::Rej { reason } => write!(f, "REJ:{reason}"),
            Command::Ok { seqid } => write!(f, "OK:{seqid}"),
            Command::Nok { seqid } => write!(f, "NOK:{seqid}"),
            Command::Ntfy(notification) => write!(f, "NTFY:{notification}"),
        }
    }
}

/// Whether a line is a hello (space-separated, version-prefixed) rather than
/// a command or data line.
pub fn is_hello(line: &str) -> bool {
    line.starts_with("S4PP/")
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
