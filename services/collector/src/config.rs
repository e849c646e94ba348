//! Collector configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/s4pp/collector.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - At least one `[[keys]]` entry with `keyid` and `secret` or `secret_hex`
//!
//! # Example
//! ```toml
//! schema_version = 1
//!
//! [listen]
//! bind = "0.0.0.0:4404"
//!
//! [protocol]
//! max_samples = 2000
//! enable_hide = true
//!
//! [storage]
//! sqlite_path = "/var/lib/s4pp/collector.sqlite3"
//!
//! [[keys]]
//! keyid = "1234"
//! secret = "secret"
//! ```

use std::collections::HashMap;
use std::path::Path;

use s4pp_engine::KeyStore;
use s4pp_engine::crypto::{HashAlg, HideAlg};
use s4pp_engine::server::ServerConfig;
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level collector configuration.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub schema_version: u32,
    pub listen: ListenConfig,
    pub protocol: ProtocolConfig,
    pub storage: StorageConfig,
    pub keys: StaticKeyStore,
}

#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub bind: String,
    /// Seconds of inactivity before the session is aborted.
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub max_samples: u32,
    pub token_bytes: usize,
    pub enable_hide: bool,
    pub reject_negative_span: bool,
    pub max_line_len: usize,
    /// Send a `NTFY:0` time notification right after the greeting.
    pub announce_time: bool,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

impl ProtocolConfig {
    /// The engine-level session parameters derived from this config.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            hash_algos: vec![HashAlg::Sha256],
            hide_algos: if self.enable_hide {
                vec![HideAlg::Aes128Cbc]
            } else {
                Vec::new()
            },
            max_samples: self.max_samples,
            token_bytes: self.token_bytes,
            reject_negative_span: self.reject_negative_span,
            max_line_len: Some(self.max_line_len),
        }
    }
}

/// Shared keys loaded from the config, by key id.
#[derive(Clone, Default)]
pub struct StaticKeyStore {
    keys: HashMap<String, Vec<u8>>,
}

impl std::fmt::Debug for StaticKeyStore {
    // Key bytes stay out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeyStore")
            .field("keyids", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl KeyStore for StaticKeyStore {
    fn lookup(&self, keyid: &str) -> Option<Vec<u8>> {
        self.keys.get(keyid).cloned()
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    listen: Option<RawListenConfig>,
    protocol: Option<RawProtocolConfig>,
    storage: Option<RawStorageConfig>,
    keys: Option<Vec<RawKeyConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawListenConfig {
    bind: Option<String>,
    idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawProtocolConfig {
    max_samples: Option<u32>,
    token_bytes: Option<usize>,
    enable_hide: Option<bool>,
    reject_negative_span: Option<bool>,
    max_line_len: Option<usize>,
    announce_time: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawStorageConfig {
    sqlite_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawKeyConfig {
    keyid: Option<String>,
    secret: Option<String>,
    secret_hex: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load collector config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<CollectorConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load collector config from the default path `/etc/s4pp/collector.toml`.
pub fn load_config() -> Result<CollectorConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/s4pp/collector.toml"))
}

/// Load collector config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<CollectorConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let listen = match raw.listen {
        Some(l) => ListenConfig {
            bind: l.bind.unwrap_or_else(|| "0.0.0.0:4404".to_owned()),
            idle_timeout_secs: l.idle_timeout_secs.unwrap_or(120),
        },
        None => ListenConfig {
            bind: "0.0.0.0:4404".to_owned(),
            idle_timeout_secs: 120,
        },
    };

    let protocol = match raw.protocol {
        Some(p) => ProtocolConfig {
            max_samples: p.max_samples.unwrap_or(2000),
            token_bytes: p.token_bytes.unwrap_or(16),
            enable_hide: p.enable_hide.unwrap_or(true),
            reject_negative_span: p.reject_negative_span.unwrap_or(false),
            max_line_len: p.max_line_len.unwrap_or(8192),
            announce_time: p.announce_time.unwrap_or(false),
        },
        None => ProtocolConfig {
            max_samples: 2000,
            token_bytes: 16,
            enable_hide: true,
            reject_negative_span: false,
            max_line_len: 8192,
            announce_time: false,
        },
    };
    if protocol.token_bytes == 0 || protocol.token_bytes > 127 {
        return Err(ConfigError::InvalidValue(
            "protocol.token_bytes must be between 1 and 127".to_owned(),
        ));
    }

    let storage = StorageConfig {
        sqlite_path: raw
            .storage
            .and_then(|s| s.sqlite_path)
            .unwrap_or_else(|| "/var/lib/s4pp/collector.sqlite3".to_owned()),
    };

    let raw_keys = raw
        .keys
        .ok_or_else(|| ConfigError::MissingField("keys".to_owned()))?;
    if raw_keys.is_empty() {
        return Err(ConfigError::InvalidValue(
            "at least one [[keys]] entry is required".to_owned(),
        ));
    }
    let mut keys = HashMap::with_capacity(raw_keys.len());
    for (i, k) in raw_keys.into_iter().enumerate() {
        let keyid = k
            .keyid
            .ok_or_else(|| ConfigError::MissingField(format!("keys[{}].keyid", i)))?;
        if keyid.is_empty() || keyid.contains(',') {
            return Err(ConfigError::InvalidValue(format!(
                "keys[{}].keyid must be non-empty and comma-free",
                i
            )));
        }
        let secret = match (k.secret, k.secret_hex) {
            (Some(s), None) => s.into_bytes(),
            (None, Some(h)) => hex::decode(&h).map_err(|_| {
                ConfigError::InvalidValue(format!("keys[{}].secret_hex is not valid hex", i))
            })?,
            _ => {
                return Err(ConfigError::InvalidValue(format!(
                    "keys[{}] needs exactly one of secret or secret_hex",
                    i
                )));
            }
        };
        keys.insert(keyid, secret);
    }

    Ok(CollectorConfig {
        schema_version,
        listen,
        protocol,
        storage,
        keys: StaticKeyStore { keys },
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
