//! Per-connection session runtime.
//!
//! One tokio task per accepted socket. Bytes are fed to the protocol engine
//! in read-sized chunks; whatever the engine queues is written back before
//! the next read, so responses and notifications are always whole lines.

use std::sync::Arc;
use std::time::Duration;

use s4pp_engine::server::ServerSession;
use s4pp_engine::{Clock, Entropy};
use s4pp_proto::Notification;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::config::{CollectorConfig, StaticKeyStore};
use crate::store::SqliteSink;

/// Hex tokens from the operating-system RNG.
#[derive(Debug, Default)]
pub struct SystemEntropy;

impl Entropy for SystemEntropy {
    fn token(&mut self, raw_len: usize) -> String {
        use rand::Rng;

        let bytes: Vec<u8> = rand::thread_rng()
            .sample_iter(&rand::distributions::Standard)
            .take(raw_len)
            .collect();
        hex::encode(bytes)
    }
}

/// Wall clock for the time notification.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> (u64, u32) {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(elapsed) => (elapsed.as_secs(), elapsed.subsec_millis()),
            Err(_) => (0, 0),
        }
    }
}

/// Accept loop: one session task per connection. Runs until the listener is
/// dropped or the surrounding task is cancelled.
pub async fn serve(listener: TcpListener, cfg: Arc<CollectorConfig>) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let cfg = Arc::clone(&cfg);
        tokio::spawn(async move {
            info!(peer = %peer, "session opened");
            match run_session(socket, &cfg).await {
                Ok(last_committed) => {
                    info!(peer = %peer, ?last_committed, "session closed");
                }
                Err(e) => warn!(peer = %peer, error = %e, "session failed"),
            }
        });
    }
}

/// Runs one protocol session over an accepted socket. Returns the id of the
/// last committed sequence, if any.
pub async fn run_session(
    mut socket: TcpStream,
    cfg: &CollectorConfig,
) -> Result<Option<u64>, SessionTaskError> {
    let sink = SqliteSink::open(&cfg.storage.sqlite_path)?;
    let keys: StaticKeyStore = cfg.keys.clone();
    let mut entropy = SystemEntropy;
    let mut session =
        ServerSession::new(cfg.protocol.server_config(), keys, sink, &mut entropy)?;

    if cfg.protocol.announce_time {
        let (utc_sec, utc_ms) = SystemClock.now_utc();
        session.notify(&Notification::Time { utc_sec, utc_ms });
    }
    socket.write_all(&session.take_output()).await?;

    let idle = Duration::from_secs(cfg.listen.idle_timeout_secs);
    let mut keyid_logged = false;
    let mut buf = [0u8; 4096];
    loop {
        let read = tokio::time::timeout(idle, socket.read(&mut buf)).await;
        let n = match read {
            Err(_) => {
                session.idle_abort();
                info!("idle timeout, session aborted");
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                session.idle_abort();
                return Err(e.into());
            }
        };

        let result = session.receive(&buf[..n]);
        if !keyid_logged {
            let keyid = session.authenticated_keyid().map(str::to_owned);
            if let Some(keyid) = keyid {
                info!(keyid, "session authenticated");
                session.sink_mut().set_keyid(&keyid);
                keyid_logged = true;
            }
        }
        let out = session.take_output();
        if !out.is_empty() {
            socket.write_all(&out).await?;
        }
        if let Err(e) = result {
            // Fatal protocol error; the trailing REJ has been flushed above.
            return Err(SessionTaskError::Protocol(e));
        }
        if session.is_closed() {
            break;
        }
    }
    let last_committed = session.last_committed();
    let _ = socket.shutdown().await;
    Ok(last_committed)
}

#[derive(Debug, thiserror::Error)]
pub enum SessionTaskError {
    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("protocol: {0}")]
    Protocol(#[from] s4pp_engine::SessionError),
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
}
