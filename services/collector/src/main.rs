use std::env;
use std::path::Path;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "collector starting");

    // Optional config path as the first argument.
    let cfg = match env::args().nth(1) {
        Some(path) => collector::config::load_config_from_path(Path::new(&path)),
        None => collector::config::load_config(),
    };
    let cfg = match cfg {
        Ok(cfg) => {
            info!(
                bind = %cfg.listen.bind,
                sqlite = %cfg.storage.sqlite_path,
                hide = cfg.protocol.enable_hide,
                "config loaded"
            );
            Arc::new(cfg)
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let listener = tokio::net::TcpListener::bind(&cfg.listen.bind)
        .await
        .expect("failed to bind");
    info!(addr = %cfg.listen.bind, "collector listening");

    tokio::select! {
        () = collector::session::serve(listener, Arc::clone(&cfg)) => {}
        () = shutdown_signal() => {}
    }
    info!("collector shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
