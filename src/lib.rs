use tokio::io::AsyncBufReadExt;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod config;
pub mod credentials;
pub mod error;
pub mod mail;
pub mod mailbox;
mod net_stream;
mod pop3;
mod smtp;
pub mod spool;
mod tls;
pub mod token;
pub mod upstream;

pub mod supervisor;

pub use config::Config;

/// Installs a structured logging subscriber: an `EnvFilter` derived from
/// `logging.log_level` (defaulting to `info` for this crate, `warn` for
/// dependencies), a JSON layer on stdout, and an optional rotating-file
/// layer when `logging.log_file` is configured.
pub fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = config
        .logging
        .as_ref()
        .and_then(|l| l.log_level.clone())
        .unwrap_or_else(|| "info".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("{}={level},warn", env!("CARGO_CRATE_NAME")).into()
    });

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json());

    match config.logging.as_ref().and_then(|l| l.log_file.as_ref()) {
        Some(log_file) => {
            let directory = log_file.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = log_file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("mailproxy.log");
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
                .init();

            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

/// Resolves on the first of Ctrl+C, SIGTERM, or `token` being cancelled by
/// some other part of the process (e.g. an unrecoverable token refresh
/// failure), per §4.10's shutdown trigger.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    // Lets an operator request shutdown by typing a line on stdin, for the
    // common case of running this interactively without a controlling
    // terminal that delivers signals (e.g. under a process supervisor that
    // pipes stdin but swallows signals).
    let stdin_fallback = async {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        let _ = lines.next_line().await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = stdin_fallback => {},
    }
}
