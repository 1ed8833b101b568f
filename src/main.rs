//! Relay entry point.
//!
//! Wires configuration, structured logging, the listening server, and
//! graceful shutdown together. Binding the port happens first, inside
//! `server::run`, so that a bind failure surfaces as a clean `port-in-use`
//! exit before anything else starts.

use std::io::IsTerminal;

use cdp_relay::config::Config;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. Logs to the configured file
/// path via a non-blocking appender if set, otherwise to stderr.
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    match &config.log_file {
        Some(path) => {
            let (dir, file) = match path.rsplit_once('/') {
                Some((dir, file)) => (dir.to_string(), file.to_string()),
                None => (".".to_string(), path.clone()),
            };
            let appender = tracing_appender::rolling::never(dir, file);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(std::io::stderr().is_terminal())
                .init();
            None
        }
    }
}

/// SIGTERM/SIGINT on Unix, Ctrl-C on Windows.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(windows)]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C");
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return std::process::ExitCode::from(2);
        }
    };

    let _guard = init_tracing(&config);
    info!(version = cdp_relay::VERSION, host = %config.host, port = config.port, "starting cdp-relay");

    let serve = tokio::spawn(cdp_relay::server::run(config));

    tokio::select! {
        result = serve => {
            match result {
                Ok(Ok(())) => std::process::ExitCode::SUCCESS,
                Ok(Err(e)) => {
                    error!(error = %e, "relay exited with an error");
                    match e {
                        cdp_relay::Error::PortInUse(_) => std::process::ExitCode::from(2),
                        _ => std::process::ExitCode::FAILURE,
                    }
                }
                Err(e) => {
                    error!(error = %e, "relay task panicked");
                    std::process::ExitCode::FAILURE
                }
            }
        }
        () = shutdown_signal() => {
            info!("shutdown signal received, exiting");
            std::process::ExitCode::SUCCESS
        }
    }
}
