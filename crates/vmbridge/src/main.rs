#![forbid(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;
use vmbridge::{start_server, Cli, LogConfig, LogFormat};

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    match log.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let (config, log) = Cli::parse().into_config()?;
    init_tracing(&log);

    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

    let mut handle = start_server(config)
        .await
        .context("failed to start bridge")?;
    let reloader = handle.reloader();
    tracing::info!("vmbridge running");

    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            _ = sighup.recv() => {
                tracing::info!("SIGHUP received; reloading rules");
                if !reloader.reload() {
                    tracing::warn!("rule reload already pending");
                }
            }
            result = handle.closed() => {
                result.context("bridge stopped")?;
                return Ok(());
            }
        }
    }

    tracing::info!("shutdown signal received");
    handle.shutdown().await.context("shutdown failed")?;
    Ok(())
}
