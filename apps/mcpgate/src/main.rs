use std::io::Write as _;

use clap::Parser;
use mcpgate_bridge::BridgeConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "mcpgate",
    version,
    about = "Bridge line-delimited JSON-RPC on stdio to a remote MCP server over HTTP + SSE"
)]
struct Args {
    /// SSE URL of the remote MCP server.
    url: String,
}

const LOG_PREFIX: &[u8] = b"[mcpgate] ";

/// Every diagnostic line goes to stderr with a stable prefix; stdout carries
/// nothing but JSON-RPC frames.
struct PrefixedStderr;

impl std::io::Write for PrefixedStderr {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut err = std::io::stderr().lock();
        err.write_all(LOG_PREFIX)?;
        err.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_writer(|| PrefixedStderr)
        .with_ansi(false)
        .init();
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let Ok(mut term) = signal(SignalKind::terminate()) else {
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = term.recv() => info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // A missing URL is an operator mistake, not a crash.
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let config = BridgeConfig::new(&args.url)?.with_env_overrides();
    info!(url = %config.url, "starting bridge");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    mcpgate_bridge::run(config, tokio::io::stdin(), tokio::io::stdout(), shutdown).await
}
