mod api;
mod config;
mod core;

use anyhow::{Context, Result};
use api::{http, metrics::MetricsRegistry};
use clap::Parser;
use config::{AppConfig, ConfigArgs};
use crate::core::{collector::Collector, fetcher::ClashClient};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "clash-exporter")]
#[command(about = "Prometheus exporter for Clash connection statistics", version)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    // CLI
    let cli = Cli::parse();
    let cfg = AppConfig::resolve(cli.config)?;

    // Initialize tracing - env wins over the configured log level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("clash_exporter={}", cfg.log_level).into()),
        )
        .init();

    info!("Starting Clash exporter...");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                res = signal::ctrl_c() => match res {
                    Ok(()) => info!("Shutdown signal received, gracefully shutting down..."),
                    Err(e) => {
                        error!("Failed to listen for shutdown signal: {}", e);
                        return;
                    }
                },
                _ = shutdown.cancelled() => return,
            }
            shutdown.cancel();
        });
    }

    run(cfg, shutdown).await?;

    info!("Shutdown complete");
    Ok(())
}

/// Serve metrics and collect from Clash until `shutdown` fires or collection
/// fails fatally. A fatal collection error is returned after the HTTP server
/// has drained.
async fn run(cfg: AppConfig, shutdown: CancellationToken) -> Result<()> {
    let registry = Arc::new(MetricsRegistry::new().context("Failed to initialize metrics")?);
    let source = ClashClient::new(&cfg.clash_address, cfg.clash_timeout)?;
    let collector = Collector::new(Arc::new(source), registry.clone(), cfg.collect_interval)
        .with_decode_error_policy(cfg.on_decode_error);

    // Bind before collecting so a bad listen address fails fast
    let listener = TcpListener::bind(&cfg.listen_address)
        .await
        .with_context(|| format!("Failed to bind to {}", cfg.listen_address))?;

    let collector_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = collector.run(shutdown.clone()).await;
            if result.is_err() {
                // Take the HTTP server down with us
                shutdown.cancel();
            }
            result
        })
    };

    let router = http::create_router(registry, &cfg.metrics_path);
    info!("Metrics: http://{}{}", cfg.listen_address, cfg.metrics_path);
    let served = http::serve(listener, router, shutdown.clone()).await;
    shutdown.cancel();

    collector_handle
        .await
        .context("Collector task panicked")?
        .context("Metrics collection failed")?;
    served
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecodeErrorPolicy;
    use axum::{Router, routing::get};
    use std::net::SocketAddr;
    use std::time::Duration;

    async fn spawn_clash(body: &'static str) -> SocketAddr {
        let app = Router::new().route("/connections", get(move || async move { body }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn config(clash: SocketAddr, policy: DecodeErrorPolicy) -> AppConfig {
        AppConfig {
            listen_address: "127.0.0.1:0".to_string(),
            clash_address: clash.to_string(),
            collect_interval: Duration::from_secs(3600),
            on_decode_error: policy,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn malformed_response_ends_run_with_error() {
        let clash = spawn_clash("<html>not json</html>").await;
        let shutdown = CancellationToken::new();

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            run(config(clash, DecodeErrorPolicy::Exit), shutdown.clone()),
        )
        .await
        .expect("run did not stop after a decode error");

        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("malformed connections payload"));
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn skip_policy_keeps_running_until_shutdown() {
        let clash = spawn_clash("<html>not json</html>").await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(config(clash, DecodeErrorPolicy::Skip), shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("run did not stop on shutdown")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cfg = AppConfig {
            listen_address: taken.local_addr().unwrap().to_string(),
            ..Default::default()
        };

        let err = run(cfg, CancellationToken::new()).await.unwrap_err();
        assert!(format!("{err:#}").contains("Failed to bind"));
    }
}
