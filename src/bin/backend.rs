#![forbid(unsafe_code)]

//! HTTP entry point for the cleantube download service.
//!
//! Jobs run on a bounded pool inside this process; the download directory is
//! purged of stale leftovers at startup and periodically afterwards.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use cleantube::api::{AppState, router};
use cleantube::artifact::ArtifactServer;
use cleantube::config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings};
use cleantube::extractor::YtDlpExtractor;
use cleantube::jobs::MemoryJobStore;
use cleantube::runner::JobRunner;
use cleantube::security::ensure_not_root;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,tower_http=info";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct BackendArgs {
    download_dir: Option<PathBuf>,
    listen_host: Option<IpAddr>,
    port: Option<u16>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--download-dir=") {
                parsed.download_dir = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                parsed.port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                parsed.listen_host = Some(parse_host_arg(value)?);
                continue;
            }

            match arg.as_str() {
                "--download-dir" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--download-dir requires a value"))?;
                    parsed.download_dir = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    parsed.port = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    parsed.listen_host = Some(parse_host_arg(&value)?);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }
        Ok(parsed)
    }

    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            download_dir: self.download_dir,
            host: self.listen_host.map(|host| host.to_string()),
            port: self.port,
            ..RuntimeOverrides::default()
        }
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/CLEANTUBE_HOST")
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = BackendArgs::parse()?;
    ensure_not_root("backend")?;

    let settings = resolve_runtime_settings(args.into_overrides())?;
    run(settings).await
}

async fn run(settings: RuntimeSettings) -> Result<()> {
    let host = parse_host_arg(&settings.host)?;
    tokio::fs::create_dir_all(&settings.download_dir)
        .await
        .with_context(|| format!("creating {}", settings.download_dir.display()))?;
    let download_dir = settings
        .download_dir
        .canonicalize()
        .with_context(|| format!("resolving {}", settings.download_dir.display()))?;

    let store = Arc::new(MemoryJobStore::new());
    let extractor = Arc::new(YtDlpExtractor::new(
        settings.yt_dlp_bin.clone(),
        settings.cookies_file.clone(),
    ));
    let runner = JobRunner::new(
        store.clone(),
        extractor,
        download_dir.clone(),
        settings.max_concurrent_downloads,
    );

    let startup = runner.sweep(settings.job_ttl, settings.artifact_ttl).await;
    info!(
        purged_artifacts = startup.purged_artifacts,
        dir = %download_dir.display(),
        "download directory ready"
    );
    let sweeper = runner.spawn_sweeper(
        settings.sweep_interval,
        settings.job_ttl,
        settings.artifact_ttl,
    );

    let app = router(AppState {
        jobs: store,
        runner: runner.clone(),
        artifacts: Arc::new(ArtifactServer::new(download_dir)),
    });

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(
        %addr,
        workers = settings.max_concurrent_downloads,
        "download service listening"
    );

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server");

    runner.shutdown();
    if let Err(err) = sweeper.await {
        error!("sweeper task ended abnormally: {err}");
    }
    info!(in_flight = runner.in_flight(), "download service stopped");
    serve_result
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {err}");
    }
    info!("shutdown requested");
}
