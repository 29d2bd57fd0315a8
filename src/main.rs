use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use mirrorgate::admin::AdminContext;
use mirrorgate::auth::TokenBroker;
use mirrorgate::config::Config;
use mirrorgate::crypto::CredentialCipher;
use mirrorgate::mirror::scraper::MirrorScraper;
use mirrorgate::mirror::{HealthProber, MirrorRegistry};
use mirrorgate::proxy::{ProxyEngine, ProxyServer};
use mirrorgate::shutdown::Shutdown;
use mirrorgate::store::{NewMirror, Store};
use mirrorgate::traffic::TrafficRecorder;

#[derive(Parser)]
#[command(name = "mirrorgate")]
#[command(about = "Registry-aware reverse proxy for container image distribution")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the listen address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("mirrorgate={}", level).into()),
        )
        .init();

    info!("Starting mirrorgate");

    let config = match &args.config {
        Some(path) => Config::from_file(path).await?,
        None => Config::from_env()?,
    };

    let bind_addr: SocketAddr = match args.bind {
        Some(addr) => addr,
        None => config
            .server
            .listen_addr
            .parse()
            .context("invalid listen address")?,
    };

    // Store and credential cipher; open errors are fatal.
    let cipher = CredentialCipher::from_passphrase(&load_secret(&config.storage.data_dir).await?);
    let store = Store::open(&config.storage.data_dir, cipher)
        .await
        .context("failed to open store")?;

    seed_mirrors(&store, &config).await?;

    let registry = MirrorRegistry::new();
    registry.replace_all(store.load_mirrors().await?).await;
    info!("Mirror registry loaded");

    let shutdown = Shutdown::new();

    // Traffic accounting pipeline.
    let stream_idle =
        std::time::Duration::from_secs(config.http_client.stream_idle_timeout_secs);
    let recorder = TrafficRecorder::new(&config.traffic, stream_idle);
    let writer = recorder.spawn_writer(store.clone(), config.traffic.clone(), shutdown.clone());

    // Health prober.
    let prober = HealthProber::new(registry.clone(), store.clone(), config.probe.clone());
    let probe_handle = prober.handle();
    tokio::spawn(prober.run(shutdown.clone()));

    // Mirror-list scraper, when a source is configured.
    let scraper = config.scraper.source_url.clone().map(|url| {
        Arc::new(MirrorScraper::new(
            store.clone(),
            registry.clone(),
            probe_handle.clone(),
            url,
        ))
    });
    if let Some(scraper) = scraper.clone() {
        spawn_scrape_schedule(scraper, config.probe.interval_secs, shutdown.clone());
    }

    if let Some(metrics_addr) = &config.server.metrics_addr {
        mirrorgate::monitoring::init(metrics_addr.parse()?)?;
    }

    let engine = ProxyEngine::new(
        registry.clone(),
        TokenBroker::new(),
        recorder.clone(),
        config.http_client.clone(),
    );
    let admin = Arc::new(AdminContext::new(
        store,
        registry,
        probe_handle,
        scraper,
        recorder,
    ));
    let server = ProxyServer::new(
        bind_addr,
        engine,
        admin,
        config.server.admin_base_path.clone(),
    );

    // Signals translate into the shared shutdown broadcast.
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!("Shutdown signal received");
        signal_shutdown.trigger();
    });

    server.run(shutdown.clone()).await?;

    // Server drained; stop the background tasks and let the traffic
    // writer finish its final flush.
    shutdown.trigger();
    let _ = writer.await;

    info!("mirrorgate shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

/// Credential-encryption secret: `SECRET_KEY` from the environment, or a
/// random key persisted under the data directory on first boot.
async fn load_secret(data_dir: &str) -> Result<String> {
    if let Ok(secret) = std::env::var("SECRET_KEY") {
        if !secret.is_empty() {
            return Ok(secret);
        }
    }

    let path = Path::new(data_dir).join("secret.key");
    match tokio::fs::read_to_string(&path).await {
        Ok(secret) => Ok(secret),
        Err(_) => {
            tokio::fs::create_dir_all(data_dir).await?;
            let secret: String = {
                let mut rng = rand::thread_rng();
                (0..48)
                    .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
                    .collect()
            };
            tokio::fs::write(&path, &secret)
                .await
                .context("failed to persist generated secret key")?;
            info!("Generated credential secret at {:?}", path);
            Ok(secret)
        }
    }
}

/// First-boot seeding from the config file; no-op once mirrors exist.
async fn seed_mirrors(store: &Store, config: &Config) -> Result<()> {
    if config.seed_mirrors.is_empty() || store.count_mirrors().await? > 0 {
        return Ok(());
    }
    for seed in &config.seed_mirrors {
        let new = NewMirror {
            prefix: seed.prefix.clone(),
            upstream_url: seed.upstream_url.clone(),
            upstream_host: seed.upstream_host.clone().unwrap_or_default(),
            auth: seed.auth.clone(),
        };
        let created = store.insert_mirror(&new).await?;
        info!("Seeded mirror '{}' -> {}", created.prefix, created.upstream_url);
    }
    Ok(())
}

fn spawn_scrape_schedule(scraper: Arc<MirrorScraper>, interval_secs: u64, shutdown: Shutdown) {
    tokio::spawn(async move {
        let mut shutdown_rx = shutdown.subscribe();
        let interval = std::time::Duration::from_secs(interval_secs.max(60));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = scraper.run_once().await {
                        warn!("Scheduled scrape failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => return,
            }
        }
    });
}
