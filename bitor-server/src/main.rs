//! # Bitor Server
//!
//! Control plane for ephemeral Nuclei scan infrastructure: renders per-job
//! automation inputs, drives `ansible-playbook` through generate, deploy
//! and teardown, and accepts telemetry from the running scanners.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bitor_core::clock::SystemTimeProvider;
use bitor_core::database::{InMemoryStore, SeedData};
use bitor_core::ports::{JobStore, RecordStore, TracingNotifier};
use bitor_core::pricing::DigitalOceanPricing;
use bitor_core::secrets::{AnsibleVault, MasterKeyCipher, verify_master_key};
use bitor_core::workspace::GENERATE_PLAYBOOK;
use bitor_server::infra::app_state::{AppState, StateParts};
use bitor_server::infra::config::{Cli, Config};
use bitor_server::{routes, tasks};

type Stores = (Arc<dyn JobStore>, Arc<dyn RecordStore>);

async fn open_stores(config: &Config, cipher: &MasterKeyCipher) -> anyhow::Result<Stores> {
    if let Some(url) = config.database_url.as_deref() {
        #[cfg(feature = "database")]
        {
            let store = Arc::new(
                bitor_core::database::PostgresStore::connect(url, 10)
                    .await
                    .context("failed to connect to PostgreSQL")?,
            );
            info!("using PostgreSQL record store");
            let jobs: Arc<dyn JobStore> = store.clone();
            let records: Arc<dyn RecordStore> = store;
            return Ok((jobs, records));
        }
        #[cfg(not(feature = "database"))]
        {
            let _ = url;
            warn!("DATABASE_URL is set but this build has no `database` feature; using the in-memory store");
        }
    }

    let store = match config.seed_file.as_deref() {
        Some(path) => {
            let seed = SeedData::from_file(path)
                .await
                .with_context(|| format!("failed to read seed file {}", path.display()))?;
            info!(path = %path.display(), "seeding in-memory record store");
            InMemoryStore::from_seed(seed, cipher).await?
        }
        None => InMemoryStore::new(),
    };
    warn!("using the in-memory record store; state is lost on restart");
    let store = Arc::new(store);
    let jobs: Arc<dyn JobStore> = store.clone();
    let records: Arc<dyn RecordStore> = store;
    Ok((jobs, records))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Override via RUST_LOG.
                "info,bitor=info,tower_http=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_args(cli.serve).context("invalid configuration")?;
    info!(config = ?config, "configuration loaded");

    tokio::fs::create_dir_all(config.ansible_base_path.join("scans"))
        .await
        .with_context(|| {
            format!(
                "failed to create scans directory under {}",
                config.ansible_base_path.display()
            )
        })?;
    if !config.ansible_base_path.join(GENERATE_PLAYBOOK).is_file() {
        warn!(
            base = %config.ansible_base_path.display(),
            "{GENERATE_PLAYBOOK} not found; scan generation will fail until it exists"
        );
    }

    let cipher = MasterKeyCipher::new(&config.master_key)?;
    let (jobs, records) = open_stores(&config, &cipher).await?;
    verify_master_key(&cipher, records.as_ref())
        .await
        .context("master key check failed")?;

    let pricing = DigitalOceanPricing::new(&config.digitalocean_api_base)?;
    let parts = StateParts {
        jobs,
        records,
        cipher,
        vault: Arc::new(AnsibleVault::new(&config.vault_bin)),
        pricing: Arc::new(pricing),
        notifier: Arc::new(TracingNotifier),
        clock: Arc::new(SystemTimeProvider),
    };
    let addr = config.socket_addr()?;
    let sweep_interval = config.cost_sweep_interval;
    let state = AppState::new(config, parts);

    if let Some(every) = sweep_interval {
        tasks::spawn_maintenance(state.clone(), every);
        info!(interval = ?every, "cost sweep enabled");
    }

    let router = routes::create_router(state);
    info!("Starting Bitor server on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
