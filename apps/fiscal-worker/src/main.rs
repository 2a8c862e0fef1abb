//! # Fiscal Worker
//!
//! Runs the retry scheduler until interrupted.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  1. Load GatewayConfig (file from FISCAL_CONFIG or platform dir + env)  │
//! │  2. Install the secret key (refuse to start without one when strict)    │
//! │  3. Open SQLite, retrying with exponential backoff                      │
//! │  4. Load or create the RSA signing key                                  │
//! │  5. Pick the authority client: mock or live                             │
//! │  6. Run RetryScheduler until Ctrl+C / SIGTERM                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use backoff::ExponentialBackoff;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fiscal_db::{Database, DbConfig};
use fiscal_gateway::secret::install_process_key;
use fiscal_gateway::signing::DEFAULT_KEY_BITS;
use fiscal_gateway::{
    AuthorityGateway, AuthorityMode, GatewayConfig, LiveGateway, MockGateway, MockIdentityRegistry,
    PayloadSigner, RetryOrchestrator, RetryScheduler, SecretKey, SubmissionService,
    TracingAuditLog,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fiscal=debug,sqlx=warn")),
        )
        .with_target(true)
        .init();

    info!("Starting fiscal worker...");

    let config_path = std::env::var_os("FISCAL_CONFIG").map(PathBuf::from);
    let config = GatewayConfig::load(config_path).context("loading configuration")?;
    info!(
        mode = %config.authority.mode,
        workers = config.retry.workers,
        poll_interval_secs = config.retry.poll_interval_secs,
        max_attempts = config.retry.max_attempts,
        "Configuration loaded"
    );

    install_secret_key(&config)?;

    let db = Arc::new(connect_database(&config).await?);
    info!("Database ready");

    let signer = load_signer(&config)?;
    let gateway = build_gateway(&config)?;
    info!(gateway = gateway.name(), "Authority client ready");

    let service = SubmissionService::from_config(db.clone(), gateway, Arc::new(signer), &config);
    let orchestrator = RetryOrchestrator::from_config(service, &config);
    let (scheduler, handle) = RetryScheduler::new(orchestrator, config.poll_interval());
    let scheduler_task = tokio::spawn(scheduler.run());

    shutdown_signal().await;

    handle.shutdown().await.context("stopping scheduler")?;
    scheduler_task.await.context("joining scheduler")?;
    db.close().await;

    info!("Worker shutdown complete");
    Ok(())
}

/// Loads the secret key, creating one when allowed.
fn install_secret_key(config: &GatewayConfig) -> anyhow::Result<()> {
    let strict = config.security.strict_secret_key;

    let Some(path) = config.security.secret_key_path.as_ref() else {
        if strict {
            bail!("security.secret_key_path is required when strict_secret_key is on");
        }
        warn!("No secret key configured; device activation will fail until one is set");
        return Ok(());
    };

    let key = if path.exists() {
        SecretKey::load(path).with_context(|| format!("reading secret key {}", path.display()))?
    } else if strict {
        bail!("secret key file {} does not exist", path.display());
    } else {
        let key = SecretKey::generate();
        key.save(path)
            .with_context(|| format!("writing secret key {}", path.display()))?;
        warn!(path = %path.display(), "Generated a new secret key");
        key
    };

    install_process_key(&key);
    Ok(())
}

async fn connect_database(config: &GatewayConfig) -> anyhow::Result<Database> {
    let path = config
        .database_path()
        .context("no database path configured and no platform data directory")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let db_config = DbConfig::new(&path).max_connections(config.database.max_connections);
    let policy = ExponentialBackoff {
        initial_interval: Duration::from_millis(500),
        max_interval: Duration::from_secs(10),
        max_elapsed_time: Some(Duration::from_secs(60)),
        ..Default::default()
    };

    let db = backoff::future::retry(policy, || {
        let db_config = db_config.clone();
        async move {
            Database::new(db_config).await.map_err(|e| {
                if e.is_transient() {
                    warn!(error = %e, "Database not ready, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
    .with_context(|| format!("opening database {}", path.display()))?;

    Ok(db)
}

fn load_signer(config: &GatewayConfig) -> anyhow::Result<PayloadSigner> {
    let (private, public) = config
        .signing_key_paths()
        .context("no signing key path configured and no platform data directory")?;
    if let Some(parent) = private.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    PayloadSigner::load_or_generate(&private, &public, DEFAULT_KEY_BITS)
        .with_context(|| format!("loading signing key {}", private.display()))
}

fn build_gateway(config: &GatewayConfig) -> anyhow::Result<Arc<dyn AuthorityGateway>> {
    match config.authority.mode {
        AuthorityMode::Mock => {
            let registry = MockIdentityRegistry::with_tins(config.mock.registered_tins.clone());
            if config.mock.registered_tins.is_empty() {
                warn!("Mock authority has no registered identities; every call will fail");
            }
            Ok(Arc::new(MockGateway::new(Arc::new(registry))))
        }
        AuthorityMode::Live => {
            let live = LiveGateway::from_settings(&config.authority, Arc::new(TracingAuditLog))
                .context("configuring live authority client")?;
            Ok(Arc::new(live))
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
