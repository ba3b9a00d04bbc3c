//! `trinityd` - the Trinity control-plane daemon

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use trinity_core::envelope::CredentialCipher;
use trinity_runtime::{
    ActivityService, ContainerDriver, CredentialService, DockerDriver, ExecutionQueue,
    HttpAgentTransport, LifecycleConfig, LifecycleManager, LockManager, PermissionResolver,
    RedisBackend, Scheduler,
};
use trinity_server::auth::JwtKeys;
use trinity_server::{routes, AppState, ServerConfig};
use trinity_store::StateStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ServerConfig::from_env().context("configuration")?;
    let store = StateStore::open(&config.db_path).context("state store")?;

    // One-shot maintenance mode, then exit
    if std::env::args().any(|arg| arg == "--migrate-passwords") {
        let migrated = store.migrate_plaintext_passwords()?;
        tracing::info!(migrated, "password migration complete");
        return Ok(());
    }

    let backend = Arc::new(
        RedisBackend::connect(&config.redis_url)
            .await
            .context("redis")?,
    );
    let driver: Arc<dyn ContainerDriver> =
        Arc::new(DockerDriver::connect().context("container engine")?);
    let transport: Arc<dyn trinity_runtime::AgentTransport> = Arc::new(HttpAgentTransport::new());

    let queue = ExecutionQueue::new(backend.clone());
    let activity = ActivityService::new(store.clone());
    let resolver = PermissionResolver::new(store.clone());
    let cipher = CredentialCipher::from_hex(&config.credential_key_hex)
        .map_err(trinity_core::Error::from)?;
    let credentials = Arc::new(CredentialService::new(cipher, transport.clone()));

    let lifecycle = Arc::new(LifecycleManager::new(
        driver,
        transport.clone(),
        store.clone(),
        queue.clone(),
        activity.clone(),
        LifecycleConfig {
            image: config.agent_image.clone(),
            network: config.agent_network.clone(),
            templates_dir: config.templates_dir.clone(),
            mcp_url: config.mcp_url.clone(),
            otel_env: config.otel_env.clone(),
        },
    ));

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        queue.clone(),
        LockManager::new(backend.clone()),
        transport,
        activity.clone(),
    ));

    // The admin account backs system-agent ownership; first boot seeds
    // it with a random password the operator resets via the API.
    if store.get_user("admin")?.is_none() {
        let initial: String = {
            use rand::RngCore;
            let mut bytes = [0u8; 16];
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            hex::encode(bytes)
        };
        store.ensure_user("admin", &initial, "admin")?;
        tracing::warn!(password = %initial, "seeded admin account; change this password");
    }

    if let Err(e) = lifecycle.ensure_system_agent().await {
        tracing::error!(error = %e, "system agent supervision failed; continuing degraded");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown_rx));

    let state = AppState {
        store,
        queue,
        lifecycle,
        scheduler,
        resolver,
        activity,
        credentials,
        jwt: JwtKeys::new(&config.jwt_secret),
    };
    let app = routes::build(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "trinityd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("server")?;

    // Stop dispatching; in-flight submits already drained with the
    // server. Queue state lives in the backend, containers keep running.
    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;
    Ok(())
}
