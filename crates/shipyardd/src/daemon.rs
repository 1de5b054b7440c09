//! Assembles the subsystems and runs until Ctrl-C.

use std::sync::Arc;

use shipyard_api::{ApiState, build_router};
use shipyard_core::{Context, ShipyardConfig, new_id};
use shipyard_state::StateStore;
use shipyard_supervisor::{
    Backends, DryRunBackend, Scheduler, SchedulerTiming, SupervisorDeps, standard_supervisors,
    supervisors::HttpWebhookSender,
};
use tracing::{info, warn};

pub async fn run(config: ShipyardConfig) -> anyhow::Result<()> {
    let instance_id = config
        .instance_id()
        .unwrap_or_else(|| format!("shipyardd-{}", &new_id()[..8]));
    let ctx = Context::system(instance_id);
    info!(instance = %ctx.instance_id(), "Shipyard daemon starting");

    // ── State store ────────────────────────────────────────────

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("shipyard.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Supervisors ────────────────────────────────────────────

    // No cloud backend ships with the daemon; clusters are provisioned
    // against local bookkeeping only.
    let backend = Arc::new(DryRunBackend::new(store.clone()));
    warn!("using the dry-run provisioning backend");
    let deps = SupervisorDeps::new(
        store,
        Backends::from_single(backend),
        ctx.clone(),
        config.stuck_warning_after(),
    );
    let webhooks = Arc::new(HttpWebhookSender::new(config.webhook_delivery_timeout()));
    let supervisors = standard_supervisors(&deps, &config, webhooks);
    let scheduler = Scheduler::start(&ctx, supervisors, SchedulerTiming::from_config(&config));

    // ── API server ─────────────────────────────────────────────

    let state = ApiState::new(deps, scheduler.clone(), config.deletion_pending_time());
    let router = build_router(state);
    let listen = config.listen();
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(addr = %listen, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.close();
    scheduler.join().await;
    info!("Shipyard daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C, shutting down");
    }
    info!("shutdown signal received");
}
