use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use pkg_api::{AppState, server};
use pkg_constants::engine::SHUTDOWN_GRACE;
use pkg_constants::network::DEFAULT_API_PORT;
use pkg_controllers::{Engine, PodLifecycleManager, ReplicaSetController, ServiceController};
use pkg_runtime::{PodmanRuntime, RuntimeAdapter};
use pkg_state::Store;

#[derive(Parser, Debug)]
#[command(name = "rudder-server", about = "rudder single-host container orchestrator")]
struct Cli {
    /// Port the REST API listens on
    #[arg(long, default_value_t = DEFAULT_API_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    info!("starting rudder-server");
    info!("  Port: {}", cli.port);

    // Startup order: store → runtime → engine → API.
    let store = Store::new();
    let runtime: Arc<dyn RuntimeAdapter> = Arc::new(PodmanRuntime::new());

    // State is in-memory only; containers left over from a previous
    // process are discarded, not adopted.
    match runtime.sweep_orphans().await {
        Ok(0) => {}
        Ok(count) => info!("discarded {} containers from a previous run", count),
        Err(err) => warn!("startup sweep failed: {}", err),
    }

    let engine = Engine::new(store.clone())
        .register(Arc::new(PodLifecycleManager::new(
            store.clone(),
            runtime.clone(),
        )))
        .register(Arc::new(ReplicaSetController::new(store.clone())))
        .register(Arc::new(ServiceController::new(
            store.clone(),
            runtime.clone(),
        )))
        .start();

    let state = AppState::new(store);
    state.mark_ready();

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    server::serve(addr, state, shutdown_signal()).await?;

    // Teardown in reverse: the listener is down, give in-flight
    // reconciles their grace window before abandoning them.
    engine.shutdown(SHUTDOWN_GRACE).await;
    info!("rudder-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to install ctrl-c handler: {}", err);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::level_filters::LevelFilter::INFO.into()),
        )
        .init();
}
