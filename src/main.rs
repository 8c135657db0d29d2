use crate::controller::{Controller, ControllerSettings};
use crate::registry::RegistryResolver;
use crate::rollout::{KubeRolloutSource, NamespaceScope};
use crate::state::AppState;
use kube::Client;
use std::env;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;
mod controller;
mod error;
mod image_reference;
mod registry;
mod rollout;
mod schedule;
mod secret_string;
mod state;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting reroller {}", env!("CARGO_PKG_VERSION"));

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    let config = config::load_config(&config_path)?;

    let kube_client = create_kube_client().await?;
    let http_client = registry::create_client(&config)?;
    let resolver = RegistryResolver::from_config(&config, &http_client);
    info!("Resolving digests for registries {}", resolver.hosts().join(", "));

    let source = KubeRolloutSource::new(kube_client, NamespaceScope::from_patterns(&config.namespaces)?);
    let settings = ControllerSettings::from(&config);
    if settings.dry_run {
        info!("Dry run enabled, rollouts will not be restarted");
    }
    let controller = Arc::new(Controller::new(Arc::new(source), Arc::new(resolver), settings));
    let state = AppState::default();
    let in_flight = Arc::new(Mutex::new(()));

    if config.run_once {
        run_pass(&controller, &state, &in_flight).await;
        return Ok(());
    }

    info!("Executing job scheduler at cron schedule {}", config.schedule);
    let mut scheduler = JobScheduler::new().await?;
    let job = {
        let controller = controller.clone();
        let state = state.clone();
        let in_flight = in_flight.clone();
        Job::new_async(config.schedule.as_str(), move |_uuid, _l| {
            let controller = controller.clone();
            let state = state.clone();
            let in_flight = in_flight.clone();
            Box::pin(async move {
                run_pass(&controller, &state, &in_flight).await;
            })
        })?
    };
    scheduler.add(job).await?;
    scheduler.start().await?;

    // Do not wait for the first cron tick before becoming ready
    tokio::spawn({
        let controller = controller.clone();
        let state = state.clone();
        let in_flight = in_flight.clone();
        async move { run_pass(&controller, &state, &in_flight).await }
    });

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
            shutdown.cancel();
        }
    });

    let app = webserver::create_app(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    scheduler.shutdown().await?;
    Ok(())
}

async fn create_kube_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}, default namespace {}",
        api_server_info.major,
        api_server_info.minor,
        client.default_namespace()
    );
    Ok(client)
}

/// Runs one pass unless another one is still in flight.
async fn run_pass(controller: &Controller, state: &AppState, in_flight: &Mutex<()>) {
    let Ok(_guard) = in_flight.try_lock() else {
        warn!("Previous reconciliation pass is still running, skipping this one");
        return;
    };

    let report = controller.run_once().await;
    info!(
        "Reconciliation pass finished: {} rollouts evaluated, {} restarted",
        report.rollouts.len(),
        report.restarted()
    );
    state.record(report).await;
}
