use std::sync::Arc;

use anyhow::{Context, Error};
use envconfig::Envconfig;
use lifecycle_common::aws::AwsClient;
use lifecycle_common::client::QueueDiscovery;
use lifecycle_common::service::SystemdService;
use lifecycle_manager::config::Config;
use lifecycle_manager::coordinator::Coordinator;
use lifecycle_manager::dispatcher::{notice_channel, Dispatcher};
use lifecycle_manager::handler::ServiceHandler;
use lifecycle_manager::health::HealthRegistry;
use lifecycle_manager::server::{self, AppState};
use lifecycle_manager::source::{QueueSource, SpotSource};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}

async fn start_server(config: &Config, state: AppState) -> Result<JoinHandle<()>, Error> {
    let shutdown = state.shutdown.clone();
    let mut router = server::router(state);
    if config.export_prometheus {
        router = server::setup_metrics_routes(router)
            .context("failed to install metrics recorder")?;
    }

    let bind = config.bind();
    let listener = server::bind(&bind)
        .await
        .with_context(|| format!("failed to bind probe server to {bind}"))?;
    Ok(tokio::spawn(async move {
        if let Err(error) = server::serve(listener, router, shutdown.clone()).await {
            error!(%error, "probe server failed, shutting down");
            shutdown.cancel();
        }
    }))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env().context("invalid configuration")?;
    let client = Arc::new(AwsClient::from_env(config.receive_options()).await);

    let queues = client
        .discover_hooks()
        .await
        .context("failed to discover lifecycle hooks")?;
    info!(count = queues.len(), "discovered lifecycle hook queues");

    let mut coordinator = Coordinator::new();
    coordinator
        .trap_signals()
        .context("failed to install signal handlers")?;

    let liveness = HealthRegistry::new("liveness");
    let probe_server = start_server(
        &config,
        AppState {
            liveness: liveness.clone(),
            shutdown: coordinator.shutdown_token(),
        },
    )
    .await?;

    let deadline = config.health_deadline.0;
    let (notices, receiver) = notice_channel();

    let spot = SpotSource::new(
        client.clone(),
        notices.clone(),
        config.spot_interval.0,
        liveness.register("spot", deadline),
    );
    coordinator.spawn_source(Box::new(spot));
    for queue in queues {
        let name = format!("queue {}", queue.name);
        let source = QueueSource::new(
            client.clone(),
            queue,
            notices.clone(),
            config.queue_error_backoff.0,
            liveness.register(&name, deadline),
        );
        info!(source = %name, "starting event source");
        coordinator.spawn_source(Box::new(source));
    }
    drop(notices);

    let service = Arc::new(SystemdService::new(config.service.as_str()));
    let handler = ServiceHandler::new(service, client, config.heartbeat_interval.0);
    let dispatcher = Dispatcher::new(receiver, handler);

    let result = coordinator.run(dispatcher).await;
    if let Err(error) = probe_server.await {
        error!(%error, "probe server task failed");
    }

    result.context("lifecycle manager stopped with an error")?;
    info!("lifecycle manager stopped");
    Ok(())
}
