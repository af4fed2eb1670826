use futures::future::join_all;
use haulflow_core::SystemClock;
use haulflow_engine::db::{DefinitionRepository, PgQueryService, PgStateStore, sync_definitions};
use haulflow_engine::{DaemonError, EngineConfig, TmsApi};
use haulflow_events::{CatalogTriggerManager, EventBus, NatsEventSource};
use haulflow_integration::{ConcurrencyLimiter, HttpClient, Ports, ReqwestHttpClient};
use haulflow_workflow::{
    ActionRegistry, DefinitionCatalog, Engine, Runtime, TimerLoop, Worker, register_builtins,
};
use rootcause::prelude::Report;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Report<DaemonError>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,haulflow=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_file = std::env::var_os("HAULFLOW_CONFIG").map(PathBuf::from);
    let config = EngineConfig::load(config_file.as_deref()).map_err(DaemonError::from)?;
    info!("loaded configuration");

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database_url)
        .await
        .map_err(|e| DaemonError::Database {
            reason: e.to_string(),
        })?;

    info!("running database migrations");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| DaemonError::Migration {
            reason: e.to_string(),
        })?;

    // Ports
    let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new(reqwest::Client::new()));
    let tms = Arc::new(TmsApi::new(Arc::clone(&http), config.tms.clone()));
    let ports = Ports {
        shipments: tms.clone(),
        notifier: tms.clone(),
        http,
        billing: tms.clone(),
        documents: tms.clone(),
        approvals: tms,
        queries: Arc::new(PgQueryService::new(
            pool.clone(),
            config.database.query_timeout(),
        )),
    };

    let mut registry = ActionRegistry::new();
    register_builtins(
        &mut registry,
        ports.clone(),
        Arc::new(ConcurrencyLimiter::new(config.limits.clone())),
    )
    .map_err(|e| DaemonError::Registry {
        reason: e.to_string(),
    })?;
    registry.freeze();
    let registry = Arc::new(registry);

    // Definitions
    let catalog = Arc::new(DefinitionCatalog::new());
    let triggers = Arc::new(CatalogTriggerManager::new(Arc::clone(&catalog)));
    let definitions = DefinitionRepository::new(pool.clone());
    let stored = definitions
        .list_all()
        .await
        .map_err(|e| DaemonError::Definitions {
            reason: e.to_string(),
        })?;
    let summary = sync_definitions(stored, &registry, &triggers).await;
    info!(
        published = summary.published,
        invalid = summary.invalid,
        "loaded workflow definitions"
    );

    // Runtime
    let store = Arc::new(PgStateStore::new(pool.clone()));
    let clock = SystemClock::shared();
    let runtime = Arc::new(Runtime::new(
        store.clone(),
        catalog,
        Arc::clone(&registry),
        ports.approvals.clone(),
        Arc::clone(&clock),
        config.runtime.clone(),
    ));
    let engine = Engine::new(Arc::clone(&runtime));

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();
    let workers = config.runtime.worker_count.max(1);
    for _ in 0..workers {
        let worker = Worker::new(Arc::clone(&runtime));
        tasks.push(tokio::spawn(worker.run(shutdown.clone())));
    }
    let timers = TimerLoop::new(store, clock, config.runtime.timer_batch);
    tasks.push(tokio::spawn(
        timers.run(config.runtime.timer_interval(), shutdown.clone()),
    ));
    tasks.push(tokio::spawn(refresh_definitions(
        definitions,
        registry,
        Arc::clone(&triggers),
        config.definitions.refresh_interval(),
        shutdown.clone(),
    )));

    // Events
    let bus = Arc::new(EventBus::new(engine.clone(), triggers, config.bus.clone()));
    let (lanes, lane_tasks) = bus.spawn_lanes(&shutdown);
    tasks.extend(lane_tasks);

    if config.nats.enabled {
        let url = config.nats.url.clone();
        let source = NatsEventSource::connect(config.nats.clone())
            .await
            .map_err(|report| {
                report.context(DaemonError::Events {
                    reason: format!("cannot consume from {url}"),
                })
            })?;
        let stop = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(report) = source.run(lanes, engine, stop.clone()).await {
                error!(error = %report, "event source stopped, shutting down");
                stop.cancel();
            }
        }));
    } else {
        warn!("NATS ingestion disabled, no events will be consumed");
    }

    info!(workers, "engine running");
    tokio::select! {
        () = shutdown_signal() => info!("shutdown requested"),
        () = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    for joined in join_all(tasks).await {
        if let Err(e) = joined {
            error!(error = %e, "task failed during shutdown");
        }
    }
    pool.close().await;
    info!("engine stopped");
    Ok(())
}

/// Re-reads published definitions so new versions and retirements take
/// effect without a restart.
async fn refresh_definitions(
    repository: DefinitionRepository,
    registry: Arc<ActionRegistry>,
    triggers: Arc<CatalogTriggerManager>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; startup already synced.
    ticker.tick().await;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match repository.list_all().await {
            Ok(stored) => {
                let summary = sync_definitions(stored, &registry, &triggers).await;
                if summary.retired > 0 || summary.invalid > 0 {
                    info!(
                        retired = summary.retired,
                        invalid = summary.invalid,
                        "definitions refreshed"
                    );
                }
            }
            Err(e) => warn!(error = %e, "failed to reload definitions"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
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
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
