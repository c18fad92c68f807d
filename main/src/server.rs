use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{extract::FromRef, Router};
use common::{
    backends::{registry::BackendRegistry, EmbeddingModality},
    error::AppError,
    storage::db::SurrealDbClient,
    utils::config::get_config,
};
use consolidation_pipeline::ConsolidationEngine;
use ingestion_pipeline::IngestionPipeline;
use retrieval_pipeline::RetrievalEngine;
use rpc_router::{rpc_routes_v1, session_channel, RpcState};
use storage_coordinator::{CoordinatorSettings, StorageCoordinator};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Bound on reconcile-queue draining during shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );

    let registry = Arc::new(BackendRegistry::new(
        &config.backends,
        &config.reranking,
        &config.data_dir,
    ));

    // Warm the bound embedding backends once; their dimensions drive the
    // vector schema. Unbound modalities simply do not get a collection.
    let mut embedding_dimensions = HashMap::new();
    for modality in EmbeddingModality::ALL {
        match registry.embedding(modality).await {
            Ok(backend) => {
                info!(
                    modality = %modality,
                    backend = backend.id(),
                    dimension = backend.dimension(),
                    "embedding modality ready"
                );
                embedding_dimensions.insert(modality, backend.dimension());
            }
            Err(AppError::CapabilityUnavailable(capability)) => {
                debug!(%capability, "embedding modality not bound; skipping");
            }
            Err(err) => return Err(err.into()),
        }
    }

    let coordinator = Arc::new(StorageCoordinator::with_surreal_tiers(
        Arc::clone(&db),
        config.cache.capacity,
        Duration::from_secs(config.cache.ttl_secs),
        embedding_dimensions,
        CoordinatorSettings::default(),
    ));
    // Schema readiness gates startup; a half-built store is refused.
    coordinator.ensure_ready().await?;

    let pipeline = IngestionPipeline::new(
        Arc::clone(&coordinator),
        Arc::clone(&registry),
        config.ingest.clone(),
    );
    let retrieval = Arc::new(RetrievalEngine::new(
        Arc::clone(&coordinator),
        Arc::clone(&registry),
        config.retrieval.clone(),
        &config.reranking,
    ));
    let consolidation = Arc::new(ConsolidationEngine::new(
        Arc::clone(&coordinator),
        Arc::clone(&registry),
        config.consolidation.clone(),
    ));

    let (session_events, mut session_rx) = session_channel(256);
    tokio::spawn(async move {
        // Best-effort enrichment hook: today the events are only observed.
        while let Some(event) = session_rx.recv().await {
            debug!(event_type = %event.event_type, "session event received");
        }
    });

    let maintenance_token = CancellationToken::new();
    spawn_maintenance_loop(
        Arc::clone(&coordinator),
        Arc::clone(&consolidation),
        Duration::from_secs(config.vacuum.interval_secs),
        Duration::from_secs(
            u64::try_from(config.vacuum.grace_window_days).unwrap_or(14) * 24 * 60 * 60,
        ),
        maintenance_token.clone(),
    );

    let rpc_state = RpcState {
        pipeline: Arc::clone(&pipeline),
        retrieval,
        coordinator: Arc::clone(&coordinator),
        registry: Arc::clone(&registry),
        session_events,
    };
    let app = Router::new()
        .nest("/api/v1", rpc_routes_v1(&rpc_state))
        .with_state(AppState { rpc_state });

    let serve_address = format!("127.0.0.1:{}", config.http_port);
    info!("Starting server listening on {serve_address}");
    let listener = tokio::net::TcpListener::bind(serve_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Ordered shutdown: the listener above has already stopped accepting
    // work; cancel tasks, drain queues, close backends, close stores.
    info!("Shutting down");
    maintenance_token.cancel();
    pipeline.shutdown();
    if !coordinator.drain(DRAIN_DEADLINE).await {
        warn!("reconcile queues did not fully drain before the deadline");
    }
    registry.shutdown().await;
    coordinator.shutdown();

    Ok(())
}

fn spawn_maintenance_loop(
    coordinator: Arc<StorageCoordinator>,
    consolidation: Arc<ConsolidationEngine>,
    interval: Duration,
    grace: Duration,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + interval,
            interval,
        );
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = tick.tick() => {
                    match coordinator.vacuum(grace).await {
                        Ok(purged) if !purged.is_empty() => {
                            info!(purged = purged.len(), "vacuum pass complete");
                        }
                        Ok(_) => debug!("vacuum pass found nothing to purge"),
                        Err(err) => warn!(error = %err, "vacuum pass failed"),
                    }

                    match consolidation.run_once().await {
                        Ok(report) if report.judged > 0 => {
                            info!(
                                judged = report.judged,
                                superseded = report.superseded,
                                merged = report.merged,
                                "consolidation pass complete"
                            );
                        }
                        Ok(_) => debug!("consolidation pass found no candidate pairs"),
                        Err(AppError::CapabilityUnavailable(capability)) => {
                            debug!(%capability, "consolidation skipped; capability unbound");
                        }
                        Err(err) => warn!(error = %err, "consolidation pass failed"),
                    }
                }
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
}

#[derive(Clone, FromRef)]
struct AppState {
    rpc_state: RpcState,
}
