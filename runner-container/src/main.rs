use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use order_ingest_core::checkpoint::{CheckpointCoordinator, CheckpointStore};
use order_ingest_core::config::{PipelineConfig, SinkKind, load_config};
use order_ingest_core::decode::XmlOrderDecoder;
use order_ingest_core::pipeline::Pipeline;
use order_ingest_core::processor::BatchProcessor;
use order_ingest_core::sink::OrderSink;
use order_ingest_core::sink::memory::MemoryOrderSink;
use order_ingest_core::sink::sqlite::SqliteOrderSink;
use order_ingest_core::source::kafka::KafkaSource;
use order_ingest_core::state::open_backend;
use order_ingest_core::supervisor::{RestartPolicy, RestartSupervisor};
use order_ingest_core::telemetry::{IngestMetrics, init_tracing};
use order_ingest_core::validate::OrderValidator;
use order_ingress::kafka::KafkaPublisher;

/// Entry point for running the ingestion pipeline as a long-lived container
/// workload.
///
/// High-level:
///     Load and validate config.
///     Optionally serve the HTTP submission surface next to the pipeline.
///     Run the pipeline under the restart supervisor until a shutdown
///     signal arrives or the restart budget is exhausted.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref()).await?;
    config.validate()?;

    let metrics = Arc::new(IngestMetrics::default());
    let sink = build_sink(&config)?;
    let store = CheckpointStore::open(&config.checkpoint.dir)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, draining pipeline");
            let _ = shutdown_tx.send(true);
        }
    });

    if let Some(ingress) = &config.ingress {
        let publisher = Arc::new(KafkaPublisher::new(
            &config.kafka.bootstrap_servers,
            &config.kafka.topic,
        )?);
        let bind_addr = ingress.bind_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = order_ingress::serve(&bind_addr, publisher).await {
                error!(error = %e, "ingress server exited");
            }
        });
    }

    let (supervisor, _run_state_rx) = RestartSupervisor::new(RestartPolicy::from(&config.restart));
    let run_state = supervisor.state_handle();

    let result = supervisor
        .supervise(metrics.clone(), |attempt| {
            let config = config.clone();
            let sink = sink.clone();
            let store = store.clone();
            let metrics = metrics.clone();
            let run_state = run_state.clone();
            let shutdown_rx = shutdown_rx.clone();
            async move {
                info!(attempt, "assembling pipeline");
                let latest = store.latest()?;
                let mut coordinator = CheckpointCoordinator::new(
                    store,
                    config.checkpoint.clone(),
                    chrono::Utc::now().timestamp_millis(),
                );
                if let Some(record) = &latest {
                    coordinator = coordinator.resume_after(record);
                }

                let backend = open_backend(&config.state);
                let source = KafkaSource::new(&config.kafka).await?;
                let processor = BatchProcessor::new(XmlOrderDecoder, OrderValidator, sink);

                let mut pipeline = Pipeline::new(
                    &config.window,
                    source,
                    processor,
                    backend,
                    coordinator,
                    metrics,
                    run_state,
                );
                if let Some(record) = &latest {
                    pipeline.restore(record)?;
                }
                pipeline.run(shutdown_rx).await
            }
        })
        .await;

    match result {
        Ok(()) => {
            info!(metrics = ?metrics.snapshot(), "order ingestion stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "order ingestion halted");
            Err(e.into())
        }
    }
}

fn build_sink(config: &PipelineConfig) -> Result<Arc<dyn OrderSink>> {
    match config.sink.kind {
        SinkKind::Sqlite => {
            let path = config
                .sink
                .path
                .as_ref()
                .context("sqlite sink requires a database path")?;
            Ok(Arc::new(SqliteOrderSink::open(path)?))
        }
        SinkKind::Memory => {
            warn!("using the in-memory sink, persisted orders are lost on exit");
            Ok(Arc::new(MemoryOrderSink::new()))
        }
    }
}
