use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use everruns_task_manager::prelude::*;
use everruns_task_manager::telemetry::{init_telemetry, TelemetryConfig};

const HEARTBEAT_TASK: &str = "task_manager:heartbeat";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let node_id = std::env::var("TASK_MANAGER_NODE_ID")
        .unwrap_or_else(|_| format!("node-{}", uuid::Uuid::now_v7()));

    // Configure via environment variables:
    // - OTEL_EXPORTER_OTLP_ENDPOINT: OTLP endpoint (e.g., "http://localhost:4317")
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "everruns_task_manager=info")
    let mut telemetry_config = TelemetryConfig::from_env();
    telemetry_config.instance_id = Some(node_id.clone());
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("everruns_task_manager=info".to_string());
    }
    let _telemetry_guard = init_telemetry(telemetry_config);

    let config = TaskManagerConfig::from_env();

    let store: Arc<dyn TaskDocumentStore> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let store = PostgresTaskDocumentStore::connect(&database_url, 10)
                .await
                .context("Failed to connect to task store")?;
            store.migrate().await.context("Failed to run migrations")?;
            Arc::new(store)
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, tasks are kept in memory");
            Arc::new(InMemoryTaskDocumentStore::new())
        }
    };

    let mut manager = TaskManager::setup(config, node_id).context("Invalid configuration")?;
    manager.register_task_definition(
        TaskDefinition::new(HEARTBEAT_TASK, |ctx: RunContext| async move {
            let beats = ctx.state["beats"].as_u64().unwrap_or(0) + 1;
            tracing::info!(beats, "heartbeat");
            Ok(RunResult::done().with_state(serde_json::json!({ "beats": beats })))
        })
        .with_title("Node heartbeat")
        .with_timeout(Duration::from_secs(10)),
    )?;

    let started = manager.start(store).context("Failed to start task manager")?;
    started
        .ensure_scheduled(
            NewTask::new(HEARTBEAT_TASK)
                .with_id(HEARTBEAT_TASK)
                .with_schedule(Interval::parse("1m")?),
        )
        .await?;

    tracing::info!(node_id = %started.node_id(), "task manager node running");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Received shutdown signal");
    started.shutdown().await;
    Ok(())
}
