//! Flowline — marketing flow execution engine.
//!
//! Daemon entry point: wires the in-memory stores, spawns scheduler
//! workers, and serves Prometheus metrics until ctrl-c.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use flowline_core::config::AppConfig;
use flowline_core::types::{StoreId, SubscriberId};
use flowline_engine::{
    EngagementProfile, ExecutorRegistry, FlowEngine, LogExecutor, MemoryLedger,
    MemoryProfileStore, NodeEvaluator, StepScheduler,
};

#[derive(Parser, Debug)]
#[command(name = "flowline")]
#[command(about = "Marketing flow execution engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "FLOWLINE__NODE_ID")]
    node_id: Option<String>,

    /// Scheduler worker count (overrides config)
    #[arg(long, env = "FLOWLINE__ENGINE__WORKERS")]
    workers: Option<usize>,

    /// Worker poll interval in milliseconds (overrides config)
    #[arg(long, env = "FLOWLINE__ENGINE__POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Metrics port (overrides config)
    #[arg(long, env = "FLOWLINE__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Seed demo flows and enter demo subscribers
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowline=info,flowline_engine=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Flowline starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(workers) = cli.workers {
        config.engine.workers = workers;
    }
    if let Some(poll_interval_ms) = cli.poll_interval_ms {
        config.engine.poll_interval_ms = poll_interval_ms;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }

    info!(
        node_id = %config.node_id,
        workers = config.engine.workers,
        poll_interval_ms = config.engine.poll_interval_ms,
        metrics_port = config.metrics.port,
        "Configuration loaded"
    );

    // In-memory stores; durable implementations slot in behind the same
    // traits.
    let ledger = Arc::new(MemoryLedger::new());
    let profiles = Arc::new(MemoryProfileStore::new());

    let mut executors = ExecutorRegistry::new();
    executors.register_all(Arc::new(LogExecutor));

    let engine = FlowEngine::new(ledger.clone());
    let evaluator = Arc::new(
        NodeEvaluator::new(Arc::new(executors), profiles.clone())
            .with_action_timeout(std::time::Duration::from_millis(
                config.engine.action_timeout_ms,
            ))
            .with_search_horizon(config.send_time.search_horizon_days),
    );
    let scheduler = Arc::new(StepScheduler::new(
        ledger,
        engine.registry(),
        evaluator,
        config.engine.clone(),
    ));

    start_metrics(&config)?;

    if cli.seed_demo {
        seed_demo(&engine, &profiles).await;
    }

    let handle = scheduler.spawn_workers();
    info!("Flowline is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handle.shutdown().await;

    Ok(())
}

/// Start the Prometheus exporter on the configured port.
fn start_metrics(config: &AppConfig) -> anyhow::Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let handle = builder
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], config.metrics.port)))
        .install_recorder()?;

    info!(port = config.metrics.port, "Metrics exporter started");

    // Keep the handle alive
    std::mem::forget(handle);
    Ok(())
}

/// Seeds an engagement profile, the demo flows, and a few subscribers so
/// the scheduler has work to chew on.
async fn seed_demo(engine: &FlowEngine, profiles: &MemoryProfileStore) {
    let store = StoreId::from("store-demo");

    // Engagement peaks mid-morning and early evening.
    let mut rates = [0.02_f32; 24];
    for hour in [9, 10, 19, 20] {
        rates[hour] = 0.3;
    }
    profiles.upsert(EngagementProfile::new(store.clone(), rates));

    for flow_id in engine.seed_demo_flows(&store) {
        for i in 0..3 {
            let tier = if i == 0 { "vip" } else { "standard" };
            let context = serde_json::json!({
                "subscriber": { "tier": tier, "tags": [] },
                "event": {}
            });
            let subscriber = SubscriberId::new(format!("demo-sub-{i}"));
            if let Err(e) = engine.start_execution(flow_id, subscriber, context).await {
                warn!(error = %e, "Demo execution failed to start");
            }
        }
    }
}
