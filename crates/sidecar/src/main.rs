//! WASM execution sidecar
//!
//! Runs next to a function container, executing pre-compiled WASM modules
//! per HTTP request inside per-request threaded cgroups, while reporting
//! readiness and streaming CPU telemetry to the queue proxy.

use anyhow::{Context, Result};
use sidecar_lib::cgroup::{self, CgroupManager, CgroupPaths};
use sidecar_lib::metrics::{CpuUtilizationTracker, MetricsReporter, ReporterConfig};
use sidecar_lib::observability::{SidecarMetrics, StructuredLogger};
use sidecar_lib::readiness::{ReadinessConfig, ReadinessController};
use sidecar_lib::wasm::{self, RunnerConfig};
use sidecar_lib::RequestExecutor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wasm_sidecar::{api, config};

const SIDECAR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // LOG_LEVEL drives the filter before the full configuration is parsed.
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_default();
    init_tracing(&log_level);

    let config = config::SidecarConfig::load()?;

    let cgroup_root = Path::new(cgroup::DEFAULT_CGROUP_ROOT);
    let container_id = cgroup::discover_container_id(cgroup_root, &config.pod_uid)
        .await
        .context("failed to discover container identity")?;
    info!(pod_uid = %config.pod_uid, container_id = %container_id, "resolved pod identity");

    let paths = CgroupPaths::new(cgroup_root, &config.pod_uid, container_id);
    let cgroups = Arc::new(CgroupManager::new(paths));
    cgroups.init();

    let runner = wasm::create_runner(&RunnerConfig {
        runtime: config.wasm_runtime.clone(),
        modules_dir: wasm::DEFAULT_MODULES_DIR.into(),
        mem_pre_allocation_ratio: config.mem_pre_allocation_ratio,
    });

    let metrics = SidecarMetrics::new();
    metrics.set_runtime(runner.name());

    let logger = StructuredLogger::new(&config.pod_uid);
    logger.log_startup(SIDECAR_VERSION, runner.name());

    let executor = Arc::new(RequestExecutor::new(cgroups.clone(), runner));
    let readiness = Arc::new(ReadinessController::new(
        cgroups.clone(),
        ReadinessConfig {
            memory_limit_mb: config.memory_limit,
            window: config.readiness_window,
            utilization_threshold: config.readiness_utilization_treshold,
            rand_threshold: config.readiness_rand_treshold,
            gc_utilization_threshold: config.gc_utilization_treshold,
        },
    ));

    let tracker = CpuUtilizationTracker::new(cgroups.clone(), config.metrics_collection_window);
    let reporter = MetricsReporter::new(
        ReporterConfig {
            reporting_period: Duration::from_millis(config.reporting_period_ms),
            qp_host: config.qp_host.clone(),
            qp_port: config.qp_port,
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_sec),
        },
        tracker,
    );
    tokio::spawn(reporter.run());
    info!("started the metrics reporter");

    let state = Arc::new(api::AppState {
        executor,
        readiness,
        metrics,
        pod_uid: config.pod_uid.clone(),
        strict_validation: config.strict_request_validation,
    });

    let health_addr = format!("{}:{}", config.healthcheck_host, config.healthcheck_port);
    tokio::spawn(api::serve_health(health_addr, state.clone()));

    let data_addr = format!("{}:{}", config.webserver_host, config.webserver_port);
    tokio::spawn(api::serve_data(data_addr, state.clone()));
    info!(
        pid = std::process::id(),
        cgroup = %cgroups.container_dir().display(),
        "started the web server"
    );

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => logger.log_shutdown("SIGINT received"),
        _ = sigterm.recv() => logger.log_shutdown("SIGTERM received"),
    }
    info!("stopped the server gracefully");

    Ok(())
}

fn init_tracing(log_level: &str) {
    let default_directive = if log_level == "debug" { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .with(fmt::layer().json())
        .init();
}
