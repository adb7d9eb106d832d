use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use conduit_core::DataKind;
use conduit_monitoring::logging::LogExt;
use conduit_orchestrator::{ConduitConfig, HttpFetcher, Orchestrator};
use conduit_resilience::FileStateStore;

const USAGE: &str = "usage: conduit <ENTITY:kind>...";

#[tokio::main]
async fn main() -> Result<()> {
    let requests = std::env::args()
        .skip(1)
        .map(|arg| parse_request(&arg))
        .collect::<Result<Vec<_>>>()?;
    if requests.is_empty() {
        bail!(USAGE);
    }

    let config = ConduitConfig::load().context("Failed to load configuration")?;
    conduit_monitoring::init(&config.monitoring_config()).context("Failed to initialize monitoring")?;

    let fetcher = HttpFetcher::new(
        &config.upstream_base_url,
        Duration::from_millis(config.request_timeout_ms),
    )
    .context("Failed to create HTTP fetcher")?;
    let store = FileStateStore::new(&config.state_dir);

    let orchestrator = Orchestrator::from_config(&config, Arc::new(fetcher), Arc::new(store))
        .await
        .context("Failed to build orchestrator")?;
    let maintenance = orchestrator.spawn_maintenance();

    let pending = orchestrator.offline_queue().len().await;
    if pending > 0 {
        let replay = orchestrator
            .process_offline_queue()
            .await
            .log_err("Offline replay failed");
        if let Ok(report) = replay {
            info!(
                "Startup replay of {} pending writes: {} applied, {} retained, {} dropped, {} not tried",
                pending,
                report.replayed.len(),
                report.retained.len(),
                report.dropped.len(),
                report.skipped.len()
            );
        }
    }

    let loads = requests.into_iter().map(|(entity, kind)| {
        let orchestrator = orchestrator.clone();
        async move {
            let result = orchestrator.load_data(&entity, kind.clone()).await;
            (entity, kind, result)
        }
    });

    for (entity, kind, result) in futures::future::join_all(loads).await {
        match result {
            Ok(payload) => println!("{}:{} {}", entity, kind, payload),
            Err(e) => println!("{}:{} error: {}", entity, kind, e),
        }
    }

    let stats = orchestrator.get_stats().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    if let Some(text) = conduit_monitoring::render_prometheus() {
        info!("Prometheus exposition:\n{}", text);
    }

    maintenance.abort();
    conduit_monitoring::shutdown();
    Ok(())
}

fn parse_request(arg: &str) -> Result<(String, DataKind)> {
    let Some((entity, kind)) = arg.rsplit_once(':') else {
        bail!("expected ENTITY:kind, got {}\n{}", arg, USAGE);
    };
    let kind = kind
        .parse::<DataKind>()
        .with_context(|| format!("Invalid kind in {}", arg))?;
    Ok((entity.to_string(), kind))
}
