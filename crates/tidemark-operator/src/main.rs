//! Tidemark operator - watermark-based horizontal autoscaling for Kubernetes

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::{reflector, store};
use kube::runtime::watcher::{watcher, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Client, CustomResourceExt};

use tidemark_common::crd::WatermarkAutoscaler;
use tidemark_common::telemetry::{init_telemetry, TelemetryConfig};
use tidemark_common::{DEFAULT_SYNC_PERIOD_SECS, FIELD_MANAGER};
use tidemark_controller::pods::StorePodLister;
use tidemark_controller::{error_policy, reconcile, Context};

mod http;

/// Tidemark - drives workload replica counts toward keeping a metric
/// between a low and a high watermark
#[derive(Parser, Debug)]
#[command(name = "tidemark-operator", version, about, long_about = None)]
struct Cli {
    /// Print the WatermarkAutoscaler CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Seconds between two reconciliations of the same autoscaler
    #[arg(long, default_value_t = DEFAULT_SYNC_PERIOD_SECS)]
    sync_period_seconds: u64,

    /// Listen address for the health and metrics endpoints
    #[arg(long, default_value = "0.0.0.0:8080")]
    http_addr: std::net::SocketAddr,

    /// Skip installing the CRD on startup
    #[arg(long)]
    skip_crd_install: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", serde_yaml::to_string(&WatermarkAutoscaler::crd())?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "tidemark-operator".to_string(),
        ..Default::default()
    })?;

    let client = Client::try_default().await?;

    if !cli.skip_crd_install {
        ensure_crd_installed(&client).await?;
    }

    let http_addr = cli.http_addr;
    tokio::spawn(async move {
        if let Err(e) = http::serve(http_addr).await {
            tracing::error!(error = %e, "HTTP server terminated");
        }
    });

    // Reconciliations read pods from this cache only; latency must not
    // scale with the number of pods in the cluster.
    let pods: Api<Pod> = Api::all(client.clone());
    let (pod_store, writer) = store::<Pod>();
    let pod_watch = reflector(writer, watcher(pods, WatcherConfig::default()))
        .applied_objects()
        .for_each(|event| async move {
            if let Err(e) = event {
                tracing::warn!(error = %e, "Pod watch error");
            }
        });
    tokio::spawn(pod_watch);
    pod_store.wait_until_ready().await?;
    tracing::info!("Pod cache is primed");

    let ctx = Arc::new(Context::new(
        client.clone(),
        Duration::from_secs(cli.sync_period_seconds),
        Arc::new(StorePodLister::new(pod_store)),
    ));

    let autoscalers: Api<WatermarkAutoscaler> = Api::all(client);
    tracing::info!("Starting WatermarkAutoscaler controller");
    Controller::new(autoscalers, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "Reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "Reconciliation error"),
            }
        })
        .await;

    Ok(())
}

/// Install or update the WatermarkAutoscaler CRD with server-side apply,
/// so the CRD version always matches the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    tracing::info!("Installing WatermarkAutoscaler CRD...");
    crds.patch(
        "watermarkautoscalers.tidemark.dev",
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&WatermarkAutoscaler::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install WatermarkAutoscaler CRD: {e}"))?;
    Ok(())
}
