//! Keyway - dynamic database credentials for Kubernetes

use std::time::Duration;

use clap::Parser;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use keyway_common::crd::{DatabaseRole, DatabaseRoleBinding};
use keyway_common::FIELD_MANAGER;
use keyway_operator::context::ControllerConfig;
use keyway_operator::controller;

/// Keyway - brokers leased database credentials from a dynamic-secrets
/// backend into cluster Secrets and access grants
#[derive(Parser, Debug)]
#[command(name = "keyway", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Workers per resource-kind queue
    #[arg(long, env = "KEYWAY_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Reconcile retries before a key is dropped
    #[arg(long, env = "KEYWAY_MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,

    /// Absolute bound on one finalization attempt, in seconds
    #[arg(long, env = "KEYWAY_FINALIZER_TIMEOUT_SECS", default_value_t = 120)]
    finalizer_timeout_secs: u64,

    /// Delay between finalization cleanup attempts, in seconds
    #[arg(long, env = "KEYWAY_FINALIZER_POLL_SECS", default_value_t = 5)]
    finalizer_poll_secs: u64,

    /// Delay between lease-renewal sweeps, in seconds
    #[arg(long, env = "KEYWAY_RENEWAL_INTERVAL_SECS", default_value_t = 60)]
    renewal_interval_secs: u64,

    /// Extra renewal margin on top of the sweep interval, in seconds
    #[arg(long, env = "KEYWAY_RENEWAL_MARGIN_SECS", default_value_t = 10)]
    renewal_margin_secs: u64,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            max_retries: self.max_retries,
            finalizer_timeout: Duration::from_secs(self.finalizer_timeout_secs),
            finalizer_poll_interval: Duration::from_secs(self.finalizer_poll_secs),
            renewal_interval: Duration::from_secs(self.renewal_interval_secs),
            renewal_safety_margin: Duration::from_secs(self.renewal_margin_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the default crypto provider before the first TLS handshake;
    // both the kube client and the backend client need it.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: failed to install the default crypto provider: {:?}. \
             This may indicate a conflicting provider was already installed.",
            e
        );
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let role_crd = serde_yaml::to_string(&DatabaseRole::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize DatabaseRole CRD: {e}"))?;
        let binding_crd = serde_yaml::to_string(&DatabaseRoleBinding::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize DatabaseRoleBinding CRD: {e}"))?;
        println!("{role_crd}---\n{binding_crd}");
        return Ok(());
    }

    let client = Client::try_default().await?;
    ensure_crds_installed(&client).await?;

    controller::run(client, cli.controller_config())
        .await
        .map_err(|e| anyhow::anyhow!("controller failed: {e}"))
}

/// Install both Keyway CRDs on startup using server-side apply, so the CRD
/// versions always match the operator version
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing DatabaseRole CRD...");
    crds.patch(
        "databaseroles.keyway.dev",
        &params,
        &Patch::Apply(&DatabaseRole::crd()),
    )
    .await?;

    tracing::info!("Installing DatabaseRoleBinding CRD...");
    crds.patch(
        "databaserolebindings.keyway.dev",
        &params,
        &Patch::Apply(&DatabaseRoleBinding::crd()),
    )
    .await?;

    Ok(())
}
