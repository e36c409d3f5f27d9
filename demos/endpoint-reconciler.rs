//! Runs the API endpoint reconciler against the current cluster.
//!
//! Every instance joins a Lease based election; the leader keeps the
//! `default/kubernetes` endpoints pointed at the external API address.
//!
//! # Environment Variables
//!
//! - `API_ADDRESS`: address of the local API server (default: 127.0.0.1)
//! - `EXTERNAL_ADDRESS`: external API host name or IP (optional)
//! - `API_PORT`: API server port (default: 6443)
//! - `RECONCILE_INTERVAL_SECS`: seconds between cycles (default: 10)
//! - `LEASE_NAMESPACE`: namespace of the election lease (default: kube-system)
//! - `LEASE_NAME`: name of the election lease (default: kube-endpoint-reconciler)

use std::env;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_endpoint_reconciler::{
    ApiConfig, DEFAULT_API_PORT, DEFAULT_INTERVAL, EndpointReconciler, KubeClientFactory,
    LeaderElector, LeaseElector, LeaseParams,
};
use tracing::{Level, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let address = env::var("API_ADDRESS").unwrap_or_else(|_| "127.0.0.1".to_string());
    let external_address = env::var("EXTERNAL_ADDRESS").ok();
    let port: u16 = env::var("API_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_API_PORT);
    let interval = env::var("RECONCILE_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map_or(DEFAULT_INTERVAL, Duration::from_secs);

    let mut lease = LeaseParams::default();
    if let Ok(namespace) = env::var("LEASE_NAMESPACE") {
        lease = lease.namespace(namespace);
    }
    if let Ok(name) = env::var("LEASE_NAME") {
        lease.lease_name = name;
    }

    let mut config = ApiConfig::new(address).port(port).interval(interval);
    if let Some(external) = external_address {
        config = config.external_address(external);
    }

    info!("API address: {}", config.address);
    if let Some(ref external) = config.external_address {
        info!("External address: {external}");
    }
    info!("Lease: {}/{} as {}", lease.namespace, lease.lease_name, lease.identity);

    let client = Client::try_default().await?;
    let elector = Arc::new(LeaseElector::new(client, lease));
    elector.init()?;
    elector.run()?;

    let mut reconciler = EndpointReconciler::new(config, elector.clone(), KubeClientFactory::new());
    reconciler.init()?;
    reconciler.run()?;

    let mut health = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = health.tick() => {
                if let Err(e) = reconciler.healthy() {
                    warn!("reconciler unhealthy: {e}");
                }
            }
        }
    }

    info!("Shutting down");
    reconciler.stop().await?;
    elector.shutdown().await?;

    Ok(())
}
