//! Active upstream health probing.
//!
//! One background task probes every cluster that configures a health check.
//! Probes are plain GETs against the configured path through the HttpClient
//! port; a 2xx/3xx answer marks the endpoint healthy, anything else (or a
//! network error) marks it unhealthy. Flags are written with atomic stores,
//! so the data plane never waits on the prober.
use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::time::{Instant, sleep};

use crate::{
    core::{cluster::CompiledCluster, snapshot::SnapshotStore},
    metrics,
    ports::http_client::HttpClient,
};

const TICK: Duration = Duration::from_secs(1);

/// Periodic health prober over the current snapshot's clusters.
pub struct HealthProber {
    store: Arc<SnapshotStore>,
    client: Arc<dyn HttpClient>,
}

impl HealthProber {
    pub fn new(store: Arc<SnapshotStore>, client: Arc<dyn HttpClient>) -> Self {
        Self { store, client }
    }

    /// Run the probe loop until the owning task is aborted. Each cluster is
    /// probed at its own configured interval; clusters without a
    /// `health_check` block are left to passive observation.
    pub async fn run(&self) {
        tracing::info!("health prober started");
        let mut last_probe: HashMap<String, Instant> = HashMap::new();

        loop {
            sleep(TICK).await;

            let Some(snapshot) = self.store.load() else {
                continue;
            };

            let now = Instant::now();
            for cluster in snapshot.clusters.values() {
                let Some(check) = &cluster.health_check else {
                    continue;
                };
                let due = last_probe
                    .get(&cluster.name)
                    .map_or(true, |t| now.duration_since(*t) >= check.interval);
                if !due {
                    continue;
                }
                last_probe.insert(cluster.name.clone(), now);
                self.probe_cluster(cluster).await;
            }

            // Drop state for clusters that vanished with an old snapshot.
            last_probe.retain(|name, _| snapshot.clusters.contains_key(name));
        }
    }

    /// Probe every endpoint of one cluster and update its health flags.
    pub async fn probe_cluster(&self, cluster: &CompiledCluster) {
        let Some(check) = &cluster.health_check else {
            return;
        };

        for endpoint in &cluster.endpoints {
            let url = probe_url(endpoint.address(), &check.path);
            let healthy = match self.client.health_check(&url, check.timeout).await {
                Ok(healthy) => healthy,
                Err(err) => {
                    tracing::debug!(%url, error = %err, "health probe failed");
                    false
                }
            };

            if healthy != endpoint.is_healthy() {
                tracing::info!(
                    cluster = %cluster.name,
                    endpoint = endpoint.address(),
                    healthy,
                    "endpoint health changed"
                );
            }
            endpoint.set_healthy(healthy);
            metrics::set_upstream_healthy(&cluster.name, endpoint.address(), healthy);
        }
    }
}

fn probe_url(address: &str, path: &str) -> String {
    let base = if address.contains("://") {
        address.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", address.trim_end_matches('/'))
    };
    format!("{base}{path}")
}
