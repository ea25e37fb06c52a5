//! Compiled clusters and endpoint selection.
//!
//! A `CompiledCluster` is the snapshot-resident form of a configured cluster:
//! resolved endpoints with lock-free health flags, the load-balancing policy,
//! and the (optional) circuit breaker guarding the cluster. Selection never
//! holds a lock; health flags are plain atomics written by the health prober
//! and the passive observer.
use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicU64, Ordering},
};

use rand::Rng;
use thiserror::Error;

use crate::{
    config::models::{
        ClusterDubbo, ClusterGrpc, HealthCheckConfig, KeepaliveConfig, LoadBalancerKind, Protocol,
    },
    core::circuit_breaker::CircuitBreaker,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("no healthy endpoints available")]
    NoHealthy,
}

/// One addressable backend with its health flag (1 = healthy). Fresh
/// snapshots start every endpoint healthy because endpoint identity is new.
#[derive(Debug)]
pub struct CompiledEndpoint {
    address: String,
    healthy: AtomicU32,
}

impl CompiledEndpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            healthy: AtomicU32::new(1),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed) == 1
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(u32::from(healthy), Ordering::Relaxed);
    }
}

/// Snapshot-resident cluster: endpoints, policy, protocol parameters, and the
/// breaker carried forward across snapshot swaps.
#[derive(Debug)]
pub struct CompiledCluster {
    pub name: String,
    pub protocol: Protocol,
    pub endpoints: Vec<Arc<CompiledEndpoint>>,
    pub lb: LoadBalancerKind,
    pub keepalive: Option<KeepaliveConfig>,
    pub grpc: Option<ClusterGrpc>,
    pub dubbo: Option<ClusterDubbo>,
    pub health_check: Option<HealthCheckConfig>,
    pub breaker: Option<Arc<CircuitBreaker>>,
    counter: AtomicU64,
}

impl CompiledCluster {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        protocol: Protocol,
        endpoints: Vec<Arc<CompiledEndpoint>>,
        lb: LoadBalancerKind,
        keepalive: Option<KeepaliveConfig>,
        grpc: Option<ClusterGrpc>,
        dubbo: Option<ClusterDubbo>,
        health_check: Option<HealthCheckConfig>,
        breaker: Option<Arc<CircuitBreaker>>,
    ) -> Self {
        Self {
            name,
            protocol,
            endpoints,
            lb,
            keepalive,
            grpc,
            dubbo,
            health_check,
            breaker,
            counter: AtomicU64::new(0),
        }
    }

    /// Pick the next endpoint according to the cluster's load-balancing
    /// policy, considering only endpoints whose health flag is set.
    ///
    /// Health flags flip concurrently with selection, so the healthy subset
    /// is snapshotted into a local list first and the index clamped against
    /// that list, never against the live flags.
    pub fn next_endpoint(&self) -> Result<Arc<CompiledEndpoint>, SelectError> {
        let healthy: Vec<&Arc<CompiledEndpoint>> =
            self.endpoints.iter().filter(|ep| ep.is_healthy()).collect();
        if healthy.is_empty() {
            return Err(SelectError::NoHealthy);
        }

        let chosen = match self.lb {
            LoadBalancerKind::RoundRobin => {
                let idx = self.counter.fetch_add(1, Ordering::Relaxed) as usize;
                healthy[idx % healthy.len()]
            }
            LoadBalancerKind::Random => {
                let idx = rand::rng().random_range(0..healthy.len());
                healthy[idx]
            }
            LoadBalancerKind::PickFirst => healthy[0],
        };
        Ok(Arc::clone(chosen))
    }
}
