//! Nexus - an HTTP reverse-proxy gateway with hot-swappable routing.
//!
//! Nexus accepts HTTP/HTTPS requests, matches them against a compiled
//! routing table, runs them through a middleware chain, and forwards them to
//! HTTP, gRPC, or Dubbo upstreams. The library exposes the building blocks
//! so the gateway can be embedded or partially reused.
//!
//! # Features
//! - Exact + longest-prefix route matching over an immutable snapshot,
//!   swapped atomically under live traffic
//! - Pluggable load balancing (round-robin, random, pick-first) over
//!   health-flagged endpoints
//! - Per-cluster circuit breaking and a sharded sliding-window rate limiter
//! - A middleware responsibility chain with per-layer panic isolation
//!   (request-id, trace-context, logging, metrics, rate-limit, auth)
//! - HTTP→gRPC and HTTP→Dubbo request transcoding
//! - Config hot-reload with bounded version history and rollback
//! - Admin API, Prometheus metrics, structured JSON access logs
//!
//! # Architecture
//! Pure data-plane logic lives in `core` (no I/O); the network edges are
//! `adapters` behind the trait seams in `ports`. `config` owns the
//! declarative model, validation, versioning, and the Config Center that
//! publishes compiled snapshots.
//!
//! # Error Handling
//! Application-level fallible APIs return `eyre::Result<T>` with `WrapErr`
//! context; domain errors are dedicated `thiserror` enums.
//!
//! # License
//! Dual-licensed under either MIT or Apache-2.0 at your option.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{GatewayHandler, HealthProber, ProxyEngine, ProxyEngineOptions},
    config::{ConfigCenter, ConfigValidator},
    core::{SnapshotStore, compiler},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
