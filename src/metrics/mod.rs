//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain driver health
//! - Block processing and tracker transitions
//! - Job outcomes and retries
//! - Transaction pool depth

use crate::coordination::BlockSummary;
use crate::error::{BridgeError, BridgeResult};
use crate::tracker::LedgerEffect;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Encoder, Gauge,
    GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "bridge_chain_connected",
        "Chain driver health (1=healthy, 0=unreachable)",
        &["chain"]
    ).unwrap();

    // Block metrics
    pub static ref BLOCK_HEIGHT: Gauge = register_gauge!(
        "bridge_block_height",
        "Height of the last processed block"
    ).unwrap();

    pub static ref TXS_APPLIED: CounterVec = register_counter_vec!(
        "bridge_transactions_total",
        "Internal transactions by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref TX_POOL_SIZE: Gauge = register_gauge!(
        "bridge_tx_pool_size",
        "Transactions waiting for the next block"
    ).unwrap();

    // Transition metrics
    pub static ref TRANSITIONS: CounterVec = register_counter_vec!(
        "bridge_transitions_total",
        "Transitions that moved a tracker",
        &["transition"]
    ).unwrap();

    pub static ref TRANSITIONS_FAILED: CounterVec = register_counter_vec!(
        "bridge_transitions_failed_total",
        "Transition functions that returned an error",
        &["transition"]
    ).unwrap();

    pub static ref MINTS: CounterVec = register_counter_vec!(
        "bridge_mints_total",
        "Mint effects emitted for finished transfers",
        &["currency"]
    ).unwrap();

    // Job metrics
    pub static ref PENDING_JOBS: Gauge = register_gauge!(
        "bridge_pending_jobs",
        "Jobs neither completed nor abandoned"
    ).unwrap();

    pub static ref JOB_RETRIES: CounterVec = register_counter_vec!(
        "bridge_job_retries_total",
        "Failed job attempts",
        &["kind"]
    ).unwrap();

    pub static ref JOBS_FINISHED: CounterVec = register_counter_vec!(
        "bridge_jobs_finished_total",
        "Jobs reaching a terminal status",
        &["kind", "outcome"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> BridgeResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| BridgeError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| BridgeError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_chain_health(chain: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_block(summary: &BlockSummary) {
    BLOCK_HEIGHT.set(summary.height as f64);
    TXS_APPLIED
        .with_label_values(&["applied"])
        .inc_by(summary.txs_applied as f64);
    TXS_APPLIED
        .with_label_values(&["duplicate"])
        .inc_by(summary.txs_duplicate as f64);
    TXS_APPLIED
        .with_label_values(&["rejected"])
        .inc_by(summary.txs_rejected as f64);

    for effect in &summary.effects {
        match effect {
            LedgerEffect::Mint { currency, .. } => {
                MINTS.with_label_values(&[&currency.to_string()]).inc();
            }
        }
    }
}

pub fn set_pool_size(size: usize) {
    TX_POOL_SIZE.set(size as f64);
}

pub fn record_transition(name: &str) {
    TRANSITIONS.with_label_values(&[name]).inc();
}

pub fn record_transition_failed(name: &str) {
    TRANSITIONS_FAILED.with_label_values(&[name]).inc();
}

pub fn set_pending_jobs(count: usize) {
    PENDING_JOBS.set(count as f64);
}

pub fn record_job_retry(kind: &str) {
    JOB_RETRIES.with_label_values(&[kind]).inc();
}

pub fn record_job_finished(kind: &str, outcome: &str) {
    JOBS_FINISHED.with_label_values(&[kind, outcome]).inc();
}
