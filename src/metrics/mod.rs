//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Scan progress and event intake
//! - Reconciliation outcomes
//! - Nonce lease usage
//! - Normalization submissions

use crate::error::SyncResult;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Scanner metrics
    pub static ref SCAN_HEIGHT: GaugeVec = register_gauge_vec!(
        "pledge_sync_scan_height",
        "Last fully scanned block",
        &[]
    ).unwrap();

    pub static ref EVENTS_SCANNED: CounterVec = register_counter_vec!(
        "pledge_sync_events_scanned_total",
        "Total transfer events read off the ledger",
        &[]
    ).unwrap();

    // Reconciler metrics
    pub static ref EVENTS_DEFERRED: CounterVec = register_counter_vec!(
        "pledge_sync_events_deferred_total",
        "Total events parked waiting for an earlier donation record",
        &[]
    ).unwrap();

    pub static ref EVENTS_RETRIED: CounterVec = register_counter_vec!(
        "pledge_sync_events_retried_total",
        "Total one-shot retries scheduled for failed events",
        &[]
    ).unwrap();

    pub static ref EVENTS_DROPPED: CounterVec = register_counter_vec!(
        "pledge_sync_events_dropped_total",
        "Total events abandoned, by reason",
        &["reason"]
    ).unwrap();

    pub static ref DONATIONS_CREATED: CounterVec = register_counter_vec!(
        "pledge_sync_donations_created_total",
        "Total donation records created",
        &[]
    ).unwrap();

    pub static ref DONATIONS_MOVED: CounterVec = register_counter_vec!(
        "pledge_sync_donations_moved_total",
        "Total donations moved whole to a new pledge",
        &[]
    ).unwrap();

    pub static ref DONATIONS_SPLIT: CounterVec = register_counter_vec!(
        "pledge_sync_donations_split_total",
        "Total donations split across two pledges",
        &[]
    ).unwrap();

    pub static ref HISTORY_RECORDED: CounterVec = register_counter_vec!(
        "pledge_sync_donation_histories_total",
        "Total delegation history entries written",
        &[]
    ).unwrap();

    pub static ref TIMESTAMP_CACHE: CounterVec = register_counter_vec!(
        "pledge_sync_timestamp_cache_total",
        "Block timestamp cache lookups, by result",
        &["result"]
    ).unwrap();

    // Transaction metrics
    pub static ref NONCE_LEASES: CounterVec = register_counter_vec!(
        "pledge_sync_nonce_leases_total",
        "Nonce leases released, by outcome",
        &["outcome"]
    ).unwrap();

    // Normalizer metrics
    pub static ref NORMALIZE_BATCHES: CounterVec = register_counter_vec!(
        "pledge_sync_normalize_batches_total",
        "Normalization batches submitted, by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref NORMALIZE_PLEDGES: CounterVec = register_counter_vec!(
        "pledge_sync_normalize_pledges_total",
        "Total pledge ids submitted for normalization",
        &[]
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

    pub async fn run(&self) -> SyncResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

// Helper functions to record metrics

pub fn record_blocks_scanned(block_number: u64) {
    SCAN_HEIGHT.with_label_values(&[]).set(block_number as f64);
}

pub fn record_event_scanned() {
    EVENTS_SCANNED.with_label_values(&[]).inc();
}

pub fn record_event_deferred() {
    EVENTS_DEFERRED.with_label_values(&[]).inc();
}

pub fn record_event_retried() {
    EVENTS_RETRIED.with_label_values(&[]).inc();
}

pub fn record_event_dropped(reason: &str) {
    EVENTS_DROPPED.with_label_values(&[reason]).inc();
}

pub fn record_donation_created() {
    DONATIONS_CREATED.with_label_values(&[]).inc();
}

pub fn record_donation_moved() {
    DONATIONS_MOVED.with_label_values(&[]).inc();
}

pub fn record_donation_split() {
    DONATIONS_SPLIT.with_label_values(&[]).inc();
}

pub fn record_history_recorded() {
    HISTORY_RECORDED.with_label_values(&[]).inc();
}

pub fn record_timestamp_cache(hit: bool) {
    TIMESTAMP_CACHE
        .with_label_values(&[if hit { "hit" } else { "miss" }])
        .inc();
}

pub fn record_nonce_lease(outcome: &str) {
    NONCE_LEASES.with_label_values(&[outcome]).inc();
}

pub fn record_normalize_batch(success: bool) {
    NORMALIZE_BATCHES
        .with_label_values(&[if success { "sent" } else { "failed" }])
        .inc();
}

pub fn record_normalize_pledges(count: usize) {
    NORMALIZE_PLEDGES
        .with_label_values(&[])
        .inc_by(count as f64);
}
