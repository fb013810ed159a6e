//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `ledger_operations_total{op, outcome}` - Ledger operations by result kind
//! - `ledger_operation_duration_seconds{op}` - Histogram of operation latencies
//! - `ledger_txn_retries_total{op}` - Store transactions rerun after a conflict
//! - `ledger_referral_rewards_total` - Referral rewards paid out
//! - `ledger_discarded_purchase_events_total` - Outbox events dropped after a permanent failure
//! - `ledger_pending_purchase_events` - Outbox depth seen by the reactor

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Operations by kind and outcome
    pub operations_total: IntCounterVec,

    /// Operation duration histogram
    pub operation_duration: HistogramVec,

    /// Transaction conflict retries
    pub txn_retries: IntCounterVec,

    /// Referral rewards credited
    pub rewards_credited: IntCounter,

    /// Purchase events dropped without a reward
    pub events_discarded: IntCounter,

    /// Undelivered purchase events
    pub pending_events: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("rewards_credited", &self.rewards_credited.get())
            .field("events_discarded", &self.events_discarded.get())
            .field("pending_events", &self.pending_events.get())
            .finish()
    }
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let operations_total = IntCounterVec::new(
            Opts::new("ledger_operations_total", "Ledger operations by outcome"),
            &["op", "outcome"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "ledger_operation_duration_seconds",
                "Histogram of ledger operation latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
            &["op"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        let txn_retries = IntCounterVec::new(
            Opts::new("ledger_txn_retries_total", "Store transactions rerun after a conflict"),
            &["op"],
        )?;
        registry.register(Box::new(txn_retries.clone()))?;

        let rewards_credited = IntCounter::new(
            "ledger_referral_rewards_total",
            "Referral rewards paid out",
        )?;
        registry.register(Box::new(rewards_credited.clone()))?;

        let events_discarded = IntCounter::new(
            "ledger_discarded_purchase_events_total",
            "Purchase events dropped after a non-retryable failure",
        )?;
        registry.register(Box::new(events_discarded.clone()))?;

        let pending_events = IntGauge::new(
            "ledger_pending_purchase_events",
            "Purchase events awaiting the reward reactor",
        )?;
        registry.register(Box::new(pending_events.clone()))?;

        Ok(Self {
            operations_total,
            operation_duration,
            txn_retries,
            rewards_credited,
            events_discarded,
            pending_events,
            registry,
        })
    }

    /// Record a finished operation
    pub fn record_operation(&self, op: &str, outcome: &str, duration_seconds: f64) {
        self.operations_total.with_label_values(&[op, outcome]).inc();
        self.operation_duration
            .with_label_values(&[op])
            .observe(duration_seconds);
    }

    /// Record a transaction retry
    pub fn record_txn_retry(&self, op: &str) {
        self.txn_retries.with_label_values(&[op]).inc();
    }

    /// Record a referral reward payout
    pub fn record_reward_credited(&self) {
        self.rewards_credited.inc();
    }

    /// Record a purchase event dropped from the outbox
    pub fn record_event_discarded(&self) {
        self.events_discarded.inc();
    }

    /// Update outbox depth
    pub fn set_pending_events(&self, count: i64) {
        self.pending_events.set(count);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn export(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
