//! Pipeline counters and gauges.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stream_types::StreamPosition;
use tokio::io::AsyncWriteExt;

/// Shared, lock-free pipeline metrics.
#[derive(Debug)]
pub struct PipelineMetrics {
    records_decoded: AtomicU64,
    transactions_dispatched: AtomicU64,
    envelopes_emitted: AtomicU64,
    empty_transactions: AtomicU64,
    replayed_transactions: AtomicU64,
    filtered_records: AtomicU64,
    delivery_retries: AtomicU64,
    delivery_failures: AtomicU64,
    reconnects: AtomicU64,
    last_dispatch_latency_micros: AtomicU64,
    total_dispatch_latency_micros: AtomicU64,
    /// Microseconds since the Unix epoch; 0 until the first transaction.
    last_commit_timestamp_micros: AtomicI64,
    confirmed_position: AtomicU64,
    healthy: AtomicBool,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self {
            records_decoded: AtomicU64::new(0),
            transactions_dispatched: AtomicU64::new(0),
            envelopes_emitted: AtomicU64::new(0),
            empty_transactions: AtomicU64::new(0),
            replayed_transactions: AtomicU64::new(0),
            filtered_records: AtomicU64::new(0),
            delivery_retries: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_dispatch_latency_micros: AtomicU64::new(0),
            total_dispatch_latency_micros: AtomicU64::new(0),
            last_commit_timestamp_micros: AtomicI64::new(0),
            confirmed_position: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
        }
    }
}

/// Point-in-time view of [`PipelineMetrics`] (one JSON line).
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub records_decoded: u64,
    pub transactions_dispatched: u64,
    pub envelopes_emitted: u64,
    pub empty_transactions: u64,
    pub replayed_transactions: u64,
    pub filtered_records: u64,
    pub delivery_retries: u64,
    pub delivery_failures: u64,
    pub reconnects: u64,
    pub last_dispatch_latency_ms: f64,
    pub avg_dispatch_latency_ms: f64,
    pub last_commit_timestamp: Option<String>,
    /// Time between the last dispatched commit and now.
    pub lag_ms: Option<i64>,
    pub confirmed_position: Option<StreamPosition>,
    pub healthy: bool,
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_decoded(&self) {
        self.records_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.filtered_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed_transaction(&self) {
        self.replayed_transactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_envelope(&self) {
        self.envelopes_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.delivery_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transaction(&self, latency: Duration, commit_timestamp: DateTime<Utc>) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.transactions_dispatched.fetch_add(1, Ordering::Relaxed);
        self.last_dispatch_latency_micros
            .store(micros, Ordering::Relaxed);
        self.total_dispatch_latency_micros
            .fetch_add(micros, Ordering::Relaxed);
        self.last_commit_timestamp_micros
            .store(commit_timestamp.timestamp_micros(), Ordering::Relaxed);
    }

    pub fn record_empty_transaction(&self) {
        self.empty_transactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_confirmed(&self, position: StreamPosition) {
        self.confirmed_position
            .fetch_max(position.as_u64(), Ordering::Relaxed);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn records_decoded(&self) -> u64 {
        self.records_decoded.load(Ordering::Relaxed)
    }

    pub fn confirmed_position(&self) -> Option<StreamPosition> {
        match self.confirmed_position.load(Ordering::Relaxed) {
            0 => None,
            lsn => Some(StreamPosition::new(lsn)),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Utc::now();
        let dispatched = self.transactions_dispatched.load(Ordering::Relaxed);
        let total_latency = self.total_dispatch_latency_micros.load(Ordering::Relaxed);
        let last_commit = match self.last_commit_timestamp_micros.load(Ordering::Relaxed) {
            0 => None,
            micros => DateTime::from_timestamp_micros(micros),
        };

        MetricsSnapshot {
            timestamp: now.to_rfc3339(),
            records_decoded: self.records_decoded(),
            transactions_dispatched: dispatched,
            envelopes_emitted: self.envelopes_emitted.load(Ordering::Relaxed),
            empty_transactions: self.empty_transactions.load(Ordering::Relaxed),
            replayed_transactions: self.replayed_transactions.load(Ordering::Relaxed),
            filtered_records: self.filtered_records.load(Ordering::Relaxed),
            delivery_retries: self.delivery_retries.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_dispatch_latency_ms: self.last_dispatch_latency_micros.load(Ordering::Relaxed)
                as f64
                / 1000.0,
            avg_dispatch_latency_ms: if dispatched > 0 {
                total_latency as f64 / dispatched as f64 / 1000.0
            } else {
                0.0
            },
            last_commit_timestamp: last_commit.map(|ts| ts.to_rfc3339()),
            lag_ms: last_commit.map(|ts| (now - ts).num_milliseconds().max(0)),
            confirmed_position: self.confirmed_position(),
            healthy: self.is_healthy(),
        }
    }

    /// Start background metrics emission task appending JSON lines to `output_path`.
    pub fn start_emission_task(
        self: &Arc<Self>,
        output_path: PathBuf,
        interval: Duration,
    ) -> tokio::task::JoinHandle<Result<()>> {
        let metrics = Arc::clone(self);

        tokio::spawn(async move {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&output_path)
                .await?;

            let mut interval_timer = tokio::time::interval(interval);

            loop {
                interval_timer.tick().await;

                let json_line = serde_json::to_string(&metrics.snapshot())?;
                file.write_all(json_line.as_bytes()).await?;
                file.write_all(b"\n").await?;
                file.flush().await?;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = PipelineMetrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transactions_dispatched, 0);
        assert_eq!(snapshot.avg_dispatch_latency_ms, 0.0);
        assert!(snapshot.lag_ms.is_none());
        assert!(snapshot.confirmed_position.is_none());
        assert!(snapshot.healthy);

        metrics.record_decoded();
        metrics.record_decoded();
        metrics.record_transaction(Duration::from_millis(4), Utc::now());
        metrics.record_transaction(Duration::from_millis(2), Utc::now());
        metrics.set_confirmed(StreamPosition::new(20));
        metrics.set_confirmed(StreamPosition::new(10));
        metrics.set_healthy(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_decoded, 2);
        assert_eq!(snapshot.transactions_dispatched, 2);
        assert_eq!(snapshot.last_dispatch_latency_ms, 2.0);
        assert_eq!(snapshot.avg_dispatch_latency_ms, 3.0);
        assert!(snapshot.lag_ms.unwrap() >= 0);
        assert_eq!(snapshot.confirmed_position, Some(StreamPosition::new(20)));
        assert!(!snapshot.healthy);
    }

    #[tokio::test]
    async fn test_emission_task_writes_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let metrics = PipelineMetrics::new();
        metrics.record_decoded();

        let handle = metrics.start_emission_task(path.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.abort();

        let content = std::fs::read_to_string(&path).unwrap();
        let first = content.lines().next().unwrap();
        let parsed: MetricsSnapshot = serde_json::from_str(first).unwrap();
        assert_eq!(parsed.records_decoded, 1);
    }
}
