//! Performance metrics and statistics tracking for the fraud stream pipeline.

use crate::types::verdict::{ReportStatus, Verdict};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

const MAX_SAMPLES: usize = 10_000;

/// Metrics collector for pipeline performance
pub struct PipelineMetrics {
    /// Transactions handed to the coordinator
    pub transactions_received: AtomicU64,
    /// Transactions that produced an event
    pub transactions_processed: AtomicU64,
    pub fraud_detected: AtomicU64,
    pub legitimate: AtomicU64,
    /// Verdicts produced without the classifier
    pub fallback_verdicts: AtomicU64,
    pub reports_accepted: AtomicU64,
    pub reports_already_reported: AtomicU64,
    pub reports_rejected: AtomicU64,
    pub reports_failed: AtomicU64,
    /// Stream payloads that were not a valid transaction
    pub parse_failures: AtomicU64,
    /// Repeated trans_nums inside the dedupe window
    pub duplicates_skipped: AtomicU64,
    /// Stream reconnect attempts
    pub reconnects: AtomicU64,
    /// End-to-end processing times (in microseconds)
    processing_times: RwLock<Vec<u64>>,
    /// Classifier call times (in microseconds)
    inference_times: RwLock<Vec<u64>>,
    /// Fraud score distribution buckets
    score_buckets: RwLock<[u64; 10]>,
    /// Start time for rate calculation
    start_time: Instant,
}

impl PipelineMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            transactions_received: AtomicU64::new(0),
            transactions_processed: AtomicU64::new(0),
            fraud_detected: AtomicU64::new(0),
            legitimate: AtomicU64::new(0),
            fallback_verdicts: AtomicU64::new(0),
            reports_accepted: AtomicU64::new(0),
            reports_already_reported: AtomicU64::new(0),
            reports_rejected: AtomicU64::new(0),
            reports_failed: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            duplicates_skipped: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            processing_times: RwLock::new(Vec::with_capacity(1000)),
            inference_times: RwLock::new(Vec::with_capacity(1000)),
            score_buckets: RwLock::new([0; 10]),
            start_time: Instant::now(),
        }
    }

    pub fn record_received(&self) {
        self.transactions_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a classifier call
    pub fn record_inference_time(&self, duration: Duration) {
        push_sample(&self.inference_times, duration);
    }

    /// Record a published event
    pub fn record_event(&self, verdict: &Verdict, report: ReportStatus, processing_time: Duration) {
        self.transactions_processed.fetch_add(1, Ordering::Relaxed);

        if verdict.fraud {
            self.fraud_detected.fetch_add(1, Ordering::Relaxed);
        } else {
            self.legitimate.fetch_add(1, Ordering::Relaxed);
        }
        if verdict.fallback {
            self.fallback_verdicts.fetch_add(1, Ordering::Relaxed);
        }

        let counter = match report {
            ReportStatus::Accepted => &self.reports_accepted,
            ReportStatus::AlreadyReported => &self.reports_already_reported,
            ReportStatus::Rejected => &self.reports_rejected,
            ReportStatus::Failed => &self.reports_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        push_sample(&self.processing_times, processing_time);

        // Fallback scores say nothing about the model's distribution
        if !verdict.fallback {
            let bucket = (verdict.score * 10.0).clamp(0.0, 9.0) as usize;
            let mut buckets = self
                .score_buckets
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            buckets[bucket] += 1;
        }
    }

    /// Get processing time statistics
    pub fn get_processing_stats(&self) -> LatencyStats {
        latency_stats(&self.processing_times)
    }

    /// Get classifier call statistics
    pub fn get_inference_stats(&self) -> LatencyStats {
        latency_stats(&self.inference_times)
    }

    /// Get current throughput (transactions per second)
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.transactions_processed.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get score distribution
    pub fn get_score_distribution(&self) -> [u64; 10] {
        *self
            .score_buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            transactions_received: load(&self.transactions_received),
            transactions_processed: load(&self.transactions_processed),
            fraud_detected: load(&self.fraud_detected),
            legitimate: load(&self.legitimate),
            fallback_verdicts: load(&self.fallback_verdicts),
            reports: ReportCounts {
                accepted: load(&self.reports_accepted),
                already_reported: load(&self.reports_already_reported),
                rejected: load(&self.reports_rejected),
                failed: load(&self.reports_failed),
            },
            parse_failures: load(&self.parse_failures),
            duplicates_skipped: load(&self.duplicates_skipped),
            reconnects: load(&self.reconnects),
            throughput_tps: self.get_throughput(),
            uptime_secs: self.uptime().as_secs(),
            processing: self.get_processing_stats(),
            inference: self.get_inference_stats(),
            score_distribution: self.get_score_distribution(),
        }
    }

    /// Print summary statistics
    pub fn print_summary(&self) {
        let stats = self.snapshot();
        let fraud_rate = if stats.transactions_processed > 0 {
            (stats.fraud_detected as f64 / stats.transactions_processed as f64) * 100.0
        } else {
            0.0
        };

        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║            FRAUD STREAM PIPELINE - METRICS SUMMARY           ║");
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Transactions Processed: {:>8}  │  Throughput: {:>6.1} tx/s ║",
            stats.transactions_processed, stats.throughput_tps
        );
        info!(
            "║ Fraud Detected:         {:>8}  │  Fraud Rate: {:>6.1}%     ║",
            stats.fraud_detected, fraud_rate
        );
        info!(
            "║ Fallback Verdicts:      {:>8}  │  Parse Failures: {:>6}   ║",
            stats.fallback_verdicts, stats.parse_failures
        );
        info!(
            "║ Duplicates Skipped:     {:>8}  │  Reconnects: {:>10}   ║",
            stats.duplicates_skipped, stats.reconnects
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Reports: accepted={:>6} already={:>6} rejected={:>6} failed={:>6}",
            stats.reports.accepted,
            stats.reports.already_reported,
            stats.reports.rejected,
            stats.reports.failed
        );
        info!(
            "║ Processing Time (μs): mean={:>5} p50={:>5} p95={:>5} p99={:>5} ║",
            stats.processing.mean_us,
            stats.processing.p50_us,
            stats.processing.p95_us,
            stats.processing.p99_us
        );
        info!(
            "║ Inference Time (μs):  mean={:>5} p50={:>5} p95={:>5} p99={:>5} ║",
            stats.inference.mean_us,
            stats.inference.p50_us,
            stats.inference.p95_us,
            stats.inference.p99_us
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Fraud Score Distribution:                                    ║");
        let total: u64 = stats.score_distribution.iter().sum();
        for (i, &count) in stats.score_distribution.iter().enumerate() {
            let pct = if total > 0 { (count as f64 / total as f64) * 100.0 } else { 0.0 };
            let bar_len = (pct / 2.0) as usize;
            let bar: String = "█".repeat(bar_len.min(20));
            info!(
                "║   {:.1}-{:.1}: {:>6} ({:>5.1}%) {}",
                i as f64 / 10.0,
                (i + 1) as f64 / 10.0,
                count,
                pct,
                bar
            );
        }
        info!("╚══════════════════════════════════════════════════════════════╝");
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn push_sample(samples: &RwLock<Vec<u64>>, duration: Duration) {
    let mut times = samples.write().unwrap_or_else(PoisonError::into_inner);
    times.push(duration.as_micros() as u64);
    // Keep only the most recent samples
    if times.len() > MAX_SAMPLES {
        times.drain(0..MAX_SAMPLES / 2);
    }
}

fn latency_stats(samples: &RwLock<Vec<u64>>) -> LatencyStats {
    let mut sorted = samples
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if sorted.is_empty() {
        return LatencyStats::default();
    }
    sorted.sort_unstable();

    let sum: u64 = sorted.iter().sum();
    let count = sorted.len();
    let at = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];

    LatencyStats {
        count: count as u64,
        mean_us: sum / count as u64,
        p50_us: at(0.5),
        p95_us: at(0.95),
        p99_us: at(0.99),
        max_us: sorted[count - 1],
    }
}

/// Latency statistics over the retained samples
#[derive(Debug, Default, Clone, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Report outcomes by status
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReportCounts {
    pub accepted: u64,
    pub already_reported: u64,
    pub rejected: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub transactions_received: u64,
    pub transactions_processed: u64,
    pub fraud_detected: u64,
    pub legitimate: u64,
    pub fallback_verdicts: u64,
    pub reports: ReportCounts,
    pub parse_failures: u64,
    pub duplicates_skipped: u64,
    pub reconnects: u64,
    pub throughput_tps: f64,
    pub uptime_secs: u64,
    pub processing: LatencyStats,
    pub inference: LatencyStats,
    pub score_distribution: [u64; 10],
}

/// Real-time metrics reporter that prints periodic summaries
pub struct MetricsReporter {
    metrics: std::sync::Arc<PipelineMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: std::sync::Arc<PipelineMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}
