//! Per-transaction orchestration: score, report, publish, persist

use crate::bus::EventBus;
use crate::error::InferenceFault;
use crate::history::HistoryRing;
use crate::metrics::PipelineMetrics;
use crate::models::InferenceAdapter;
use crate::recent::RecentSet;
use crate::reporter::Reporter;
use crate::store::Store;
use crate::types::{Event, ReportResult, Transaction, Verdict};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

const DEFAULT_SCORING_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_SCORING_SLOTS: usize = 8;

/// Lifecycle of one transaction inside the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Scored,
    Reported,
    Published,
    Persisted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Scored => "scored",
            Stage::Reported => "reported",
            Stage::Published => "published",
            Stage::Persisted => "persisted",
        };
        f.write_str(name)
    }
}

/// Drives every accepted transaction to exactly one published [`Event`]
pub struct Coordinator {
    inference: Arc<InferenceAdapter>,
    reporter: Arc<dyn Reporter>,
    bus: EventBus,
    history: Arc<HistoryRing>,
    store: Option<Arc<dyn Store>>,
    metrics: Arc<PipelineMetrics>,
    /// trans_nums seen inside the dedupe window
    seen: RecentSet,
    /// Keeps history order and bus order identical
    publish_lock: Mutex<()>,
    scoring_timeout: Duration,
    /// Bounds blocking scoring calls, including ones abandoned after a timeout
    scoring_slots: Arc<Semaphore>,
}

impl Coordinator {
    pub fn new(
        inference: Arc<InferenceAdapter>,
        reporter: Arc<dyn Reporter>,
        bus: EventBus,
        history: Arc<HistoryRing>,
        metrics: Arc<PipelineMetrics>,
        dedupe_window: usize,
    ) -> Self {
        Self {
            inference,
            reporter,
            bus,
            history,
            store: None,
            metrics,
            seen: RecentSet::new(dedupe_window),
            publish_lock: Mutex::new(()),
            scoring_timeout: DEFAULT_SCORING_TIMEOUT,
            scoring_slots: Arc::new(Semaphore::new(DEFAULT_SCORING_SLOTS)),
        }
    }

    /// Persist every published event to `store`
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_scoring_timeout(mut self, timeout: Duration) -> Self {
        self.scoring_timeout = timeout;
        self
    }

    /// At most `slots` classifier calls run at once
    pub fn with_scoring_slots(mut self, slots: usize) -> Self {
        self.scoring_slots = Arc::new(Semaphore::new(slots.max(1)));
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn history(&self) -> &Arc<HistoryRing> {
        &self.history
    }

    /// Admit a trans_num unless it was already seen inside the dedupe window
    pub fn accept(&self, trans_num: &str) -> bool {
        if self.seen.insert(trans_num) {
            true
        } else {
            self.metrics.record_duplicate();
            info!(trans_num = %trans_num, "Duplicate transaction skipped");
            false
        }
    }

    /// Take one transaction through every stage; always yields an event
    pub async fn process(&self, transaction: Transaction) -> Arc<Event> {
        let started = Instant::now();
        let transaction = Arc::new(transaction);
        let trans_num = transaction.trans_num.clone();
        debug!(trans_num = %trans_num, stage = %Stage::Received);

        let verdict = self.score(&transaction).await;
        debug!(
            trans_num = %trans_num,
            stage = %Stage::Scored,
            fraud = verdict.fraud,
            score = verdict.score,
            fallback = verdict.fallback
        );

        let report = self.reporter.report(&trans_num, verdict.flag_value()).await;
        debug!(trans_num = %trans_num, stage = %Stage::Reported, status = ?report.status);

        let event = self.publish(transaction, verdict, report, started);
        self.metrics.record_event(
            &event.verdict,
            event.report_result.status,
            Duration::from_micros(event.processing_time_us),
        );
        debug!(trans_num = %trans_num, stage = %Stage::Published, event_id = %event.event_id);

        if event.is_fraud() {
            info!(
                trans_num = %trans_num,
                score = event.verdict.score,
                fallback = event.verdict.fallback,
                report = ?event.report_result.status,
                "Fraud flagged"
            );
        }

        if let Some(store) = &self.store {
            match store.append(&event).await {
                Ok(()) => debug!(trans_num = %trans_num, stage = %Stage::Persisted),
                Err(e) => warn!(trans_num = %trans_num, error = %e, "Failed to persist event"),
            }
        }

        event
    }

    async fn score(&self, transaction: &Arc<Transaction>) -> Verdict {
        let trans_num = transaction.trans_num.as_str();
        let adapter = Arc::clone(&self.inference);
        let input = Arc::clone(transaction);
        let slots = Arc::clone(&self.scoring_slots);
        let started = Instant::now();

        // The slot moves into the blocking task and is released only when the classifier
        // returns, so a timed-out call keeps occupying it
        let scored = tokio::time::timeout(self.scoring_timeout, async move {
            let slot = slots
                .acquire_owned()
                .await
                .map_err(|_| InferenceFault::Unavailable("scoring slots closed".to_string()))?;
            tokio::task::spawn_blocking(move || {
                let _slot = slot;
                adapter.score(&input)
            })
            .await
            .map_err(|e| InferenceFault::Model(format!("scoring task failed: {e}")))?
        })
        .await;

        let result = scored.unwrap_or(Err(InferenceFault::Timeout(self.scoring_timeout)));
        self.metrics.record_inference_time(started.elapsed());

        match result {
            Ok(probability) => {
                let fraud = InferenceAdapter::decide(probability, self.inference.threshold());
                Verdict::scored(trans_num, probability, fraud)
            }
            // Already logged once when fallback mode was entered
            Err(InferenceFault::Unavailable(_)) => Verdict::fallback(trans_num),
            Err(fault) => {
                warn!(trans_num = %trans_num, error = %fault, "Scoring failed, using fallback verdict");
                Verdict::fallback(trans_num)
            }
        }
    }

    fn publish(
        &self,
        transaction: Arc<Transaction>,
        verdict: Verdict,
        report: ReportResult,
        started: Instant,
    ) -> Arc<Event> {
        let _guard = self
            .publish_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let event = Arc::new(Event::new(
            transaction,
            verdict,
            report,
            started.elapsed().as_micros() as u64,
        ));
        self.history.append(Arc::clone(&event));
        let delivered = self.bus.publish(Arc::clone(&event));
        debug!(trans_num = %event.trans_num, subscribers = delivered, "Event published");

        event
    }

    /// Dispatch transactions from `rx`, at most `workers` at a time.
    ///
    /// A permit is taken before the next transaction is pulled, so a saturated pipeline
    /// leaves transactions in the channel and the producer waits on `send`. Returns once
    /// the channel is closed and every in-flight transaction has been published.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Transaction>, workers: usize) {
        let workers = workers.max(1);
        let permits = Arc::new(Semaphore::new(workers));
        info!(workers, "Coordinator started");

        loop {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let Some(transaction) = rx.recv().await else {
                break;
            };
            self.metrics.record_received();

            if !self.accept(&transaction.trans_num) {
                continue;
            }

            let coordinator = Arc::clone(&self);
            tokio::spawn(async move {
                coordinator.process(transaction).await;
                drop(permit);
            });
        }

        info!("Hand-off channel closed, draining in-flight transactions");
        let _ = permits.acquire_many(workers as u32).await;
        info!("Coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusMessage;
    use crate::feature_extractor::{FeatureExtractor, FeatureSchema};
    use crate::models::{Classifier, Scorer};
    use crate::store::{EventQuery, MemoryStore};
    use crate::types::ReportStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedScorer(f64);

    impl Scorer for FixedScorer {
        fn name(&self) -> &str {
            "fixed"
        }

        fn score(&self, _features: &[f32]) -> anyhow::Result<f64> {
            Ok(self.0)
        }
    }

    struct SlowScorer;

    impl Scorer for SlowScorer {
        fn name(&self) -> &str {
            "slow"
        }

        fn score(&self, _features: &[f32]) -> anyhow::Result<f64> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(0.0)
        }
    }

    /// Sleeps through every call and records how many ran at once
    #[derive(Default)]
    struct ConcurrencyScorer {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Scorer for Arc<ConcurrencyScorer> {
        fn name(&self) -> &str {
            "concurrency"
        }

        fn score(&self, _features: &[f32]) -> anyhow::Result<f64> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(150));
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(0.0)
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        calls: Mutex<Vec<(String, u8)>>,
    }

    #[async_trait]
    impl Reporter for RecordingReporter {
        async fn report(&self, trans_num: &str, flag_value: u8) -> ReportResult {
            self.calls
                .lock()
                .unwrap()
                .push((trans_num.to_string(), flag_value));
            ReportResult::accepted(None, 1)
        }
    }

    fn adapter(scorer: impl Scorer + 'static) -> Arc<InferenceAdapter> {
        let classifier = Classifier {
            scorer: Arc::new(scorer),
            features: FeatureExtractor::new(FeatureSchema::new("test", vec!["amt".to_string()])),
        };
        Arc::new(InferenceAdapter::with_classifier(classifier, 0.5, 1))
    }

    fn coordinator(inference: Arc<InferenceAdapter>, reporter: Arc<RecordingReporter>) -> Coordinator {
        Coordinator::new(
            inference,
            reporter,
            EventBus::new(16, Duration::from_secs(15)),
            Arc::new(HistoryRing::new(100)),
            Arc::new(PipelineMetrics::new()),
            1000,
        )
    }

    #[tokio::test]
    async fn test_fraud_is_reported_and_published() {
        let reporter = Arc::new(RecordingReporter::default());
        let coordinator = coordinator(adapter(FixedScorer(0.9)), reporter.clone());
        let mut subscription = coordinator.bus().subscribe();

        let event = coordinator.process(Transaction::new("T1").with_amount(950.0)).await;

        assert!(event.verdict.fraud);
        assert!(!event.verdict.fallback);
        assert_eq!(event.report_result.status, ReportStatus::Accepted);
        assert_eq!(*reporter.calls.lock().unwrap(), vec![("T1".to_string(), 1)]);
        assert_eq!(coordinator.history().latest().unwrap().event_id, event.event_id);

        match subscription.recv().await.unwrap() {
            BusMessage::Update(received) => assert_eq!(received.event_id, event.event_id),
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unavailable_classifier_yields_fallback_verdict() {
        let reporter = Arc::new(RecordingReporter::default());
        let inference = Arc::new(InferenceAdapter::new(
            || anyhow::bail!("no model"),
            0.5,
            1,
        ));
        let coordinator = coordinator(inference, reporter.clone());

        let event = coordinator.process(Transaction::new("T1")).await;
        assert!(event.verdict.fallback);
        assert!(event.verdict.fraud);
        assert_eq!(event.verdict.score, 1.0);
        assert_eq!(reporter.calls.lock().unwrap()[0].1, 1);
    }

    #[tokio::test]
    async fn test_scoring_timeout_yields_fallback_verdict() {
        let reporter = Arc::new(RecordingReporter::default());
        let coordinator = coordinator(adapter(SlowScorer), reporter)
            .with_scoring_timeout(Duration::from_millis(20));

        let event = coordinator.process(Transaction::new("T1")).await;
        assert!(event.verdict.fallback);
    }

    #[tokio::test]
    async fn test_legitimate_transaction_is_reported_with_zero() {
        let reporter = Arc::new(RecordingReporter::default());
        let coordinator = coordinator(adapter(FixedScorer(0.5)), reporter.clone());

        let event = coordinator.process(Transaction::new("T2")).await;
        assert!(!event.verdict.fraud);
        assert_eq!(reporter.calls.lock().unwrap()[0], ("T2".to_string(), 0));
    }

    #[tokio::test]
    async fn test_events_are_persisted_when_store_is_configured() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(adapter(FixedScorer(0.1)), Arc::new(RecordingReporter::default()))
            .with_store(store.clone());

        coordinator.process(Transaction::new("T1")).await;
        let stored = store.query(&EventQuery::default()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].trans_num, "T1");
    }

    #[tokio::test]
    async fn test_run_skips_duplicates_and_drains() {
        let reporter = Arc::new(RecordingReporter::default());
        let coordinator = Arc::new(coordinator(adapter(FixedScorer(0.2)), reporter.clone()));
        let (tx, rx) = mpsc::channel(8);

        let handle = tokio::spawn(Arc::clone(&coordinator).run(rx, 2));
        for trans_num in ["A", "B", "A", "C", "B"] {
            tx.send(Transaction::new(trans_num)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let mut published: Vec<String> = coordinator
            .history()
            .snapshot()
            .iter()
            .map(|e| e.trans_num.clone())
            .collect();
        published.sort();
        assert_eq!(published, ["A", "B", "C"]);
        assert_eq!(reporter.calls.lock().unwrap().len(), 3);
        assert_eq!(coordinator.metrics.snapshot().duplicates_skipped, 2);
        assert_eq!(coordinator.metrics.snapshot().transactions_received, 5);
    }

    #[tokio::test]
    async fn test_timed_out_scoring_still_counts_against_the_worker_bound() {
        let scorer = Arc::new(ConcurrencyScorer::default());
        let coordinator = Arc::new(
            coordinator(adapter(Arc::clone(&scorer)), Arc::new(RecordingReporter::default()))
                .with_scoring_timeout(Duration::from_millis(20))
                .with_scoring_slots(2),
        );
        let (tx, rx) = mpsc::channel(16);

        let handle = tokio::spawn(Arc::clone(&coordinator).run(rx, 2));
        for i in 0..8 {
            tx.send(Transaction::new(format!("S{i}"))).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let events = coordinator.history().snapshot();
        assert_eq!(events.len(), 8);
        assert!(events.iter().all(|e| e.verdict.fallback));

        // Let the abandoned classifier calls finish
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(scorer.running.load(Ordering::SeqCst), 0);
        let peak = scorer.peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak concurrency {peak}");
    }
}
