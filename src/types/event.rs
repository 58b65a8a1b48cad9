//! Published pipeline events

use crate::types::transaction::Transaction;
use crate::types::verdict::{ReportResult, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// One screened transaction: what came in, what was decided and what the authority said.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub trans_num: String,
    pub transaction: Arc<Transaction>,
    pub verdict: Verdict,
    pub report_result: ReportResult,
    /// Stamped when the event enters history and the bus
    pub published_at: DateTime<Utc>,
    /// Time from hand-off to publication
    pub processing_time_us: u64,
}

impl Event {
    pub fn new(
        transaction: Arc<Transaction>,
        verdict: Verdict,
        report_result: ReportResult,
        processing_time_us: u64,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            trans_num: transaction.trans_num.clone(),
            transaction,
            verdict,
            report_result,
            published_at: Utc::now(),
            processing_time_us,
        }
    }

    pub fn is_fraud(&self) -> bool {
        self.verdict.fraud
    }
}
