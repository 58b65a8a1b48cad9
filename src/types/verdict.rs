//! Scoring verdicts and reporting outcomes

use serde::{Deserialize, Serialize};

/// Score carried by the fallback verdict
pub const FALLBACK_SCORE: f64 = 1.0;

/// Fraud decision for one transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub trans_num: String,
    /// `true` = fraud
    pub fraud: bool,
    /// Fraud probability (0.0 - 1.0)
    pub score: f64,
    /// Set when the classifier could not be used
    pub fallback: bool,
}

impl Verdict {
    /// Verdict produced by the classifier
    pub fn scored(trans_num: impl Into<String>, score: f64, fraud: bool) -> Self {
        Self {
            trans_num: trans_num.into(),
            fraud,
            score: score.clamp(0.0, 1.0),
            fallback: false,
        }
    }

    /// Degraded-path verdict: without a classifier every transaction is treated as fraud
    pub fn fallback(trans_num: impl Into<String>) -> Self {
        Self {
            trans_num: trans_num.into(),
            fraud: true,
            score: FALLBACK_SCORE,
            fallback: true,
        }
    }

    /// Wire value for the authority: 1 = fraud, 0 = legitimate
    pub fn flag_value(&self) -> u8 {
        u8::from(self.fraud)
    }
}

/// How a report ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// The authority recorded the flag
    Accepted,
    /// The flag was already recorded (or the transaction expired); nothing left to do
    AlreadyReported,
    /// The authority refused the flag
    Rejected,
    /// The authority could not be reached within the retry budget
    Failed,
}

/// Outcome of the external flag call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub status: ReportStatus,
    /// Network attempts made (0 when answered from the local memo)
    pub attempts: u32,
}

impl ReportResult {
    fn new(status: ReportStatus, reason: Option<String>, attempts: u32) -> Self {
        Self {
            success: matches!(status, ReportStatus::Accepted | ReportStatus::AlreadyReported),
            reason,
            status,
            attempts,
        }
    }

    pub fn accepted(reason: Option<String>, attempts: u32) -> Self {
        Self::new(ReportStatus::Accepted, reason, attempts)
    }

    pub fn already_reported(reason: impl Into<String>, attempts: u32) -> Self {
        Self::new(ReportStatus::AlreadyReported, Some(reason.into()), attempts)
    }

    pub fn rejected(reason: impl Into<String>, attempts: u32) -> Self {
        Self::new(ReportStatus::Rejected, Some(reason.into()), attempts)
    }

    pub fn failed(reason: impl Into<String>, attempts: u32) -> Self {
        Self::new(ReportStatus::Failed, Some(reason.into()), attempts)
    }
}
