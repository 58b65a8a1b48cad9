//! Idempotent flag reporting to the upstream authority

use crate::config::ReporterConfig;
use crate::error::ReportFault;
use crate::recent::RecentSet;
use crate::types::verdict::ReportResult;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Header carrying the authority API key
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Sends verdicts to the authority.
///
/// Implementations never fail: every outcome, including transport errors, is
/// described by the returned [`ReportResult`].
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, trans_num: &str, flag_value: u8) -> ReportResult;
}

#[derive(Debug, Serialize)]
struct FlagRequest<'a> {
    trans_num: &'a str,
    flag_value: u8,
}

#[derive(Debug, Deserialize)]
struct FlagResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// HTTP reporter for the authority's flag endpoint
pub struct HttpReporter {
    client: reqwest::Client,
    url: String,
    api_key: String,
    max_retries: u32,
    retry_backoff: Duration,
    duplicate_markers: Vec<String>,
    /// Transactions this process already got a definitive answer for
    reported: RecentSet,
}

impl HttpReporter {
    pub fn new(config: &ReporterConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .context("Failed to build reporter HTTP client")?;

        Ok(Self {
            client,
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
            duplicate_markers: config
                .duplicate_markers
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
            reported: RecentSet::new(config.memo_capacity),
        })
    }

    fn is_duplicate(&self, reason: &str) -> bool {
        let reason = reason.to_lowercase();
        self.duplicate_markers.iter().any(|m| reason.contains(m.as_str()))
    }

    /// One POST, classified. `Ok` carries the authority's reason on acceptance.
    async fn attempt(&self, request: &FlagRequest<'_>) -> std::result::Result<Option<String>, ReportFault> {
        let response = self
            .client
            .post(&self.url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| ReportFault::Transient(describe(&e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ReportFault::Transient(describe(&e)))?;

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ReportFault::Transient(format!("authority answered HTTP {}", status.as_u16())));
        }

        match serde_json::from_str::<FlagResponse>(&body) {
            Ok(answer) if answer.success && status.is_success() => Ok(answer.reason),
            Ok(answer) => {
                let reason = answer
                    .reason
                    .unwrap_or_else(|| format!("rejected with HTTP {}", status.as_u16()));
                if status == StatusCode::CONFLICT || self.is_duplicate(&reason) {
                    Err(ReportFault::Duplicate(reason))
                } else {
                    Err(ReportFault::Rejected {
                        status: status.as_u16(),
                        reason,
                    })
                }
            }
            Err(_) if status == StatusCode::CONFLICT => {
                Err(ReportFault::Duplicate("authority answered HTTP 409".to_string()))
            }
            Err(_) => Err(ReportFault::Rejected {
                status: status.as_u16(),
                reason: format!("non-json response ({})", status.as_u16()),
            }),
        }
    }
}

#[async_trait]
impl Reporter for HttpReporter {
    async fn report(&self, trans_num: &str, flag_value: u8) -> ReportResult {
        if self.reported.contains(trans_num) {
            debug!(trans_num = %trans_num, "Flag already reported by this pipeline");
            return ReportResult::already_reported("already reported by this pipeline", 0);
        }

        let request = FlagRequest {
            trans_num,
            flag_value,
        };
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.attempt(&request).await {
                Ok(reason) => {
                    self.reported.insert(trans_num);
                    info!(trans_num = %trans_num, flag_value, attempts, "Flag accepted");
                    return ReportResult::accepted(reason, attempts);
                }
                Err(ReportFault::Duplicate(reason)) => {
                    self.reported.insert(trans_num);
                    info!(trans_num = %trans_num, reason = %reason, "Flag already recorded by authority");
                    return ReportResult::already_reported(reason, attempts);
                }
                Err(fault @ ReportFault::Rejected { .. }) => {
                    warn!(trans_num = %trans_num, error = %fault, "Flag rejected");
                    return ReportResult::rejected(fault.to_string(), attempts);
                }
                Err(ReportFault::Transient(reason)) if attempts <= self.max_retries => {
                    let delay = self.retry_backoff * 2u32.saturating_pow(attempts - 1);
                    warn!(
                        trans_num = %trans_num,
                        reason = %reason,
                        attempt = attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        "Flag attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(ReportFault::Transient(reason)) => {
                    warn!(trans_num = %trans_num, reason = %reason, attempts, "Flag failed, retries exhausted");
                    return ReportResult::failed(reason, attempts);
                }
            }
        }
    }
}

fn describe(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        error.to_string()
    }
}
