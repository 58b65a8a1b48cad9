mod common;

use axum::http::StatusCode;
use common::{reporter_config, FlagAuthority, FlagBehavior};
use fraud_stream_pipeline::reporter::{HttpReporter, Reporter};
use fraud_stream_pipeline::types::ReportStatus;
use std::time::Duration;

#[tokio::test]
async fn test_flag_accepted() {
    let (authority, url) = FlagAuthority::start(FlagBehavior::Idempotent).await;
    let reporter = HttpReporter::new(&reporter_config(url)).unwrap();

    let result = reporter.report("T1", 1).await;
    assert!(result.success);
    assert_eq!(result.status, ReportStatus::Accepted);
    assert_eq!(result.reason.as_deref(), Some("Response recorded successfully"));
    assert_eq!(result.attempts, 1);
    assert_eq!(authority.flags(), vec![("T1".to_string(), 1)]);
}

#[tokio::test]
async fn test_repeat_report_is_answered_locally() {
    let (authority, url) = FlagAuthority::start(FlagBehavior::Idempotent).await;
    let reporter = HttpReporter::new(&reporter_config(url)).unwrap();

    assert_eq!(reporter.report("T1", 0).await.status, ReportStatus::Accepted);
    let repeat = reporter.report("T1", 0).await;

    assert!(repeat.success);
    assert_eq!(repeat.status, ReportStatus::AlreadyReported);
    assert_eq!(repeat.attempts, 0);
    assert_eq!(authority.calls(), 1);
}

#[tokio::test]
async fn test_flag_already_held_by_authority_counts_as_success() {
    let (authority, url) = FlagAuthority::start(FlagBehavior::Idempotent).await;

    // Two pipeline instances reporting the same transaction
    let first = HttpReporter::new(&reporter_config(url.clone())).unwrap();
    let second = HttpReporter::new(&reporter_config(url)).unwrap();

    assert_eq!(first.report("T1", 1).await.status, ReportStatus::Accepted);
    let result = second.report("T1", 1).await;

    assert!(result.success);
    assert_eq!(result.status, ReportStatus::AlreadyReported);
    assert_eq!(result.reason.as_deref(), Some("Transaction already flagged"));
    assert_eq!(authority.flags().len(), 1);
}

#[tokio::test]
async fn test_conflict_status_means_already_reported() {
    let (_authority, url) =
        FlagAuthority::start(FlagBehavior::Respond(StatusCode::CONFLICT, String::new())).await;
    let reporter = HttpReporter::new(&reporter_config(url)).unwrap();

    let result = reporter.report("T1", 1).await;
    assert!(result.success);
    assert_eq!(result.status, ReportStatus::AlreadyReported);
}

#[tokio::test]
async fn test_expired_transaction_is_not_retried() {
    let body = r#"{"success": false, "reason": "Transaction expired or not found"}"#.to_string();
    let (authority, url) = FlagAuthority::start(FlagBehavior::Respond(StatusCode::NOT_FOUND, body)).await;
    let reporter = HttpReporter::new(&reporter_config(url)).unwrap();

    let result = reporter.report("T1", 1).await;
    assert_eq!(result.status, ReportStatus::AlreadyReported);
    assert_eq!(authority.calls(), 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let (authority, url) = FlagAuthority::start(FlagBehavior::FailFirst(2)).await;
    let reporter = HttpReporter::new(&reporter_config(url)).unwrap();

    let result = reporter.report("T1", 1).await;
    assert_eq!(result.status, ReportStatus::Accepted);
    assert_eq!(result.attempts, 3);
    assert_eq!(authority.calls(), 3);
}

#[tokio::test]
async fn test_retries_exhausted_is_a_failure() {
    let (authority, url) = FlagAuthority::start(FlagBehavior::FailFirst(10)).await;
    let reporter = HttpReporter::new(&reporter_config(url)).unwrap();

    let result = reporter.report("T1", 1).await;
    assert!(!result.success);
    assert_eq!(result.status, ReportStatus::Failed);
    assert_eq!(result.attempts, 3);
    assert_eq!(authority.calls(), 3);
    assert!(result.reason.unwrap().contains("503"));
}

#[tokio::test]
async fn test_rejection_is_recorded_not_retried() {
    let body = r#"{"success": false, "reason": "Invalid API key"}"#.to_string();
    let (authority, url) =
        FlagAuthority::start(FlagBehavior::Respond(StatusCode::UNAUTHORIZED, body)).await;
    let reporter = HttpReporter::new(&reporter_config(url)).unwrap();

    let result = reporter.report("T1", 1).await;
    assert!(!result.success);
    assert_eq!(result.status, ReportStatus::Rejected);
    assert!(result.reason.unwrap().contains("Invalid API key"));
    assert_eq!(authority.calls(), 1);
}

#[tokio::test]
async fn test_non_json_response() {
    let (_authority, url) = FlagAuthority::start(FlagBehavior::Respond(
        StatusCode::BAD_REQUEST,
        "<html>bad request</html>".to_string(),
    ))
    .await;
    let reporter = HttpReporter::new(&reporter_config(url)).unwrap();

    let result = reporter.report("T1", 1).await;
    assert_eq!(result.status, ReportStatus::Rejected);
    assert!(result.reason.unwrap().contains("non-json response (400)"));
}

#[tokio::test]
async fn test_timeout_ends_as_failure() {
    let (_authority, url) = FlagAuthority::start(FlagBehavior::Delay(Duration::from_secs(2))).await;
    let mut config = reporter_config(url);
    config.timeout_ms = 100;
    config.max_retries = 1;
    let reporter = HttpReporter::new(&config).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), reporter.report("T1", 1))
        .await
        .expect("report must be bounded by its timeout");
    assert_eq!(result.status, ReportStatus::Failed);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.reason.as_deref(), Some("request timed out"));
}
