//! Fault taxonomy for the pipeline.
//!
//! Each fault is contained where it occurs: connection faults trigger a reconnect,
//! parse faults skip the payload, inference faults produce the fallback verdict and
//! report faults end up in the event's `report_result`. Only [`PipelineError`] ever
//! reaches a caller, through the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::time::Duration;
use thiserror::Error;

/// Stream-level failure; the consumer closes the connection and reconnects
#[derive(Debug, Error)]
pub enum ConnectionFault {
    #[error("stream transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("stream endpoint answered HTTP {0}")]
    Status(u16),

    #[error("stream ended by the server")]
    Ended,

    #[error("no data received for {0:?}")]
    Idle(Duration),

    #[error("event frame exceeds {0} bytes")]
    Oversized(usize),

    #[error("undecodable event stream: {0}")]
    Decode(String),
}

/// Malformed stream payload; skipped without touching the connection
#[derive(Debug, Error)]
pub enum ParseFault {
    #[error("invalid transaction JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transaction has no trans_num")]
    MissingTransNum,
}

/// Scoring failure; the coordinator substitutes the fallback verdict
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceFault {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),

    #[error("classifier error: {0}")]
    Model(String),

    #[error("scoring exceeded {0:?}")]
    Timeout(Duration),
}

/// Outcome of one flag attempt that did not end in a plain acceptance
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReportFault {
    /// Timeout, network error, 5xx or 429; eligible for retry
    #[error("transient report failure: {0}")]
    Transient(String),

    /// The authority already holds a flag for this transaction
    #[error("already reported: {0}")]
    Duplicate(String),

    /// Any other rejection; recorded, never retried
    #[error("report rejected (HTTP {status}): {reason}")]
    Rejected { status: u16, reason: String },
}

/// A subscription can no longer deliver events
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriberFault {
    #[error("event bus closed")]
    BusClosed,
}

/// Errors surfaced to HTTP clients
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("pipeline is saturated, retry later")]
    Backpressure,

    #[error("pipeline is shutting down")]
    ShuttingDown,

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error(transparent)]
    Parse(#[from] ParseFault),
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = match &self {
            PipelineError::BadRequest(_) | PipelineError::Parse(_) => StatusCode::BAD_REQUEST,
            PipelineError::Backpressure | PipelineError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PipelineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
