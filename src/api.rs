//! HTTP query and subscription surface
//!
//! Read-only views over the history ring and the optional store, a live SSE feed
//! backed by the event bus, and an ingest endpoint sharing the stream consumer's
//! hand-off channel.

use crate::bus::{BusMessage, EventBus};
use crate::error::{PipelineError, Result};
use crate::history::{HistoryRing, VerdictCounts};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::models::InferenceAdapter;
use crate::store::{EventQuery, Store};
use crate::types::{Event, Transaction};
use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseFrame, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const DEFAULT_LIMIT: usize = 100;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub history: Arc<HistoryRing>,
    pub bus: EventBus,
    pub metrics: Arc<PipelineMetrics>,
    pub inference: Arc<InferenceAdapter>,
    pub store: Option<Arc<dyn Store>>,
    pub ingest: mpsc::Sender<Transaction>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub count: usize,
    pub events: Vec<Arc<Event>>,
}

impl From<Vec<Arc<Event>>> for EventsResponse {
    fn from(events: Vec<Arc<Event>>) -> Self {
        Self {
            count: events.len(),
            events,
        }
    }
}

/// Body of `GET /stats`
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    #[serde(flatten)]
    pub pipeline: MetricsSnapshot,
    /// Verdict totals over the events currently in history
    pub history: VerdictCounts,
    pub subscribers: usize,
    pub events_dropped: u64,
    pub model: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SinceParams {
    pub since: Option<DateTime<Utc>>,
    pub minutes: Option<i64>,
}

#[derive(Debug, Serialize)]
struct IngestAccepted {
    accepted: bool,
    trans_num: String,
}

/// Build the router with every route attached to `state`
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", get(recent_events))
        .route("/events/since", get(events_since))
        .route("/events/search", get(search_events))
        .route("/stats", get(stats))
        .route("/realtime", get(realtime))
        .route("/ingest", post(ingest))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve until `shutdown` resolves and open connections finish
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!(%addr, "Query and subscription API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "model": state.inference.status(),
        "history": state.history.len(),
        "subscribers": state.bus.subscriber_count(),
    }))
}

/// GET /events?limit=N - last N events, oldest first
async fn recent_events(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Json<EventsResponse> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    Json(state.history.last_n(limit).into())
}

/// GET /events/since?since=<RFC3339> or ?minutes=M
async fn events_since(
    State(state): State<AppState>,
    Query(params): Query<SinceParams>,
) -> Result<Json<EventsResponse>> {
    let cutoff = match (params.since, params.minutes) {
        (Some(since), _) => since,
        (None, Some(minutes)) if minutes >= 0 => Utc::now() - ChronoDuration::minutes(minutes),
        (None, Some(minutes)) => {
            return Err(PipelineError::BadRequest(format!(
                "minutes must not be negative, got {minutes}"
            )))
        }
        (None, None) => {
            return Err(PipelineError::BadRequest(
                "either since or minutes is required".to_string(),
            ))
        }
    };

    Ok(Json(state.history.since(cutoff).into()))
}

/// GET /events/search?fraud=&since=&limit= - the store when configured, else history
async fn search_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Result<Json<EventsResponse>> {
    let events = match &state.store {
        Some(store) => store.query(&query).await?,
        None => query.apply(state.history.snapshot().iter()),
    };
    Ok(Json(events.into()))
}

async fn stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(StatsSnapshot {
        pipeline: state.metrics.snapshot(),
        history: state.history.counts(),
        subscribers: state.bus.subscriber_count(),
        events_dropped: state.bus.dropped_events(),
        model: state.inference.status(),
    })
}

/// GET /realtime - live `update` events and `ping` keepalives
async fn realtime(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<SseFrame, Infallible>>> {
    let subscription = state.bus.subscribe();
    debug!(subscriber = subscription.id(), "Realtime client connected");

    let stream = subscription
        .into_stream()
        .filter_map(|message| async move { to_frame(&message).map(Ok) });

    Sse::new(stream)
}

fn to_frame(message: &BusMessage) -> Option<SseFrame> {
    let frame = SseFrame::default().event(message.kind());
    let frame = match message {
        BusMessage::Update(event) => frame
            .id(event.event_id.to_string())
            .json_data(event.as_ref()),
        BusMessage::Ping(ping) => frame.json_data(ping),
    };

    match frame {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(error = %e, "Failed to serialize realtime message");
            None
        }
    }
}

/// POST /ingest - hand a transaction to the coordinator
async fn ingest(State(state): State<AppState>, body: String) -> Result<impl IntoResponse> {
    let transaction = Transaction::from_payload(&body)?;
    let trans_num = transaction.trans_num.clone();

    match state.ingest.try_send(transaction) {
        Ok(()) => {
            debug!(trans_num = %trans_num, "Transaction ingested over HTTP");
            Ok((
                StatusCode::ACCEPTED,
                Json(IngestAccepted {
                    accepted: true,
                    trans_num,
                }),
            ))
        }
        Err(TrySendError::Full(_)) => Err(PipelineError::Backpressure),
        Err(TrySendError::Closed(_)) => Err(PipelineError::ShuttingDown),
    }
}
