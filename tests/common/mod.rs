use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fraud_stream_pipeline::config::{ReporterConfig, StreamConfig};
use fraud_stream_pipeline::feature_extractor::{FeatureExtractor, FeatureSchema};
use fraud_stream_pipeline::models::{Classifier, InferenceAdapter, Scorer};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// Serve `router` on an ephemeral local port
pub async fn spawn_server(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Poll `condition` until it holds or `timeout` elapses
#[allow(unused)]
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// One connection's worth of scripted behavior for the SSE source
#[allow(unused)]
#[derive(Debug, Clone)]
pub enum Session {
    /// Answer with this status and no stream
    Reject(StatusCode),
    /// Send these body chunks verbatim, then end the stream
    Chunks(Vec<String>),
}

/// Scripted upstream event stream; once the script is exhausted connections stay open and silent
#[derive(Default)]
pub struct StreamSource {
    sessions: Mutex<VecDeque<Session>>,
    connections: AtomicUsize,
    api_keys: Mutex<Vec<String>>,
}

#[allow(unused)]
impl StreamSource {
    pub async fn start(sessions: Vec<Session>) -> (Arc<Self>, String) {
        let source = Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            ..Self::default()
        });
        let router = Router::new()
            .route("/stream", get(stream_handler))
            .with_state(Arc::clone(&source));
        let addr = spawn_server(router).await;
        (source, format!("http://{addr}/stream"))
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn api_keys(&self) -> Vec<String> {
        self.api_keys.lock().unwrap().clone()
    }
}

async fn stream_handler(State(source): State<Arc<StreamSource>>, headers: HeaderMap) -> Response {
    source.connections.fetch_add(1, Ordering::SeqCst);
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    source.api_keys.lock().unwrap().push(key);

    let session = source.sessions.lock().unwrap().pop_front();
    let sse = [(header::CONTENT_TYPE, "text/event-stream")];
    match session {
        Some(Session::Reject(status)) => status.into_response(),
        Some(Session::Chunks(chunks)) => {
            let body = futures::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
            (sse, Body::from_stream(body)).into_response()
        }
        None => {
            let body = futures::stream::pending::<Result<String, std::io::Error>>();
            (sse, Body::from_stream(body)).into_response()
        }
    }
}

/// SSE frame carrying `data` as a default message
#[allow(unused)]
pub fn frame(data: &str) -> String {
    format!("data: {data}\n\n")
}

/// How the mock flag endpoint answers
#[allow(unused)]
#[derive(Debug, Clone)]
pub enum FlagBehavior {
    /// First flag per trans_num succeeds, repeats are answered "already flagged"
    Idempotent,
    /// Always answer with this status and raw body
    Respond(StatusCode, String),
    /// Answer 503 to the first `n` calls, then behave idempotently
    FailFirst(usize),
    /// Wait before answering successfully
    Delay(Duration),
}

/// Mock of the authority's flag endpoint
pub struct FlagAuthority {
    behavior: FlagBehavior,
    calls: AtomicUsize,
    flags: Mutex<Vec<(String, u8)>>,
}

#[allow(unused)]
impl FlagAuthority {
    pub async fn start(behavior: FlagBehavior) -> (Arc<Self>, String) {
        let authority = Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
            flags: Mutex::new(Vec::new()),
        });
        let router = Router::new()
            .route("/api/flag", post(flag_handler))
            .with_state(Arc::clone(&authority));
        let addr = spawn_server(router).await;
        (authority, format!("http://{addr}/api/flag"))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn flags(&self) -> Vec<(String, u8)> {
        self.flags.lock().unwrap().clone()
    }

    fn record(&self, trans_num: &str, flag_value: u8) -> Response {
        let mut flags = self.flags.lock().unwrap();
        if flags.iter().any(|(t, _)| t == trans_num) {
            return Json(json!({"success": false, "reason": "Transaction already flagged"}))
                .into_response();
        }
        flags.push((trans_num.to_string(), flag_value));
        Json(json!({"success": true, "reason": "Response recorded successfully"})).into_response()
    }
}

async fn flag_handler(State(authority): State<Arc<FlagAuthority>>, Json(body): Json<Value>) -> Response {
    let call = authority.calls.fetch_add(1, Ordering::SeqCst) + 1;
    let trans_num = body["trans_num"].as_str().unwrap_or_default().to_string();
    let flag_value = body["flag_value"].as_u64().unwrap_or(u64::MAX) as u8;

    match &authority.behavior {
        FlagBehavior::Idempotent => authority.record(&trans_num, flag_value),
        FlagBehavior::Respond(status, body) => (*status, body.clone()).into_response(),
        FlagBehavior::FailFirst(n) if call <= *n => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        FlagBehavior::FailFirst(_) => authority.record(&trans_num, flag_value),
        FlagBehavior::Delay(delay) => {
            tokio::time::sleep(*delay).await;
            authority.record(&trans_num, flag_value)
        }
    }
}

#[allow(unused)]
pub fn stream_config(url: String) -> StreamConfig {
    StreamConfig {
        url,
        api_key: "stream-key".to_string(),
        reconnect_delay_ms: 10,
        max_reconnect_delay_ms: 50,
        connect_timeout_ms: 1000,
        idle_timeout_secs: 0,
        max_event_bytes: 64 * 1024,
        accept_invalid_certs: false,
    }
}

#[allow(unused)]
pub fn reporter_config(url: String) -> ReporterConfig {
    ReporterConfig {
        url,
        api_key: "flag-key".to_string(),
        timeout_ms: 1000,
        max_retries: 2,
        retry_backoff_ms: 5,
        ..ReporterConfig::default()
    }
}

/// Scorer that always returns the same probability
#[allow(unused)]
pub struct FixedScorer(pub f64);

impl Scorer for FixedScorer {
    fn name(&self) -> &str {
        "fixed"
    }

    fn score(&self, _features: &[f32]) -> anyhow::Result<f64> {
        Ok(self.0)
    }
}

/// Scorer that returns `amt / 1000`, capped at 1
#[allow(unused)]
pub struct AmountScorer;

impl Scorer for AmountScorer {
    fn name(&self) -> &str {
        "amount"
    }

    fn score(&self, features: &[f32]) -> anyhow::Result<f64> {
        Ok((features.first().copied().unwrap_or(0.0) as f64 / 1000.0).min(1.0))
    }
}

#[allow(unused)]
pub fn adapter(scorer: impl Scorer + 'static, threshold: f64) -> Arc<InferenceAdapter> {
    let classifier = Classifier {
        scorer: Arc::new(scorer),
        features: FeatureExtractor::new(FeatureSchema::new("test", vec!["amt".to_string()])),
    };
    Arc::new(InferenceAdapter::with_classifier(classifier, threshold, 1))
}
