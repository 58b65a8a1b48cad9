//! Mock Authority
//!
//! Local stand-in for the upstream authority: streams synthetic transactions over SSE
//! and records flags with the same idempotency rules as the real flag endpoint.
//!
//! Usage: mock-authority [bind] [api_key] [delay_ms] [fraud_rate] [malformed_rate]

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use futures::Stream;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

const API_KEY_HEADER: &str = "x-api-key";

const CATEGORIES: &[&str] = &[
    "grocery_pos",
    "gas_transport",
    "home",
    "kids_pets",
    "entertainment",
    "food_dining",
    "personal_care",
    "health_fitness",
    "misc_pos",
];
const SUSPICIOUS_CATEGORIES: &[&str] = &["shopping_net", "misc_net", "grocery_net"];
const STATES: &[&str] = &["CA", "NY", "TX", "FL", "WA", "IL", "PA", "OH"];
const JOBS: &[&str] = &["Engineer", "Teacher", "Nurse", "Designer", "Accountant"];

/// Transaction generator for the synthetic stream
struct TransactionGenerator {
    rng: StdRng,
    fraud_rate: f64,
}

impl TransactionGenerator {
    fn new(fraud_rate: f64) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            fraud_rate,
        }
    }

    fn next(&mut self) -> Value {
        if self.rng.gen_bool(self.fraud_rate.clamp(0.0, 1.0)) {
            self.generate_suspicious()
        } else {
            self.generate_legitimate()
        }
    }

    /// Generate a random legitimate transaction
    fn generate_legitimate(&mut self) -> Value {
        let amt = self.rng.gen_range(5.0..250.0);
        let category = self.random_choice(CATEGORIES);
        let (lat, long) = self.home_location();
        let merchant = (
            lat + self.rng.gen_range(-0.2..0.2),
            long + self.rng.gen_range(-0.2..0.2),
        );
        let age = self.rng.gen_range(25..70);
        self.record(amt, category, (lat, long), merchant, age)
    }

    /// Generate a suspicious transaction: large online amount, distant merchant, young account holder
    fn generate_suspicious(&mut self) -> Value {
        let amt = self.rng.gen_range(800.0..5000.0);
        let category = self.random_choice(SUSPICIOUS_CATEGORIES);
        let (lat, long) = self.home_location();
        let merchant = (
            lat + self.rng.gen_range(-8.0..8.0),
            long + self.rng.gen_range(-8.0..8.0),
        );
        let age = self.rng.gen_range(18..25);
        self.record(amt, category, (lat, long), merchant, age)
    }

    fn home_location(&mut self) -> (f64, f64) {
        (self.rng.gen_range(25.0..48.0), self.rng.gen_range(-122.0..-70.0))
    }

    fn record(
        &mut self,
        amt: f64,
        category: &str,
        (lat, long): (f64, f64),
        (merch_lat, merch_long): (f64, f64),
        age: i64,
    ) -> Value {
        let now = Utc::now();
        let dob = (now - ChronoDuration::days(age * 365 + self.rng.gen_range(0..365)))
            .format("%Y-%m-%d")
            .to_string();
        let amt = (amt * 100.0).round() / 100.0;
        // Upstream sends amounts both as numbers and as strings
        let amt = if self.rng.gen_bool(0.5) {
            json!(amt)
        } else {
            json!(format!("{amt:.2}"))
        };

        json!({
            "trans_num": format!("{:032x}", self.rng.gen::<u128>()),
            "trans_date": now.format("%Y-%m-%d").to_string(),
            "trans_time": now.format("%H:%M:%S").to_string(),
            "unix_time": now.timestamp(),
            "category": category,
            "amt": amt,
            "merchant": format!("fraud_Merchant_{}", self.rng.gen_range(1..500)),
            "cc_num": format!("{:016}", self.rng.gen_range(4_000_000_000_000_000u64..4_999_999_999_999_999)),
            "acct_num": format!("{:012}", self.rng.gen_range(0..1_000_000_000_000u64)),
            "gender": self.random_choice(&["F", "M"]),
            "state": self.random_choice(STATES),
            "merch_state": self.random_choice(STATES),
            "job": self.random_choice(JOBS),
            "dob": dob,
            "lat": lat,
            "long": long,
            "merch_lat": merch_lat,
            "merch_long": merch_long,
            "city_pop": self.rng.gen_range(500..2_000_000),
        })
    }

    fn random_choice<'a>(&mut self, choices: &[&'a str]) -> &'a str {
        choices[self.rng.gen_range(0..choices.len())]
    }
}

struct Authority {
    api_key: String,
    delay: Duration,
    fraud_rate: f64,
    malformed_rate: f64,
    /// trans_nums that went out on the stream
    issued: Mutex<HashSet<String>>,
    /// Recorded flags by trans_num
    flags: Mutex<HashMap<String, u8>>,
}

impl Authority {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        self.api_key.is_empty()
            || headers
                .get(API_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|key| key == self.api_key)
    }
}

#[derive(Debug, Deserialize)]
struct FlagBody {
    trans_num: String,
    flag_value: u8,
}

async fn stream(
    State(authority): State<Arc<Authority>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    if !authority.authorized(&headers) {
        warn!("Stream request with invalid API key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    info!("Stream client connected");

    let stream = async_stream::stream! {
        let mut generator = TransactionGenerator::new(authority.fraud_rate);
        let mut interval = tokio::time::interval(authority.delay);
        loop {
            interval.tick().await;
            if generator.rng.gen_bool(authority.malformed_rate.clamp(0.0, 1.0)) {
                yield Ok(Event::default().event("transaction").data("{\"trans_num\": "));
                continue;
            }

            let transaction = generator.next();
            if let Some(trans_num) = transaction["trans_num"].as_str() {
                authority
                    .issued
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(trans_num.to_string());
            }
            yield Ok(Event::default().event("transaction").data(transaction.to_string()));
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

async fn flag(
    State(authority): State<Arc<Authority>>,
    headers: HeaderMap,
    Json(body): Json<FlagBody>,
) -> impl IntoResponse {
    if !authority.authorized(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "reason": "Invalid API key"})),
        );
    }

    let known = authority
        .issued
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(&body.trans_num);
    if !known {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "reason": "Transaction expired or not found"})),
        );
    }

    let mut flags = authority.flags.lock().unwrap_or_else(PoisonError::into_inner);
    if flags.contains_key(&body.trans_num) {
        return (
            StatusCode::OK,
            Json(json!({"success": false, "reason": "Transaction already flagged"})),
        );
    }
    flags.insert(body.trans_num.clone(), body.flag_value);
    info!(
        trans_num = %body.trans_num,
        flag_value = body.flag_value,
        total_flags = flags.len(),
        "Flag recorded"
    );

    (
        StatusCode::OK,
        Json(json!({"success": true, "reason": "Response recorded successfully"})),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mock_authority=info".parse()?),
        )
        .init();

    info!("Starting Mock Authority");

    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    let bind = args.get(1).map(|s| s.as_str()).unwrap_or("127.0.0.1:8443");
    let api_key = args.get(2).cloned().unwrap_or_default();
    let delay_ms: u64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(200);
    let fraud_rate: f64 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(0.1);
    let malformed_rate: f64 = args.get(5).and_then(|s| s.parse().ok()).unwrap_or(0.0);

    info!(
        bind = %bind,
        delay_ms = delay_ms,
        fraud_rate = fraud_rate,
        malformed_rate = malformed_rate,
        auth = !api_key.is_empty(),
        "Configuration loaded"
    );

    let authority = Arc::new(Authority {
        api_key,
        delay: Duration::from_millis(delay_ms.max(1)),
        fraud_rate,
        malformed_rate,
        issued: Mutex::new(HashSet::new()),
        flags: Mutex::new(HashMap::new()),
    });

    let app = Router::new()
        .route("/stream", get(stream))
        .route("/api/flag", post(flag))
        .with_state(authority);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Serving /stream and /api/flag on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
