//! Fraud Stream Pipeline Library
//!
//! Real-time transaction fraud screening: a resilient SSE consumer feeds a
//! coordinator that scores each transaction with an ONNX classifier, reports the
//! verdict to the upstream authority and fans the resulting event out to live
//! subscribers and a bounded replay history.

pub mod api;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod feature_extractor;
pub mod history;
pub mod metrics;
pub mod models;
pub mod recent;
pub mod reporter;
pub mod store;
pub mod types;

pub use bus::{BusMessage, EventBus, Subscription};
pub use config::AppConfig;
pub use consumer::StreamConsumer;
pub use coordinator::Coordinator;
pub use feature_extractor::FeatureExtractor;
pub use history::HistoryRing;
pub use models::inference::InferenceAdapter;
pub use reporter::{HttpReporter, Reporter};
pub use store::{MemoryStore, Store};
pub use types::{Event, ReportResult, ReportStatus, Transaction, Verdict};
