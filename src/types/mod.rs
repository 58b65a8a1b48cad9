//! Type definitions for the fraud stream pipeline

pub mod event;
pub mod transaction;
pub mod verdict;

pub use event::Event;
pub use transaction::Transaction;
pub use verdict::{ReportResult, ReportStatus, Verdict};
