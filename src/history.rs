//! Bounded replay history of published events

use crate::types::Event;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};

/// Event totals by verdict
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerdictCounts {
    pub total: u64,
    pub fraud: u64,
    pub legitimate: u64,
    pub fallback: u64,
}

/// Fixed-capacity FIFO of the most recent events.
///
/// Appends and reads take the lock for the whole operation, so readers always see a
/// complete sequence; reads hand out copies of the `Arc`s, never the buffer itself.
pub struct HistoryRing {
    capacity: usize,
    events: RwLock<VecDeque<Arc<Event>>>,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append an event, evicting the oldest one when full
    pub fn append(&self, event: Arc<Event>) {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// The `n` most recent events, oldest first
    pub fn last_n(&self, n: usize) -> Vec<Arc<Event>> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        let skip = events.len().saturating_sub(n);
        events.iter().skip(skip).cloned().collect()
    }

    /// Events published at or after `cutoff`, oldest first
    pub fn since(&self, cutoff: DateTime<Utc>) -> Vec<Arc<Event>> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        // Wall-clock stamps can step backwards, so every event is checked
        events
            .iter()
            .filter(|event| event.published_at >= cutoff)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<Event>> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<Arc<Event>> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events.back().cloned()
    }

    /// Aggregate the retained events by verdict
    pub fn counts(&self) -> VerdictCounts {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events.iter().fold(VerdictCounts::default(), |mut counts, event| {
            counts.total += 1;
            if event.verdict.fraud {
                counts.fraud += 1;
            } else {
                counts.legitimate += 1;
            }
            if event.verdict.fallback {
                counts.fallback += 1;
            }
            counts
        })
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HistoryRing {
    fn default() -> Self {
        Self::new(1000)
    }
}
