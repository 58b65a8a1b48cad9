//! Durable retention collaborator

use crate::types::Event;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Filter for stored events; results are newest last
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventQuery {
    /// Keep only the last `limit` matches
    pub limit: Option<usize>,
    /// Events published at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Only fraud (`true`) or only legitimate (`false`) verdicts
    pub fraud: Option<bool>,
}

impl EventQuery {
    pub fn matches(&self, event: &Event) -> bool {
        self.since.map_or(true, |since| event.published_at >= since)
            && self.fraud.map_or(true, |fraud| event.verdict.fraud == fraud)
    }

    /// Apply the filter and limit to events in publication order
    pub fn apply<'a, I>(&self, events: I) -> Vec<Arc<Event>>
    where
        I: IntoIterator<Item = &'a Arc<Event>>,
    {
        let mut matched: Vec<Arc<Event>> = events
            .into_iter()
            .filter(|e| self.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = self.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }
}

/// Persistence for published events
#[async_trait]
pub trait Store: Send + Sync {
    async fn append(&self, event: &Arc<Event>) -> Result<()>;

    async fn query(&self, query: &EventQuery) -> Result<Vec<Arc<Event>>>;
}

/// In-process store retaining the most recent `capacity` events
pub struct MemoryStore {
    capacity: usize,
    events: RwLock<VecDeque<Arc<Event>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(100_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: RwLock::new(VecDeque::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append(&self, event: &Arc<Event>) -> Result<()> {
        let mut events = self.events.write().await;
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(Arc::clone(event));
        Ok(())
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<Arc<Event>>> {
        let events = self.events.read().await;
        Ok(query.apply(events.iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ReportResult, Transaction, Verdict};

    fn event(trans_num: &str, fraud: bool) -> Arc<Event> {
        Arc::new(Event::new(
            Arc::new(Transaction::new(trans_num)),
            Verdict::scored(trans_num, if fraud { 0.9 } else { 0.1 }, fraud),
            ReportResult::accepted(None, 1),
            10,
        ))
    }

    #[tokio::test]
    async fn test_query_filters_and_limits() {
        let store = MemoryStore::new();
        for (i, fraud) in [true, false, true, true].into_iter().enumerate() {
            store.append(&event(&format!("T{i}"), fraud)).await.unwrap();
        }
        assert_eq!(store.len().await, 4);

        let all = store.query(&EventQuery::default()).await.unwrap();
        assert_eq!(all.len(), 4);

        let fraud = store
            .query(&EventQuery {
                fraud: Some(true),
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<&str> = fraud.iter().map(|e| e.trans_num.as_str()).collect();
        assert_eq!(ids, ["T2", "T3"]);
    }

    #[tokio::test]
    async fn test_oldest_events_are_evicted_at_capacity() {
        let store = MemoryStore::with_capacity(3);
        for i in 0..5 {
            store.append(&event(&format!("T{i}"), false)).await.unwrap();
        }

        assert_eq!(store.len().await, 3);
        let kept = store.query(&EventQuery::default()).await.unwrap();
        let ids: Vec<&str> = kept.iter().map(|e| e.trans_num.as_str()).collect();
        assert_eq!(ids, ["T2", "T3", "T4"]);
    }

    #[tokio::test]
    async fn test_query_since() {
        let store = MemoryStore::new();
        let old = event("OLD", false);
        store.append(&old).await.unwrap();
        let cutoff = old.published_at + chrono::Duration::milliseconds(1);

        let mut fresh = (*event("NEW", false)).clone();
        fresh.published_at = cutoff;
        store.append(&Arc::new(fresh)).await.unwrap();

        let recent = store
            .query(&EventQuery {
                since: Some(cutoff),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].trans_num, "NEW");
    }
}
