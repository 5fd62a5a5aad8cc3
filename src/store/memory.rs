/*
 * Copyright 2024 ArpNetworking
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! In-process store backing every storage trait
//!
//! Events and watermarks share one lock so that marking an event processed
//! and advancing a watermark commit together. Buckets live in a sharded
//! `DashMap` keyed by dimension series, so writers to different series never
//! contend and writers to the same bucket are serialized by the entry lock.

use super::{
    BucketMerge, BucketStore, EventLog, Ledger, SnapshotStore, StoreError, WatermarkStore,
};
use crate::model::{
    BucketKey, DimKind, EnrichmentEvent, Millis, StatBucket, StatsSnapshot, Watermark,
    WatermarkStatus, Window,
};
use ahash::HashMap;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

/// A time-ordered series of buckets for one (window, dimension)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    window: Window,
    dim_kind: DimKind,
    dim_hash: String,
}

impl From<&BucketKey> for SeriesKey {
    fn from(key: &BucketKey) -> Self {
        Self {
            window: key.window,
            dim_kind: key.dim_kind,
            dim_hash: key.dim_hash.clone(),
        }
    }
}

#[derive(Default)]
struct LedgerState {
    /// Events ordered by (arrival, id)
    events: BTreeMap<(Millis, String), EnrichmentEvent>,

    /// Event id to arrival time
    index: HashMap<String, Millis>,

    watermarks: HashMap<String, Watermark>,
}

impl LedgerState {
    fn event_mut(&mut self, id: &str) -> Option<&mut EnrichmentEvent> {
        let at = *self.index.get(id)?;
        self.events.get_mut(&(at, id.to_string()))
    }
}

/// Thread-safe in-memory implementation of all stores
#[derive(Default)]
pub struct MemoryStore {
    ledger: Mutex<LedgerState>,
    series: DashMap<SeriesKey, BTreeMap<Millis, StatBucket>>,
    snapshots: RwLock<Vec<StatsSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for MemoryStore {
    async fn append(&self, event: EnrichmentEvent) -> Result<(), StoreError> {
        let mut ledger = self.ledger.lock().await;
        if ledger.index.contains_key(&event.id) {
            return Err(StoreError::Conflict(format!(
                "event {} already exists",
                event.id
            )));
        }
        ledger.index.insert(event.id.clone(), event.at);
        ledger.events.insert((event.at, event.id.clone()), event);
        Ok(())
    }

    async fn get_event(&self, id: &str) -> Result<Option<EnrichmentEvent>, StoreError> {
        let mut ledger = self.ledger.lock().await;
        Ok(ledger.event_mut(id).map(|event| event.clone()))
    }

    async fn get_unprocessed_events(
        &self,
        after: Millis,
        limit: usize,
    ) -> Result<Vec<EnrichmentEvent>, StoreError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger
            .events
            .range((after, String::new())..)
            .map(|(_, event)| event)
            .filter(|event| !event.processed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_events_processed(
        &self,
        ids: &[String],
        applied_at: Millis,
    ) -> Result<usize, StoreError> {
        let mut ledger = self.ledger.lock().await;
        let mut changed = 0;
        for id in ids {
            match ledger.event_mut(id) {
                Some(event) if !event.processed => {
                    event.processed = true;
                    event.applied_at = Some(applied_at);
                    changed += 1;
                }
                Some(_) => {}
                None => warn!(event_id = %id, "Cannot mark unknown event processed"),
            }
        }
        Ok(changed)
    }

    async fn mark_events_unprocessed(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut ledger = self.ledger.lock().await;
        let mut changed = 0;
        for id in ids {
            if let Some(event) = ledger.event_mut(id) {
                if event.processed {
                    event.processed = false;
                    event.applied_at = None;
                    event.error = None;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn count_unprocessed(&self) -> Result<u64, StoreError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger.events.values().filter(|e| !e.processed).count() as u64)
    }
}

#[async_trait]
impl WatermarkStore for MemoryStore {
    async fn get_watermark(&self, processor_id: &str) -> Result<Option<Watermark>, StoreError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger.watermarks.get(processor_id).cloned())
    }

    async fn claim(
        &self,
        processor_id: &str,
        now: Millis,
        claim_ttl_ms: Millis,
    ) -> Result<Watermark, StoreError> {
        let mut ledger = self.ledger.lock().await;
        let watermark = ledger
            .watermarks
            .entry(processor_id.to_string())
            .or_insert_with(|| Watermark::new(processor_id));

        if watermark.status == WatermarkStatus::Running {
            let claimed_at = watermark.claimed_at.unwrap_or(Millis::MIN);
            if now.saturating_sub(claimed_at) < claim_ttl_ms {
                return Err(StoreError::Conflict(format!(
                    "processor {} is already running",
                    processor_id
                )));
            }
            warn!(
                processor_id = %processor_id,
                claimed_at,
                "Taking over stale applier claim"
            );
        }

        watermark.status = WatermarkStatus::Running;
        watermark.claimed_at = Some(now);
        Ok(watermark.clone())
    }

    async fn update_watermark(
        &self,
        processor_id: &str,
        last_processed_at: Millis,
        last_event_id: Option<&str>,
        processed_count: u64,
    ) -> Result<Watermark, StoreError> {
        let mut ledger = self.ledger.lock().await;
        let watermark = ledger
            .watermarks
            .entry(processor_id.to_string())
            .or_insert_with(|| Watermark::new(processor_id));

        if last_processed_at >= watermark.last_processed_at {
            watermark.last_processed_at = last_processed_at;
            if let Some(id) = last_event_id {
                watermark.last_event_id = Some(id.to_string());
            }
        }
        watermark.processed_count = watermark.processed_count.max(processed_count);
        Ok(watermark.clone())
    }

    async fn finish_run(
        &self,
        processor_id: &str,
        now: Millis,
        error: Option<String>,
    ) -> Result<Watermark, StoreError> {
        let mut ledger = self.ledger.lock().await;
        let watermark = ledger
            .watermarks
            .get_mut(processor_id)
            .ok_or_else(|| StoreError::NotFound(format!("watermark {}", processor_id)))?;

        watermark.status = if error.is_some() {
            WatermarkStatus::Error
        } else {
            WatermarkStatus::Idle
        };
        watermark.error_message = error;
        watermark.last_run_at = Some(now);
        watermark.claimed_at = None;
        Ok(watermark.clone())
    }

    async fn reset_watermark(
        &self,
        processor_id: &str,
        to: Millis,
    ) -> Result<Watermark, StoreError> {
        let mut ledger = self.ledger.lock().await;
        let watermark = ledger
            .watermarks
            .get_mut(processor_id)
            .ok_or_else(|| StoreError::NotFound(format!("watermark {}", processor_id)))?;

        if watermark.status == WatermarkStatus::Running {
            return Err(StoreError::Conflict(format!(
                "processor {} is running",
                processor_id
            )));
        }
        warn!(
            processor_id = %processor_id,
            from = watermark.last_processed_at,
            to,
            "Rewinding watermark"
        );
        watermark.last_processed_at = to;
        watermark.last_event_id = None;
        Ok(watermark.clone())
    }
}

#[async_trait]
impl Ledger for MemoryStore {
    async fn commit_event(
        &self,
        processor_id: &str,
        event_id: &str,
        applied_at: Millis,
        error: Option<String>,
    ) -> Result<Watermark, StoreError> {
        let mut ledger = self.ledger.lock().await;
        let event = ledger
            .event_mut(event_id)
            .ok_or_else(|| StoreError::NotFound(format!("event {}", event_id)))?;

        let newly_processed = !event.processed;
        if newly_processed {
            event.processed = true;
            event.applied_at = Some(applied_at);
            event.error = error;
        }
        let at = event.at;

        let watermark = ledger
            .watermarks
            .entry(processor_id.to_string())
            .or_insert_with(|| Watermark::new(processor_id));
        if newly_processed {
            if at >= watermark.last_processed_at {
                watermark.last_processed_at = at;
                watermark.last_event_id = Some(event_id.to_string());
            }
            watermark.processed_count += 1;
        }
        Ok(watermark.clone())
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn upsert_bucket(
        &self,
        key: &BucketKey,
        merge: BucketMerge<'_>,
    ) -> Result<String, StoreError> {
        // The entry guard holds the shard lock for the whole read-modify-write
        let mut series = self.series.entry(SeriesKey::from(key)).or_default();
        let current = series.remove(&key.bucket_start);
        let updated = merge(current);
        let id = updated.id.clone();
        series.insert(key.bucket_start, updated);
        Ok(id)
    }

    async fn get_bucket(&self, key: &BucketKey) -> Result<Option<StatBucket>, StoreError> {
        Ok(self
            .series
            .get(&SeriesKey::from(key))
            .and_then(|series| series.get(&key.bucket_start).cloned()))
    }

    async fn range_buckets(
        &self,
        window: Window,
        dim_kind: DimKind,
        dim_hash: &str,
        from: Millis,
        to: Millis,
    ) -> Result<Vec<StatBucket>, StoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        let key = SeriesKey {
            window,
            dim_kind,
            dim_hash: dim_hash.to_string(),
        };
        Ok(self
            .series
            .get(&key)
            .map(|series| series.range(from..=to).map(|(_, b)| b.clone()).collect())
            .unwrap_or_default())
    }

    async fn buckets_at(
        &self,
        window: Window,
        bucket_start: Millis,
    ) -> Result<Vec<StatBucket>, StoreError> {
        let mut buckets: Vec<StatBucket> = self
            .series
            .iter()
            .filter(|entry| entry.key().window == window)
            .filter_map(|entry| entry.value().get(&bucket_start).cloned())
            .collect();
        buckets.sort_by(|a, b| {
            (a.dim_kind, &a.dim_value, &a.dim_hash).cmp(&(b.dim_kind, &b.dim_value, &b.dim_hash))
        });
        Ok(buckets)
    }

    async fn prune_buckets(&self, window: Window, before: Millis) -> Result<usize, StoreError> {
        let mut removed = 0;
        for mut entry in self.series.iter_mut() {
            if entry.key().window != window {
                continue;
            }
            let series = entry.value_mut();
            let kept = series.split_off(&before);
            removed += series.len();
            *series = kept;
        }
        self.series.retain(|_, series| !series.is_empty());
        Ok(removed)
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn insert_snapshot(&self, snapshot: StatsSnapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write().await;
        if snapshots
            .iter()
            .any(|existing| existing.snapshot_id == snapshot.snapshot_id)
        {
            return Err(StoreError::Conflict(format!(
                "snapshot {} already exists",
                snapshot.snapshot_id
            )));
        }
        for existing in snapshots
            .iter_mut()
            .filter(|existing| existing.session_id == snapshot.session_id)
        {
            existing.is_active = false;
        }
        snapshots.push(StatsSnapshot {
            is_active: true,
            ..snapshot
        });
        Ok(())
    }

    async fn active_snapshot(
        &self,
        session_id: Option<&str>,
    ) -> Result<Option<StatsSnapshot>, StoreError> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .iter()
            .rev()
            .find(|s| s.is_active && s.session_id.as_deref() == session_id)
            .cloned())
    }

    async fn list_snapshots(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<StatsSnapshot>, StoreError> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .iter()
            .filter(|s| s.session_id.as_deref() == session_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Deltas, Dimension, EventDimensions, MetricSet};

    fn event(id: &str, at: Millis) -> EnrichmentEvent {
        EnrichmentEvent::new(id, at, EventDimensions::default(), Deltas::default())
    }

    fn snapshot(id: &str, session: Option<&str>) -> StatsSnapshot {
        StatsSnapshot {
            snapshot_id: id.to_string(),
            session_id: session.map(str::to_string),
            created_at: 0,
            metrics: MetricSet::default(),
            by_dimension: Vec::new(),
            is_active: false,
        }
    }

    #[tokio::test]
    async fn test_unprocessed_events_are_ordered_and_filtered() {
        let store = MemoryStore::new();
        store.append(event("b", 200)).await.unwrap();
        store.append(event("a", 100)).await.unwrap();
        store.append(event("c", 300)).await.unwrap();
        store
            .mark_events_processed(&["b".to_string()], 1)
            .await
            .unwrap();

        let events = store.get_unprocessed_events(0, 10).await.unwrap();
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let events = store.get_unprocessed_events(300, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(store.count_unprocessed().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_event_id_is_rejected() {
        let store = MemoryStore::new();
        store.append(event("a", 100)).await.unwrap();
        let err = store.append(event("a", 200)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_commit_event_is_idempotent() {
        let store = MemoryStore::new();
        store.append(event("a", 100)).await.unwrap();

        let first = store.commit_event("p", "a", 500, None).await.unwrap();
        let second = store.commit_event("p", "a", 600, None).await.unwrap();
        assert_eq!(first.processed_count, 1);
        assert_eq!(second, first);

        let stored = store.get_event("a").await.unwrap().unwrap();
        assert!(stored.processed);
        assert_eq!(stored.applied_at, Some(500));
    }

    #[tokio::test]
    async fn test_claim_excludes_concurrent_runs() {
        let store = MemoryStore::new();
        store.claim("p", 1_000, 60_000).await.unwrap();
        let err = store.claim("p", 2_000, 60_000).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // A stale claim can be taken over
        let watermark = store.claim("p", 100_000, 60_000).await.unwrap();
        assert_eq!(watermark.claimed_at, Some(100_000));

        store.finish_run("p", 100_500, None).await.unwrap();
        assert!(store.claim("p", 101_000, 60_000).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_watermark_never_regresses() {
        let store = MemoryStore::new();
        store
            .update_watermark("p", 5_000, Some("e5"), 5)
            .await
            .unwrap();
        let watermark = store
            .update_watermark("p", 1_000, Some("e1"), 2)
            .await
            .unwrap();
        assert_eq!(watermark.last_processed_at, 5_000);
        assert_eq!(watermark.last_event_id.as_deref(), Some("e5"));
        assert_eq!(watermark.processed_count, 5);
    }

    #[tokio::test]
    async fn test_mark_unprocessed_clears_annotations() {
        let store = MemoryStore::new();
        store.append(event("a", 100)).await.unwrap();
        store
            .commit_event("p", "a", 500, Some("bad payload".to_string()))
            .await
            .unwrap();
        assert_eq!(
            store
                .mark_events_unprocessed(&["a".to_string()])
                .await
                .unwrap(),
            1
        );
        let stored = store.get_event("a").await.unwrap().unwrap();
        assert!(!stored.processed);
        assert_eq!(stored.error, None);
    }

    #[tokio::test]
    async fn test_bucket_range_and_prune() {
        let store = MemoryStore::new();
        let dim = Dimension::global();
        for at in [0, 60_000, 120_000, 180_000] {
            let key = BucketKey::new(Window::OneMinute, at, &dim);
            let id = key.bucket_id();
            store
                .upsert_bucket(&key, &move |current: Option<StatBucket>| {
                    let mut bucket = current.unwrap_or_default();
                    bucket.id = id.clone();
                    bucket.event_count += 1;
                    bucket
                })
                .await
                .unwrap();
        }

        let range = store
            .range_buckets(Window::OneMinute, DimKind::Global, &dim.hash, 60_000, 120_000)
            .await
            .unwrap();
        assert_eq!(range.len(), 2);

        let removed = store
            .prune_buckets(Window::OneMinute, 120_000)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        let remaining = store
            .range_buckets(Window::OneMinute, DimKind::Global, &dim.hash, 0, 200_000)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_scope_exclusivity() {
        let store = MemoryStore::new();
        store.insert_snapshot(snapshot("g1", None)).await.unwrap();
        store.insert_snapshot(snapshot("s1", Some("s"))).await.unwrap();
        store.insert_snapshot(snapshot("g2", None)).await.unwrap();

        let global = store.list_snapshots(None).await.unwrap();
        assert_eq!(global.iter().filter(|s| s.is_active).count(), 1);
        assert_eq!(
            store.active_snapshot(None).await.unwrap().unwrap().snapshot_id,
            "g2"
        );
        // Other scopes are untouched
        assert_eq!(
            store
                .active_snapshot(Some("s"))
                .await
                .unwrap()
                .unwrap()
                .snapshot_id,
            "s1"
        );
    }
}
