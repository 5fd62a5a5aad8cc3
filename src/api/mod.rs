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

//! Read-side query surface
//!
//! Every query is side-effect free and never fails on missing data: absent
//! buckets read as zeroed metrics and absent snapshots as `None`. Only store
//! failures are surfaced as errors.

use crate::clock::Clock;
use crate::health::{EngineHealth, HealthMonitor};
use crate::model::{dim_hash, DimKind, DimensionMetrics, MetricSet, Millis, SeriesPoint, Window};
use crate::store::{BucketStore, SnapshotStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Buckets returned by [`ReadApi::get_metrics`] when none are requested
pub const DEFAULT_BUCKET_COUNT: usize = 60;

/// Parameters of a metrics query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsQuery {
    pub dim_kind: DimKind,
    #[serde(default)]
    pub dim_value: Option<String>,
    pub window: Window,
    #[serde(default)]
    pub bucket_count: Option<usize>,
}

impl MetricsQuery {
    pub fn global(window: Window) -> Self {
        Self {
            dim_kind: DimKind::Global,
            dim_value: None,
            window,
            bucket_count: None,
        }
    }

    pub fn dimension(dim_kind: DimKind, dim_value: impl Into<String>, window: Window) -> Self {
        Self {
            dim_kind,
            dim_value: Some(dim_value.into()),
            window,
            bucket_count: None,
        }
    }

    pub fn with_bucket_count(mut self, bucket_count: usize) -> Self {
        self.bucket_count = Some(bucket_count);
        self
    }
}

/// Latest metrics plus the series they were taken from
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub metrics: MetricSet,
    pub timeseries: Vec<SeriesPoint>,
}

/// Public view of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotView {
    pub snapshot_id: String,
    pub created_at: Millis,
    pub metrics: MetricSet,
    pub by_dimension: Vec<DimensionMetrics>,
}

#[derive(Clone)]
pub struct ReadApi {
    buckets: Arc<dyn BucketStore>,
    snapshots: Arc<dyn SnapshotStore>,
    health: HealthMonitor,
    clock: Arc<dyn Clock>,
    default_bucket_count: usize,
}

impl ReadApi {
    pub fn new(
        buckets: Arc<dyn BucketStore>,
        snapshots: Arc<dyn SnapshotStore>,
        health: HealthMonitor,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            buckets,
            snapshots,
            health,
            clock,
            default_bucket_count: DEFAULT_BUCKET_COUNT,
        }
    }

    pub fn with_default_bucket_count(mut self, bucket_count: usize) -> Self {
        self.default_bucket_count = bucket_count;
        self
    }

    /// Current metrics and the trailing series for one dimension.
    ///
    /// Covers bucket starts in `[now_bucket - bucket_count * window, now_bucket]`.
    pub async fn get_metrics(&self, query: &MetricsQuery) -> Result<MetricsResponse, StoreError> {
        let duration = query.window.duration_ms();
        let now_bucket = query.window.bucket_start(self.clock.now_ms());
        let bucket_count = query.bucket_count.unwrap_or(self.default_bucket_count) as i64;
        let from = now_bucket.saturating_sub(bucket_count.saturating_mul(duration));

        let hash = dim_hash(query.dim_kind, query.dim_value.as_deref());
        let buckets = self
            .buckets
            .range_buckets(query.window, query.dim_kind, &hash, from, now_bucket)
            .await?;

        let metrics = buckets
            .last()
            .map(|bucket| bucket.metrics())
            .unwrap_or_default();
        let timeseries = buckets.iter().map(|bucket| bucket.point()).collect();

        Ok(MetricsResponse {
            metrics,
            timeseries,
        })
    }

    /// The active snapshot of a session, or the active global one
    pub async fn get_snapshot(
        &self,
        session_id: Option<&str>,
    ) -> Result<Option<SnapshotView>, StoreError> {
        Ok(self
            .snapshots
            .active_snapshot(session_id)
            .await?
            .map(|snapshot| SnapshotView {
                snapshot_id: snapshot.snapshot_id,
                created_at: snapshot.created_at,
                metrics: snapshot.metrics,
                by_dimension: snapshot.by_dimension,
            }))
    }

    pub async fn get_engine_health(&self) -> Result<EngineHealth, StoreError> {
        self.health.get_engine_health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::Aggregator;
    use crate::applier::plan_targets;
    use crate::clock::ManualClock;
    use crate::health::{HealthStatus, HealthThresholds};
    use crate::model::{Deltas, EnrichmentEvent, EventDimensions};
    use crate::snapshot::SnapshotManager;
    use crate::store::MemoryStore;

    const MINUTE: i64 = 60_000;
    const NOW: i64 = 100 * MINUTE + 30_000;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        api: ReadApi,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let health = HealthMonitor::new(
            store.clone(),
            clock.clone(),
            "p",
            HealthThresholds::default(),
        );
        let api = ReadApi::new(store.clone(), store.clone(), health, clock.clone());
        Fixture { store, clock, api }
    }

    async fn ingest(fixture: &Fixture, at: Millis, subreddit: &str, deltas: Deltas) {
        let aggregator = Aggregator::new(fixture.store.clone(), fixture.clock.clone());
        let event = EnrichmentEvent::new(
            format!("e{}", at),
            at,
            EventDimensions {
                subreddit: Some(subreddit.to_string()),
                ..EventDimensions::default()
            },
            deltas,
        );
        for target in plan_targets(&event, &[Window::OneMinute]) {
            aggregator
                .upsert_bucket(&target, &event.deltas, Some(event.id.as_str()))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_missing_data_reads_as_zero() {
        let fixture = fixture();
        let response = fixture
            .api
            .get_metrics(&MetricsQuery::global(Window::OneMinute))
            .await
            .unwrap();
        assert_eq!(response, MetricsResponse::default());
        assert_eq!(fixture.api.get_snapshot(None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_metrics_series_for_dimension() {
        let fixture = fixture();
        let deltas = |aligned| Deltas {
            stories_total: 4,
            stories_aligned: aligned,
            posts_total: 2,
            ..Deltas::default()
        };
        ingest(&fixture, 98 * MINUTE, "rust", deltas(1)).await;
        ingest(&fixture, 100 * MINUTE + 5, "rust", deltas(2)).await;
        ingest(&fixture, 100 * MINUTE + 10, "golang", deltas(4)).await;
        // Too old for a three bucket lookback
        ingest(&fixture, 90 * MINUTE, "rust", deltas(4)).await;

        let response = fixture
            .api
            .get_metrics(
                &MetricsQuery::dimension(DimKind::Subreddit, "rust", Window::OneMinute)
                    .with_bucket_count(3),
            )
            .await
            .unwrap();
        let ts: Vec<Millis> = response.timeseries.iter().map(|p| p.t).collect();
        assert_eq!(ts, vec![98 * MINUTE, 100 * MINUTE]);
        assert_eq!(response.metrics.rc_percent, 50.0);
        assert_eq!(response.timeseries[0].metrics.rc_percent, 25.0);

        let global = fixture
            .api
            .get_metrics(&MetricsQuery::global(Window::OneMinute))
            .await
            .unwrap();
        assert_eq!(global.timeseries.len(), 3);
        assert_eq!(global.metrics.rc_percent, 75.0);
    }

    #[tokio::test]
    async fn test_snapshot_and_health_views() {
        let fixture = fixture();
        let manager = SnapshotManager::new(
            fixture.store.clone(),
            fixture.store.clone(),
            fixture.clock.clone(),
        );
        let id = manager
            .create_snapshot(Some("s1".to_string()), MetricSet::default(), Vec::new())
            .await
            .unwrap();

        assert_eq!(fixture.api.get_snapshot(None).await.unwrap(), None);
        let view = fixture.api.get_snapshot(Some("s1")).await.unwrap().unwrap();
        assert_eq!(view.snapshot_id, id);
        assert_eq!(view.created_at, NOW);

        let health = fixture.api.get_engine_health().await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
    }
}
