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

//! Point-in-time snapshots taken when live consumption pauses
//!
//! Snapshots are write-once. Creating one deactivates every other active
//! snapshot in its scope: the session it belongs to, or the global scope
//! when it has none.

use crate::clock::Clock;
use crate::model::{
    DimKind, Dimension, DimensionMetrics, MetricSet, StatsSnapshot, Window,
};
use crate::store::{BucketStore, SnapshotStore, StoreError};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct SnapshotManager {
    snapshots: Arc<dyn SnapshotStore>,
    buckets: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
}

impl SnapshotManager {
    pub fn new(
        snapshots: Arc<dyn SnapshotStore>,
        buckets: Arc<dyn BucketStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            snapshots,
            buckets,
            clock,
        }
    }

    /// Store `metrics` as the new active snapshot of its scope
    pub async fn create_snapshot(
        &self,
        session_id: Option<String>,
        metrics: MetricSet,
        by_dimension: Vec<DimensionMetrics>,
    ) -> Result<String, StoreError> {
        let snapshot_id = Uuid::new_v4().to_string();
        let snapshot = StatsSnapshot {
            snapshot_id: snapshot_id.clone(),
            session_id,
            created_at: self.clock.now_ms(),
            metrics,
            by_dimension,
            is_active: true,
        };

        info!(
            snapshot_id = %snapshot.snapshot_id,
            session_id = ?snapshot.session_id,
            dimensions = snapshot.by_dimension.len(),
            "Creating stats snapshot"
        );
        self.snapshots.insert_snapshot(snapshot).await?;
        Ok(snapshot_id)
    }

    /// Freeze the current bucket of `window` into a snapshot.
    ///
    /// Headline metrics come from the session's bucket when a session is
    /// given, otherwise from the global bucket. A global freeze captures
    /// every non-global dimension seen in the current bucket; a session
    /// freeze captures only that session's own bucket, so no other session's
    /// data leaks into it.
    pub async fn freeze(
        &self,
        session_id: Option<&str>,
        window: Window,
    ) -> Result<String, StoreError> {
        let bucket_start = window.bucket_start(self.clock.now_ms());
        let buckets = self.buckets.buckets_at(window, bucket_start).await?;

        let headline = match session_id {
            Some(session) => Dimension::new(DimKind::Session, session),
            None => Dimension::global(),
        };
        let metrics = buckets
            .iter()
            .find(|b| b.dim_kind == headline.kind && b.dim_hash == headline.hash)
            .map(|b| b.metrics())
            .unwrap_or_default();

        let by_dimension = buckets
            .iter()
            .filter(|b| match session_id {
                Some(_) => b.dim_kind == headline.kind && b.dim_hash == headline.hash,
                None => b.dim_kind != DimKind::Global,
            })
            .map(|b| DimensionMetrics {
                dim_kind: b.dim_kind,
                dim_value: b.dim_value.clone(),
                dim_hash: b.dim_hash.clone(),
                window,
                metrics: b.metrics(),
            })
            .collect();

        self.create_snapshot(session_id.map(str::to_string), metrics, by_dimension)
            .await
    }
}
