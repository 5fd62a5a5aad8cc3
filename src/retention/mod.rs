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

//! Bucket retention
//!
//! The applier never deletes buckets. This sweeper is a separate
//! administrative task that keeps a fixed number of buckets per window.

use crate::clock::Clock;
use crate::model::Window;
use crate::store::{BucketStore, StoreError};
use std::sync::Arc;
use tracing::{debug, info};

pub struct RetentionSweeper {
    buckets: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    windows: Vec<Window>,
    buckets_per_window: u32,
}

impl RetentionSweeper {
    pub fn new(
        buckets: Arc<dyn BucketStore>,
        clock: Arc<dyn Clock>,
        windows: Vec<Window>,
        buckets_per_window: u32,
    ) -> Self {
        Self {
            buckets,
            clock,
            windows,
            buckets_per_window,
        }
    }

    /// Drop every bucket older than `buckets_per_window` buckets before the
    /// current one; returns how many were removed
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_ms();
        let mut removed = 0;
        for window in &self.windows {
            let horizon = window
                .duration_ms()
                .saturating_mul(i64::from(self.buckets_per_window));
            let cutoff = window.bucket_start(now).saturating_sub(horizon);
            let pruned = self.buckets.prune_buckets(*window, cutoff).await?;
            debug!(window = %window, cutoff, pruned, "Swept window");
            removed += pruned;
        }
        if removed > 0 {
            info!(removed, "Pruned expired buckets");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::Aggregator;
    use crate::clock::ManualClock;
    use crate::model::{BucketKey, BucketTarget, Deltas, DimKind, Dimension};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_sweep_keeps_recent_buckets() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let aggregator = Aggregator::new(store.clone(), clock.clone());
        for minute in 0..10 {
            let target = BucketTarget {
                key: BucketKey::new(Window::OneMinute, minute * 60_000, &Dimension::global()),
                dim_value: None,
            };
            aggregator
                .upsert_bucket(&target, &Deltas::default(), None)
                .await
                .unwrap();
        }

        clock.set(9 * 60_000 + 1);
        let sweeper =
            RetentionSweeper::new(store.clone(), clock, vec![Window::OneMinute], 3);
        assert_eq!(sweeper.sweep().await.unwrap(), 6);

        let remaining = store
            .range_buckets(Window::OneMinute, DimKind::Global, "global", 0, 10 * 60_000)
            .await
            .unwrap();
        let starts: Vec<i64> = remaining.iter().map(|b| b.bucket_start).collect();
        assert_eq!(starts, vec![6 * 60_000, 7 * 60_000, 8 * 60_000, 9 * 60_000]);
    }
}
