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

//! Incremental bucket aggregation
//!
//! Folds event deltas into stat buckets and recomputes the derived KPIs from
//! the raw accumulators. Derived values only ever depend on the bucket's own
//! counters and on its `story_yield` before the merge, never on other buckets.

use crate::clock::Clock;
use crate::model::{BucketTarget, Deltas, MetricSet, Millis, SeriesPoint, StatBucket};
use crate::store::{BucketStore, StoreError};
use std::sync::Arc;

/// `numerator / denominator`, or 0 when the denominator is 0
pub fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        return 0.0;
    }
    let value = numerator / denominator;
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

impl StatBucket {
    /// Create a bucket whose raw accumulators are exactly `deltas`
    pub fn from_deltas(
        target: &BucketTarget,
        deltas: &Deltas,
        last_event_id: Option<&str>,
        now: Millis,
    ) -> Self {
        let key = &target.key;
        let mut bucket = StatBucket {
            id: key.bucket_id(),
            window: key.window,
            bucket_start: key.bucket_start,
            dim_kind: key.dim_kind,
            dim_value: target.dim_value.clone(),
            dim_hash: key.dim_hash.clone(),
            ..StatBucket::default()
        };
        bucket.accumulate(deltas);
        bucket.event_count = 1;
        bucket.last_event_id = last_event_id.map(str::to_string);
        bucket.last_updated_at = now;
        bucket.recompute_ratios();
        // A fresh bucket has no previous yield to measure momentum against
        bucket.story_yield_delta = 0.0;
        bucket.cm_percent = 0.0;
        bucket
    }

    /// Add `deltas` to this bucket and refresh every derived field
    pub fn merge(&mut self, deltas: &Deltas, last_event_id: Option<&str>, now: Millis) {
        let previous_story_yield = self.story_yield;

        self.accumulate(deltas);
        self.event_count = self.event_count.saturating_add(1);
        if let Some(id) = last_event_id {
            self.last_event_id = Some(id.to_string());
        }
        self.last_updated_at = now;

        self.recompute_ratios();
        self.story_yield_delta = self.story_yield - previous_story_yield;
        self.cm_percent = ratio(self.story_yield_delta, previous_story_yield) * 100.0;
    }

    fn accumulate(&mut self, deltas: &Deltas) {
        // Counters pin at u64::MAX rather than wrap
        self.stories_total = self.stories_total.saturating_add(deltas.stories_total);
        self.stories_aligned = self.stories_aligned.saturating_add(deltas.stories_aligned);
        self.stories_cross_post = self
            .stories_cross_post
            .saturating_add(deltas.stories_cross_post);
        self.posts_total = self.posts_total.saturating_add(deltas.posts_total);
        self.unique_concepts
            .extend(deltas.unique_concepts.iter().cloned());
        self.sum_sentiment += deltas.sum_sentiment;
        self.sum_weighted_sentiment += deltas.sum_weighted_sentiment;
        self.sum_weights += deltas.sum_weights;
        self.sum_engagement += deltas.sum_engagement;
        self.variance_helper.merge(&deltas.variance_helper);
    }

    fn recompute_ratios(&mut self) {
        let stories = self.stories_total as f64;
        self.rc_percent = ratio(self.stories_aligned as f64, stories) * 100.0;
        self.tp_percent = ratio(self.stories_cross_post as f64, stories) * 100.0;
        self.ni_count = self.unique_concepts.len() as u64;
        self.story_yield = ratio(stories, self.posts_total as f64);
    }

    /// Weight-averaged sentiment
    pub fn avg_sentiment(&self) -> f64 {
        ratio(self.sum_weighted_sentiment, self.sum_weights)
    }

    /// Mean engagement per story
    pub fn avg_engagement(&self) -> f64 {
        ratio(self.sum_engagement, self.stories_total as f64)
    }

    pub fn sentiment_stddev(&self) -> f64 {
        self.variance_helper.stddev()
    }

    pub fn metrics(&self) -> MetricSet {
        MetricSet {
            rc_percent: self.rc_percent,
            ni_count: self.ni_count,
            tp_percent: self.tp_percent,
            cm_percent: self.cm_percent,
            story_yield: self.story_yield,
            avg_sentiment: self.avg_sentiment(),
            avg_engagement: self.avg_engagement(),
            sentiment_stddev: self.sentiment_stddev(),
        }
    }

    pub fn point(&self) -> SeriesPoint {
        SeriesPoint {
            t: self.bucket_start,
            metrics: self.metrics(),
        }
    }
}

/// Applies deltas to buckets through a [`BucketStore`]
#[derive(Clone)]
pub struct Aggregator {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn BucketStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create or merge into the bucket for `target`; returns the bucket id.
    ///
    /// Atomic per bucket. A merge carrying the id of the event that last
    /// touched the bucket is skipped, so retrying an event whose fan-out
    /// partially landed does not count it twice.
    pub async fn upsert_bucket(
        &self,
        target: &BucketTarget,
        deltas: &Deltas,
        last_event_id: Option<&str>,
    ) -> Result<String, StoreError> {
        let now = self.clock.now_ms();
        let merge = |current: Option<StatBucket>| match current {
            Some(bucket)
                if last_event_id.is_some() && bucket.last_event_id.as_deref() == last_event_id =>
            {
                bucket
            }
            Some(mut bucket) => {
                bucket.merge(deltas, last_event_id, now);
                bucket
            }
            None => StatBucket::from_deltas(target, deltas, last_event_id, now),
        };
        self.store.upsert_bucket(&target.key, &merge).await
    }
}
