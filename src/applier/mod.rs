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

//! Event applier
//!
//! Pulls unprocessed events past the watermark, fans each one out to every
//! (window, dimension) bucket it touches and commits it. Effective
//! exactly-once application comes from two rules working together:
//!
//! 1. only events with `processed = false` are fetched, and
//! 2. an event is committed (processed flag and watermark, atomically) only
//!    after every one of its bucket merges has succeeded.
//!
//! A failure aborts the run with the failing event and everything after it
//! left unprocessed, so the next run retries them.

use crate::aggregation::Aggregator;
use crate::clock::Clock;
use crate::model::{BucketKey, BucketTarget, EnrichmentEvent, Millis, Window};
use crate::store::{Ledger, StoreError};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Default number of events pulled per run
pub const DEFAULT_BATCH_LIMIT: usize = 500;

/// Default number of bucket merges in flight per event
pub const DEFAULT_FAN_OUT_CONCURRENCY: usize = 16;

/// Default age after which a `running` claim is considered abandoned
pub const DEFAULT_CLAIM_TTL_MS: Millis = 60_000;

/// Errors that abort a batch run
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Another run holds the claim on this processor's watermark
    #[error("applier {0} is already running")]
    AlreadyRunning(String),
}

/// Applier tuning
#[derive(Debug, Clone)]
pub struct ApplierConfig {
    pub processor_id: String,
    pub batch_limit: usize,
    pub fan_out_concurrency: usize,
    pub windows: Vec<Window>,
    pub claim_ttl_ms: Millis,
}

impl ApplierConfig {
    pub fn new(processor_id: impl Into<String>) -> Self {
        Self {
            processor_id: processor_id.into(),
            batch_limit: DEFAULT_BATCH_LIMIT,
            fan_out_concurrency: DEFAULT_FAN_OUT_CONCURRENCY,
            windows: Window::ALL.to_vec(),
            claim_ttl_ms: DEFAULT_CLAIM_TTL_MS,
        }
    }
}

/// Result of one successful batch run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    /// Events folded into buckets
    pub applied: usize,

    /// Events committed with a data error instead of being applied
    pub rejected: usize,

    pub new_watermark: Millis,
}

/// Every bucket an event contributes to: each window crossed with each of the
/// event's dimensions
pub fn plan_targets(event: &EnrichmentEvent, windows: &[Window]) -> Vec<BucketTarget> {
    let dimensions = event.dimensions.resolve();
    windows
        .iter()
        .flat_map(|window| {
            dimensions.iter().map(move |dimension| BucketTarget {
                key: BucketKey::new(*window, event.at, dimension),
                dim_value: dimension.value.clone(),
            })
        })
        .collect()
}

/// Scheduled batch processor for one `processor_id`
pub struct EventApplier {
    ledger: Arc<dyn Ledger>,
    aggregator: Aggregator,
    clock: Arc<dyn Clock>,
    config: ApplierConfig,
}

impl EventApplier {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        aggregator: Aggregator,
        clock: Arc<dyn Clock>,
        config: ApplierConfig,
    ) -> Self {
        Self {
            ledger,
            aggregator,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ApplierConfig {
        &self.config
    }

    /// Run one bounded batch. Safe to invoke repeatedly from a scheduler.
    ///
    /// On failure the watermark is left at the last committed event and
    /// marked `error`; the remaining events are retried by the next run.
    pub async fn run_batch(&self) -> Result<BatchOutcome, ApplyError> {
        let processor_id = self.config.processor_id.as_str();
        let claimed = self
            .ledger
            .claim(processor_id, self.clock.now_ms(), self.config.claim_ttl_ms)
            .await
            .map_err(|err| match err {
                StoreError::Conflict(_) => ApplyError::AlreadyRunning(processor_id.to_string()),
                other => ApplyError::Store(other),
            })?;

        debug!(
            processor_id,
            watermark = claimed.last_processed_at,
            "Claimed applier watermark"
        );

        match self.apply_from(claimed.last_processed_at).await {
            Ok(outcome) => {
                self.ledger
                    .finish_run(processor_id, self.clock.now_ms(), None)
                    .await?;
                if outcome.applied + outcome.rejected > 0 {
                    info!(
                        processor_id,
                        applied = outcome.applied,
                        rejected = outcome.rejected,
                        watermark = outcome.new_watermark,
                        "Applied event batch"
                    );
                }
                Ok(outcome)
            }
            Err(err) => {
                error!(processor_id, error = %err, "Event batch failed");
                if let Err(release) = self
                    .ledger
                    .finish_run(processor_id, self.clock.now_ms(), Some(err.to_string()))
                    .await
                {
                    warn!(processor_id, error = %release, "Failed to record batch failure");
                }
                Err(err)
            }
        }
    }

    async fn apply_from(&self, watermark: Millis) -> Result<BatchOutcome, ApplyError> {
        let events = self
            .ledger
            .get_unprocessed_events(watermark, self.config.batch_limit)
            .await?;

        let mut outcome = BatchOutcome {
            applied: 0,
            rejected: 0,
            new_watermark: watermark,
        };

        for event in events {
            let rejection = match event.deltas.validate() {
                Ok(()) => {
                    self.fan_out(&event).await?;
                    None
                }
                Err(reason) => {
                    warn!(event_id = %event.id, reason = %reason, "Rejecting malformed event");
                    Some(reason.to_string())
                }
            };

            let rejected = rejection.is_some();
            let committed = self
                .ledger
                .commit_event(
                    &self.config.processor_id,
                    &event.id,
                    self.clock.now_ms(),
                    rejection,
                )
                .await?;

            outcome.new_watermark = committed.last_processed_at;
            if rejected {
                outcome.rejected += 1;
            } else {
                outcome.applied += 1;
            }
        }

        Ok(outcome)
    }

    /// Merge one event into all of its buckets; returns once every merge joined
    async fn fan_out(&self, event: &EnrichmentEvent) -> Result<(), ApplyError> {
        let targets = plan_targets(event, &self.config.windows);
        let concurrency = self.config.fan_out_concurrency.max(1);

        let deltas = Arc::new(event.deltas.clone());
        let event_id: Arc<str> = Arc::from(event.id.as_str());
        // Owned futures so the batch future stays Send when spawned
        let merges: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let aggregator = self.aggregator.clone();
                let deltas = Arc::clone(&deltas);
                let event_id = Arc::clone(&event_id);
                async move {
                    aggregator
                        .upsert_bucket(&target, &deltas, Some(&*event_id))
                        .await
                }
            })
            .collect();

        stream::iter(merges)
        .buffer_unordered(concurrency)
        .try_collect::<Vec<String>>()
        .await?;
        Ok(())
    }
}
