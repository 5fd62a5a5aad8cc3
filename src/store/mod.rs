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

//! Storage contracts for events, watermarks, buckets and snapshots
//!
//! The engine only needs point lookups, range scans by composite key and an
//! atomic read-modify-write per document. Any durable key-value or document
//! store offering those can sit behind these traits; [`MemoryStore`] is the
//! in-process implementation.

use crate::model::{
    BucketKey, DimKind, EnrichmentEvent, Millis, StatBucket, StatsSnapshot, Watermark, Window,
};
use async_trait::async_trait;

pub mod memory;

pub use memory::MemoryStore;

/// Errors surfaced by a store backend
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Transient failure (timeout, contention); the caller may retry
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A compare-and-swap or uniqueness precondition failed
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Read-modify-write step applied to a bucket under its lock.
///
/// Receives the current bucket (if any) and returns its replacement.
pub type BucketMerge<'a> = &'a (dyn Fn(Option<StatBucket>) -> StatBucket + Send + Sync);

/// Append-only log of enrichment events
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append a new event; ids must be unique
    async fn append(&self, event: EnrichmentEvent) -> Result<(), StoreError>;

    async fn get_event(&self, id: &str) -> Result<Option<EnrichmentEvent>, StoreError>;

    /// Unprocessed events with `at >= after`, ascending by arrival then id
    async fn get_unprocessed_events(
        &self,
        after: Millis,
        limit: usize,
    ) -> Result<Vec<EnrichmentEvent>, StoreError>;

    /// Flag events as processed; returns how many changed state
    async fn mark_events_processed(
        &self,
        ids: &[String],
        applied_at: Millis,
    ) -> Result<usize, StoreError>;

    /// Administrative replay: clear the processed flag, applied time and error
    async fn mark_events_unprocessed(&self, ids: &[String]) -> Result<usize, StoreError>;

    async fn count_unprocessed(&self) -> Result<u64, StoreError>;
}

/// One cursor row per processor
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get_watermark(&self, processor_id: &str) -> Result<Option<Watermark>, StoreError>;

    /// Compare-and-swap the watermark into `running`.
    ///
    /// Creates the row if absent. Fails with [`StoreError::Conflict`] while
    /// another run holds a claim younger than `claim_ttl_ms`.
    async fn claim(
        &self,
        processor_id: &str,
        now: Millis,
        claim_ttl_ms: Millis,
    ) -> Result<Watermark, StoreError>;

    /// Move the cursor forward. Never regresses `last_processed_at` or
    /// `processed_count`.
    async fn update_watermark(
        &self,
        processor_id: &str,
        last_processed_at: Millis,
        last_event_id: Option<&str>,
        processed_count: u64,
    ) -> Result<Watermark, StoreError>;

    /// Release the claim, recording `idle` or `error`
    async fn finish_run(
        &self,
        processor_id: &str,
        now: Millis,
        error: Option<String>,
    ) -> Result<Watermark, StoreError>;

    /// Administrative rewind for replays. The only way the cursor moves back.
    async fn reset_watermark(&self, processor_id: &str, to: Millis)
        -> Result<Watermark, StoreError>;
}

/// Event log and watermarks that can be committed together
#[async_trait]
pub trait Ledger: EventLog + WatermarkStore {
    /// Mark one event processed and advance the processor's watermark in a
    /// single atomic step.
    ///
    /// Committing an already processed event is a no-op that returns the
    /// current watermark.
    async fn commit_event(
        &self,
        processor_id: &str,
        event_id: &str,
        applied_at: Millis,
        error: Option<String>,
    ) -> Result<Watermark, StoreError>;
}

/// Keyed stat buckets
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Atomically apply `merge` to the bucket under `key`; returns the bucket id
    async fn upsert_bucket(&self, key: &BucketKey, merge: BucketMerge<'_>)
        -> Result<String, StoreError>;

    async fn get_bucket(&self, key: &BucketKey) -> Result<Option<StatBucket>, StoreError>;

    /// Buckets of one dimension series with `from <= bucket_start <= to`, ascending
    async fn range_buckets(
        &self,
        window: Window,
        dim_kind: DimKind,
        dim_hash: &str,
        from: Millis,
        to: Millis,
    ) -> Result<Vec<StatBucket>, StoreError>;

    /// Every dimension's bucket starting at `bucket_start`
    async fn buckets_at(
        &self,
        window: Window,
        bucket_start: Millis,
    ) -> Result<Vec<StatBucket>, StoreError>;

    /// Drop buckets with `bucket_start < before`; returns how many were removed
    async fn prune_buckets(&self, window: Window, before: Millis) -> Result<usize, StoreError>;
}

/// Write-once snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Deactivate every active snapshot in the same scope and insert
    /// `snapshot` as the active one, atomically.
    async fn insert_snapshot(&self, snapshot: StatsSnapshot) -> Result<(), StoreError>;

    /// The active snapshot of a scope (`None` is the global scope)
    async fn active_snapshot(
        &self,
        session_id: Option<&str>,
    ) -> Result<Option<StatsSnapshot>, StoreError>;

    /// All snapshots of a scope, oldest first
    async fn list_snapshots(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<StatsSnapshot>, StoreError>;
}
