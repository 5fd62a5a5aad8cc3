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

//! Core data model for the rollup engine
//!
//! Defines the enrichment events consumed from the event log, the keyed stat
//! buckets they are folded into, and the watermark and snapshot records kept
//! alongside them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Milliseconds since the Unix epoch.
pub type Millis = i64;

/// Fixed hash used for the single global dimension
pub const GLOBAL_DIM_HASH: &str = "global";

/// Fixed-duration aggregation window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Window {
    /// One minute buckets
    #[default]
    #[serde(rename = "1m")]
    OneMinute,
    /// Five minute buckets
    #[serde(rename = "5m")]
    FiveMinutes,
    /// Fifteen minute buckets
    #[serde(rename = "15m")]
    FifteenMinutes,
    /// Sixty minute buckets
    #[serde(rename = "60m")]
    SixtyMinutes,
}

impl Window {
    /// Every window the engine maintains, shortest first
    pub const ALL: [Window; 4] = [
        Window::OneMinute,
        Window::FiveMinutes,
        Window::FifteenMinutes,
        Window::SixtyMinutes,
    ];

    /// Length of one bucket of this window
    pub fn duration_ms(self) -> Millis {
        match self {
            Window::OneMinute => 60_000,
            Window::FiveMinutes => 5 * 60_000,
            Window::FifteenMinutes => 15 * 60_000,
            Window::SixtyMinutes => 60 * 60_000,
        }
    }

    /// Start of the bucket containing `at`
    pub fn bucket_start(self, at: Millis) -> Millis {
        let duration = self.duration_ms();
        at.div_euclid(duration) * duration
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Window::OneMinute => "1m",
            Window::FiveMinutes => "5m",
            Window::FifteenMinutes => "15m",
            Window::SixtyMinutes => "60m",
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A window name outside `1m`, `5m`, `15m` and `60m`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown window: {0}")]
pub struct ParseWindowError(pub String);

impl FromStr for Window {
    type Err = ParseWindowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Window::OneMinute),
            "5m" => Ok(Window::FiveMinutes),
            "15m" => Ok(Window::FifteenMinutes),
            "60m" | "1h" => Ok(Window::SixtyMinutes),
            other => Err(ParseWindowError(other.to_string())),
        }
    }
}

/// Axis of aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimKind {
    #[default]
    Global,
    Subreddit,
    Session,
    Entity,
    Thread,
}

impl DimKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DimKind::Global => "global",
            DimKind::Subreddit => "subreddit",
            DimKind::Session => "session",
            DimKind::Entity => "entity",
            DimKind::Thread => "thread",
        }
    }
}

impl fmt::Display for DimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable hash identifying a dimension value.
///
/// The global dimension has no value and always hashes to [`GLOBAL_DIM_HASH`].
pub fn dim_hash(kind: DimKind, value: Option<&str>) -> String {
    match (kind, value) {
        (DimKind::Global, _) => GLOBAL_DIM_HASH.to_string(),
        (kind, value) => {
            let mut hasher = Sha256::new();
            hasher.update(kind.as_str().as_bytes());
            hasher.update(b":");
            hasher.update(value.unwrap_or_default().as_bytes());
            let digest = hex::encode(hasher.finalize());
            digest[..16].to_string()
        }
    }
}

/// A concrete dimension: kind, optional value and its hash
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension {
    pub kind: DimKind,
    pub value: Option<String>,
    pub hash: String,
}

impl Dimension {
    pub fn global() -> Self {
        Self {
            kind: DimKind::Global,
            value: None,
            hash: GLOBAL_DIM_HASH.to_string(),
        }
    }

    pub fn new(kind: DimKind, value: impl Into<String>) -> Self {
        if kind == DimKind::Global {
            return Self::global();
        }
        let value = value.into();
        let hash = dim_hash(kind, Some(&value));
        Self {
            kind,
            value: Some(value),
            hash,
        }
    }
}

/// Composite key of a stat bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub window: Window,
    pub bucket_start: Millis,
    pub dim_kind: DimKind,
    pub dim_hash: String,
}

impl BucketKey {
    pub fn new(window: Window, at: Millis, dimension: &Dimension) -> Self {
        Self {
            window,
            bucket_start: window.bucket_start(at),
            dim_kind: dimension.kind,
            dim_hash: dimension.hash.clone(),
        }
    }

    /// Stable identifier of the bucket stored under this key
    pub fn bucket_id(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.window, self.bucket_start, self.dim_kind, self.dim_hash
        )
    }
}

/// One bucket an event contributes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketTarget {
    pub key: BucketKey,
    pub dim_value: Option<String>,
}

/// Running sums for an online variance estimate
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VarianceHelper {
    pub sum_x: f64,
    pub sum_x2: f64,
    pub n: u64,
}

impl VarianceHelper {
    pub fn observe(&mut self, x: f64) {
        self.sum_x += x;
        self.sum_x2 += x * x;
        self.n = self.n.saturating_add(1);
    }

    pub fn merge(&mut self, other: &VarianceHelper) {
        self.sum_x += other.sum_x;
        self.sum_x2 += other.sum_x2;
        self.n = self.n.saturating_add(other.n);
    }

    /// Population variance, 0 with fewer than two observations
    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        let n = self.n as f64;
        let mean = self.sum_x / n;
        // Rounding can push this slightly negative for constant inputs
        (self.sum_x2 / n - mean * mean).max(0.0)
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Increments carried by one enrichment event
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Deltas {
    pub stories_total: u64,
    pub stories_aligned: u64,
    pub stories_cross_post: u64,
    pub posts_total: u64,
    pub unique_concepts: Vec<String>,
    pub sum_sentiment: f64,
    pub sum_weighted_sentiment: f64,
    pub sum_weights: f64,
    pub sum_engagement: f64,
    pub variance_helper: VarianceHelper,
}

impl Deltas {
    /// Check the payload is something the aggregator can fold in.
    ///
    /// Counters are unsigned by construction; weights and the variance sums
    /// must be non-negative and every real must be finite.
    pub fn validate(&self) -> Result<(), InvalidDeltas> {
        let reals = [
            ("sum_sentiment", self.sum_sentiment),
            ("sum_weighted_sentiment", self.sum_weighted_sentiment),
            ("sum_weights", self.sum_weights),
            ("sum_engagement", self.sum_engagement),
            ("variance_helper.sum_x", self.variance_helper.sum_x),
            ("variance_helper.sum_x2", self.variance_helper.sum_x2),
        ];
        for (name, value) in reals {
            if !value.is_finite() {
                return Err(InvalidDeltas::NotFinite(name));
            }
        }
        if self.sum_weights < 0.0 {
            return Err(InvalidDeltas::Negative("sum_weights"));
        }
        if self.variance_helper.sum_x2 < 0.0 {
            return Err(InvalidDeltas::Negative("variance_helper.sum_x2"));
        }
        if self.stories_aligned > self.stories_total {
            return Err(InvalidDeltas::ExceedsStoriesTotal("stories_aligned"));
        }
        if self.stories_cross_post > self.stories_total {
            return Err(InvalidDeltas::ExceedsStoriesTotal("stories_cross_post"));
        }
        if self.unique_concepts.iter().any(|c| c.is_empty()) {
            return Err(InvalidDeltas::EmptyConcept);
        }
        Ok(())
    }
}

/// Reasons a delta payload is rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidDeltas {
    #[error("{0} is not finite")]
    NotFinite(&'static str),

    #[error("{0} is negative")]
    Negative(&'static str),

    #[error("{0} exceeds stories_total")]
    ExceedsStoriesTotal(&'static str),

    #[error("unique_concepts contains an empty identifier")]
    EmptyConcept,
}

/// Dimension values an event is attributed to, beyond the global one
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventDimensions {
    pub subreddit: Option<String>,
    pub session_id: Option<String>,
    pub entities: Vec<String>,
    pub thread_id: Option<String>,
}

impl EventDimensions {
    /// Global first, then every named dimension; duplicate entities collapse
    pub fn resolve(&self) -> Vec<Dimension> {
        let mut dims = vec![Dimension::global()];
        if let Some(subreddit) = &self.subreddit {
            dims.push(Dimension::new(DimKind::Subreddit, subreddit.clone()));
        }
        if let Some(session) = &self.session_id {
            dims.push(Dimension::new(DimKind::Session, session.clone()));
        }
        let entities: BTreeSet<&String> = self.entities.iter().collect();
        for entity in entities {
            dims.push(Dimension::new(DimKind::Entity, entity.clone()));
        }
        if let Some(thread) = &self.thread_id {
            dims.push(Dimension::new(DimKind::Thread, thread.clone()));
        }
        dims
    }
}

/// A row of the append-only event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentEvent {
    /// Unique, stable identifier
    pub id: String,

    /// Arrival timestamp
    pub at: Millis,

    /// Set once the event has been folded into every bucket it targets
    #[serde(default)]
    pub processed: bool,

    /// When the event was committed as processed
    #[serde(default)]
    pub applied_at: Option<Millis>,

    /// Rejection reason for events committed without being applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub dimensions: EventDimensions,

    #[serde(default)]
    pub deltas: Deltas,
}

impl EnrichmentEvent {
    pub fn new(id: impl Into<String>, at: Millis, dimensions: EventDimensions, deltas: Deltas) -> Self {
        Self {
            id: id.into(),
            at,
            processed: false,
            applied_at: None,
            error: None,
            dimensions,
            deltas,
        }
    }
}

/// Mutable accumulator for one (window, bucket_start, dimension)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatBucket {
    pub id: String,
    pub window: Window,
    pub bucket_start: Millis,
    pub dim_kind: DimKind,
    pub dim_value: Option<String>,
    pub dim_hash: String,

    // Raw accumulators
    pub stories_total: u64,
    pub stories_aligned: u64,
    pub stories_cross_post: u64,
    pub posts_total: u64,
    pub unique_concepts: BTreeSet<String>,
    pub sum_sentiment: f64,
    pub sum_weighted_sentiment: f64,
    pub sum_weights: f64,
    pub sum_engagement: f64,
    pub variance_helper: VarianceHelper,
    pub event_count: u64,
    pub last_event_id: Option<String>,
    pub last_updated_at: Millis,

    // Derived, recomputed on every merge
    pub rc_percent: f64,
    pub ni_count: u64,
    pub tp_percent: f64,
    pub story_yield: f64,
    pub story_yield_delta: f64,
    pub cm_percent: f64,
}

impl StatBucket {
    pub fn key(&self) -> BucketKey {
        BucketKey {
            window: self.window,
            bucket_start: self.bucket_start,
            dim_kind: self.dim_kind,
            dim_hash: self.dim_hash.clone(),
        }
    }
}

/// KPIs exposed to readers
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricSet {
    pub rc_percent: f64,
    pub ni_count: u64,
    pub tp_percent: f64,
    pub cm_percent: f64,
    pub story_yield: f64,
    pub avg_sentiment: f64,
    pub avg_engagement: f64,
    pub sentiment_stddev: f64,
}

/// One point of a metrics time series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Bucket start
    pub t: Millis,
    #[serde(flatten)]
    pub metrics: MetricSet,
}

/// Metrics of a single dimension captured into a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionMetrics {
    pub dim_kind: DimKind,
    pub dim_value: Option<String>,
    pub dim_hash: String,
    pub window: Window,
    pub metrics: MetricSet,
}

/// Run state recorded on a watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkStatus {
    #[default]
    Idle,
    Running,
    Error,
}

/// Per-processor cursor into the event log
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Watermark {
    pub processor_id: String,
    pub last_processed_at: Millis,
    pub last_event_id: Option<String>,
    pub processed_count: u64,
    pub last_run_at: Option<Millis>,
    pub status: WatermarkStatus,
    pub error_message: Option<String>,

    /// When the current run claimed this watermark
    #[serde(default)]
    pub claimed_at: Option<Millis>,
}

impl Watermark {
    pub fn new(processor_id: impl Into<String>) -> Self {
        Self {
            processor_id: processor_id.into(),
            ..Self::default()
        }
    }
}

/// Immutable freeze of metrics taken when live aggregation pauses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub snapshot_id: String,
    pub session_id: Option<String>,
    pub created_at: Millis,
    pub metrics: MetricSet,
    pub by_dimension: Vec<DimensionMetrics>,
    pub is_active: bool,
}
