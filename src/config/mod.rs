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

//! Daemon configuration
//!
//! Loaded from a JSON file with camelCase keys. Durations use the ISO-8601
//! `PT<seconds>S` form.

use crate::api::DEFAULT_BUCKET_COUNT;
use crate::applier::{
    ApplierConfig, DEFAULT_BATCH_LIMIT, DEFAULT_CLAIM_TTL_MS, DEFAULT_FAN_OUT_CONCURRENCY,
};
use crate::health::HealthThresholds;
use crate::model::Window;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Watermark row owned by this daemon's applier
    #[serde(default = "default_processor_id")]
    pub processor_id: String,

    /// Maximum events pulled per applier run
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Cadence of applier runs
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,

    /// Bucket merges in flight per event
    #[serde(default = "default_fan_out_concurrency")]
    pub fan_out_concurrency: usize,

    /// Age after which a running claim may be taken over
    #[serde(default = "default_claim_ttl", with = "duration_serde")]
    pub claim_ttl: Duration,

    /// Windows maintained for every dimension
    #[serde(default = "default_windows")]
    pub windows: Vec<Window>,

    /// Series length returned when a query names none
    #[serde(default = "default_bucket_count")]
    pub default_bucket_count: usize,

    #[serde(default)]
    pub health: HealthThresholds,

    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Bucket retention configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionConfig {
    #[serde(default = "default_retention_enabled")]
    pub enabled: bool,

    /// Buckets kept per window, counting back from the current one
    #[serde(default = "default_buckets_per_window")]
    pub buckets_per_window: u32,

    #[serde(default = "default_sweep_interval", with = "duration_serde")]
    pub sweep_interval: Duration,
}

impl EngineConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&contents)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.processor_id.trim().is_empty() {
            bail!("processorId must not be empty");
        }
        if self.batch_limit == 0 {
            bail!("batchLimit must be positive");
        }
        if self.windows.is_empty() {
            bail!("at least one window is required");
        }
        if self.health.degraded_lag_ms > self.health.error_lag_ms {
            bail!("health.degradedLagMs must not exceed health.errorLagMs");
        }
        Ok(())
    }

    pub fn applier_config(&self) -> ApplierConfig {
        let mut windows = self.windows.clone();
        windows.sort();
        windows.dedup();
        ApplierConfig {
            processor_id: self.processor_id.clone(),
            batch_limit: self.batch_limit,
            fan_out_concurrency: self.fan_out_concurrency.max(1),
            windows,
            claim_ttl_ms: i64::try_from(self.claim_ttl.as_millis()).unwrap_or(i64::MAX),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            processor_id: default_processor_id(),
            batch_limit: default_batch_limit(),
            poll_interval: default_poll_interval(),
            fan_out_concurrency: default_fan_out_concurrency(),
            claim_ttl: default_claim_ttl(),
            windows: default_windows(),
            default_bucket_count: default_bucket_count(),
            health: HealthThresholds::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: default_retention_enabled(),
            buckets_per_window: default_buckets_per_window(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

// Default value functions
fn default_processor_id() -> String {
    "stats-applier".to_string()
}

fn default_batch_limit() -> usize {
    DEFAULT_BATCH_LIMIT
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_fan_out_concurrency() -> usize {
    DEFAULT_FAN_OUT_CONCURRENCY
}

fn default_claim_ttl() -> Duration {
    Duration::from_millis(DEFAULT_CLAIM_TTL_MS as u64)
}

fn default_windows() -> Vec<Window> {
    Window::ALL.to_vec()
}

fn default_bucket_count() -> usize {
    DEFAULT_BUCKET_COUNT
}

fn default_retention_enabled() -> bool {
    true
}

fn default_buckets_per_window() -> u32 {
    1440
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(300)
}

// Duration serialization helpers
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("PT{}S", duration.as_secs_f64()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let seconds = s
            .strip_prefix("PT")
            .and_then(|rest| rest.strip_suffix('S'))
            .ok_or_else(|| serde::de::Error::custom(format!("Invalid duration format: {}", s)))?;
        let seconds: f64 = seconds.parse().map_err(serde::de::Error::custom)?;
        Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
    }
}
