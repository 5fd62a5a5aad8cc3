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

//! Engine health derived from the applier's watermark

use crate::clock::Clock;
use crate::model::{Millis, WatermarkStatus};
use crate::store::{Ledger, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Coarse engine state reported to readers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Error,
}

/// Lag limits separating healthy, degraded and error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthThresholds {
    /// Lag above which the engine is degraded
    #[serde(default = "default_degraded_lag_ms")]
    pub degraded_lag_ms: Millis,

    /// Lag above which the engine is in error
    #[serde(default = "default_error_lag_ms")]
    pub error_lag_ms: Millis,
}

fn default_degraded_lag_ms() -> Millis {
    10_000
}

fn default_error_lag_ms() -> Millis {
    60_000
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_lag_ms: default_degraded_lag_ms(),
            error_lag_ms: default_error_lag_ms(),
        }
    }
}

impl HealthThresholds {
    /// An explicit `error` status on the watermark always wins over lag
    pub fn classify(&self, lag_ms: Millis, watermark_status: WatermarkStatus) -> HealthStatus {
        if watermark_status == WatermarkStatus::Error || lag_ms > self.error_lag_ms {
            HealthStatus::Error
        } else if lag_ms > self.degraded_lag_ms {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Health report for one processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineHealth {
    pub status: HealthStatus,
    pub lag_ms: Millis,
    pub processed_count: u64,
    pub last_run_at: Option<Millis>,
    pub events_pending: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Reads the watermark and backlog to report health
#[derive(Clone)]
pub struct HealthMonitor {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    processor_id: String,
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        processor_id: impl Into<String>,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            ledger,
            clock,
            processor_id: processor_id.into(),
            thresholds,
        }
    }

    pub async fn get_engine_health(&self) -> Result<EngineHealth, StoreError> {
        let now = self.clock.now_ms();
        let events_pending = self.ledger.count_unprocessed().await?;

        let Some(watermark) = self.ledger.get_watermark(&self.processor_id).await? else {
            // Never ran: lag is the age of the oldest waiting event, if any
            let oldest = self.ledger.get_unprocessed_events(Millis::MIN, 1).await?;
            let lag_ms = oldest
                .first()
                .map(|event| now.saturating_sub(event.at).max(0))
                .unwrap_or(0);
            return Ok(EngineHealth {
                status: self.thresholds.classify(lag_ms, WatermarkStatus::Idle),
                lag_ms,
                processed_count: 0,
                last_run_at: None,
                events_pending,
                error_message: None,
            });
        };

        let lag_ms = now.saturating_sub(watermark.last_processed_at).max(0);
        Ok(EngineHealth {
            status: self.thresholds.classify(lag_ms, watermark.status),
            lag_ms,
            processed_count: watermark.processed_count,
            last_run_at: watermark.last_run_at,
            events_pending,
            error_message: watermark.error_message,
        })
    }
}
