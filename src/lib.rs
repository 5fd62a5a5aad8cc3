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

//! # Rollup Daemon
//!
//! A multi-dimensional, multi-window stream aggregation engine. It consumes an
//! append-only log of enrichment events and keeps rolling stat buckets for
//! 1, 5, 15 and 60 minute windows across global, subreddit, session, entity
//! and thread dimensions.
//!
//! ## Features
//!
//! - **Incremental aggregation**: every event is merged into its buckets, no
//!   recomputation from the log
//! - **Effective exactly-once**: processed flags and the watermark commit
//!   atomically per event
//! - **Resumable**: a per-processor watermark with a compare-and-swap claim
//! - **Snapshots**: metrics can be frozen when consumption is paused
//! - **Read API**: current metrics, time series and engine health
//!
//! ## Example
//!
//! ```rust,no_run
//! use rollup::{Engine, config::EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::from_file("rollup.json")?;
//!     let engine = Engine::new(config).await?;
//!     engine.start().await?;
//!     engine.wait_for_shutdown().await?;
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod aggregation;
pub mod api;
pub mod applier;
pub mod clock;
pub mod config;
pub mod health;
pub mod model;
pub mod retention;
pub mod snapshot;
pub mod store;

use aggregation::Aggregator;
use api::ReadApi;
use applier::{ApplyError, BatchOutcome, EventApplier};
use clock::{Clock, SystemClock};
use config::EngineConfig;
use health::HealthMonitor;
use model::Window;
use retention::RetentionSweeper;
use snapshot::SnapshotManager;
use store::MemoryStore;

/// Main engine instance: stores, applier loop, snapshots and read API
pub struct Engine {
    config: EngineConfig,
    store: Arc<MemoryStore>,
    applier: Arc<EventApplier>,
    snapshots: SnapshotManager,
    retention: Arc<RetentionSweeper>,
    api: ReadApi,
    paused: Arc<AtomicBool>,
    /// Held for the whole of each batch run and each freeze
    run_lock: Arc<Mutex<()>>,
    shutdown_notify: Arc<Notify>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Create an engine over a fresh in-memory store and the wall clock
    pub async fn new(config: EngineConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(MemoryStore::new()), Arc::new(SystemClock))
    }

    /// Create an engine over the given store and clock
    pub fn with_parts(
        config: EngineConfig,
        store: Arc<MemoryStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate().context("Invalid engine configuration")?;

        let aggregator = Aggregator::new(store.clone(), clock.clone());
        let applier = EventApplier::new(
            store.clone(),
            aggregator,
            clock.clone(),
            config.applier_config(),
        );
        let health = HealthMonitor::new(
            store.clone(),
            clock.clone(),
            config.processor_id.clone(),
            config.health,
        );
        let api = ReadApi::new(store.clone(), store.clone(), health, clock.clone())
            .with_default_bucket_count(config.default_bucket_count);
        let snapshots = SnapshotManager::new(store.clone(), store.clone(), clock.clone());
        let retention = RetentionSweeper::new(
            store.clone(),
            clock,
            config.windows.clone(),
            config.retention.buckets_per_window,
        );
        let (stop, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            applier: Arc::new(applier),
            snapshots,
            retention: Arc::new(retention),
            api,
            paused: Arc::new(AtomicBool::new(false)),
            run_lock: Arc::new(Mutex::new(())),
            shutdown_notify: Arc::new(Notify::new()),
            stop,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Read-side query surface
    pub fn api(&self) -> &ReadApi {
        &self.api
    }

    /// Backing store, for producers appending events and admin tooling
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Run one applier batch immediately
    pub async fn run_batch(&self) -> Result<BatchOutcome, ApplyError> {
        let _run = self.run_lock.lock().await;
        self.applier.run_batch().await
    }

    /// Stop applying events and freeze global metrics; returns the snapshot id.
    ///
    /// Waits for an in-flight batch to finish so the snapshot sees either all
    /// or none of it.
    pub async fn pause(&self) -> Result<String> {
        self.paused.store(true, Ordering::SeqCst);
        let _run = self.run_lock.lock().await;
        let snapshot_id = self
            .snapshots
            .freeze(None, self.snapshot_window())
            .await
            .context("Failed to freeze metrics")?;
        info!(snapshot_id = %snapshot_id, "Engine paused");
        Ok(snapshot_id)
    }

    /// Freeze one session's metrics without pausing the engine
    pub async fn pause_session(&self, session_id: &str) -> Result<String> {
        let _run = self.run_lock.lock().await;
        let snapshot_id = self
            .snapshots
            .freeze(Some(session_id), self.snapshot_window())
            .await
            .with_context(|| format!("Failed to freeze metrics for session {}", session_id))?;
        info!(snapshot_id = %snapshot_id, session_id, "Session paused");
        Ok(snapshot_id)
    }

    /// Resume applying events
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Engine resumed");
        }
    }

    /// Start the applier loop, retention sweeps and signal handlers
    pub async fn start(&self) -> Result<()> {
        info!(
            processor_id = %self.config.processor_id,
            batch_limit = self.config.batch_limit,
            "Starting engine services"
        );

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_applier_loop());
        if self.config.retention.enabled {
            tasks.push(self.spawn_retention_loop());
        }
        drop(tasks);

        self.setup_signal_handlers().await;

        info!("All services started successfully");
        Ok(())
    }

    /// Request shutdown without waiting for a signal
    pub fn shutdown(&self) {
        self.shutdown_notify.notify_one();
    }

    /// Wait for a shutdown signal, then stop the background loops
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        self.shutdown_notify.notified().await;
        info!("Shutdown signal received, stopping services...");

        // The applier finishes its current batch before observing the stop
        self.stop.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(err) = task.await {
                warn!("Background task ended abnormally: {}", err);
            }
        }
        Ok(())
    }

    fn snapshot_window(&self) -> Window {
        self.config
            .windows
            .iter()
            .min()
            .copied()
            .unwrap_or(Window::OneMinute)
    }

    fn spawn_applier_loop(&self) -> JoinHandle<()> {
        let applier = Arc::clone(&self.applier);
        let paused = Arc::clone(&self.paused);
        let run_lock = Arc::clone(&self.run_lock);
        let mut stop = self.stop.subscribe();
        let period = self.config.poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.changed() => break,
                }
                let _run = run_lock.lock().await;
                // A pause may have landed while waiting for the lock
                if paused.load(Ordering::SeqCst) {
                    continue;
                }
                match applier.run_batch().await {
                    Ok(_) => {}
                    Err(ApplyError::AlreadyRunning(processor_id)) => {
                        debug!(processor_id = %processor_id, "Skipping tick, applier busy");
                    }
                    // Already recorded on the watermark; the next tick retries
                    Err(err) => warn!("Applier run failed: {}", err),
                }
            }
            info!("Applier loop stopped");
        })
    }

    fn spawn_retention_loop(&self) -> JoinHandle<()> {
        let retention = Arc::clone(&self.retention);
        let mut stop = self.stop.subscribe();
        let period = self.config.retention.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.changed() => break,
                }
                if let Err(err) = retention.sweep().await {
                    warn!("Retention sweep failed: {}", err);
                }
            }
        })
    }

    async fn setup_signal_handlers(&self) {
        let shutdown_notify = Arc::clone(&self.shutdown_notify);

        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received SIGINT, initiating shutdown");
                    shutdown_notify.notify_one();
                }
                Err(err) => {
                    warn!("Failed to listen for SIGINT: {}", err);
                }
            }
        });

        #[cfg(unix)]
        {
            let shutdown_notify = Arc::clone(&self.shutdown_notify);
            tokio::spawn(async move {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        info!("Received SIGTERM, initiating shutdown");
                        shutdown_notify.notify_one();
                    }
                    Err(err) => warn!("Failed to register SIGTERM handler: {}", err),
                }
            });
        }
    }
}
