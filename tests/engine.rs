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

use rollup::api::MetricsQuery;
use rollup::clock::ManualClock;
use rollup::config::EngineConfig;
use rollup::health::HealthStatus;
use rollup::model::{Deltas, DimKind, EnrichmentEvent, EventDimensions, Millis, Window};
use rollup::store::{EventLog, MemoryStore, SnapshotStore, WatermarkStore};
use rollup::Engine;
use std::sync::Arc;
use std::time::Duration;

const MINUTE: Millis = 60_000;
const START: Millis = 1_000 * MINUTE;

fn engine(clock: Arc<ManualClock>) -> Engine {
    let config = EngineConfig {
        poll_interval: Duration::from_millis(10),
        ..EngineConfig::default()
    };
    Engine::with_parts(config, Arc::new(MemoryStore::new()), clock).unwrap()
}

fn event(id: &str, at: Millis, subreddit: &str, session: &str, deltas: Deltas) -> EnrichmentEvent {
    EnrichmentEvent::new(
        id,
        at,
        EventDimensions {
            subreddit: Some(subreddit.to_string()),
            session_id: Some(session.to_string()),
            entities: vec!["ferris".to_string()],
            thread_id: None,
        },
        deltas,
    )
}

fn concepts(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_momentum_scenario_end_to_end() {
    let clock = Arc::new(ManualClock::new(START + 30_000));
    let engine = engine(clock.clone());

    engine
        .store()
        .append(event(
            "e1",
            START + 1_000,
            "rust",
            "s1",
            Deltas {
                stories_total: 10,
                stories_aligned: 6,
                posts_total: 5,
                unique_concepts: concepts(&["a", "b"]),
                ..Deltas::default()
            },
        ))
        .await
        .unwrap();
    engine
        .store()
        .append(event(
            "e2",
            START + 2_000,
            "rust",
            "s1",
            Deltas {
                stories_total: 10,
                stories_aligned: 4,
                posts_total: 20,
                unique_concepts: concepts(&["b", "c"]),
                ..Deltas::default()
            },
        ))
        .await
        .unwrap();

    let outcome = engine.run_batch().await.unwrap();
    assert_eq!(outcome.applied, 2);
    assert_eq!(outcome.new_watermark, START + 2_000);

    for query in [
        MetricsQuery::global(Window::OneMinute),
        MetricsQuery::dimension(DimKind::Subreddit, "rust", Window::FiveMinutes),
        MetricsQuery::dimension(DimKind::Session, "s1", Window::SixtyMinutes),
        MetricsQuery::dimension(DimKind::Entity, "ferris", Window::FifteenMinutes),
    ] {
        let response = engine.api().get_metrics(&query).await.unwrap();
        let metrics = response.metrics;
        assert_eq!(metrics.rc_percent, 50.0, "{:?}", query);
        assert_eq!(metrics.ni_count, 3);
        assert!((metrics.story_yield - 0.8).abs() < 1e-12);
        assert!((metrics.cm_percent + 60.0).abs() < 1e-9);
        assert_eq!(response.timeseries.len(), 1);
    }
}

#[tokio::test]
async fn test_replay_after_success_changes_nothing() {
    let clock = Arc::new(ManualClock::new(START));
    let engine = engine(clock.clone());
    for i in 0..10 {
        let deltas = Deltas {
            stories_total: 1,
            posts_total: 1,
            ..Deltas::default()
        };
        engine
            .store()
            .append(event(&format!("e{}", i), START - 10_000 + i, "rust", "s1", deltas))
            .await
            .unwrap();
    }

    engine.run_batch().await.unwrap();
    let before = engine
        .api()
        .get_metrics(&MetricsQuery::global(Window::OneMinute))
        .await
        .unwrap();

    // A retried invocation sees nothing left to apply
    let outcome = engine.run_batch().await.unwrap();
    assert_eq!(outcome.applied, 0);
    let after = engine
        .api()
        .get_metrics(&MetricsQuery::global(Window::OneMinute))
        .await
        .unwrap();
    assert_eq!(before, after);

    let watermark = engine
        .store()
        .get_watermark("stats-applier")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(watermark.processed_count, 10);
}

#[tokio::test]
async fn test_admin_replay_reapplies_events() {
    let clock = Arc::new(ManualClock::new(START));
    let engine = engine(clock.clone());
    engine
        .store()
        .append(event("e1", START - 5_000, "rust", "s1", Deltas::default()))
        .await
        .unwrap();
    engine.run_batch().await.unwrap();

    let store = engine.store();
    store
        .mark_events_unprocessed(&["e1".to_string()])
        .await
        .unwrap();
    let watermark = store.reset_watermark("stats-applier", 0).await.unwrap();
    assert_eq!(watermark.last_processed_at, 0);

    let outcome = engine.run_batch().await.unwrap();
    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.new_watermark, START - 5_000);
}

#[tokio::test]
async fn test_health_tracks_lag() {
    let clock = Arc::new(ManualClock::new(START));
    let engine = engine(clock.clone());
    engine
        .store()
        .append(event("e1", START, "rust", "s1", Deltas::default()))
        .await
        .unwrap();
    engine.run_batch().await.unwrap();

    clock.advance(45_000);
    let health = engine.api().get_engine_health().await.unwrap();
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.lag_ms, 45_000);
    assert_eq!(health.processed_count, 1);
    assert_eq!(health.events_pending, 0);

    clock.advance(20_000);
    let health = engine.api().get_engine_health().await.unwrap();
    assert_eq!(health.status, HealthStatus::Error);
}

#[tokio::test]
async fn test_pause_freezes_one_active_snapshot() {
    let clock = Arc::new(ManualClock::new(START + 10_000));
    let engine = engine(clock.clone());
    engine
        .store()
        .append(event(
            "e1",
            START + 1_000,
            "rust",
            "s1",
            Deltas {
                stories_total: 4,
                stories_aligned: 1,
                stories_cross_post: 2,
                posts_total: 4,
                ..Deltas::default()
            },
        ))
        .await
        .unwrap();
    engine.run_batch().await.unwrap();

    engine.pause().await.unwrap();
    let second = engine.pause().await.unwrap();
    assert!(engine.is_paused());

    let snapshots = engine.store().list_snapshots(None).await.unwrap();
    assert_eq!(snapshots.iter().filter(|s| s.is_active).count(), 1);

    let view = engine.api().get_snapshot(None).await.unwrap().unwrap();
    assert_eq!(view.snapshot_id, second);
    assert_eq!(view.metrics.rc_percent, 25.0);
    assert_eq!(view.metrics.tp_percent, 50.0);
    // subreddit, session and entity
    assert_eq!(view.by_dimension.len(), 3);

    engine.resume();
    assert!(!engine.is_paused());

    // A session freeze is scoped to that session and does not pause
    let session_id = engine.pause_session("s1").await.unwrap();
    assert!(!engine.is_paused());
    let session = engine.api().get_snapshot(Some("s1")).await.unwrap().unwrap();
    assert_eq!(session.snapshot_id, session_id);
    assert_eq!(session.by_dimension.len(), 1);
}

#[tokio::test]
async fn test_background_loop_applies_until_shutdown() {
    let clock = Arc::new(ManualClock::new(START));
    let engine = engine(clock.clone());
    engine
        .store()
        .append(event("e1", START - 1_000, "rust", "s1", Deltas::default()))
        .await
        .unwrap();

    engine.start().await.unwrap();
    let mut pending = engine.store().count_unprocessed().await.unwrap();
    for _ in 0..200 {
        if pending == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        pending = engine.store().count_unprocessed().await.unwrap();
    }
    assert_eq!(pending, 0);

    engine.shutdown();
    engine.wait_for_shutdown().await.unwrap();
}
