// Copyright 2026 Penne Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for the replication controller.
//!
//! These tests drive a [`Replicator`] against a scripted change feed, an
//! in-memory target and an in-memory checkpoint store, covering:
//! - Per-document collapse and checkpoint advancement
//! - Resume precedence
//! - Reconnect after feed errors and failed batches
//! - Time-bounded runs and graceful shutdown
//! - Checkpoint locking

use bson::{doc, Bson, Document};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use penne_core::alert::{AlertSink, RecordingNotifier};
use penne_core::config::{ReplicatorConfig, ReplicatorConfigBuilder};
use penne_core::event::{ChangeEvent, Namespace, OperationType};
use penne_core::pipeline::{Replicator, ReplicatorError, ReplicatorState};
use penne_core::state::{Checkpoint, CheckpointError, CheckpointStore};
use penne_core::stream::MockChangeFeed;
use penne_core::target::{MemoryTarget, Target};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const KEY: &str = "shop.orders";
const LOCK: &str = "penne:lock:shop.orders";

/// In-memory checkpoint store with failure injection.
#[derive(Debug, Clone, Default)]
struct TestStore {
    inner: Arc<Mutex<TestStoreState>>,
}

#[derive(Debug, Default)]
struct TestStoreState {
    checkpoints: HashMap<String, Checkpoint>,
    locks: HashMap<String, (String, Instant)>,
    fail_saves: bool,
    saves: usize,
    closed: bool,
}

impl TestStore {
    fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        let store = Self::default();
        store.lock().checkpoints.insert(KEY.to_string(), checkpoint);
        store
    }

    fn lock(&self) -> MutexGuard<'_, TestStoreState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn checkpoint(&self) -> Option<Checkpoint> {
        self.lock().checkpoints.get(KEY).cloned()
    }

    fn saves(&self) -> usize {
        self.lock().saves
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn fail_saves(&self, fail: bool) {
        self.lock().fail_saves = fail;
    }

    fn hold_lock(&self, owner: &str, ttl: Duration) {
        self.lock()
            .locks
            .insert(LOCK.to_string(), (owner.to_string(), Instant::now() + ttl));
    }

    fn drop_lock(&self) {
        self.lock().locks.remove(LOCK);
    }

    fn lock_owner(&self) -> Option<String> {
        self.lock()
            .locks
            .get(LOCK)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(owner, _)| owner.clone())
    }
}

#[async_trait::async_trait]
impl CheckpointStore for TestStore {
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.lock().checkpoints.get(key).cloned())
    }

    async fn save(&self, key: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut state = self.lock();
        if state.fail_saves {
            return Err(CheckpointError::Other("simulated save failure".into()));
        }
        state.saves += 1;
        state.checkpoints.insert(key.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), CheckpointError> {
        self.lock().checkpoints.remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        self.lock().closed = true;
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, CheckpointError> {
        let mut state = self.lock();
        let now = Instant::now();
        match state.locks.get(key) {
            Some((owner, expires)) if owner != owner_id && *expires > now => Ok(false),
            _ => {
                state
                    .locks
                    .insert(key.to_string(), (owner_id.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn refresh_lock(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, CheckpointError> {
        let mut state = self.lock();
        let now = Instant::now();
        match state.locks.get_mut(key) {
            Some((owner, expires)) if owner == owner_id && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, key: &str, owner_id: &str) -> Result<bool, CheckpointError> {
        let mut state = self.lock();
        match state.locks.get(key) {
            Some((owner, _)) if owner == owner_id => {
                state.locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_locked(&self, key: &str) -> Result<bool, CheckpointError> {
        Ok(self
            .lock()
            .locks
            .get(key)
            .is_some_and(|(_, expires)| *expires > Instant::now()))
    }
}

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

fn token(seq: u32) -> Document {
    doc! { "_data": format!("{seq:08}") }
}

fn event(seq: u32, id: i32, operation: OperationType, a: i32) -> ChangeEvent {
    ChangeEvent {
        operation,
        namespace: Namespace::new("shop", "orders"),
        document_key: Some(doc! { "_id": id }),
        full_document: Some(doc! { "_id": id, "a": a }),
        cluster_time: base() + ChronoDuration::seconds(i64::from(seq)),
        resume_token: token(seq),
    }
}

/// Checkpoint placed before every scripted event.
fn origin() -> Checkpoint {
    Checkpoint {
        resume_token: None,
        timestamp: base(),
    }
}

fn config() -> ReplicatorConfigBuilder {
    ReplicatorConfig::builder()
        .namespace(Namespace::new("shop", "orders"))
        .batch_size(10)
        .flush_interval(Duration::from_millis(50))
        .retry_delay(Duration::from_millis(10))
        .reconnect_delay(Duration::from_millis(10))
        .lock_ttl(Duration::from_secs(5))
        .instance_id("test-instance")
        .without_health_monitor()
}

struct Harness {
    feed: MockChangeFeed,
    target: MemoryTarget,
    store: TestStore,
    notifier: Arc<RecordingNotifier>,
    replicator: Replicator<MockChangeFeed, MemoryTarget, TestStore>,
}

fn harness(config: ReplicatorConfig, feed: MockChangeFeed, store: TestStore) -> Harness {
    harness_with_target(config, feed, store, MemoryTarget::new())
}

fn harness_with_target(
    config: ReplicatorConfig,
    feed: MockChangeFeed,
    store: TestStore,
    target: MemoryTarget,
) -> Harness {
    let notifier = Arc::new(RecordingNotifier::new());
    let replicator = Replicator::new(
        config,
        Arc::new(feed.clone()),
        Arc::new(target.clone()),
        Arc::new(store.clone()),
        AlertSink::new(notifier.clone()),
    );
    Harness {
        feed,
        target,
        store,
        notifier,
        replicator,
    }
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

async fn get(target: &MemoryTarget, id: i32) -> Option<Document> {
    target.get_document(&Bson::Int32(id)).await.unwrap()
}

#[tokio::test]
async fn insert_then_update_in_one_batch_yields_one_upsert() {
    let feed = MockChangeFeed::with_events([
        event(1, 1, OperationType::Insert, 1),
        event(2, 1, OperationType::Update, 2),
    ]);
    let mut h = harness(
        config().batch_size(2).build().unwrap(),
        feed,
        TestStore::with_checkpoint(origin()),
    );

    h.replicator.start().await.unwrap();
    let target = h.target.clone();
    eventually("batch applied", || target.bulk_count() == 1).await;
    let stats = h.replicator.stop().await.unwrap();

    assert_eq!(get(&h.target, 1).await, Some(doc! { "_id": 1, "a": 2 }));
    assert_eq!(h.target.upsert_count(), 1);
    assert_eq!(stats.events_received, 2);
    assert_eq!(stats.batches_applied, 1);
    assert_eq!(stats.updates, 1);
    assert_eq!(h.store.checkpoint().unwrap().resume_token, Some(token(2)));
}

#[tokio::test]
async fn deletes_and_unrecognized_events_never_reach_the_target() {
    let mut drop_event = event(3, 3, OperationType::Other("drop".into()), 0);
    drop_event.full_document = None;
    let feed = MockChangeFeed::with_events([
        event(1, 1, OperationType::Insert, 1),
        event(2, 1, OperationType::Delete, 0),
        drop_event,
        event(4, 2, OperationType::Insert, 7),
    ]);
    let mut h = harness(config().build().unwrap(), feed, TestStore::with_checkpoint(origin()));

    h.replicator.start().await.unwrap();
    let target = h.target.clone();
    eventually("both inserts applied", || target.len() == 2).await;
    h.replicator.stop().await.unwrap();

    assert_eq!(get(&h.target, 1).await, Some(doc! { "_id": 1, "a": 1 }));
    assert_eq!(get(&h.target, 2).await, Some(doc! { "_id": 2, "a": 7 }));
}

#[tokio::test]
async fn missing_checkpoint_is_created_at_current_time() {
    let before = Utc::now();
    let mut h = harness(
        config().build().unwrap(),
        MockChangeFeed::new(),
        TestStore::default(),
    );

    h.replicator.start().await.unwrap();
    let store = h.store.clone();
    eventually("initial checkpoint persisted", || store.checkpoint().is_some()).await;
    h.replicator.stop().await.unwrap();

    let checkpoint = h.store.checkpoint().unwrap();
    assert_eq!(checkpoint.resume_token, None);
    assert!(checkpoint.timestamp >= before);

    let opened = h.feed.opened_positions();
    assert_eq!(opened[0].resume_token, None);
    assert!(opened[0].start_time.unwrap() >= before);
}

#[tokio::test]
async fn stored_token_takes_precedence_over_start_time() {
    let feed = MockChangeFeed::with_events([
        event(1, 1, OperationType::Insert, 1),
        event(2, 2, OperationType::Insert, 2),
    ]);
    let store = TestStore::with_checkpoint(Checkpoint::confirmed(token(1), base()));
    let mut h = harness(
        config()
            .start_time(base() - ChronoDuration::days(1))
            .build()
            .unwrap(),
        feed,
        store,
    );

    h.replicator.start().await.unwrap();
    let target = h.target.clone();
    eventually("second event applied", || target.len() == 1).await;
    h.replicator.stop().await.unwrap();

    let opened = h.feed.opened_positions();
    assert_eq!(opened[0].resume_token, Some(token(1)));
    assert_eq!(opened[0].start_time, None);
    // The event at the stored token is not replayed.
    assert_eq!(get(&h.target, 1).await, None);
    assert_eq!(get(&h.target, 2).await, Some(doc! { "_id": 2, "a": 2 }));
}

#[tokio::test]
async fn stream_error_reconnects_from_last_confirmed_checkpoint() {
    let feed = MockChangeFeed::with_events([
        event(1, 1, OperationType::Insert, 1),
        event(2, 2, OperationType::Insert, 1),
        event(3, 1, OperationType::Update, 5),
    ]);
    feed.fail_session_after(1);
    let mut h = harness(config().build().unwrap(), feed, TestStore::with_checkpoint(origin()));

    h.replicator.start().await.unwrap();
    let target = h.target.clone();
    eventually("all documents converged", || {
        target.len() == 2
            && target
                .documents()
                .iter()
                .any(|d| d == &doc! { "_id": 1, "a": 5 })
    })
    .await;
    let stats = h.replicator.stop().await.unwrap();

    let opened = h.feed.opened_positions();
    assert!(opened.len() >= 2);
    // The best-effort flush confirmed the first event before reconnecting.
    assert_eq!(opened[1].resume_token, Some(token(1)));
    assert!(stats.reconnects >= 1);
    assert_eq!(h.store.checkpoint().unwrap().resume_token, Some(token(3)));
    assert!(h.notifier.count_matching("Change feed interrupted") >= 1);
}

#[tokio::test]
async fn failed_batch_is_replayed_not_dropped() {
    let feed = MockChangeFeed::with_events([
        event(1, 1, OperationType::Insert, 1),
        event(2, 2, OperationType::Insert, 2),
    ]);
    let target = MemoryTarget::new();
    target.fail_next_bulks(1);
    let mut h = harness_with_target(
        config().batch_size(2).build().unwrap(),
        feed,
        TestStore::with_checkpoint(origin()),
        target,
    );

    h.replicator.start().await.unwrap();
    let target = h.target.clone();
    eventually("replayed batch applied", || target.len() == 2).await;
    let stats = h.replicator.stop().await.unwrap();

    assert_eq!(stats.failed_batches, 1);
    assert_eq!(stats.batches_applied, 1);
    // Reopened at the untouched checkpoint, not past the failed batch.
    let opened = h.feed.opened_positions();
    assert_eq!(opened[1].resume_token, None);
    assert_eq!(opened[1].start_time, Some(base()));
    assert_eq!(h.store.checkpoint().unwrap().resume_token, Some(token(2)));
    assert_eq!(h.notifier.count_matching("Batch apply failed"), 1);
}

#[tokio::test]
async fn feed_open_failures_are_retried() {
    let feed = MockChangeFeed::with_events([event(1, 1, OperationType::Insert, 1)]);
    feed.fail_next_opens(2);
    let mut h = harness(config().build().unwrap(), feed, TestStore::with_checkpoint(origin()));

    h.replicator.start().await.unwrap();
    let target = h.target.clone();
    eventually("event applied after reopen", || target.len() == 1).await;
    let stats = h.replicator.stop().await.unwrap();

    assert_eq!(h.feed.open_count(), 3);
    assert_eq!(stats.reconnects, 2);
}

#[tokio::test]
async fn startup_retries_until_source_answers() {
    let feed = MockChangeFeed::new();
    feed.fail_next_pings(2);
    let mut h = harness(config().build().unwrap(), feed, TestStore::with_checkpoint(origin()));

    let mut states = h.replicator.subscribe_state();
    h.replicator.start().await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(3),
        states.wait_for(|s| *s == ReplicatorState::Streaming),
    )
    .await
    .unwrap()
    .unwrap();
    drop(states);
    h.replicator.stop().await.unwrap();

    let notifier = h.notifier.clone();
    eventually("connection alerts delivered", || {
        notifier.count_matching("Connection failed") == 2
    })
    .await;
}

#[tokio::test]
async fn time_bounded_run_drains_and_stops_on_its_own() {
    let feed = MockChangeFeed::with_events([
        event(1, 1, OperationType::Insert, 1),
        event(2, 2, OperationType::Insert, 2),
        event(30, 3, OperationType::Insert, 3),
    ]);
    let mut h = harness(
        config()
            .start_time(base())
            .end_time(base() + ChronoDuration::seconds(10))
            .flush_interval(Duration::from_secs(60))
            .lock_ttl(Duration::from_secs(120))
            .build()
            .unwrap(),
        feed,
        TestStore::default(),
    );

    h.replicator.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(3), h.replicator.stopped())
        .await
        .expect("bounded run should stop without a shutdown signal");

    assert_eq!(h.replicator.state(), ReplicatorState::Stopped);
    assert_eq!(h.target.len(), 2);
    assert_eq!(get(&h.target, 3).await, None);
    assert_eq!(h.store.checkpoint().unwrap().resume_token, Some(token(2)));
    assert!(h.target.is_closed());
    assert!(h.store.is_closed());

    let stats = h.replicator.stop().await.unwrap();
    assert_eq!(stats.events_received, 2);
}

#[tokio::test]
async fn shutdown_flushes_buffer_and_releases_resources() {
    let mut h = harness(
        config()
            .batch_size(100)
            .flush_interval(Duration::from_secs(60))
            .lock_ttl(Duration::from_secs(120))
            .build()
            .unwrap(),
        MockChangeFeed::new(),
        TestStore::with_checkpoint(origin()),
    );

    h.replicator.start().await.unwrap();
    let store = h.store.clone();
    eventually("lock acquired", || store.lock_owner().is_some()).await;

    for seq in 1..=3 {
        h.feed.push(event(seq, seq as i32, OperationType::Insert, 0));
    }
    for _ in 0..300 {
        if h.replicator.stats().await.events_received == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.target.is_empty(), "nothing should flush before shutdown");

    let stats = h.replicator.stop().await.unwrap();

    assert_eq!(stats.events_received, 3);
    assert_eq!(h.target.len(), 3);
    assert_eq!(h.store.checkpoint().unwrap().resume_token, Some(token(3)));
    assert_eq!(h.store.lock_owner(), None);
    assert!(h.store.is_closed());
    assert!(h.target.is_closed());
    assert_eq!(h.replicator.state(), ReplicatorState::Stopped);
}

#[tokio::test]
async fn lock_held_elsewhere_blocks_until_released() {
    let store = TestStore::with_checkpoint(origin());
    store.hold_lock("other-instance", Duration::from_secs(60));
    let feed = MockChangeFeed::with_events([event(1, 1, OperationType::Insert, 1)]);
    let mut h = harness(config().build().unwrap(), feed, store);

    h.replicator.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.replicator.state(), ReplicatorState::Starting);
    assert_eq!(h.feed.open_count(), 0);

    h.store.drop_lock();
    let target = h.target.clone();
    eventually("event applied after lock release", || target.len() == 1).await;
    assert_eq!(h.store.lock_owner().as_deref(), Some("test-instance"));

    h.replicator.stop().await.unwrap();
}

#[tokio::test]
async fn checkpoint_save_failure_alerts_and_continues() {
    let store = TestStore::with_checkpoint(origin());
    store.fail_saves(true);
    let feed = MockChangeFeed::with_events([
        event(1, 1, OperationType::Insert, 1),
        event(2, 2, OperationType::Insert, 2),
    ]);
    let mut h = harness(config().batch_size(1).build().unwrap(), feed, store);

    h.replicator.start().await.unwrap();
    let target = h.target.clone();
    eventually("both batches applied", || target.len() == 2).await;
    let stats = h.replicator.stop().await.unwrap();

    assert_eq!(stats.batches_applied, 2);
    assert!(stats.checkpoint_failures >= 2);
    assert_eq!(h.store.checkpoint(), Some(origin()));
    assert!(h.notifier.count_matching("Checkpoint save failed") >= 2);
}

#[tokio::test]
async fn idle_checkpoint_is_restamped() {
    let store = TestStore::with_checkpoint(Checkpoint::confirmed(token(1), base()));
    let feed = MockChangeFeed::with_events([event(1, 1, OperationType::Insert, 1)]);
    let mut h = harness(
        config()
            .flush_interval(Duration::from_millis(20))
            .checkpoint_heartbeat(Duration::from_millis(40))
            .build()
            .unwrap(),
        feed,
        store,
    );

    h.replicator.start().await.unwrap();
    let store = h.store.clone();
    eventually("heartbeat written", || store.saves() > 0).await;
    h.replicator.stop().await.unwrap();

    let checkpoint = h.store.checkpoint().unwrap();
    assert_eq!(checkpoint.resume_token, Some(token(1)));
    assert!(checkpoint.timestamp > base());
    assert!(h.target.is_empty());
}

#[tokio::test]
async fn periodic_health_check_alerts_on_stale_checkpoint() {
    let mut h = harness(
        config()
            .health_interval(Duration::from_millis(20))
            .build()
            .unwrap(),
        MockChangeFeed::new(),
        TestStore::with_checkpoint(origin()),
    );

    h.replicator.start().await.unwrap();
    let notifier = h.notifier.clone();
    eventually("unhealthy alert", || {
        notifier.count_matching("Replication unhealthy") >= 1
    })
    .await;
    h.replicator.stop().await.unwrap();
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let mut h = harness(
        config().build().unwrap(),
        MockChangeFeed::new(),
        TestStore::with_checkpoint(origin()),
    );

    h.replicator.start().await.unwrap();
    assert!(h.replicator.is_running());
    assert!(matches!(
        h.replicator.start().await,
        Err(ReplicatorError::AlreadyRunning)
    ));
    h.replicator.stop().await.unwrap();
    assert!(!h.replicator.is_running());
}

#[tokio::test]
async fn run_on_caller_task_until_shutdown() {
    let h = harness(
        config().build().unwrap(),
        MockChangeFeed::with_events([event(1, 1, OperationType::Insert, 1)]),
        TestStore::with_checkpoint(origin()),
    );
    let replicator = Arc::new(h.replicator);
    let (tx, rx) = broadcast::channel(1);

    let task = {
        let replicator = Arc::clone(&replicator);
        tokio::spawn(async move { replicator.run(rx).await })
    };

    let target = h.target.clone();
    eventually("event applied", || target.len() == 1).await;
    tx.send(()).unwrap();

    task.await.unwrap().unwrap();
    assert_eq!(replicator.state(), ReplicatorState::Stopped);
    assert_eq!(h.store.checkpoint().unwrap().resume_token, Some(token(1)));
}

#[tokio::test]
async fn lock_stays_held_while_size_triggered_flushes_keep_the_flush_timer_reset() {
    let mut h = harness(
        config()
            .batch_size(1)
            .flush_interval(Duration::from_millis(100))
            .lock_ttl(Duration::from_millis(150))
            .build()
            .unwrap(),
        MockChangeFeed::new(),
        TestStore::with_checkpoint(origin()),
    );

    h.replicator.start().await.unwrap();
    let store = h.store.clone();
    eventually("lock acquired", || store.lock_owner().is_some()).await;

    for seq in 1..=20 {
        h.feed.push(event(seq, seq as i32, OperationType::Insert, 0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            h.store.lock_owner().as_deref(),
            Some("test-instance"),
            "lock expired after {seq} events"
        );
    }
    assert!(!h
        .store
        .try_acquire_lock(LOCK, "intruder", Duration::from_secs(60))
        .await
        .unwrap());
    assert_eq!(h.replicator.state(), ReplicatorState::Streaming);

    let stats = h.replicator.stop().await.unwrap();
    assert_eq!(stats.reconnects, 0);
    assert!(stats.batches_applied >= 1);
    assert_eq!(h.notifier.count_matching("Checkpoint lock lost"), 0);
}

#[tokio::test]
async fn stop_interrupts_reconnect_delay() {
    let feed = MockChangeFeed::new();
    feed.fail_next_opens(1);
    let mut h = harness(
        config()
            .reconnect_delay(Duration::from_secs(60))
            .build()
            .unwrap(),
        feed,
        TestStore::with_checkpoint(origin()),
    );

    let mut states = h.replicator.subscribe_state();
    h.replicator.start().await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(3),
        states.wait_for(|s| *s == ReplicatorState::Reconnecting),
    )
    .await
    .unwrap()
    .unwrap();
    drop(states);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    h.replicator.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(h.feed.open_count(), 1);
    assert_eq!(h.replicator.state(), ReplicatorState::Stopped);
}

#[tokio::test]
async fn stop_interrupts_startup_retry_delay() {
    let feed = MockChangeFeed::new();
    feed.fail_next_pings(1);
    let mut h = harness(
        config().retry_delay(Duration::from_secs(60)).build().unwrap(),
        feed,
        TestStore::with_checkpoint(origin()),
    );

    h.replicator.start().await.unwrap();
    let notifier = h.notifier.clone();
    eventually("connection alert", || {
        notifier.count_matching("Connection failed") == 1
    })
    .await;

    let started = Instant::now();
    h.replicator.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(h.feed.open_count(), 0);
}

#[tokio::test]
async fn lost_lock_discards_buffer_and_waits_to_reacquire() {
    let mut h = harness(
        config()
            .batch_size(100)
            .flush_interval(Duration::from_secs(60))
            .lock_ttl(Duration::from_millis(200))
            .build()
            .unwrap(),
        MockChangeFeed::new(),
        TestStore::with_checkpoint(origin()),
    );

    h.replicator.start().await.unwrap();
    let store = h.store.clone();
    eventually("lock acquired", || store.lock_owner().is_some()).await;

    h.feed.push(event(1, 1, OperationType::Insert, 1));
    for _ in 0..300 {
        if h.replicator.stats().await.events_received == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.store.drop_lock();
    h.store.hold_lock("other-instance", Duration::from_secs(1));

    let notifier = h.notifier.clone();
    eventually("lock lost alert", || {
        notifier.count_matching("Checkpoint lock lost") == 1
    })
    .await;
    assert_eq!(h.replicator.state(), ReplicatorState::Reconnecting);
    assert_eq!(h.store.lock_owner().as_deref(), Some("other-instance"));
    assert!(h.target.is_empty(), "no writes while another instance holds the lock");
    assert_eq!(h.feed.open_count(), 1);

    let store = h.store.clone();
    eventually("lock re-acquired", || {
        store.lock_owner().as_deref() == Some("test-instance")
    })
    .await;
    let feed = h.feed.clone();
    eventually("feed reopened", || feed.open_count() == 2).await;
    assert!(h.target.is_empty());

    let stats = h.replicator.stop().await.unwrap();

    // Replayed from the reloaded checkpoint and flushed on shutdown.
    let opened = h.feed.opened_positions();
    assert_eq!(opened[1].resume_token, None);
    assert_eq!(opened[1].start_time, Some(base()));
    assert_eq!(stats.events_received, 2);
    assert_eq!(get(&h.target, 1).await, Some(doc! { "_id": 1, "a": 1 }));
    assert_eq!(h.store.checkpoint().unwrap().resume_token, Some(token(1)));
}
