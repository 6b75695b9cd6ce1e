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

//! Replication controller.
//!
//! The [`Replicator`] drives one source collection into the target:
//!
//! - **Startup**: ping source and target until both answer, take the
//!   checkpoint lock, load (or create) the checkpoint
//! - **Streaming**: a single loop owns the buffer and flushes it when it is
//!   full or when the flush timer fires, never both at once
//! - **Checkpointing**: the checkpoint advances only after its batch is
//!   confirmed applied
//! - **Reconnect**: any feed error or failed batch reopens the feed from the
//!   last confirmed checkpoint after a fixed delay
//! - **Drain**: on shutdown, or when a time-bounded run reaches its end, the
//!   buffer is flushed and the final checkpoint persisted before connections
//!   close
//!
//! States move `Starting -> Streaming -> Reconnecting -> Streaming ... ->
//! Draining -> Stopped` and are observable through
//! [`Replicator::subscribe_state`].
//!
//! # Example
//!
//! ```rust,no_run
//! use penne_core::alert::AlertSink;
//! use penne_core::config::ReplicatorConfig;
//! use penne_core::event::Namespace;
//! use penne_core::pipeline::Replicator;
//! use penne_core::stream::MockChangeFeed;
//! use penne_core::target::MemoryTarget;
//! # use penne_core::state::CheckpointStore;
//! use std::sync::Arc;
//!
//! # async fn example<S: CheckpointStore + 'static>(store: Arc<S>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ReplicatorConfig::builder()
//!     .namespace(Namespace::new("shop", "orders"))
//!     .build()?;
//!
//! let mut replicator = Replicator::new(
//!     config,
//!     Arc::new(MockChangeFeed::new()),
//!     Arc::new(MemoryTarget::new()),
//!     store,
//!     AlertSink::log_only(),
//! );
//!
//! replicator.start().await?;
//! // ...
//! let stats = replicator.stop().await?;
//! println!("applied {} batches", stats.batches_applied);
//! # Ok(())
//! # }
//! ```

use crate::alert::AlertSink;
use crate::apply::{ApplyError, Applier};
use crate::batch::BatchAccumulator;
use crate::config::ReplicatorConfig;
use crate::event::ChangeEvent;
use crate::health::HealthMonitor;
use crate::metrics::{self, ErrorCategory};
use crate::state::{Checkpoint, CheckpointError, CheckpointStore};
use crate::stream::{ChangeFeed, StreamError};
use crate::target::{Target, TargetError};
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle state of a [`Replicator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicatorState {
    /// Connecting, locking and loading the checkpoint
    Starting,
    /// Consuming the change feed
    Streaming,
    /// Waiting to reopen the feed after a failure
    Reconnecting,
    /// Flushing and persisting before shutdown
    Draining,
    /// Not running
    Stopped,
}

impl ReplicatorState {
    /// Lowercase name, as logged.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }

    /// Numeric encoding exported by the state gauge.
    pub fn as_gauge(&self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Streaming => 2,
            Self::Reconnecting => 3,
            Self::Draining => 4,
        }
    }

    /// Returns true for states the controller never leaves on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Draining | Self::Stopped)
    }
}

impl fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running totals since the replicator was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplicatorStats {
    /// Events read from the change feed
    pub events_received: u64,

    /// Batches confirmed by the target
    pub batches_applied: u64,

    /// Upserts that came from inserts
    pub inserts: u64,

    /// Upserts that came from updates
    pub updates: u64,

    /// Individual upserts the target rejected
    pub apply_errors: u64,

    /// Batches that failed as a whole
    pub failed_batches: u64,

    /// Times the change feed was reopened
    pub reconnects: u64,

    /// Checkpoints written
    pub checkpoints_saved: u64,

    /// Checkpoint writes that failed
    pub checkpoint_failures: u64,
}

/// Replicator errors.
#[derive(Debug, thiserror::Error)]
pub enum ReplicatorError {
    /// Replicator is already running
    #[error("Replicator is already running")]
    AlreadyRunning,

    /// Checkpoint store failed while shutting down
    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Target failed while shutting down
    #[error("Target error: {0}")]
    Target(#[from] TargetError),

    /// A worker task panicked or was cancelled
    #[error("Worker task failed: {0}")]
    Worker(String),
}

type WorkerHandle = JoinHandle<Result<(), ReplicatorError>>;

/// Change-feed replication controller for one source collection.
pub struct Replicator<F, T, S>
where
    F: ChangeFeed + ?Sized,
    T: Target + ?Sized,
    S: CheckpointStore + ?Sized,
{
    config: ReplicatorConfig,
    feed: Arc<F>,
    target: Arc<T>,
    store: Arc<S>,
    alerts: AlertSink,
    shutdown_tx: Option<broadcast::Sender<()>>,
    workers: Vec<WorkerHandle>,
    stats: Arc<RwLock<ReplicatorStats>>,
    state_tx: Arc<watch::Sender<ReplicatorState>>,
}

impl<F, T, S> Replicator<F, T, S>
where
    F: ChangeFeed + ?Sized + 'static,
    T: Target + ?Sized + 'static,
    S: CheckpointStore + ?Sized + 'static,
{
    /// Creates a replicator. Nothing connects until [`start`](Self::start)
    /// or [`run`](Self::run).
    pub fn new(
        config: ReplicatorConfig,
        feed: Arc<F>,
        target: Arc<T>,
        store: Arc<S>,
        alerts: AlertSink,
    ) -> Self {
        info!(
            namespace = %config.namespace,
            batch_size = config.batch_size,
            flush_interval = ?config.flush_interval,
            instance_id = %config.instance_id,
            bounded = config.is_bounded(),
            "Creating replicator"
        );

        let (state_tx, _) = watch::channel(ReplicatorState::Stopped);

        Self {
            config,
            feed,
            target,
            store,
            alerts,
            shutdown_tx: None,
            workers: Vec::new(),
            stats: Arc::new(RwLock::new(ReplicatorStats::default())),
            state_tx: Arc::new(state_tx),
        }
    }

    /// Spawns the replication worker and, when configured, the periodic
    /// health monitor.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicatorError::AlreadyRunning`] if called twice without
    /// [`stop`](Self::stop).
    #[instrument(skip(self), fields(namespace = %self.config.namespace))]
    pub async fn start(&mut self) -> Result<(), ReplicatorError> {
        if self.shutdown_tx.is_some() {
            return Err(ReplicatorError::AlreadyRunning);
        }

        info!("Starting replicator");

        let (shutdown_tx, _) = broadcast::channel(1);

        // Set here so `stopped()` cannot observe the pre-start state.
        set_state(&self.state_tx, ReplicatorState::Starting);

        let worker = self.worker(shutdown_tx.subscribe());
        self.workers.push(tokio::spawn(worker.run()));

        if let Some(interval) = self.config.health_interval {
            let monitor = HealthMonitor::new(
                Arc::clone(&self.feed),
                Arc::clone(&self.target),
                Arc::clone(&self.store),
                self.config.checkpoint_key(),
                self.config.staleness_threshold,
            );
            let alerts = self.alerts.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            self.workers.push(tokio::spawn(async move {
                monitor.run_periodic(interval, shutdown_rx, alerts).await;
                Ok(())
            }));
        }

        self.shutdown_tx = Some(shutdown_tx);
        info!(workers = self.workers.len(), "Replicator started");

        Ok(())
    }

    /// Signals shutdown, waits for the drain to finish and returns the final
    /// statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker failed while closing connections or
    /// panicked.
    #[instrument(skip(self), fields(namespace = %self.config.namespace))]
    pub async fn stop(&mut self) -> Result<ReplicatorStats, ReplicatorError> {
        info!("Stopping replicator");

        let Some(tx) = self.shutdown_tx.take() else {
            warn!("Replicator is not running");
            return Ok(self.stats().await);
        };
        let _ = tx.send(());

        let mut result = Ok(());
        for worker in self.workers.drain(..) {
            match worker.await {
                Ok(Ok(())) => debug!("Worker stopped successfully"),
                Ok(Err(e)) => {
                    error!(error = %e, "Worker stopped with error");
                    result = Err(e);
                }
                Err(e) => {
                    error!(error = %e, "Worker panicked");
                    result = Err(ReplicatorError::Worker(e.to_string()));
                }
            }
        }

        let stats = self.stats().await;
        info!(
            events_received = stats.events_received,
            batches_applied = stats.batches_applied,
            inserts = stats.inserts,
            updates = stats.updates,
            apply_errors = stats.apply_errors,
            reconnects = stats.reconnects,
            "Replicator stopped"
        );

        result.map(|()| stats)
    }

    /// Runs the replication loop on the current task until `shutdown`
    /// fires or a time-bounded run completes.
    ///
    /// The periodic health monitor is not started by this method.
    ///
    /// # Errors
    ///
    /// Returns an error if closing connections during the drain failed.
    #[instrument(skip(self, shutdown), fields(namespace = %self.config.namespace))]
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ReplicatorError> {
        set_state(&self.state_tx, ReplicatorState::Starting);
        self.worker(shutdown).run().await
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReplicatorState {
        *self.state_tx.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ReplicatorState> {
        self.state_tx.subscribe()
    }

    /// Waits until the replicator reaches [`ReplicatorState::Stopped`].
    ///
    /// A time-bounded run stops on its own; this is how callers notice.
    pub async fn stopped(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == ReplicatorState::Stopped).await;
    }

    /// Snapshot of the running totals.
    pub async fn stats(&self) -> ReplicatorStats {
        self.stats.read().await.clone()
    }

    /// Returns true between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    fn worker(&self, shutdown_rx: broadcast::Receiver<()>) -> Worker<F, T, S> {
        Worker {
            collection: self.config.namespace.full_name(),
            buffer: BatchAccumulator::new(self.config.batch_size),
            applier: Applier::new(Arc::clone(&self.target), self.config.namespace.full_name()),
            config: self.config.clone(),
            feed: Arc::clone(&self.feed),
            store: Arc::clone(&self.store),
            alerts: self.alerts.clone(),
            stats: Arc::clone(&self.stats),
            state_tx: Arc::clone(&self.state_tx),
            shutdown: Shutdown::new(shutdown_rx),
            checkpoint: None,
            last_save: Instant::now(),
            lock_held: false,
        }
    }
}

fn set_state(tx: &watch::Sender<ReplicatorState>, state: ReplicatorState) {
    let previous = tx.send_replace(state);
    if previous != state {
        debug!(from = %previous, to = %state, "Replicator state changed");
    }
    metrics::set_replicator_state(state);
}

/// Latched view of the shutdown broadcast.
struct Shutdown {
    triggered: bool,
    rx: broadcast::Receiver<()>,
}

impl Shutdown {
    fn new(rx: broadcast::Receiver<()>) -> Self {
        Self {
            triggered: false,
            rx,
        }
    }

    /// Resolves once shutdown has been signalled. A dropped sender counts.
    async fn recv(&mut self) {
        if self.triggered {
            return;
        }
        let _ = self.rx.recv().await;
        self.triggered = true;
    }
}

/// How a streaming session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Shutdown was signalled
    Shutdown,
    /// A time-bounded feed reached its end
    Exhausted,
    /// Feed error or failed batch; reopen from the checkpoint
    Interrupted,
    /// Another instance took the checkpoint lock
    LockLost,
}

/// State owned by the single replication loop.
struct Worker<F, T, S>
where
    F: ChangeFeed + ?Sized,
    T: Target + ?Sized,
    S: CheckpointStore + ?Sized,
{
    config: ReplicatorConfig,
    collection: String,
    feed: Arc<F>,
    store: Arc<S>,
    applier: Applier<T>,
    alerts: AlertSink,
    stats: Arc<RwLock<ReplicatorStats>>,
    state_tx: Arc<watch::Sender<ReplicatorState>>,
    shutdown: Shutdown,
    buffer: BatchAccumulator,
    /// Last confirmed position; `None` until loaded
    checkpoint: Option<Checkpoint>,
    last_save: Instant,
    lock_held: bool,
}

impl<F, T, S> Worker<F, T, S>
where
    F: ChangeFeed + ?Sized,
    T: Target + ?Sized,
    S: CheckpointStore + ?Sized,
{
    #[instrument(skip(self), fields(collection = %self.collection))]
    async fn run(mut self) -> Result<(), ReplicatorError> {
        info!("Starting replication worker");
        self.set_state(ReplicatorState::Starting);

        let ready =
            self.connect().await && self.acquire_lock().await && self.load_checkpoint().await;

        if ready {
            loop {
                match self.stream_session().await {
                    SessionEnd::Shutdown => {
                        info!("Received shutdown signal");
                        break;
                    }
                    SessionEnd::Exhausted => {
                        info!(end_time = ?self.config.end_time, "Change feed reached end time");
                        break;
                    }
                    SessionEnd::Interrupted => {
                        self.set_state(ReplicatorState::Reconnecting);
                        info!(delay = ?self.config.reconnect_delay, "Reconnecting from last checkpoint");
                        if self.pause(self.config.reconnect_delay).await {
                            break;
                        }
                    }
                    SessionEnd::LockLost => {
                        self.set_state(ReplicatorState::Reconnecting);
                        self.lock_held = false;
                        self.checkpoint = None;
                        let dropped = self.buffer.discard();
                        warn!(dropped, "Discarded buffered events after losing checkpoint lock");
                        if !(self.acquire_lock().await && self.load_checkpoint().await) {
                            break;
                        }
                    }
                }
            }
        }

        self.drain().await
    }

    fn set_state(&self, state: ReplicatorState) {
        set_state(&self.state_tx, state);
    }

    /// Sleeps for `delay`. Returns true if shutdown arrived first.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            () = self.shutdown.recv() => true,
            () = tokio::time::sleep(delay) => false,
        }
    }

    /// Pings source and target until both answer. Returns false on shutdown.
    async fn connect(&mut self) -> bool {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let source = self.feed.ping().await;
            let target = self.applier.target().ping().await;

            let mut failures = Vec::new();
            if let Err(e) = &source {
                failures.push(format!("source: {e}"));
            }
            if let Err(e) = &target {
                failures.push(format!("target: {e}"));
            }

            if failures.is_empty() {
                info!(attempt, "Connected to source and target");
                return true;
            }

            let message = failures.join("; ");
            warn!(
                attempt,
                error = %message,
                retry_delay = ?self.config.retry_delay,
                "Connection attempt failed"
            );
            self.alerts.alert(
                "Connection failed",
                format!("attempt {attempt}: {message}"),
            );

            if self.pause(self.config.retry_delay).await {
                return false;
            }
        }
    }

    /// Takes the checkpoint lock, waiting while another owner holds it.
    /// Returns false on shutdown.
    async fn acquire_lock(&mut self) -> bool {
        let key = self.config.lock_key();
        loop {
            match self
                .store
                .try_acquire_lock(&key, &self.config.instance_id, self.config.lock_ttl)
                .await
            {
                Ok(true) => {
                    metrics::increment_lock_acquisitions();
                    info!(lock = %key, owner = %self.config.instance_id, "Acquired checkpoint lock");
                    self.lock_held = true;
                    return true;
                }
                Ok(false) => {
                    warn!(lock = %key, "Checkpoint lock held by another instance, waiting");
                }
                Err(e) => {
                    warn!(lock = %key, error = %e, "Failed to acquire checkpoint lock");
                    self.alerts
                        .alert("Checkpoint store unavailable", e.to_string());
                }
            }

            if self.pause(self.config.retry_delay).await {
                return false;
            }
        }
    }

    /// Loads the checkpoint, creating one at the current instant when none
    /// exists. Returns false on shutdown.
    async fn load_checkpoint(&mut self) -> bool {
        let key = self.config.checkpoint_key();
        loop {
            match self.store.load(&key).await {
                Ok(Some(checkpoint)) => {
                    info!(
                        has_token = checkpoint.resume_token.is_some(),
                        timestamp = %checkpoint.timestamp,
                        "Loaded checkpoint"
                    );
                    self.checkpoint = Some(checkpoint);
                    self.last_save = Instant::now();
                    return true;
                }
                Ok(None) => {
                    info!("No checkpoint found, starting from current time");
                    self.persist(Checkpoint::starting_now()).await;
                    return true;
                }
                Err(e) => {
                    error!(error = %e, "Failed to load checkpoint");
                    self.alerts.alert("Checkpoint load failed", e.to_string());
                    if self.pause(self.config.retry_delay).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Opens the feed at the confirmed position and consumes it until it
    /// ends, fails, or shutdown arrives.
    async fn stream_session(&mut self) -> SessionEnd {
        let Some(checkpoint) = &self.checkpoint else {
            return SessionEnd::Interrupted;
        };
        let position = checkpoint.resume_position(self.config.start_time, self.config.end_time);
        let bounded = position.is_bounded();

        debug!(
            resume_token = ?position.resume_token,
            start_time = ?position.start_time,
            end_time = ?position.end_time,
            "Opening change feed"
        );

        let mut events = match self.feed.open(position).await {
            Ok(events) => events,
            Err(e) => {
                self.on_stream_error(e).await;
                return SessionEnd::Interrupted;
            }
        };

        self.set_state(ReplicatorState::Streaming);
        info!("Change feed open");

        let period = self.config.flush_interval;
        let mut flush_timer = interval_at(Instant::now() + period, period);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Independent of the flush timer, which size-triggered flushes reset.
        let refresh_period = self.config.lock_refresh_interval();
        let mut lock_timer = interval_at(Instant::now() + refresh_period, refresh_period);
        lock_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.recv() => {
                    return SessionEnd::Shutdown;
                }

                _ = flush_timer.tick() => {
                    if self.buffer.is_empty() {
                        self.heartbeat().await;
                    } else {
                        debug!(buffered = self.buffer.len(), "Flush timer fired");
                        if let Err(e) = self.flush().await {
                            self.on_apply_error(e).await;
                            return SessionEnd::Interrupted;
                        }
                    }
                }

                _ = lock_timer.tick() => {
                    if !self.refresh_lock().await {
                        return SessionEnd::LockLost;
                    }
                }

                next = events.next() => match next {
                    Some(Ok(event)) => {
                        self.record_event(&event).await;
                        if self.buffer.push(event) {
                            debug!(buffered = self.buffer.len(), "Batch full");
                            if let Err(e) = self.flush().await {
                                self.on_apply_error(e).await;
                                return SessionEnd::Interrupted;
                            }
                            flush_timer.reset();
                        }
                        metrics::set_buffered_events(self.buffer.len(), &self.collection);
                    }
                    Some(Err(e)) => {
                        self.on_stream_error(e).await;
                        return SessionEnd::Interrupted;
                    }
                    None if bounded => return SessionEnd::Exhausted,
                    None => {
                        warn!("Change feed ended unexpectedly");
                        self.on_stream_error(StreamError::connection_msg(
                            "change feed ended unexpectedly",
                        ))
                        .await;
                        return SessionEnd::Interrupted;
                    }
                },
            }
        }
    }

    async fn record_event(&self, event: &ChangeEvent) {
        metrics::increment_events_received(&self.collection, event.operation.as_str());
        if let Ok(lag) = (Utc::now() - event.cluster_time).to_std() {
            metrics::record_change_feed_lag(lag, &self.collection);
        }
        self.stats.write().await.events_received += 1;
    }

    /// Applies the buffer and advances the checkpoint to its last token.
    ///
    /// On failure the buffered events are gone and the checkpoint is
    /// unchanged; they are replayed after reconnecting.
    #[instrument(skip(self), fields(buffered = self.buffer.len()))]
    async fn flush(&mut self) -> Result<(), ApplyError> {
        let batch = self.buffer.take();
        if batch.is_empty() {
            return Ok(());
        }

        let token = batch.last_resume_token().cloned();
        let applied = self.applier.apply(&batch).await?;

        {
            let mut stats = self.stats.write().await;
            stats.batches_applied += 1;
            stats.inserts += applied.inserts;
            stats.updates += applied.updates;
            stats.apply_errors += applied.errors;
        }

        info!(
            events = batch.len(),
            inserts = applied.inserts,
            updates = applied.updates,
            errors = applied.errors,
            "Batch applied"
        );

        if let Some(token) = token {
            self.persist(Checkpoint::confirmed(token, Utc::now())).await;
        }

        Ok(())
    }

    /// Re-stamps an idle checkpoint so its age reflects liveness.
    async fn heartbeat(&mut self) {
        if self.last_save.elapsed() < self.config.checkpoint_heartbeat {
            return;
        }
        if let Some(checkpoint) = &self.checkpoint {
            debug!("Idle, re-stamping checkpoint");
            let touched = checkpoint.touched(Utc::now());
            self.persist(touched).await;
        }
    }

    /// Records `checkpoint` as confirmed and writes it to the store.
    ///
    /// A failed write is alerted and otherwise ignored; the next flush or
    /// the drain writes a newer position.
    async fn persist(&mut self, checkpoint: Checkpoint) {
        let key = self.config.checkpoint_key();
        let result = self.store.save(&key, &checkpoint).await;
        self.checkpoint = Some(checkpoint);

        match result {
            Ok(()) => {
                metrics::increment_checkpoint_saves();
                self.stats.write().await.checkpoints_saved += 1;
                self.last_save = Instant::now();
                debug!("Checkpoint saved");
            }
            Err(e) => {
                metrics::increment_checkpoint_failures();
                self.stats.write().await.checkpoint_failures += 1;
                error!(error = %e, "Failed to save checkpoint");
                self.alerts.alert("Checkpoint save failed", e.to_string());
            }
        }
    }

    /// Extends the checkpoint lock. Returns false if another owner holds it.
    async fn refresh_lock(&mut self) -> bool {
        let key = self.config.lock_key();
        match self
            .store
            .refresh_lock(&key, &self.config.instance_id, self.config.lock_ttl)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                metrics::increment_locks_lost();
                error!(lock = %key, "Checkpoint lock lost to another instance");
                self.alerts.alert(
                    "Checkpoint lock lost",
                    format!("{} no longer owns {key}", self.config.instance_id),
                );
                false
            }
            Err(e) => {
                warn!(lock = %key, error = %e, "Failed to refresh checkpoint lock");
                true
            }
        }
    }

    async fn on_apply_error(&mut self, err: ApplyError) {
        let dropped = self.buffer.discard();
        error!(
            error = %err,
            dropped,
            "Batch apply failed, replaying from last checkpoint"
        );
        self.alerts.alert("Batch apply failed", err.to_string());
        metrics::increment_reconnects(err.category());

        let mut stats = self.stats.write().await;
        stats.failed_batches += 1;
        stats.reconnects += 1;
    }

    async fn on_stream_error(&mut self, err: StreamError) {
        self.set_state(ReplicatorState::Reconnecting);
        error!(error = %err, category = err.category(), "Change feed interrupted");

        if !self.buffer.is_empty() {
            debug!(buffered = self.buffer.len(), "Flushing before reconnect");
            if let Err(e) = self.flush().await {
                warn!(error = %e, "Flush before reconnect failed");
                self.alerts.alert("Batch apply failed", e.to_string());
                self.stats.write().await.failed_batches += 1;
            }
        }

        self.alerts.alert("Change feed interrupted", err.to_string());
        let category = match err {
            StreamError::Connection { .. } => ErrorCategory::Connection,
            _ => ErrorCategory::Stream,
        };
        metrics::increment_reconnects(category);
        self.stats.write().await.reconnects += 1;
    }

    /// Flushes the buffer, persists the final checkpoint and closes every
    /// connection. Always ends in [`ReplicatorState::Stopped`].
    async fn drain(&mut self) -> Result<(), ReplicatorError> {
        self.set_state(ReplicatorState::Draining);

        if !self.buffer.is_empty() {
            info!(buffered = self.buffer.len(), "Flushing buffered events before shutdown");
            if let Err(e) = self.flush().await {
                error!(error = %e, "Failed to flush buffered events on shutdown");
                self.alerts.alert("Batch apply failed", e.to_string());
                self.stats.write().await.failed_batches += 1;
            }
        }

        if let Some(checkpoint) = self.checkpoint.clone() {
            self.persist(checkpoint).await;
        }

        let mut result = Ok(());

        if let Err(e) = self.applier.target().close().await {
            error!(error = %e, "Failed to close target");
            result = Err(ReplicatorError::Target(e));
        }

        if self.lock_held {
            let key = self.config.lock_key();
            match self.store.release_lock(&key, &self.config.instance_id).await {
                Ok(true) => {
                    metrics::increment_locks_released();
                    debug!(lock = %key, "Released checkpoint lock");
                }
                Ok(false) => warn!(lock = %key, "Checkpoint lock was not held at release"),
                Err(e) => warn!(lock = %key, error = %e, "Failed to release checkpoint lock"),
            }
            self.lock_held = false;
        }

        if let Err(e) = self.store.close().await {
            error!(error = %e, "Failed to close checkpoint store");
            if result.is_ok() {
                result = Err(ReplicatorError::Checkpoint(e));
            }
        }

        self.set_state(ReplicatorState::Stopped);
        info!("Replication worker stopped");
        result
    }
}
