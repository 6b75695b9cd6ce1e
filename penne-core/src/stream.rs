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

//! Change feed source.
//!
//! A [`ChangeFeed`] opens a live, ordered, resumable sequence of
//! [`ChangeEvent`]s starting at a [`ResumePosition`]. The sequence:
//!
//! - suspends between events (no busy polling),
//! - only yields `insert` and `update` events (see [`admits`]),
//! - terminates with a [`StreamError`] on transport failure,
//! - ends cleanly (`None`) only in time-bounded mode, once `end_time` is passed.
//!
//! An opened sequence is not restartable in place. After an error the caller
//! drops it and opens a new one from its last confirmed position.
//!
//! ```text
//! Checkpoint ──► ResumePosition ──► ChangeFeed::open ──► EventStream ──► BatchAccumulator
//!                                        ▲                    │
//!                                        └── reopen on error ─┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use penne_core::event::Namespace;
//! use penne_core::stream::{ChangeFeed, ChangeStreamConfig, MongoChangeFeed, ResumePosition};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let feed = MongoChangeFeed::connect(
//!     "mongodb://localhost:27017/?replicaSet=rs0",
//!     Namespace::new("shop", "orders"),
//!     ChangeStreamConfig::default(),
//! )
//! .await?;
//!
//! let mut events = feed.open(ResumePosition::now()).await?;
//! while let Some(event) = events.next().await {
//!     let event = event?;
//!     println!("{} {:?}", event.operation, event.document_id());
//! }
//! # Ok(())
//! # }
//! ```

use crate::event::{ChangeEvent, ConversionError, Namespace};
use bson::{doc, Document, Timestamp};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use mongodb::{
    change_stream::{
        event::{ChangeStreamEvent, OperationType as MongoOpType, ResumeToken},
        ChangeStream,
    },
    error::{Error as MongoError, ErrorKind as MongoErrorKind},
    options::{ChangeStreamOptions, FullDocumentType},
    Client, Collection,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Sequence of change events produced by [`ChangeFeed::open`].
pub type EventStream = BoxStream<'static, Result<ChangeEvent, StreamError>>;

/// Errors that can occur while opening or consuming a change feed.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Source unreachable or the cursor failed (may be retryable)
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        /// Server error code
        code: Option<i32>,
        /// Server error labels (e.g., "ResumableChangeStreamError")
        labels: Vec<String>,
    },

    /// A driver event could not be converted
    #[error("Event conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    /// Stream was invalidated (collection dropped or renamed)
    #[error("Stream invalidated: {reason}")]
    Invalidated { reason: String },

    /// Resume token no longer in the oplog (error code 286)
    #[error("Invalid resume token (code {code}): oplog may be truncated")]
    InvalidResumeToken { code: i32 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<MongoError> for StreamError {
    fn from(err: MongoError) -> Self {
        Self::from_mongo_error(err)
    }
}

impl StreamError {
    /// Creates a StreamError from a driver error, keeping code and labels.
    pub fn from_mongo_error(err: MongoError) -> Self {
        let code = match err.kind.as_ref() {
            MongoErrorKind::Command(cmd_err) => Some(cmd_err.code),
            _ => None,
        };

        // ChangeStreamHistoryLost
        if code == Some(286) {
            return Self::InvalidResumeToken { code: 286 };
        }

        let labels: Vec<String> = err.labels().iter().cloned().collect();

        Self::Connection {
            message: err.to_string(),
            source: Some(Box::new(err)),
            code,
            labels,
        }
    }

    /// Connection error with a message and no driver source.
    pub fn connection_msg(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
            code: None,
            labels: Vec::new(),
        }
    }

    /// Returns true if reopening the feed is expected to succeed.
    ///
    /// The replicator reconnects on every stream error regardless; this only
    /// drives log severity and metric labels.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { code, labels, .. } => {
                if labels.iter().any(|l| {
                    l == "ResumableChangeStreamError"
                        || l == "RetryableWriteError"
                        || l == "NetworkError"
                }) {
                    return true;
                }

                match code {
                    Some(c) => matches!(
                        c,
                        6 |     // HostUnreachable
                        7 |     // HostNotFound
                        43 |    // CursorNotFound
                        89 |    // NetworkTimeout
                        91 |    // ShutdownInProgress
                        10107 | // NotWritablePrimary
                        11600 | // InterruptedAtShutdown
                        11602 | // InterruptedDueToReplStateChange
                        13435 | // NotPrimaryNoSecondaryOk
                        13436   // NotPrimaryOrSecondary
                    ),
                    // Transport failures carry no server code.
                    None => true,
                }
            }
            Self::Conversion(_) => true,
            Self::Invalidated { .. } => false,
            Self::InvalidResumeToken { .. } => false,
            Self::Configuration(_) => false,
        }
    }

    /// Returns the error category for metrics/logging.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Conversion(_) => "conversion",
            Self::Invalidated { .. } => "invalidated",
            Self::InvalidResumeToken { .. } => "invalid_token",
            Self::Configuration(_) => "configuration",
        }
    }
}

/// Where to open a change feed.
///
/// A resume token takes precedence over `start_time`. With neither, the feed
/// starts at the current instant. `end_time` bounds the feed in either case.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumePosition {
    /// Resume after the event carrying this token.
    pub resume_token: Option<Document>,

    /// Start at this operation time when no token is present.
    pub start_time: Option<DateTime<Utc>>,

    /// Stop cleanly once events past this instant are observed.
    pub end_time: Option<DateTime<Utc>>,
}

impl ResumePosition {
    /// Start at the current instant, unbounded.
    pub fn now() -> Self {
        Self::default()
    }

    /// Resume after `token`.
    pub fn after_token(token: Document) -> Self {
        Self {
            resume_token: Some(token),
            ..Self::default()
        }
    }

    /// Start at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            start_time: Some(start),
            ..Self::default()
        }
    }

    /// Bound the feed at `end`.
    #[must_use]
    pub fn with_end(mut self, end: Option<DateTime<Utc>>) -> Self {
        self.end_time = end;
        self
    }

    /// Returns true when the feed ends on its own.
    pub fn is_bounded(&self) -> bool {
        self.end_time.is_some()
    }

    /// Returns true once `event` lies past the end bound.
    pub fn is_past_end(&self, event: &ChangeEvent) -> bool {
        self.end_time.is_some_and(|end| event.cluster_time > end)
    }
}

/// Boundary filter applied by every feed: only inserts and updates pass.
pub fn admits(event: &ChangeEvent) -> bool {
    event.is_replicable()
}

/// A live, resumable source of change events.
#[async_trait::async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Opens a new event sequence at `position`.
    ///
    /// # Errors
    ///
    /// Returns a [`StreamError`] if the feed cannot be opened.
    async fn open(&self, position: ResumePosition) -> Result<EventStream, StreamError>;

    /// Checks that the source is reachable.
    ///
    /// # Errors
    ///
    /// Returns a [`StreamError::Connection`] if the source does not answer.
    async fn ping(&self) -> Result<(), StreamError>;
}

/// Tunables for [`MongoChangeFeed`].
///
/// ```rust
/// use penne_core::stream::ChangeStreamConfig;
/// use std::time::Duration;
///
/// let config = ChangeStreamConfig::builder()
///     .batch_size(500)
///     .max_await_time(Duration::from_secs(2))
///     .build()
///     .unwrap();
/// assert!(config.full_document_on_update);
/// ```
#[derive(Debug, Clone)]
pub struct ChangeStreamConfig {
    /// Extra aggregation stages appended after the operation type filter
    pub pipeline: Vec<Document>,

    /// Look up the current document for update events
    pub full_document_on_update: bool,

    /// Batch size for fetching events
    pub batch_size: Option<u32>,

    /// How long the server waits for new events before an empty getMore returns
    pub max_await_time: Option<Duration>,
}

impl Default for ChangeStreamConfig {
    fn default() -> Self {
        Self {
            pipeline: Vec::new(),
            full_document_on_update: true,
            batch_size: None,
            max_await_time: Some(Duration::from_secs(1)),
        }
    }
}

impl ChangeStreamConfig {
    /// Creates a new builder for configuring a change stream.
    #[must_use]
    pub fn builder() -> ChangeStreamConfigBuilder {
        ChangeStreamConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Configuration`] if `batch_size` is zero or
    /// update lookup is disabled. Updates are applied as full-document
    /// upserts, so the post-image is required.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.batch_size == Some(0) {
            return Err(StreamError::Configuration(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if !self.full_document_on_update {
            return Err(StreamError::Configuration(
                "full_document_on_update is required to replicate updates".to_string(),
            ));
        }

        Ok(())
    }

    /// Aggregation pipeline sent with the watch command.
    fn watch_pipeline(&self) -> Vec<Document> {
        let mut pipeline = vec![doc! {
            "$match": { "operationType": { "$in": ["insert", "update"] } }
        }];
        pipeline.extend(self.pipeline.iter().cloned());
        pipeline
    }

    /// Converts this config and `position` to driver options.
    fn to_mongo_options(&self, position: &ResumePosition) -> Result<ChangeStreamOptions, StreamError> {
        let mut options = ChangeStreamOptions::default();

        if self.full_document_on_update {
            options.full_document = Some(FullDocumentType::UpdateLookup);
        }
        options.batch_size = self.batch_size;
        options.max_await_time = self.max_await_time;

        // Tokens are persisted as documents; the driver wants its own type.
        if let Some(token_doc) = &position.resume_token {
            let bytes = bson::to_vec(token_doc)
                .map_err(|e| StreamError::Configuration(format!("invalid resume token: {e}")))?;
            let token = bson::from_slice::<ResumeToken>(&bytes)
                .map_err(|e| StreamError::Configuration(format!("invalid resume token: {e}")))?;
            options.resume_after = Some(token);
        } else if let Some(start) = position.start_time {
            options.start_at_operation_time = Some(to_timestamp(start));
        }

        Ok(options)
    }
}

/// Builder for [`ChangeStreamConfig`].
#[derive(Debug, Default)]
pub struct ChangeStreamConfigBuilder {
    pipeline: Vec<Document>,
    batch_size: Option<u32>,
    max_await_time: Option<Duration>,
}

impl ChangeStreamConfigBuilder {
    /// Appends extra aggregation stages after the operation type filter.
    #[must_use]
    pub fn pipeline(mut self, pipeline: Vec<Document>) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Sets the batch size for fetching events.
    #[must_use]
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Sets how long an idle getMore waits on the server.
    ///
    /// Default: 1 second
    #[must_use]
    pub fn max_await_time(mut self, wait: Duration) -> Self {
        self.max_await_time = Some(wait);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Configuration` if validation fails.
    pub fn build(self) -> Result<ChangeStreamConfig, StreamError> {
        let defaults = ChangeStreamConfig::default();
        let config = ChangeStreamConfig {
            pipeline: self.pipeline,
            full_document_on_update: true,
            batch_size: self.batch_size,
            max_await_time: self.max_await_time.or(defaults.max_await_time),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Converts an instant to an oplog timestamp at second granularity.
///
/// Instants outside the representable range saturate to its bounds.
pub(crate) fn to_timestamp(at: DateTime<Utc>) -> Timestamp {
    let secs = at.timestamp().clamp(0, i64::from(u32::MAX));
    Timestamp {
        time: u32::try_from(secs).unwrap_or(u32::MAX),
        increment: 0,
    }
}

/// Change feed over a MongoDB collection change stream.
#[derive(Clone)]
pub struct MongoChangeFeed {
    client: Client,
    namespace: Namespace,
    config: ChangeStreamConfig,
}

impl MongoChangeFeed {
    /// Creates a feed over an existing client.
    pub fn new(client: Client, namespace: Namespace, config: ChangeStreamConfig) -> Self {
        Self {
            client,
            namespace,
            config,
        }
    }

    /// Creates a client from `uri` and wraps it.
    ///
    /// The driver connects lazily; use [`ChangeFeed::ping`] to verify
    /// connectivity.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI cannot be parsed or the config is invalid.
    pub async fn connect(
        uri: &str,
        namespace: Namespace,
        config: ChangeStreamConfig,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        let client = Client::with_uri_str(uri).await?;
        Ok(Self::new(client, namespace, config))
    }

    /// Namespace being watched.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn collection(&self) -> Collection<Document> {
        self.client
            .database(&self.namespace.database)
            .collection(&self.namespace.collection)
    }
}

#[async_trait::async_trait]
impl ChangeFeed for MongoChangeFeed {
    async fn open(&self, position: ResumePosition) -> Result<EventStream, StreamError> {
        let options = self.config.to_mongo_options(&position)?;
        info!(
            namespace = %self.namespace,
            resume = position.resume_token.is_some(),
            start_time = ?position.start_time,
            end_time = ?position.end_time,
            "Opening change stream"
        );

        let change_stream = self
            .collection()
            .watch()
            .pipeline(self.config.watch_pipeline())
            .with_options(options)
            .await?;

        Ok(event_stream(change_stream, self.namespace.clone(), position))
    }

    async fn ping(&self) -> Result<(), StreamError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }
}

/// Adapts a driver change stream into an [`EventStream`].
///
/// The sequence stops after the first error. In bounded mode an idle getMore
/// past `end_time` ends the sequence, since every event up to that instant has
/// then been delivered.
fn event_stream(
    change_stream: ChangeStream<ChangeStreamEvent<Document>>,
    namespace: Namespace,
    position: ResumePosition,
) -> EventStream {
    futures::stream::unfold(Some(change_stream), move |state| {
        let namespace = namespace.clone();
        let position = position.clone();
        async move {
            let mut change_stream = state?;
            loop {
                let next = if position.is_bounded() {
                    change_stream.next_if_any().await
                } else {
                    change_stream.next().await.transpose()
                };

                let raw = match next {
                    Ok(Some(raw)) => raw,
                    Ok(None) if position.is_bounded() => {
                        if position.end_time.is_some_and(|end| Utc::now() > end) {
                            info!(%namespace, "Change stream reached its end time");
                            return None;
                        }
                        continue;
                    }
                    Ok(None) => return None,
                    Err(e) => return Some((Err(StreamError::from_mongo_error(e)), None)),
                };

                if matches!(raw.operation_type, MongoOpType::Invalidate) {
                    let reason = format!("collection {namespace} was dropped or renamed");
                    return Some((Err(StreamError::Invalidated { reason }), None));
                }

                let event = match ChangeEvent::try_from(raw) {
                    Ok(event) => event,
                    Err(e) => return Some((Err(StreamError::Conversion(e)), None)),
                };

                if !admits(&event) {
                    debug!(operation = %event.operation, "Dropping non-replicable event");
                    continue;
                }

                if position.is_past_end(&event) {
                    info!(%namespace, "Change stream passed its end time");
                    return None;
                }

                return Some((Ok(event), Some(change_stream)));
            }
        }
    })
    .boxed()
}

/// Scripted, in-memory change feed for tests and examples.
///
/// Holds an append-only event log. Opening resumes after a stored token (or
/// at a start time) and replays the log from there, then waits for more
/// events, exactly like a live feed. Faults can be scheduled per session.
///
/// ```rust
/// use penne_core::stream::{ChangeFeed, MockChangeFeed, ResumePosition};
///
/// # async fn example() {
/// let feed = MockChangeFeed::new();
/// feed.fail_session_after(3); // first session errors after 3 events
/// let _events = feed.open(ResumePosition::now()).await.unwrap();
/// assert_eq!(feed.open_count(), 1);
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockChangeFeed {
    state: Arc<Mutex<MockFeedState>>,
    appended: Arc<Notify>,
}

#[derive(Debug, Default)]
struct MockFeedState {
    log: Vec<ChangeEvent>,
    session_faults: VecDeque<usize>,
    open_failures: usize,
    ping_failures: usize,
    opened: Vec<ResumePosition>,
}

impl MockChangeFeed {
    /// Creates an empty feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a feed whose log already holds `events`.
    pub fn with_events(events: impl IntoIterator<Item = ChangeEvent>) -> Self {
        let feed = Self::new();
        feed.lock().log.extend(events);
        feed
    }

    fn lock(&self) -> MutexGuard<'_, MockFeedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends an event and wakes open sessions.
    pub fn push(&self, event: ChangeEvent) {
        self.lock().log.push(event);
        self.appended.notify_waiters();
    }

    /// The next opened session fails after delivering `events` events.
    ///
    /// Calls queue up, one per future session.
    pub fn fail_session_after(&self, events: usize) {
        self.lock().session_faults.push_back(events);
    }

    /// The next `count` calls to `open` fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.lock().open_failures = count;
    }

    /// The next `count` calls to `ping` fail.
    pub fn fail_next_pings(&self, count: usize) {
        self.lock().ping_failures = count;
    }

    /// Number of `open` calls so far, failed ones included.
    pub fn open_count(&self) -> usize {
        self.lock().opened.len()
    }

    /// Positions passed to `open`, in call order.
    pub fn opened_positions(&self) -> Vec<ResumePosition> {
        self.lock().opened.clone()
    }

    fn start_index(state: &MockFeedState, position: &ResumePosition) -> Result<usize, StreamError> {
        match (&position.resume_token, position.start_time) {
            (Some(token), _) => state
                .log
                .iter()
                .position(|e| &e.resume_token == token)
                .map(|i| i + 1)
                .ok_or(StreamError::InvalidResumeToken { code: 286 }),
            (None, Some(start)) => Ok(state
                .log
                .iter()
                .position(|e| e.cluster_time >= start)
                .unwrap_or(state.log.len())),
            (None, None) => Ok(state.log.len()),
        }
    }
}

struct MockCursor {
    next: usize,
    delivered: usize,
}

#[async_trait::async_trait]
impl ChangeFeed for MockChangeFeed {
    async fn open(&self, position: ResumePosition) -> Result<EventStream, StreamError> {
        let (start, fault) = {
            let mut state = self.lock();
            state.opened.push(position.clone());
            if state.open_failures > 0 {
                state.open_failures -= 1;
                return Err(StreamError::connection_msg("simulated open failure"));
            }
            let start = Self::start_index(&state, &position)?;
            (start, state.session_faults.pop_front())
        };

        let shared = Arc::clone(&self.state);
        let appended = Arc::clone(&self.appended);
        let cursor = MockCursor {
            next: start,
            delivered: 0,
        };

        let stream = futures::stream::unfold(Some(cursor), move |cursor| {
            let shared = Arc::clone(&shared);
            let appended = Arc::clone(&appended);
            let position = position.clone();
            async move {
                let mut cursor = cursor?;
                loop {
                    if fault.is_some_and(|limit| cursor.delivered >= limit) {
                        warn!(delivered = cursor.delivered, "Simulated change feed failure");
                        return Some((
                            Err(StreamError::connection_msg("simulated change feed failure")),
                            None,
                        ));
                    }

                    // Registered before reading so a concurrent push is not missed.
                    let notified = appended.notified();
                    let next = shared
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .log
                        .get(cursor.next)
                        .cloned();

                    match next {
                        Some(event) => {
                            cursor.next += 1;
                            if !admits(&event) {
                                continue;
                            }
                            if position.is_past_end(&event) {
                                return None;
                            }
                            cursor.delivered += 1;
                            return Some((Ok(event), Some(cursor)));
                        }
                        None => {
                            if position.end_time.is_some_and(|end| Utc::now() > end) {
                                return None;
                            }
                            notified.await;
                        }
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<(), StreamError> {
        let mut state = self.lock();
        if state.ping_failures > 0 {
            state.ping_failures -= 1;
            return Err(StreamError::connection_msg("simulated ping failure"));
        }
        Ok(())
    }
}
