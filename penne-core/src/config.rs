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

//! Replicator configuration.
//!
//! [`ReplicatorConfig`] is built once, validated, and handed to the
//! [`Replicator`](crate::pipeline::Replicator) at construction. It is never
//! mutated afterwards.
//!
//! ```rust
//! use penne_core::config::ReplicatorConfig;
//! use penne_core::event::Namespace;
//! use std::time::Duration;
//!
//! let config = ReplicatorConfig::builder()
//!     .namespace(Namespace::new("shop", "orders"))
//!     .batch_size(500)
//!     .flush_interval(Duration::from_secs(2))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.checkpoint_key(), "shop.orders");
//! ```

use crate::event::Namespace;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Default number of buffered events that triggers a flush.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default flush timer period.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Default delay between connection attempts at startup.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default delay before reopening an interrupted change feed.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default checkpoint lock time-to-live.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Default age after which an idle checkpoint is re-stamped.
pub const DEFAULT_CHECKPOINT_HEARTBEAT: Duration = Duration::from_secs(60);

/// Default health check period.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(300);

/// Default staleness threshold above which replication is unhealthy.
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(300);

/// Invalid or incomplete configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required setting was not provided
    #[error("{0} is required")]
    Missing(&'static str),

    /// A setting has an unusable value
    #[error("invalid {field}: {message}")]
    Invalid {
        /// Setting name
        field: &'static str,
        /// What is wrong with it
        message: String,
    },
}

/// Settings for one replicated collection.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Source namespace; also keys the checkpoint and lock
    pub namespace: Namespace,

    /// Buffered events that trigger a flush
    pub batch_size: usize,

    /// Flush timer period
    pub flush_interval: Duration,

    /// Delay between connection attempts while starting
    pub retry_delay: Duration,

    /// Delay before reopening an interrupted feed
    pub reconnect_delay: Duration,

    /// Start of a time-bounded run, used when no token is stored
    pub start_time: Option<DateTime<Utc>>,

    /// End of a time-bounded run
    pub end_time: Option<DateTime<Utc>>,

    /// Checkpoint lock time-to-live
    pub lock_ttl: Duration,

    /// Idle age after which the checkpoint is re-stamped
    pub checkpoint_heartbeat: Duration,

    /// Health check period; `None` disables the periodic monitor
    pub health_interval: Option<Duration>,

    /// Checkpoint age above which replication is unhealthy
    pub staleness_threshold: Duration,

    /// Lock owner identity of this process
    pub instance_id: String,
}

impl ReplicatorConfig {
    /// Creates a new builder for `ReplicatorConfig`.
    #[must_use]
    pub fn builder() -> ReplicatorConfigBuilder {
        ReplicatorConfigBuilder::default()
    }

    /// Checkpoint store key.
    pub fn checkpoint_key(&self) -> String {
        self.namespace.full_name()
    }

    /// Checkpoint lock key.
    pub fn lock_key(&self) -> String {
        format!("penne:lock:{}", self.namespace.full_name())
    }

    /// Period of checkpoint lock refreshes while streaming: half the TTL.
    pub fn lock_refresh_interval(&self) -> Duration {
        (self.lock_ttl / 2).max(Duration::from_millis(1))
    }

    /// Returns true for a time-bounded run.
    pub fn is_bounded(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Builder for [`ReplicatorConfig`].
#[derive(Debug, Default)]
pub struct ReplicatorConfigBuilder {
    namespace: Option<Namespace>,
    batch_size: Option<usize>,
    flush_interval: Option<Duration>,
    retry_delay: Option<Duration>,
    reconnect_delay: Option<Duration>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    lock_ttl: Option<Duration>,
    checkpoint_heartbeat: Option<Duration>,
    health_interval: Option<Option<Duration>>,
    staleness_threshold: Option<Duration>,
    instance_id: Option<String>,
}

impl ReplicatorConfigBuilder {
    /// Sets the source namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = Some(namespace);
        self
    }

    /// Sets the flush size threshold.
    ///
    /// Default: 100
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Sets the flush timer period.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    /// Sets the delay between startup connection attempts.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Sets the delay before reopening an interrupted feed.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    /// Sets the start of a time-bounded run.
    #[must_use]
    pub fn start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    /// Sets the end of a time-bounded run. Requires a start time.
    #[must_use]
    pub fn end_time(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    /// Sets the checkpoint lock time-to-live.
    ///
    /// Default: 30 seconds
    #[must_use]
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = Some(ttl);
        self
    }

    /// Sets the idle checkpoint heartbeat.
    ///
    /// Default: 60 seconds
    #[must_use]
    pub fn checkpoint_heartbeat(mut self, age: Duration) -> Self {
        self.checkpoint_heartbeat = Some(age);
        self
    }

    /// Sets the periodic health check period.
    ///
    /// Default: 5 minutes
    #[must_use]
    pub fn health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = Some(Some(interval));
        self
    }

    /// Disables the periodic health monitor.
    #[must_use]
    pub fn without_health_monitor(mut self) -> Self {
        self.health_interval = Some(None);
        self
    }

    /// Sets the staleness threshold.
    ///
    /// Default: 5 minutes
    #[must_use]
    pub fn staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = Some(threshold);
        self
    }

    /// Sets the lock owner identity. Defaults to a random id.
    #[must_use]
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the namespace is missing, a size or
    /// duration is zero, the end time has no start time or precedes it, or
    /// the lock would expire between two refreshes.
    pub fn build(self) -> Result<ReplicatorConfig, ConfigError> {
        let namespace = self.namespace.ok_or(ConfigError::Missing("namespace"))?;
        if namespace.database.is_empty() || namespace.collection.is_empty() {
            return Err(ConfigError::Invalid {
                field: "namespace",
                message: "database and collection must be non-empty".into(),
            });
        }

        let config = ReplicatorConfig {
            namespace,
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            flush_interval: self.flush_interval.unwrap_or(DEFAULT_FLUSH_INTERVAL),
            retry_delay: self.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY),
            reconnect_delay: self.reconnect_delay.unwrap_or(DEFAULT_RECONNECT_DELAY),
            start_time: self.start_time,
            end_time: self.end_time,
            lock_ttl: self.lock_ttl.unwrap_or(DEFAULT_LOCK_TTL),
            checkpoint_heartbeat: self
                .checkpoint_heartbeat
                .unwrap_or(DEFAULT_CHECKPOINT_HEARTBEAT),
            health_interval: self.health_interval.unwrap_or(Some(DEFAULT_HEALTH_INTERVAL)),
            staleness_threshold: self
                .staleness_threshold
                .unwrap_or(DEFAULT_STALENESS_THRESHOLD),
            instance_id: self
                .instance_id
                .unwrap_or_else(|| format!("penne-{}", uuid::Uuid::new_v4())),
        };

        validate(&config)?;
        Ok(config)
    }
}

fn validate(config: &ReplicatorConfig) -> Result<(), ConfigError> {
    if config.batch_size == 0 {
        return Err(ConfigError::Invalid {
            field: "batch_size",
            message: "must be greater than 0".into(),
        });
    }

    for (field, value) in [
        ("flush_interval", config.flush_interval),
        ("retry_delay", config.retry_delay),
        ("reconnect_delay", config.reconnect_delay),
        ("lock_ttl", config.lock_ttl),
    ] {
        if value.is_zero() {
            return Err(ConfigError::Invalid {
                field,
                message: "must be greater than zero".into(),
            });
        }
    }

    if config.health_interval.is_some_and(|d| d.is_zero()) {
        return Err(ConfigError::Invalid {
            field: "health_interval",
            message: "must be greater than zero".into(),
        });
    }

    match (config.start_time, config.end_time) {
        (None, Some(_)) => Err(ConfigError::Invalid {
            field: "end_time",
            message: "requires start_time".into(),
        }),
        (Some(start), Some(end)) if end <= start => Err(ConfigError::Invalid {
            field: "end_time",
            message: format!("must be after start_time ({start})"),
        }),
        _ => Ok(()),
    }
}
