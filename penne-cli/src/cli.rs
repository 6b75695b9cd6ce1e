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

//! Command-line interface.
//!
//! Without a mode flag the replicator runs continuously. The mode flags are
//! mutually exclusive:
//!
//! - `--start-time [--end-time]` replicates from (and up to) fixed instants
//! - `--compare-id` diffs one document between source and target
//! - `--compare-window` diffs the documents modified in a time window
//! - `--health-check` prints one health report

use crate::logging::LogFormat;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{ArgGroup, Parser};
use penne_core::config::{
    DEFAULT_BATCH_SIZE, DEFAULT_LOCK_TTL, DEFAULT_RECONNECT_DELAY, DEFAULT_RETRY_DELAY,
};
use penne_core::reconcile::DEFAULT_WINDOW_LIMIT;
use penne_destinations::mongodb::DEFAULT_MAX_CONCURRENCY;
use std::path::PathBuf;

/// Replicates inserts and updates from a MongoDB change stream into another
/// collection.
#[derive(Parser, Debug)]
#[command(name = "penne")]
#[command(version, about, long_about = None)]
#[command(group(
    ArgGroup::new("mode")
        .args(["start_time", "compare_id", "compare_window", "health_check"])
        .multiple(false)
))]
pub struct Cli {
    /// Source connection string (must be a replica set)
    #[arg(long, env = "PENNE_SOURCE_URI")]
    pub source_uri: String,

    /// Source database
    #[arg(long, env = "PENNE_SOURCE_DB")]
    pub source_db: String,

    /// Source collection
    #[arg(long, env = "PENNE_SOURCE_COLLECTION")]
    pub source_collection: String,

    /// Target connection string
    #[arg(long, env = "PENNE_TARGET_URI")]
    pub target_uri: String,

    /// Target database [default: source database]
    #[arg(long, env = "PENNE_TARGET_DB")]
    pub target_db: Option<String>,

    /// Target collection [default: source collection]
    #[arg(long, env = "PENNE_TARGET_COLLECTION")]
    pub target_collection: Option<String>,

    /// Directory holding checkpoint and lock files
    #[arg(long, env = "PENNE_CHECKPOINT_DIR", default_value = ".penne")]
    pub checkpoint_dir: PathBuf,

    /// Replicate from this instant (ISO-8601) when no checkpoint token exists
    #[arg(long, value_parser = parse_instant)]
    pub start_time: Option<DateTime<Utc>>,

    /// Stop after this instant (ISO-8601)
    #[arg(long, requires = "start_time", value_parser = parse_instant)]
    pub end_time: Option<DateTime<Utc>>,

    /// Compare one document by `_id` (ObjectId hex, integer or string)
    #[arg(long, value_name = "ID")]
    pub compare_id: Option<String>,

    /// Compare documents modified between two ISO-8601 instants
    #[arg(long, value_name = "START,END", value_parser = parse_window)]
    pub compare_window: Option<TimeWindow>,

    /// Maximum number of documents compared by --compare-window
    #[arg(long, default_value_t = DEFAULT_WINDOW_LIMIT)]
    pub compare_limit: usize,

    /// Print a health report and exit
    #[arg(long)]
    pub health_check: bool,

    /// Buffered events that trigger a flush
    #[arg(long, env = "PENNE_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Flush timer period in milliseconds
    #[arg(long, env = "PENNE_FLUSH_INTERVAL_MS", default_value_t = 5000)]
    pub flush_interval_ms: u64,

    /// Delay between startup connection attempts in seconds
    #[arg(long, env = "PENNE_RETRY_DELAY_SECS", default_value_t = DEFAULT_RETRY_DELAY.as_secs())]
    pub retry_delay_secs: u64,

    /// Delay before reopening an interrupted change stream in seconds
    #[arg(long, env = "PENNE_RECONNECT_DELAY_SECS", default_value_t = DEFAULT_RECONNECT_DELAY.as_secs())]
    pub reconnect_delay_secs: u64,

    /// Checkpoint lock time-to-live in seconds; refreshed at half this period
    #[arg(long, env = "PENNE_LOCK_TTL_SECS", default_value_t = DEFAULT_LOCK_TTL.as_secs())]
    pub lock_ttl_secs: u64,

    /// Concurrent writes per batch on the target
    #[arg(long, env = "PENNE_MAX_CONCURRENCY", default_value_t = DEFAULT_MAX_CONCURRENCY)]
    pub max_concurrency: usize,

    /// Owner id for the checkpoint lock [default: random]
    #[arg(long, env = "PENNE_INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Log output format
    #[arg(long, env = "PENNE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "PENNE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Closed time interval given to `--compare-window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Inclusive end
    pub end: DateTime<Utc>,
}

/// What the binary was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Continuous replication, or bounded when `end_time` is set
    Replicate {
        /// Override for the initial position
        start_time: Option<DateTime<Utc>>,
        /// End of a time-bounded run
        end_time: Option<DateTime<Utc>>,
    },
    /// Diff one document
    CompareId(String),
    /// Diff a window of modified documents
    CompareWindow(TimeWindow),
    /// One-shot health report
    HealthCheck,
}

impl Cli {
    /// Resolves the run mode from the parsed flags.
    pub fn mode(&self) -> Mode {
        if self.health_check {
            Mode::HealthCheck
        } else if let Some(id) = &self.compare_id {
            Mode::CompareId(id.clone())
        } else if let Some(window) = self.compare_window {
            Mode::CompareWindow(window)
        } else {
            Mode::Replicate {
                start_time: self.start_time,
                end_time: self.end_time,
            }
        }
    }

    /// Target database, defaulting to the source's.
    pub fn target_db(&self) -> &str {
        self.target_db.as_deref().unwrap_or(&self.source_db)
    }

    /// Target collection, defaulting to the source's.
    pub fn target_collection(&self) -> &str {
        self.target_collection
            .as_deref()
            .unwrap_or(&self.source_collection)
    }
}

/// Parses an ISO-8601 instant.
///
/// Accepts RFC 3339 with an offset, a date-time without offset (read as UTC),
/// or a bare date (midnight UTC).
pub fn parse_instant(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();

    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    if let Some(naive) = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(naive.and_utc());
    }

    Err(format!("'{raw}' is not an ISO-8601 instant"))
}

/// Parses `START,END` into a window with `START <= END`.
pub fn parse_window(raw: &str) -> Result<TimeWindow, String> {
    let (start, end) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected START,END but got '{raw}'"))?;
    let window = TimeWindow {
        start: parse_instant(start)?,
        end: parse_instant(end)?,
    };
    if window.start > window.end {
        return Err(format!(
            "window start {} is after its end {}",
            window.start, window.end
        ));
    }
    Ok(window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use clap::error::ErrorKind;
    use clap::CommandFactory;

    const BASE: [&str; 9] = [
        "penne",
        "--source-uri",
        "mongodb://source:27017",
        "--source-db",
        "shop",
        "--source-collection",
        "orders",
        "--target-uri",
        "mongodb://target:27017",
    ];

    fn parse(extra: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(BASE.iter().chain(extra.iter()))
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_mode_is_continuous_replication() {
        let cli = parse(&[]).unwrap();
        assert_eq!(
            cli.mode(),
            Mode::Replicate {
                start_time: None,
                end_time: None
            }
        );
        assert_eq!(cli.target_db(), "shop");
        assert_eq!(cli.target_collection(), "orders");
        assert_eq!(cli.compare_limit, 100);
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn test_lock_ttl_flag() {
        assert_eq!(parse(&[]).unwrap().lock_ttl_secs, 30);
        let cli = parse(&["--lock-ttl-secs", "90"]).unwrap();
        assert_eq!(cli.lock_ttl_secs, 90);
    }

    #[test]
    fn test_target_names_can_be_overridden() {
        let cli = parse(&["--target-db", "replica", "--target-collection", "orders_copy"]).unwrap();
        assert_eq!(cli.target_db(), "replica");
        assert_eq!(cli.target_collection(), "orders_copy");
    }

    #[test]
    fn test_time_bounded_mode() {
        let cli = parse(&[
            "--start-time",
            "2026-03-01T00:00:00Z",
            "--end-time",
            "2026-03-01T01:00:00Z",
        ])
        .unwrap();

        assert_eq!(
            cli.mode(),
            Mode::Replicate {
                start_time: Some(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()),
                end_time: Some(Utc.with_ymd_and_hms(2026, 3, 1, 1, 0, 0).unwrap()),
            }
        );
    }

    #[test]
    fn test_end_time_requires_start_time() {
        let err = parse(&["--end-time", "2026-03-01T01:00:00Z"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_modes_are_mutually_exclusive() {
        let err = parse(&["--health-check", "--compare-id", "42"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);

        let err = parse(&["--start-time", "2026-03-01", "--compare-id", "42"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_compare_modes() {
        let cli = parse(&["--compare-id", "507f1f77bcf86cd799439011"]).unwrap();
        assert_eq!(
            cli.mode(),
            Mode::CompareId("507f1f77bcf86cd799439011".to_string())
        );

        let cli = parse(&[
            "--compare-window",
            "2026-03-01T00:00:00Z,2026-03-02T00:00:00Z",
            "--compare-limit",
            "10",
        ])
        .unwrap();
        let Mode::CompareWindow(window) = cli.mode() else {
            panic!("expected compare-window mode");
        };
        assert_eq!(window.start, Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap());
        assert_eq!(cli.compare_limit, 10);
    }

    #[test]
    fn test_health_check_mode() {
        let cli = parse(&["--health-check", "--log-format", "json"]).unwrap();
        assert_eq!(cli.mode(), Mode::HealthCheck);
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_time_is_rejected() {
        let err = parse(&["--start-time", "yesterday"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn test_parse_instant_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(parse_instant("2026-03-01T10:00:00Z"), Ok(expected));
        assert_eq!(parse_instant("2026-03-01T12:00:00+02:00"), Ok(expected));
        assert_eq!(parse_instant("2026-03-01T10:00:00"), Ok(expected));
        assert_eq!(
            parse_instant("2026-03-01"),
            Ok(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap())
        );
        assert!(parse_instant("03/01/2026").is_err());
    }

    #[test]
    fn test_parse_window_rejects_bad_input() {
        assert!(parse_window("2026-03-01").unwrap_err().contains("START,END"));
        assert!(parse_window("2026-03-02,2026-03-01")
            .unwrap_err()
            .contains("after"));
        assert!(parse_window("2026-03-01, 2026-03-01").is_ok());
    }
}
