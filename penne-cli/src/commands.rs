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

//! Run modes.

use crate::cli::{Cli, Mode, TimeWindow};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use penne_core::alert::AlertSink;
use penne_core::config::ReplicatorConfig;
use penne_core::event::Namespace;
use penne_core::health::HealthMonitor;
use penne_core::pipeline::Replicator;
use penne_core::reconcile::{parse_document_id, Reconciler};
use penne_core::source::MongoSourceReader;
use penne_core::stream::{ChangeStreamConfig, MongoChangeFeed};
use penne_destinations::mongodb::{MongoTarget, MongoTargetConfig};
use penne_stores::file::FileStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Success.
pub const EXIT_OK: u8 = 0;

/// Unhealthy replication, or differences found by a comparison.
pub const EXIT_FINDINGS: u8 = 1;

/// The command could not run.
pub const EXIT_ERROR: u8 = 2;

/// Runs the mode selected on the command line and returns the exit code.
pub async fn run(cli: &Cli) -> Result<u8> {
    match cli.mode() {
        Mode::Replicate {
            start_time,
            end_time,
        } => replicate(cli, start_time, end_time).await,
        Mode::CompareId(raw) => compare_id(cli, &raw).await,
        Mode::CompareWindow(window) => compare_window(cli, window).await,
        Mode::HealthCheck => health_check(cli).await,
    }
}

fn source_namespace(cli: &Cli) -> Namespace {
    Namespace::new(&cli.source_db, &cli.source_collection)
}

fn replicator_config(
    cli: &Cli,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
) -> Result<ReplicatorConfig> {
    let mut builder = ReplicatorConfig::builder()
        .namespace(source_namespace(cli))
        .batch_size(cli.batch_size)
        .flush_interval(Duration::from_millis(cli.flush_interval_ms))
        .retry_delay(Duration::from_secs(cli.retry_delay_secs))
        .reconnect_delay(Duration::from_secs(cli.reconnect_delay_secs))
        .lock_ttl(Duration::from_secs(cli.lock_ttl_secs));

    if let Some(start) = start_time {
        builder = builder.start_time(start);
    }
    if let Some(end) = end_time {
        builder = builder.end_time(end);
    }
    if let Some(id) = &cli.instance_id {
        builder = builder.instance_id(id);
    }

    builder.build().context("invalid replicator configuration")
}

async fn connect_feed(cli: &Cli) -> Result<MongoChangeFeed> {
    MongoChangeFeed::connect(
        &cli.source_uri,
        source_namespace(cli),
        ChangeStreamConfig::default(),
    )
    .await
    .context("failed to create source change stream client")
}

async fn connect_target(cli: &Cli) -> Result<MongoTarget> {
    let config = MongoTargetConfig::builder()
        .uri(&cli.target_uri)
        .database(cli.target_db())
        .collection(cli.target_collection())
        .max_concurrency(cli.max_concurrency)
        .build()
        .map_err(anyhow::Error::msg)
        .context("invalid target configuration")?;

    MongoTarget::connect(config)
        .await
        .context("failed to create target client")
}

async fn open_store(cli: &Cli) -> Result<FileStore> {
    FileStore::new(&cli.checkpoint_dir).await.with_context(|| {
        format!(
            "failed to open checkpoint directory {}",
            cli.checkpoint_dir.display()
        )
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn replicate(
    cli: &Cli,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
) -> Result<u8> {
    let config = replicator_config(cli, start_time, end_time)?;
    let feed = connect_feed(cli).await?;
    let target = connect_target(cli).await?;
    let store = open_store(cli).await?;

    let mut replicator = Replicator::new(
        config,
        Arc::new(feed),
        Arc::new(target),
        Arc::new(store),
        AlertSink::log_only(),
    );
    replicator.start().await?;

    tokio::select! {
        () = shutdown_signal() => info!("Shutdown signal received, draining"),
        () = replicator.stopped() => info!("Replication window complete"),
    }

    let stats = replicator.stop().await?;
    info!(
        events_received = stats.events_received,
        batches_applied = stats.batches_applied,
        inserts = stats.inserts,
        updates = stats.updates,
        failed_batches = stats.failed_batches,
        checkpoint_failures = stats.checkpoint_failures,
        "Replication finished"
    );
    Ok(EXIT_OK)
}

async fn compare_id(cli: &Cli, raw: &str) -> Result<u8> {
    let source = MongoSourceReader::connect(&cli.source_uri, source_namespace(cli))
        .await
        .context("failed to create source client")?;
    let target = connect_target(cli).await?;
    let reconciler = Reconciler::new(Arc::new(source), Arc::new(target));

    let comparison = reconciler
        .compare_document(&parse_document_id(raw))
        .await
        .with_context(|| format!("failed to compare document {raw}"))?;
    print_json(&comparison)?;

    Ok(if comparison.has_differences() {
        EXIT_FINDINGS
    } else {
        EXIT_OK
    })
}

async fn compare_window(cli: &Cli, window: TimeWindow) -> Result<u8> {
    let source = MongoSourceReader::connect(&cli.source_uri, source_namespace(cli))
        .await
        .context("failed to create source client")?;
    let target = connect_target(cli).await?;
    let reconciler = Reconciler::new(Arc::new(source), Arc::new(target));

    let report = reconciler
        .compare_window(window.start, window.end, cli.compare_limit)
        .await
        .context("failed to compare window")?;
    print_json(&report)?;

    Ok(if report.documents_with_differences > 0 {
        EXIT_FINDINGS
    } else {
        EXIT_OK
    })
}

async fn health_check(cli: &Cli) -> Result<u8> {
    let config = replicator_config(cli, None, None)?;
    let monitor = HealthMonitor::new(
        Arc::new(connect_feed(cli).await?),
        Arc::new(connect_target(cli).await?),
        Arc::new(open_store(cli).await?),
        config.checkpoint_key(),
        config.staleness_threshold,
    );

    let report = monitor.check().await;
    print_json(&report)?;

    Ok(if report.healthy { EXIT_OK } else { EXIT_FINDINGS })
}

/// Completes on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
