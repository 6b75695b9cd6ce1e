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

//! `penne` - replicate a MongoDB collection into another store.

mod cli;
mod commands;
mod logging;

use clap::Parser;
use cli::Cli;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.log_format, &cli.log_level) {
        eprintln!("Error: {e:#}");
        return ExitCode::from(commands::EXIT_ERROR);
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting penne");

    match commands::run(&cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::from(commands::EXIT_ERROR)
        }
    }
}
