// Copyright 2026 Prerender Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::Parser;
use prerender_runtime::cli;
use prerender_runtime::config::{Cli, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::from(Cli::parse());

    let result = cli::start::run(config).await;

    // Consistent exit codes: 0=success, 1=error
    if let Err(e) = &result {
        eprintln!("  Error: {e:#}");
        std::process::exit(1);
    }

    result
}
