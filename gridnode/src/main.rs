/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gridnode::Activator;
use gridnode::Node;
use gridnode::NodeConfig;
use gridnode::activator::NativeLauncher;

#[derive(Parser)]
#[command(about = "Run a grid node")]
struct Cli {
    /// YAML configuration file. `GRIDNODE_*` variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,
}

/// Runs the node standalone. No registry transport is linked in, so no
/// `NodeSessionManager` is created and servers are only deployed through
/// the library API.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Cli::parse();
    gridnode_telemetry::initialize_logging();

    let config = NodeConfig::load(args.config.as_deref())?;
    if args.print_config {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let activator = Activator::new(Arc::new(NativeLauncher::new()));
    let node = Node::new(config, activator)?;
    tracing::info!(
        node = node.name(),
        data_dir = %node.config().data_dir.display(),
        "grid node started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    node.shutdown().await;
    Ok(())
}
