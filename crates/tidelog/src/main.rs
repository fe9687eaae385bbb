// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! Tidelog: a partitioned, generation-aware transaction log server.

use std::fs::File;
use std::io::BufReader;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tidelog_backup::LogFileDecoder;
use tidelog_core::config::Config;
use tidelog_server::net::NetServer;
use tidelog_server::{ClusterInfo, ServerData, ServerHandle};

mod cli;

use cli::{Cli, Commands, DecodeArgs, ServeArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => run_server(args).await,
        Commands::Decode(args) => decode_file(&args),
        Commands::Version => {
            println!("tidelog {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_server(args: ServeArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(bind) = &args.bind {
        config.server.bind = bind.parse().context("parsing --bind address")?;
    }
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = data_dir;
    }

    init_logging(&config)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.server.bind,
        data_dir = %config.storage.data_dir.display(),
        "starting tidelog"
    );

    // The cluster feed is wired up by the recovery orchestrator; standalone
    // servers never observe a displacement.
    let (_cluster_tx, cluster_rx) = watch::channel(ClusterInfo::default());
    let bind = config.server.bind;
    let server = ServerData::new(config, cluster_rx);
    let handle = ServerHandle::spawn(server);
    let net = NetServer::new(handle);

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(addr = %bind, "tlog endpoints listening");

    tokio::select! {
        result = net.serve(listener) => {
            result.context("serving tlog endpoints")?;
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    Ok(())
}

fn decode_file(args: &DecodeArgs) -> Result<()> {
    let file = File::open(&args.input)
        .with_context(|| format!("opening {}", args.input.display()))?;
    let mut decoder = LogFileDecoder::new(BufReader::new(file), args.block_size);
    while let Some(batch) = decoder.next_batch().context("decoding log file")? {
        for mutation in &batch.mutations {
            println!(
                "{} kind={} param1={} param2={}",
                batch.version,
                mutation.kind,
                String::from_utf8_lossy(&mutation.param1),
                String::from_utf8_lossy(&mutation.param2),
            );
        }
    }
    Ok(())
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();
    Ok(())
}
