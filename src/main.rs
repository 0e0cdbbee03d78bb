// Copyright (c) GridEx, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

use gridex_indexer::config::Config;
use gridex_indexer::db::Db;
use gridex_indexer::kafka::{ensure_topic, KafkaProducer};
use gridex_indexer::rpc::{EthRpcClient, RateLimitedClient};
use gridex_indexer::scanner::Scanner;

/// Default partition layout for the auto-created events topic.
const TOPIC_PARTITIONS: i32 = 3;
const TOPIC_REPLICATION: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "gridex-indexer", about = "GridEx protocol event indexer")]
struct Args {
    /// Path to the YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = Config::from_file(&args.config)?;

    init_logging(&cfg.log.level);

    info!(
        chains = cfg.chains.len(),
        log_level = %cfg.log.level,
        "starting gridex indexer"
    );

    // Cancellation is cooperative: the signal handler cancels the root
    // token and every scanner drains out of its loop.
    let cancel = CancellationToken::new();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            info!("received shutdown signal");
            cancel.cancel();
        });
    }

    let database_url = cfg.database.url();
    Db::run_migrations(&database_url).await?;
    let db = Db::connect_pool(&database_url).await?;

    // Create and verify the topic before producing anything.
    info!(topic = %cfg.kafka.topic, brokers = ?cfg.kafka.brokers, "ensuring kafka topic exists");
    ensure_topic(
        &cfg.kafka.brokers,
        &cfg.kafka.topic,
        TOPIC_PARTITIONS,
        TOPIC_REPLICATION,
    )
    .await
    .context("failed to ensure kafka topic")?;
    info!(topic = %cfg.kafka.topic, "kafka topic verified");

    let producer = Arc::new(
        KafkaProducer::new(&cfg.kafka.brokers, &cfg.kafka.topic)
            .context("failed to create kafka producer")?,
    );

    let mut handles = Vec::with_capacity(cfg.chains.len());
    for chain_cfg in cfg.chains.clone() {
        let client = EthRpcClient::new(&chain_cfg.rpc_url)
            .with_context(|| format!("failed to connect to RPC for chain {}", chain_cfg.name))?;

        if chain_cfg.rpc_tpm > 0 {
            info!(
                chain = %chain_cfg.name,
                rpc_tpm = chain_cfg.rpc_tpm,
                "RPC rate limiting enabled"
            );
        }
        let client = Arc::new(RateLimitedClient::new(
            client,
            chain_cfg.rpc_tpm,
            cancel.clone(),
        ));

        let span = tracing::info_span!(
            "scanner",
            chain = %chain_cfg.name,
            chain_id = chain_cfg.chain_id
        );
        let scanner = Scanner::new(
            chain_cfg.clone(),
            client,
            db.clone(),
            producer.clone(),
            cancel.clone(),
        )
        .with_context(|| format!("failed to create scanner for chain {}", chain_cfg.name))?;

        info!(chain = %chain_cfg.name, chain_id = chain_cfg.chain_id, "scanner started");
        handles.push(tokio::spawn(
            async move {
                if let Err(e) = scanner.run().await {
                    error!(error = %e, "scanner exited with error");
                }
            }
            .instrument(span),
        ));
    }

    for handle in handles {
        let _ = handle.await;
    }

    info!("gridex indexer stopped");
    Ok(())
}

fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .init();
}
