//! Command-line interface for txn-verifier
//!
//! Produces `--count` messages transactionally, then prints the final status
//! as JSON. Ctrl-C stops dispatching new messages; in-flight produces drain
//! and the open transaction is ended before exiting.

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use txn_producer::TransactionalProducerWorker;
use txn_verifier::ProducerArgs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = ProducerArgs::parse();
    let config = args.to_config();

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after in-flight messages");
            signal.cancel();
        }
    });

    let mut worker = TransactionalProducerWorker::new(config, &args.ledger_dir)
        .context("Failed to set up transactional producer")?
        .with_shutdown(shutdown);

    info!(
        "Producing {} messages to {} ({} partitions)",
        args.count, args.topic, args.partitions
    );
    let result = worker.wait().await;

    let status = worker.get_status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    info!(
        "Valid offsets recorded in {}",
        worker.valid_offsets().path().display()
    );

    result.context("Transactional produce failed")
}
