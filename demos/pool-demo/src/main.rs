//! Runs a small pool against the echo backend.
//!
//! Run with: cargo run -p pool-demo -- [path/to/pool.toml] [jobs]

use std::{path::PathBuf, time::Duration};

use anyhow::Context as _;
use slotpool_adapters::EchoAdapter;
use slotpool_core::{JobRequest, PoolConfig};
use slotpool_dispatch::Dispatcher;
use slotpool_transport::{ServerMessage, SubmitRequest};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG: &str = "demos/pool-demo/pool.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let path = args.next().map_or_else(|| PathBuf::from(DEFAULT_CONFIG), PathBuf::from);
    let jobs: usize = match args.next() {
        Some(n) => n.parse().context("job count must be a number")?,
        None => 6,
    };

    let config = PoolConfig::load(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    tracing::info!(
        config = %path.display(),
        accounts = config.accounts.len(),
        slots = config.slot_count(),
        "Starting pool"
    );

    let dispatcher = Dispatcher::start(config, EchoAdapter::new(Duration::from_millis(400)))?;

    let mut handles = Vec::with_capacity(jobs);
    for n in 0..jobs {
        let submit = SubmitRequest::new(Some(&format!("demo prompt #{n}")), &[]);
        let request = JobRequest::try_from(submit)?;
        match dispatcher.enqueue(request) {
            Ok(handle) => {
                println!("{}", serde_json::to_string(&ServerMessage::Accepted { job_id: handle.id() })?);
                handles.push(handle);
            }
            Err(e) => println!("{}", serde_json::to_string(&ServerMessage::error(&e))?),
        }
    }

    for handle in handles {
        let result = handle.wait().await?;
        println!(
            "{}",
            serde_json::to_string(&ServerMessage::result(handle.id(), &result))?
        );
    }

    let stats = dispatcher.stats();
    tracing::info!(
        slots = stats.slots,
        healthy = stats.healthy_slots,
        bridges = dispatcher.bridges().open_count(),
        "All jobs finished"
    );

    dispatcher.shutdown().await;
    Ok(())
}
