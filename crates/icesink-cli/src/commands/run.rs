//! Run command implementation.
//!
//! Reads row events as JSON lines and pushes them through the configured sink
//! in batches until end of input or a shutdown signal.

use anyhow::{Context, Result};
use icesink_core::{open_sink, Config, RowEvent, Sink};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Run the sink over an event stream.
pub async fn run(config: Config, input: Option<PathBuf>, batch_size: usize) -> Result<()> {
    info!(
        prefix = %config.destination.prefix,
        worker = config.worker.index,
        transfer_id = %config.worker.transfer_id,
        "Starting sink"
    );

    let sink = open_sink(&config).await?;

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("open input {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let outcome = tokio::select! {
        result = pump(Arc::clone(&sink), reader, batch_size.max(1)) => result,
        _ = shutdown_signal() => {
            info!("Shutdown requested, closing sink");
            Ok(0)
        }
    };

    sink.close().await?;

    let events = outcome?;
    info!(events, "Sink stopped");
    Ok(())
}

/// Push every line of `reader` in batches; returns the number of events read.
async fn pump(
    sink: Arc<dyn Sink>,
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
    batch_size: usize,
) -> Result<u64> {
    let mut lines = reader.lines();
    let mut batch = Vec::with_capacity(batch_size);
    let mut line_no: u64 = 0;
    let mut events: u64 = 0;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let event: RowEvent = serde_json::from_str(&line)
            .with_context(|| format!("invalid event on line {}", line_no))?;
        batch.push(event);
        events += 1;

        if batch.len() >= batch_size {
            sink.push(std::mem::take(&mut batch)).await?;
        }
    }

    if !batch.is_empty() {
        sink.push(batch).await?;
    }
    Ok(events)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }
}
